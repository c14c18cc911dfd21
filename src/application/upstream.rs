//! The upstream registry as seen by the cache components.

use std::{fmt, pin::Pin};

use async_trait::async_trait;
use axum::http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    header::{ETAG, IF_NONE_MATCH},
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, stream};
use thiserror::Error;

/// Upstream body chunks. Nothing is read until the consumer polls.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream responded with status {0}")]
    Status(StatusCode),
    #[error("failed to read upstream body: {0}")]
    Body(String),
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path and query, starting with `/`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl UpstreamRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Forward the client's conditional token, if it is a valid header value.
    pub fn with_if_none_match(self, etag: Option<&str>) -> Self {
        match etag.and_then(|value| HeaderValue::from_str(value).ok()) {
            Some(value) => self.with_header(IF_NONE_MATCH, value),
            None => self,
        }
    }

    /// Copy the named headers from an inbound request when present.
    pub fn with_forwarded(mut self, inbound: &HeaderMap, names: &[HeaderName]) -> Self {
        for name in names {
            if let Some(value) = inbound.get(name) {
                self.headers.insert(name.clone(), value.clone());
            }
        }
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

pub struct UpstreamResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: BodyStream,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// A response whose body is already in memory.
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self::new(status, headers, Box::pin(stream::once(async move { Ok(body) })))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn etag(&self) -> Option<String> {
        self.headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    /// Buffer the whole body.
    pub async fn bytes(self) -> Result<Bytes, UpstreamError> {
        let mut body = self.body;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    pub fn into_body(self) -> BodyStream {
        self.body
    }
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Perform one request. Any HTTP status counts as success here.
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;

    /// Perform one request for the cache path: a 5xx status is a failed
    /// fetch, same as a transport error.
    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let response = self.send(request).await?;
        if response.status().is_server_error() {
            return Err(UpstreamError::Status(response.status()));
        }
        Ok(response)
    }
}
