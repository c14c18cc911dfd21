//! The value every cache operation produces: status, etag, and body.

use std::fmt;

use axum::{
    body::Body,
    http::{
        HeaderValue, StatusCode,
        header::{CONTENT_TYPE, ETAG},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::Value;

use super::error::ErrorReport;
use super::repos::ByteStream;

pub const OCTET_STREAM: &str = "application/octet-stream";
const JSON: &str = "application/json";

pub enum ReplyBody {
    Empty,
    Json(Value),
    Bytes(Bytes),
    Stream(ByteStream),
}

pub struct Reply {
    pub status: StatusCode,
    pub etag: Option<String>,
    pub content_type: Option<HeaderValue>,
    pub body: ReplyBody,
}

impl Reply {
    pub fn json(status: StatusCode, value: Value) -> Self {
        Self {
            status,
            etag: None,
            content_type: None,
            body: ReplyBody::Json(value),
        }
    }

    pub fn bytes(status: StatusCode, data: Bytes) -> Self {
        Self {
            status,
            etag: None,
            content_type: None,
            body: ReplyBody::Bytes(data),
        }
    }

    pub fn stream(status: StatusCode, stream: ByteStream) -> Self {
        Self {
            status,
            etag: None,
            content_type: None,
            body: ReplyBody::Stream(stream),
        }
    }

    /// 304 carrying the matched etag and no body.
    pub fn not_modified(etag: Option<String>) -> Self {
        Self {
            status: StatusCode::NOT_MODIFIED,
            etag,
            content_type: None,
            body: ReplyBody::Empty,
        }
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_content_type(mut self, content_type: Option<HeaderValue>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn octet_stream(self) -> Self {
        self.with_content_type(Some(HeaderValue::from_static(OCTET_STREAM)))
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            ReplyBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.body, ReplyBody::Empty)
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            ReplyBody::Empty => "empty",
            ReplyBody::Json(_) => "json",
            ReplyBody::Bytes(_) => "bytes",
            ReplyBody::Stream(_) => "stream",
        };
        f.debug_struct("Reply")
            .field("status", &self.status)
            .field("etag", &self.etag)
            .field("body", &body)
            .finish()
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let (body, default_type) = match self.body {
            ReplyBody::Empty => (Body::empty(), None),
            ReplyBody::Json(value) => match serde_json::to_vec(&value) {
                Ok(encoded) => (Body::from(encoded), Some(JSON)),
                Err(err) => {
                    let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
                    ErrorReport::from_error(
                        "application::reply::Reply",
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &err,
                    )
                    .attach(&mut response);
                    return response;
                }
            },
            ReplyBody::Bytes(data) => (Body::from(data), None),
            ReplyBody::Stream(stream) => (Body::from_stream(stream), None),
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        if let Some(etag) = self
            .etag
            .as_deref()
            .and_then(|etag| HeaderValue::from_str(etag).ok())
        {
            headers.insert(ETAG, etag);
        }
        match (self.content_type, default_type) {
            (Some(content_type), _) => {
                headers.insert(CONTENT_TYPE, content_type);
            }
            (None, Some(default_type)) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(default_type));
            }
            (None, None) => {}
        }

        response
    }
}
