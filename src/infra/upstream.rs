//! `reqwest`-backed upstream registry client.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::Client;
use url::Url;

use crate::application::upstream::{Upstream, UpstreamError, UpstreamRequest, UpstreamResponse};

use super::error::InfraError;

const USER_AGENT: &str = concat!("regcache/", env!("CARGO_PKG_VERSION"));
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub struct ReqwestUpstream {
    client: Client,
    base: String,
}

impl ReqwestUpstream {
    /// `base` is `scheme://host[:port]`; request paths are appended to it.
    pub fn new(base: &str, timeout: Duration, connect_timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .map_err(|err| InfraError::http_client(format!("failed to build client: {err}")))?;
        Self::with_client(client, base)
    }

    pub fn with_client(client: Client, base: &str) -> Result<Self, InfraError> {
        let parsed = Url::parse(base)
            .map_err(|err| InfraError::configuration(format!("invalid upstream `{base}`: {err}")))?;
        if parsed.cannot_be_a_base() {
            return Err(InfraError::configuration(format!(
                "upstream `{base}` cannot be used as a base URL"
            )));
        }
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn url_for(&self, path: &str) -> Result<Url, UpstreamError> {
        let joined = if path.starts_with('/') {
            format!("{}{path}", self.base)
        } else {
            format!("{}/{path}", self.base)
        };
        Url::parse(&joined)
            .map_err(|err| UpstreamError::Transport(format!("invalid upstream url `{joined}`: {err}")))
    }
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let url = self.url_for(&request.path)?;
        let mut builder = self
            .client
            .request(request.method, url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map_err(|err| UpstreamError::Body(err.to_string()));

        Ok(UpstreamResponse::new(status, headers, Box::pin(body)))
    }
}
