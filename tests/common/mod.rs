#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header::ETAG};
use bytes::Bytes;
use futures::TryStreamExt;
use serde_json::Value;
use tempfile::TempDir;

use regcache::{
    application::{
        proxy::RegistryProxy,
        reply::{Reply, ReplyBody},
        repos::{BlobStore, KeyValueStore},
        upstream::{Upstream, UpstreamError, UpstreamRequest, UpstreamResponse},
    },
    domain::metadata::TarballRewriter,
    infra::{blobs::FsBlobStore, kv::MemoryStore},
};

pub const PUBLIC: &str = "https://registry.npmjs.org";
pub const PRIVATE: &str = "http://localhost:4873";

/// One scripted upstream outcome.
#[derive(Clone)]
pub enum Scripted {
    Respond {
        status: StatusCode,
        etag: Option<String>,
        body: Bytes,
    },
    Unreachable,
}

impl Scripted {
    pub fn json(status: StatusCode, body: &Value) -> Self {
        Self::Respond {
            status,
            etag: None,
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn ok_json(body: &Value) -> Self {
        Self::json(StatusCode::OK, body)
    }

    pub fn raw(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self::Respond {
            status,
            etag: None,
            body: body.into(),
        }
    }

    pub fn with_etag(self, value: &str) -> Self {
        match self {
            Self::Respond { status, body, .. } => Self::Respond {
                status,
                etag: Some(value.to_string()),
                body,
            },
            other => other,
        }
    }
}

/// Upstream fake answering from a queue of scripted outcomes. Once the queue
/// is empty every request fails as unreachable.
#[derive(Default)]
pub struct ScriptedUpstream {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: Scripted) {
        self.script.lock().expect("script lock").push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn last_request(&self) -> UpstreamRequest {
        self.requests()
            .pop()
            .expect("upstream should have been called")
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        self.requests.lock().expect("requests lock").push(request);
        let next = self.script.lock().expect("script lock").pop_front();
        match next.unwrap_or(Scripted::Unreachable) {
            Scripted::Respond { status, etag, body } => {
                let mut headers = HeaderMap::new();
                if let Some(etag) = etag {
                    headers.insert(ETAG, HeaderValue::from_str(&etag).expect("etag header"));
                }
                Ok(UpstreamResponse::from_bytes(status, headers, body))
            }
            Scripted::Unreachable => Err(UpstreamError::Transport("connection refused".into())),
        }
    }
}

pub struct Harness {
    pub proxy: Arc<RegistryProxy>,
    pub upstream: Arc<ScriptedUpstream>,
    pub store: Arc<MemoryStore>,
    pub blobs: Arc<FsBlobStore>,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let upstream = Arc::new(ScriptedUpstream::new());
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(FsBlobStore::new(dir.path().join("tarballs")).expect("blob store"));

        let kv: Arc<dyn KeyValueStore> = store.clone();
        let blob_store: Arc<dyn BlobStore> = blobs.clone();
        let proxy = RegistryProxy::new(
            upstream.clone(),
            kv,
            blob_store,
            TarballRewriter::new(PUBLIC, PRIVATE),
        );

        Self {
            proxy: Arc::new(proxy),
            upstream,
            store,
            blobs,
            _dir: dir,
        }
    }

    /// Wait for background cache writes so their effects are observable.
    pub async fn settle(&self) {
        self.proxy.write_behind().drain().await;
    }

    pub async fn blob(&self, name: &str) -> Option<Bytes> {
        match self.blobs.read_stream(name).await {
            Ok(stream) => {
                let chunks: Vec<Bytes> = stream.try_collect().await.expect("blob chunks");
                Some(Bytes::from(chunks.concat()))
            }
            Err(_) => None,
        }
    }
}

pub fn json_of(reply: &Reply) -> Value {
    reply.json_body().cloned().expect("reply should carry JSON")
}

pub async fn bytes_of(reply: Reply) -> Bytes {
    match reply.body {
        ReplyBody::Empty => Bytes::new(),
        ReplyBody::Json(value) => Bytes::from(value.to_string()),
        ReplyBody::Bytes(bytes) => bytes,
        ReplyBody::Stream(stream) => {
            let chunks: Vec<Bytes> = stream.try_collect().await.expect("stream chunks");
            Bytes::from(chunks.concat())
        }
    }
}

pub fn package_document(name: &str, versions: &[&str]) -> Value {
    let mut map = serde_json::Map::new();
    for version in versions {
        map.insert(
            (*version).to_string(),
            serde_json::json!({
                "name": name,
                "version": version,
                "dist": { "tarball": format!("{PUBLIC}/{name}/-/{name}-{version}.tgz") }
            }),
        );
    }
    serde_json::json!({
        "_id": name,
        "name": name,
        "dist-tags": { "latest": versions.last().copied().unwrap_or_default() },
        "versions": map,
    })
}

/// A publish payload as `npm publish` sends it to the private endpoint.
pub fn publish_payload(name: &str, version: &str, tarball: &[u8]) -> Value {
    use base64::Engine;

    let filename = format!("{name}-{version}.tgz");
    serde_json::json!({
        "_id": name,
        "name": name,
        "description": "internal package",
        "dist-tags": { "latest": version },
        "versions": {
            version: {
                "name": name,
                "version": version,
                "dist": {
                    "tarball": format!("{PRIVATE}/_private/{name}/-/{filename}")
                }
            }
        },
        "_attachments": {
            filename: {
                "content_type": "application/octet-stream",
                "data": base64::engine::general_purpose::STANDARD.encode(tarball),
                "length": tarball.len()
            }
        }
    })
}
