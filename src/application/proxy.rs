//! Request orchestration: one upstream attempt per read, then dispatch to the
//! cache component that owns the request's domain.

use std::sync::Arc;

use axum::http::{
    HeaderMap, HeaderValue, Method, StatusCode,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, COOKIE},
};
use bytes::Bytes;
use metrics::counter;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::{
    metadata::{Direction, TarballRewriter},
    request::{CacheDomain, RouteParams, classify},
};

use super::{
    error::RegistryError,
    metadata::MetadataCache,
    private::{PrivatePackages, PrivateTarball, RemoveOutcome, RevisionOutcome},
    repos::{BlobStore, KeyValueStore},
    reply::Reply,
    search::SearchIndex,
    tarball::TarballCache,
    upstream::{Upstream, UpstreamError, UpstreamRequest, UpstreamResponse},
    write_behind::WriteBehind,
};

/// An inbound read as the router hands it over.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub params: RouteParams,
    pub if_none_match: Option<String>,
    pub startkey: Option<u64>,
}

impl ReadRequest {
    pub fn get(path: impl Into<String>, params: RouteParams) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: None,
            params,
            if_none_match: None,
            startkey: None,
        }
    }

    pub fn with_if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_startkey(mut self, startkey: Option<u64>) -> Self {
        self.startkey = startkey;
        self
    }

    fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) if !query.is_empty() => format!("{}?{query}", self.path),
            _ => self.path.clone(),
        }
    }
}

pub struct RegistryProxy {
    upstream: Arc<dyn Upstream>,
    rewriter: TarballRewriter,
    metadata: MetadataCache,
    tarballs: TarballCache,
    search: SearchIndex,
    private: PrivatePackages,
    writes: WriteBehind,
}

impl RegistryProxy {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        store: Arc<dyn KeyValueStore>,
        blobs: Arc<dyn BlobStore>,
        rewriter: TarballRewriter,
    ) -> Self {
        let writes = WriteBehind::new();
        Self {
            metadata: MetadataCache::new(store.clone(), rewriter.clone(), writes.clone()),
            tarballs: TarballCache::new(store.clone(), blobs.clone(), writes.clone()),
            search: SearchIndex::new(store.clone(), upstream.clone(), writes.clone()),
            private: PrivatePackages::new(store, blobs),
            upstream,
            rewriter,
            writes,
        }
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn tarballs(&self) -> &TarballCache {
        &self.tarballs
    }

    pub fn search(&self) -> &SearchIndex {
        &self.search
    }

    pub fn private_packages(&self) -> &PrivatePackages {
        &self.private
    }

    pub fn write_behind(&self) -> &WriteBehind {
        &self.writes
    }

    /// Serve a read through the public mirror cache.
    pub async fn read(&self, request: ReadRequest) -> Result<Reply, RegistryError> {
        let Some(cache_key) = classify(&request.method, &request.path, &request.params) else {
            return Err(RegistryError::bad_request(format!(
                "{} is not a read",
                request.method
            )));
        };
        let domain = cache_key.domain;
        let key = cache_key.key.unwrap_or_default();
        let client_etag = request.if_none_match.as_deref();

        match domain {
            CacheDomain::Meta => {
                let reply = match self.attempt(&request, domain).await {
                    Ok(response) => self.metadata.get_meta(&key, response, client_etag).await,
                    Err(err) => Err(err.into()),
                };
                match reply {
                    Err(RegistryError::Upstream(err)) => {
                        self.note_fallback(domain, &key, &err);
                        self.metadata.serve_meta(&key, client_etag).await
                    }
                    other => other,
                }
            }
            CacheDomain::Tarball => {
                let filename = request.params.tarball.clone().unwrap_or_default();
                let reply = match self.attempt(&request, domain).await {
                    Ok(response) => {
                        self.tarballs
                            .cache_tarball(&key, &filename, response, client_etag)
                            .await
                    }
                    Err(err) => Err(err.into()),
                };
                match reply {
                    Err(RegistryError::Upstream(err)) => {
                        self.note_fallback(domain, &key, &err);
                        self.tarballs.serve_tarball(&key, client_etag).await
                    }
                    other => other,
                }
            }
            CacheDomain::Search => {
                let reply = match self.attempt(&request, domain).await {
                    Ok(response) => self.search.cache_search(response, request.startkey).await,
                    Err(err) => Err(err.into()),
                };
                match reply {
                    Err(RegistryError::Upstream(err)) => {
                        self.note_fallback(domain, &key, &err);
                        self.search.serve_search(request.startkey).await
                    }
                    other => other,
                }
            }
            CacheDomain::Index => match self.attempt(&request, domain).await {
                Ok(response) => relay_response(response).await.map_err(|err| {
                    debug!(target = "regcache::proxy", error = %err, "index relay failed");
                    RegistryError::NotFound
                }),
                Err(_) => Err(RegistryError::NotFound),
            },
            CacheDomain::Post | CacheDomain::Put => Err(RegistryError::bad_request(format!(
                "{domain} requests are not served from the cache"
            ))),
        }
    }

    /// `GET /{package}[/{version}]`: private packages first, then the mirror.
    pub async fn package(&self, request: ReadRequest) -> Result<Reply, RegistryError> {
        if let Some(package) = request.params.package.as_deref() {
            let version = request.params.version.as_deref();
            match self.private.lookup(package, version).await {
                Ok(Some(document)) => {
                    return Ok(private_document(document, request.if_none_match.as_deref()));
                }
                Ok(None) => {}
                Err(err) => warn!(
                    target = "regcache::proxy",
                    package,
                    error = %err,
                    "private lookup failed; using the mirror"
                ),
            }
        }
        self.read(request).await
    }

    /// `GET /{package}/-/{tarball}`: private blobs first, then the mirror.
    pub async fn tarball(&self, request: ReadRequest) -> Result<Reply, RegistryError> {
        if let (Some(package), Some(tarball)) = (
            request.params.package.as_deref(),
            request.params.tarball.as_deref(),
        ) {
            match self
                .private
                .tarball(package, tarball, request.if_none_match.as_deref())
                .await
            {
                Ok(Some(PrivateTarball::NotModified(etag))) => {
                    return Ok(Reply::not_modified(Some(etag)));
                }
                Ok(Some(PrivateTarball::Body { stream, etag })) => {
                    return Ok(Reply::stream(StatusCode::OK, stream)
                        .with_etag(etag)
                        .octet_stream());
                }
                Ok(None) => {}
                Err(err) => warn!(
                    target = "regcache::proxy",
                    package,
                    tarball,
                    error = %err,
                    "private tarball lookup failed; using the mirror"
                ),
            }
        }
        self.read(request).await
    }

    /// Forward a request upstream as-is and relay whatever comes back.
    pub async fn relay(&self, request: UpstreamRequest) -> Result<Reply, RegistryError> {
        let response = self.upstream.send(request).await?;
        relay_response(response).await
    }

    /// Relay a publish of a public package, with tarball URLs pointed back
    /// at the public registry.
    pub async fn publish_public(
        &self,
        path: &str,
        payload: Value,
        inbound: &HeaderMap,
    ) -> Result<Reply, RegistryError> {
        let document = self.rewriter.transform(payload, Direction::ToPublic);
        let body = serde_json::to_vec(&document)
            .map_err(|err| RegistryError::bad_request(format!("publish payload: {err}")))?;

        let request = UpstreamRequest::new(Method::PUT, path)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_header(ACCEPT, HeaderValue::from_static("application/json"))
            .with_forwarded(inbound, &[COOKIE, AUTHORIZATION])
            .with_body(Bytes::from(body));
        self.relay(request).await
    }

    /// `PUT /{package}/-rev/{revid}`.
    pub async fn put_revision(
        &self,
        package: &str,
        path: &str,
        body: Bytes,
        inbound: &HeaderMap,
    ) -> Result<Reply, RegistryError> {
        match self.private.publish_revision(package).await? {
            RevisionOutcome::Acknowledged => Ok(created()),
            RevisionOutcome::Delegate => match serde_json::from_slice::<Value>(&body) {
                Ok(payload) => self.publish_public(path, payload, inbound).await,
                Err(_) => {
                    let request = UpstreamRequest::new(Method::PUT, path)
                        .with_forwarded(inbound, &[CONTENT_TYPE, ACCEPT, COOKIE, AUTHORIZATION])
                        .with_body(body);
                    self.relay(request).await
                }
            },
        }
    }

    /// `DELETE /{package}/-/{tarball}/-rev/{version}`.
    pub async fn remove(
        &self,
        package: &str,
        tarball: &str,
        version: &str,
        path: &str,
        inbound: &HeaderMap,
    ) -> Result<Reply, RegistryError> {
        match self.private.remove(package, version, tarball).await? {
            RemoveOutcome::Removed => Ok(Reply::json(StatusCode::OK, json!({ "ok": true }))),
            RemoveOutcome::Delegate => {
                let request = UpstreamRequest::new(Method::DELETE, path)
                    .with_forwarded(inbound, &[ACCEPT, COOKIE, AUTHORIZATION]);
                self.relay(request).await
            }
        }
    }

    /// The single upstream attempt for a read. An error means the cache
    /// should answer instead.
    async fn attempt(
        &self,
        request: &ReadRequest,
        domain: CacheDomain,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let upstream_request = UpstreamRequest::get(request.path_and_query())
            .with_if_none_match(request.if_none_match.as_deref());
        match self.upstream.fetch(upstream_request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                counter!("regcache_upstream_failure_total", "domain" => domain.as_str())
                    .increment(1);
                warn!(
                    target = "regcache::proxy",
                    domain = %domain,
                    path = %request.path,
                    error = %err,
                    "upstream fetch failed"
                );
                Err(err)
            }
        }
    }

    fn note_fallback(&self, domain: CacheDomain, key: &str, err: &UpstreamError) {
        counter!("regcache_cache_fallback_total", "domain" => domain.as_str()).increment(1);
        debug!(
            target = "regcache::proxy",
            domain = %domain,
            key,
            error = %err,
            "serving from cache"
        );
    }
}

pub fn created() -> Reply {
    Reply::json(StatusCode::CREATED, json!({ "ok": true }))
}

/// Strong etag over the serialized document.
pub fn document_etag(document: &Value) -> String {
    let encoded = serde_json::to_vec(document).unwrap_or_default();
    content_etag(&encoded)
}

/// Quoted sha256 of `data`.
pub fn content_etag(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("\"{}\"", hex::encode(digest.as_slice()))
}

fn private_document(document: Value, client_etag: Option<&str>) -> Reply {
    let etag = document_etag(&document);
    if client_etag == Some(etag.as_str()) {
        return Reply::not_modified(Some(etag));
    }
    Reply::json(StatusCode::OK, document).with_etag(Some(etag))
}

async fn relay_response(response: UpstreamResponse) -> Result<Reply, RegistryError> {
    let status = response.status();
    let etag = response.etag();
    let content_type = response.headers().get(CONTENT_TYPE).cloned();
    let body = response.bytes().await?;
    Ok(Reply::bytes(status, body)
        .with_etag(etag)
        .with_content_type(content_type))
}
