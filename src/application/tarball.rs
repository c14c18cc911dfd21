//! Tarball cache: binary artifacts persisted to the blob store, keyed by
//! `package:filename`, validated by etag.

use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;
use metrics::counter;
use tracing::{debug, warn};

use crate::domain::request::CacheDomain;

use super::{
    error::RegistryError,
    reply::Reply,
    repos::{BlobError, BlobStore, KeyValueStore, get_string_best_effort},
    upstream::UpstreamResponse,
    write_behind::WriteBehind,
};

const SOURCE: &str = "application::tarball";

fn filename_key(key: &str) -> String {
    format!("tarball:{key}")
}

fn etag_key(key: &str) -> String {
    format!("tarball:{key}:etag")
}

#[derive(Clone)]
pub struct TarballCache {
    store: Arc<dyn KeyValueStore>,
    blobs: Arc<dyn BlobStore>,
    writes: WriteBehind,
}

impl TarballCache {
    pub fn new(store: Arc<dyn KeyValueStore>, blobs: Arc<dyn BlobStore>, writes: WriteBehind) -> Self {
        Self {
            store,
            blobs,
            writes,
        }
    }

    /// Relay a usable upstream response and persist it in the background.
    ///
    /// The upstream body is not polled until the etag checks are done, so a
    /// 304 or a client-etag match never reads it.
    pub async fn cache_tarball(
        &self,
        key: &str,
        filename: &str,
        response: UpstreamResponse,
        client_etag: Option<&str>,
    ) -> Result<Reply, RegistryError> {
        let status = response.status();
        let etag = response.etag();

        if status == StatusCode::NOT_MODIFIED
            || (etag.is_some() && etag.as_deref() == client_etag)
        {
            counter!("regcache_not_modified_total", "domain" => CacheDomain::Tarball.as_str())
                .increment(1);
            return Ok(Reply::not_modified(etag));
        }

        let content_type = response.headers().get(axum::http::header::CONTENT_TYPE).cloned();
        let data = response.bytes().await?;

        if !status.is_success() {
            return Ok(Reply::bytes(status, data)
                .with_etag(etag)
                .with_content_type(content_type));
        }

        let stored = get_string_best_effort(self.store.as_ref(), &etag_key(key), SOURCE).await;
        let reply = Reply::bytes(status, data.clone())
            .with_etag(etag.clone())
            .octet_stream();

        if etag.is_some() && stored == etag && self.blob_present(key, filename).await {
            debug!(target = "regcache::tarball", key, "etag unchanged; skipping write");
            return Ok(reply);
        }

        let store = self.store.clone();
        let blobs = self.blobs.clone();
        let owned_key = key.to_string();
        let filename = filename.to_string();
        self.writes.submit(CacheDomain::Tarball, key, async move {
            blobs.write(&filename, data).await?;
            store
                .set(&filename_key(&owned_key), Bytes::from(filename))
                .await?;
            if let Some(etag) = etag {
                store.set(&etag_key(&owned_key), Bytes::from(etag)).await?;
            }
            Ok(())
        });

        Ok(reply)
    }

    /// An unreadable blob store counts as a missing blob, so the write goes ahead.
    async fn blob_present(&self, key: &str, filename: &str) -> bool {
        match self.blobs.exists(filename).await {
            Ok(present) => present,
            Err(err) => {
                warn!(target = "regcache::tarball", key, filename, error = %err, "blob check failed");
                false
            }
        }
    }

    /// Serve `key` from the blob store alone. A blob without a recorded etag
    /// is still served.
    pub async fn serve_tarball(
        &self,
        key: &str,
        client_etag: Option<&str>,
    ) -> Result<Reply, RegistryError> {
        let Some(filename) =
            get_string_best_effort(self.store.as_ref(), &filename_key(key), SOURCE).await
        else {
            return Err(RegistryError::NotFound);
        };
        let etag = get_string_best_effort(self.store.as_ref(), &etag_key(key), SOURCE).await;

        if etag.is_some() && etag.as_deref() == client_etag {
            return Ok(Reply::not_modified(etag));
        }

        let stream = match self.blobs.read_stream(&filename).await {
            Ok(stream) => stream,
            Err(BlobError::NotFound(_)) => return Err(RegistryError::NotFound),
            Err(err) => {
                warn!(target = "regcache::tarball", key, filename, error = %err, "cached blob unreadable");
                return Err(RegistryError::NotFound);
            }
        };

        Ok(Reply::stream(StatusCode::OK, stream)
            .with_etag(etag)
            .octet_stream())
    }
}
