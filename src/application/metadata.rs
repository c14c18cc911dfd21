//! Metadata cache: etag-validated package documents with stale fallback.

use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{
    metadata::{Direction, TarballRewriter},
    request::CacheDomain,
};

use super::{
    error::RegistryError,
    reply::Reply,
    repos::{KeyValueStore, get_best_effort, get_string_best_effort},
    upstream::UpstreamResponse,
    write_behind::WriteBehind,
};

const SOURCE: &str = "application::metadata";

fn body_key(key: &str) -> String {
    format!("meta:{key}")
}

fn etag_key(key: &str) -> String {
    format!("meta:{key}:etag")
}

#[derive(Clone)]
pub struct MetadataCache {
    store: Arc<dyn KeyValueStore>,
    rewriter: TarballRewriter,
    writes: WriteBehind,
}

impl MetadataCache {
    pub fn new(store: Arc<dyn KeyValueStore>, rewriter: TarballRewriter, writes: WriteBehind) -> Self {
        Self {
            store,
            rewriter,
            writes,
        }
    }

    /// Handle a usable upstream response for `key`.
    ///
    /// The reply is computed first; the cache write, if any, is submitted to
    /// the write-behind set afterwards.
    pub async fn get_meta(
        &self,
        key: &str,
        response: UpstreamResponse,
        client_etag: Option<&str>,
    ) -> Result<Reply, RegistryError> {
        let status = response.status();
        let etag = response.etag();

        if status == StatusCode::NOT_MODIFIED {
            counter!("regcache_not_modified_total", "domain" => CacheDomain::Meta.as_str())
                .increment(1);
            return Ok(Reply::not_modified(etag));
        }
        if etag.is_some() && etag.as_deref() == client_etag {
            counter!("regcache_not_modified_total", "domain" => CacheDomain::Meta.as_str())
                .increment(1);
            return Ok(Reply::not_modified(etag));
        }

        let body = response.bytes().await?;
        let parsed: Value = serde_json::from_slice(&body).map_err(|err| {
            debug!(target = "regcache::metadata", key, error = %err, "upstream metadata did not parse");
            RegistryError::InvalidUpstreamPayload { status }
        })?;
        let document = self.rewriter.transform(parsed, Direction::ToPrivate);

        if !status.is_success() {
            return Ok(Reply::json(status, document).with_etag(etag));
        }

        let Some(etag) = etag else {
            debug!(target = "regcache::metadata", key, "upstream sent no etag; not caching");
            return Ok(Reply::json(status, document));
        };

        let stored = get_string_best_effort(self.store.as_ref(), &etag_key(key), SOURCE).await;
        if stored.as_deref() == Some(etag.as_str()) {
            debug!(target = "regcache::metadata", key, "etag unchanged; skipping write");
            return Ok(Reply::json(status, document).with_etag(Some(etag)));
        }

        let encoded = match serde_json::to_vec(&document) {
            Ok(encoded) => Bytes::from(encoded),
            Err(err) => {
                warn!(target = "regcache::metadata", key, error = %err, "could not encode document for caching");
                return Ok(Reply::json(status, document).with_etag(Some(etag)));
            }
        };

        let reply = Reply::json(status, document).with_etag(Some(etag.clone()));
        let store = self.store.clone();
        let owned_key = key.to_string();
        self.writes.submit(CacheDomain::Meta, key, async move {
            store.set(&body_key(&owned_key), encoded).await?;
            store.set(&etag_key(&owned_key), Bytes::from(etag)).await?;
            Ok(())
        });

        Ok(reply)
    }

    /// Serve `key` from the cache alone.
    pub async fn serve_meta(
        &self,
        key: &str,
        client_etag: Option<&str>,
    ) -> Result<Reply, RegistryError> {
        let Some(body) = get_best_effort(self.store.as_ref(), &body_key(key), SOURCE).await else {
            return Err(RegistryError::NotFound);
        };
        let Some(etag) = get_string_best_effort(self.store.as_ref(), &etag_key(key), SOURCE).await
        else {
            return Err(RegistryError::NotFound);
        };

        if Some(etag.as_str()) == client_etag {
            return Ok(Reply::not_modified(Some(etag)));
        }

        let document: Value = serde_json::from_slice(&body).map_err(|err| {
            warn!(target = "regcache::metadata", key, error = %err, "cached metadata is corrupt");
            RegistryError::NotFound
        })?;

        Ok(Reply::json(StatusCode::OK, document).with_etag(Some(etag)))
    }
}
