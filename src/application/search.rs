//! Search index cache.
//!
//! The `search` hash holds one baseline document under the field `search`
//! and any number of deltas under their decimal `_updated` timestamps. A
//! read merges the baseline and the selected deltas in ascending order.

use std::sync::Arc;

use axum::http::StatusCode;
use bytes::Bytes;
use serde::de::IgnoredAny;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::domain::{
    merge::deep_merge,
    request::{CacheDomain, SEARCH_KEY},
};

use super::{
    error::RegistryError,
    reply::Reply,
    repos::KeyValueStore,
    upstream::{Upstream, UpstreamError, UpstreamRequest, UpstreamResponse},
    write_behind::WriteBehind,
};

/// Upstream path of the full "all packages" document.
pub const ALL_PACKAGES_PATH: &str = "/-/all";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimeOutcome {
    AlreadyPrimed,
    Primed,
}

#[derive(Clone)]
pub struct SearchIndex {
    store: Arc<dyn KeyValueStore>,
    upstream: Arc<dyn Upstream>,
    writes: WriteBehind,
}

impl SearchIndex {
    pub fn new(store: Arc<dyn KeyValueStore>, upstream: Arc<dyn Upstream>, writes: WriteBehind) -> Self {
        Self {
            store,
            upstream,
            writes,
        }
    }

    /// Relay an upstream search response, keeping it as a delta when the
    /// client asked for changes since `startkey`.
    pub async fn cache_search(
        &self,
        response: UpstreamResponse,
        startkey: Option<u64>,
    ) -> Result<Reply, RegistryError> {
        let status = response.status();
        let body = response.bytes().await?;
        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|_| RegistryError::InvalidUpstreamPayload { status })?;

        if startkey.is_none() || !status.is_success() || is_error_document(&parsed) {
            return Ok(Reply::json(status, parsed));
        }

        match updated_field(&parsed) {
            Some(field) => {
                let store = self.store.clone();
                let key = field.clone();
                self.writes.submit(CacheDomain::Search, key, async move {
                    if !store.hsetnx(SEARCH_KEY, &field, body).await? {
                        debug!(target = "regcache::search", field, "delta already stored");
                    }
                    Ok(())
                });
            }
            None => {
                debug!(target = "regcache::search", "search response has no _updated; not caching")
            }
        }

        Ok(Reply::json(status, parsed))
    }

    /// Rebuild the search document from the baseline and stored deltas.
    pub async fn serve_search(&self, startkey: Option<u64>) -> Result<Reply, RegistryError> {
        let fields = match self.store.hkeys(SEARCH_KEY).await {
            Ok(fields) => fields,
            Err(err) => {
                warn!(target = "regcache::search", error = %err, "could not list search deltas");
                Vec::new()
            }
        };

        let mut deltas: Vec<u64> = fields
            .iter()
            .filter(|field| field.as_str() != SEARCH_KEY)
            .filter_map(|field| field.parse().ok())
            .collect();
        deltas.sort_unstable();
        deltas.dedup();

        let mut layers = vec![SEARCH_KEY.to_string()];
        layers.extend(select_deltas(&deltas, startkey).iter().map(u64::to_string));

        let values = self.store.hmget(SEARCH_KEY, &layers).await.map_err(|err| {
            warn!(target = "regcache::search", error = %err, "could not read search layers");
            RegistryError::NotFound
        })?;

        let mut merged = Value::Object(Map::new());
        for (layer, value) in layers.iter().zip(values) {
            let Some(raw) = value else {
                debug!(target = "regcache::search", layer, "search layer missing");
                continue;
            };
            match serde_json::from_slice::<Value>(&raw) {
                Ok(document @ Value::Object(_)) => deep_merge(&mut merged, document),
                Ok(_) => warn!(target = "regcache::search", layer, "search layer is not an object"),
                Err(err) => {
                    warn!(target = "regcache::search", layer, error = %err, "search layer is corrupt")
                }
            }
        }

        Ok(Reply::json(StatusCode::OK, merged))
    }

    /// Make sure the baseline exists, fetching `/-/all` once when it does not.
    pub async fn prime(&self) -> Result<PrimeOutcome, RegistryError> {
        if self.store.hexists(SEARCH_KEY, SEARCH_KEY).await? {
            info!(target = "regcache::search", "search baseline present");
            return Ok(PrimeOutcome::AlreadyPrimed);
        }

        info!(target = "regcache::search", "search baseline missing; fetching full index");
        let response = self
            .upstream
            .fetch(UpstreamRequest::get(ALL_PACKAGES_PATH))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status).into());
        }

        let body: Bytes = response.bytes().await?;
        serde_json::from_slice::<IgnoredAny>(&body)
            .map_err(|_| RegistryError::InvalidUpstreamPayload { status })?;

        let size = body.len();
        self.store.hset(SEARCH_KEY, SEARCH_KEY, body).await?;
        info!(target = "regcache::search", bytes = size, "search baseline stored");
        Ok(PrimeOutcome::Primed)
    }
}

/// Deltas to merge over the baseline, ascending. With a `startkey`, every
/// delta at or after it; when none qualify, the newest delta alone.
fn select_deltas(sorted: &[u64], startkey: Option<u64>) -> Vec<u64> {
    let Some(start) = startkey else {
        return sorted.to_vec();
    };
    let newer: Vec<u64> = sorted.iter().copied().filter(|key| *key >= start).collect();
    if newer.is_empty() {
        sorted.last().copied().into_iter().collect()
    } else {
        newer
    }
}

/// Parse a `startkey` query value. Anything that is not a non-negative
/// number is treated as absent.
pub fn parse_startkey(raw: &str) -> Option<u64> {
    let trimmed = raw.trim().trim_matches('"');
    if let Ok(value) = trimmed.parse::<u64>() {
        return Some(value);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Some(value as u64),
        _ => None,
    }
}

fn is_error_document(document: &Value) -> bool {
    document.get("error").is_some()
}

fn updated_field(document: &Value) -> Option<String> {
    match document.get("_updated")? {
        Value::Number(number) => match number.as_u64() {
            Some(value) => Some(value.to_string()),
            None => number
                .as_f64()
                .filter(|value| value.is_finite() && *value >= 0.0)
                .map(|value| (value as u64).to_string()),
        },
        Value::String(text) => parse_startkey(text).map(|value| value.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn startkey_selects_newer_deltas() {
        assert_eq!(select_deltas(&[100, 200, 300], Some(150)), vec![200, 300]);
        assert_eq!(select_deltas(&[100, 200], Some(200)), vec![200]);
    }

    #[test]
    fn startkey_past_every_delta_falls_back_to_newest() {
        assert_eq!(select_deltas(&[100, 200], Some(500)), vec![200]);
        assert!(select_deltas(&[], Some(500)).is_empty());
    }

    #[test]
    fn no_startkey_selects_everything() {
        assert_eq!(select_deltas(&[100, 200], None), vec![100, 200]);
    }

    #[test]
    fn startkey_parsing_is_lenient() {
        assert_eq!(parse_startkey("1403212800000"), Some(1_403_212_800_000));
        assert_eq!(parse_startkey("\"150\""), Some(150));
        assert_eq!(parse_startkey("150.7"), Some(150));
        assert_eq!(parse_startkey("soon"), None);
        assert_eq!(parse_startkey("-1"), None);
    }

    #[test]
    fn updated_field_accepts_numbers_and_strings() {
        assert_eq!(updated_field(&json!({ "_updated": 200 })).as_deref(), Some("200"));
        assert_eq!(updated_field(&json!({ "_updated": "300" })).as_deref(), Some("300"));
        assert_eq!(updated_field(&json!({ "pkg": {} })), None);
    }
}
