//! Private package store.
//!
//! Each private package is one hash, `private:{package}`: a field per
//! published version plus two sentinels. `latest` holds the most recently
//! published version document and `all` the package-level fields. Version
//! fields are write-once. Deleting a version leaves both sentinels alone, so
//! `latest` may name a version that is gone. Neither sentinel can be deleted
//! as a version, and `all` is never served as one.
//!
//! Tarball etags live beside the package hash in `private-etag:{package}`,
//! one field per attachment filename.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use bytes::Bytes;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::{
    error::RegistryError,
    proxy::content_etag,
    repos::{BlobStore, ByteStream, KeyValueStore, StoreError},
};

pub const LATEST_FIELD: &str = "latest";
pub const ALL_FIELD: &str = "all";

/// Path segment the publishing client bakes into tarball URLs.
const PRIVATE_SEGMENT: &str = "/_private/";

/// Package-level payload fields copied into the `all` sentinel.
const PACKAGE_FIELDS: [&str; 5] = ["name", "description", "readme", "_id", "_rev"];

fn hash_key(package: &str) -> String {
    format!("private:{package}")
}

fn etag_key(package: &str) -> String {
    format!("private-etag:{package}")
}

fn is_sentinel(field: &str) -> bool {
    field == LATEST_FIELD || field == ALL_FIELD
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Created,
    /// The version was already published; nothing changed.
    AlreadyPublished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Not a private package; the public registry should handle it.
    Delegate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionOutcome {
    Acknowledged,
    Delegate,
}

/// A private tarball read, resolved against the client's etag.
pub enum PrivateTarball {
    NotModified(String),
    Body {
        stream: ByteStream,
        etag: Option<String>,
    },
}

#[derive(Clone)]
pub struct PrivatePackages {
    store: Arc<dyn KeyValueStore>,
    blobs: Arc<dyn BlobStore>,
}

impl PrivatePackages {
    pub fn new(store: Arc<dyn KeyValueStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    /// Look a package (or one of its versions) up. `None` means the caller
    /// should fall through to the public mirror. `latest` resolves to the most
    /// recently published version document.
    pub async fn lookup(
        &self,
        package: &str,
        version: Option<&str>,
    ) -> Result<Option<Value>, RegistryError> {
        let key = hash_key(package);
        if !self.store.exists(&key).await? {
            return Ok(None);
        }

        match version {
            Some(ALL_FIELD) => Ok(None),
            Some(version) => match self.store.hget(&key, version).await? {
                Some(raw) => Ok(Some(decode(&key, &raw)?)),
                None => Ok(None),
            },
            None => {
                let fields = self.store.hgetall(&key).await?;
                Ok(Some(aggregate(&key, fields)?))
            }
        }
    }

    /// Publish the single version and attachment carried by `payload`.
    pub async fn publish(
        &self,
        package: &str,
        payload: &Value,
    ) -> Result<PublishOutcome, RegistryError> {
        let request = PublishRequest::parse(payload)?;
        let key = hash_key(package);

        if self.store.hexists(&key, &request.version).await? {
            info!(
                target = "regcache::private",
                package,
                version = %request.version,
                "version already published; ignoring"
            );
            return Ok(PublishOutcome::AlreadyPublished);
        }

        let mut document = request.document;
        strip_private_segment(&mut document);

        if self.blobs.exists(&request.attachment).await? {
            debug!(
                target = "regcache::private",
                attachment = %request.attachment,
                "attachment already on disk; keeping it"
            );
        } else {
            let etag = content_etag(&request.data);
            self.blobs.write(&request.attachment, request.data).await?;
            self.store
                .hset(&etag_key(package), &request.attachment, Bytes::from(etag))
                .await?;
        }

        let encoded = encode(&document)?;
        self.store
            .hset(&key, &request.version, encoded.clone())
            .await?;
        self.store.hset(&key, LATEST_FIELD, encoded).await?;

        let all = package_fields(payload, &request.version);
        self.store.hset(&key, ALL_FIELD, encode(&all)?).await?;

        info!(
            target = "regcache::private",
            package,
            version = %request.version,
            "private version published"
        );
        Ok(PublishOutcome::Created)
    }

    pub async fn remove(
        &self,
        package: &str,
        version: &str,
        tarball: &str,
    ) -> Result<RemoveOutcome, RegistryError> {
        let key = hash_key(package);
        if !self.store.exists(&key).await? {
            return Ok(RemoveOutcome::Delegate);
        }
        if is_sentinel(version) {
            return Err(RegistryError::bad_request(format!(
                "`{version}` is not a removable version"
            )));
        }
        if !self.blobs.exists(tarball).await? {
            return Err(RegistryError::NotFound);
        }

        self.store.hdel(&key, version).await?;
        self.blobs.remove(tarball).await?;
        self.store.hdel(&etag_key(package), tarball).await?;
        info!(target = "regcache::private", package, version, tarball, "private version removed");
        Ok(RemoveOutcome::Removed)
    }

    /// Revisions are not tracked; private packages just get an acknowledgement.
    pub async fn publish_revision(&self, package: &str) -> Result<RevisionOutcome, RegistryError> {
        if self.store.exists(&hash_key(package)).await? {
            Ok(RevisionOutcome::Acknowledged)
        } else {
            Ok(RevisionOutcome::Delegate)
        }
    }

    /// The stored tarball of a private package, if both exist. A matching
    /// client etag short-circuits before the blob is opened.
    pub async fn tarball(
        &self,
        package: &str,
        tarball: &str,
        client_etag: Option<&str>,
    ) -> Result<Option<PrivateTarball>, RegistryError> {
        if !self.store.exists(&hash_key(package)).await? {
            return Ok(None);
        }
        if !self.blobs.exists(tarball).await? {
            return Ok(None);
        }

        let etag = self
            .store
            .hget(&etag_key(package), tarball)
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned());
        if let Some(etag) = etag.as_deref().filter(|etag| Some(*etag) == client_etag) {
            return Ok(Some(PrivateTarball::NotModified(etag.to_string())));
        }

        let stream = self.blobs.read_stream(tarball).await?;
        Ok(Some(PrivateTarball::Body { stream, etag }))
    }
}

struct PublishRequest {
    version: String,
    document: Value,
    attachment: String,
    data: Bytes,
}

impl PublishRequest {
    /// Payloads carry one version and one attachment. With several, the
    /// lexicographically smallest key of each map is taken.
    fn parse(payload: &Value) -> Result<Self, RegistryError> {
        let (version, document) = payload
            .get("versions")
            .and_then(Value::as_object)
            .and_then(|versions| versions.iter().next())
            .ok_or_else(|| RegistryError::bad_request("publish payload carries no version"))?;

        let (attachment, content) = payload
            .get("_attachments")
            .and_then(Value::as_object)
            .and_then(|attachments| attachments.iter().next())
            .ok_or_else(|| RegistryError::bad_request("publish payload carries no attachment"))?;

        let encoded = content
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| RegistryError::bad_request("attachment has no data"))?;
        let data = BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| RegistryError::bad_request(format!("attachment data: {err}")))?;

        Ok(Self {
            version: version.clone(),
            document: document.clone(),
            attachment: attachment.clone(),
            data: Bytes::from(data),
        })
    }
}

fn strip_private_segment(document: &mut Value) {
    if let Some(Value::String(url)) = document.pointer_mut("/dist/tarball") {
        *url = url.replacen(PRIVATE_SEGMENT, "/", 1);
    }
}

fn package_fields(payload: &Value, version: &str) -> Value {
    let mut all = Map::new();
    for field in PACKAGE_FIELDS {
        if let Some(value) = payload.get(field) {
            all.insert(field.to_string(), value.clone());
        }
    }
    let dist_tags = payload
        .get("dist-tags")
        .cloned()
        .unwrap_or_else(|| json!({ LATEST_FIELD: version }));
    all.insert("dist-tags".to_string(), dist_tags);
    Value::Object(all)
}

fn aggregate(key: &str, fields: Vec<(String, Bytes)>) -> Result<Value, StoreError> {
    let mut all = Map::new();
    let mut latest = None;
    let mut versions = Map::new();

    for (field, raw) in fields {
        let value = decode(key, &raw)?;
        match field.as_str() {
            ALL_FIELD => {
                if let Value::Object(fields) = value {
                    all = fields;
                }
            }
            LATEST_FIELD => latest = Some(value),
            _ => {
                versions.insert(field, value);
            }
        }
    }

    all.insert("versions".to_string(), Value::Object(versions));

    if let Some(latest) = latest {
        for (target, source) in [("_id", "name"), ("_rev", "version")] {
            let unset = all.get(target).is_none_or(Value::is_null);
            if let (true, Some(value)) = (unset, latest.get(source)) {
                all.insert(target.to_string(), value.clone());
            }
        }
    }

    Ok(Value::Object(all))
}

fn decode(key: &str, raw: &[u8]) -> Result<Value, StoreError> {
    serde_json::from_slice(raw).map_err(|err| StoreError::corrupt(key, err))
}

fn encode(value: &Value) -> Result<Bytes, StoreError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| StoreError::corrupt("private", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_segment_is_stripped_once() {
        let mut doc = json!({ "dist": { "tarball": "http://mirror/_private/pkg/-/pkg-1.0.0.tgz" } });
        strip_private_segment(&mut doc);
        assert_eq!(doc["dist"]["tarball"], "http://mirror/pkg/-/pkg-1.0.0.tgz");
    }

    #[test]
    fn dist_tags_default_to_published_version() {
        let all = package_fields(&json!({ "name": "pkg", "description": "d" }), "1.0.0");
        assert_eq!(all, json!({ "name": "pkg", "description": "d", "dist-tags": { "latest": "1.0.0" } }));
    }

    #[test]
    fn aggregate_backfills_id_and_rev_from_latest() {
        let fields = vec![
            ("all".to_string(), Bytes::from_static(br#"{"name":"pkg"}"#)),
            ("latest".to_string(), Bytes::from_static(br#"{"name":"pkg","version":"1.1.0"}"#)),
            ("1.1.0".to_string(), Bytes::from_static(br#"{"name":"pkg","version":"1.1.0"}"#)),
        ];
        let doc = aggregate("private:pkg", fields).expect("aggregate");
        assert_eq!(doc["_id"], "pkg");
        assert_eq!(doc["_rev"], "1.1.0");
        assert_eq!(doc["versions"]["1.1.0"]["version"], "1.1.0");
        assert!(doc["versions"].get("latest").is_none());
    }

    #[test]
    fn aggregate_keeps_explicit_rev() {
        let fields = vec![
            ("all".to_string(), Bytes::from_static(br#"{"_rev":"3-abc"}"#)),
            ("latest".to_string(), Bytes::from_static(br#"{"name":"pkg","version":"1.1.0"}"#)),
        ];
        let doc = aggregate("private:pkg", fields).expect("aggregate");
        assert_eq!(doc["_rev"], "3-abc");
        assert_eq!(doc["_id"], "pkg");
    }

    #[test]
    fn sentinels_are_not_versions() {
        assert!(is_sentinel("latest"));
        assert!(is_sentinel("all"));
        assert!(!is_sentinel("1.0.0"));
    }

    #[test]
    fn smallest_version_key_is_published() {
        let payload = json!({
            "versions": { "2.0.0": { "version": "2.0.0" }, "1.0.0": { "version": "1.0.0" } },
            "_attachments": { "pkg-1.0.0.tgz": { "data": "dGFy" } }
        });
        let request = PublishRequest::parse(&payload).expect("parse");
        assert_eq!(request.version, "1.0.0");
        assert_eq!(request.data, Bytes::from_static(b"tar"));
    }

    #[test]
    fn payload_without_attachment_is_rejected() {
        let payload = json!({ "versions": { "1.0.0": {} } });
        assert!(matches!(
            PublishRequest::parse(&payload),
            Err(RegistryError::BadRequest(_))
        ));
    }
}
