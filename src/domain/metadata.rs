//! Package metadata documents and tarball URL rewriting.
//!
//! Registry metadata arrives as untyped JSON in one of two shapes: a single
//! version (carrying `dist.tarball`) or a whole package (carrying a `versions`
//! mapping of single-version documents). [`MetadataDocument`] makes the shape
//! explicit so rewriting is a structural recursion instead of a check on field
//! presence.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Which way tarball URLs are rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Public registry host → private mirror host.
    ToPrivate,
    /// Private mirror host → public registry host.
    ToPublic,
}

/// A metadata payload classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataDocument {
    Version(VersionDocument),
    Package(PackageDocument),
    /// Anything else (error documents, search results, scalars). Left untouched.
    Other(Value),
}

/// A single published version. `tarball` is lifted out of `dist`.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionDocument {
    tarball: String,
    fields: Map<String, Value>,
}

/// A whole-package document; `versions` is lifted out of the field map.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageDocument {
    versions: BTreeMap<String, MetadataDocument>,
    fields: Map<String, Value>,
}

impl From<Value> for MetadataDocument {
    fn from(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            return Self::Other(value);
        };

        if let Some(tarball) = take_tarball(&mut fields) {
            return Self::Version(VersionDocument { tarball, fields });
        }

        match fields.remove("versions") {
            Some(Value::Object(versions)) => Self::Package(PackageDocument {
                versions: versions
                    .into_iter()
                    .map(|(version, doc)| (version, Self::from(doc)))
                    .collect(),
                fields,
            }),
            Some(other) => {
                fields.insert("versions".to_string(), other);
                Self::Other(Value::Object(fields))
            }
            None => Self::Other(Value::Object(fields)),
        }
    }
}

impl MetadataDocument {
    pub fn into_value(self) -> Value {
        match self {
            Self::Version(VersionDocument { tarball, mut fields }) => {
                if let Some(Value::Object(dist)) = fields.get_mut("dist") {
                    dist.insert("tarball".to_string(), Value::String(tarball));
                }
                Value::Object(fields)
            }
            Self::Package(PackageDocument {
                versions,
                mut fields,
            }) => {
                let versions: Map<String, Value> = versions
                    .into_iter()
                    .map(|(version, doc)| (version, doc.into_value()))
                    .collect();
                fields.insert("versions".to_string(), Value::Object(versions));
                Value::Object(fields)
            }
            Self::Other(value) => value,
        }
    }
}

fn take_tarball(fields: &mut Map<String, Value>) -> Option<String> {
    let dist = fields.get_mut("dist")?.as_object_mut()?;
    match dist.get("tarball") {
        Some(Value::String(url)) if !url.is_empty() => {}
        _ => return None,
    }
    match dist.remove("tarball") {
        Some(Value::String(url)) => Some(url),
        _ => None,
    }
}

/// Swaps the public registry prefix for the private one (and back) inside
/// tarball URLs. Holds no state beyond the two prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballRewriter {
    public_prefix: String,
    private_prefix: String,
}

impl TarballRewriter {
    /// Both prefixes are `scheme://host[:port]` without a trailing slash.
    pub fn new(public_prefix: impl Into<String>, private_prefix: impl Into<String>) -> Self {
        Self {
            public_prefix: trim_trailing_slash(public_prefix.into()),
            private_prefix: trim_trailing_slash(private_prefix.into()),
        }
    }

    pub fn public_prefix(&self) -> &str {
        &self.public_prefix
    }

    pub fn private_prefix(&self) -> &str {
        &self.private_prefix
    }

    pub fn rewrite(&self, document: MetadataDocument, direction: Direction) -> MetadataDocument {
        match document {
            MetadataDocument::Version(mut version) => {
                version.tarball = self.rewrite_url(version.tarball, direction);
                MetadataDocument::Version(version)
            }
            MetadataDocument::Package(mut package) => {
                package.versions = package
                    .versions
                    .into_iter()
                    .map(|(version, doc)| (version, self.rewrite(doc, direction)))
                    .collect();
                MetadataDocument::Package(package)
            }
            other @ MetadataDocument::Other(_) => other,
        }
    }

    /// Convenience over raw JSON: classify, rewrite, and flatten back.
    pub fn transform(&self, value: Value, direction: Direction) -> Value {
        self.rewrite(MetadataDocument::from(value), direction)
            .into_value()
    }

    fn rewrite_url(&self, url: String, direction: Direction) -> String {
        let (from, to) = match direction {
            Direction::ToPrivate => (&self.public_prefix, &self.private_prefix),
            Direction::ToPublic => (&self.private_prefix, &self.public_prefix),
        };

        match url.strip_prefix(from.as_str()) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => format!("{to}{rest}"),
            _ => url,
        }
    }
}

fn trim_trailing_slash(mut prefix: String) -> String {
    while prefix.ends_with('/') {
        prefix.pop();
    }
    prefix
}
