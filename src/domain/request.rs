//! Request classification: which cache domain a request belongs to and the
//! key its cached value lives under.

use std::fmt;

use axum::http::Method;

/// Key shared by the search baseline and the search cache domain.
pub const SEARCH_KEY: &str = "search";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheDomain {
    Meta,
    Tarball,
    Search,
    Index,
    Post,
    Put,
}

impl CacheDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheDomain::Meta => "meta",
            CacheDomain::Tarball => "tarball",
            CacheDomain::Search => "search",
            CacheDomain::Index => "index",
            CacheDomain::Post => "post",
            CacheDomain::Put => "put",
        }
    }
}

impl fmt::Display for CacheDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified request. `key` is `None` when no caching applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub domain: CacheDomain,
    pub key: Option<String>,
}

impl CacheKey {
    fn new(domain: CacheDomain, key: Option<String>) -> Self {
        Self { domain, key }
    }
}

/// Path parameters extracted by the router.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteParams {
    pub package: Option<String>,
    pub version: Option<String>,
    pub tarball: Option<String>,
}

impl RouteParams {
    pub fn package(package: impl Into<String>) -> Self {
        Self {
            package: Some(package.into()),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_tarball(mut self, tarball: impl Into<String>) -> Self {
        self.tarball = Some(tarball.into());
        self
    }
}

/// Derive the cache domain and key for an inbound request.
///
/// Returns `None` for methods the cache never sees (e.g. `DELETE`).
pub fn classify(method: &Method, path: &str, params: &RouteParams) -> Option<CacheKey> {
    if method == Method::GET || method == Method::HEAD {
        let key = match (&params.package, &params.tarball) {
            (Some(package), Some(tarball)) => {
                CacheKey::new(CacheDomain::Tarball, Some(format!("{package}:{tarball}")))
            }
            (Some(package), None) => {
                let key = match &params.version {
                    Some(version) => format!("{package}:{version}"),
                    None => package.clone(),
                };
                CacheKey::new(CacheDomain::Meta, Some(key))
            }
            (None, _) if path == "/" => CacheKey::new(CacheDomain::Index, None),
            (None, _) => CacheKey::new(CacheDomain::Search, Some(SEARCH_KEY.to_string())),
        };
        return Some(key);
    }

    if method == Method::POST {
        return Some(CacheKey::new(CacheDomain::Post, None));
    }

    if method == Method::PUT {
        return Some(CacheKey::new(CacheDomain::Put, None));
    }

    None
}
