//! Caching proxy for a package registry: mirrors a public registry with
//! etag validation and stale-on-failure fallback, and hosts privately
//! published packages alongside the mirror.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
