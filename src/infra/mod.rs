//! Infrastructure adapters and runtime bootstrap.

pub mod blobs;
pub mod error;
pub mod http;
pub mod kv;
pub mod telemetry;
pub mod upstream;
