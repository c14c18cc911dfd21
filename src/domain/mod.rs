//! Domain layer types and invariants.

pub mod merge;
pub mod metadata;
pub mod request;
