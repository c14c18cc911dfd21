//! Cache components and the proxy that drives them.

pub mod error;
pub(crate) mod lock;
pub mod metadata;
pub mod private;
pub mod proxy;
pub mod reply;
pub mod repos;
pub mod search;
pub mod tarball;
pub mod upstream;
pub mod write_behind;
