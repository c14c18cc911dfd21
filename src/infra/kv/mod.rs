//! Key-value store adapters.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;
