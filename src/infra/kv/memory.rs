//! In-process key-value store with Redis semantics for the operations the
//! caches use. Backs tests and single-node deployments without Redis.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::application::repos::{KeyValueStore, StoreError};

#[derive(Debug, Clone)]
enum Entry {
    Value(Bytes),
    Hash(HashMap<String, Bytes>),
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_hash<T>(
        &self,
        key: &str,
        read: impl FnOnce(&HashMap<String, Bytes>) -> T,
    ) -> Result<Option<T>, StoreError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) => match entry.value() {
                Entry::Hash(hash) => Ok(Some(read(hash))),
                Entry::Value(_) => Err(StoreError::wrong_type(key)),
            },
        }
    }

    fn write_hash<T>(
        &self,
        key: &str,
        write: impl FnOnce(&mut HashMap<String, Bytes>) -> T,
    ) -> Result<T, StoreError> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        match entry.value_mut() {
            Entry::Hash(hash) => Ok(write(hash)),
            Entry::Value(_) => Err(StoreError::wrong_type(key)),
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(entry) => match entry.value() {
                Entry::Value(value) => Ok(Some(value.clone())),
                Entry::Hash(_) => Err(StoreError::wrong_type(key)),
            },
        }
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), Entry::Value(value));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.contains_key(key))
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), StoreError> {
        self.write_hash(key, |hash| {
            hash.insert(field.to_string(), value);
        })
    }

    async fn hsetnx(&self, key: &str, field: &str, value: Bytes) -> Result<bool, StoreError> {
        self.write_hash(key, |hash| {
            if hash.contains_key(field) {
                false
            } else {
                hash.insert(field.to_string(), value);
                true
            }
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self
            .read_hash(key, |hash| hash.get(field).cloned())?
            .flatten())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>, StoreError> {
        Ok(self
            .read_hash(key, |hash| {
                hash.iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect()
            })?
            .unwrap_or_default())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .read_hash(key, |hash| hash.keys().cloned().collect())?
            .unwrap_or_default())
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Bytes>>, StoreError> {
        Ok(self
            .read_hash(key, |hash| {
                fields.iter().map(|field| hash.get(field).cloned()).collect()
            })?
            .unwrap_or_else(|| vec![None; fields.len()]))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let (removed, emptied) = match self.entries.get_mut(key) {
            None => return Ok(false),
            Some(mut entry) => match entry.value_mut() {
                Entry::Hash(hash) => {
                    let removed = hash.remove(field).is_some();
                    (removed, hash.is_empty())
                }
                Entry::Value(_) => return Err(StoreError::wrong_type(key)),
            },
        };
        // Redis drops a hash once its last field is gone.
        if emptied {
            self.entries
                .remove_if(key, |_, entry| matches!(entry, Entry::Hash(hash) if hash.is_empty()));
        }
        Ok(removed)
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        Ok(self
            .read_hash(key, |hash| hash.contains_key(field))?
            .unwrap_or(false))
    }
}
