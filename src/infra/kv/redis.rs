//! Redis-backed key-value store.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use ::redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::info;

use crate::application::repos::{KeyValueStore, StoreError};

/// Redis store over one multiplexed connection, cloned per operation.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)
            .map_err(|err| StoreError::from_backend(format!("redis client error: {err}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::from_backend(format!("redis connection error: {err}")))?;
        info!(target = "regcache::store", backend = "redis", "connected to key-value store");
        Ok(Self { conn })
    }
}

fn command_error(command: &'static str) -> impl Fn(::redis::RedisError) -> StoreError {
    move |err| StoreError::from_backend(format!("redis {command} error: {err}"))
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(command_error("GET"))?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(key, value.as_ref())
            .await
            .map_err(command_error("SET"))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(command_error("EXISTS"))
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .hset(key, field, value.as_ref())
            .await
            .map_err(command_error("HSET"))?;
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: Bytes) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.hset_nx(key, field, value.as_ref())
            .await
            .map_err(command_error("HSETNX"))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn
            .hget(key, field)
            .await
            .map_err(command_error("HGET"))?;
        Ok(value.map(Bytes::from))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>, StoreError> {
        let mut conn = self.conn.clone();
        let entries: HashMap<String, Vec<u8>> = conn
            .hgetall(key)
            .await
            .map_err(command_error("HGETALL"))?;
        Ok(entries
            .into_iter()
            .map(|(field, value)| (field, Bytes::from(value)))
            .collect())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hkeys(key).await.map_err(command_error("HKEYS"))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Bytes>>, StoreError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<Vec<u8>>> = ::redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await
            .map_err(command_error("HMGET"))?;
        Ok(values.into_iter().map(|value| value.map(Bytes::from)).collect())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(key, field).await.map_err(command_error("HDEL"))?;
        Ok(removed > 0)
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.hexists(key, field)
            .await
            .map_err(command_error("HEXISTS"))
    }
}
