//! Cache writes that run after the reply has been computed.
//!
//! A crash between reply and write loses that update; the next upstream
//! fetch repopulates it.

use std::{
    future::Future,
    mem,
    sync::{Arc, Mutex},
    time::Duration,
};

use metrics::counter;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::domain::request::CacheDomain;

use super::{error::RegistryError, lock::mutex_lock};

const SOURCE: &str = "application::write_behind";

#[derive(Clone, Default)]
pub struct WriteBehind {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl WriteBehind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `write` in the background. Failures are logged, never returned.
    pub fn submit<F>(&self, domain: CacheDomain, key: impl Into<String>, write: F)
    where
        F: Future<Output = Result<(), RegistryError>> + Send + 'static,
    {
        let key = key.into();
        let mut tasks = mutex_lock(&self.tasks, SOURCE, "submit");
        while let Some(finished) = tasks.try_join_next() {
            if let Err(err) = finished {
                warn!(target = "regcache::write_behind", error = %err, "cache write task aborted");
            }
        }

        tasks.spawn(async move {
            match write.await {
                Ok(()) => {
                    counter!("regcache_cache_write_total", "domain" => domain.as_str())
                        .increment(1);
                    debug!(
                        target = "regcache::write_behind",
                        domain = %domain,
                        key = %key,
                        "cache entry written"
                    );
                }
                Err(err) => {
                    warn!(
                        target = "regcache::write_behind",
                        domain = %domain,
                        key = %key,
                        error = %err,
                        "cache write failed"
                    );
                }
            }
        });
    }

    pub fn pending(&self) -> usize {
        mutex_lock(&self.tasks, SOURCE, "pending").len()
    }

    /// Wait for every submitted write, including ones submitted while draining.
    pub async fn drain(&self) {
        loop {
            let mut batch = mem::take(&mut *mutex_lock(&self.tasks, SOURCE, "drain"));
            if batch.is_empty() {
                return;
            }
            while let Some(finished) = batch.join_next().await {
                if let Err(err) = finished {
                    warn!(target = "regcache::write_behind", error = %err, "cache write task aborted");
                }
            }
        }
    }

    /// [`drain`](Self::drain) bounded by `timeout`. Returns whether every
    /// write finished in time.
    pub async fn drain_within(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.drain()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    target = "regcache::write_behind",
                    pending = self.pending(),
                    timeout_secs = timeout.as_secs(),
                    "gave up waiting for cache writes"
                );
                false
            }
        }
    }
}
