//! Key-value store with per-entry TTL
//!
//! The rate limiter only needs `get` and `put`; anything offering those with
//! expiry (Redis, a CDN edge KV, ...) can back it. [`MemoryKv`] is the
//! in-process implementation, swept periodically by the cron plugin.

use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::prelude::*;

#[async_trait]
pub trait KvStore: Send + Sync {
  async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

  async fn put(
    &self,
    key: &str,
    value: String,
    ttl: Duration,
  ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
  value: String,
  expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryKv {
  entries: DashMap<String, Entry>,
}

impl MemoryKv {
  pub fn new() -> Self {
    Self::default()
  }

  /// Drops expired entries, returning how many were removed.
  pub fn sweep(&self) -> usize {
    let now = Instant::now();
    let before = self.entries.len();
    self.entries.retain(|_, entry| entry.expires_at > now);
    before - self.entries.len()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }
}

#[async_trait]
impl KvStore for MemoryKv {
  async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
    let now = Instant::now();
    Ok(
      self
        .entries
        .get(key)
        .filter(|entry| entry.expires_at > now)
        .map(|entry| entry.value.clone()),
    )
  }

  async fn put(
    &self,
    key: &str,
    value: String,
    ttl: Duration,
  ) -> anyhow::Result<()> {
    let expires_at = Instant::now() + ttl;
    self.entries.insert(key.to_string(), Entry { value, expires_at });
    Ok(())
  }
}
