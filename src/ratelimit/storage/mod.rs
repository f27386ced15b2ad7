//! Pluggable counter storage.
//!
//! The limiter only talks to the [`RateLimitStorage`] trait, so the choice
//! between a process-local map and a shared Redis instance is configuration,
//! not code. Only the [`Sweeper`] deletes entries; the request path creates
//! and updates them.
//!
//! The request path goes through [`RateLimitStorage::acquire`], which reads,
//! decides and writes a counter as one atomic step.

mod memory;
mod redis_store;
mod sweeper;

pub use self::memory::InMemoryStorage;
pub use self::redis_store::RedisStorage;
pub use self::sweeper::{sweep_once, Sweeper};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use super::counter::{Admission, ClientRateLimitState};
use crate::error::Result;

/// Key identifying one counter: a client under one rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub client_id: String,
    pub rule: String,
}

impl StorageKey {
    pub fn new(client_id: &str, rule: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            rule: rule.to_string(),
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.rule)
    }
}

/// Persistence for per-client, per-rule counters.
#[async_trait]
pub trait RateLimitStorage: Send + Sync {
    /// Current state of a counter, if one exists.
    async fn get(&self, client_id: &str, rule: &str) -> Result<Option<ClientRateLimitState>>;

    /// Overwrite a counter.
    async fn set(&self, client_id: &str, rule: &str, state: ClientRateLimitState) -> Result<()>;

    /// Atomically add one request to a counter, creating it at `now` if absent.
    ///
    /// Concurrent calls for the same key must each register exactly once.
    async fn increment(
        &self,
        client_id: &str,
        rule: &str,
        now: DateTime<Utc>,
    ) -> Result<ClientRateLimitState>;

    /// Atomically admit one request into a fixed window of `period` holding
    /// at most `limit` requests.
    ///
    /// An absent counter or an expired window starts over at `now` with a
    /// count of 1. Below the limit the count goes up by one. At the limit
    /// nothing is written. No other call can interleave with the decision,
    /// so parallel callers never admit more than `limit` per window.
    async fn acquire(
        &self,
        client_id: &str,
        rule: &str,
        now: DateTime<Utc>,
        period: Duration,
        limit: u64,
    ) -> Result<Admission>;

    /// Remove counters last touched before `cutoff`. Returns how many went.
    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_display() {
        let key = StorageKey::new("ip:10.0.0.1", "auth");
        assert_eq!(key.to_string(), "ip:10.0.0.1:auth");
    }

    #[test]
    fn test_storage_key_equality() {
        assert_eq!(StorageKey::new("user:7", "default"), StorageKey::new("user:7", "default"));
        assert_ne!(StorageKey::new("user:7", "default"), StorageKey::new("user:7", "auth"));
    }
}
