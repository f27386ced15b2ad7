//! In-process counter storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tracing::trace;

use super::{RateLimitStorage, StorageKey};
use crate::error::Result;
use crate::ratelimit::counter::{Admission, ClientRateLimitState};

/// Counters held in a sharded concurrent map.
///
/// Every read-modify-write runs under the shard lock of its key, so parallel
/// increments of one counter are never lost. Counters are visible to this
/// process only.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    counters: DashMap<StorageKey, ClientRateLimitState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl RateLimitStorage for InMemoryStorage {
    async fn get(&self, client_id: &str, rule: &str) -> Result<Option<ClientRateLimitState>> {
        let key = StorageKey::new(client_id, rule);
        Ok(self.counters.get(&key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, client_id: &str, rule: &str, state: ClientRateLimitState) -> Result<()> {
        let key = StorageKey::new(client_id, rule);
        self.counters.insert(key, state);
        Ok(())
    }

    async fn increment(
        &self,
        client_id: &str,
        rule: &str,
        now: DateTime<Utc>,
    ) -> Result<ClientRateLimitState> {
        let key = StorageKey::new(client_id, rule);
        let state = self
            .counters
            .entry(key)
            .and_modify(|state| state.record(now))
            .or_insert_with(|| ClientRateLimitState::first_request(now))
            .value()
            .clone();

        trace!(client = %client_id, rule = %rule, count = state.request_count, "Counter incremented");
        Ok(state)
    }

    async fn acquire(
        &self,
        client_id: &str,
        rule: &str,
        now: DateTime<Utc>,
        period: Duration,
        limit: u64,
    ) -> Result<Admission> {
        let key = StorageKey::new(client_id, rule);

        // The entry holds the shard lock until it is dropped.
        let admission = match self.counters.entry(key) {
            Entry::Occupied(mut entry) => {
                let admitted = entry.get_mut().try_admit(now, period, limit);
                Admission {
                    admitted,
                    state: entry.get().clone(),
                }
            }
            Entry::Vacant(entry) => Admission {
                admitted: true,
                state: entry.insert(ClientRateLimitState::first_request(now)).value().clone(),
            },
        };

        trace!(
            client = %client_id,
            rule = %rule,
            admitted = admission.admitted,
            count = admission.state.request_count,
            "Admission decided"
        );
        Ok(admission)
    }

    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.counters.len();
        self.counters.retain(|_, state| state.last_request_at >= cutoff);
        Ok(before.saturating_sub(self.counters.len()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::storage::contract;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_increment_creates_counter() {
        let storage = InMemoryStorage::new();
        contract::increment_creates_counter(&storage, "ip:1.2.3.4").await;
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_increment_keeps_window_start() {
        contract::increment_keeps_window_start(&InMemoryStorage::new(), "user:1").await;
    }

    #[tokio::test]
    async fn test_rules_have_separate_counters() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();

        storage.increment("user:1", "auth", now).await.unwrap();
        storage.increment("user:1", "auth", now).await.unwrap();
        storage.increment("user:1", "default", now).await.unwrap();

        assert_eq!(storage.get("user:1", "auth").await.unwrap().unwrap().request_count, 2);
        assert_eq!(storage.get("user:1", "default").await.unwrap().unwrap().request_count, 1);
        assert!(storage.get("user:2", "auth").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        contract::set_overwrites(&InMemoryStorage::new(), "user:1").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        contract::parallel_increments_are_not_lost(Arc::new(InMemoryStorage::new()), "ip:9.9.9.9")
            .await;
    }

    #[tokio::test]
    async fn test_acquire_stops_at_limit() {
        contract::acquire_stops_at_limit(&InMemoryStorage::new(), "user:1").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_acquire_after_window_expiry() {
        contract::parallel_acquire_after_expiry(Arc::new(InMemoryStorage::new()), "ip:8.8.8.8")
            .await;
    }

    #[tokio::test]
    async fn test_sweep_removes_only_stale_counters() {
        let storage = InMemoryStorage::new();
        contract::sweep_removes_only_stale(&storage, "ip:1.1.1.1", "ip:2.2.2.2").await;
        assert_eq!(storage.len(), 1);
    }
}
