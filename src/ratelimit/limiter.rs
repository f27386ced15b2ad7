//! Core rate limiter implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::backend::RateLimitBackend;
use super::clock::Clock;
use super::counter::{ClientRateLimitState, RateLimitResult};
use super::identity::{identify_client, ClientIdentity, RequestMeta};
use super::rules::{RateLimitRule, RuleConfig, RuleSet};
use super::storage::RateLimitStorage;
use crate::config::{RateLimitOptions, DEFAULT_CLIENT_ID_HEADER, DEFAULT_STORAGE_TIMEOUT};
use crate::error::{RateLimitError, Result};

/// Fixed-window rate limiter over pluggable storage.
///
/// This struct is thread-safe and can be shared across multiple tasks.
/// Storage failures never reject a request: the check fails open and the
/// result is marked degraded.
pub struct RateLimitService {
    rules: RwLock<RuleSet>,
    storage: Arc<dyn RateLimitStorage>,
    clock: Arc<dyn Clock>,
    storage_timeout: Duration,
    client_id_header: String,
}

impl std::fmt::Debug for RateLimitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitService")
            .field("rules", &self.rules.read().len())
            .field("storage", &self.storage.backend_name())
            .field("storage_timeout", &self.storage_timeout)
            .finish()
    }
}

impl RateLimitService {
    pub fn new(rules: RuleSet, storage: Arc<dyn RateLimitStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rules: RwLock::new(rules),
            storage,
            clock,
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
            client_id_header: DEFAULT_CLIENT_ID_HEADER.to_string(),
        }
    }

    /// Build a service from validated options.
    pub fn from_options(
        options: &RateLimitOptions,
        storage: Arc<dyn RateLimitStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let rules = RuleSet::from_config(&options.rules, &options.default_rule)?;
        info!(
            rules = rules.len(),
            default_rule = %rules.default_rule(),
            storage = storage.backend_name(),
            "Rate limiter initialized"
        );

        Ok(Self::new(rules, storage, clock)
            .with_storage_timeout(options.storage_timeout)
            .with_client_id_header(&options.client_id_header))
    }

    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    pub fn with_client_id_header(mut self, header: &str) -> Self {
        self.client_id_header = header.to_string();
        self
    }

    pub fn storage(&self) -> &Arc<dyn RateLimitStorage> {
        &self.storage
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Name of the rule that governs the given request.
    pub fn resolve_rule(&self, path: &str, method: &str) -> String {
        self.rules.read().resolve_name(path, method).to_string()
    }

    /// Snapshot of the active rules.
    pub fn rules(&self) -> RuleSet {
        self.rules.read().clone()
    }

    /// Add or replace a rule at runtime.
    pub fn upsert_rule(&self, name: &str, config: RuleConfig) -> Result<RateLimitRule> {
        let rule = RateLimitRule::new(name, config)?;
        self.rules.write().upsert(rule.clone());
        info!(rule = %rule.name, limit = rule.limit, period = ?rule.period, "Rate limit rule updated");
        Ok(rule)
    }

    /// Zero every counter a client holds, under every rule.
    pub async fn reset_client(&self, client: &str) -> Result<()> {
        let now = self.clock.now();
        let names: Vec<String> = self.rules.read().iter().map(|r| r.name.clone()).collect();

        for name in names {
            self.bounded(self.storage.set(client, &name, ClientRateLimitState::empty(now)))
                .await?;
        }
        info!(client = %client, "Rate limit counters reset");
        Ok(())
    }

    /// Check the rate limit for a client hitting an endpoint.
    ///
    /// Each allowed call counts exactly one request; denied calls leave the
    /// counter untouched.
    pub async fn check_rate_limit(
        &self,
        client: &str,
        endpoint: &str,
        method: &str,
    ) -> Result<RateLimitResult> {
        let rule = self.rules.read().resolve(endpoint, method)?.clone();
        let now = self.clock.now();

        trace!(
            client = %client,
            endpoint = %endpoint,
            method = %method,
            rule = %rule.name,
            "Checking rate limit"
        );

        match self.evaluate(client, &rule, now).await {
            Ok(result) => {
                if !result.allowed {
                    debug!(client = %client, rule = %rule.name, "Rate limit exceeded");
                }
                Ok(result)
            }
            Err(e) if e.is_storage_failure() => {
                warn!(
                    client = %client,
                    rule = %rule.name,
                    error = %e,
                    "Rate limit storage unavailable, allowing request"
                );
                Ok(RateLimitResult::fail_open(&rule.name, rule.limit, now))
            }
            Err(e) => Err(e),
        }
    }

    async fn evaluate(
        &self,
        client: &str,
        rule: &RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult> {
        let admission = self
            .bounded(self.storage.acquire(client, &rule.name, now, rule.period, rule.limit))
            .await?;

        let result = if admission.admitted {
            RateLimitResult::allowed(&rule.name, rule.limit, rule.period, &admission.state)
        } else {
            RateLimitResult::denied(&rule.name, rule.limit, rule.period, &admission.state, now)
        };
        Ok(result)
    }

    /// Run a storage call under the storage timeout.
    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.storage_timeout, op)
            .await
            .map_err(|_| RateLimitError::StorageTimeout(self.storage_timeout))?
    }
}

#[async_trait]
impl RateLimitBackend for RateLimitService {
    async fn check_rate_limit(
        &self,
        client: &str,
        endpoint: &str,
        method: &str,
    ) -> Result<RateLimitResult> {
        RateLimitService::check_rate_limit(self, client, endpoint, method).await
    }

    fn identify(&self, meta: &RequestMeta<'_>) -> ClientIdentity {
        identify_client(meta, &self.client_id_header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::counter::Admission;
    use crate::ratelimit::storage::InMemoryStorage;
    use indexmap::IndexMap;
    use tokio_test::assert_ok;

    fn minute() -> Duration {
        Duration::from_secs(60)
    }

    fn rule_set(limit: u64) -> RuleSet {
        let mut rules = IndexMap::new();
        rules.insert(
            "auth".to_string(),
            RuleConfig::new(limit, minute()).with_endpoints(["/api/v1/auth"]),
        );
        rules.insert("default".to_string(), RuleConfig::new(1000, minute()));
        RuleSet::from_config(&rules, "default").unwrap()
    }

    fn service(limit: u64) -> (RateLimitService, Arc<InMemoryStorage>, ManualClock) {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = ManualClock::default();
        let service = RateLimitService::new(rule_set(limit), storage.clone(), Arc::new(clock.clone()));
        (service, storage, clock)
    }

    struct FailingStorage;

    #[async_trait]
    impl RateLimitStorage for FailingStorage {
        async fn get(&self, _: &str, _: &str) -> Result<Option<ClientRateLimitState>> {
            Err(RateLimitError::Storage("connection refused".to_string()))
        }
        async fn set(&self, _: &str, _: &str, _: ClientRateLimitState) -> Result<()> {
            Err(RateLimitError::Storage("connection refused".to_string()))
        }
        async fn increment(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<ClientRateLimitState> {
            Err(RateLimitError::Storage("connection refused".to_string()))
        }
        async fn acquire(&self, _: &str, _: &str, _: DateTime<Utc>, _: Duration, _: u64) -> Result<Admission> {
            Err(RateLimitError::Storage("connection refused".to_string()))
        }
        async fn sweep_expired(&self, _: DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    struct SlowStorage;

    #[async_trait]
    impl RateLimitStorage for SlowStorage {
        async fn get(&self, _: &str, _: &str) -> Result<Option<ClientRateLimitState>> {
            Ok(None)
        }
        async fn set(&self, _: &str, _: &str, _: ClientRateLimitState) -> Result<()> {
            Ok(())
        }
        async fn increment(&self, _: &str, _: &str, now: DateTime<Utc>) -> Result<ClientRateLimitState> {
            Ok(ClientRateLimitState::first_request(now))
        }
        async fn acquire(&self, _: &str, _: &str, now: DateTime<Utc>, _: Duration, _: u64) -> Result<Admission> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Admission {
                admitted: true,
                state: ClientRateLimitState::first_request(now),
            })
        }
        async fn sweep_expired(&self, _: DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
        fn backend_name(&self) -> &'static str {
            "slow"
        }
    }

    /// In-memory counters behind a simulated network round-trip.
    struct RemoteStorage(InMemoryStorage);

    #[async_trait]
    impl RateLimitStorage for RemoteStorage {
        async fn get(&self, client: &str, rule: &str) -> Result<Option<ClientRateLimitState>> {
            tokio::task::yield_now().await;
            self.0.get(client, rule).await
        }
        async fn set(&self, client: &str, rule: &str, state: ClientRateLimitState) -> Result<()> {
            tokio::task::yield_now().await;
            self.0.set(client, rule, state).await
        }
        async fn increment(&self, client: &str, rule: &str, now: DateTime<Utc>) -> Result<ClientRateLimitState> {
            tokio::task::yield_now().await;
            self.0.increment(client, rule, now).await
        }
        async fn acquire(
            &self,
            client: &str,
            rule: &str,
            now: DateTime<Utc>,
            period: Duration,
            limit: u64,
        ) -> Result<Admission> {
            tokio::task::yield_now().await;
            self.0.acquire(client, rule, now, period, limit).await
        }
        async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
            self.0.sweep_expired(cutoff).await
        }
        fn backend_name(&self) -> &'static str {
            "remote"
        }
    }

    fn remote_service(limit: u64) -> (Arc<RateLimitService>, Arc<RemoteStorage>, ManualClock) {
        let storage = Arc::new(RemoteStorage(InMemoryStorage::new()));
        let clock = ManualClock::default();
        let service = RateLimitService::new(rule_set(limit), storage.clone(), Arc::new(clock.clone()));
        (Arc::new(service), storage, clock)
    }

    async fn parallel_checks(service: &RateLimitService, client: &str, n: usize) -> usize {
        let checks = (0..n).map(|_| service.check_rate_limit(client, "/api/v1/auth", "POST"));
        futures::future::join_all(checks)
            .await
            .into_iter()
            .filter(|result| result.as_ref().unwrap().allowed)
            .count()
    }

    #[tokio::test]
    async fn test_parallel_checks_after_window_expiry_respect_limit() {
        let (service, storage, clock) = remote_service(10);

        assert!(service.check_rate_limit("user:1", "/api/v1/auth", "POST").await.unwrap().allowed);
        clock.advance(minute());

        assert_eq!(parallel_checks(&service, "user:1", 15).await, 10);
        let state = storage.get("user:1", "auth").await.unwrap().unwrap();
        assert_eq!(state.request_count, 10);
        assert_eq!(state.window_start, clock.now());
    }

    #[tokio::test]
    async fn test_parallel_checks_near_limit_do_not_overshoot() {
        let (service, storage, _) = remote_service(10);

        for _ in 0..9 {
            service.check_rate_limit("user:1", "/api/v1/auth", "POST").await.unwrap();
        }

        assert_eq!(parallel_checks(&service, "user:1", 5).await, 1);
        let state = storage.get("user:1", "auth").await.unwrap().unwrap();
        assert_eq!(state.request_count, 10);
    }

    #[tokio::test]
    async fn test_requests_up_to_limit_are_allowed() {
        let (service, _, _) = service(10);

        for expected_remaining in (0..10).rev() {
            let result = service
                .check_rate_limit("ip:1.2.3.4", "/api/v1/auth/login", "POST")
                .await
                .unwrap();
            assert!(result.allowed);
            assert_eq!(result.rule, "auth");
            assert_eq!(result.remaining, expected_remaining);
        }

        let result = service
            .check_rate_limit("ip:1.2.3.4", "/api/v1/auth/login", "POST")
            .await
            .unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert!(result.retry_after > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_denied_requests_do_not_increment() {
        let (service, storage, _) = service(2);

        for _ in 0..6 {
            service
                .check_rate_limit("user:1", "/api/v1/auth/token", "POST")
                .await
                .unwrap();
        }

        let state = storage.get("user:1", "auth").await.unwrap().unwrap();
        assert_eq!(state.request_count, 2);
    }

    #[tokio::test]
    async fn test_window_resets_after_period() {
        let (service, storage, clock) = service(1);

        let first = service.check_rate_limit("user:1", "/api/v1/auth", "POST").await.unwrap();
        assert!(first.allowed);
        let second = service.check_rate_limit("user:1", "/api/v1/auth", "POST").await.unwrap();
        assert!(!second.allowed);

        clock.advance(minute());
        let third = service.check_rate_limit("user:1", "/api/v1/auth", "POST").await.unwrap();
        assert!(third.allowed);
        assert_eq!(third.reset_time, crate::ratelimit::clock::add_duration(clock.now(), minute()));

        let state = storage.get("user:1", "auth").await.unwrap().unwrap();
        assert_eq!(state.request_count, 1);
        assert_eq!(state.window_start, clock.now());
    }

    #[tokio::test]
    async fn test_retry_after_counts_down_to_window_end() {
        let (service, _, clock) = service(1);
        let start = clock.now();

        service.check_rate_limit("user:1", "/api/v1/auth", "POST").await.unwrap();
        clock.advance(Duration::from_secs(20));
        let denied = service.check_rate_limit("user:1", "/api/v1/auth", "POST").await.unwrap();

        assert_eq!(denied.retry_after, Duration::from_secs(40));
        assert_eq!(denied.reset_time, crate::ratelimit::clock::add_duration(start, minute()));
    }

    #[tokio::test]
    async fn test_clients_are_counted_separately() {
        let (service, _, _) = service(1);

        assert!(service.check_rate_limit("ip:1.1.1.1", "/api/v1/auth", "POST").await.unwrap().allowed);
        assert!(service.check_rate_limit("ip:2.2.2.2", "/api/v1/auth", "POST").await.unwrap().allowed);
        assert!(!service.check_rate_limit("ip:1.1.1.1", "/api/v1/auth", "POST").await.unwrap().allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_checks_are_all_counted() {
        let (service, storage, _) = service(100);
        let service = Arc::new(service);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    service.check_rate_limit("ip:7.7.7.7", "/api/v1/auth", "POST").await
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            assert!(task.unwrap().unwrap().allowed);
        }

        let state = storage.get("ip:7.7.7.7", "auth").await.unwrap().unwrap();
        assert_eq!(state.request_count, 50);
    }

    #[tokio::test]
    async fn test_storage_failure_fails_open() {
        let service = RateLimitService::new(
            rule_set(1),
            Arc::new(FailingStorage),
            Arc::new(ManualClock::default()),
        );

        for _ in 0..3 {
            let result = assert_ok!(service.check_rate_limit("user:1", "/api/v1/auth", "POST").await);
            assert!(result.allowed);
            assert!(result.degraded);
            assert_eq!(result.rule, "auth");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_timeout_fails_open() {
        let service = RateLimitService::new(
            rule_set(1),
            Arc::new(SlowStorage),
            Arc::new(ManualClock::default()),
        )
        .with_storage_timeout(Duration::from_millis(50));

        let result = assert_ok!(service.check_rate_limit("user:1", "/api/v1/projects", "GET").await);
        assert!(result.allowed);
        assert!(result.degraded);
        assert_eq!(result.rule, "default");
    }

    #[tokio::test]
    async fn test_reset_client_clears_quota() {
        let (service, _, _) = service(1);

        service.check_rate_limit("user:1", "/api/v1/auth", "POST").await.unwrap();
        assert!(!service.check_rate_limit("user:1", "/api/v1/auth", "POST").await.unwrap().allowed);

        service.reset_client("user:1").await.unwrap();
        let result = service.check_rate_limit("user:1", "/api/v1/auth", "POST").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_upsert_rule_applies_immediately() {
        let (service, _, _) = service(1);

        service
            .upsert_rule("auth", RuleConfig::new(3, minute()).with_endpoints(["/api/v1/auth"]))
            .unwrap();
        for _ in 0..3 {
            assert!(service.check_rate_limit("user:1", "/api/v1/auth", "POST").await.unwrap().allowed);
        }
        assert!(!service.check_rate_limit("user:1", "/api/v1/auth", "POST").await.unwrap().allowed);

        assert!(service.upsert_rule("auth", RuleConfig::new(0, minute())).is_err());
        assert_eq!(service.rules().get("auth").unwrap().limit, 3);
    }

    #[test]
    fn test_defaults_match_options() {
        let (service, _, _) = service(1);
        let options = RateLimitOptions::default();
        assert_eq!(service.storage_timeout, options.storage_timeout);
        assert_eq!(service.client_id_header, options.client_id_header);
    }

    #[test]
    fn test_resolve_rule() {
        let (service, _, _) = service(1);
        assert_eq!(service.resolve_rule("/api/v1/auth/login", "POST"), "auth");
        assert_eq!(service.resolve_rule("/api/v1/projects", "GET"), "default");
    }
}
