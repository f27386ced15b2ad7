//! In-memory log of rate limit outcomes.
//!
//! Every enforced request is recorded per client. The log is bounded per
//! client and trimmed by age in the background; it feeds the admin API and
//! never influences enforcement.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::ratelimit::clock::{sub_duration, Clock};

/// One enforced request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEvent {
    pub client_id: String,
    pub endpoint: String,
    pub method: String,
    pub rule: String,
    pub timestamp: DateTime<Utc>,
    pub was_limited: bool,
}

/// Request totals for one client over a period.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatistics {
    pub client_id: String,
    pub total_requests: u64,
    pub rate_limited_requests: u64,
    /// Share of requests that were limited, 0 to 100
    pub percentage: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// A client and how often it was limited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitedClient {
    pub client_id: String,
    pub limited_requests: u64,
}

/// Totals across every client over a period.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatistics {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub unique_clients: usize,
    /// Share of requests that were blocked, 0 to 100
    pub block_rate: f64,
    pub requests_by_rule: BTreeMap<String, u64>,
    pub violations_by_rule: BTreeMap<String, u64>,
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Bounded per-client event log.
pub struct MonitoringService {
    events: Mutex<HashMap<String, VecDeque<RateLimitEvent>>>,
    max_events_per_client: usize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MonitoringService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringService")
            .field("clients", &self.events.lock().len())
            .field("max_events_per_client", &self.max_events_per_client)
            .finish()
    }
}

impl MonitoringService {
    pub fn new(max_events_per_client: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            max_events_per_client: max_events_per_client.max(1),
            clock,
        }
    }

    /// Append one outcome, evicting the client's oldest event when full.
    pub fn record_request(
        &self,
        client_id: &str,
        endpoint: &str,
        method: &str,
        rule: &str,
        timestamp: DateTime<Utc>,
        was_limited: bool,
    ) {
        let event = RateLimitEvent {
            client_id: client_id.to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            rule: rule.to_string(),
            timestamp,
            was_limited,
        };

        let mut events = self.events.lock();
        let log = events.entry(client_id.to_string()).or_default();
        if log.len() >= self.max_events_per_client {
            log.pop_front();
        }
        log.push_back(event);
    }

    fn window(&self, period: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self.clock.now();
        (sub_duration(end, period), end)
    }

    /// Totals for one client over the trailing `period`.
    pub fn get_statistics(&self, client_id: &str, period: Duration) -> ClientStatistics {
        let (start, end) = self.window(period);
        let events = self.events.lock();

        let (total, limited) = events
            .get(client_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.timestamp >= start)
                    .fold((0u64, 0u64), |(total, limited), e| {
                        (total + 1, limited + u64::from(e.was_limited))
                    })
            })
            .unwrap_or((0, 0));

        ClientStatistics {
            client_id: client_id.to_string(),
            total_requests: total,
            rate_limited_requests: limited,
            percentage: percentage(limited, total),
            period_start: start,
            period_end: end,
        }
    }

    /// Clients with the most limited requests over the trailing `period`,
    /// most limited first. Clients never limited are left out.
    pub fn get_top_limited_clients(&self, count: usize, period: Duration) -> Vec<LimitedClient> {
        let (start, _) = self.window(period);
        let events = self.events.lock();

        let mut clients: Vec<LimitedClient> = events
            .iter()
            .filter_map(|(client_id, log)| {
                let limited = log
                    .iter()
                    .filter(|e| e.was_limited && e.timestamp >= start)
                    .count() as u64;
                (limited > 0).then(|| LimitedClient {
                    client_id: client_id.clone(),
                    limited_requests: limited,
                })
            })
            .collect();
        drop(events);

        clients.sort_by(|a, b| {
            b.limited_requests
                .cmp(&a.limited_requests)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        clients.truncate(count);
        clients
    }

    /// Totals across every client over the trailing `period`.
    pub fn get_overall_statistics(&self, period: Duration) -> RateLimitStatistics {
        let (start, end) = self.window(period);
        let events = self.events.lock();

        let mut stats = RateLimitStatistics {
            period_start: start,
            period_end: end,
            total_requests: 0,
            blocked_requests: 0,
            unique_clients: 0,
            block_rate: 0.0,
            requests_by_rule: BTreeMap::new(),
            violations_by_rule: BTreeMap::new(),
        };

        for log in events.values() {
            let mut seen = false;
            for event in log.iter().filter(|e| e.timestamp >= start) {
                seen = true;
                stats.total_requests += 1;
                *stats.requests_by_rule.entry(event.rule.clone()).or_default() += 1;
                if event.was_limited {
                    stats.blocked_requests += 1;
                    *stats.violations_by_rule.entry(event.rule.clone()).or_default() += 1;
                }
            }
            stats.unique_clients += usize::from(seen);
        }

        stats.block_rate = percentage(stats.blocked_requests, stats.total_requests);
        stats
    }

    /// Limited requests over the trailing `period`, newest first.
    pub fn recent_violations(&self, period: Duration) -> Vec<RateLimitEvent> {
        let (start, _) = self.window(period);
        let events = self.events.lock();

        let mut violations: Vec<RateLimitEvent> = events
            .values()
            .flat_map(|log| log.iter())
            .filter(|e| e.was_limited && e.timestamp >= start)
            .cloned()
            .collect();
        drop(events);

        violations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        violations
    }

    /// Forget one client. Returns whether it had any history.
    pub fn clear_client(&self, client_id: &str) -> bool {
        self.events.lock().remove(client_id).is_some()
    }

    pub fn clear_all(&self) {
        self.events.lock().clear();
        info!("Rate limit monitoring history cleared");
    }

    /// Drop events older than `cutoff`. Returns how many went.
    pub fn trim(&self, cutoff: DateTime<Utc>) -> usize {
        let mut events = self.events.lock();
        let mut removed = 0;

        events.retain(|_, log| {
            while log.front().is_some_and(|e| e.timestamp < cutoff) {
                log.pop_front();
                removed += 1;
            }
            !log.is_empty()
        });

        removed
    }

    /// Trim the log every `every`, keeping `retention` worth of events.
    pub fn spawn_trimmer(self: &Arc<Self>, every: Duration, retention: Duration) -> Trimmer {
        let monitoring = Arc::clone(self);
        let (tx, mut rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        let cutoff = sub_duration(monitoring.clock.now(), retention);
                        let removed = monitoring.trim(cutoff);
                        if removed > 0 {
                            debug!(removed, "Trimmed rate limit monitoring events");
                        }
                    }
                }
            }
        });

        Trimmer {
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }
}

/// Handle to the background trim task. Dropping it stops the task.
pub struct Trimmer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Trimmer {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Trimmer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
