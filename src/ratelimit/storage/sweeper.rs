//! Periodic removal of idle counters.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::RateLimitStorage;
use crate::error::Result;
use crate::ratelimit::clock::{sub_duration, Clock};

/// Delete every counter not touched within `retention` of `now`.
pub async fn sweep_once(
    storage: &dyn RateLimitStorage,
    now: DateTime<Utc>,
    retention: Duration,
) -> Result<usize> {
    let cutoff = sub_duration(now, retention);
    let removed = storage.sweep_expired(cutoff).await?;
    if removed > 0 {
        info!(
            removed,
            backend = storage.backend_name(),
            cutoff = %cutoff,
            "Swept expired rate limit counters"
        );
    }
    Ok(removed)
}

/// Background task that sweeps storage on a fixed interval.
///
/// Sweep failures are logged and retried on the next tick. Dropping the
/// handle stops the task.
pub struct Sweeper {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn spawn(
        storage: Arc<dyn RateLimitStorage>,
        clock: Arc<dyn Clock>,
        every: Duration,
        retention: Duration,
    ) -> Self {
        let (tx, mut rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut rx => {
                        debug!("Counter sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = sweep_once(storage.as_ref(), clock.now(), retention).await {
                            warn!(error = %e, "Counter sweep failed");
                        }
                    }
                }
            }
        });

        info!(interval = ?every, retention = ?retention, "Counter sweeper started");

        Self {
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::storage::InMemoryStorage;

    #[tokio::test]
    async fn test_sweep_once_uses_retention() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        storage
            .increment("ip:1.1.1.1", "default", sub_duration(now, Duration::from_secs(600)))
            .await
            .unwrap();
        storage.increment("ip:2.2.2.2", "default", now).await.unwrap();

        let removed = sweep_once(&storage, now, Duration::from_secs(300)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = ManualClock::default();
        storage.increment("ip:1.1.1.1", "default", clock.now()).await.unwrap();

        let sweeper = Sweeper::spawn(
            storage.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(60),
            Duration::from_secs(120),
        );

        // Counter is still fresh at the first sweep.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(storage.len(), 1);

        clock.advance(Duration::from_secs(180));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(storage.is_empty());

        sweeper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_shutdown() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = ManualClock::default();
        let sweeper = Sweeper::spawn(
            storage.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(10),
            Duration::from_secs(10),
        );
        sweeper.shutdown().await;

        storage.increment("ip:1.1.1.1", "default", clock.now()).await.unwrap();
        clock.advance(Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(storage.len(), 1);
    }
}
