use std::{sync::Arc, time::Duration};

use mainframe_model::{PackageStatus, StatusChange};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    clock::Clock,
    config::{ReaperConfig, RetryConfig},
    error::Result,
    events::{StatusEventPublisher, publish_best_effort},
    retry::with_conflict_retry,
    store::LedgerStore,
};

/// Returns packages whose lease ran out to the unscanned pool.
///
/// Allocation already reclaims expired leases lazily; the periodic sweep keeps
/// the ledger's `leased` count honest and emits the reclaim events.
#[derive(Debug)]
pub struct LeaseReaper {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn StatusEventPublisher>,
    config: ReaperConfig,
    retry: RetryConfig,
}

impl LeaseReaper {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn StatusEventPublisher>,
        config: ReaperConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            config,
            retry,
        }
    }

    /// Reclaims every lease expired at the current time, one bounded batch
    /// per transaction, until a short batch comes back.
    #[instrument(skip(self))]
    pub async fn reap_expired(&self) -> Result<usize> {
        let batch_size = self.config.batch_size.max(1);
        let mut total = 0usize;
        loop {
            let now = self.clock.now();
            let store = &self.store;
            let reclaimed = with_conflict_retry(&self.retry, "reap_expired", move || {
                store.reap_expired(now, batch_size)
            })
            .await?;

            let count = reclaimed.len();
            for lease in reclaimed {
                debug!(
                    package = %lease.key,
                    owner = %lease.owner,
                    expired_at = %lease.expired_at,
                    "reclaimed lease {}",
                    lease.token
                );
                publish_best_effort(
                    self.events.as_ref(),
                    StatusChange {
                        package: lease.key,
                        old_status: PackageStatus::Leased,
                        new_status: PackageStatus::Unscanned,
                        findings: None,
                        at: now,
                    },
                )
                .await;
            }

            total += count;
            if count < batch_size as usize {
                break;
            }
        }

        if total > 0 {
            info!(reclaimed = total, "returned expired leases to the pool");
        }
        Ok(total)
    }

    /// Runs [`LeaseReaper::reap_expired`] every `interval_ms` until `shutdown`
    /// fires. Failed sweeps double the wait up to `max_backoff_ms`; the next
    /// successful sweep restores the normal cadence.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let base = self.config.interval();
            let ceiling = Duration::from_millis(self.config.max_backoff_ms).max(base);
            let mut delay = base;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Lease reaper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {
                        match self.reap_expired().await {
                            Ok(_) => delay = base,
                            Err(err) => {
                                delay = delay.saturating_mul(2).min(ceiling);
                                if err.is_transient() {
                                    warn!(next_ms = delay.as_millis() as u64, "lease reaper sweep failed: {err}");
                                } else {
                                    error!(next_ms = delay.as_millis() as u64, "lease reaper sweep failed: {err}");
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use mainframe_model::{LeaseToken, NewPackage, WorkerId};

    use super::*;
    use crate::{
        clock::ManualClock,
        events::NoopStatusEventPublisher,
        store::{ClaimRequest, InMemoryLedgerStore, StoreError},
    };

    async fn leased_store(packages: usize, clock: &ManualClock) -> Arc<InMemoryLedgerStore> {
        let store = Arc::new(InMemoryLedgerStore::new());
        let now = clock.now();
        for i in 0..packages {
            let package = NewPackage::parse(&format!("pkg-{i}"), "1.0", Vec::<String>::new()).unwrap();
            store.insert_package(&package, now).await.unwrap();
            store
                .claim_next(ClaimRequest {
                    owner: WorkerId::new("worker-a").unwrap(),
                    token: LeaseToken::random(),
                    now,
                    expires_at: now + chrono::Duration::seconds(1),
                })
                .await
                .unwrap()
                .unwrap();
        }
        store
    }

    fn reaper(store: Arc<InMemoryLedgerStore>, clock: &ManualClock, batch_size: u32) -> LeaseReaper {
        LeaseReaper::new(
            store,
            Arc::new(clock.clone()),
            Arc::new(NoopStatusEventPublisher),
            ReaperConfig {
                batch_size,
                ..ReaperConfig::default()
            },
            RetryConfig::default(),
        )
    }

    #[tokio::test]
    async fn sweeps_in_batches_until_short_batch() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let store = leased_store(5, &clock).await;
        let reaper = reaper(store.clone(), &clock, 2);

        assert_eq!(reaper.reap_expired().await.unwrap(), 0);

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(reaper.reap_expired().await.unwrap(), 5);
        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.unscanned, 5);
        assert_eq!(counts.active_leases, 0);
        store.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn unavailable_store_is_an_error() {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryLedgerStore::new());
        store.inject_failure(StoreError::Unavailable("connection refused".into()));
        let err = reaper(store, &clock, 10).reap_expired().await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn spawned_reaper_stops_on_cancel() {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryLedgerStore::new());
        let reaper = Arc::new(LeaseReaper::new(
            store,
            Arc::new(clock),
            Arc::new(NoopStatusEventPublisher),
            ReaperConfig {
                interval_ms: 5,
                ..ReaperConfig::default()
            },
            RetryConfig::default(),
        ));
        let shutdown = CancellationToken::new();
        let handle = reaper.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper did not stop")
            .unwrap();
    }
}
