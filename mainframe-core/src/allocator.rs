use std::sync::Arc;

use mainframe_model::{Enrichment, Job, PackageKey};
use tracing::{debug, info, instrument, warn};

use crate::{
    clock::Clock,
    config::{AllocatorConfig, LeaseBounds, LeaseConfig, RetryConfig},
    enrichment::MetadataEnricher,
    error::{CoreError, Result},
    lease::{JobRequest, LeaseTokenGenerator},
    retry::with_conflict_retry,
    rules::RulesCatalog,
    store::{ClaimRequest, LedgerStore},
};

/// Result of asking for work. An empty queue is not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Allocation {
    Job(Box<Job>),
    NoWorkAvailable,
}

impl Allocation {
    pub fn into_job(self) -> Option<Job> {
        match self {
            Allocation::Job(job) => Some(*job),
            Allocation::NoWorkAvailable => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Allocation::NoWorkAvailable)
    }
}

/// Hands the oldest allocatable package to a requesting worker.
///
/// Selection, the transition to `Leased` and lease creation happen in one
/// store transaction; expired leases met on the way are replaced in the same
/// transaction, so allocation never depends on the reaper having run.
#[derive(Debug)]
pub struct JobAllocator {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn LeaseTokenGenerator>,
    enricher: Arc<dyn MetadataEnricher>,
    rules: Arc<RulesCatalog>,
    lease: LeaseConfig,
    config: AllocatorConfig,
    retry: RetryConfig,
}

impl JobAllocator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        tokens: Arc<dyn LeaseTokenGenerator>,
        enricher: Arc<dyn MetadataEnricher>,
        rules: Arc<RulesCatalog>,
        lease: LeaseConfig,
        config: AllocatorConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            tokens,
            enricher,
            rules,
            lease,
            config,
            retry,
        }
    }

    #[instrument(skip(self, request), fields(worker = %request.worker))]
    pub async fn request_job(&self, request: &JobRequest) -> Result<Allocation> {
        let bounds = self.bounds_for(request.job_class.as_deref());
        let resolved = bounds.resolve(request.lease_duration);
        if resolved.clamped {
            debug!(
                requested_ms = request.lease_duration.map(|d| d.as_millis() as u64),
                granted_secs = resolved.duration.num_seconds(),
                "lease duration clamped to configured bounds"
            );
        }

        let now = self.clock.now();
        let Some(expires_at) = now.checked_add_signed(resolved.duration) else {
            return Err(CoreError::InvalidRequest(format!(
                "lease of {}s does not fit the clock",
                resolved.duration.num_seconds()
            )));
        };
        let claim = ClaimRequest {
            owner: request.worker.clone(),
            token: self.tokens.next_token(),
            now,
            expires_at,
        };

        let store = &self.store;
        let claimed = with_conflict_retry(&self.retry, "claim_next", move || {
            store.claim_next(claim.clone())
        })
        .await?;

        let Some(claimed) = claimed else {
            debug!("no work available");
            return Ok(Allocation::NoWorkAvailable);
        };

        if let Some(stale) = &claimed.replaced_lease {
            info!(
                package = %claimed.key,
                previous_owner = %stale.owner,
                expired_at = %stale.expires_at,
                "reclaimed expired lease {} during allocation",
                stale.token
            );
        }

        let (enrichment, enrichment_failed) = self.enrich(&claimed.key).await;

        info!(
            package = %claimed.key,
            lease = %claimed.lease.token,
            expires_at = %claimed.lease.expires_at,
            "leased package"
        );

        Ok(Allocation::Job(Box::new(Job {
            package_id: claimed.package_id,
            package: claimed.key,
            lease: claimed.lease,
            distributions: claimed.distributions,
            rules_commit: self.rules.commit().map(str::to_string),
            enrichment,
            enrichment_failed,
        })))
    }

    /// Allocates up to `batch` jobs, each in its own transaction, stopping at
    /// the first empty answer.
    ///
    /// Jobs already leased are returned even if a later allocation fails; the
    /// failure is logged and the batch cut short.
    #[instrument(skip(self, request), fields(worker = %request.worker))]
    pub async fn request_jobs(
        &self,
        request: &JobRequest,
        batch: usize,
    ) -> Result<Vec<Job>> {
        if batch == 0 {
            return Err(CoreError::InvalidRequest(
                "batch size must be at least 1".into(),
            ));
        }
        let limit = batch.min(self.config.max_batch.max(1));
        if limit < batch {
            debug!(requested = batch, limit, "batch size capped");
        }

        let mut jobs = Vec::with_capacity(limit);
        for _ in 0..limit {
            match self.request_job(request).await {
                Ok(Allocation::Job(job)) => jobs.push(*job),
                Ok(Allocation::NoWorkAvailable) => break,
                Err(err) if !jobs.is_empty() => {
                    warn!(
                        allocated = jobs.len(),
                        "batch allocation cut short: {err}"
                    );
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(jobs)
    }

    fn bounds_for(&self, class: Option<&str>) -> LeaseBounds {
        let Some(class) = class else {
            return self.lease.bounds;
        };
        self.lease.class_bounds(class).unwrap_or_else(|| {
            warn!(class, "unknown job class; using default lease bounds");
            self.lease.bounds
        })
    }

    async fn enrich(&self, package: &PackageKey) -> (Option<Enrichment>, bool) {
        let budget = self.config.enrichment_timeout();
        match tokio::time::timeout(budget, self.enricher.enrich(package)).await {
            Ok(Ok(enrichment)) => (enrichment, false),
            Ok(Err(err)) => {
                warn!(package = %package, "metadata enrichment failed: {err}");
                (None, true)
            }
            Err(_) => {
                warn!(
                    package = %package,
                    timeout_ms = budget.as_millis() as u64,
                    "metadata enrichment timed out"
                );
                (None, true)
            }
        }
    }
}
