use std::sync::Arc;

use mainframe_model::{Job, LeaseToken, Package, StatusCounts, Verdict};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    allocator::{Allocation, JobAllocator},
    clock::{Clock, SystemClock},
    config::MainframeConfig,
    enrichment::{MetadataEnricher, NoEnrichment},
    error::Result,
    events::{NoopStatusEventPublisher, StatusEventPublisher},
    lease::{JobRequest, LeaseTokenGenerator, RandomLeaseTokens},
    ledger::{PackageLedger, QueueOutcome},
    reaper::LeaseReaper,
    reconciler::{ResultReconciler, SubmitOutcome},
    rules::RulesCatalog,
    store::LedgerStore,
};

/// The coordinator: allocation, reconciliation, reaping and ledger access
/// over one shared store.
///
/// Holds no package or lease state of its own; any number of instances may
/// share a store.
#[derive(Debug)]
pub struct Mainframe {
    allocator: JobAllocator,
    reconciler: ResultReconciler,
    reaper: Arc<LeaseReaper>,
    ledger: PackageLedger,
    config: MainframeConfig,
}

impl Mainframe {
    pub fn builder(store: Arc<dyn LedgerStore>) -> MainframeBuilder {
        MainframeBuilder::new(store)
    }

    pub async fn request_job(&self, request: &JobRequest) -> Result<Allocation> {
        self.allocator.request_job(request).await
    }

    pub async fn request_jobs(
        &self,
        request: &JobRequest,
        batch: usize,
    ) -> Result<Vec<Job>> {
        self.allocator.request_jobs(request, batch).await
    }

    pub async fn submit_result(
        &self,
        token: LeaseToken,
        worker: &str,
        verdict: Verdict,
    ) -> Result<SubmitOutcome> {
        self.reconciler.submit_result(token, worker, verdict).await
    }

    pub async fn reap_expired(&self) -> Result<usize> {
        self.reaper.reap_expired().await
    }

    pub async fn queue_package<I, S>(
        &self,
        name: &str,
        version: &str,
        distributions: I,
    ) -> Result<QueueOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ledger.queue_package(name, version, distributions).await
    }

    pub async fn package_status(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<Package>> {
        self.ledger.package_status(name, version).await
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        self.ledger.status_counts().await
    }

    /// Starts the periodic lease sweep; it stops when `shutdown` is cancelled.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        Arc::clone(&self.reaper).spawn(shutdown)
    }

    pub fn config(&self) -> &MainframeConfig {
        &self.config
    }
}

#[derive(Debug)]
pub struct MainframeBuilder {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn LeaseTokenGenerator>,
    enricher: Arc<dyn MetadataEnricher>,
    events: Arc<dyn StatusEventPublisher>,
    rules: RulesCatalog,
    config: MainframeConfig,
}

impl MainframeBuilder {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            tokens: Arc::new(RandomLeaseTokens),
            enricher: Arc::new(NoEnrichment),
            events: Arc::new(NoopStatusEventPublisher),
            rules: RulesCatalog::default(),
            config: MainframeConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_token_generator(
        mut self,
        tokens: Arc<dyn LeaseTokenGenerator>,
    ) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn MetadataEnricher>) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn with_event_publisher(
        mut self,
        events: Arc<dyn StatusEventPublisher>,
    ) -> Self {
        self.events = events;
        self
    }

    pub fn with_rules(mut self, rules: RulesCatalog) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_config(mut self, config: MainframeConfig) -> Self {
        self.config = config;
        self
    }

    /// Normalizes the configuration, logging each repair, and wires the
    /// components.
    pub fn build(self) -> Result<Mainframe> {
        let mut config = self.config;
        for warning in config.normalize()? {
            warn!("config: {warning}");
        }

        let rules = Arc::new(self.rules);
        let allocator = JobAllocator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.tokens,
            self.enricher,
            Arc::clone(&rules),
            config.lease.clone(),
            config.allocator,
            config.retry,
        );
        let reconciler = ResultReconciler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&self.events),
            rules,
            config.reconciler,
            config.retry,
        );
        let reaper = Arc::new(LeaseReaper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.events,
            config.reaper,
            config.retry,
        ));
        let ledger = PackageLedger::new(self.store, self.clock, config.retry);

        Ok(Mainframe {
            allocator,
            reconciler,
            reaper,
            ledger,
            config,
        })
    }
}
