//! Job allocation, lease lifecycle and result reconciliation for distributed
//! package scanning.
//!
//! Workers ask a [`Mainframe`] for jobs, scan the leased package and report a
//! [`Verdict`](mainframe_model::Verdict) with their lease token. The ledger and
//! lease overlay live behind [`store::LedgerStore`]; Postgres is the production
//! backend and [`store::InMemoryLedgerStore`] serves tests and development.
#![allow(missing_docs)]

pub mod allocator;
pub mod clock;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod events;
pub mod lease;
pub mod ledger;
pub mod mainframe;
pub mod reaper;
pub mod reconciler;
pub mod retry;
pub mod rules;
pub mod store;

pub use allocator::{Allocation, JobAllocator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AllocatorConfig, LeaseBounds, LeaseConfig, MAX_LEASE_SECS, MainframeConfig,
    ReaperConfig, ReconcilerConfig, RetryConfig,
};
pub use enrichment::{EnrichmentError, MetadataEnricher, NoEnrichment};
pub use error::{CoreError, Result};
pub use events::{
    InProcStatusEventBus, NoopStatusEventPublisher, StatusEventPublisher,
};
pub use lease::{JobRequest, LeaseTokenGenerator, RandomLeaseTokens};
pub use ledger::{PackageLedger, QueueOutcome};
pub use mainframe::{Mainframe, MainframeBuilder};
pub use reaper::LeaseReaper;
pub use reconciler::{Ack, ResultReconciler, SubmitOutcome};
pub use rules::RulesCatalog;
pub use store::{InMemoryLedgerStore, LedgerStore, StoreError};
#[cfg(feature = "postgres")]
pub use store::PostgresLedgerStore;

/// Embedded schema migrations for the Postgres ledger.
#[cfg(feature = "postgres")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
