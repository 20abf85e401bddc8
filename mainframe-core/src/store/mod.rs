//! Transactional storage contract for the package ledger and lease overlay.
//!
//! Every method is one atomic transaction in the backing store. The core never
//! caches ledger or lease state between calls; each decision is re-read under
//! the store's own isolation and row locks.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mainframe_model::{
    LeaseGrant, LeaseToken, NewPackage, Package, PackageId, PackageKey,
    PackageStatus, StatusCounts, Verdict, WorkerId,
};
use thiserror::Error;
use url::Url;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryLedgerStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLedgerStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Serialization failure, deadlock or lock timeout. Safe to retry.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    /// A row could not be decoded or breaks a ledger invariant.
    #[error("corrupt ledger data: {0}")]
    Corrupt(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Input for [`LedgerStore::claim_next`].
#[derive(Clone, Debug)]
pub struct ClaimRequest {
    pub owner: WorkerId,
    pub token: LeaseToken,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Lease that was still attached to a package when it was reclaimed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaleLease {
    pub token: LeaseToken,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// A package that has just been moved to `Leased` for a worker.
#[derive(Clone, Debug)]
pub struct ClaimedPackage {
    pub package_id: PackageId,
    pub key: PackageKey,
    pub distributions: Vec<Url>,
    pub previous_status: PackageStatus,
    /// Set when the package was picked up from an expired lease.
    pub replaced_lease: Option<StaleLease>,
    pub lease: LeaseGrant,
}

/// Input for [`LedgerStore::finalize`]. The verdict is already validated.
#[derive(Clone, Debug)]
pub struct FinalizeRequest {
    pub token: LeaseToken,
    pub worker: WorkerId,
    pub verdict: Verdict,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finalized {
    pub package_id: PackageId,
    pub key: PackageKey,
    pub old_status: PackageStatus,
    pub new_status: PackageStatus,
}

/// Result of validating and consuming a lease.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Applied(Finalized),
    /// No lease with that token exists (never issued, consumed, or reaped).
    UnknownLease,
    Expired {
        key: PackageKey,
        expires_at: DateTime<Utc>,
    },
    OwnerMismatch {
        key: PackageKey,
        owner: String,
    },
}

/// A lease removed by the reaper; its package is `Unscanned` again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReclaimedLease {
    pub package_id: PackageId,
    pub key: PackageKey,
    pub token: LeaseToken,
    pub owner: String,
    pub expired_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(PackageId),
    Existing {
        package_id: PackageId,
        status: PackageStatus,
    },
}

/// Durable ledger plus lease overlay.
#[async_trait]
pub trait LedgerStore: Send + Sync + fmt::Debug {
    /// Picks the oldest allocatable package (unscanned, or leased with an
    /// expired or missing lease), skipping rows locked by concurrent callers,
    /// and leases it to `claim.owner`.
    async fn claim_next(
        &self,
        claim: ClaimRequest,
    ) -> StoreResult<Option<ClaimedPackage>>;

    /// Validates the lease and, when valid, records the terminal verdict and
    /// deletes the lease.
    async fn finalize(
        &self,
        request: FinalizeRequest,
    ) -> StoreResult<FinalizeOutcome>;

    /// Returns at most `limit` packages with leases expired at `now` to the
    /// unscanned pool.
    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<ReclaimedLease>>;

    async fn insert_package(
        &self,
        package: &NewPackage,
        now: DateTime<Utc>,
    ) -> StoreResult<InsertOutcome>;

    async fn package(&self, key: &PackageKey) -> StoreResult<Option<Package>>;

    async fn active_lease(
        &self,
        key: &PackageKey,
    ) -> StoreResult<Option<LeaseGrant>>;

    async fn status_counts(&self) -> StoreResult<StatusCounts>;
}
