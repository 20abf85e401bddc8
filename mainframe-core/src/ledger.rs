use std::sync::Arc;

use mainframe_model::{
    NewPackage, Package, PackageId, PackageKey, PackageStatus, StatusCounts,
};
use tracing::{debug, info, instrument};

use crate::{
    clock::Clock,
    config::RetryConfig,
    error::Result,
    retry::with_conflict_retry,
    store::{InsertOutcome, LedgerStore},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued(PackageId),
    /// The version was already in the ledger and was left untouched.
    AlreadyKnown(PackageStatus),
}

/// Intake and read paths of the package ledger.
#[derive(Debug)]
pub struct PackageLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
}

impl PackageLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    /// Adds an unscanned package. Queueing a known `(name, version)` again is
    /// a no-op that reports the current status.
    #[instrument(skip(self, distributions))]
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
        let package = NewPackage::parse(name, version, distributions)?;
        let now = self.clock.now();
        let store = &self.store;
        let package_ref = &package;
        let outcome = with_conflict_retry(&self.retry, "insert_package", move || {
            store.insert_package(package_ref, now)
        })
        .await?;

        match outcome {
            InsertOutcome::Inserted(id) => {
                info!(package = %package.key, "queued package");
                Ok(QueueOutcome::Queued(id))
            }
            InsertOutcome::Existing { status, .. } => {
                debug!(package = %package.key, %status, "package already known");
                Ok(QueueOutcome::AlreadyKnown(status))
            }
        }
    }

    pub async fn package_status(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<Package>> {
        let key = PackageKey::new(name, version)?;
        Ok(self.store.package(&key).await?)
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        Ok(self.store.status_counts().await?)
    }
}
