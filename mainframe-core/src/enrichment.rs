use std::fmt;

use async_trait::async_trait;
use mainframe_model::{Enrichment, PackageKey};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("package index unreachable: {0}")]
    Unreachable(String),

    #[error("package {0} not found in the index")]
    NotFound(String),

    #[error("enrichment failed: {0}")]
    Other(String),
}

/// Fetches supplementary metadata (distribution URLs, file listings) for a
/// package that is about to be handed out.
///
/// Called after the lease is committed. Errors and timeouts only mark the job
/// as `enrichment_failed`; they never undo the allocation.
#[async_trait]
pub trait MetadataEnricher: Send + Sync + fmt::Debug {
    async fn enrich(
        &self,
        package: &PackageKey,
    ) -> Result<Option<Enrichment>, EnrichmentError>;
}

/// Hands out jobs with only the distributions recorded at queue time.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEnrichment;

#[async_trait]
impl MetadataEnricher for NoEnrichment {
    async fn enrich(
        &self,
        _package: &PackageKey,
    ) -> Result<Option<Enrichment>, EnrichmentError> {
        Ok(None)
    }
}
