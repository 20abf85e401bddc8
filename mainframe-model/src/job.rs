use url::Url;

use crate::{
    lease::LeaseGrant,
    package::{PackageId, PackageKey},
};

/// Supplementary package metadata fetched while handing out a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Enrichment {
    pub distributions: Vec<Url>,
    pub files: Vec<String>,
}

/// Unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Job {
    pub package_id: PackageId,
    pub package: PackageKey,
    pub lease: LeaseGrant,
    /// Distribution URLs recorded when the package was queued.
    pub distributions: Vec<Url>,
    /// Commit of the rule set the worker is expected to scan with.
    pub rules_commit: Option<String>,
    pub enrichment: Option<Enrichment>,
    /// Set when enrichment was attempted and failed; the worker may retry it.
    pub enrichment_failed: bool,
}
