//! Core data model definitions shared across mainframe crates.
#![allow(missing_docs)]

pub mod error;
pub mod events;
pub mod findings;
pub mod job;
pub mod lease;
pub mod package;

pub use error::{ModelError, Result as ModelResult};
pub use events::StatusChange;
pub use findings::{Findings, SuspiciousFile, Verdict};
pub use job::{Enrichment, Job};
pub use lease::{LeaseGrant, LeaseToken, WorkerId};
pub use package::{
    NewPackage, Package, PackageId, PackageKey, PackageStatus, StatusCounts,
};
