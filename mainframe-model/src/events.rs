use chrono::{DateTime, Utc};

use crate::{
    findings::Findings,
    package::{PackageKey, PackageStatus},
};

/// Emitted after a status transition has been committed.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusChange {
    pub package: PackageKey,
    pub old_status: PackageStatus,
    pub new_status: PackageStatus,
    #[cfg_attr(feature = "serde", serde(default))]
    pub findings: Option<Findings>,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    pub fn is_terminal(&self) -> bool {
        self.new_status.is_terminal()
    }
}
