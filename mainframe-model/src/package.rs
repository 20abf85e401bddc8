use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use url::Url;
use uuid::Uuid;

use crate::{error::ModelError, findings::Findings};

/// Surrogate key of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PackageId(pub Uuid);

impl Default for PackageId {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageId {
    pub fn new() -> Self {
        PackageId(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Natural identity of a scan unit: one released version of one PyPI project.
///
/// Every `(name, version)` pair is scanned independently of the other versions
/// of the same project.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PackageKey {
    pub name: String,
    pub version: String,
}

impl PackageKey {
    /// Builds a key after trimming both parts. Empty parts are rejected.
    pub fn new(
        name: impl AsRef<str>,
        version: impl AsRef<str>,
    ) -> Result<Self, ModelError> {
        let name = name.as_ref().trim();
        let version = version.as_ref().trim();
        if name.is_empty() {
            return Err(ModelError::InvalidPackage(
                "package name must not be empty".into(),
            ));
        }
        if version.is_empty() {
            return Err(ModelError::InvalidPackage(format!(
                "version of {name} must not be empty"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=={}", self.name, self.version)
    }
}

/// Scan status of a ledger entry.
///
/// ```text
/// Unscanned --allocate--> Leased --submit--> Clean | Malicious | Errored
/// Leased --lease expiry--> Unscanned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PackageStatus {
    Unscanned,
    Leased,
    Clean,
    Malicious,
    Errored,
}

impl PackageStatus {
    pub const ALL: [PackageStatus; 5] = [
        PackageStatus::Unscanned,
        PackageStatus::Leased,
        PackageStatus::Clean,
        PackageStatus::Malicious,
        PackageStatus::Errored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Unscanned => "unscanned",
            PackageStatus::Leased => "leased",
            PackageStatus::Clean => "clean",
            PackageStatus::Malicious => "malicious",
            PackageStatus::Errored => "errored",
        }
    }

    /// Terminal statuses never change without an operator re-queue.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PackageStatus::Clean
                | PackageStatus::Malicious
                | PackageStatus::Errored
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: PackageStatus) -> bool {
        match (self, next) {
            (PackageStatus::Unscanned, PackageStatus::Leased) => true,
            // Re-leasing replaces an expired lease in place.
            (PackageStatus::Leased, PackageStatus::Leased) => true,
            (PackageStatus::Leased, PackageStatus::Unscanned) => true,
            (PackageStatus::Leased, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unscanned" => Ok(PackageStatus::Unscanned),
            "leased" => Ok(PackageStatus::Leased),
            "clean" => Ok(PackageStatus::Clean),
            "malicious" => Ok(PackageStatus::Malicious),
            "errored" => Ok(PackageStatus::Errored),
            other => Err(ModelError::InvalidStatus(other.to_string())),
        }
    }
}

/// A row of the package ledger as seen by operators.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Package {
    pub id: PackageId,
    pub key: PackageKey,
    pub status: PackageStatus,
    pub distributions: Vec<Url>,
    pub findings: Option<Findings>,
    pub error_summary: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub finished_by: Option<String>,
}

/// Input for adding a package to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NewPackage {
    pub key: PackageKey,
    pub distributions: Vec<Url>,
}

impl NewPackage {
    /// Parses every distribution URL; the first malformed one is reported.
    pub fn parse<I, S>(
        name: &str,
        version: &str,
        distributions: I,
    ) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let key = PackageKey::new(name, version)?;
        let distributions = distributions
            .into_iter()
            .map(|raw| {
                Url::parse(raw.as_ref()).map_err(|err| {
                    ModelError::InvalidUrl(format!("{}: {err}", raw.as_ref()))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { key, distributions })
    }
}

/// Number of packages per status plus live leases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusCounts {
    pub unscanned: u64,
    pub leased: u64,
    pub clean: u64,
    pub malicious: u64,
    pub errored: u64,
    pub active_leases: u64,
}

impl StatusCounts {
    pub fn record(&mut self, status: PackageStatus, count: u64) {
        match status {
            PackageStatus::Unscanned => self.unscanned += count,
            PackageStatus::Leased => self.leased += count,
            PackageStatus::Clean => self.clean += count,
            PackageStatus::Malicious => self.malicious += count,
            PackageStatus::Errored => self.errored += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.unscanned + self.leased + self.clean + self.malicious + self.errored
    }
}
