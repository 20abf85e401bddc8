use url::Url;

use crate::package::PackageStatus;

/// A file inside a distribution that matched one or more rules.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SuspiciousFile {
    pub path: String,
    pub rules: Vec<String>,
}

/// What a worker found in a malicious package.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Findings {
    /// Names of the matched rules. Kept sorted and free of duplicates once
    /// [`Findings::normalized`] ran.
    pub rules: Vec<String>,
    pub score: i32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub inspector_url: Option<Url>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub files: Vec<SuspiciousFile>,
}

impl Findings {
    pub fn new(rules: impl IntoIterator<Item = impl Into<String>>, score: i32) -> Self {
        Self {
            rules: rules.into_iter().map(Into::into).collect(),
            score,
            inspector_url: None,
            files: Vec::new(),
        }
    }

    pub fn with_inspector_url(mut self, url: Url) -> Self {
        self.inspector_url = Some(url);
        self
    }

    pub fn with_file(mut self, file: SuspiciousFile) -> Self {
        self.files.push(file);
        self
    }

    /// Trims rule names, drops blanks, sorts and de-duplicates.
    pub fn normalized(mut self) -> Self {
        let mut rules: Vec<String> = self
            .rules
            .iter()
            .map(|rule| rule.trim().to_string())
            .filter(|rule| !rule.is_empty())
            .collect();
        rules.sort();
        rules.dedup();
        self.rules = rules;
        self
    }
}

/// A worker's terminal classification of a scanned package.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "verdict", content = "detail", rename_all = "snake_case")
)]
pub enum Verdict {
    Clean,
    Malicious(Findings),
    Errored(String),
}

impl Verdict {
    /// The terminal status this verdict lands the package in.
    pub fn status(&self) -> PackageStatus {
        match self {
            Verdict::Clean => PackageStatus::Clean,
            Verdict::Malicious(_) => PackageStatus::Malicious,
            Verdict::Errored(_) => PackageStatus::Errored,
        }
    }

    pub fn findings(&self) -> Option<&Findings> {
        match self {
            Verdict::Malicious(findings) => Some(findings),
            _ => None,
        }
    }

    pub fn error_summary(&self) -> Option<&str> {
        match self {
            Verdict::Errored(message) => Some(message),
            _ => None,
        }
    }
}
