use std::collections::BTreeSet;

use tracing::warn;

/// The rule set workers are expected to scan with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RulesCatalog {
    commit: Option<String>,
    known: BTreeSet<String>,
}

impl RulesCatalog {
    pub fn new(commit: Option<String>) -> Self {
        Self {
            commit: commit
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty()),
            known: BTreeSet::new(),
        }
    }

    pub fn with_rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known.extend(rules.into_iter().map(Into::into));
        self
    }

    /// Commit hash attached to every job.
    pub fn commit(&self) -> Option<&str> {
        self.commit.as_deref()
    }

    pub fn is_known(&self, rule: &str) -> bool {
        self.known.contains(rule)
    }

    /// Logs rule names outside the deployed set. Unknown rules are still
    /// recorded; a worker may simply run a newer rules commit.
    pub fn audit<'a>(&self, rules: impl IntoIterator<Item = &'a String>) -> usize {
        if self.known.is_empty() {
            return 0;
        }
        let unknown: Vec<&str> = rules
            .into_iter()
            .map(String::as_str)
            .filter(|rule| !self.is_known(rule))
            .collect();
        if !unknown.is_empty() {
            warn!(
                commit = self.commit().unwrap_or("unset"),
                "verdict references unknown rules: {}",
                unknown.join(", ")
            );
        }
        unknown.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_commit_is_treated_as_unset() {
        assert_eq!(RulesCatalog::new(Some("  ".into())).commit(), None);
        assert_eq!(
            RulesCatalog::new(Some(" abc123 ".into())).commit(),
            Some("abc123")
        );
    }

    #[test]
    fn audit_counts_unknown_rules_only_when_catalog_is_populated() {
        let rules = vec!["R1".to_string(), "R9".to_string()];
        assert_eq!(RulesCatalog::default().audit(&rules), 0);

        let catalog = RulesCatalog::new(None).with_rules(["R1", "R2"]);
        assert_eq!(catalog.audit(&rules), 1);
    }
}
