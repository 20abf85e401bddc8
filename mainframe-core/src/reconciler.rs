use std::sync::Arc;

use chrono::{DateTime, Utc};
use mainframe_model::{
    LeaseToken, PackageKey, PackageStatus, StatusChange, Verdict, WorkerId,
};
use tracing::{info, instrument, warn};

use crate::{
    clock::Clock,
    config::{ReconcilerConfig, RetryConfig},
    error::{CoreError, Result},
    events::{StatusEventPublisher, publish_best_effort},
    retry::with_conflict_retry,
    rules::RulesCatalog,
    store::{FinalizeOutcome, FinalizeRequest, LedgerStore},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub package: PackageKey,
    pub status: PackageStatus,
    pub at: DateTime<Utc>,
}

/// What happened to a submitted verdict.
///
/// Everything except [`SubmitOutcome::Ack`] leaves the ledger untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Ack(Ack),
    /// Unknown token, or one already consumed by an earlier submission or
    /// by the reaper.
    LeaseInvalid,
    LeaseExpired {
        package: PackageKey,
        expired_at: DateTime<Utc>,
        /// How far past expiry the submission arrived.
        overrun: chrono::Duration,
    },
    LeaseOwnerMismatch { package: PackageKey },
}

impl SubmitOutcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, SubmitOutcome::Ack(_))
    }
}

/// Records worker verdicts against the ledger.
#[derive(Debug)]
pub struct ResultReconciler {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn StatusEventPublisher>,
    rules: Arc<RulesCatalog>,
    config: ReconcilerConfig,
    retry: RetryConfig,
}

impl ResultReconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn StatusEventPublisher>,
        rules: Arc<RulesCatalog>,
        config: ReconcilerConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            rules,
            config,
            retry,
        }
    }

    /// Validates the lease and commits the verdict.
    ///
    /// Malformed verdicts and blank worker ids are `Err`; lease problems are
    /// reported through [`SubmitOutcome`].
    #[instrument(skip(self, verdict), fields(lease = %token))]
    pub async fn submit_result(
        &self,
        token: LeaseToken,
        worker: &str,
        verdict: Verdict,
    ) -> Result<SubmitOutcome> {
        let worker = WorkerId::new(worker)?;
        let verdict = self.validate(verdict)?;
        let findings = verdict.findings().cloned();
        if let Some(findings) = &findings {
            self.rules.audit(&findings.rules);
        }

        let now = self.clock.now();
        let request = FinalizeRequest {
            token,
            worker: worker.clone(),
            verdict,
            now,
        };
        let store = &self.store;
        let outcome = with_conflict_retry(&self.retry, "finalize", move || {
            store.finalize(request.clone())
        })
        .await?;

        match outcome {
            FinalizeOutcome::Applied(finalized) => {
                info!(
                    package = %finalized.key,
                    worker = %worker,
                    status = %finalized.new_status,
                    "verdict recorded"
                );
                publish_best_effort(
                    self.events.as_ref(),
                    StatusChange {
                        package: finalized.key.clone(),
                        old_status: finalized.old_status,
                        new_status: finalized.new_status,
                        findings,
                        at: now,
                    },
                )
                .await;
                Ok(SubmitOutcome::Ack(Ack {
                    package: finalized.key,
                    status: finalized.new_status,
                    at: now,
                }))
            }
            FinalizeOutcome::UnknownLease => {
                info!(worker = %worker, "submission for unknown or released lease");
                Ok(SubmitOutcome::LeaseInvalid)
            }
            FinalizeOutcome::Expired { key, expires_at } => {
                let overrun = now - expires_at;
                warn!(
                    package = %key,
                    worker = %worker,
                    overrun_secs = overrun.num_seconds(),
                    "submission arrived after lease expiry"
                );
                Ok(SubmitOutcome::LeaseExpired {
                    package: key,
                    expired_at: expires_at,
                    overrun,
                })
            }
            FinalizeOutcome::OwnerMismatch { key, owner } => {
                warn!(
                    package = %key,
                    worker = %worker,
                    holder = %owner,
                    "submission from a worker that does not hold the lease"
                );
                Ok(SubmitOutcome::LeaseOwnerMismatch { package: key })
            }
        }
    }

    fn validate(&self, verdict: Verdict) -> Result<Verdict> {
        match verdict {
            Verdict::Clean => Ok(Verdict::Clean),
            Verdict::Malicious(findings) => {
                let findings = findings.normalized();
                if findings.rules.is_empty() {
                    return Err(CoreError::InvalidVerdict(
                        "malicious verdict must name at least one rule".into(),
                    ));
                }
                if findings.score < 0 {
                    return Err(CoreError::InvalidVerdict(format!(
                        "score must not be negative, got {}",
                        findings.score
                    )));
                }
                Ok(Verdict::Malicious(findings))
            }
            Verdict::Errored(message) => {
                let message = message.trim();
                if message.is_empty() {
                    return Err(CoreError::InvalidVerdict(
                        "error verdict needs a message".into(),
                    ));
                }
                Ok(Verdict::Errored(truncate_chars(
                    message,
                    self.config.max_error_summary_len,
                )))
            }
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use mainframe_model::Findings;

    use super::*;
    use crate::{
        clock::ManualClock, events::NoopStatusEventPublisher,
        store::InMemoryLedgerStore,
    };

    fn reconciler(max_error_summary_len: usize) -> ResultReconciler {
        ResultReconciler::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(ManualClock::default()),
            Arc::new(NoopStatusEventPublisher),
            Arc::new(RulesCatalog::default()),
            ReconcilerConfig {
                max_error_summary_len,
            },
            RetryConfig::default(),
        )
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn malicious_without_rules_is_rejected() {
        let err = reconciler(64)
            .validate(Verdict::Malicious(Findings::new(["  "], 10)))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidVerdict(_)));
    }

    #[test]
    fn negative_score_is_rejected() {
        let err = reconciler(64)
            .validate(Verdict::Malicious(Findings::new(["R1"], -1)))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidVerdict(_)));
    }

    #[test]
    fn error_messages_are_trimmed_and_truncated() {
        let reconciler = reconciler(5);
        assert!(reconciler.validate(Verdict::Errored("   ".into())).is_err());
        assert_eq!(
            reconciler
                .validate(Verdict::Errored("  download failed ".into()))
                .unwrap(),
            Verdict::Errored("downl".into())
        );
    }

    #[tokio::test]
    async fn blank_worker_is_invalid_request() {
        let err = reconciler(64)
            .submit_result(LeaseToken::random(), " ", Verdict::Clean)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn unknown_token_is_lease_invalid() {
        let outcome = reconciler(64)
            .submit_result(LeaseToken::random(), "worker-a", Verdict::Clean)
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::LeaseInvalid);
    }
}
