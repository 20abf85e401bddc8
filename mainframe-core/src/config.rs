use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Global knobs that tune the coordinator.
///
/// All fields carry defaults so deployments can override only what they need.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MainframeConfig {
    /// Lease durations, globally and per job class.
    pub lease: LeaseConfig,
    /// Batch limits and enrichment budget for job allocation.
    pub allocator: AllocatorConfig,
    /// Verdict validation limits.
    pub reconciler: ReconcilerConfig,
    /// Cadence and batch size of the expired-lease sweep.
    pub reaper: ReaperConfig,
    /// Bounded retry policy for transient store conflicts.
    pub retry: RetryConfig,
}

impl MainframeConfig {
    /// Checks internal consistency, repairing what can be repaired.
    ///
    /// Returns human readable warnings for every repair; inconsistent bounds
    /// that cannot be repaired are an error.
    pub fn normalize(&mut self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        self.lease.bounds.normalize("default", &mut warnings)?;
        for (class, bounds) in self.lease.classes.iter_mut() {
            bounds.normalize(class, &mut warnings)?;
        }
        if self.allocator.max_batch == 0 {
            warnings.push("allocator.max_batch was 0; using 1".into());
            self.allocator.max_batch = 1;
        }
        if self.reaper.batch_size == 0 {
            warnings.push("reaper.batch_size was 0; using 1".into());
            self.reaper.batch_size = 1;
        }
        if self.reaper.max_backoff_ms < self.reaper.interval_ms {
            warnings.push(format!(
                "reaper.max_backoff_ms ({}) below interval; using {}",
                self.reaper.max_backoff_ms, self.reaper.interval_ms
            ));
            self.reaper.max_backoff_ms = self.reaper.interval_ms;
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts was 0; using 1".into());
            self.retry.max_attempts = 1;
        }
        Ok(warnings)
    }
}

/// Upper limit for any configured lease bound (7 days).
pub const MAX_LEASE_SECS: u64 = 7 * 24 * 60 * 60;

/// Lease duration limits in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseBounds {
    /// Used when the worker does not ask for a specific duration.
    pub default_secs: u64,
    /// Shorter leases guarantee reaping thrash.
    pub min_secs: u64,
    /// Longer leases leave abandoned jobs stuck for too long.
    pub max_secs: u64,
}

impl Default for LeaseBounds {
    fn default() -> Self {
        Self {
            default_secs: 120,
            min_secs: 1,
            max_secs: 6 * 60 * 60,
        }
    }
}

/// Outcome of fitting a requested duration into [`LeaseBounds`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedLease {
    pub duration: chrono::Duration,
    /// The requested duration fell outside the bounds.
    pub clamped: bool,
}

impl LeaseBounds {
    pub fn resolve(&self, requested: Option<Duration>) -> ResolvedLease {
        let Some(requested) = requested else {
            return ResolvedLease {
                duration: secs(self.default_secs),
                clamped: false,
            };
        };

        let min = Duration::from_secs(self.min_secs);
        let max = Duration::from_secs(self.max_secs);
        let fitted = requested.max(min).min(max);
        ResolvedLease {
            duration: chrono::Duration::from_std(fitted)
                .unwrap_or_else(|_| secs(self.max_secs)),
            clamped: fitted != requested,
        }
    }

    fn normalize(&mut self, label: &str, warnings: &mut Vec<String>) -> Result<()> {
        if self.min_secs == 0 {
            warnings.push(format!("lease bounds `{label}`: min_secs 0 raised to 1"));
            self.min_secs = 1;
        }
        if self.max_secs > MAX_LEASE_SECS {
            warnings.push(format!(
                "lease bounds `{label}`: max_secs {} lowered to {MAX_LEASE_SECS}",
                self.max_secs
            ));
            self.max_secs = MAX_LEASE_SECS;
        }
        if self.min_secs > self.max_secs {
            return Err(CoreError::InvalidRequest(format!(
                "lease bounds `{label}`: min_secs {} exceeds max_secs {}",
                self.min_secs, self.max_secs
            )));
        }
        let clamped = self.default_secs.clamp(self.min_secs, self.max_secs);
        if clamped != self.default_secs {
            warnings.push(format!(
                "lease bounds `{label}`: default_secs {} outside [{}, {}]; using {clamped}",
                self.default_secs, self.min_secs, self.max_secs
            ));
            self.default_secs = clamped;
        }
        Ok(())
    }
}

fn secs(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Lease defaults plus per job class overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    #[serde(flatten)]
    pub bounds: LeaseBounds,
    /// Named classes of work with their own bounds (e.g. `large` for
    /// packages with huge distributions).
    pub classes: HashMap<String, LeaseBounds>,
}

impl LeaseConfig {
    /// Bounds for `class`; `None` when the class is unknown.
    pub fn class_bounds(&self, class: &str) -> Option<LeaseBounds> {
        self.classes.get(class).copied()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Upper bound on jobs handed out by one batch request.
    pub max_batch: usize,
    /// Budget for the metadata enrichment call (ms).
    pub enrichment_timeout_ms: u64,
}

impl AllocatorConfig {
    pub fn enrichment_timeout(&self) -> Duration {
        Duration::from_millis(self.enrichment_timeout_ms)
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_batch: 50,
            enrichment_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Error summaries longer than this many characters are truncated.
    pub max_error_summary_len: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_error_summary_len: 4_096,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Sweep cadence (ms).
    pub interval_ms: u64,
    /// Leases reclaimed per transaction.
    pub batch_size: u32,
    /// Ceiling for the sweep interval while the store is unavailable (ms).
    pub max_backoff_ms: u64,
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            batch_size: 500,
            max_backoff_ms: 5 * 60 * 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out competing retries.
    pub jitter_ratio: f32,
}

impl RetryConfig {
    /// Exponential delay before retry number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u16) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = u32::from(attempt.saturating_sub(1)).min(20);
        let scaled = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(scaled.min(self.backoff_max_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 10,
            backoff_max_ms: 500,
            jitter_ratio: 0.25,
        }
    }
}
