//! Process-local ledger store.
//!
//! Each trait call takes the state lock once, does all of its reads and writes,
//! and releases it before returning, which gives every call the serializable
//! semantics the Postgres store gets from row locks. The lock is never held
//! across an `.await`.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    fmt,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mainframe_model::{
    LeaseGrant, LeaseToken, NewPackage, Package, PackageId, PackageKey,
    PackageStatus, StatusCounts, Verdict, WorkerId,
};
use parking_lot::Mutex;

use super::{
    ClaimRequest, ClaimedPackage, FinalizeOutcome, FinalizeRequest, Finalized,
    InsertOutcome, LedgerStore, ReclaimedLease, StaleLease, StoreError,
    StoreResult,
};

#[derive(Clone, Debug)]
struct LeaseRow {
    package_id: PackageId,
    owner: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    packages: HashMap<PackageId, Package>,
    by_key: HashMap<PackageKey, PackageId>,
    leases: HashMap<LeaseToken, LeaseRow>,
    // Unique index: one lease per package.
    lease_by_package: HashMap<PackageId, LeaseToken>,
    rules: BTreeSet<String>,
    package_rules: BTreeSet<(PackageId, String)>,
    injected: VecDeque<StoreError>,
}

impl State {
    fn take_injected(&mut self) -> StoreResult<()> {
        match self.injected.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn drop_lease_of(&mut self, package_id: PackageId) -> Option<(LeaseToken, LeaseRow)> {
        let token = self.lease_by_package.remove(&package_id)?;
        self.leases.remove(&token).map(|row| (token, row))
    }
}

/// Ledger store kept entirely in memory. Used by tests and by embedders that
/// do not need durability.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<State>,
}

impl fmt::Debug for InMemoryLedgerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_lock() {
            Some(guard) => f
                .debug_struct("InMemoryLedgerStore")
                .field("packages", &guard.packages.len())
                .field("leases", &guard.leases.len())
                .finish(),
            None => f
                .debug_struct("InMemoryLedgerStore")
                .field("packages", &"<locked>")
                .finish(),
        }
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next store call fail with `err`. Calls are failed in the
    /// order errors were injected.
    pub fn inject_failure(&self, err: StoreError) {
        self.state.lock().injected.push_back(err);
    }

    /// Rewrites `updated_at` of a package, for ordering scenarios.
    pub fn set_updated_at(&self, key: &PackageKey, at: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        let Some(id) = state.by_key.get(key).copied() else {
            return false;
        };
        match state.packages.get_mut(&id) {
            Some(package) => {
                package.updated_at = at;
                true
            }
            None => false,
        }
    }

    /// Rule names linked to a package.
    pub fn rules_for(&self, key: &PackageKey) -> Vec<String> {
        let state = self.state.lock();
        let Some(id) = state.by_key.get(key).copied() else {
            return Vec::new();
        };
        state
            .package_rules
            .iter()
            .filter(|(package_id, _)| *package_id == id)
            .map(|(_, rule)| rule.clone())
            .collect()
    }

    pub fn known_rules(&self) -> Vec<String> {
        self.state.lock().rules.iter().cloned().collect()
    }

    /// Verifies the ledger/lease invariants: a package is `Leased` exactly
    /// when it owns one lease, and both lease indexes agree.
    pub fn check_invariants(&self) -> Result<(), String> {
        let state = self.state.lock();
        if state.leases.len() != state.lease_by_package.len() {
            return Err(format!(
                "{} leases but {} indexed packages",
                state.leases.len(),
                state.lease_by_package.len()
            ));
        }
        for (token, row) in &state.leases {
            if state.lease_by_package.get(&row.package_id) != Some(token) {
                return Err(format!("lease {token} missing from package index"));
            }
            match state.packages.get(&row.package_id) {
                Some(package) if package.status == PackageStatus::Leased => {}
                Some(package) => {
                    return Err(format!(
                        "lease {token} attached to {} package {}",
                        package.status, package.key
                    ));
                }
                None => return Err(format!("lease {token} has no package")),
            }
        }
        for package in state.packages.values() {
            if package.status == PackageStatus::Leased
                && !state.lease_by_package.contains_key(&package.id)
            {
                return Err(format!("{} is leased without a lease", package.key));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn claim_next(
        &self,
        claim: ClaimRequest,
    ) -> StoreResult<Option<ClaimedPackage>> {
        let mut guard = self.state.lock();
        guard.take_injected()?;
        let state = &mut *guard;

        let now = claim.now;
        let picked = state
            .packages
            .values()
            .filter(|package| match package.status {
                PackageStatus::Unscanned => true,
                PackageStatus::Leased => state
                    .lease_by_package
                    .get(&package.id)
                    .and_then(|token| state.leases.get(token))
                    .is_none_or(|lease| lease.expires_at <= now),
                _ => false,
            })
            .min_by(|a, b| {
                (a.updated_at, a.queued_at, &a.key)
                    .cmp(&(b.updated_at, b.queued_at, &b.key))
            })
            .map(|package| package.id);

        let Some(package_id) = picked else {
            return Ok(None);
        };

        let replaced_lease =
            state.drop_lease_of(package_id).map(|(token, row)| StaleLease {
                token,
                owner: row.owner,
                expires_at: row.expires_at,
            });

        let package = state.packages.get_mut(&package_id).ok_or_else(|| {
            StoreError::Corrupt(format!("package {package_id} vanished"))
        })?;
        let previous_status = package.status;
        package.status = PackageStatus::Leased;
        package.updated_at = now;
        let key = package.key.clone();
        let distributions = package.distributions.clone();

        state.leases.insert(
            claim.token,
            LeaseRow {
                package_id,
                owner: claim.owner.as_str().to_string(),
                issued_at: now,
                expires_at: claim.expires_at,
            },
        );
        state.lease_by_package.insert(package_id, claim.token);

        Ok(Some(ClaimedPackage {
            package_id,
            key,
            distributions,
            previous_status,
            replaced_lease,
            lease: LeaseGrant {
                token: claim.token,
                owner: claim.owner,
                issued_at: now,
                expires_at: claim.expires_at,
            },
        }))
    }

    async fn finalize(
        &self,
        request: FinalizeRequest,
    ) -> StoreResult<FinalizeOutcome> {
        let mut guard = self.state.lock();
        guard.take_injected()?;
        let state = &mut *guard;

        let Some(lease) = state.leases.get(&request.token).cloned() else {
            return Ok(FinalizeOutcome::UnknownLease);
        };
        let package = state.packages.get(&lease.package_id).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "lease {} references missing package",
                request.token
            ))
        })?;
        let key = package.key.clone();

        if lease.expires_at <= request.now {
            return Ok(FinalizeOutcome::Expired {
                key,
                expires_at: lease.expires_at,
            });
        }
        if lease.owner != request.worker.as_str() {
            return Ok(FinalizeOutcome::OwnerMismatch {
                key,
                owner: lease.owner,
            });
        }
        let new_status = request.verdict.status();
        if !package.status.can_transition_to(new_status) {
            return Err(StoreError::Corrupt(format!(
                "{key} holds a lease while {}",
                package.status
            )));
        }
        let rule_names: Vec<String> = request
            .verdict
            .findings()
            .map(|findings| findings.rules.clone())
            .unwrap_or_default();

        let package = state.packages.get_mut(&lease.package_id).ok_or_else(|| {
            StoreError::Corrupt(format!("package {} vanished", lease.package_id))
        })?;
        let old_status = package.status;
        package.status = new_status;
        package.updated_at = request.now;
        package.finished_at = Some(request.now);
        package.finished_by = Some(request.worker.as_str().to_string());
        match request.verdict {
            Verdict::Clean => {}
            Verdict::Malicious(findings) => package.findings = Some(findings),
            Verdict::Errored(message) => package.error_summary = Some(message),
        }

        state.leases.remove(&request.token);
        state.lease_by_package.remove(&lease.package_id);
        for rule in rule_names {
            state.rules.insert(rule.clone());
            state.package_rules.insert((lease.package_id, rule));
        }

        Ok(FinalizeOutcome::Applied(Finalized {
            package_id: lease.package_id,
            key,
            old_status,
            new_status,
        }))
    }

    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreResult<Vec<ReclaimedLease>> {
        let mut guard = self.state.lock();
        guard.take_injected()?;
        let state = &mut *guard;

        let mut expired: Vec<(LeaseToken, LeaseRow)> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .filter(|(_, lease)| {
                state
                    .packages
                    .get(&lease.package_id)
                    .is_some_and(|p| p.status == PackageStatus::Leased)
            })
            .map(|(token, lease)| (*token, lease.clone()))
            .collect();
        expired.sort_by_key(|(_, lease)| lease.expires_at);
        expired.truncate(limit as usize);

        let mut reclaimed = Vec::with_capacity(expired.len());
        for (token, lease) in expired {
            state.leases.remove(&token);
            state.lease_by_package.remove(&lease.package_id);
            let Some(package) = state.packages.get_mut(&lease.package_id) else {
                continue;
            };
            package.status = PackageStatus::Unscanned;
            package.updated_at = now;
            reclaimed.push(ReclaimedLease {
                package_id: lease.package_id,
                key: package.key.clone(),
                token,
                owner: lease.owner,
                expired_at: lease.expires_at,
            });
        }
        Ok(reclaimed)
    }

    async fn insert_package(
        &self,
        package: &NewPackage,
        now: DateTime<Utc>,
    ) -> StoreResult<InsertOutcome> {
        let mut guard = self.state.lock();
        guard.take_injected()?;
        let state = &mut *guard;

        if let Some(existing) = state.by_key.get(&package.key) {
            let status = state
                .packages
                .get(existing)
                .map(|p| p.status)
                .ok_or_else(|| {
                    StoreError::Corrupt(format!("index points at missing {existing}"))
                })?;
            return Ok(InsertOutcome::Existing {
                package_id: *existing,
                status,
            });
        }

        let id = PackageId::new();
        state.by_key.insert(package.key.clone(), id);
        state.packages.insert(
            id,
            Package {
                id,
                key: package.key.clone(),
                status: PackageStatus::Unscanned,
                distributions: package.distributions.clone(),
                findings: None,
                error_summary: None,
                queued_at: now,
                updated_at: now,
                finished_at: None,
                finished_by: None,
            },
        );
        Ok(InsertOutcome::Inserted(id))
    }

    async fn package(&self, key: &PackageKey) -> StoreResult<Option<Package>> {
        let mut state = self.state.lock();
        state.take_injected()?;
        Ok(state
            .by_key
            .get(key)
            .and_then(|id| state.packages.get(id))
            .cloned())
    }

    async fn active_lease(
        &self,
        key: &PackageKey,
    ) -> StoreResult<Option<LeaseGrant>> {
        let mut state = self.state.lock();
        state.take_injected()?;
        let Some(id) = state.by_key.get(key) else {
            return Ok(None);
        };
        let Some(token) = state.lease_by_package.get(id) else {
            return Ok(None);
        };
        let Some(row) = state.leases.get(token) else {
            return Ok(None);
        };
        let owner = WorkerId::new(row.owner.clone())
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        Ok(Some(LeaseGrant {
            token: *token,
            owner,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
        }))
    }

    async fn status_counts(&self) -> StoreResult<StatusCounts> {
        let mut state = self.state.lock();
        state.take_injected()?;
        let mut counts = StatusCounts::default();
        for package in state.packages.values() {
            counts.record(package.status, 1);
        }
        counts.active_leases = state.leases.len() as u64;
        Ok(counts)
    }
}
