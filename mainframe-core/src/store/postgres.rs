//! Postgres-backed ledger store.
//!
//! Concurrency control is entirely Postgres': allocation locks the chosen
//! package row with `FOR UPDATE SKIP LOCKED`, so concurrent allocators move
//! on to other rows instead of queueing behind each other, and
//! `leases_one_per_package` enforces a single lease per package. Package rows
//! are always locked before lease rows to keep lock order consistent.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mainframe_model::{
    Findings, LeaseGrant, LeaseToken, NewPackage, Package, PackageId,
    PackageKey, PackageStatus, StatusCounts, Verdict, WorkerId,
};
use sqlx::{FromRow, PgPool, types::Json};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::{
    ClaimRequest, ClaimedPackage, FinalizeOutcome, FinalizeRequest, Finalized,
    InsertOutcome, LedgerStore, ReclaimedLease, StaleLease, StoreError,
    StoreResult,
};

const CLAIM_NEXT_SQL: &str = r#"
    SELECT p.package_id, p.name, p.version, p.status, p.distributions,
           l.token AS lease_token,
           l.owner AS lease_owner,
           l.expires_at AS lease_expires_at
    FROM packages p
    LEFT JOIN leases l ON l.package_id = p.package_id
    WHERE p.status = 'unscanned'
       OR (p.status = 'leased' AND (l.token IS NULL OR l.expires_at <= $1))
    ORDER BY p.updated_at ASC, p.queued_at ASC, p.name ASC, p.version ASC
    LIMIT 1
    FOR UPDATE OF p SKIP LOCKED
"#;

const REAP_EXPIRED_SQL: &str = r#"
    WITH expired AS (
        SELECT l.token
        FROM leases l
        JOIN packages p ON p.package_id = l.package_id
        WHERE l.expires_at <= $1
          AND p.status = 'leased'
        ORDER BY l.expires_at ASC
        LIMIT $2
        FOR UPDATE OF p, l SKIP LOCKED
    ), dropped AS (
        DELETE FROM leases l
        USING expired e
        WHERE l.token = e.token
        RETURNING l.package_id, l.token, l.owner, l.expires_at
    )
    UPDATE packages p
    SET status = 'unscanned',
        updated_at = $1
    FROM dropped d
    WHERE p.package_id = d.package_id
    RETURNING p.package_id, p.name, p.version,
              d.token, d.owner, d.expires_at
"#;

const PACKAGE_COLUMNS: &str = r#"
    package_id, name, version, status, distributions, findings,
    error_summary, queued_at, updated_at, finished_at, finished_by
"#;

/// Durable ledger backed by Postgres.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresLedgerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresLedgerStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[derive(FromRow)]
struct PackageRow {
    package_id: Uuid,
    name: String,
    version: String,
    status: String,
    distributions: Vec<String>,
    findings: Option<Json<Findings>>,
    error_summary: Option<String>,
    queued_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    finished_by: Option<String>,
}

impl PackageRow {
    fn into_package(self) -> StoreResult<Package> {
        Ok(Package {
            id: PackageId(self.package_id),
            status: parse_status(&self.status)?,
            distributions: parse_distributions(&self.distributions)?,
            key: PackageKey {
                name: self.name,
                version: self.version,
            },
            findings: self.findings.map(|Json(findings)| findings),
            error_summary: self.error_summary,
            queued_at: self.queued_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
            finished_by: self.finished_by,
        })
    }
}

#[derive(FromRow)]
struct ClaimRow {
    package_id: Uuid,
    name: String,
    version: String,
    status: String,
    distributions: Vec<String>,
    lease_token: Option<Uuid>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct ReapRow {
    package_id: Uuid,
    name: String,
    version: String,
    token: Uuid,
    owner: String,
    expires_at: DateTime<Utc>,
}

fn parse_status(raw: &str) -> StoreResult<PackageStatus> {
    raw.parse::<PackageStatus>()
        .map_err(|err| StoreError::Corrupt(err.to_string()))
}

fn parse_distributions(raw: &[String]) -> StoreResult<Vec<Url>> {
    raw.iter()
        .map(|url| {
            Url::parse(url).map_err(|err| {
                StoreError::Corrupt(format!("stored distribution {url}: {err}"))
            })
        })
        .collect()
}

/// Maps a driver error onto the store taxonomy using SQLSTATE classes.
pub(crate) fn classify_error(context: &str, err: sqlx::Error) -> StoreError {
    let message = format!("{context}: {err}");
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization_failure, deadlock_detected, lock_not_available
            Some("40001" | "40P01" | "55P03") => StoreError::Conflict(message),
            Some(code) if code.starts_with("23") => {
                StoreError::Constraint(message)
            }
            Some(code)
                if code.starts_with("08")
                    || code.starts_with("57P")
                    || code == "53300" =>
            {
                StoreError::Unavailable(message)
            }
            _ => StoreError::Backend(message),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(message),
        sqlx::Error::RowNotFound
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_) => StoreError::Corrupt(message),
        _ => StoreError::Backend(message),
    }
}

fn classify(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| classify_error(context, err)
}

impl PostgresLedgerStore {
    /// Wraps `pool` after checking connectivity and that migrations ran.
    pub async fn new(pool: PgPool) -> StoreResult<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(classify("ledger store health check"))?;

        let schema_ready = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM pg_constraint WHERE conname = $1 LIMIT 1",
        )
        .bind("leases_one_per_package")
        .fetch_optional(&pool)
        .await
        .map_err(classify("ledger schema validation"))?
        .is_some();

        if !schema_ready {
            return Err(StoreError::Backend(
                "constraint leases_one_per_package is missing; run migrations"
                    .into(),
            ));
        }

        info!("Ledger store connected to Postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn claim_next(
        &self,
        claim: ClaimRequest,
    ) -> StoreResult<Option<ClaimedPackage>> {
        let mut tx = self.pool.begin().await.map_err(classify("begin claim tx"))?;

        let row = sqlx::query_as::<_, ClaimRow>(CLAIM_NEXT_SQL)
            .bind(claim.now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify("claim select"))?;

        let Some(row) = row else {
            // Nothing allocatable; rollback is implicit
            return Ok(None);
        };

        let replaced_lease = match (row.lease_token, row.lease_owner, row.lease_expires_at) {
            (Some(token), Some(owner), Some(expires_at)) => {
                sqlx::query("DELETE FROM leases WHERE token = $1")
                    .bind(token)
                    .execute(&mut *tx)
                    .await
                    .map_err(classify("claim drop stale lease"))?;
                Some(StaleLease {
                    token: LeaseToken(token),
                    owner,
                    expires_at,
                })
            }
            _ => None,
        };

        sqlx::query(
            r#"
            INSERT INTO leases (token, package_id, owner, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(claim.token.0)
        .bind(row.package_id)
        .bind(claim.owner.as_str())
        .bind(claim.now)
        .bind(claim.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            // Another allocator slipped a lease in; retry selects anew.
            let raced = err
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation());
            match classify_error("claim insert lease", err) {
                StoreError::Constraint(msg) if raced => StoreError::Conflict(msg),
                other => other,
            }
        })?;

        sqlx::query(
            r#"
            UPDATE packages
            SET status = 'leased',
                updated_at = $2
            WHERE package_id = $1
            "#,
        )
        .bind(row.package_id)
        .bind(claim.now)
        .execute(&mut *tx)
        .await
        .map_err(classify("claim update->leased"))?;

        tx.commit().await.map_err(classify("claim tx commit"))?;

        Ok(Some(ClaimedPackage {
            package_id: PackageId(row.package_id),
            previous_status: parse_status(&row.status)?,
            distributions: parse_distributions(&row.distributions)?,
            key: PackageKey {
                name: row.name,
                version: row.version,
            },
            replaced_lease,
            lease: LeaseGrant {
                token: claim.token,
                owner: claim.owner,
                issued_at: claim.now,
                expires_at: claim.expires_at,
            },
        }))
    }

    async fn finalize(
        &self,
        request: FinalizeRequest,
    ) -> StoreResult<FinalizeOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(classify("begin finalize tx"))?;

        let package_id: Option<Uuid> =
            sqlx::query_scalar("SELECT package_id FROM leases WHERE token = $1")
                .bind(request.token.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(classify("finalize lease lookup"))?;

        let Some(package_id) = package_id else {
            return Ok(FinalizeOutcome::UnknownLease);
        };

        let package: Option<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT name, version, status
            FROM packages
            WHERE package_id = $1
            FOR UPDATE
            "#,
        )
        .bind(package_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify("finalize lock package"))?;

        let Some((name, version, status)) = package else {
            return Ok(FinalizeOutcome::UnknownLease);
        };
        let key = PackageKey { name, version };

        // Re-read under lock: the reaper or an allocator may have replaced the
        // lease while we waited for the package row.
        let lease: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT owner, expires_at
            FROM leases
            WHERE token = $1
            FOR UPDATE
            "#,
        )
        .bind(request.token.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify("finalize lock lease"))?;

        let Some((owner, expires_at)) = lease else {
            return Ok(FinalizeOutcome::UnknownLease);
        };

        if expires_at <= request.now {
            return Ok(FinalizeOutcome::Expired { key, expires_at });
        }
        if owner != request.worker.as_str() {
            return Ok(FinalizeOutcome::OwnerMismatch { key, owner });
        }
        let old_status = parse_status(&status)?;
        let new_status = request.verdict.status();
        if !old_status.can_transition_to(new_status) {
            return Err(StoreError::Corrupt(format!(
                "{key} holds a lease while {old_status}"
            )));
        }
        let (findings, score, error_summary) = match &request.verdict {
            Verdict::Clean => (None, None, None),
            Verdict::Malicious(findings) => {
                (Some(Json(findings)), Some(findings.score), None)
            }
            Verdict::Errored(message) => (None, None, Some(message.as_str())),
        };

        sqlx::query(
            r#"
            UPDATE packages
            SET status = $2,
                findings = $3,
                score = $4,
                error_summary = $5,
                updated_at = $6,
                finished_at = $6,
                finished_by = $7
            WHERE package_id = $1
            "#,
        )
        .bind(package_id)
        .bind(new_status.as_str())
        .bind(findings)
        .bind(score)
        .bind(error_summary)
        .bind(request.now)
        .bind(request.worker.as_str())
        .execute(&mut *tx)
        .await
        .map_err(classify("finalize update package"))?;

        sqlx::query("DELETE FROM leases WHERE token = $1")
            .bind(request.token.0)
            .execute(&mut *tx)
            .await
            .map_err(classify("finalize release lease"))?;

        if let Some(findings) = request.verdict.findings()
            && !findings.rules.is_empty()
        {
            sqlx::query(
                "INSERT INTO rules (name) SELECT UNNEST($1::text[]) ON CONFLICT DO NOTHING",
            )
            .bind(&findings.rules)
            .execute(&mut *tx)
            .await
            .map_err(classify("finalize register rules"))?;

            sqlx::query(
                r#"
                INSERT INTO package_rules (package_id, rule_name)
                SELECT $1, UNNEST($2::text[])
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(package_id)
            .bind(&findings.rules)
            .execute(&mut *tx)
            .await
            .map_err(classify("finalize link rules"))?;
        }

        tx.commit().await.map_err(classify("finalize tx commit"))?;
        debug!(package = %key, status = %new_status, "finalized lease {}", request.token);

        Ok(FinalizeOutcome::Applied(Finalized {
            package_id: PackageId(package_id),
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
        let rows = sqlx::query_as::<_, ReapRow>(REAP_EXPIRED_SQL)
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(classify("reap expired leases"))?;

        Ok(rows
            .into_iter()
            .map(|row| ReclaimedLease {
                package_id: PackageId(row.package_id),
                key: PackageKey {
                    name: row.name,
                    version: row.version,
                },
                token: LeaseToken(row.token),
                owner: row.owner,
                expired_at: row.expires_at,
            })
            .collect())
    }

    async fn insert_package(
        &self,
        package: &NewPackage,
        now: DateTime<Utc>,
    ) -> StoreResult<InsertOutcome> {
        let distributions: Vec<String> = package
            .distributions
            .iter()
            .map(|url| url.to_string())
            .collect();

        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO packages
                (package_id, name, version, status, distributions, queued_at, updated_at)
            VALUES ($1, $2, $3, 'unscanned', $4, $5, $5)
            ON CONFLICT (name, version) DO NOTHING
            RETURNING package_id
            "#,
        )
        .bind(PackageId::new().to_uuid())
        .bind(&package.key.name)
        .bind(&package.key.version)
        .bind(&distributions)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify("insert package"))?;

        if let Some(id) = inserted {
            return Ok(InsertOutcome::Inserted(PackageId(id)));
        }

        let (package_id, status): (Uuid, String) = sqlx::query_as(
            "SELECT package_id, status FROM packages WHERE name = $1 AND version = $2",
        )
        .bind(&package.key.name)
        .bind(&package.key.version)
        .fetch_one(&self.pool)
        .await
        .map_err(classify("insert package lookup existing"))?;

        Ok(InsertOutcome::Existing {
            package_id: PackageId(package_id),
            status: parse_status(&status)?,
        })
    }

    async fn package(&self, key: &PackageKey) -> StoreResult<Option<Package>> {
        let sql = format!(
            "SELECT {PACKAGE_COLUMNS} FROM packages WHERE name = $1 AND version = $2"
        );
        sqlx::query_as::<_, PackageRow>(&sql)
            .bind(&key.name)
            .bind(&key.version)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify("package lookup"))?
            .map(PackageRow::into_package)
            .transpose()
    }

    async fn active_lease(
        &self,
        key: &PackageKey,
    ) -> StoreResult<Option<LeaseGrant>> {
        let row: Option<(Uuid, String, DateTime<Utc>, DateTime<Utc>)> =
            sqlx::query_as(
                r#"
                SELECT l.token, l.owner, l.issued_at, l.expires_at
                FROM leases l
                JOIN packages p ON p.package_id = l.package_id
                WHERE p.name = $1 AND p.version = $2
                "#,
            )
            .bind(&key.name)
            .bind(&key.version)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify("active lease lookup"))?;

        row.map(|(token, owner, issued_at, expires_at)| {
            let owner = WorkerId::new(owner)
                .map_err(|err| StoreError::Corrupt(err.to_string()))?;
            Ok(LeaseGrant {
                token: LeaseToken(token),
                owner,
                issued_at,
                expires_at,
            })
        })
        .transpose()
    }

    async fn status_counts(&self) -> StoreResult<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*)::bigint FROM packages GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify("status counts"))?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.record(parse_status(&status)?, count.max(0) as u64);
        }

        let leases: i64 = sqlx::query_scalar("SELECT COUNT(*)::bigint FROM leases")
            .fetch_one(&self.pool)
            .await
            .map_err(classify("lease count"))?;
        counts.active_leases = leases.max(0) as u64;

        Ok(counts)
    }
}
