//! Single-flight job guard.
//!
//! At most one unexecuted sync job may exist per (account, provider); the
//! partial unique index on `sync_jobs` enforces it at the storage layer, so
//! two concurrent acquires race on the insert instead of on a read. Jobs
//! whose process died without releasing are reclaimed by age before each
//! acquire.

use chrono::{Duration, Utc};
use rusqlite::{params, ErrorCode};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::SyncJob;
use crate::db::{now_utc, Database, DbError};

pub const STALE_JOB_MINUTES_ENV: &str = "ESYNC_STALE_JOB_MINUTES";
const DEFAULT_STALE_JOB_MINUTES: i64 = 30;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("a sync job is already running for account {account_id} on provider {provider_id}")]
    AlreadyRunning {
        account_id: String,
        provider_id: String,
    },

    #[error(transparent)]
    Db(#[from] DbError),
}

fn stale_job_minutes() -> i64 {
    std::env::var(STALE_JOB_MINUTES_ENV)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|minutes| *minutes > 0)
        .unwrap_or(DEFAULT_STALE_JOB_MINUTES)
}

/// Mark abandoned jobs executed so they stop blocking the single-flight
/// index. Rows are kept for the audit trail.
pub fn reclaim_stale(db: &Database) -> Result<usize, GuardError> {
    let cutoff = (Utc::now() - Duration::minutes(stale_job_minutes()))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();

    let reclaimed = db
        .conn()
        .execute(
            "UPDATE sync_jobs SET is_executed = 1, executed_at = ? WHERE is_executed = 0 AND created_at < ?",
            params![now_utc(), cutoff],
        )
        .map_err(DbError::from)?;

    if reclaimed > 0 {
        warn!(count = reclaimed, "reclaimed stale sync jobs");
    }
    Ok(reclaimed)
}

/// Insert the job row for this run. A constraint violation on the
/// single-flight index means another run holds the slot.
pub fn try_acquire(
    db: &Database,
    account_id: &str,
    user_id: &str,
    provider_id: &str,
) -> Result<SyncJob, GuardError> {
    reclaim_stale(db)?;

    let queue_name = format!(
        "sync.{account_id}.{provider_id}.{}",
        Uuid::new_v4().simple()
    );
    let created_at = now_utc();

    let inserted = db.conn().execute(
        r#"
        INSERT INTO sync_jobs (queue_name, account_id, user_id, provider_id, created_at, is_executed)
        VALUES (?, ?, ?, ?, ?, 0)
        "#,
        params![queue_name, account_id, user_id, provider_id, created_at],
    );

    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation =>
        {
            return Err(GuardError::AlreadyRunning {
                account_id: account_id.to_string(),
                provider_id: provider_id.to_string(),
            });
        }
        Err(err) => return Err(GuardError::Db(err.into())),
    }

    let id = db.conn().last_insert_rowid();
    info!(job_id = id, account = account_id, provider = provider_id, "acquired sync job");

    Ok(SyncJob {
        id,
        queue_name,
        account_id: account_id.to_string(),
        user_id: user_id.to_string(),
        provider_id: provider_id.to_string(),
        created_at,
        executed_at: None,
        is_executed: false,
    })
}

/// Release the slot. Runs on every terminal path, success or failure, so a
/// finished run can never wedge the account.
pub fn release(db: &Database, job_id: i64) -> Result<(), GuardError> {
    db.conn()
        .execute(
            "UPDATE sync_jobs SET is_executed = 1, executed_at = ? WHERE id = ?",
            params![now_utc(), job_id],
        )
        .map_err(DbError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::*;

    fn temp_db() -> (Database, PathBuf) {
        let mut path = std::env::temp_dir();
        path.push(format!("esync-guard-{}.db", Uuid::new_v4()));
        let db = Database::open(&path).expect("open db");
        (db, path)
    }

    #[test]
    fn second_acquire_is_rejected_while_first_holds() {
        let (db, path) = temp_db();

        let job = try_acquire(&db, "acc-1", "user-1", "prov-1").expect("first acquire");
        let second = try_acquire(&db, "acc-1", "user-1", "prov-1");
        assert!(matches!(second, Err(GuardError::AlreadyRunning { .. })));

        release(&db, job.id).expect("release");
        try_acquire(&db, "acc-1", "user-1", "prov-1").expect("acquire after release");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn different_accounts_do_not_contend() {
        let (db, path) = temp_db();

        try_acquire(&db, "acc-1", "user-1", "prov-1").expect("acc-1");
        try_acquire(&db, "acc-2", "user-1", "prov-1").expect("acc-2");
        try_acquire(&db, "acc-1", "user-1", "prov-2").expect("acc-1 other provider");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn queue_names_are_unique_per_acquire() {
        let (db, path) = temp_db();

        let first = try_acquire(&db, "acc-1", "user-1", "prov-1").expect("first");
        release(&db, first.id).expect("release");
        let second = try_acquire(&db, "acc-1", "user-1", "prov-1").expect("second");

        assert_ne!(first.queue_name, second.queue_name);
        assert!(first.queue_name.starts_with("sync.acc-1.prov-1."));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn stale_jobs_are_reclaimed_before_acquire() {
        let (db, path) = temp_db();

        try_acquire(&db, "acc-1", "user-1", "prov-1").expect("first acquire");
        // Backdate the running job beyond the staleness window.
        db.conn()
            .execute(
                "UPDATE sync_jobs SET created_at = '2000-01-01T00:00:00Z' WHERE is_executed = 0",
                [],
            )
            .expect("backdate");

        let job = try_acquire(&db, "acc-1", "user-1", "prov-1")
            .expect("acquire after staleness window");
        assert!(!job.is_executed);
        let _ = std::fs::remove_file(path);
    }
}
