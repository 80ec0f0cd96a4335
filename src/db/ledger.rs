use anyhow::Result;
use sqlx::Row;
use std::collections::HashMap;
use tracing::instrument;

use crate::db::Pool;
use crate::model::{ActorRole, CachedResult, LedgerStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleProgress {
    pub status: LedgerStatus,
    pub result: Option<CachedResult>,
    /// The step was a decline rather than an approval.
    pub declined: bool,
}

/// Progress of every actor's step in one negotiated transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionLedgerEntry {
    pub key: String,
    roles: HashMap<ActorRole, RoleProgress>,
}

impl TransactionLedgerEntry {
    pub fn status(&self, role: ActorRole) -> LedgerStatus {
        self.roles.get(&role).map(|p| p.status).unwrap_or_default()
    }

    pub fn result(&self, role: ActorRole) -> Option<&CachedResult> {
        self.roles.get(&role).and_then(|p| p.result.as_ref())
    }

    pub fn declined(&self, role: ActorRole) -> bool {
        self.roles.get(&role).map_or(false, |p| p.declined)
    }

    /// The role's step finished and the WFM side accepted it.
    pub fn succeeded(&self, role: ActorRole) -> bool {
        self.status(role) == LedgerStatus::Complete
            && self.result(role).map(CachedResult::is_success).unwrap_or(false)
    }

    pub fn in_progress_roles(&self) -> Vec<ActorRole> {
        ActorRole::ALL
            .into_iter()
            .filter(|r| self.status(*r) == LedgerStatus::InProgress)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// This caller now owns the step.
    Started,
    /// Another delivery owns the step.
    InProgress,
    /// The step already ran; replay this.
    Complete(CachedResult),
}

fn row_to_result(row: &sqlx::sqlite::SqliteRow) -> Option<CachedResult> {
    let status_code: Option<i64> = row.get("status_code");
    status_code.map(|code| CachedResult {
        status_code: code as u16,
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
    })
}

#[instrument(skip_all)]
pub async fn load(pool: &Pool, key: &str) -> Result<TransactionLedgerEntry> {
    let rows = sqlx::query(
        "SELECT role, status, status_code, error_code, error_message, declined FROM ledger WHERE txn_key = ?",
    )
    .bind(key)
    .fetch_all(pool)
    .await?;

    let mut roles = HashMap::new();
    for row in rows {
        let role: String = row.get("role");
        let Some(role) = ActorRole::parse(&role) else {
            continue;
        };
        let status: String = row.get("status");
        roles.insert(
            role,
            RoleProgress {
                status: LedgerStatus::parse(&status),
                result: row_to_result(&row),
                declined: row.get::<i64, _>("declined") != 0,
            },
        );
    }
    Ok(TransactionLedgerEntry {
        key: key.to_string(),
        roles,
    })
}

/// Atomically move `role` from `NotStarted` to `InProgress`.
///
/// An `InProgress` marker untouched for `stale_seconds` belongs to a delivery
/// that died mid-step and is claimed as if `NotStarted`. On success any other
/// role still marked `InProgress` is reset, so at most one role of an entry is
/// in flight.
#[instrument(skip_all, fields(txn_key = key, role = %role))]
pub async fn try_begin(pool: &Pool, key: &str, role: ActorRole, stale_seconds: u64) -> Result<BeginOutcome> {
    let mut tx = pool.begin().await?;
    let claimed = sqlx::query(
        "INSERT INTO ledger (txn_key, role, status, updated_at) VALUES (?, ?, 'InProgress', CURRENT_TIMESTAMP) \
         ON CONFLICT(txn_key, role) DO UPDATE SET status = 'InProgress', status_code = NULL, error_code = NULL, \
         error_message = NULL, declined = 0, updated_at = CURRENT_TIMESTAMP \
         WHERE ledger.status = 'NotStarted' \
            OR (ledger.status = 'InProgress' AND ledger.updated_at < datetime('now', ?))",
    )
    .bind(key)
    .bind(role.as_str())
    .bind(format!("-{stale_seconds} seconds"))
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if claimed == 1 {
        sqlx::query(
            "UPDATE ledger SET status = 'NotStarted', updated_at = CURRENT_TIMESTAMP \
             WHERE txn_key = ? AND role != ? AND status = 'InProgress'",
        )
        .bind(key)
        .bind(role.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        return Ok(BeginOutcome::Started);
    }

    let row = sqlx::query(
        "SELECT status, status_code, error_code, error_message FROM ledger WHERE txn_key = ? AND role = ?",
    )
    .bind(key)
    .bind(role.as_str())
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    let status: String = row.get("status");
    match LedgerStatus::parse(&status) {
        LedgerStatus::Complete => Ok(BeginOutcome::Complete(
            row_to_result(&row).unwrap_or_else(CachedResult::success),
        )),
        _ => Ok(BeginOutcome::InProgress),
    }
}

#[instrument(skip_all, fields(txn_key = key, role = %role))]
pub async fn complete(pool: &Pool, key: &str, role: ActorRole, result: &CachedResult) -> Result<()> {
    sqlx::query(
        "UPDATE ledger SET status = 'Complete', status_code = ?, error_code = ?, error_message = ?, \
         updated_at = CURRENT_TIMESTAMP WHERE txn_key = ? AND role = ?",
    )
    .bind(result.status_code as i64)
    .bind(&result.error_code)
    .bind(&result.error_message)
    .bind(key)
    .bind(role.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Note that the role's completed step declined the transaction.
#[instrument(skip_all, fields(txn_key = key, role = %role))]
pub async fn record_decline(pool: &Pool, key: &str, role: ActorRole) -> Result<()> {
    sqlx::query("UPDATE ledger SET declined = 1, updated_at = CURRENT_TIMESTAMP WHERE txn_key = ? AND role = ?")
        .bind(key)
        .bind(role.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

/// Put a role back to `NotStarted` so the step can run again.
#[instrument(skip_all, fields(txn_key = key, role = %role))]
pub async fn reset(pool: &Pool, key: &str, role: ActorRole) -> Result<()> {
    sqlx::query(
        "UPDATE ledger SET status = 'NotStarted', status_code = NULL, error_code = NULL, error_message = NULL, \
         declined = 0, updated_at = CURRENT_TIMESTAMP WHERE txn_key = ? AND role = ?",
    )
    .bind(key)
    .bind(role.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Forget the whole transaction.
#[instrument(skip_all, fields(txn_key = key))]
pub async fn clear(pool: &Pool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM ledger WHERE txn_key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}
