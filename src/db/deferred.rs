use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::Row;
use tracing::{info, instrument};

use crate::db::{Pool, SqliteStore};
use crate::gateway::DeferredScheduler;
use crate::model::DeferredKind;

#[derive(Debug, Clone, PartialEq)]
pub struct DeferredAction {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub attempt: i32,
}

#[instrument(skip_all)]
pub async fn enqueue(
    pool: &Pool,
    kind: DeferredKind,
    payload: &Value,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO deferred_actions (kind, payload, attempt, due_at) VALUES (?, ?, 0, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(serde_json::to_string(payload)?)
    .bind(due_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due(pool: &Pool) -> Result<Option<DeferredAction>> {
    let row = sqlx::query(
        "SELECT id, kind, payload, attempt FROM deferred_actions WHERE datetime(due_at) <= CURRENT_TIMESTAMP ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| DeferredAction {
        id: row.get("id"),
        kind: row.get("kind"),
        payload: row.get("payload"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn delete(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM deferred_actions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_pending(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deferred_actions")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (no cap when <= 0).
pub fn backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    }
}

#[instrument(skip_all)]
pub async fn backoff_with_cap(pool: &Pool, id: i64, attempt: i32, max_cap_secs: i64) -> Result<()> {
    let secs = backoff_secs(attempt, max_cap_secs);
    sqlx::query(
        "UPDATE deferred_actions SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl DeferredScheduler for SqliteStore {
    async fn schedule(&self, kind: DeferredKind, delay_seconds: u64, payload: &Value) -> Result<()> {
        let due_at = Utc::now() + Duration::seconds(delay_seconds as i64);
        let id = enqueue(self.pool(), kind, payload, due_at).await?;
        info!(id, kind = kind.as_str(), delay_seconds, "deferred action scheduled");
        Ok(())
    }
}
