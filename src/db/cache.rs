//! Week-partitioned correlation cache.
//!
//! Each `(schedule, week)` partition holds one JSON snapshot. Writers check the
//! partition out with [`load_for_update`], which stamps a lease token and an
//! expiry; the only way to persist changes is [`save_and_release`] with the
//! [`LeasedSnapshot`] it returned. Read-only callers use [`load`] and get a
//! [`CorrelationSnapshot`], which has no mutators.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::db::Pool;
use crate::error::CacheError;
use crate::model::{ScheduleId, ShiftRecord};

/// Read-only view of one partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrelationSnapshot {
    #[serde(default)]
    records: Vec<ShiftRecord>,
    /// Ids left out of the last reconciliation pass because of the batch cap.
    #[serde(default)]
    skipped: Vec<String>,
}

impl CorrelationSnapshot {
    pub fn records(&self) -> &[ShiftRecord] {
        &self.records
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn find(&self, frontend_id: &str) -> Option<&ShiftRecord> {
        self.records.iter().find(|r| r.frontend_id == frontend_id)
    }

    pub fn find_by_wfm(&self, wfm_id: &str) -> Option<&ShiftRecord> {
        self.records.iter().find(|r| r.wfm_id == wfm_id)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A partition checked out for exclusive modification.
#[derive(Debug)]
pub struct LeasedSnapshot {
    schedule_id: ScheduleId,
    week: NaiveDate,
    token: String,
    snapshot: CorrelationSnapshot,
}

impl LeasedSnapshot {
    pub fn snapshot(&self) -> &CorrelationSnapshot {
        &self.snapshot
    }

    pub fn schedule_id(&self) -> &ScheduleId {
        &self.schedule_id
    }

    pub fn week(&self) -> NaiveDate {
        self.week
    }

    /// Insert or replace by front-end id. A non-positive quantity removes the record.
    pub fn upsert(&mut self, record: ShiftRecord) {
        self.remove(&record.frontend_id);
        if record.quantity > 0 {
            self.snapshot.records.push(record);
        }
    }

    pub fn remove(&mut self, frontend_id: &str) -> Option<ShiftRecord> {
        let idx = self
            .snapshot
            .records
            .iter()
            .position(|r| r.frontend_id == frontend_id)?;
        Some(self.snapshot.records.remove(idx))
    }

    /// Take one slot from an open shift. Returns the remaining quantity, or
    /// `None` when the record is not in this partition.
    pub fn decrement_quantity(&mut self, frontend_id: &str) -> Option<i32> {
        let record = self
            .snapshot
            .records
            .iter_mut()
            .find(|r| r.frontend_id == frontend_id)?;
        record.quantity -= 1;
        let remaining = record.quantity;
        if remaining <= 0 {
            self.remove(frontend_id);
        }
        Some(remaining)
    }

    pub fn replace_records(&mut self, records: Vec<ShiftRecord>) {
        self.snapshot.records = records.into_iter().filter(|r| r.quantity > 0).collect();
    }

    pub fn set_skipped(&mut self, skipped: Vec<String>) {
        self.snapshot.skipped = skipped;
    }
}

async fn ensure_partition(pool: &Pool, schedule_id: &ScheduleId, week: NaiveDate) -> Result<(), CacheError> {
    let empty = serde_json::to_string(&CorrelationSnapshot::default())?;
    sqlx::query(
        "INSERT INTO cache_partitions (schedule_id, week_start, snapshot) VALUES (?, ?, ?) ON CONFLICT(schedule_id, week_start) DO NOTHING",
    )
    .bind(schedule_id.as_str())
    .bind(week.to_string())
    .bind(empty)
    .execute(pool)
    .await?;
    Ok(())
}

async fn read_snapshot(pool: &Pool, schedule_id: &ScheduleId, week: NaiveDate) -> Result<CorrelationSnapshot, CacheError> {
    let raw = sqlx::query_scalar::<_, String>(
        "SELECT snapshot FROM cache_partitions WHERE schedule_id = ? AND week_start = ?",
    )
    .bind(schedule_id.as_str())
    .bind(week.to_string())
    .fetch_optional(pool)
    .await?;
    match raw {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(CorrelationSnapshot::default()),
    }
}

/// Unleased read. Creates the partition empty on first access.
#[instrument(skip_all)]
pub async fn load(pool: &Pool, schedule_id: &ScheduleId, week: NaiveDate) -> Result<CorrelationSnapshot, CacheError> {
    ensure_partition(pool, schedule_id, week).await?;
    read_snapshot(pool, schedule_id, week).await
}

/// Check the partition out. Fails with [`CacheError::LeaseConflict`] while
/// another writer holds an unexpired lease.
#[instrument(skip_all)]
pub async fn load_for_update(
    pool: &Pool,
    schedule_id: &ScheduleId,
    week: NaiveDate,
    ttl_seconds: u64,
) -> Result<LeasedSnapshot, CacheError> {
    ensure_partition(pool, schedule_id, week).await?;

    let token = Uuid::new_v4().to_string();
    let now = Utc::now();
    let expires_at = now + ChronoDuration::seconds(ttl_seconds as i64);
    let acquired = sqlx::query(
        "UPDATE cache_partitions SET lease_token = ?, lease_expires_at = ? \
         WHERE schedule_id = ? AND week_start = ? \
         AND (lease_token IS NULL OR lease_expires_at IS NULL OR datetime(lease_expires_at) <= datetime(?))",
    )
    .bind(&token)
    .bind(expires_at)
    .bind(schedule_id.as_str())
    .bind(week.to_string())
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();

    if acquired == 0 {
        return Err(CacheError::LeaseConflict {
            schedule_id: schedule_id.to_string(),
            week: week.to_string(),
        });
    }

    let snapshot = read_snapshot(pool, schedule_id, week).await?;
    debug!(schedule = %schedule_id, %week, "lease acquired");
    Ok(LeasedSnapshot {
        schedule_id: schedule_id.clone(),
        week,
        token,
        snapshot,
    })
}

/// Persist the snapshot and drop the lease. Fails with
/// [`CacheError::LeaseLost`] if the token no longer matches.
#[instrument(skip_all)]
pub async fn save_and_release(pool: &Pool, leased: LeasedSnapshot) -> Result<(), CacheError> {
    let raw = serde_json::to_string(&leased.snapshot)?;
    let saved = sqlx::query(
        "UPDATE cache_partitions SET snapshot = ?, lease_token = NULL, lease_expires_at = NULL, updated_at = CURRENT_TIMESTAMP \
         WHERE schedule_id = ? AND week_start = ? AND lease_token = ?",
    )
    .bind(raw)
    .bind(leased.schedule_id.as_str())
    .bind(leased.week.to_string())
    .bind(&leased.token)
    .execute(pool)
    .await?
    .rows_affected();

    if saved == 0 {
        return Err(CacheError::LeaseLost {
            schedule_id: leased.schedule_id.to_string(),
            week: leased.week.to_string(),
        });
    }
    Ok(())
}

/// Drop the lease without writing.
#[instrument(skip_all)]
pub async fn release(pool: &Pool, leased: LeasedSnapshot) -> Result<(), CacheError> {
    sqlx::query(
        "UPDATE cache_partitions SET lease_token = NULL, lease_expires_at = NULL \
         WHERE schedule_id = ? AND week_start = ? AND lease_token = ?",
    )
    .bind(leased.schedule_id.as_str())
    .bind(leased.week.to_string())
    .bind(&leased.token)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load-mutate-save under lease with bounded, fixed-interval retries.
///
/// `mutate` may run more than once if the lease is lost between load and
/// save, so it must only touch the snapshot it is given.
pub async fn update<T, F>(
    pool: &Pool,
    settings: &EngineSettings,
    schedule_id: &ScheduleId,
    week: NaiveDate,
    mut mutate: F,
) -> Result<T, CacheError>
where
    F: FnMut(&mut LeasedSnapshot) -> T,
{
    for attempt in 1..=settings.lease_attempts {
        match load_for_update(pool, schedule_id, week, settings.lease_ttl_seconds).await {
            Ok(mut leased) => {
                let out = mutate(&mut leased);
                match save_and_release(pool, leased).await {
                    Ok(()) => return Ok(out),
                    Err(err @ CacheError::LeaseLost { .. }) => {
                        warn!(%err, attempt, "lease lost before save; retrying");
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err @ CacheError::LeaseConflict { .. }) => {
                debug!(%err, attempt, "lease busy");
            }
            Err(err) => return Err(err),
        }
        tokio::time::sleep(settings.lease_retry).await;
    }
    warn!(schedule = %schedule_id, %week, attempts = settings.lease_attempts, "lease retries exhausted");
    Err(CacheError::LeaseExhausted {
        attempts: settings.lease_attempts,
    })
}

/// Every partition of a schedule whose week lies in `[from, to]`, oldest first.
#[instrument(skip_all)]
pub async fn load_range(
    pool: &Pool,
    schedule_id: &ScheduleId,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<(NaiveDate, CorrelationSnapshot)>, CacheError> {
    let rows = sqlx::query(
        "SELECT week_start, snapshot FROM cache_partitions WHERE schedule_id = ? AND week_start >= ? AND week_start <= ? ORDER BY week_start ASC",
    )
    .bind(schedule_id.as_str())
    .bind(from.to_string())
    .bind(to.to_string())
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let week: String = row.get("week_start");
        let raw: String = row.get("snapshot");
        let Ok(week) = NaiveDate::parse_from_str(&week, "%Y-%m-%d") else {
            warn!(schedule = %schedule_id, week, "skipping partition with malformed week key");
            continue;
        };
        out.push((week, serde_json::from_str(&raw)?));
    }
    Ok(out)
}

/// Locate a record by front-end id across every cached week of a schedule,
/// newest week first.
#[instrument(skip_all)]
pub async fn find_shift(
    pool: &Pool,
    schedule_id: &ScheduleId,
    frontend_id: &str,
) -> Result<Option<ShiftRecord>, CacheError> {
    let rows = sqlx::query_scalar::<_, String>(
        "SELECT snapshot FROM cache_partitions WHERE schedule_id = ? ORDER BY week_start DESC",
    )
    .bind(schedule_id.as_str())
    .fetch_all(pool)
    .await?;

    for raw in rows {
        let snapshot: CorrelationSnapshot = serde_json::from_str(&raw)?;
        if let Some(found) = snapshot.find(frontend_id) {
            return Ok(Some(found.clone()));
        }
    }
    Ok(None)
}
