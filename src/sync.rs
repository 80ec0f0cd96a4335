//! Periodic pull sync from the WFM side into the front end.
//!
//! For every enabled connection and schedule kind, each week of the window is
//! diffed against its cached partition. The capped delta is pushed to the
//! front end one entity at a time; only what was pushed successfully is
//! applied to the cache, and the overflow is remembered as `skipped` so the
//! next pass picks it up first.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::config::{EngineSettings, Sync as SyncSettings};
use crate::db::{cache, Pool};
use crate::delta::DeltaSet;
use crate::gateway::{DeferredScheduler, EmployeeDirectory, FrontEnd, WfmShift, WfmShiftSource};
use crate::model::{
    week_bounds, week_start, Connection, DeferredKind, ScheduleId, ScheduleKind, SharePayload,
    ShiftRecord,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub weeks: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Weeks that could not be synced at all.
    pub errors: usize,
    pub has_more: bool,
}

impl SyncReport {
    fn absorb<T>(&mut self, delta: &DeltaSet<T>) {
        self.weeks += 1;
        self.created += delta.created.len();
        self.updated += delta.updated.len();
        self.deleted += delta.deleted.len();
        self.skipped += delta.skipped.len();
        self.failed += delta.failed.len();
        self.has_more |= delta.has_more;
    }

    fn merge(&mut self, other: &SyncReport) {
        self.weeks += other.weeks;
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.errors += other.errors;
        self.has_more |= other.has_more;
    }

    pub fn changed(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}

pub struct Syncer {
    pool: Pool,
    engine: EngineSettings,
    settings: SyncSettings,
    source: Arc<dyn WfmShiftSource>,
    directory: Arc<dyn EmployeeDirectory>,
    frontend: Arc<dyn FrontEnd>,
    scheduler: Arc<dyn DeferredScheduler>,
}

impl Syncer {
    pub fn new(
        pool: Pool,
        engine: EngineSettings,
        settings: SyncSettings,
        source: Arc<dyn WfmShiftSource>,
        directory: Arc<dyn EmployeeDirectory>,
        frontend: Arc<dyn FrontEnd>,
        scheduler: Arc<dyn DeferredScheduler>,
    ) -> Self {
        Self {
            pool,
            engine,
            settings,
            source,
            directory,
            frontend,
            scheduler,
        }
    }

    /// Week starts of the sync window around `now`, oldest first.
    pub fn window(&self, now: DateTime<Utc>) -> Vec<NaiveDate> {
        let current = week_start(now);
        let behind = self.settings.weeks_behind as i64;
        let ahead = self.settings.weeks_ahead as i64;
        (-behind..=ahead)
            .map(|offset| current + Duration::weeks(offset))
            .collect()
    }

    /// Sync both schedule kinds of every connection. Kinds of one team run
    /// concurrently; the cache lease keeps them apart from the webhook path.
    pub async fn run_pass(&self, connections: &[Connection], now: DateTime<Utc>) -> SyncReport {
        let mut total = SyncReport::default();
        for connection in connections.iter().filter(|c| c.enabled) {
            let runs = [ScheduleKind::Shifts, ScheduleKind::OpenShifts]
                .map(|kind| self.sync_connection(connection, kind, now));
            for report in join_all(runs).await {
                total.merge(&report);
            }
        }
        total
    }

    #[instrument(skip_all, fields(team_id = %connection.team_id, kind = kind.as_str()))]
    pub async fn sync_connection(&self, connection: &Connection, kind: ScheduleKind, now: DateTime<Utc>) -> SyncReport {
        let weeks = self.window(now);
        let mut report = SyncReport::default();
        for week in &weeks {
            match self.sync_week(connection, kind, *week).await {
                Ok(delta) => report.absorb(&delta),
                Err(err) => {
                    error!(?err, %week, "week sync failed");
                    report.errors += 1;
                }
            }
        }

        if report.changed() && self.settings.share_after_sync {
            if let (Some(first), Some(last)) = (weeks.first(), weeks.last()) {
                let payload = SharePayload {
                    team_id: connection.team_id.clone(),
                    start: week_bounds(*first).0,
                    end: week_bounds(*last).1,
                };
                let scheduled = match serde_json::to_value(&payload) {
                    Ok(value) => self.scheduler.schedule(DeferredKind::ShareSchedule, 0, &value).await,
                    Err(err) => Err(err.into()),
                };
                if let Err(err) = scheduled {
                    warn!(?err, "could not schedule schedule sharing");
                }
            }
        }
        info!(
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            skipped = report.skipped,
            failed = report.failed,
            "sync pass finished"
        );
        report
    }

    /// One partition: fetch, diff, push, apply.
    #[instrument(skip_all, fields(team_id = %connection.team_id, kind = kind.as_str(), %week))]
    pub async fn sync_week(
        &self,
        connection: &Connection,
        kind: ScheduleKind,
        week: NaiveDate,
    ) -> Result<DeltaSet<ShiftRecord>> {
        let schedule = ScheduleId::new(&connection.team_id, kind);
        let snapshot = cache::load(&self.pool, &schedule, week).await?;

        let (start, end) = week_bounds(week);
        let fetched = self
            .source
            .list_shifts(&connection.wfm_bu_id, kind, start, end)
            .await?;
        let fresh = self.to_records(fetched, week).await?;

        let mut delta = DeltaSet::compute_capped(
            snapshot.records(),
            &fresh,
            self.settings.max_batch_size,
            snapshot.skipped(),
        );
        if delta.is_empty() && delta.skipped.is_empty() && snapshot.skipped().is_empty() {
            return Ok(delta);
        }

        self.push(&connection.team_id, kind, &mut delta).await;

        let skipped = delta.skipped_ids();
        cache::update(&self.pool, &self.engine, &schedule, week, |leased| {
            let current = leased.snapshot().records().to_vec();
            leased.replace_records(delta.apply(&current));
            leased.set_skipped(skipped.clone());
        })
        .await?;
        Ok(delta)
    }

    /// WFM entities of `week` with the front-end employee id filled in.
    async fn to_records(&self, fetched: Vec<WfmShift>, week: NaiveDate) -> Result<Vec<ShiftRecord>> {
        let mut employees: HashMap<String, String> = HashMap::new();
        let mut records = Vec::with_capacity(fetched.len());
        for shift in fetched {
            if week_start(shift.start) != week {
                continue;
            }
            let wfm_employee_id = shift.wfm_employee_id.unwrap_or_default();
            let frontend_employee_id = if wfm_employee_id.is_empty() {
                String::new()
            } else if let Some(known) = employees.get(&wfm_employee_id) {
                known.clone()
            } else {
                let mapped = self
                    .directory
                    .get_employee(&wfm_employee_id)
                    .await?
                    .map(|e| e.frontend_id)
                    .unwrap_or_default();
                employees.insert(wfm_employee_id.clone(), mapped.clone());
                mapped
            };
            records.push(ShiftRecord {
                frontend_id: String::new(),
                wfm_id: shift.wfm_id,
                frontend_employee_id,
                wfm_employee_id,
                start: shift.start,
                end: shift.end,
                quantity: shift.quantity,
                department: shift.department,
            });
        }
        Ok(records)
    }

    /// Push the delta; anything the front end refused moves to `failed`.
    async fn push(&self, team_id: &str, kind: ScheduleKind, delta: &mut DeltaSet<ShiftRecord>) {
        let mut failed = Vec::new();

        for record in delta.created.iter_mut().chain(delta.updated.iter_mut()) {
            if kind == ScheduleKind::Shifts && record.frontend_employee_id.is_empty() {
                warn!(wfm_id = %record.wfm_id, employee = %record.wfm_employee_id, "shift owner is not mapped; not pushed");
                failed.push(record.wfm_id.clone());
                continue;
            }
            match self.frontend.upsert_shift(team_id, kind, record).await {
                Ok(frontend_id) => record.frontend_id = frontend_id,
                Err(err) => {
                    warn!(?err, wfm_id = %record.wfm_id, "front end rejected shift");
                    failed.push(record.wfm_id.clone());
                }
            }
        }
        for record in &delta.deleted {
            if let Err(err) = self.frontend.delete_shift(team_id, kind, &record.frontend_id).await {
                warn!(?err, wfm_id = %record.wfm_id, "front end refused delete");
                failed.push(record.wfm_id.clone());
            }
        }

        for wfm_id in failed {
            delta.mark_failed(&wfm_id);
        }
    }
}
