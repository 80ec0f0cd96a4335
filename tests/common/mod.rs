#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use shiftbridge::config::EngineSettings;
use shiftbridge::db::{self, cache, directory, Pool, SqliteStore};
use shiftbridge::gateway::{
    AvailabilityModel, FrontEnd, GatewayResult, OpenShiftCommand, SwapCommand, WfmActions,
    WfmQueries, WfmShift, WfmShiftSource,
};
use shiftbridge::handlers::{Dispatcher, Services};
use shiftbridge::model::{
    ChangeBatch, ChangeItem, Connection, EmployeeRecord, HttpMethod, ScheduleId, ScheduleKind,
    ShiftRecord,
};

pub const TEAM: &str = "team-1";

pub fn settings() -> EngineSettings {
    EngineSettings {
        lease_attempts: 50,
        lease_retry: std::time::Duration::from_millis(5),
        lease_ttl_seconds: 30,
        ledger_recheck: std::time::Duration::from_millis(10),
        ledger_stale_seconds: 120,
        auto_approve_swaps: false,
        auto_approve_delay_seconds: 60,
    }
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
}

pub fn shift(frontend_id: &str, wfm_id: &str, employee: &str, start: DateTime<Utc>) -> ShiftRecord {
    ShiftRecord {
        frontend_id: frontend_id.into(),
        wfm_id: wfm_id.into(),
        frontend_employee_id: employee.into(),
        wfm_employee_id: format!("w{employee}"),
        start,
        end: start + Duration::hours(8),
        quantity: 1,
        department: None,
    }
}

pub fn employee(frontend_id: &str) -> EmployeeRecord {
    EmployeeRecord {
        frontend_id: frontend_id.into(),
        wfm_id: format!("w{frontend_id}"),
        login_name: format!("{frontend_id}@example.com"),
        display_name: None,
    }
}

pub fn item(id: &str, method: HttpMethod, url: &str, body: Option<Value>) -> ChangeItem {
    ChangeItem {
        id: id.into(),
        method,
        url: url.into(),
        body,
    }
}

pub fn batch(items: Vec<ChangeItem>) -> ChangeBatch {
    ChangeBatch { requests: items }
}

pub async fn seed_directory(pool: &Pool, employees: &[&str]) {
    for id in employees {
        directory::upsert_employee(pool, &employee(id)).await.unwrap();
    }
    directory::upsert_connection(
        pool,
        &Connection {
            team_id: TEAM.into(),
            wfm_bu_id: "bu-1".into(),
            time_zone_id: "UTC".into(),
            enabled: true,
        },
    )
    .await
    .unwrap();
}

pub async fn seed_shifts(pool: &Pool, schedule: &ScheduleId, records: &[ShiftRecord]) {
    for record in records {
        let record = record.clone();
        cache::update(pool, &settings(), schedule, record.week_start(), |leased| {
            leased.upsert(record.clone())
        })
        .await
        .unwrap();
    }
}

pub async fn cached(pool: &Pool, schedule: &ScheduleId, frontend_id: &str) -> Option<ShiftRecord> {
    cache::find_shift(pool, schedule, frontend_id).await.unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WfmCall {
    pub action: String,
    pub approve: Option<bool>,
}

/// Records every WFM call and answers from a script, defaulting to success.
#[derive(Clone, Default)]
pub struct RecordingWfm {
    responses: Arc<Mutex<VecDeque<Result<GatewayResult>>>>,
    calls: Arc<Mutex<Vec<WfmCall>>>,
    targets: Arc<Mutex<Vec<String>>>,
    gate: Option<Arc<Notify>>,
}

impl RecordingWfm {
    pub fn with_responses(responses: Vec<Result<GatewayResult>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    /// Calls block until the returned handle is notified.
    pub fn gated(responses: Vec<Result<GatewayResult>>) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (
            Self {
                gate: Some(gate.clone()),
                ..Self::with_responses(responses)
            },
            gate,
        )
    }

    pub async fn set_targets(&self, targets: &[&str]) {
        *self.targets.lock().await = targets.iter().map(|s| s.to_string()).collect();
    }

    pub async fn calls(&self) -> Vec<WfmCall> {
        self.calls.lock().await.clone()
    }

    pub async fn actions(&self) -> Vec<String> {
        self.calls().await.into_iter().map(|c| c.action).collect()
    }

    async fn record(&self, action: &str, approve: Option<bool>) -> Result<GatewayResult> {
        self.calls.lock().await.push(WfmCall {
            action: action.to_string(),
            approve,
        });
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or_else(|| Ok(GatewayResult::ok()))
    }
}

#[async_trait]
impl WfmActions for RecordingWfm {
    async fn create_shift_swap(&self, _cmd: &SwapCommand) -> Result<GatewayResult> {
        self.record("create_shift_swap", None).await
    }

    async fn recipient_approve_swap(&self, _cmd: &SwapCommand, approve: bool) -> Result<GatewayResult> {
        self.record("recipient_approve_swap", Some(approve)).await
    }

    async fn manager_approve_swap(&self, _cmd: &SwapCommand, approve: bool) -> Result<GatewayResult> {
        self.record("manager_approve_swap", Some(approve)).await
    }

    async fn cancel_swap(&self, _cmd: &SwapCommand) -> Result<GatewayResult> {
        self.record("cancel_swap", None).await
    }

    async fn create_open_shift_request(&self, _cmd: &OpenShiftCommand) -> Result<GatewayResult> {
        self.record("create_open_shift_request", None).await
    }

    async fn manager_approve_open_shift_request(
        &self,
        _cmd: &OpenShiftCommand,
        approve: bool,
    ) -> Result<GatewayResult> {
        self.record("manager_approve_open_shift_request", Some(approve))
            .await
    }

    async fn cancel_open_shift_request(&self, _cmd: &OpenShiftCommand) -> Result<GatewayResult> {
        self.record("cancel_open_shift_request", None).await
    }

    async fn manager_assign_open_shift(
        &self,
        _bu_id: &str,
        _open_shift: &ShiftRecord,
        _manager: Option<&EmployeeRecord>,
        _employee: &EmployeeRecord,
    ) -> Result<GatewayResult> {
        self.record("manager_assign_open_shift", None).await
    }

    async fn update_employee_availability(&self, _model: &AvailabilityModel) -> Result<GatewayResult> {
        self.record("update_employee_availability", None).await
    }
}

#[async_trait]
impl WfmQueries for RecordingWfm {
    async fn get_eligible_swap_targets(
        &self,
        _shift: &ShiftRecord,
        _employee: &EmployeeRecord,
        _bu_id: &str,
    ) -> Result<Vec<String>> {
        self.calls.lock().await.push(WfmCall {
            action: "get_eligible_swap_targets".into(),
            approve: None,
        });
        Ok(self.targets.lock().await.clone())
    }
}

/// Serves a fixed set of WFM entities per schedule kind.
#[derive(Clone, Default)]
pub struct StaticSource {
    shifts: Arc<Mutex<HashMap<&'static str, Vec<WfmShift>>>>,
}

impl StaticSource {
    pub async fn set(&self, kind: ScheduleKind, shifts: Vec<WfmShift>) {
        self.shifts.lock().await.insert(kind.as_str(), shifts);
    }
}

#[async_trait]
impl WfmShiftSource for StaticSource {
    async fn list_shifts(
        &self,
        _bu_id: &str,
        kind: ScheduleKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WfmShift>> {
        let guard = self.shifts.lock().await;
        Ok(guard
            .get(kind.as_str())
            .map(|all| {
                all.iter()
                    .filter(|s| s.start >= start && s.start < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontEndCall {
    Approve { request_id: String },
    Share,
    Upsert { wfm_id: String, frontend_id: String },
    Delete { frontend_id: String },
}

/// Front-end double: new shifts get `fe-{wfm_id}`; ids in `refuse` fail.
#[derive(Clone, Default)]
pub struct RecordingFrontEnd {
    calls: Arc<Mutex<Vec<FrontEndCall>>>,
    refuse: Arc<Mutex<HashSet<String>>>,
    fail_approvals: Arc<Mutex<usize>>,
}

impl RecordingFrontEnd {
    pub async fn refuse(&self, wfm_id: &str) {
        self.refuse.lock().await.insert(wfm_id.to_string());
    }

    pub async fn fail_next_approvals(&self, n: usize) {
        *self.fail_approvals.lock().await = n;
    }

    pub async fn calls(&self) -> Vec<FrontEndCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl FrontEnd for RecordingFrontEnd {
    async fn approve_swap_request(&self, _team_id: &str, request_id: &str, _message: &str) -> Result<()> {
        let mut failing = self.fail_approvals.lock().await;
        if *failing > 0 {
            *failing -= 1;
            return Err(anyhow::anyhow!("front end unavailable"));
        }
        self.calls.lock().await.push(FrontEndCall::Approve {
            request_id: request_id.to_string(),
        });
        Ok(())
    }

    async fn share_schedule(&self, _team_id: &str, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<()> {
        self.calls.lock().await.push(FrontEndCall::Share);
        Ok(())
    }

    async fn upsert_shift(&self, _team_id: &str, _kind: ScheduleKind, record: &ShiftRecord) -> Result<String> {
        if self.refuse.lock().await.contains(&record.wfm_id) {
            return Err(anyhow::anyhow!("refused {}", record.wfm_id));
        }
        let frontend_id = if record.frontend_id.is_empty() {
            format!("fe-{}", record.wfm_id)
        } else {
            record.frontend_id.clone()
        };
        self.calls.lock().await.push(FrontEndCall::Upsert {
            wfm_id: record.wfm_id.clone(),
            frontend_id: frontend_id.clone(),
        });
        Ok(frontend_id)
    }

    async fn delete_shift(&self, _team_id: &str, _kind: ScheduleKind, frontend_id: &str) -> Result<()> {
        self.calls.lock().await.push(FrontEndCall::Delete {
            frontend_id: frontend_id.to_string(),
        });
        Ok(())
    }
}

pub struct Harness {
    pub pool: Pool,
    pub wfm: RecordingWfm,
    pub dispatcher: Dispatcher,
}

pub async fn harness_with(wfm: RecordingWfm, settings: EngineSettings) -> Harness {
    let pool = db::memory_pool().await.unwrap();
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let shared = Arc::new(wfm.clone());
    let services = Services {
        pool: pool.clone(),
        settings,
        wfm: shared.clone(),
        queries: shared,
        directory: store.clone(),
        connections: store.clone(),
        scheduler: store.clone(),
        requests: store,
    };
    Harness {
        pool,
        wfm,
        dispatcher: Dispatcher::new(services),
    }
}

pub async fn harness(wfm: RecordingWfm) -> Harness {
    harness_with(wfm, settings()).await
}
