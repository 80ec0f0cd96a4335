//! Collaborator interfaces the dispatch engine and sync job depend on.
//!
//! Transport failures come back as `Err`. A business rejection from the WFM
//! side is a successful call returning a [`GatewayResult`] with
//! `success == false`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{
    AvailabilityItem, CachedResult, Connection, DeferredKind, EmployeeRecord, ScheduleKind,
    ShiftRecord,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResult {
    pub success: bool,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Id of an entity the call created on the WFM side, when any.
    #[serde(default)]
    pub entity_id: Option<String>,
}

impl GatewayResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn ok_with_id(id: impl Into<String>) -> Self {
        Self {
            success: true,
            entity_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            entity_id: None,
        }
    }

    /// Ledger form: 200 on success, otherwise 400 with the provider's code and message.
    pub fn to_cached(&self) -> CachedResult {
        if self.success {
            CachedResult::success()
        } else {
            CachedResult::failure(
                400,
                self.error_code.clone().unwrap_or_else(|| "WfmError".into()),
                self.error_message.clone().unwrap_or_default(),
            )
        }
    }
}

/// Everything the WFM side needs to act on a swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapCommand {
    pub wfm_request_id: Option<String>,
    pub bu_id: String,
    pub time_zone_id: String,
    pub sender: EmployeeRecord,
    pub recipient: EmployeeRecord,
    pub sender_shift: ShiftRecord,
    pub recipient_shift: ShiftRecord,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenShiftCommand {
    pub wfm_request_id: Option<String>,
    pub bu_id: String,
    pub time_zone_id: String,
    pub open_shift: ShiftRecord,
    pub employee: EmployeeRecord,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityModel {
    pub bu_id: String,
    pub time_zone_id: String,
    pub employee: EmployeeRecord,
    pub availability: Vec<AvailabilityItem>,
}

/// A shift or open shift as the WFM side reports it during pull sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WfmShift {
    pub wfm_id: String,
    #[serde(default)]
    pub wfm_employee_id: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "one")]
    pub quantity: i32,
    #[serde(default)]
    pub department: Option<String>,
}

fn one() -> i32 {
    1
}

#[async_trait]
pub trait WfmActions: Send + Sync {
    async fn create_shift_swap(&self, cmd: &SwapCommand) -> Result<GatewayResult>;

    async fn recipient_approve_swap(&self, cmd: &SwapCommand, approve: bool) -> Result<GatewayResult>;

    async fn manager_approve_swap(&self, cmd: &SwapCommand, approve: bool) -> Result<GatewayResult>;

    async fn cancel_swap(&self, cmd: &SwapCommand) -> Result<GatewayResult>;

    async fn create_open_shift_request(&self, cmd: &OpenShiftCommand) -> Result<GatewayResult>;

    /// On approval the result may carry the id of the newly assigned shift.
    async fn manager_approve_open_shift_request(
        &self,
        cmd: &OpenShiftCommand,
        approve: bool,
    ) -> Result<GatewayResult>;

    async fn cancel_open_shift_request(&self, cmd: &OpenShiftCommand) -> Result<GatewayResult>;

    async fn manager_assign_open_shift(
        &self,
        bu_id: &str,
        open_shift: &ShiftRecord,
        manager: Option<&EmployeeRecord>,
        employee: &EmployeeRecord,
    ) -> Result<GatewayResult>;

    async fn update_employee_availability(&self, model: &AvailabilityModel) -> Result<GatewayResult>;
}

#[async_trait]
pub trait WfmQueries: Send + Sync {
    /// WFM ids of shifts the employee could take in exchange for `shift`.
    async fn get_eligible_swap_targets(
        &self,
        shift: &ShiftRecord,
        employee: &EmployeeRecord,
        bu_id: &str,
    ) -> Result<Vec<String>>;
}

#[async_trait]
pub trait WfmShiftSource: Send + Sync {
    async fn list_shifts(
        &self,
        bu_id: &str,
        kind: ScheduleKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WfmShift>>;
}

#[async_trait]
pub trait EmployeeDirectory: Send + Sync {
    /// Look up by either the front-end or the WFM identity.
    async fn get_employee(&self, id: &str) -> Result<Option<EmployeeRecord>>;
}

#[async_trait]
pub trait ConnectionLookup: Send + Sync {
    async fn get_connection(&self, team_id: &str) -> Result<Option<Connection>>;

    async fn list_connections(&self) -> Result<Vec<Connection>>;
}

#[async_trait]
pub trait DeferredScheduler: Send + Sync {
    /// Fire and continue: the action runs later on the worker loop.
    async fn schedule(&self, kind: DeferredKind, delay_seconds: u64, payload: &Value) -> Result<()>;
}

#[async_trait]
pub trait RequestCache: Send + Sync {
    async fn save_request(&self, team_id: &str, request_id: &str, body: &str) -> Result<()>;

    async fn load_request(&self, team_id: &str, request_id: &str) -> Result<Option<String>>;

    async fn delete_request(&self, team_id: &str, request_id: &str) -> Result<()>;
}

/// Calls back into the front-end scheduling service.
#[async_trait]
pub trait FrontEnd: Send + Sync {
    async fn approve_swap_request(&self, team_id: &str, request_id: &str, message: &str) -> Result<()>;

    async fn share_schedule(&self, team_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()>;

    /// Create (empty `frontend_id`) or replace a shift; returns its front-end id.
    async fn upsert_shift(&self, team_id: &str, kind: ScheduleKind, record: &ShiftRecord) -> Result<String>;

    async fn delete_shift(&self, team_id: &str, kind: ScheduleKind, frontend_id: &str) -> Result<()>;
}
