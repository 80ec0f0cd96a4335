use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::error::ErrorCode;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// One sub-request of a webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeItem {
    pub id: String,
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// One webhook delivery: an ordered set of related change items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChangeBatch {
    pub requests: Vec<ChangeItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Result of processing one change item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeOutcome {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

pub const STATUS_PROCESSING: u16 = 102;

impl ChangeOutcome {
    pub fn ok() -> Self {
        Self {
            status: 200,
            body: None,
            error: None,
        }
    }

    pub fn ok_with(body: Value) -> Self {
        Self {
            status: 200,
            body: Some(body),
            error: None,
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
            error: None,
        }
    }

    /// Another delivery of the same step is still running; the caller retries later.
    pub fn processing() -> Self {
        Self::error(
            STATUS_PROCESSING,
            ErrorCode::RequestInProgress,
            "The request is being processed, retry later",
        )
    }

    pub fn error(status: u16, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: None,
            error: Some(ErrorBody {
                code: code.as_str().to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn not_found(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::error(404, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::error(500, ErrorCode::InternalError, message)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<&CachedResult> for ChangeOutcome {
    fn from(cached: &CachedResult) -> Self {
        let error = match (&cached.error_code, &cached.error_message) {
            (None, None) => None,
            (code, message) => Some(ErrorBody {
                code: code.clone().unwrap_or_default(),
                message: message.clone().unwrap_or_default(),
            }),
        };
        Self {
            status: cached.status_code,
            body: None,
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemResponse {
    pub id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Batch-level response mirroring the inbound item ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChangeResponse {
    pub responses: Vec<ItemResponse>,
}

impl ChangeResponse {
    /// Build a response where the matched item carries `outcome` and every other
    /// item reports plain success, or the same failure when the outcome failed.
    pub fn mirror(batch: &ChangeBatch, matched: usize, outcome: &ChangeOutcome) -> Self {
        let responses = batch
            .requests
            .iter()
            .enumerate()
            .map(|(idx, item)| {
                if idx == matched || !outcome.is_success() {
                    ItemResponse::from_outcome(&item.id, outcome)
                } else {
                    ItemResponse::from_outcome(&item.id, &ChangeOutcome::ok())
                }
            })
            .collect();
        Self { responses }
    }

    /// Every item gets the same outcome.
    pub fn uniform(batch: &ChangeBatch, outcome: &ChangeOutcome) -> Self {
        Self {
            responses: batch
                .requests
                .iter()
                .map(|item| ItemResponse::from_outcome(&item.id, outcome))
                .collect(),
        }
    }
}

impl ItemResponse {
    fn from_outcome(id: &str, outcome: &ChangeOutcome) -> Self {
        let body = match (&outcome.body, &outcome.error) {
            (Some(body), None) => Some(body.clone()),
            (Some(body), Some(err)) => {
                let mut body = body.clone();
                if let Some(map) = body.as_object_mut() {
                    map.insert("error".into(), json!(err));
                }
                Some(body)
            }
            (None, Some(err)) => Some(json!({ "error": err })),
            (None, None) => None,
        };
        Self {
            id: id.to_string(),
            status: outcome.status,
            body,
        }
    }
}

/// One schedulable unit of work correlated across both systems.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShiftRecord {
    pub frontend_id: String,
    pub wfm_id: String,
    #[serde(default)]
    pub frontend_employee_id: String,
    #[serde(default)]
    pub wfm_employee_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Greater than one only for open shifts.
    pub quantity: i32,
    #[serde(default)]
    pub department: Option<String>,
}

impl ShiftRecord {
    pub fn week_start(&self) -> NaiveDate {
        week_start(self.start)
    }
}

/// Front-end identity mapped to the WFM identity. Read-only here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmployeeRecord {
    pub frontend_id: String,
    pub wfm_id: String,
    pub login_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Per-team integration settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub team_id: String,
    pub wfm_bu_id: String,
    pub time_zone_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActorRole {
    Sender,
    Recipient,
    Manager,
}

impl ActorRole {
    pub const ALL: [ActorRole; 3] = [ActorRole::Sender, ActorRole::Recipient, ActorRole::Manager];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::Sender => "sender",
            ActorRole::Recipient => "recipient",
            ActorRole::Manager => "manager",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sender" => Some(ActorRole::Sender),
            "recipient" => Some(ActorRole::Recipient),
            "manager" => Some(ActorRole::Manager),
            _ => None,
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum LedgerStatus {
    #[default]
    NotStarted,
    InProgress,
    Complete,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::NotStarted => "NotStarted",
            LedgerStatus::InProgress => "InProgress",
            LedgerStatus::Complete => "Complete",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "InProgress" => LedgerStatus::InProgress,
            "Complete" => LedgerStatus::Complete,
            _ => LedgerStatus::NotStarted,
        }
    }
}

/// Outcome remembered for one actor's step so redeliveries replay it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedResult {
    pub status_code: u16,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl CachedResult {
    pub fn success() -> Self {
        Self {
            status_code: 200,
            error_code: None,
            error_message: None,
        }
    }

    pub fn failure(status_code: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Actor transition derived once from the raw `state` and `assignedTo` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    SenderPending,
    RecipientPending,
    RecipientApproved,
    RecipientDeclined,
    ManagerApproved,
    ManagerDeclined,
    SystemDeclined,
}

impl Transition {
    pub fn from_fields(state: &str, assigned_to: &str) -> Option<Self> {
        let state = state.trim().to_ascii_lowercase();
        let assigned_to = assigned_to.trim().to_ascii_lowercase();
        match (state.as_str(), assigned_to.as_str()) {
            ("pending", "sender") => Some(Transition::SenderPending),
            ("pending", "recipient") => Some(Transition::RecipientPending),
            ("pending", "manager") => Some(Transition::RecipientApproved),
            ("declined", "recipient") => Some(Transition::RecipientDeclined),
            ("approved", "manager") => Some(Transition::ManagerApproved),
            ("declined", "manager") => Some(Transition::ManagerDeclined),
            ("declined", "system") => Some(Transition::SystemDeclined),
            _ => None,
        }
    }

    /// Whether the acting party said yes.
    pub fn is_approval(&self) -> bool {
        matches!(
            self,
            Transition::RecipientApproved | Transition::ManagerApproved
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ScheduleKind {
    Shifts,
    OpenShifts,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Shifts => "shifts",
            ScheduleKind::OpenShifts => "open_shifts",
        }
    }
}

/// Cache partition owner: a team's shift schedule or its open-shift sub-schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScheduleId(String);

impl ScheduleId {
    pub fn new(team_id: &str, kind: ScheduleKind) -> Self {
        match kind {
            ScheduleKind::Shifts => Self::shifts(team_id),
            ScheduleKind::OpenShifts => Self::open_shifts(team_id),
        }
    }

    pub fn shifts(team_id: &str) -> Self {
        Self(team_id.to_string())
    }

    pub fn open_shifts(team_id: &str) -> Self {
        Self(format!("{team_id}_openshifts"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monday (UTC) of the week containing `at`.
pub fn week_start(at: DateTime<Utc>) -> NaiveDate {
    let date = at.date_naive();
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// `[monday 00:00, next monday 00:00)` in UTC.
pub fn week_bounds(week: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let midnight = week.and_hms_opt(0, 0, 0).expect("midnight is a valid time");
    let start = Utc.from_utc_datetime(&midnight);
    (start, start + Duration::days(7))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeferredKind {
    ManagerAutoApproveSwap,
    ShareSchedule,
}

impl DeferredKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferredKind::ManagerAutoApproveSwap => "manager_auto_approve_swap",
            DeferredKind::ShareSchedule => "share_schedule",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manager_auto_approve_swap" => Some(DeferredKind::ManagerAutoApproveSwap),
            "share_schedule" => Some(DeferredKind::ShareSchedule),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoApprovePayload {
    pub team_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SharePayload {
    pub team_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

// Inbound bodies.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SwapRequestBody {
    pub id: String,
    pub sender_shift_id: String,
    pub recipient_shift_id: String,
    pub sender_user_id: String,
    pub recipient_user_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub assigned_to: String,
    #[serde(default)]
    pub sender_message: Option<String>,
    #[serde(default)]
    pub recipient_action_message: Option<String>,
    #[serde(default)]
    pub manager_action_message: Option<String>,
}

impl SwapRequestBody {
    pub fn txn_key(&self) -> String {
        format!("{}_{}", self.sender_shift_id, self.recipient_shift_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenShiftRequestBody {
    pub id: String,
    pub open_shift_id: String,
    pub sender_user_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub assigned_to: String,
    #[serde(default)]
    pub sender_message: Option<String>,
    #[serde(default)]
    pub manager_action_message: Option<String>,
}

impl OpenShiftRequestBody {
    pub fn txn_key(&self) -> String {
        format!("{}_{}", self.open_shift_id, self.sender_user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShiftSlot {
    pub start_date_time: DateTime<Utc>,
    pub end_date_time: DateTime<Utc>,
    #[serde(default)]
    pub open_slot_count: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastModifiedBy {
    pub user: Option<Identity>,
}

/// Shift or open shift body as the front end sends it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShiftBody {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub scheduling_group_id: Option<String>,
    #[serde(default)]
    pub shared_shift: Option<ShiftSlot>,
    #[serde(default)]
    pub draft_shift: Option<ShiftSlot>,
    #[serde(default)]
    pub is_staged_for_deletion: bool,
    #[serde(default)]
    pub last_modified_by: Option<LastModifiedBy>,
}

impl ShiftBody {
    /// The slot the user sees: the draft when one exists, else the shared one.
    pub fn slot(&self) -> Option<&ShiftSlot> {
        self.draft_shift.as_ref().or(self.shared_shift.as_ref())
    }

    pub fn modified_by(&self) -> Option<&str> {
        self.last_modified_by
            .as_ref()
            .and_then(|m| m.user.as_ref())
            .map(|u| u.id.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlot {
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityItem {
    #[serde(default)]
    pub days_of_week: Vec<String>,
    #[serde(default)]
    pub time_slots: Vec<TimeSlot>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShiftPreferenceBody {
    pub id: String,
    #[serde(default)]
    pub availability: Vec<AvailabilityItem>,
}
