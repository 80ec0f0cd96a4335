use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::{OpenShiftCommand, SwapCommand};
use crate::model::{EmployeeRecord, ShiftRecord};

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SwapDecision<'a> {
    #[serde(flatten)]
    pub command: &'a SwapCommand,
    pub approve: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OpenShiftDecision<'a> {
    #[serde(flatten)]
    pub command: &'a OpenShiftCommand,
    pub approve: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AssignOpenShift<'a> {
    pub bu_id: &'a str,
    pub open_shift: &'a ShiftRecord,
    pub manager: Option<&'a EmployeeRecord>,
    pub employee: &'a EmployeeRecord,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SwapTargetsQuery<'a> {
    pub bu_id: &'a str,
    pub shift: &'a ShiftRecord,
    pub employee: &'a EmployeeRecord,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SwapTargetsResp {
    #[serde(default)]
    pub shift_ids: Vec<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ShiftQuery<'a> {
    pub bu_id: &'a str,
    pub kind: &'a str,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}
