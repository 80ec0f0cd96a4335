//! JSON client for the WFM REST facade.
//!
//! Every action is a POST of the command to a fixed path. A 2xx or 4xx reply
//! carrying a [`GatewayResult`] is a business answer; anything else is a
//! transport failure and comes back as `Err`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

use crate::config::Remote;
use crate::gateway::{
    AvailabilityModel, GatewayResult, OpenShiftCommand, SwapCommand, WfmActions, WfmQueries,
    WfmShift, WfmShiftSource,
};
use crate::model::{EmployeeRecord, ScheduleKind, ShiftRecord};
use crate::wfm::model::{
    AssignOpenShift, OpenShiftDecision, ShiftQuery, SwapDecision, SwapTargetsQuery, SwapTargetsResp,
};

pub mod model;

#[derive(Clone)]
pub struct WfmClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for WfmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WfmClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl WfmClient {
    pub fn new(token: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("shiftbridge/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }

    pub fn from_config(remote: &Remote) -> Result<Self> {
        let base_url = Url::parse(&remote.base_url).context("invalid wfm.base_url")?;
        Ok(Self::new(remote.token.clone(), base_url))
    }

    pub fn build_request<B: Serialize + ?Sized>(&self, method: Method, path: &str, body: &B) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid WFM path {path}"))?;
        self.http
            .request(method, endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .context("failed to build WFM request")
    }

    async fn call<B: Serialize + ?Sized + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<(StatusCode, Option<T>)> {
        let request = self.build_request(method, path, body)?;
        debug!(url = %request.url(), "WFM request");
        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach WFM at {path}"))?;
        let status = res.status();
        let text = res.text().await.context("failed to read WFM response")?;

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            warn!(%status, path, "WFM unavailable");
            return Err(anyhow!("WFM error {status}: {text}"));
        }
        if text.trim().is_empty() {
            return Ok((status, None));
        }
        match serde_json::from_str::<T>(&text) {
            Ok(parsed) => Ok((status, Some(parsed))),
            Err(err) if status.is_success() => {
                Err(err).with_context(|| format!("invalid WFM response from {path}"))
            }
            Err(_) => Err(anyhow!("WFM error {status}: {text}")),
        }
    }

    /// Business call: the reply is a [`GatewayResult`], also on 4xx.
    async fn act<B: Serialize + ?Sized + Sync>(&self, path: &str, body: &B) -> Result<GatewayResult> {
        let (status, result) = self.call::<B, GatewayResult>(Method::POST, path, body).await?;
        let result = match result {
            Some(result) => result,
            None if status.is_success() => GatewayResult::ok(),
            None => GatewayResult::rejected(status.as_str(), "WFM rejected the request"),
        };
        if !result.success {
            warn!(path, code = ?result.error_code, "WFM rejected action");
        }
        Ok(result)
    }
}

#[async_trait]
impl WfmActions for WfmClient {
    async fn create_shift_swap(&self, cmd: &SwapCommand) -> Result<GatewayResult> {
        self.act("swaps", cmd).await
    }

    async fn recipient_approve_swap(&self, cmd: &SwapCommand, approve: bool) -> Result<GatewayResult> {
        self.act("swaps/recipientDecision", &SwapDecision { command: cmd, approve })
            .await
    }

    async fn manager_approve_swap(&self, cmd: &SwapCommand, approve: bool) -> Result<GatewayResult> {
        self.act("swaps/managerDecision", &SwapDecision { command: cmd, approve })
            .await
    }

    async fn cancel_swap(&self, cmd: &SwapCommand) -> Result<GatewayResult> {
        self.act("swaps/cancel", cmd).await
    }

    async fn create_open_shift_request(&self, cmd: &OpenShiftCommand) -> Result<GatewayResult> {
        self.act("openShiftRequests", cmd).await
    }

    async fn manager_approve_open_shift_request(
        &self,
        cmd: &OpenShiftCommand,
        approve: bool,
    ) -> Result<GatewayResult> {
        self.act(
            "openShiftRequests/managerDecision",
            &OpenShiftDecision { command: cmd, approve },
        )
        .await
    }

    async fn cancel_open_shift_request(&self, cmd: &OpenShiftCommand) -> Result<GatewayResult> {
        self.act("openShiftRequests/cancel", cmd).await
    }

    async fn manager_assign_open_shift(
        &self,
        bu_id: &str,
        open_shift: &ShiftRecord,
        manager: Option<&EmployeeRecord>,
        employee: &EmployeeRecord,
    ) -> Result<GatewayResult> {
        let body = AssignOpenShift {
            bu_id,
            open_shift,
            manager,
            employee,
        };
        self.act("openShifts/assign", &body).await
    }

    async fn update_employee_availability(&self, model: &AvailabilityModel) -> Result<GatewayResult> {
        self.act("availability", model).await
    }
}

#[async_trait]
impl WfmQueries for WfmClient {
    async fn get_eligible_swap_targets(
        &self,
        shift: &ShiftRecord,
        employee: &EmployeeRecord,
        bu_id: &str,
    ) -> Result<Vec<String>> {
        let query = SwapTargetsQuery {
            bu_id,
            shift,
            employee,
        };
        let (status, resp) = self
            .call::<_, SwapTargetsResp>(Method::POST, "swaps/eligibleTargets", &query)
            .await?;
        if !status.is_success() {
            return Err(anyhow!("WFM eligibility query failed with {status}"));
        }
        Ok(resp.unwrap_or_default().shift_ids)
    }
}

#[async_trait]
impl WfmShiftSource for WfmClient {
    async fn list_shifts(
        &self,
        bu_id: &str,
        kind: ScheduleKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WfmShift>> {
        let query = ShiftQuery {
            bu_id,
            kind: kind.as_str(),
            start,
            end,
        };
        let (status, shifts) = self
            .call::<_, Vec<WfmShift>>(Method::POST, "shifts/query", &query)
            .await?;
        if !status.is_success() {
            return Err(anyhow!("WFM shift query failed with {status}"));
        }
        Ok(shifts.unwrap_or_default())
    }
}
