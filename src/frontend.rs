//! JSON client for the front-end scheduling service.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::Remote;
use crate::gateway::FrontEnd;
use crate::model::{ScheduleKind, ShiftRecord};

#[derive(Clone)]
pub struct FrontEndClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for FrontEndClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrontEndClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct CreatedEntity {
    id: String,
}

fn collection(kind: ScheduleKind) -> &'static str {
    match kind {
        ScheduleKind::Shifts => "shifts",
        ScheduleKind::OpenShifts => "openShifts",
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Body of a shift or open shift write. Content is published directly, so
/// only the shared slot is set.
pub fn build_shift_body(kind: ScheduleKind, record: &ShiftRecord) -> Value {
    match kind {
        ScheduleKind::Shifts => json!({
            "userId": record.frontend_employee_id,
            "schedulingGroupId": record.department,
            "sharedShift": {
                "startDateTime": timestamp(record.start),
                "endDateTime": timestamp(record.end),
            },
        }),
        ScheduleKind::OpenShifts => json!({
            "schedulingGroupId": record.department,
            "sharedOpenShift": {
                "startDateTime": timestamp(record.start),
                "endDateTime": timestamp(record.end),
                "openSlotCount": record.quantity,
            },
        }),
    }
}

impl FrontEndClient {
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
        let base_url = Url::parse(&remote.base_url).context("invalid frontend.base_url")?;
        Ok(Self::new(remote.token.clone(), base_url))
    }

    pub fn build_request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid front-end path {path}"))?;
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("Authorization", format!("Bearer {}", self.token));
        if let Some(body) = body {
            builder = builder.header("Content-Type", "application/json").json(body);
        }
        builder.build().context("failed to build front-end request")
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<(StatusCode, String)> {
        let request = self.build_request(method, path, body)?;
        debug!(method = %request.method(), url = %request.url(), "front-end request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach the front end")?;
        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        Ok((status, text))
    }
}

#[async_trait]
impl FrontEnd for FrontEndClient {
    async fn approve_swap_request(&self, team_id: &str, request_id: &str, message: &str) -> Result<()> {
        let path = format!("teams/{team_id}/schedule/swapShiftsChangeRequests/{request_id}/approve");
        let (status, text) = self
            .send(Method::POST, &path, Some(&json!({ "message": message })))
            .await?;
        if !status.is_success() {
            return Err(anyhow!("swap approval failed {status}: {text}"));
        }
        info!(team_id, request_id, "swap request approved on the front end");
        Ok(())
    }

    async fn share_schedule(&self, team_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
        let body = json!({
            "notifyTeam": false,
            "startDateTime": timestamp(start),
            "endDateTime": timestamp(end),
        });
        let path = format!("teams/{team_id}/schedule/share");
        let (status, text) = self.send(Method::POST, &path, Some(&body)).await?;
        if !status.is_success() {
            return Err(anyhow!("schedule share failed {status}: {text}"));
        }
        Ok(())
    }

    async fn upsert_shift(&self, team_id: &str, kind: ScheduleKind, record: &ShiftRecord) -> Result<String> {
        let body = build_shift_body(kind, record);
        let base = format!("teams/{team_id}/schedule/{}", collection(kind));
        let (method, path) = if record.frontend_id.is_empty() {
            (Method::POST, base)
        } else {
            (Method::PUT, format!("{base}/{}", record.frontend_id))
        };
        let (status, text) = self.send(method, &path, Some(&body)).await?;
        if !status.is_success() {
            return Err(anyhow!("shift write failed {status}: {text}"));
        }
        if text.trim().is_empty() {
            return Ok(record.frontend_id.clone());
        }
        let created: CreatedEntity =
            serde_json::from_str(&text).context("invalid front-end shift response")?;
        Ok(created.id)
    }

    async fn delete_shift(&self, team_id: &str, kind: ScheduleKind, frontend_id: &str) -> Result<()> {
        let path = format!("teams/{team_id}/schedule/{}/{frontend_id}", collection(kind));
        let (status, text) = self.send(Method::DELETE, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            warn!(team_id, frontend_id, "shift already deleted on the front end");
            return Ok(());
        }
        if !status.is_success() {
            return Err(anyhow!("shift delete failed {status}: {text}"));
        }
        Ok(())
    }
}
