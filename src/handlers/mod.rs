//! Change classification and the ordered handler registry.
//!
//! Every handler declares which batch shape it accepts through a side-effect
//! free [`ChangeHandler::can_handle`]. The [`Dispatcher`] tries them in a fixed
//! priority order; the first match processes the batch and no other handler
//! sees it.

/// Unwrap a lookup that either produced a value or a finished outcome.
macro_rules! resolve {
    ($lookup:expr) => {
        match $lookup {
            Ok(value) => value,
            Err(outcome) => return Ok(outcome),
        }
    };
}

mod open_shift;
mod preferences;
mod shift;
mod swap;

pub use open_shift::{
    CancelOpenShiftRequest, ManagerAssignOpenShift, ManagerOpenShiftRequest,
    SenderCreateOpenShiftRequest,
};
pub use preferences::UpdateShiftPreferences;
pub use shift::{DeleteShift, UnsupportedOpenShiftEdit, UnsupportedShiftEdit};
pub use swap::{
    CancelSwap, EligibilityFilter, ManagerSwapDecision, RecipientSwapDecision, SenderCreateSwap,
};

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::classify::{classify, ClassifiedItem};
use crate::config::{Config, EngineSettings};
use crate::db::{Pool, SqliteStore};
use crate::wfm::WfmClient;
use crate::error::ErrorCode;
use crate::gateway::{
    ConnectionLookup, DeferredScheduler, EmployeeDirectory, RequestCache, WfmActions, WfmQueries,
};
use crate::model::{
    ChangeBatch, ChangeOutcome, ChangeResponse, Connection, EmployeeRecord, HttpMethod, ShiftBody,
};

/// A lookup result, or the outcome to answer with when the lookup failed.
pub(crate) type Resolved<T> = std::result::Result<T, ChangeOutcome>;

/// Shared state and collaborators handed to every handler.
#[derive(Clone)]
pub struct Services {
    pub pool: Pool,
    pub settings: EngineSettings,
    pub wfm: Arc<dyn WfmActions>,
    pub queries: Arc<dyn WfmQueries>,
    pub directory: Arc<dyn EmployeeDirectory>,
    pub connections: Arc<dyn ConnectionLookup>,
    pub scheduler: Arc<dyn DeferredScheduler>,
    pub requests: Arc<dyn RequestCache>,
}

impl Services {
    /// Production wiring: SQLite-backed lookups and the WFM REST client.
    pub fn from_config(cfg: &Config, pool: Pool) -> Result<Self> {
        let store = Arc::new(SqliteStore::new(pool.clone()));
        let wfm = Arc::new(WfmClient::from_config(&cfg.wfm)?);
        Ok(Self {
            pool,
            settings: cfg.engine_settings(),
            wfm: wfm.clone(),
            queries: wfm,
            directory: store.clone(),
            connections: store.clone(),
            scheduler: store.clone(),
            requests: store,
        })
    }
}

/// The batch as seen by the selected handler.
pub struct HandlerRequest<'a> {
    pub batch: &'a ChangeBatch,
    pub items: &'a [ClassifiedItem<'a>],
    pub matched: &'a ClassifiedItem<'a>,
    pub team_id: &'a str,
}

#[async_trait]
pub trait ChangeHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index of the item this handler would process, if it accepts the batch.
    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize>;

    async fn handle(&self, services: &Services, request: &HandlerRequest<'_>) -> Result<ChangeOutcome>;
}

/// Registry order. More specific shapes come first.
pub fn default_handlers() -> Vec<Box<dyn ChangeHandler>> {
    vec![
        Box::new(EligibilityFilter),
        Box::new(ManagerAssignOpenShift),
        Box::new(SenderCreateSwap),
        Box::new(RecipientSwapDecision),
        Box::new(ManagerSwapDecision),
        Box::new(CancelSwap),
        Box::new(SenderCreateOpenShiftRequest),
        Box::new(ManagerOpenShiftRequest),
        Box::new(CancelOpenShiftRequest),
        Box::new(UpdateShiftPreferences),
        Box::new(DeleteShift),
        Box::new(UnsupportedShiftEdit),
        Box::new(UnsupportedOpenShiftEdit),
    ]
}

pub struct Dispatcher {
    services: Services,
    handlers: Vec<Box<dyn ChangeHandler>>,
}

impl Dispatcher {
    pub fn new(services: Services) -> Self {
        Self::with_handlers(services, default_handlers())
    }

    pub fn with_handlers(services: Services, handlers: Vec<Box<dyn ChangeHandler>>) -> Self {
        Self { services, handlers }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// First handler accepting the batch and the item it matched.
    pub fn select(&self, items: &[ClassifiedItem<'_>]) -> Option<(&dyn ChangeHandler, usize)> {
        self.handlers
            .iter()
            .find_map(|h| h.can_handle(items).map(|idx| (h.as_ref(), idx)))
    }

    /// Process one webhook delivery. Never fails as a whole: errors become
    /// per-item outcomes.
    #[instrument(skip_all, fields(team_id, items = batch.requests.len()))]
    pub async fn dispatch(&self, batch: &ChangeBatch, team_id: &str) -> ChangeResponse {
        let items = classify(batch);
        let Some((handler, matched)) = self.select(&items) else {
            warn!(team_id, "no handler accepts this batch");
            return ChangeResponse::uniform(
                batch,
                &ChangeOutcome::error(400, ErrorCode::NotSupported, "No handler accepts this change"),
            );
        };

        let request = HandlerRequest {
            batch,
            items: &items,
            matched: &items[matched],
            team_id,
        };
        let outcome = match handler.handle(&self.services, &request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(?err, handler = handler.name(), team_id, "handler failed");
                ChangeOutcome::internal(format!("{err:#}"))
            }
        };
        info!(handler = handler.name(), team_id, status = outcome.status, "change processed");
        ChangeResponse::mirror(batch, matched, &outcome)
    }
}

/// Deserialize a body; any failure reads as "no such change request".
pub(crate) fn parse_body<T: DeserializeOwned>(item: &ClassifiedItem<'_>) -> Option<T> {
    let body = item.body()?;
    match serde_json::from_value(body.clone()) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(%err, item = %item.item.id, "malformed change body");
            None
        }
    }
}

pub(crate) fn parse_cached<T: DeserializeOwned>(raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(%err, "malformed cached request");
            None
        }
    }
}

pub(crate) fn change_request_not_found(id: &str) -> ChangeOutcome {
    ChangeOutcome::not_found(
        ErrorCode::ChangeRequestNotFound,
        format!("Change request {id} was not found"),
    )
}

pub(crate) fn connection_not_found(team_id: &str) -> ChangeOutcome {
    ChangeOutcome::not_found(
        ErrorCode::ConnectionNotFound,
        format!("No WFM connection is configured for team {team_id}"),
    )
}

pub(crate) fn user_not_found(user_id: &str) -> ChangeOutcome {
    ChangeOutcome::not_found(
        ErrorCode::UserCredentialsNotFound,
        format!("User {user_id} is not mapped to a WFM employee"),
    )
}

pub(crate) async fn connection(services: &Services, team_id: &str) -> Result<Resolved<Connection>> {
    Ok(services
        .connections
        .get_connection(team_id)
        .await?
        .filter(|c| c.enabled)
        .ok_or_else(|| connection_not_found(team_id)))
}

pub(crate) async fn employee(services: &Services, user_id: &str) -> Result<Resolved<EmployeeRecord>> {
    Ok(services
        .directory
        .get_employee(user_id)
        .await?
        .ok_or_else(|| user_not_found(user_id)))
}

/// Shifts created by the front end in the same batch.
pub(crate) fn created_shifts(items: &[ClassifiedItem<'_>]) -> Vec<ShiftBody> {
    items
        .iter()
        .filter(|i| i.is_shift() && i.method() == HttpMethod::Post)
        .filter_map(parse_body::<ShiftBody>)
        .collect()
}
