//! Plain shift and open shift changes. The WFM side owns shift content, so
//! only deletions are accepted.

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{ChangeHandler, HandlerRequest, Services};
use crate::classify::{ClassifiedItem, Route};
use crate::db::cache;
use crate::error::ErrorCode;
use crate::model::{ChangeOutcome, HttpMethod, ScheduleId};

const STAGED_FOR_DELETION: &str = "isStagedForDeletion";

fn is_delete(item: &ClassifiedItem<'_>) -> bool {
    match item.method() {
        HttpMethod::Delete => true,
        HttpMethod::Put | HttpMethod::Patch => item.body_flag(STAGED_FOR_DELETION),
        _ => false,
    }
}

/// Either phase of a front-end delete: the staged (draft) PUT or the
/// committed DELETE.
pub struct DeleteShift;

#[async_trait]
impl ChangeHandler for DeleteShift {
    fn name(&self) -> &'static str {
        "delete_shift"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        items.iter().position(|i| i.is_shift() && is_delete(i))
    }

    #[instrument(skip_all, fields(team_id = request.team_id))]
    async fn handle(&self, services: &Services, request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        let Route::Shift { id } = &request.matched.route else {
            return Ok(ChangeOutcome::error(400, ErrorCode::InvalidRequest, "Not a shift"));
        };
        let schedule = ScheduleId::shifts(request.team_id);
        let Some(record) = cache::find_shift(&services.pool, &schedule, id).await? else {
            debug!(shift_id = %id, "shift already gone from cache");
            return Ok(ChangeOutcome::ok());
        };

        let week = record.week_start();
        cache::update(&services.pool, &services.settings, &schedule, week, |leased| {
            leased.remove(id);
        })
        .await?;
        info!(shift_id = %id, wfm_id = %record.wfm_id, %week, "shift removed from cache");
        Ok(ChangeOutcome::ok())
    }
}

fn not_supported(what: &str) -> ChangeOutcome {
    ChangeOutcome::error(
        403,
        ErrorCode::NotSupported,
        format!("Editing {what} is not supported; make the change in the WFM system"),
    )
}

pub struct UnsupportedShiftEdit;

#[async_trait]
impl ChangeHandler for UnsupportedShiftEdit {
    fn name(&self) -> &'static str {
        "unsupported_shift_edit"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        items.iter().position(|i| {
            i.is_shift() && matches!(i.method(), HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
        })
    }

    async fn handle(&self, _services: &Services, _request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        Ok(not_supported("shifts"))
    }
}

pub struct UnsupportedOpenShiftEdit;

#[async_trait]
impl ChangeHandler for UnsupportedOpenShiftEdit {
    fn name(&self) -> &'static str {
        "unsupported_open_shift_edit"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        items
            .iter()
            .position(|i| i.is_open_shift() && i.method() != HttpMethod::Get)
    }

    async fn handle(&self, _services: &Services, _request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        Ok(not_supported("open shifts"))
    }
}
