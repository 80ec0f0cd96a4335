//! Open shift request handlers and the manager's direct assignment.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{
    change_request_not_found, connection, created_shifts, employee, parse_body, parse_cached,
    ChangeHandler, HandlerRequest, Resolved, Services,
};
use crate::classify::{ClassifiedItem, Route};
use crate::db::{cache, ledger};
use crate::error::ErrorCode;
use crate::gateway::OpenShiftCommand;
use crate::guard::{replay, run_guarded};
use crate::model::{
    ActorRole, CachedResult, ChangeOutcome, EmployeeRecord, HttpMethod, OpenShiftRequestBody,
    ScheduleId, ShiftBody, ShiftRecord, Transition,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedOpenShiftRequest {
    request: OpenShiftRequestBody,
    command: OpenShiftCommand,
}

async fn load_cached(
    services: &Services,
    team_id: &str,
    request_id: &str,
) -> Result<Option<CachedOpenShiftRequest>> {
    Ok(parse_cached(
        services.requests.load_request(team_id, request_id).await?,
    ))
}

fn open_shift_not_found(id: &str) -> ChangeOutcome {
    ChangeOutcome::not_found(
        ErrorCode::OpenShiftNotFound,
        format!("Open shift {id} was not found"),
    )
}

async fn open_shift_command(
    services: &Services,
    team_id: &str,
    body: &OpenShiftRequestBody,
) -> Result<Resolved<OpenShiftCommand>> {
    if let Some(cached) = load_cached(services, team_id, &body.id).await? {
        return Ok(Ok(cached.command));
    }

    let connection = match connection(services, team_id).await? {
        Ok(c) => c,
        Err(outcome) => return Ok(Err(outcome)),
    };
    let schedule = ScheduleId::open_shifts(team_id);
    let Some(open_shift) = cache::find_shift(&services.pool, &schedule, &body.open_shift_id).await? else {
        return Ok(Err(open_shift_not_found(&body.open_shift_id)));
    };
    let employee = match employee(services, &body.sender_user_id).await? {
        Ok(e) => e,
        Err(outcome) => return Ok(Err(outcome)),
    };

    Ok(Ok(OpenShiftCommand {
        wfm_request_id: None,
        bu_id: connection.wfm_bu_id,
        time_zone_id: connection.time_zone_id,
        open_shift,
        employee,
        message: None,
    }))
}

/// Take one slot from `open_shift` and record the assignee's new shift.
///
/// The open shift record disappears from the cache once its quantity reaches
/// zero. The new record is keyed by `new_frontend_id` when the front end
/// already created the shift, otherwise by its WFM id until the next sync.
/// Without a WFM id for the new shift nothing is recorded; the next pull sync
/// creates it by WFM identity.
pub(crate) async fn assign_from_open_shift(
    services: &Services,
    team_id: &str,
    open_shift: &ShiftRecord,
    assignee: &EmployeeRecord,
    new_frontend_id: Option<String>,
    new_wfm_id: Option<String>,
) -> Result<Option<ShiftRecord>> {
    let week = open_shift.week_start();
    let open_schedule = ScheduleId::open_shifts(team_id);
    let remaining = cache::update(&services.pool, &services.settings, &open_schedule, week, |leased| {
        leased.decrement_quantity(&open_shift.frontend_id)
    })
    .await?;
    match remaining {
        Some(left) => info!(open_shift = %open_shift.frontend_id, remaining = left, "open shift slot taken"),
        None => warn!(open_shift = %open_shift.frontend_id, %week, "open shift missing from cache partition"),
    }

    let Some(wfm_id) = new_wfm_id else {
        warn!(
            open_shift = %open_shift.frontend_id,
            assignee = %assignee.frontend_id,
            "WFM returned no id for the assigned shift; leaving it to the next sync"
        );
        return Ok(None);
    };
    let record = ShiftRecord {
        frontend_id: new_frontend_id.unwrap_or_else(|| wfm_id.clone()),
        wfm_id,
        frontend_employee_id: assignee.frontend_id.clone(),
        wfm_employee_id: assignee.wfm_id.clone(),
        quantity: 1,
        ..open_shift.clone()
    };
    cache::update(
        &services.pool,
        &services.settings,
        &ScheduleId::shifts(team_id),
        week,
        |leased| leased.upsert(record.clone()),
    )
    .await?;
    Ok(Some(record))
}

fn request_id_of(item: &ClassifiedItem<'_>) -> String {
    match &item.route {
        Route::OpenShiftRequest { id } => id.clone(),
        _ => item.item.id.clone(),
    }
}

pub struct SenderCreateOpenShiftRequest;

#[async_trait]
impl ChangeHandler for SenderCreateOpenShiftRequest {
    fn name(&self) -> &'static str {
        "sender_create_open_shift_request"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        items
            .iter()
            .position(|i| i.is_open_shift_request() && i.method() == HttpMethod::Post)
    }

    #[instrument(skip_all, fields(team_id = request.team_id))]
    async fn handle(&self, services: &Services, request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        let Some(body) = parse_body::<OpenShiftRequestBody>(request.matched) else {
            return Ok(change_request_not_found(&request.matched.item.id));
        };
        let mut command = resolve!(open_shift_command(services, request.team_id, &body).await?);
        command.message = body.sender_message.clone();

        let key = body.txn_key();
        let (command, body, team_id) = (&command, &body, request.team_id);
        let guarded = run_guarded(&services.pool, &services.settings, &key, ActorRole::Sender, move || async move {
            let result = services.wfm.create_open_shift_request(command).await?;
            if result.success {
                let cached = CachedOpenShiftRequest {
                    request: body.clone(),
                    command: OpenShiftCommand {
                        wfm_request_id: result.entity_id.clone(),
                        ..command.clone()
                    },
                };
                services
                    .requests
                    .save_request(team_id, &body.id, &serde_json::to_string(&cached)?)
                    .await?;
            } else {
                warn!(request_id = %body.id, code = ?result.error_code, "WFM rejected open shift request");
            }
            Ok(result.to_cached())
        })
        .await?;
        Ok(guarded.outcome())
    }
}

pub struct ManagerOpenShiftRequest;

#[async_trait]
impl ChangeHandler for ManagerOpenShiftRequest {
    fn name(&self) -> &'static str {
        "manager_open_shift_request"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        items.iter().position(|i| {
            i.is_open_shift_request()
                && i.method() == HttpMethod::Put
                && matches!(
                    i.transition,
                    Some(Transition::ManagerApproved | Transition::ManagerDeclined)
                )
        })
    }

    #[instrument(skip_all, fields(team_id = request.team_id))]
    async fn handle(&self, services: &Services, request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        let Some(body) = parse_body::<OpenShiftRequestBody>(request.matched) else {
            return Ok(change_request_not_found(&request.matched.item.id));
        };
        let key = body.txn_key();
        if let Some(outcome) = replay(&services.pool, &key, ActorRole::Manager).await? {
            return Ok(outcome);
        }
        let approve = request.matched.transition.map_or(false, |t| t.is_approval());
        let mut command = resolve!(open_shift_command(services, request.team_id, &body).await?);
        command.message = body.manager_action_message.clone();

        let (command, team_id, items) = (&command, request.team_id, request.items);
        let guarded = run_guarded(&services.pool, &services.settings, &key, ActorRole::Manager, move || async move {
            let result = services
                .wfm
                .manager_approve_open_shift_request(command, approve)
                .await?;
            if !approve {
                return Ok(result.to_cached());
            }
            if !result.success {
                // A shift that could not be claimed is no longer assignable.
                let message = result.error_message.clone().unwrap_or_default();
                warn!(code = ?result.error_code, %message, "open shift claim failed; declining request");
                let declined = services
                    .wfm
                    .manager_approve_open_shift_request(command, false)
                    .await?;
                if !declined.success {
                    return Ok(declined.to_cached());
                }
                return Ok(CachedResult::failure(
                    200,
                    ErrorCode::OpenShiftRequestDeclined.as_str(),
                    message,
                ));
            }

            let created = created_shifts(items);
            let new_shift = created
                .iter()
                .find(|s| s.user_id.as_deref() == Some(command.employee.frontend_id.as_str()))
                .or_else(|| created.first())
                .map(|s| s.id.clone());
            assign_from_open_shift(
                services,
                team_id,
                &command.open_shift,
                &command.employee,
                new_shift,
                result.entity_id.clone(),
            )
            .await?;
            Ok(result.to_cached())
        })
        .await?;

        if guarded.ran_successfully() {
            services.requests.delete_request(request.team_id, &body.id).await?;
        }
        Ok(guarded.outcome())
    }
}

pub struct CancelOpenShiftRequest;

#[async_trait]
impl ChangeHandler for CancelOpenShiftRequest {
    fn name(&self) -> &'static str {
        "cancel_open_shift_request"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        items.iter().position(|i| {
            i.is_open_shift_request()
                && (i.method() == HttpMethod::Delete
                    || i.transition == Some(Transition::SystemDeclined))
        })
    }

    #[instrument(skip_all, fields(team_id = request.team_id))]
    async fn handle(&self, services: &Services, request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        let request_id = request_id_of(request.matched);
        let cached = load_cached(services, request.team_id, &request_id).await?;
        let body = parse_body::<OpenShiftRequestBody>(request.matched)
            .or_else(|| cached.as_ref().map(|c| c.request.clone()));
        let Some(body) = body else {
            return Ok(change_request_not_found(&request_id));
        };

        ledger::clear(&services.pool, &body.txn_key()).await?;
        services.requests.delete_request(request.team_id, &body.id).await?;

        let command = match cached {
            Some(cached) => cached.command,
            None => resolve!(open_shift_command(services, request.team_id, &body).await?),
        };
        let result = services.wfm.cancel_open_shift_request(&command).await?;
        Ok(ChangeOutcome::from(&result.to_cached()))
    }
}

/// A manager assigning an open shift directly: exactly one open shift PUT and
/// the assignee's new shift POST, nothing else.
pub struct ManagerAssignOpenShift;

#[async_trait]
impl ChangeHandler for ManagerAssignOpenShift {
    fn name(&self) -> &'static str {
        "manager_assign_open_shift"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        if items.len() != 2 {
            return None;
        }
        let open = items
            .iter()
            .position(|i| i.is_open_shift() && i.method() == HttpMethod::Put)?;
        let shift = items
            .iter()
            .position(|i| i.is_shift() && i.method() == HttpMethod::Post)?;
        (open != shift).then_some(open)
    }

    #[instrument(skip_all, fields(team_id = request.team_id))]
    async fn handle(&self, services: &Services, request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        let Route::OpenShift { id: open_shift_id } = &request.matched.route else {
            return Ok(ChangeOutcome::error(400, ErrorCode::InvalidRequest, "Not an open shift"));
        };
        let new_shift = request
            .items
            .iter()
            .find(|i| i.is_shift() && i.method() == HttpMethod::Post)
            .and_then(parse_body::<ShiftBody>);
        let Some(new_shift) = new_shift else {
            return Ok(change_request_not_found(&request.matched.item.id));
        };
        let Some(user_id) = new_shift.user_id.as_deref() else {
            return Ok(ChangeOutcome::error(
                400,
                ErrorCode::InvalidRequest,
                "Assigned shift carries no user",
            ));
        };

        let key = format!("{open_shift_id}_{}", new_shift.id);
        if let Some(outcome) = replay(&services.pool, &key, ActorRole::Manager).await? {
            return Ok(outcome);
        }
        let connection = resolve!(connection(services, request.team_id).await?);
        let schedule = ScheduleId::open_shifts(request.team_id);
        let Some(open_shift) = cache::find_shift(&services.pool, &schedule, open_shift_id).await? else {
            return Ok(open_shift_not_found(open_shift_id));
        };
        let assignee = resolve!(employee(services, user_id).await?);
        let manager = match parse_body::<ShiftBody>(request.matched)
            .as_ref()
            .and_then(ShiftBody::modified_by)
        {
            Some(id) => services.directory.get_employee(id).await?,
            None => None,
        };

        let (open_shift, assignee, manager, new_shift) = (&open_shift, &assignee, &manager, &new_shift);
        let team_id = request.team_id;
        let bu_id = connection.wfm_bu_id.as_str();
        let guarded = run_guarded(&services.pool, &services.settings, &key, ActorRole::Manager, move || async move {
            let result = services
                .wfm
                .manager_assign_open_shift(bu_id, open_shift, manager.as_ref(), assignee)
                .await?;
            if result.success {
                assign_from_open_shift(
                    services,
                    team_id,
                    open_shift,
                    assignee,
                    Some(new_shift.id.clone()),
                    result.entity_id.clone(),
                )
                .await?;
            } else {
                warn!(code = ?result.error_code, "WFM rejected open shift assignment");
            }
            Ok(result.to_cached())
        })
        .await?;
        Ok(guarded.outcome())
    }
}
