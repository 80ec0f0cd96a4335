//! Shift swap handlers: creation, the recipient and manager decisions,
//! cancellation, and the eligible-target lookup.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use tracing::{info, instrument, warn};

use super::{
    change_request_not_found, connection, created_shifts, employee, parse_body, parse_cached,
    ChangeHandler, HandlerRequest, Resolved, Services,
};
use crate::classify::{ClassifiedItem, Route};
use crate::db::{cache, ledger};
use crate::error::ErrorCode;
use crate::gateway::SwapCommand;
use crate::guard::{replay, run_guarded, Guarded};
use crate::model::{
    week_start, ActorRole, AutoApprovePayload, ChangeOutcome, DeferredKind, HttpMethod,
    LedgerStatus, ScheduleId, ShiftBody, ShiftRecord, SwapRequestBody, Transition,
};

/// What the sender step resolved, kept so later steps skip the lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedSwap {
    request: SwapRequestBody,
    command: SwapCommand,
}

async fn load_cached(services: &Services, team_id: &str, request_id: &str) -> Result<Option<CachedSwap>> {
    Ok(parse_cached(
        services.requests.load_request(team_id, request_id).await?,
    ))
}

/// Build the WFM command from the correlation cache and the directory, or
/// reuse the one the sender step stored.
async fn swap_command(
    services: &Services,
    team_id: &str,
    body: &SwapRequestBody,
) -> Result<Resolved<SwapCommand>> {
    if let Some(cached) = load_cached(services, team_id, &body.id).await? {
        return Ok(Ok(cached.command));
    }

    let connection = match connection(services, team_id).await? {
        Ok(c) => c,
        Err(outcome) => return Ok(Err(outcome)),
    };
    let schedule = ScheduleId::shifts(team_id);
    let Some(sender_shift) = cache::find_shift(&services.pool, &schedule, &body.sender_shift_id).await? else {
        return Ok(Err(ChangeOutcome::not_found(
            ErrorCode::SenderShiftNotFound,
            format!("Shift {} was not found", body.sender_shift_id),
        )));
    };
    let Some(recipient_shift) =
        cache::find_shift(&services.pool, &schedule, &body.recipient_shift_id).await?
    else {
        return Ok(Err(ChangeOutcome::not_found(
            ErrorCode::RecipientShiftNotFound,
            format!("Shift {} was not found", body.recipient_shift_id),
        )));
    };
    let sender = match employee(services, &body.sender_user_id).await? {
        Ok(e) => e,
        Err(outcome) => return Ok(Err(outcome)),
    };
    let recipient = match employee(services, &body.recipient_user_id).await? {
        Ok(e) => e,
        Err(outcome) => return Ok(Err(outcome)),
    };

    Ok(Ok(SwapCommand {
        wfm_request_id: None,
        bu_id: connection.wfm_bu_id,
        time_zone_id: connection.time_zone_id,
        sender,
        recipient,
        sender_shift,
        recipient_shift,
        message: None,
    }))
}

fn swap_put(items: &[ClassifiedItem<'_>], accepted: &[Transition]) -> Option<usize> {
    items.iter().position(|i| {
        i.is_swap_request()
            && i.method() == HttpMethod::Put
            && i.transition.map_or(false, |t| accepted.contains(&t))
    })
}

pub struct SenderCreateSwap;

#[async_trait]
impl ChangeHandler for SenderCreateSwap {
    fn name(&self) -> &'static str {
        "sender_create_swap"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        items
            .iter()
            .position(|i| i.is_swap_request() && i.method() == HttpMethod::Post)
    }

    #[instrument(skip_all, fields(team_id = request.team_id))]
    async fn handle(&self, services: &Services, request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        let Some(body) = parse_body::<SwapRequestBody>(request.matched) else {
            return Ok(change_request_not_found(&request.matched.item.id));
        };
        let mut command = resolve!(swap_command(services, request.team_id, &body).await?);
        command.message = body.sender_message.clone();

        let key = body.txn_key();
        let (command, body, team_id) = (&command, &body, request.team_id);
        let guarded = run_guarded(&services.pool, &services.settings, &key, ActorRole::Sender, move || async move {
            let result = services.wfm.create_shift_swap(command).await?;
            if result.success {
                let cached = CachedSwap {
                    request: body.clone(),
                    command: SwapCommand {
                        wfm_request_id: result.entity_id.clone(),
                        ..command.clone()
                    },
                };
                services
                    .requests
                    .save_request(team_id, &body.id, &serde_json::to_string(&cached)?)
                    .await?;
                info!(request_id = %body.id, wfm_request_id = ?result.entity_id, "swap request created");
            } else {
                warn!(request_id = %body.id, code = ?result.error_code, "WFM rejected swap request");
            }
            Ok(result.to_cached())
        })
        .await?;
        Ok(guarded.outcome())
    }
}

pub struct RecipientSwapDecision;

#[async_trait]
impl ChangeHandler for RecipientSwapDecision {
    fn name(&self) -> &'static str {
        "recipient_swap_decision"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        swap_put(items, &[Transition::RecipientApproved, Transition::RecipientDeclined])
    }

    #[instrument(skip_all, fields(team_id = request.team_id))]
    async fn handle(&self, services: &Services, request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        let Some(body) = parse_body::<SwapRequestBody>(request.matched) else {
            return Ok(change_request_not_found(&request.matched.item.id));
        };
        let approve = request.matched.transition.map_or(false, |t| t.is_approval());
        let mut command = resolve!(swap_command(services, request.team_id, &body).await?);
        command.message = body.recipient_action_message.clone();

        let key = body.txn_key();
        let command = &command;
        let guarded = run_guarded(&services.pool, &services.settings, &key, ActorRole::Recipient, move || async move {
            Ok(services.wfm.recipient_approve_swap(command, approve).await?.to_cached())
        })
        .await?;

        if guarded.ran_successfully() {
            if approve && services.settings.auto_approve_swaps {
                let payload = serde_json::to_value(AutoApprovePayload {
                    team_id: request.team_id.to_string(),
                    request_id: body.id.clone(),
                })?;
                if let Err(err) = services
                    .scheduler
                    .schedule(
                        DeferredKind::ManagerAutoApproveSwap,
                        services.settings.auto_approve_delay_seconds,
                        &payload,
                    )
                    .await
                {
                    warn!(?err, request_id = %body.id, "could not schedule manager auto-approval");
                }
            }
            if !approve {
                ledger::record_decline(&services.pool, &key, ActorRole::Recipient).await?;
                services.requests.delete_request(request.team_id, &body.id).await?;
            }
        }
        Ok(guarded.outcome())
    }
}

pub struct ManagerSwapDecision;

#[async_trait]
impl ChangeHandler for ManagerSwapDecision {
    fn name(&self) -> &'static str {
        "manager_swap_decision"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        swap_put(items, &[Transition::ManagerApproved, Transition::ManagerDeclined])
    }

    #[instrument(skip_all, fields(team_id = request.team_id))]
    async fn handle(&self, services: &Services, request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        let Some(body) = parse_body::<SwapRequestBody>(request.matched) else {
            return Ok(change_request_not_found(&request.matched.item.id));
        };
        let key = body.txn_key();
        if let Some(outcome) = replay(&services.pool, &key, ActorRole::Manager).await? {
            info!(txn_key = %key, "manager decision already applied");
            return Ok(outcome);
        }
        let approve = request.matched.transition.map_or(false, |t| t.is_approval());
        let entry = ledger::load(&services.pool, &key).await?;
        if approve && entry.succeeded(ActorRole::Recipient) && entry.declined(ActorRole::Recipient) {
            warn!(txn_key = %key, "manager approval after the recipient declined");
            return Ok(ChangeOutcome::error(
                400,
                ErrorCode::InvalidRequest,
                format!("Swap request {} was declined by the recipient", body.id),
            ));
        }
        let mut command = resolve!(swap_command(services, request.team_id, &body).await?);

        // The front end may collapse the recipient and manager steps into one call.
        let recipient_pending = entry.status(ActorRole::Manager) == LedgerStatus::NotStarted
            && !entry.succeeded(ActorRole::Recipient);

        if recipient_pending && approve {
            let recipient_command = SwapCommand {
                message: body.recipient_action_message.clone(),
                ..command.clone()
            };
            let recipient_command = &recipient_command;
            let step = run_guarded(&services.pool, &services.settings, &key, ActorRole::Recipient, move || async move {
                Ok(services
                    .wfm
                    .recipient_approve_swap(recipient_command, true)
                    .await?
                    .to_cached())
            })
            .await?;
            match step {
                Guarded::Processing => return Ok(ChangeOutcome::processing()),
                ref done if !done.result().map_or(false, |r| r.is_success()) => {
                    ledger::reset(&services.pool, &key, ActorRole::Recipient).await?;
                    warn!(txn_key = %key, "implicit recipient approval rejected; manager step not attempted");
                    return Ok(done.outcome());
                }
                _ => info!(txn_key = %key, "recipient step completed on the manager's behalf"),
            }
        }

        command.message = body.manager_action_message.clone();
        let decline_as_recipient = recipient_pending && !approve;
        let (command, team_id, items) = (&command, request.team_id, request.items);
        let guarded = run_guarded(&services.pool, &services.settings, &key, ActorRole::Manager, move || async move {
            if decline_as_recipient {
                return Ok(services.wfm.recipient_approve_swap(command, false).await?.to_cached());
            }
            let result = services.wfm.manager_approve_swap(command, approve).await?;
            if result.success && approve {
                reconcile_swap(services, team_id, command, items).await?;
            }
            Ok(result.to_cached())
        })
        .await?;

        if guarded.ran_successfully() {
            services.requests.delete_request(request.team_id, &body.id).await?;
        }
        Ok(guarded.outcome())
    }
}

/// The created shift that took over `original`'s slot: the one not owned by
/// `original`'s employee, preferring an exact start-time match.
fn counterpart<'a>(created: &'a [ShiftBody], original: &ShiftRecord, taken: Option<&str>) -> Option<&'a ShiftBody> {
    let candidates: Vec<&ShiftBody> = created
        .iter()
        .filter(|s| s.user_id.as_deref() != Some(original.frontend_employee_id.as_str()))
        .filter(|s| Some(s.id.as_str()) != taken)
        .collect();
    candidates
        .iter()
        .find(|s| s.slot().map(|slot| slot.start_date_time) == Some(original.start))
        .or_else(|| candidates.first())
        .copied()
}

/// Re-key the two swapped shifts after the front end replaced them.
///
/// Each slot keeps its times and takes the other side's employee and WFM
/// identity, under the new front-end id.
pub(crate) async fn reconcile_swap(
    services: &Services,
    team_id: &str,
    command: &SwapCommand,
    items: &[ClassifiedItem<'_>],
) -> Result<()> {
    let created = created_shifts(items);
    let s1 = &command.sender_shift;
    let s2 = &command.recipient_shift;

    let n1 = counterpart(&created, s1, None);
    let n2 = counterpart(&created, s2, n1.map(|s| s.id.as_str()));
    if n1.is_none() || n2.is_none() {
        warn!(team_id, "swap approval carried no replacement shifts; keeping old front-end ids");
    }

    let replaced = |slot: &ShiftRecord, other: &ShiftRecord, new: Option<&ShiftBody>| ShiftRecord {
        frontend_id: new.map_or_else(|| slot.frontend_id.clone(), |n| n.id.clone()),
        wfm_id: other.wfm_id.clone(),
        frontend_employee_id: other.frontend_employee_id.clone(),
        wfm_employee_id: other.wfm_employee_id.clone(),
        ..slot.clone()
    };
    let new1 = replaced(s1, s2, n1);
    let new2 = replaced(s2, s1, n2);

    let schedule = ScheduleId::shifts(team_id);
    let weeks: BTreeSet<_> = [s1.week_start(), s2.week_start()].into_iter().collect();
    for week in weeks {
        cache::update(&services.pool, &services.settings, &schedule, week, |leased| {
            leased.remove(&s1.frontend_id);
            leased.remove(&s2.frontend_id);
            for record in [&new1, &new2] {
                if record.week_start() == week {
                    leased.upsert(record.clone());
                }
            }
        })
        .await?;
    }
    info!(
        team_id,
        old = ?[&s1.frontend_id, &s2.frontend_id],
        new = ?[&new1.frontend_id, &new2.frontend_id],
        "swapped shifts reconciled"
    );
    Ok(())
}

pub struct CancelSwap;

#[async_trait]
impl ChangeHandler for CancelSwap {
    fn name(&self) -> &'static str {
        "cancel_swap"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        items.iter().position(|i| {
            i.is_swap_request()
                && (i.method() == HttpMethod::Delete
                    || i.transition == Some(Transition::SystemDeclined))
        })
    }

    #[instrument(skip_all, fields(team_id = request.team_id))]
    async fn handle(&self, services: &Services, request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        let request_id = match &request.matched.route {
            Route::SwapRequest { id } => id.clone(),
            _ => request.matched.item.id.clone(),
        };
        let cached = load_cached(services, request.team_id, &request_id).await?;
        let body = parse_body::<SwapRequestBody>(request.matched)
            .or_else(|| cached.as_ref().map(|c| c.request.clone()));
        let Some(body) = body else {
            return Ok(change_request_not_found(&request_id));
        };

        // Cleared first: the lookups below may fail.
        let key = body.txn_key();
        ledger::clear(&services.pool, &key).await?;
        services.requests.delete_request(request.team_id, &body.id).await?;

        let command = match cached {
            Some(cached) => cached.command,
            None => resolve!(swap_command(services, request.team_id, &body).await?),
        };
        let result = services.wfm.cancel_swap(&command).await?;
        if !result.success {
            warn!(txn_key = %key, code = ?result.error_code, "WFM rejected swap cancellation; ledger cleared anyway");
        }
        Ok(ChangeOutcome::from(&result.to_cached()))
    }
}

/// `GET /shifts/{id}/requestableShifts`: which cached shifts the owner could
/// swap this one for.
pub struct EligibilityFilter;

#[async_trait]
impl ChangeHandler for EligibilityFilter {
    fn name(&self) -> &'static str {
        "eligibility_filter"
    }

    fn can_handle(&self, items: &[ClassifiedItem<'_>]) -> Option<usize> {
        items.iter().position(|i| {
            matches!(i.route, Route::RequestableShifts { .. }) && i.method() == HttpMethod::Get
        })
    }

    #[instrument(skip_all, fields(team_id = request.team_id))]
    async fn handle(&self, services: &Services, request: &HandlerRequest<'_>) -> Result<ChangeOutcome> {
        let Route::RequestableShifts { shift_id, query } = &request.matched.route else {
            return Ok(ChangeOutcome::error(400, ErrorCode::InvalidRequest, "Not an eligibility query"));
        };
        let schedule = ScheduleId::shifts(request.team_id);
        let Some(shift) = cache::find_shift(&services.pool, &schedule, shift_id).await? else {
            return Ok(ChangeOutcome::not_found(
                ErrorCode::ShiftNotFound,
                format!("Shift {shift_id} was not found"),
            ));
        };
        let owner = if shift.frontend_employee_id.is_empty() {
            &shift.wfm_employee_id
        } else {
            &shift.frontend_employee_id
        };
        let owner = resolve!(employee(services, owner).await?);
        let connection = resolve!(connection(services, request.team_id).await?);

        let targets: HashSet<String> = services
            .queries
            .get_eligible_swap_targets(&shift, &owner, &connection.wfm_bu_id)
            .await?
            .into_iter()
            .collect();

        let from = query.start.map(week_start).unwrap_or_else(|| shift.week_start());
        let to = query.end.map(week_start).unwrap_or(from).max(from);
        let mut seen = HashSet::new();
        let shift_ids: Vec<String> = cache::load_range(&services.pool, &schedule, from, to)
            .await?
            .iter()
            .flat_map(|(_, snapshot)| snapshot.records())
            .filter(|r| r.frontend_id != shift.frontend_id && targets.contains(&r.wfm_id))
            .filter(|r| seen.insert(r.frontend_id.clone()))
            .map(|r| r.frontend_id.clone())
            .collect();

        info!(shift_id = %shift_id, eligible = shift_ids.len(), "eligible swap targets");
        Ok(ChangeOutcome::ok_with(json!({ "shiftIds": shift_ids })))
    }
}
