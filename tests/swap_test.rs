mod common;

use anyhow::anyhow;
use serde_json::{json, Value};
use std::sync::Arc;

use common::*;
use shiftbridge::db::{cache, deferred as queue, ledger, SqliteStore};
use shiftbridge::gateway::{GatewayResult, RequestCache};
use shiftbridge::model::{week_start, ActorRole, HttpMethod, LedgerStatus, ScheduleId};

fn swap_body(state: &str, assigned_to: &str) -> Value {
    json!({
        "id": "SREQ_1",
        "senderShiftId": "S1",
        "recipientShiftId": "S2",
        "senderUserId": "A",
        "recipientUserId": "B",
        "state": state,
        "assignedTo": assigned_to,
        "senderMessage": "could you take my Tuesday?"
    })
}

fn post_swap() -> shiftbridge::model::ChangeBatch {
    batch(vec![item(
        "1",
        HttpMethod::Post,
        "/teams/team-1/schedule/swapRequests/SREQ_1",
        Some(swap_body("pending", "recipient")),
    )])
}

async fn seeded(wfm: RecordingWfm) -> Harness {
    let h = harness(wfm).await;
    seed_directory(&h.pool, &["A", "B"]).await;
    seed_shifts(
        &h.pool,
        &ScheduleId::shifts(TEAM),
        &[shift("S1", "W1", "A", at(5, 9)), shift("S2", "W2", "B", at(6, 9))],
    )
    .await;
    h
}

#[tokio::test]
async fn sender_step_runs_once_across_redeliveries() {
    let (wfm, gate) = RecordingWfm::gated(vec![Ok(GatewayResult::ok_with_id("T1"))]);
    let h = Arc::new(seeded(wfm).await);

    let first = {
        let h = h.clone();
        tokio::spawn(async move { h.dispatcher.dispatch(&post_swap(), TEAM).await })
    };
    while h.wfm.calls().await.is_empty() {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    let entry = ledger::load(&h.pool, "S1_S2").await.unwrap();
    assert_eq!(entry.status(ActorRole::Sender), LedgerStatus::InProgress);

    // Redelivery while the first call is still with the gateway.
    let second = h.dispatcher.dispatch(&post_swap(), TEAM).await;
    assert_eq!(second.responses[0].status, 102);
    assert_eq!(second.responses[0].body.as_ref().unwrap()["error"]["code"], "RequestInProgress");

    gate.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first.responses[0].status, 200);
    assert_eq!(first.responses[0].id, "1");

    let entry = ledger::load(&h.pool, "S1_S2").await.unwrap();
    assert_eq!(entry.status(ActorRole::Sender), LedgerStatus::Complete);
    assert_eq!(entry.result(ActorRole::Sender).unwrap().status_code, 200);

    let third = h.dispatcher.dispatch(&post_swap(), TEAM).await;
    assert_eq!(third, first);
    assert_eq!(h.wfm.actions().await, vec!["create_shift_swap"]);

    // Later steps reuse the WFM transaction id.
    let store = SqliteStore::new(h.pool.clone());
    let cached: Value =
        serde_json::from_str(&store.load_request(TEAM, "SREQ_1").await.unwrap().unwrap()).unwrap();
    assert_eq!(cached["command"]["wfmRequestId"], "T1");
}

#[tokio::test]
async fn sender_rejection_is_forwarded_and_replayed() {
    let wfm = RecordingWfm::with_responses(vec![Ok(GatewayResult::rejected(
        "SHIFT_LOCKED",
        "shift is locked for the week",
    ))]);
    let h = seeded(wfm).await;

    let first = h.dispatcher.dispatch(&post_swap(), TEAM).await;
    assert_eq!(first.responses[0].status, 400);
    let err = &first.responses[0].body.as_ref().unwrap()["error"];
    assert_eq!(err["code"], "SHIFT_LOCKED");
    assert_eq!(err["message"], "shift is locked for the week");

    let again = h.dispatcher.dispatch(&post_swap(), TEAM).await;
    assert_eq!(again, first);
    assert_eq!(h.wfm.calls().await.len(), 1);
}

#[tokio::test]
async fn unknown_shift_and_user_are_reported() {
    let h = harness(RecordingWfm::default()).await;
    seed_directory(&h.pool, &["A", "B"]).await;
    seed_shifts(&h.pool, &ScheduleId::shifts(TEAM), &[shift("S1", "W1", "A", at(5, 9))]).await;

    let resp = h.dispatcher.dispatch(&post_swap(), TEAM).await;
    assert_eq!(resp.responses[0].status, 404);
    assert_eq!(resp.responses[0].body.as_ref().unwrap()["error"]["code"], "RecipientShiftNotFound");

    seed_shifts(&h.pool, &ScheduleId::shifts(TEAM), &[shift("S2", "W2", "Z", at(6, 9))]).await;
    let mut body = swap_body("pending", "recipient");
    body["recipientUserId"] = json!("Z");
    let resp = h
        .dispatcher
        .dispatch(
            &batch(vec![item("1", HttpMethod::Post, "/swapRequests/SREQ_1", Some(body))]),
            TEAM,
        )
        .await;
    assert_eq!(resp.responses[0].status, 404);
    assert_eq!(resp.responses[0].body.as_ref().unwrap()["error"]["code"], "UserCredentialsNotFound");
    assert!(h.wfm.calls().await.is_empty());
}

#[tokio::test]
async fn malformed_body_reads_as_missing_request() {
    let h = seeded(RecordingWfm::default()).await;
    let resp = h
        .dispatcher
        .dispatch(
            &batch(vec![item(
                "1",
                HttpMethod::Post,
                "/swapRequests/SREQ_1",
                Some(json!({ "id": 42 })),
            )]),
            TEAM,
        )
        .await;
    assert_eq!(resp.responses[0].status, 404);
    assert_eq!(resp.responses[0].body.as_ref().unwrap()["error"]["code"], "ChangeRequestNotFound");
}

fn manager_batch(state: &str) -> shiftbridge::model::ChangeBatch {
    batch(vec![
        item(
            "1",
            HttpMethod::Put,
            "/swapRequests/SREQ_1",
            Some(swap_body(state, "manager")),
        ),
        item(
            "2",
            HttpMethod::Post,
            "/shifts/N1",
            Some(json!({
                "id": "N1",
                "userId": "B",
                "sharedShift": {
                    "startDateTime": "2024-03-05T09:00:00Z",
                    "endDateTime": "2024-03-05T17:00:00Z"
                }
            })),
        ),
        item(
            "3",
            HttpMethod::Post,
            "/shifts/N2",
            Some(json!({
                "id": "N2",
                "userId": "A",
                "sharedShift": {
                    "startDateTime": "2024-03-06T09:00:00Z",
                    "endDateTime": "2024-03-06T17:00:00Z"
                }
            })),
        ),
        item("4", HttpMethod::Delete, "/shifts/S1", None),
        item("5", HttpMethod::Delete, "/shifts/S2", None),
    ])
}

#[tokio::test]
async fn manager_approval_exchanges_employees_in_cache() {
    let h = seeded(RecordingWfm::default()).await;

    let resp = h.dispatcher.dispatch(&manager_batch("approved"), TEAM).await;
    assert!(resp.responses.iter().all(|r| r.status == 200), "{resp:?}");

    // The recipient step had not run yet, so it is performed first.
    let calls = h.wfm.calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].action, "recipient_approve_swap");
    assert_eq!(calls[0].approve, Some(true));
    assert_eq!(calls[1].action, "manager_approve_swap");

    let schedule = ScheduleId::shifts(TEAM);
    let n1 = cached(&h.pool, &schedule, "N1").await.unwrap();
    assert_eq!(n1.frontend_employee_id, "B");
    assert_eq!(n1.wfm_id, "W2");
    assert_eq!(n1.start, at(5, 9));
    let n2 = cached(&h.pool, &schedule, "N2").await.unwrap();
    assert_eq!(n2.frontend_employee_id, "A");
    assert_eq!(n2.wfm_employee_id, "wA");
    assert!(cached(&h.pool, &schedule, "S1").await.is_none());
    assert!(cached(&h.pool, &schedule, "S2").await.is_none());

    let entry = ledger::load(&h.pool, "S1_S2").await.unwrap();
    assert_eq!(entry.status(ActorRole::Recipient), LedgerStatus::Complete);
    assert_eq!(entry.status(ActorRole::Manager), LedgerStatus::Complete);

    let replay = h.dispatcher.dispatch(&manager_batch("approved"), TEAM).await;
    assert_eq!(replay, resp);
    assert_eq!(h.wfm.calls().await.len(), 2);
}

#[tokio::test]
async fn implicit_recipient_failure_stops_before_manager() {
    let wfm = RecordingWfm::with_responses(vec![Ok(GatewayResult::rejected(
        "SHIFT_GONE",
        "shift no longer available",
    ))]);
    let h = seeded(wfm).await;

    let resp = h.dispatcher.dispatch(&manager_batch("approved"), TEAM).await;
    assert_eq!(resp.responses[0].status, 400);
    assert_eq!(resp.responses[0].body.as_ref().unwrap()["error"]["code"], "SHIFT_GONE");
    assert_eq!(h.wfm.actions().await, vec!["recipient_approve_swap"]);

    let entry = ledger::load(&h.pool, "S1_S2").await.unwrap();
    assert_eq!(entry.status(ActorRole::Recipient), LedgerStatus::NotStarted);
    assert_eq!(entry.status(ActorRole::Manager), LedgerStatus::NotStarted);
    assert!(cached(&h.pool, &ScheduleId::shifts(TEAM), "S1").await.is_some());
}

#[tokio::test]
async fn manager_decline_before_recipient_declines_as_recipient() {
    let h = seeded(RecordingWfm::default()).await;
    let resp = h
        .dispatcher
        .dispatch(
            &batch(vec![item(
                "1",
                HttpMethod::Put,
                "/swapRequests/SREQ_1",
                Some(swap_body("declined", "manager")),
            )]),
            TEAM,
        )
        .await;
    assert_eq!(resp.responses[0].status, 200);

    let calls = h.wfm.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, "recipient_approve_swap");
    assert_eq!(calls[0].approve, Some(false));
    assert!(cached(&h.pool, &ScheduleId::shifts(TEAM), "S1").await.is_some());
}

#[tokio::test]
async fn recipient_approval_schedules_auto_approval() {
    let mut settings = settings();
    settings.auto_approve_swaps = true;
    settings.auto_approve_delay_seconds = 0;
    let h = harness_with(RecordingWfm::default(), settings).await;
    seed_directory(&h.pool, &["A", "B"]).await;
    seed_shifts(
        &h.pool,
        &ScheduleId::shifts(TEAM),
        &[shift("S1", "W1", "A", at(5, 9)), shift("S2", "W2", "B", at(6, 9))],
    )
    .await;

    let recipient = batch(vec![item(
        "1",
        HttpMethod::Put,
        "/swapRequests/SREQ_1",
        Some(swap_body("pending", "manager")),
    )]);
    let resp = h.dispatcher.dispatch(&recipient, TEAM).await;
    assert_eq!(resp.responses[0].status, 200);
    assert_eq!(queue::count_pending(&h.pool).await.unwrap(), 1);

    // A redelivery replays without scheduling a second approval.
    h.dispatcher.dispatch(&recipient, TEAM).await;
    assert_eq!(queue::count_pending(&h.pool).await.unwrap(), 1);

    let frontend = RecordingFrontEnd::default();
    assert!(shiftbridge::deferred::process_next_action(&h.pool, &frontend, 300)
        .await
        .unwrap());
    assert_eq!(
        frontend.calls().await,
        vec![FrontEndCall::Approve {
            request_id: "SREQ_1".into()
        }]
    );
    assert_eq!(queue::count_pending(&h.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn cancel_clears_ledger_even_when_gateway_fails() {
    let wfm = RecordingWfm::with_responses(vec![
        Ok(GatewayResult::ok_with_id("T1")),
        Err(anyhow!("WFM timed out")),
    ]);
    let h = seeded(wfm).await;
    assert_eq!(h.dispatcher.dispatch(&post_swap(), TEAM).await.responses[0].status, 200);

    // The front end sends the cancellation without a body.
    let cancel = batch(vec![item("9", HttpMethod::Delete, "/swapRequests/SREQ_1", None)]);
    let resp = h.dispatcher.dispatch(&cancel, TEAM).await;
    assert_eq!(resp.responses[0].status, 500);
    assert_eq!(resp.responses[0].body.as_ref().unwrap()["error"]["code"], "InternalError");

    let entry = ledger::load(&h.pool, "S1_S2").await.unwrap();
    assert_eq!(entry.status(ActorRole::Sender), LedgerStatus::NotStarted);
    let store = SqliteStore::new(h.pool.clone());
    assert!(store.load_request(TEAM, "SREQ_1").await.unwrap().is_none());

    // A fresh request for the same pair starts over.
    assert_eq!(h.dispatcher.dispatch(&post_swap(), TEAM).await.responses[0].status, 200);
    assert_eq!(
        h.wfm.actions().await,
        vec!["create_shift_swap", "cancel_swap", "create_shift_swap"]
    );
}

#[tokio::test]
async fn system_decline_cancels() {
    let h = seeded(RecordingWfm::default()).await;
    let resp = h
        .dispatcher
        .dispatch(
            &batch(vec![item(
                "1",
                HttpMethod::Put,
                "/swapRequests/SREQ_1",
                Some(swap_body("declined", "system")),
            )]),
            TEAM,
        )
        .await;
    assert_eq!(resp.responses[0].status, 200);
    assert_eq!(h.wfm.actions().await, vec!["cancel_swap"]);
}

#[tokio::test]
async fn eligibility_lists_cached_targets() {
    let h = seeded(RecordingWfm::default()).await;
    seed_directory(&h.pool, &["C"]).await;
    seed_shifts(
        &h.pool,
        &ScheduleId::shifts(TEAM),
        &[shift("S3", "W3", "C", at(7, 9)), shift("S4", "W4", "C", at(12, 9))],
    )
    .await;
    h.wfm.set_targets(&["W2", "W4", "W1"]).await;

    let url = "/shifts/S1/requestableShifts?requestType=SwapRequest&startTime=2024-03-04T00:00:00.000Z&endTime=2024-03-18T00:00:00 00:00";
    let resp = h
        .dispatcher
        .dispatch(&batch(vec![item("1", HttpMethod::Get, url, None)]), TEAM)
        .await;
    assert_eq!(resp.responses[0].status, 200);
    assert_eq!(
        resp.responses[0].body.as_ref().unwrap()["shiftIds"],
        json!(["S2", "S4"])
    );

    let missing = h
        .dispatcher
        .dispatch(
            &batch(vec![item("1", HttpMethod::Get, "/shifts/NOPE/requestableShifts", None)]),
            TEAM,
        )
        .await;
    assert_eq!(missing.responses[0].status, 404);
    assert_eq!(missing.responses[0].body.as_ref().unwrap()["error"]["code"], "ShiftNotFound");
}

#[tokio::test]
async fn abandoned_sender_step_is_retried_once_stale() {
    let (wfm, gate) = RecordingWfm::gated(vec![]);
    let mut settings = settings();
    settings.ledger_stale_seconds = 1;
    let h = Arc::new(harness_with(wfm, settings).await);
    seed_directory(&h.pool, &["A", "B"]).await;
    seed_shifts(
        &h.pool,
        &ScheduleId::shifts(TEAM),
        &[shift("S1", "W1", "A", at(5, 9)), shift("S2", "W2", "B", at(6, 9))],
    )
    .await;

    // The delivery dies while its call is with the gateway.
    let abandoned = {
        let h = h.clone();
        tokio::spawn(async move { h.dispatcher.dispatch(&post_swap(), TEAM).await })
    };
    while h.wfm.calls().await.is_empty() {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());

    let early = h.dispatcher.dispatch(&post_swap(), TEAM).await;
    assert_eq!(early.responses[0].status, 102);

    tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
    gate.notify_one();
    let retried = h.dispatcher.dispatch(&post_swap(), TEAM).await;
    assert_eq!(retried.responses[0].status, 200);
    let entry = ledger::load(&h.pool, "S1_S2").await.unwrap();
    assert_eq!(entry.status(ActorRole::Sender), LedgerStatus::Complete);
    assert_eq!(h.wfm.actions().await, vec!["create_shift_swap", "create_shift_swap"]);
}

#[tokio::test]
async fn cancel_clears_ledger_when_a_shift_is_gone() {
    let wfm = RecordingWfm::with_responses(vec![Ok(GatewayResult::rejected(
        "LOCKED",
        "the week is locked",
    ))]);
    let h = seeded(wfm).await;
    assert_eq!(h.dispatcher.dispatch(&post_swap(), TEAM).await.responses[0].status, 400);

    let schedule = ScheduleId::shifts(TEAM);
    cache::update(&h.pool, &settings(), &schedule, week_start(at(6, 9)), |leased| {
        leased.remove("S2")
    })
    .await
    .unwrap();

    let decline = batch(vec![item(
        "1",
        HttpMethod::Put,
        "/swapRequests/SREQ_1",
        Some(swap_body("declined", "system")),
    )]);
    let resp = h.dispatcher.dispatch(&decline, TEAM).await;
    assert_eq!(resp.responses[0].status, 404);
    assert_eq!(resp.responses[0].body.as_ref().unwrap()["error"]["code"], "RecipientShiftNotFound");
    let entry = ledger::load(&h.pool, "S1_S2").await.unwrap();
    assert_eq!(entry.status(ActorRole::Sender), LedgerStatus::NotStarted);

    // A new request for the same pair reaches the WFM instead of replaying the rejection.
    seed_shifts(&h.pool, &schedule, &[shift("S2", "W2", "B", at(6, 9))]).await;
    let mut body = swap_body("pending", "recipient");
    body["id"] = json!("SREQ_2");
    let resp = h
        .dispatcher
        .dispatch(
            &batch(vec![item("1", HttpMethod::Post, "/swapRequests/SREQ_2", Some(body))]),
            TEAM,
        )
        .await;
    assert_eq!(resp.responses[0].status, 200);
    assert_eq!(h.wfm.actions().await, vec!["create_shift_swap", "create_shift_swap"]);
}

#[tokio::test]
async fn manager_cannot_approve_a_declined_swap() {
    let h = seeded(RecordingWfm::default()).await;
    let declined = batch(vec![item(
        "1",
        HttpMethod::Put,
        "/swapRequests/SREQ_1",
        Some(swap_body("declined", "recipient")),
    )]);
    assert_eq!(h.dispatcher.dispatch(&declined, TEAM).await.responses[0].status, 200);
    let entry = ledger::load(&h.pool, "S1_S2").await.unwrap();
    assert!(entry.declined(ActorRole::Recipient));

    let resp = h.dispatcher.dispatch(&manager_batch("approved"), TEAM).await;
    assert_eq!(resp.responses[0].status, 400);
    assert_eq!(resp.responses[0].body.as_ref().unwrap()["error"]["code"], "InvalidRequest");

    let calls = h.wfm.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, "recipient_approve_swap");
    assert_eq!(calls[0].approve, Some(false));
    assert!(cached(&h.pool, &ScheduleId::shifts(TEAM), "S1").await.is_some());
}
