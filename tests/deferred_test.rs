mod common;

use chrono::{Duration, Utc};
use serde_json::json;

use common::*;
use shiftbridge::db::{self, deferred as queue, SqliteStore};
use shiftbridge::deferred::process_next_action;
use shiftbridge::gateway::DeferredScheduler;
use shiftbridge::model::DeferredKind;

#[tokio::test]
async fn due_share_runs_and_is_removed() {
    let pool = db::memory_pool().await.unwrap();
    let frontend = RecordingFrontEnd::default();
    let payload = json!({
        "teamId": TEAM,
        "start": "2024-03-04T00:00:00Z",
        "end": "2024-03-18T00:00:00Z"
    });
    queue::enqueue(&pool, DeferredKind::ShareSchedule, &payload, Utc::now() - Duration::seconds(1))
        .await
        .unwrap();

    assert!(process_next_action(&pool, &frontend, 300).await.unwrap());
    assert_eq!(frontend.calls().await, vec![FrontEndCall::Share]);
    assert_eq!(queue::count_pending(&pool).await.unwrap(), 0);
    assert!(!process_next_action(&pool, &frontend, 300).await.unwrap());
}

#[tokio::test]
async fn future_actions_wait() {
    let pool = db::memory_pool().await.unwrap();
    let store = SqliteStore::new(pool.clone());
    store
        .schedule(
            DeferredKind::ManagerAutoApproveSwap,
            3600,
            &json!({ "teamId": TEAM, "requestId": "SREQ_1" }),
        )
        .await
        .unwrap();

    let frontend = RecordingFrontEnd::default();
    assert!(!process_next_action(&pool, &frontend, 300).await.unwrap());
    assert_eq!(queue::count_pending(&pool).await.unwrap(), 1);
    assert!(frontend.calls().await.is_empty());
}

#[tokio::test]
async fn failed_action_backs_off() {
    let pool = db::memory_pool().await.unwrap();
    let frontend = RecordingFrontEnd::default();
    frontend.fail_next_approvals(1).await;
    let id = queue::enqueue(
        &pool,
        DeferredKind::ManagerAutoApproveSwap,
        &json!({ "teamId": TEAM, "requestId": "SREQ_1" }),
        Utc::now() - Duration::seconds(1),
    )
    .await
    .unwrap();

    assert!(process_next_action(&pool, &frontend, 300).await.unwrap());
    assert_eq!(queue::count_pending(&pool).await.unwrap(), 1);
    // Rescheduled into the future with one more attempt recorded.
    assert!(queue::next_due(&pool).await.unwrap().is_none());
    let attempt: i32 = sqlx::query_scalar("SELECT attempt FROM deferred_actions WHERE id = ?")
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(attempt, 1);
    assert!(frontend.calls().await.is_empty());
}

#[tokio::test]
async fn unknown_kind_is_not_dropped() {
    let pool = db::memory_pool().await.unwrap();
    sqlx::query(
        "INSERT INTO deferred_actions (kind, payload, attempt, due_at) VALUES ('publish_rota', '{}', 0, datetime('now', '-1 seconds'))",
    )
    .execute(&pool)
    .await
    .unwrap();

    let frontend = RecordingFrontEnd::default();
    assert!(process_next_action(&pool, &frontend, 300).await.unwrap());
    assert_eq!(queue::count_pending(&pool).await.unwrap(), 1);
    assert!(queue::next_due(&pool).await.unwrap().is_none());
}
