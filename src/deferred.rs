use crate::db::deferred as queue;
use crate::db::Pool;
use crate::gateway::FrontEnd;
use crate::model::{AutoApprovePayload, DeferredKind, SharePayload};
use anyhow::{anyhow, Result};
use tracing::{info, instrument, warn};

const AUTO_APPROVE_MESSAGE: &str = "Automatically approved";

/// Run the oldest due deferred action. Returns `false` when nothing was due.
#[instrument(skip_all)]
pub async fn process_next_action(
    pool: &Pool,
    frontend: &dyn FrontEnd,
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some(action) = queue::next_due(pool).await? else {
        return Ok(false);
    };

    let res = run_action(frontend, &action.kind, &action.payload).await;
    match res {
        Ok(()) => {
            queue::delete(pool, action.id).await?;
            info!(id = action.id, kind = %action.kind, "deferred action succeeded");
        }
        Err(err) => {
            warn!(
                ?err,
                id = action.id,
                kind = %action.kind,
                attempt = action.attempt,
                "deferred action failed; backoff"
            );
            queue::backoff_with_cap(pool, action.id, action.attempt, max_backoff_secs).await?;
        }
    }
    Ok(true)
}

async fn run_action(frontend: &dyn FrontEnd, kind: &str, payload: &str) -> Result<()> {
    match DeferredKind::parse(kind) {
        Some(DeferredKind::ManagerAutoApproveSwap) => {
            let p: AutoApprovePayload = serde_json::from_str(payload)?;
            frontend
                .approve_swap_request(&p.team_id, &p.request_id, AUTO_APPROVE_MESSAGE)
                .await
        }
        Some(DeferredKind::ShareSchedule) => {
            let p: SharePayload = serde_json::from_str(payload)?;
            frontend.share_schedule(&p.team_id, p.start, p.end).await
        }
        None => Err(anyhow!("unknown deferred action kind {kind}")),
    }
}
