//! Duplicate-delivery guard around one actor's step of a transaction.
use anyhow::Result;
use std::future::Future;
use tracing::{info, warn};

use crate::config::EngineSettings;
use crate::db::{ledger, BeginOutcome, Pool};
use crate::model::{ActorRole, CachedResult, ChangeOutcome, LedgerStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded {
    /// The step ran now.
    Fresh(CachedResult),
    /// The step ran on an earlier delivery; nothing was called this time.
    Replayed(CachedResult),
    /// Another delivery still owns the step.
    Processing,
}

impl Guarded {
    pub fn outcome(&self) -> ChangeOutcome {
        match self {
            Guarded::Fresh(result) | Guarded::Replayed(result) => ChangeOutcome::from(result),
            Guarded::Processing => ChangeOutcome::processing(),
        }
    }

    pub fn result(&self) -> Option<&CachedResult> {
        match self {
            Guarded::Fresh(result) | Guarded::Replayed(result) => Some(result),
            Guarded::Processing => None,
        }
    }

    pub fn ran_successfully(&self) -> bool {
        matches!(self, Guarded::Fresh(result) if result.is_success())
    }
}

/// Run `action` at most once per `(key, role)`.
///
/// `NotStarted` runs the action and caches what it returns. `InProgress` waits
/// one recheck interval; if still in flight the caller gets
/// [`Guarded::Processing`]. `Complete` replays the cached result. An `Err`
/// from the action, or from recording its result, resets the role so a
/// redelivery can try again. A marker left by a delivery that never came back
/// is claimable once `ledger_stale_seconds` old.
pub async fn run_guarded<F, Fut>(
    pool: &Pool,
    settings: &EngineSettings,
    key: &str,
    role: ActorRole,
    action: F,
) -> Result<Guarded>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CachedResult>>,
{
    match ledger::try_begin(pool, key, role, settings.ledger_stale_seconds).await? {
        BeginOutcome::Started => {}
        BeginOutcome::Complete(result) => {
            info!(txn_key = key, %role, "replaying completed step");
            return Ok(Guarded::Replayed(result));
        }
        BeginOutcome::InProgress => {
            tokio::time::sleep(settings.ledger_recheck).await;
            match ledger::try_begin(pool, key, role, settings.ledger_stale_seconds).await? {
                BeginOutcome::Started => {}
                BeginOutcome::Complete(result) => return Ok(Guarded::Replayed(result)),
                BeginOutcome::InProgress => {
                    warn!(txn_key = key, %role, "step still in progress; asking caller to retry");
                    return Ok(Guarded::Processing);
                }
            }
        }
    }

    match action().await {
        Ok(result) => {
            if let Err(err) = ledger::complete(pool, key, role, &result).await {
                ledger::reset(pool, key, role).await?;
                return Err(err);
            }
            info!(txn_key = key, %role, status = result.status_code, "step complete");
            Ok(Guarded::Fresh(result))
        }
        Err(err) => {
            ledger::reset(pool, key, role).await?;
            Err(err)
        }
    }
}

/// The cached outcome when `role` already completed its step for `key`.
///
/// Handlers whose lookups stop resolving once the step took effect check this
/// before looking anything up.
pub async fn replay(pool: &Pool, key: &str, role: ActorRole) -> Result<Option<ChangeOutcome>> {
    let entry = ledger::load(pool, key).await?;
    if entry.status(role) != LedgerStatus::Complete {
        return Ok(None);
    }
    Ok(entry.result(role).map(ChangeOutcome::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn settings() -> EngineSettings {
        EngineSettings {
            ledger_recheck: Duration::from_millis(5),
            ..EngineSettings::default()
        }
    }

    #[tokio::test]
    async fn completed_step_is_not_rerun() {
        let pool = crate::db::memory_pool().await.unwrap();
        let calls = AtomicUsize::new(0);
        let run = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(CachedResult::success())
        };

        let first = run_guarded(&pool, &settings(), "k", ActorRole::Sender, run).await.unwrap();
        let second = run_guarded(&pool, &settings(), "k", ActorRole::Sender, run).await.unwrap();
        assert!(first.ran_successfully());
        assert_eq!(second, Guarded::Replayed(CachedResult::success()));
        assert_eq!(first.outcome(), second.outcome());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_flight_step_reports_processing() {
        let pool = crate::db::memory_pool().await.unwrap();
        ledger::try_begin(&pool, "k", ActorRole::Recipient, 120).await.unwrap();

        let guarded = run_guarded(&pool, &settings(), "k", ActorRole::Recipient, || async {
            Err::<CachedResult, _>(anyhow!("must not run while another delivery owns the step"))
        })
        .await
        .unwrap();
        assert_eq!(guarded, Guarded::Processing);
        assert_eq!(guarded.outcome().status, 102);
    }

    #[tokio::test]
    async fn internal_error_leaves_step_retryable() {
        let pool = crate::db::memory_pool().await.unwrap();
        let err = run_guarded(&pool, &settings(), "k", ActorRole::Manager, || async {
            Err::<CachedResult, _>(anyhow!("lease exhausted"))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("lease"));

        let retried = run_guarded(&pool, &settings(), "k", ActorRole::Manager, || async {
            Ok::<_, anyhow::Error>(CachedResult::success())
        })
        .await
        .unwrap();
        assert!(retried.ran_successfully());
    }

    #[tokio::test]
    async fn replay_only_for_completed_roles() {
        let pool = crate::db::memory_pool().await.unwrap();
        assert!(replay(&pool, "k", ActorRole::Manager).await.unwrap().is_none());

        let failed = CachedResult::failure(400, "SHIFT_GONE", "gone");
        run_guarded(&pool, &settings(), "k", ActorRole::Manager, || async {
            Ok::<_, anyhow::Error>(CachedResult::failure(400, "SHIFT_GONE", "gone"))
        })
        .await
        .unwrap();
        assert_eq!(
            replay(&pool, "k", ActorRole::Manager).await.unwrap(),
            Some(ChangeOutcome::from(&failed))
        );
        assert!(replay(&pool, "k", ActorRole::Sender).await.unwrap().is_none());
    }
}
