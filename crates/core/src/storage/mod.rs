pub mod event_log;
pub mod redb_store;
pub mod state_store;

pub use event_log::{JsonlEventLog, MemoryEventLog};
pub use redb_store::RedbRunStateStore;
pub use state_store::{InMemoryRunStateStore, RunStateStore};

use crate::error::{OrchestratorError, Result};
use crate::types::RunRecord;
use std::time::Duration;

/// Bounded exponential backoff for run state writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistRetry {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PersistRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl PersistRetry {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Persist a record, retrying transient backend errors.
///
/// Version conflicts are returned immediately. When the attempts are
/// exhausted the failure is escalated as `StoreUnavailable`; the caller must
/// not proceed as if the write happened.
pub async fn persist_with_retry(
    store: &dyn RunStateStore,
    record: &RunRecord,
    policy: &PersistRetry,
) -> Result<u64> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match store.persist(record) {
            Ok(version) => return Ok(version),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    "Persisting run {} failed (attempt {}/{}), retrying in {:?}: {}",
                    record.run.id,
                    attempt,
                    max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    "Run state store unavailable, giving up on run {} after {} attempts: {}",
                    record.run.id,
                    attempt,
                    e
                );
                return Err(OrchestratorError::StoreUnavailable {
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::storage::state_store::tests::sample_record;
    use crate::types::{DagId, DagRun, DagState, RunId};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` writes, then delegates
    struct FlakyStore {
        inner: InMemoryRunStateStore,
        failures: AtomicU32,
    }

    impl RunStateStore for FlakyStore {
        fn persist(&self, record: &RunRecord) -> std::result::Result<u64, StoreError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Backend(anyhow::anyhow!("disk on fire")));
            }
            self.inner.persist(record)
        }

        fn load(&self, run_id: &RunId) -> std::result::Result<Option<RunRecord>, StoreError> {
            self.inner.load(run_id)
        }

        fn list_runs(&self, dag_id: Option<&DagId>) -> std::result::Result<Vec<DagRun>, StoreError> {
            self.inner.list_runs(dag_id)
        }

        fn load_incomplete(&self) -> std::result::Result<Vec<RunRecord>, StoreError> {
            self.inner.load_incomplete()
        }

        fn dag_state(&self, dag_id: &DagId) -> std::result::Result<DagState, StoreError> {
            self.inner.dag_state(dag_id)
        }

        fn update_dag_state(
            &self,
            dag_id: &DagId,
            update: &mut dyn FnMut(&mut DagState),
        ) -> std::result::Result<DagState, StoreError> {
            self.inner.update_dag_state(dag_id, update)
        }

        fn list_dag_states(&self) -> std::result::Result<Vec<DagState>, StoreError> {
            self.inner.list_dag_states()
        }
    }

    fn flaky(failures: u32) -> FlakyStore {
        FlakyStore {
            inner: InMemoryRunStateStore::new(),
            failures: AtomicU32::new(failures),
        }
    }

    fn fast_policy(max_attempts: u32) -> PersistRetry {
        PersistRetry {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = PersistRetry {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = flaky(2);
        let record = sample_record("ecom");
        let version = persist_with_retry(&store, &record, &fast_policy(3))
            .await
            .unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate() {
        let store = flaky(5);
        let record = sample_record("ecom");
        let err = persist_with_retry(&store, &record, &fast_policy(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::StoreUnavailable { attempts: 3, .. }
        ));
        assert!(store.load(&record.id()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflicts_are_not_retried() {
        let store = flaky(0);
        let mut record = sample_record("ecom");
        record.version = 7;
        let err = persist_with_retry(&store, &record, &fast_policy(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Store(StoreError::Conflict { .. })
        ));
    }
}
