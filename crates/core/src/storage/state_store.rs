use crate::error::StoreError;
use crate::types::{DagId, DagRun, DagRunState, DagState, RunId, RunRecord, RunType};
use std::collections::HashMap;
use std::sync::Mutex;

/// Durable mapping from run id to the run and all of its task instances.
///
/// `persist` is atomic per run and guarded by an optimistic version check:
/// the record's `version` must match the stored one, and the store writes
/// `version + 1`. Persisting the same record twice is a no-op the second
/// time. The owning DAG's bookkeeping changes in the same write: creating
/// a scheduled run advances its schedule cursor, and a run's first terminal
/// state updates its consecutive failure counter.
pub trait RunStateStore: Send + Sync {
    /// Write a run record, returning the new version
    fn persist(&self, record: &RunRecord) -> Result<u64, StoreError>;

    /// Load the exact last persisted state of a run
    fn load(&self, run_id: &RunId) -> Result<Option<RunRecord>, StoreError>;

    /// Runs of one DAG (or all), ordered by logical date
    fn list_runs(&self, dag_id: Option<&DagId>) -> Result<Vec<DagRun>, StoreError>;

    /// Runs needing attention after a restart: not terminal, or terminal
    /// with an undelivered notification
    fn load_incomplete(&self) -> Result<Vec<RunRecord>, StoreError>;

    /// Per-DAG bookkeeping, defaulted when never written
    fn dag_state(&self, dag_id: &DagId) -> Result<DagState, StoreError>;

    /// Atomically read-modify-write a DAG's bookkeeping
    fn update_dag_state(
        &self,
        dag_id: &DagId,
        update: &mut dyn FnMut(&mut DagState),
    ) -> Result<DagState, StoreError>;

    fn list_dag_states(&self) -> Result<Vec<DagState>, StoreError>;

    /// Make buffered writes durable; backends committing per write need nothing
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// How an incoming record relates to the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteDecision {
    Write { new_version: u64 },
    /// Same content already stored under the version a write would produce
    Replay { version: u64 },
}

pub(crate) fn check_version(
    stored: Option<&RunRecord>,
    incoming: &RunRecord,
) -> Result<WriteDecision, StoreError> {
    let found = stored.map_or(0, |s| s.version);

    if found == incoming.version {
        return Ok(WriteDecision::Write {
            new_version: incoming.version + 1,
        });
    }

    if let Some(stored) = stored {
        if stored.version == incoming.version + 1 {
            let mut previous = stored.clone();
            previous.version = incoming.version;
            if &previous == incoming {
                return Ok(WriteDecision::Replay {
                    version: stored.version,
                });
            }
        }
    }

    Err(StoreError::Conflict {
        run_id: incoming.run.id,
        expected: incoming.version,
        found,
    })
}

/// Fold a run write into its DAG's bookkeeping, returning whether it changed
pub(crate) fn apply_run_write(
    dag_state: &mut DagState,
    previous: Option<DagRunState>,
    record: &RunRecord,
) -> bool {
    let mut changed = false;
    if previous.is_none() && record.run.run_type == RunType::Scheduled {
        let logical_date = record.run.logical_date;
        if dag_state
            .last_scheduled_logical_date
            .map_or(true, |last| logical_date > last)
        {
            dag_state.last_scheduled_logical_date = Some(logical_date);
            changed = true;
        }
    }
    apply_run_outcome(dag_state, previous, record.run.state) || changed
}

/// A run's first terminal transition moves the DAG's failure counter
fn apply_run_outcome(
    dag_state: &mut DagState,
    previous: Option<DagRunState>,
    next: DagRunState,
) -> bool {
    let was_terminal = previous.is_some_and(|s| s.is_terminal());
    if was_terminal || !next.is_terminal() {
        return false;
    }

    if next == DagRunState::Success {
        dag_state.consecutive_failed_runs = 0;
        dag_state.suppression_notified = false;
    } else {
        dag_state.consecutive_failed_runs += 1;
    }
    true
}

pub(crate) fn needs_recovery(record: &RunRecord) -> bool {
    !record.run.state.is_terminal() || !record.run.callback_delivered
}

#[derive(Default)]
struct MemoryInner {
    runs: HashMap<RunId, RunRecord>,
    dags: HashMap<DagId, DagState>,
}

/// Process-local store, for tests and ephemeral setups
#[derive(Default)]
pub struct InMemoryRunStateStore {
    inner: Mutex<MemoryInner>,
}

impl InMemoryRunStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStateStore for InMemoryRunStateStore {
    fn persist(&self, record: &RunRecord) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner.runs.get(&record.run.id);

        let new_version = match check_version(stored, record)? {
            WriteDecision::Replay { version } => return Ok(version),
            WriteDecision::Write { new_version } => new_version,
        };

        let previous = stored.map(|s| s.run.state);
        let dag_id = record.run.dag_id.clone();
        let dag_state = inner
            .dags
            .entry(dag_id.clone())
            .or_insert_with(|| DagState::new(dag_id));
        apply_run_write(dag_state, previous, record);

        let mut stored = record.clone();
        stored.version = new_version;
        inner.runs.insert(record.run.id, stored);

        Ok(new_version)
    }

    fn load(&self, run_id: &RunId) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.inner.lock().unwrap().runs.get(run_id).cloned())
    }

    fn list_runs(&self, dag_id: Option<&DagId>) -> Result<Vec<DagRun>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<DagRun> = inner
            .runs
            .values()
            .filter(|r| dag_id.map_or(true, |d| &r.run.dag_id == d))
            .map(|r| r.run.clone())
            .collect();
        runs.sort_by(|a, b| {
            a.logical_date
                .cmp(&b.logical_date)
                .then(a.queued_at.cmp(&b.queued_at))
        });
        Ok(runs)
    }

    fn load_incomplete(&self) -> Result<Vec<RunRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .values()
            .filter(|r| needs_recovery(r))
            .cloned()
            .collect())
    }

    fn dag_state(&self, dag_id: &DagId) -> Result<DagState, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .dags
            .get(dag_id)
            .cloned()
            .unwrap_or_else(|| DagState::new(dag_id.clone())))
    }

    fn update_dag_state(
        &self,
        dag_id: &DagId,
        update: &mut dyn FnMut(&mut DagState),
    ) -> Result<DagState, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .dags
            .entry(dag_id.clone())
            .or_insert_with(|| DagState::new(dag_id.clone()));
        update(state);
        Ok(state.clone())
    }

    fn list_dag_states(&self) -> Result<Vec<DagState>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut states: Vec<DagState> = inner.dags.values().cloned().collect();
        states.sort_by(|a, b| a.dag_id.cmp(&b.dag_id));
        Ok(states)
    }
}
