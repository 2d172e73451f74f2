use super::state_store::{
    apply_run_write, check_version, needs_recovery, RunStateStore, WriteDecision,
};
use crate::error::StoreError;
use crate::types::{DagId, DagRun, DagState, RunId, RunRecord};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");
const DAG_STATES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("dag_states");

/// Run state store on an embedded redb database; one write transaction per persist
#[derive(Clone)]
pub struct RedbRunStateStore {
    db: Arc<Database>,
}

impl RedbRunStateStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _runs_table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
            let _dag_states_table = write_txn
                .open_table(DAG_STATES_TABLE)
                .context("Failed to open dag states table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn persist_record(&self, record: &RunRecord) -> Result<std::result::Result<u64, StoreError>> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let new_version = {
            let mut runs = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;

            let key = record.run.id.to_string();
            let stored: Option<RunRecord> = match runs.get(key.as_str()).context("Failed to get run")? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).context("Failed to deserialize run")?,
                ),
                None => None,
            };

            let new_version = match check_version(stored.as_ref(), record) {
                Ok(WriteDecision::Write { new_version }) => new_version,
                Ok(WriteDecision::Replay { version }) => return Ok(Ok(version)),
                Err(conflict) => return Ok(Err(conflict)),
            };

            let mut next = record.clone();
            next.version = new_version;
            let value = serde_json::to_vec(&next).context("Failed to serialize run")?;
            runs.insert(key.as_str(), value.as_slice())
                .context("Failed to insert run")?;

            let mut dags = write_txn
                .open_table(DAG_STATES_TABLE)
                .context("Failed to open dag states table")?;
            let dag_key = record.run.dag_id.as_str();
            let mut dag_state = match dags.get(dag_key).context("Failed to get dag state")? {
                Some(guard) => serde_json::from_slice(guard.value())
                    .context("Failed to deserialize dag state")?,
                None => DagState::new(record.run.dag_id.clone()),
            };
            let previous = stored.map(|s| s.run.state);
            if apply_run_write(&mut dag_state, previous, record) {
                let value =
                    serde_json::to_vec(&dag_state).context("Failed to serialize dag state")?;
                dags.insert(dag_key, value.as_slice())
                    .context("Failed to insert dag state")?;
            }

            new_version
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(Ok(new_version))
    }

    fn read_runs(&self) -> Result<Vec<RunRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let mut records = Vec::new();
        for item in table.iter().context("Failed to iterate runs")? {
            let (_key, value) = item.context("Failed to read item")?;
            let record: RunRecord =
                serde_json::from_slice(value.value()).context("Failed to deserialize run")?;
            records.push(record);
        }
        Ok(records)
    }

    fn read_dag_state(&self, dag_id: &DagId) -> Result<Option<DagState>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(DAG_STATES_TABLE)
            .context("Failed to open table")?;

        match table.get(dag_id.as_str()).context("Failed to get dag state")? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).context("Failed to deserialize dag state")?,
            )),
            None => Ok(None),
        }
    }

    fn write_dag_state(
        &self,
        dag_id: &DagId,
        update: &mut dyn FnMut(&mut DagState),
    ) -> Result<DagState> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let state = {
            let mut table = write_txn
                .open_table(DAG_STATES_TABLE)
                .context("Failed to open table")?;
            let mut state = match table.get(dag_id.as_str()).context("Failed to get dag state")? {
                Some(guard) => serde_json::from_slice(guard.value())
                    .context("Failed to deserialize dag state")?,
                None => DagState::new(dag_id.clone()),
            };
            update(&mut state);
            let value = serde_json::to_vec(&state).context("Failed to serialize dag state")?;
            table
                .insert(dag_id.as_str(), value.as_slice())
                .context("Failed to insert dag state")?;
            state
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(state)
    }

    fn read_dag_states(&self) -> Result<Vec<DagState>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(DAG_STATES_TABLE)
            .context("Failed to open table")?;

        let mut states = Vec::new();
        for item in table.iter().context("Failed to iterate dag states")? {
            let (_key, value) = item.context("Failed to read item")?;
            states.push(
                serde_json::from_slice(value.value())
                    .context("Failed to deserialize dag state")?,
            );
        }
        Ok(states)
    }
}

impl RunStateStore for RedbRunStateStore {
    fn persist(&self, record: &RunRecord) -> std::result::Result<u64, StoreError> {
        self.persist_record(record)?
    }

    fn load(&self, run_id: &RunId) -> std::result::Result<Option<RunRecord>, StoreError> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let key = run_id.to_string();
        let value = table.get(key.as_str()).context("Failed to get run")?;

        match value {
            Some(guard) => {
                let record: RunRecord = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize run")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_runs(&self, dag_id: Option<&DagId>) -> std::result::Result<Vec<DagRun>, StoreError> {
        let mut runs: Vec<DagRun> = self
            .read_runs()?
            .into_iter()
            .map(|r| r.run)
            .filter(|run| dag_id.map_or(true, |d| &run.dag_id == d))
            .collect();
        runs.sort_by(|a, b| {
            a.logical_date
                .cmp(&b.logical_date)
                .then(a.queued_at.cmp(&b.queued_at))
        });
        Ok(runs)
    }

    fn load_incomplete(&self) -> std::result::Result<Vec<RunRecord>, StoreError> {
        Ok(self
            .read_runs()?
            .into_iter()
            .filter(needs_recovery)
            .collect())
    }

    fn dag_state(&self, dag_id: &DagId) -> std::result::Result<DagState, StoreError> {
        Ok(self
            .read_dag_state(dag_id)?
            .unwrap_or_else(|| DagState::new(dag_id.clone())))
    }

    fn update_dag_state(
        &self,
        dag_id: &DagId,
        update: &mut dyn FnMut(&mut DagState),
    ) -> std::result::Result<DagState, StoreError> {
        Ok(self.write_dag_state(dag_id, update)?)
    }

    fn list_dag_states(&self) -> std::result::Result<Vec<DagState>, StoreError> {
        let mut states = self.read_dag_states()?;
        states.sort_by(|a, b| a.dag_id.cmp(&b.dag_id));
        Ok(states)
    }
}
