use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An entry in a run's audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub dag_id: DagId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, dag_id: DagId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            dag_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunQueued {
        run_type: RunType,
        logical_date: DateTime<Utc>,
    },
    RunStarted,
    /// Picked up again after a restart
    RunResumed,
    RunFinished {
        state: DagRunState,
        duration_secs: i64,
    },

    // Task lifecycle events
    TaskScheduled {
        task_id: TaskId,
    },
    TaskQueued {
        task_id: TaskId,
        try_number: u32,
    },
    TaskStarted {
        task_id: TaskId,
        try_number: u32,
    },
    TaskSucceeded {
        task_id: TaskId,
        try_number: u32,
    },
    TaskFailed {
        task_id: TaskId,
        try_number: u32,
        error: String,
        will_retry: bool,
    },
    TaskSkipped {
        task_id: TaskId,
        reason: String,
    },
    TaskUpstreamFailed {
        task_id: TaskId,
    },
    SensorRescheduled {
        task_id: TaskId,
        pokes: u32,
        next_poke_at: DateTime<Utc>,
    },

    DatasetUpdated {
        dataset: DatasetId,
        task_id: TaskId,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;

    /// Write out everything still buffered
    async fn flush_all(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
