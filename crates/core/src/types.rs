use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a DAG run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of a DAG
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DagId(pub String);

impl DagId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DagId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a task, unique within its DAG
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A dataset is identified by its URI
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl DatasetId {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn uri(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DatasetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A named resource that tasks produce and DAGs can be scheduled on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl Dataset {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            id: DatasetId::new(uri),
            extra: serde_json::Value::Null,
        }
    }

    pub fn uri(&self) -> &str {
        self.id.uri()
    }
}

/// Update signal for a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEvent {
    pub dataset: DatasetId,
    pub timestamp: DateTime<Utc>,
    /// Producer, when the update came from a task outlet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DatasetSource>,
}

impl DatasetEvent {
    pub fn external(dataset: DatasetId, timestamp: DateTime<Utc>) -> Self {
        Self {
            dataset,
            timestamp,
            source: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSource {
    pub dag_id: DagId,
    pub run_id: RunId,
    pub task_id: TaskId,
}

/// State of a DAG run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagRunState {
    Queued,
    Running,
    Success,
    Failed,
    TimedOut,
}

impl DagRunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::TimedOut)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for DagRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// State of a task instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    None,
    Scheduled,
    Queued,
    Running,
    Success,
    Failed,
    UpForRetry,
    UpstreamFailed,
    Skipped,
}

impl TaskState {
    /// Terminal states never change again within a run
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::UpstreamFailed | Self::Skipped
        )
    }

    /// States that satisfy a downstream dependency
    pub fn satisfies_downstream(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    /// States that propagate `upstream_failed` to downstream instances
    pub fn blocks_downstream(self) -> bool {
        matches!(self, Self::Failed | Self::UpstreamFailed)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::UpForRetry => "up_for_retry",
            Self::UpstreamFailed => "upstream_failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// How a DAG run came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Scheduled,
    Manual,
    DatasetTriggered,
}

/// Interval of data a scheduled run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One instantiation of a DAG at a logical date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagRun {
    pub id: RunId,
    pub dag_id: DagId,
    pub run_type: RunType,
    pub logical_date: DateTime<Utc>,
    pub state: DagRunState,
    pub queued_at: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// DAG-level consecutive failure count when this run was created
    pub consecutive_failed_runs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_interval: Option<DataInterval>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggering_events: Vec<DatasetEvent>,
    #[serde(default)]
    pub conf: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Set after the terminal success/failure notification went out
    #[serde(default)]
    pub callback_delivered: bool,
}

/// Outcome of a single task attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
    TimedOut,
    Skipped,
    Cancelled,
    /// Sensor poke that did not meet its condition yet
    Rescheduled,
}

/// Record of one try of a task instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub try_number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<AttemptOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Phase of a sensor's cooperative poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorPhase {
    Waiting,
    Polling,
    Satisfied,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorProgress {
    pub phase: SensorPhase,
    pub first_poke_at: DateTime<Utc>,
    pub pokes: u32,
    pub next_poke_at: Option<DateTime<Utc>>,
}

/// A task's execution record within a DAG run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Number of attempts started so far
    pub try_number: u32,
    pub max_tries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<SensorProgress>,
    #[serde(default)]
    pub attempts: Vec<TaskAttempt>,
}

impl TaskInstance {
    pub fn new(task_id: TaskId, max_tries: u32) -> Self {
        Self {
            task_id,
            state: TaskState::None,
            try_number: 0,
            max_tries,
            next_retry_at: None,
            sensor: None,
            attempts: Vec::new(),
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempts.iter().rev().find_map(|a| a.error.as_deref())
    }

    /// Close the attempt currently in progress
    pub(crate) fn finish_attempt(
        &mut self,
        at: DateTime<Utc>,
        outcome: AttemptOutcome,
        error: Option<String>,
    ) {
        if let Some(attempt) = self.attempts.last_mut() {
            if attempt.ended_at.is_none() {
                attempt.ended_at = Some(at);
                attempt.outcome = Some(outcome);
                attempt.error = error;
            }
        }
    }
}

/// Run-scoped key/value storage: task id -> key -> value
pub type XComStore = BTreeMap<TaskId, BTreeMap<String, serde_json::Value>>;

/// Everything persisted for one DAG run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Version the holder last read; the store writes `version + 1`
    pub version: u64,
    pub run: DagRun,
    pub task_instances: BTreeMap<TaskId, TaskInstance>,
    #[serde(default)]
    pub xcom: XComStore,
}

impl RunRecord {
    pub fn id(&self) -> RunId {
        self.run.id
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskInstance> {
        self.task_instances.get(task_id)
    }

    pub fn task_states(&self) -> BTreeMap<TaskId, TaskState> {
        self.task_instances
            .iter()
            .map(|(id, ti)| (id.clone(), ti.state))
            .collect()
    }
}

/// Durable per-DAG scheduling bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagState {
    pub dag_id: DagId,
    pub consecutive_failed_runs: u32,
    /// Whether the failure callback already heard about the current suppression
    #[serde(default)]
    pub suppression_notified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scheduled_logical_date: Option<DateTime<Utc>>,
}

impl DagState {
    pub fn new(dag_id: DagId) -> Self {
        Self {
            dag_id,
            consecutive_failed_runs: 0,
            suppression_notified: false,
            last_scheduled_logical_date: None,
        }
    }
}
