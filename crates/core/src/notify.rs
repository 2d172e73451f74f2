//! Terminal-state notifications for DAG-level success/failure callbacks.

use crate::types::{DagId, DagRunState, RunId, RunRecord, TaskId, TaskState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    Succeeded,
    Failed,
    TimedOut,
    /// The scheduler declined to create a run
    Suppressed { consecutive_failed: u32, limit: u32 },
}

/// Message delivered when a run reaches a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNotification {
    pub dag_id: DagId,
    pub run_id: Option<RunId>,
    pub logical_date: Option<DateTime<Utc>>,
    pub kind: NotificationKind,
    #[serde(default)]
    pub failed_tasks: Vec<TaskId>,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

impl RunNotification {
    pub fn for_run(record: &RunRecord) -> Self {
        let kind = match record.run.state {
            DagRunState::Success => NotificationKind::Succeeded,
            DagRunState::TimedOut => NotificationKind::TimedOut,
            _ => NotificationKind::Failed,
        };

        Self {
            dag_id: record.run.dag_id.clone(),
            run_id: Some(record.run.id),
            logical_date: Some(record.run.logical_date),
            kind,
            failed_tasks: record
                .task_instances
                .values()
                .filter(|ti| ti.state == TaskState::Failed)
                .map(|ti| ti.task_id.clone())
                .collect(),
            note: record.run.note.clone(),
            at: Utc::now(),
        }
    }

    pub fn suppressed(dag_id: DagId, consecutive_failed: u32, limit: u32) -> Self {
        Self {
            dag_id,
            run_id: None,
            logical_date: None,
            kind: NotificationKind::Suppressed {
                consecutive_failed,
                limit,
            },
            failed_tasks: Vec::new(),
            note: Some(format!(
                "Scheduling suppressed after {} consecutive failed runs",
                consecutive_failed
            )),
            at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == NotificationKind::Succeeded
    }
}

/// Receiver of DAG-level success/failure notifications.
///
/// Called once per terminal run. A process that dies after `notify` returns
/// but before the delivery is recorded calls it again from `recover` with
/// the same `run_id`; receivers with side effects dedupe on it.
#[async_trait]
pub trait RunCallback: Send + Sync {
    async fn notify(&self, notification: &RunNotification);
}

struct FnCallback<F>(F);

#[async_trait]
impl<F> RunCallback for FnCallback<F>
where
    F: Fn(&RunNotification) + Send + Sync,
{
    async fn notify(&self, notification: &RunNotification) {
        (self.0)(notification)
    }
}

/// Wrap a synchronous closure as a callback
pub fn callback_fn<F>(f: F) -> Arc<dyn RunCallback>
where
    F: Fn(&RunNotification) + Send + Sync + 'static,
{
    Arc::new(FnCallback(f))
}

/// Forwards notifications over a channel
pub struct ChannelCallback {
    tx: mpsc::UnboundedSender<RunNotification>,
}

impl ChannelCallback {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RunNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl RunCallback for ChannelCallback {
    async fn notify(&self, notification: &RunNotification) {
        if self.tx.send(notification.clone()).is_err() {
            tracing::debug!(
                "Notification receiver dropped for DAG {}",
                notification.dag_id
            );
        }
    }
}
