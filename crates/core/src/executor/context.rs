use crate::types::{DagId, RunId, RunType, TaskId, XComStore};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// XCom key under which a task's return value is stored
pub const RETURN_VALUE_KEY: &str = "return_value";

/// Handed to every task attempt and sensor poke.
///
/// Pulls read the run's XCom as of dispatch; pushes are buffered and merged
/// into the run record when the attempt completes.
#[derive(Clone)]
pub struct TaskContext {
    pub dag_id: DagId,
    pub run_id: RunId,
    pub task_id: TaskId,
    pub logical_date: DateTime<Utc>,
    pub try_number: u32,
    pub run_type: RunType,
    /// Manual trigger configuration, `null` otherwise
    pub conf: Value,
    xcom: Arc<XComStore>,
    pushed: Arc<Mutex<BTreeMap<String, Value>>>,
    cancel: CancellationToken,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        dag_id: DagId,
        run_id: RunId,
        task_id: TaskId,
        logical_date: DateTime<Utc>,
        try_number: u32,
        run_type: RunType,
        conf: Value,
        xcom: Arc<XComStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dag_id,
            run_id,
            task_id,
            logical_date,
            try_number,
            run_type,
            conf,
            xcom,
            pushed: Arc::new(Mutex::new(BTreeMap::new())),
            cancel,
        }
    }

    /// Store a value under `key` for downstream tasks of this run
    pub fn xcom_push(&self, key: impl Into<String>, value: Value) {
        self.pushed.lock().unwrap().insert(key.into(), value);
    }

    /// Read a value pushed by `task_id` in this run.
    ///
    /// Values pushed by the current attempt are visible to itself.
    pub fn xcom_pull(&self, task_id: impl Into<TaskId>, key: &str) -> Option<Value> {
        let task_id = task_id.into();
        if task_id == self.task_id {
            if let Some(value) = self.pushed.lock().unwrap().get(key) {
                return Some(value.clone());
            }
        }
        self.xcom.get(&task_id)?.get(key).cloned()
    }

    pub fn xcom_pull_return(&self, task_id: impl Into<TaskId>) -> Option<Value> {
        self.xcom_pull(task_id, RETURN_VALUE_KEY)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled on run timeout, manual cancel, task timeout or shutdown
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn take_pushed(&self) -> BTreeMap<String, Value> {
        std::mem::take(&mut *self.pushed.lock().unwrap())
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("dag_id", &self.dag_id)
            .field("run_id", &self.run_id)
            .field("task_id", &self.task_id)
            .field("try_number", &self.try_number)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(task: &str, xcom: XComStore) -> TaskContext {
        TaskContext::new(
            DagId::new("extractor"),
            RunId::new(),
            TaskId::new(task),
            Utc::now(),
            1,
            RunType::Manual,
            Value::Null,
            Arc::new(xcom),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_pull_reads_upstream_values() {
        let mut xcom = XComStore::new();
        xcom.entry(TaskId::new("get_cocktail"))
            .or_default()
            .insert("request_size".to_string(), json!(1024));

        let ctx = context("check_size", xcom);
        assert_eq!(ctx.xcom_pull("get_cocktail", "request_size"), Some(json!(1024)));
        assert_eq!(ctx.xcom_pull("get_cocktail", "missing"), None);
        assert_eq!(ctx.xcom_pull_return("other"), None);
    }

    #[test]
    fn test_push_is_buffered_until_taken() {
        let ctx = context("get_cocktail", XComStore::new());
        let clone = ctx.clone();
        clone.xcom_push("request_size", json!(42));

        assert_eq!(ctx.xcom_pull("get_cocktail", "request_size"), Some(json!(42)));
        let pushed = ctx.take_pushed();
        assert_eq!(pushed.get("request_size"), Some(&json!(42)));
        assert!(ctx.take_pushed().is_empty());
    }
}
