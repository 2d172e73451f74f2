use crate::error::TaskFailure;
use crate::executor::TaskContext;
use crate::types::{Dataset, TaskId};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Value a task returns; stored as the `return_value` XCom when present
pub type TaskOutput = Option<serde_json::Value>;

/// Unit of work invoked by the executor for each attempt of a task
#[async_trait]
pub trait TaskCallable: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> Result<TaskOutput, TaskFailure>;
}

/// Adapter turning an async closure into a [`TaskCallable`]
pub struct FnTask<F>(F);

#[async_trait]
impl<F, Fut> TaskCallable for FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskOutput, TaskFailure>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> Result<TaskOutput, TaskFailure> {
        (self.0)(ctx).await
    }
}

pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TaskCallable>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutput, TaskFailure>> + Send + 'static,
{
    Arc::new(FnTask(f))
}

/// Result of a single sensor poke
#[derive(Debug, Clone, PartialEq)]
pub struct PokeOutcome {
    pub is_done: bool,
    pub xcom_value: Option<serde_json::Value>,
}

impl PokeOutcome {
    pub fn done() -> Self {
        Self {
            is_done: true,
            xcom_value: None,
        }
    }

    pub fn done_with(value: serde_json::Value) -> Self {
        Self {
            is_done: true,
            xcom_value: Some(value),
        }
    }

    pub fn not_yet() -> Self {
        Self {
            is_done: false,
            xcom_value: None,
        }
    }
}

/// A condition checked cooperatively every `poke_interval` until it holds
#[async_trait]
pub trait Sensor: Send + Sync {
    async fn poke(&self, ctx: TaskContext) -> Result<PokeOutcome, TaskFailure>;
}

pub struct FnSensor<F>(F);

#[async_trait]
impl<F, Fut> Sensor for FnSensor<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PokeOutcome, TaskFailure>> + Send + 'static,
{
    async fn poke(&self, ctx: TaskContext) -> Result<PokeOutcome, TaskFailure> {
        (self.0)(ctx).await
    }
}

pub fn sensor_fn<F, Fut>(f: F) -> Arc<dyn Sensor>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PokeOutcome, TaskFailure>> + Send + 'static,
{
    Arc::new(FnSensor(f))
}

/// What a task does when dispatched
#[derive(Clone)]
pub enum TaskOperator {
    Callable(Arc<dyn TaskCallable>),
    Sensor {
        sensor: Arc<dyn Sensor>,
        poke_interval: Duration,
        timeout: Duration,
    },
}

impl TaskOperator {
    pub fn is_sensor(&self) -> bool {
        matches!(self, Self::Sensor { .. })
    }
}

impl std::fmt::Debug for TaskOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callable(_) => f.write_str("Callable"),
            Self::Sensor {
                poke_interval,
                timeout,
                ..
            } => f
                .debug_struct("Sensor")
                .field("poke_interval", poke_interval)
                .field("timeout", timeout)
                .finish(),
        }
    }
}

/// DAG-wide defaults for task retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultArgs {
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for DefaultArgs {
    fn default() -> Self {
        Self {
            retries: 0,
            retry_delay: Duration::from_secs(300),
        }
    }
}

/// Immutable definition of a task within a DAG
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub description: Option<String>,
    pub operator: TaskOperator,
    pub retries: u32,
    pub retry_delay: Duration,
    pub retry_exponential_backoff: bool,
    pub max_retry_delay: Option<Duration>,
    /// Tasks that must complete before this one
    pub upstream: BTreeSet<TaskId>,
    /// Datasets this task updates on success
    pub outlets: Vec<Dataset>,
    pub execution_timeout: Option<Duration>,
}

impl TaskDefinition {
    /// Total attempts allowed, the first try included
    pub fn max_tries(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay before the retry following attempt `try_number`
    pub fn retry_delay_for(&self, try_number: u32) -> Duration {
        if !self.retry_exponential_backoff {
            return self.retry_delay;
        }

        let factor = 2u32.saturating_pow(try_number.saturating_sub(1));
        let delay = self.retry_delay.saturating_mul(factor);
        match self.max_retry_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Builder for a single task; finalised by [`crate::dag::DagBuilder::build`]
pub struct TaskBuilder {
    id: TaskId,
    description: Option<String>,
    operator: TaskOperator,
    retries: Option<u32>,
    retry_delay: Option<Duration>,
    retry_exponential_backoff: bool,
    max_retry_delay: Option<Duration>,
    upstream: BTreeSet<TaskId>,
    outlets: Vec<Dataset>,
    execution_timeout: Option<Duration>,
}

impl TaskBuilder {
    pub fn new(id: impl Into<String>, callable: Arc<dyn TaskCallable>) -> Self {
        Self::with_operator(id, TaskOperator::Callable(callable))
    }

    pub fn sensor(
        id: impl Into<String>,
        sensor: Arc<dyn Sensor>,
        poke_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self::with_operator(
            id,
            TaskOperator::Sensor {
                sensor,
                poke_interval,
                timeout,
            },
        )
    }

    fn with_operator(id: impl Into<String>, operator: TaskOperator) -> Self {
        Self {
            id: TaskId::new(id),
            description: None,
            operator,
            retries: None,
            retry_delay: None,
            retry_exponential_backoff: false,
            max_retry_delay: None,
            upstream: BTreeSet::new(),
            outlets: Vec::new(),
            execution_timeout: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn retry_exponential_backoff(mut self, max_delay: Option<Duration>) -> Self {
        self.retry_exponential_backoff = true;
        self.max_retry_delay = max_delay;
        self
    }

    pub fn upstream(mut self, task_id: impl Into<String>) -> Self {
        self.upstream.insert(TaskId::new(task_id));
        self
    }

    pub fn outlet(mut self, dataset: Dataset) -> Self {
        self.outlets.push(dataset);
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Resolve defaults; upstream edges are validated by the DAG builder
    pub(crate) fn build(self, defaults: &DefaultArgs) -> TaskDefinition {
        TaskDefinition {
            id: self.id,
            description: self.description,
            operator: self.operator,
            retries: self.retries.unwrap_or(defaults.retries),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            retry_exponential_backoff: self.retry_exponential_backoff,
            max_retry_delay: self.max_retry_delay,
            upstream: self.upstream,
            outlets: self.outlets,
            execution_timeout: self.execution_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn TaskCallable> {
        task_fn(|_ctx| async { Ok(None) })
    }

    #[test]
    fn test_defaults_fill_unset_retry_settings() {
        let defaults = DefaultArgs {
            retries: 3,
            retry_delay: Duration::from_secs(10),
        };

        let task = TaskBuilder::new("extract", noop()).build(&defaults);
        assert_eq!(task.retries, 3);
        assert_eq!(task.max_tries(), 4);
        assert_eq!(task.retry_delay, Duration::from_secs(10));

        let task = TaskBuilder::new("load", noop()).retries(0).build(&defaults);
        assert_eq!(task.max_tries(), 1);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let task = TaskBuilder::new("flaky", noop())
            .retry_delay(Duration::from_secs(2))
            .retry_exponential_backoff(Some(Duration::from_secs(10)))
            .build(&DefaultArgs::default());

        assert_eq!(task.retry_delay_for(1), Duration::from_secs(2));
        assert_eq!(task.retry_delay_for(2), Duration::from_secs(4));
        assert_eq!(task.retry_delay_for(3), Duration::from_secs(8));
        assert_eq!(task.retry_delay_for(4), Duration::from_secs(10));
    }
}
