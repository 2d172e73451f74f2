use super::graph::DependencyGraph;
use super::settings::{DagSettings, ScheduleSetting};
use super::task::{DefaultArgs, TaskBuilder, TaskDefinition};
use crate::error::DagError;
use crate::notify::RunCallback;
use crate::schedule::{DatasetMode, ScheduleDescriptor};
use crate::types::{DagId, Dataset, DatasetId, TaskId, TaskInstance};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Validated, immutable DAG. Only obtainable through [`DagBuilder::build`].
pub struct DagDefinition {
    id: DagId,
    description: Option<String>,
    tags: Vec<String>,
    schedule: ScheduleDescriptor,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    catchup: bool,
    max_active_runs: u32,
    max_active_tasks: Option<usize>,
    max_consecutive_failed_runs: u32,
    dagrun_timeout: Option<Duration>,
    on_success: Option<Arc<dyn RunCallback>>,
    on_failure: Option<Arc<dyn RunCallback>>,
    tasks: Vec<TaskDefinition>,
    task_index: HashMap<TaskId, usize>,
    graph: DependencyGraph,
    topological_order: Vec<TaskId>,
}

impl DagDefinition {
    pub fn id(&self) -> &DagId {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn schedule(&self) -> &ScheduleDescriptor {
        &self.schedule
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
    }

    pub fn catchup(&self) -> bool {
        self.catchup
    }

    pub fn max_active_runs(&self) -> u32 {
        self.max_active_runs
    }

    pub fn max_active_tasks(&self) -> Option<usize> {
        self.max_active_tasks
    }

    /// Zero means unlimited
    pub fn max_consecutive_failed_runs(&self) -> u32 {
        self.max_consecutive_failed_runs
    }

    pub fn dagrun_timeout(&self) -> Option<Duration> {
        self.dagrun_timeout
    }

    pub fn on_success(&self) -> Option<&Arc<dyn RunCallback>> {
        self.on_success.as_ref()
    }

    pub fn on_failure(&self) -> Option<&Arc<dyn RunCallback>> {
        self.on_failure.as_ref()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.iter()
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskDefinition> {
        self.task_index.get(task_id).map(|&i| &self.tasks[i])
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn topological_order(&self) -> &[TaskId] {
        &self.topological_order
    }

    /// Datasets written by task outlets
    pub fn produced_datasets(&self) -> BTreeSet<DatasetId> {
        self.tasks
            .iter()
            .flat_map(|t| t.outlets.iter().map(|d| d.id.clone()))
            .collect()
    }

    /// Fresh task instances for a new run
    pub fn new_task_instances(&self) -> BTreeMap<TaskId, TaskInstance> {
        self.tasks
            .iter()
            .map(|t| (t.id.clone(), TaskInstance::new(t.id.clone(), t.max_tries())))
            .collect()
    }
}

impl std::fmt::Debug for DagDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagDefinition")
            .field("id", &self.id)
            .field("schedule", &self.schedule)
            .field("catchup", &self.catchup)
            .field("max_active_runs", &self.max_active_runs)
            .field("tasks", &self.topological_order)
            .finish()
    }
}

/// Explicit DAG construction; validates the task graph on [`build`](Self::build)
pub struct DagBuilder {
    id: DagId,
    description: Option<String>,
    tags: Vec<String>,
    schedule: ScheduleDescriptor,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    catchup: bool,
    max_active_runs: u32,
    max_active_tasks: Option<usize>,
    max_consecutive_failed_runs: u32,
    dagrun_timeout: Option<Duration>,
    default_args: DefaultArgs,
    on_success: Option<Arc<dyn RunCallback>>,
    on_failure: Option<Arc<dyn RunCallback>>,
    tasks: Vec<TaskBuilder>,
    edges: Vec<(TaskId, TaskId)>,
}

impl DagBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: DagId::new(id),
            description: None,
            tags: Vec::new(),
            schedule: ScheduleDescriptor::Manual,
            start_date: None,
            end_date: None,
            catchup: false,
            max_active_runs: 16,
            max_active_tasks: None,
            max_consecutive_failed_runs: 0,
            dagrun_timeout: None,
            default_args: DefaultArgs::default(),
            on_success: None,
            on_failure: None,
            tasks: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn id(&self) -> &DagId {
        &self.id
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn schedule(mut self, schedule: ScheduleDescriptor) -> Self {
        self.schedule = schedule;
        self
    }

    /// Parse and set a schedule expression (`@daily`, `0 6 * * *`, `@once`, `none`)
    pub fn schedule_expr(mut self, expr: &str) -> Result<Self, DagError> {
        self.schedule = ScheduleDescriptor::parse(expr)?;
        Ok(self)
    }

    pub fn start_date(mut self, start: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self
    }

    pub fn end_date(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    pub fn catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    pub fn max_active_runs(mut self, max: u32) -> Self {
        self.max_active_runs = max;
        self
    }

    pub fn max_active_tasks(mut self, max: usize) -> Self {
        self.max_active_tasks = Some(max);
        self
    }

    pub fn max_consecutive_failed_runs(mut self, max: u32) -> Self {
        self.max_consecutive_failed_runs = max;
        self
    }

    pub fn dagrun_timeout(mut self, timeout: Duration) -> Self {
        self.dagrun_timeout = Some(timeout);
        self
    }

    pub fn default_retries(mut self, retries: u32) -> Self {
        self.default_args.retries = retries;
        self
    }

    pub fn default_retry_delay(mut self, delay: Duration) -> Self {
        self.default_args.retry_delay = delay;
        self
    }

    pub fn on_success(mut self, callback: Arc<dyn RunCallback>) -> Self {
        self.on_success = Some(callback);
        self
    }

    pub fn on_failure(mut self, callback: Arc<dyn RunCallback>) -> Self {
        self.on_failure = Some(callback);
        self
    }

    pub fn task(mut self, task: TaskBuilder) -> Self {
        self.tasks.push(task);
        self
    }

    /// Declare that `upstream` must complete before `downstream`
    pub fn edge(mut self, upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        self.edges
            .push((TaskId::new(upstream), TaskId::new(downstream)));
        self
    }

    /// Chain tasks in order: `a >> b >> c`
    pub fn chain<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<TaskId> = tasks.into_iter().map(|s| TaskId::new(s)).collect();
        for pair in ids.windows(2) {
            self.edges.push((pair[0].clone(), pair[1].clone()));
        }
        self
    }

    /// Apply configuration-surface overrides
    pub fn with_settings(mut self, settings: &DagSettings) -> Result<Self, DagError> {
        if let Some(schedule) = &settings.schedule {
            self.schedule = match schedule {
                ScheduleSetting::Expr(expr) => ScheduleDescriptor::parse(expr)?,
                ScheduleSetting::Datasets(uris) => ScheduleDescriptor::datasets(
                    uris.iter().map(|u| DatasetId::new(u.as_str())),
                    settings.dataset_mode.unwrap_or_default(),
                ),
            };
        } else if let (Some(mode), ScheduleDescriptor::Datasets(condition)) =
            (settings.dataset_mode, &mut self.schedule)
        {
            condition.mode = mode;
        }
        if let Some(catchup) = settings.catchup {
            self.catchup = catchup;
        }
        if let Some(max) = settings.max_active_runs {
            self.max_active_runs = max;
        }
        if let Some(max) = settings.max_consecutive_failed_dag_runs {
            self.max_consecutive_failed_runs = max;
        }
        if let Some(secs) = settings.dagrun_timeout_secs {
            self.dagrun_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(retries) = settings.retries {
            self.default_args.retries = retries;
        }
        if let Some(secs) = settings.retry_delay_secs {
            self.default_args.retry_delay = Duration::from_secs(secs);
        }
        Ok(self)
    }

    /// Validate and freeze the DAG. Any error discards the whole definition.
    pub fn build(self) -> Result<DagDefinition, DagError> {
        if self.id.as_str().trim().is_empty() {
            return Err(DagError::Invalid("DAG id must not be empty".to_string()));
        }
        if self.max_active_runs == 0 {
            return Err(DagError::Invalid(format!(
                "max_active_runs of DAG {} must be positive",
                self.id
            )));
        }
        if self.max_active_tasks == Some(0) {
            return Err(DagError::Invalid(format!(
                "max_active_tasks of DAG {} must be positive",
                self.id
            )));
        }
        if matches!(self.schedule, ScheduleDescriptor::Cron(_)) && self.start_date.is_none() {
            return Err(DagError::Invalid(format!(
                "DAG {} has a cron schedule but no start_date",
                self.id
            )));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                return Err(DagError::Invalid(format!(
                    "DAG {} ends before it starts",
                    self.id
                )));
            }
        }

        let mut graph = DependencyGraph::new();
        let mut tasks: Vec<TaskDefinition> = Vec::with_capacity(self.tasks.len());
        let mut task_index = HashMap::new();

        for builder in self.tasks {
            let task = builder.build(&self.default_args);
            graph.add_task(task.id.clone())?;
            task_index.insert(task.id.clone(), tasks.len());
            tasks.push(task);
        }

        let declared = tasks
            .iter()
            .flat_map(|t| t.upstream.iter().map(move |up| (up.clone(), t.id.clone())));
        let edges: Vec<(TaskId, TaskId)> = declared.chain(self.edges).collect();
        for (upstream, downstream) in &edges {
            graph.add_edge(upstream, downstream)?;
        }

        // Upstream sets reflect every edge, however it was declared
        for task in &mut tasks {
            task.upstream = graph.upstream(&task.id).cloned().collect();
        }

        let topological_order = graph.topological_order()?;

        tracing::debug!(
            "Built DAG {} with {} tasks and {} edges",
            self.id,
            tasks.len(),
            edges.len()
        );

        Ok(DagDefinition {
            id: self.id,
            description: self.description,
            tags: self.tags,
            schedule: self.schedule,
            start_date: self.start_date,
            end_date: self.end_date,
            catchup: self.catchup,
            max_active_runs: self.max_active_runs,
            max_active_tasks: self.max_active_tasks,
            max_consecutive_failed_runs: self.max_consecutive_failed_runs,
            dagrun_timeout: self.dagrun_timeout,
            on_success: self.on_success,
            on_failure: self.on_failure,
            tasks,
            task_index,
            graph,
            topological_order,
        })
    }
}

/// Shorthand for a dataset-scheduled DAG listing its inputs
pub fn dataset_schedule<I>(datasets: I, mode: DatasetMode) -> ScheduleDescriptor
where
    I: IntoIterator<Item = Dataset>,
{
    ScheduleDescriptor::datasets(datasets.into_iter().map(|d| d.id), mode)
}
