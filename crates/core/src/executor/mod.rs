//! Drives one DAG run from `queued` to a terminal state.
//!
//! Each run has a single loop that owns its [`RunRecord`]: it evaluates
//! readiness, dispatches attempts onto tokio tasks, and applies their
//! completions as they arrive over a channel. Every transition is persisted
//! before anything that depends on it happens, so a restarted process can
//! resume from the store.

pub mod context;

pub use context::{TaskContext, RETURN_VALUE_KEY};

use crate::dag::{DagDefinition, PokeOutcome, TaskDefinition, TaskOperator, TaskOutput};
use crate::error::{Result, TaskFailure};
use crate::events::{Event, EventLog, EventType};
use crate::notify::{RunCallback, RunNotification};
use crate::storage::{persist_with_retry, PersistRetry, RunStateStore};
use crate::types::{
    AttemptOutcome, DagRun, DagRunState, DatasetEvent, DatasetSource, RunRecord, SensorPhase,
    SensorProgress, TaskAttempt, TaskId, TaskInstance, TaskState, XComStore,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on how long the loop sleeps with nothing scheduled
const IDLE_WAKEUP: Duration = Duration::from_secs(30);

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

enum AttemptResult {
    Output(TaskOutput),
    Poked(PokeOutcome),
    Failure(TaskFailure),
    TimedOut(Duration),
    Cancelled,
}

struct Completion {
    task_id: TaskId,
    try_number: u32,
    result: AttemptResult,
    pushed: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy)]
enum AbortReason {
    Cancelled,
    TimedOut(Duration),
}

/// Executes DAG runs against a run state store
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn RunStateStore>,
    event_log: Arc<dyn EventLog>,
    datasets: mpsc::UnboundedSender<DatasetEvent>,
    persist_retry: PersistRetry,
    shutdown: CancellationToken,
}

impl Executor {
    /// `datasets` receives an event for every outlet of a successful task.
    /// Cancelling `shutdown` stops all runs without finalizing them.
    pub fn new(
        store: Arc<dyn RunStateStore>,
        event_log: Arc<dyn EventLog>,
        datasets: mpsc::UnboundedSender<DatasetEvent>,
        persist_retry: PersistRetry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            event_log,
            datasets,
            persist_retry,
            shutdown,
        }
    }

    /// Drive a run until it is terminal and its notification delivered.
    ///
    /// Queued runs are started, running ones resumed (interrupted attempts
    /// are discarded), terminal ones only get their pending notification.
    /// Returns early, leaving the run in the store as is, on shutdown.
    pub async fn execute(
        &self,
        dag: Arc<DagDefinition>,
        record: RunRecord,
        cancel: CancellationToken,
    ) -> Result<RunRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut run = RunLoop {
            exec: self,
            dag,
            record,
            cancel,
            tasks: self.shutdown.child_token(),
            in_flight: HashSet::new(),
            tx,
            rx,
            dirty: false,
            events: Vec::new(),
            outlets: Vec::new(),
        };

        let result = run.drive().await;
        run.tasks.cancel();
        if let Err(e) = &result {
            tracing::error!("DAG run {} stopped: {}", run.record.run.id, e);
        }
        result.map(|()| run.record)
    }

    async fn emit(&self, run: &DagRun, event_type: EventType) {
        let event = Event::new(run.id, run.dag_id.clone(), event_type);
        if let Err(e) = self.event_log.append(event).await {
            tracing::warn!("Failed to append event for run {}: {:#}", run.id, e);
        }
    }
}

struct RunLoop<'a> {
    exec: &'a Executor,
    dag: Arc<DagDefinition>,
    record: RunRecord,
    /// Manual cancellation of this run
    cancel: CancellationToken,
    /// Parent of every attempt's token
    tasks: CancellationToken,
    in_flight: HashSet<TaskId>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
    /// In-memory changes not yet persisted
    dirty: bool,
    /// Emitted once the changes they describe are durable
    events: Vec<EventType>,
    outlets: Vec<DatasetEvent>,
}

impl RunLoop<'_> {
    async fn drive(&mut self) -> Result<()> {
        if self.record.run.state.is_terminal() {
            if !self.record.run.callback_delivered {
                self.deliver_notification().await?;
            }
            return Ok(());
        }

        // A run cancelled while queued never starts
        if self.record.run.state == DagRunState::Queued && self.cancel.is_cancelled() {
            return self.abort(AbortReason::Cancelled).await;
        }

        let now = Utc::now();
        if self.record.run.state == DagRunState::Queued {
            self.record.run.state = DagRunState::Running;
            self.record.run.start_date = Some(now);
            self.events.push(EventType::RunStarted);
            tracing::info!(
                "Starting DAG run: dag_id={}, run_id={}, logical_date={}",
                self.record.run.dag_id,
                self.record.run.id,
                self.record.run.logical_date
            );
        } else {
            self.recover_interrupted(now);
            self.events.push(EventType::RunResumed);
            tracing::info!(
                "Resuming DAG run: dag_id={}, run_id={}",
                self.record.run.dag_id,
                self.record.run.id
            );
        }
        self.dirty = true;
        self.checkpoint().await?;

        loop {
            if self.cancel.is_cancelled() {
                return self.abort(AbortReason::Cancelled).await;
            }
            if self.exec.shutdown.is_cancelled() {
                tracing::info!(
                    "Shutdown requested, leaving run {} for recovery",
                    self.record.run.id
                );
                return Ok(());
            }

            let now = Utc::now();
            if let Some(timeout) = self.dag.dagrun_timeout() {
                if self.deadline().is_some_and(|d| now >= d) {
                    return self.abort(AbortReason::TimedOut(timeout)).await;
                }
            }

            self.advance(now);
            self.dispatch_ready(now).await?;

            if self.is_complete() {
                return self.finish(Utc::now()).await;
            }

            let sleep_for = self
                .next_wakeup()
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_WAKEUP)
                .min(IDLE_WAKEUP);

            tokio::select! {
                Some(completion) = self.rx.recv() => {
                    self.apply_completion(completion, Utc::now());
                    while let Ok(completion) = self.rx.try_recv() {
                        self.apply_completion(completion, Utc::now());
                    }
                    self.checkpoint().await?;
                }
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.cancel.cancelled() => {}
                _ = self.exec.shutdown.cancelled() => {}
            }
        }
    }

    fn deadline(&self) -> Option<DateTime<Utc>> {
        let timeout = self.dag.dagrun_timeout()?;
        let start = self.record.run.start_date?;
        Some(start + to_chrono(timeout))
    }

    fn capacity(&self) -> usize {
        self.dag
            .max_active_tasks()
            .map_or(usize::MAX, |max| max.saturating_sub(self.in_flight.len()))
    }

    fn is_complete(&self) -> bool {
        self.in_flight.is_empty()
            && self
                .record
                .task_instances
                .values()
                .all(|ti| ti.state.is_terminal())
    }

    /// Earliest retry, sensor poke or run deadline
    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        let can_poke = self.capacity() > 0;
        let retries = self
            .record
            .task_instances
            .values()
            .filter(|ti| ti.state == TaskState::UpForRetry)
            .filter_map(|ti| ti.next_retry_at);
        let pokes = self
            .record
            .task_instances
            .values()
            .filter(|ti| can_poke && !self.in_flight.contains(&ti.task_id))
            .filter_map(|ti| ti.sensor.as_ref())
            .filter(|s| s.phase == SensorPhase::Waiting)
            .filter_map(|s| s.next_poke_at);

        retries.chain(pokes).chain(self.deadline()).min()
    }

    /// Persisted instances caught mid-attempt by a crash go back to the queue
    fn recover_interrupted(&mut self, now: DateTime<Utc>) {
        for ti in self.record.task_instances.values_mut() {
            let waiting_sensor = ti.state == TaskState::Running
                && ti
                    .sensor
                    .as_ref()
                    .is_some_and(|s| matches!(s.phase, SensorPhase::Polling | SensorPhase::Waiting));

            if waiting_sensor {
                if let Some(progress) = ti.sensor.as_mut() {
                    if progress.phase == SensorPhase::Polling || progress.next_poke_at.is_none() {
                        progress.next_poke_at = Some(now);
                    }
                    progress.phase = SensorPhase::Waiting;
                }
                continue;
            }

            if ti.state.is_in_flight() {
                if ti.attempts.last().is_some_and(|a| a.ended_at.is_none()) {
                    ti.attempts.pop();
                    ti.try_number = ti.try_number.saturating_sub(1);
                }
                ti.state = TaskState::Scheduled;
                ti.sensor = None;
                tracing::warn!(
                    "Discarding interrupted attempt of task {} in run {}",
                    ti.task_id,
                    self.record.run.id
                );
                self.events.push(EventType::TaskScheduled {
                    task_id: ti.task_id.clone(),
                });
            }
        }
    }

    /// Promote due retries and propagate upstream failures
    fn advance(&mut self, now: DateTime<Utc>) {
        for ti in self.record.task_instances.values_mut() {
            if ti.state == TaskState::UpForRetry && ti.next_retry_at.map_or(true, |at| at <= now) {
                ti.state = TaskState::Scheduled;
                ti.next_retry_at = None;
                self.dirty = true;
                self.events.push(EventType::TaskScheduled {
                    task_id: ti.task_id.clone(),
                });
            }
        }

        // Topological order makes the propagation transitive in one pass
        let dag = Arc::clone(&self.dag);
        for task_id in dag.topological_order() {
            let pending = self
                .record
                .task_instances
                .get(task_id)
                .is_some_and(|ti| matches!(ti.state, TaskState::None | TaskState::Scheduled));
            if !pending {
                continue;
            }

            let blocked = dag.graph().upstream(task_id).any(|up| {
                self.record
                    .task_instances
                    .get(up)
                    .is_some_and(|u| u.state.blocks_downstream())
            });
            if blocked {
                if let Some(ti) = self.record.task_instances.get_mut(task_id) {
                    ti.state = TaskState::UpstreamFailed;
                }
                self.dirty = true;
                self.events.push(EventType::TaskUpstreamFailed {
                    task_id: task_id.clone(),
                });
                tracing::info!(
                    "Task {} in run {} marked upstream_failed",
                    task_id,
                    self.record.run.id
                );
            }
        }
    }

    async fn dispatch_ready(&mut self, now: DateTime<Utc>) -> Result<()> {
        let dag = Arc::clone(&self.dag);
        let states = self.record.task_states();
        let ready: Vec<TaskId> = dag.graph().ready_tasks(&states).cloned().collect();

        let mut capacity = self.capacity();
        let mut batch = Vec::new();

        for task_id in ready {
            let Some(ti) = self.record.task_instances.get_mut(&task_id) else {
                continue;
            };
            if ti.state == TaskState::None {
                ti.state = TaskState::Scheduled;
                self.dirty = true;
                self.events.push(EventType::TaskScheduled {
                    task_id: task_id.clone(),
                });
            }
            if capacity == 0 {
                continue;
            }

            ti.state = TaskState::Queued;
            ti.try_number += 1;
            ti.attempts.push(TaskAttempt {
                try_number: ti.try_number,
                started_at: now,
                ended_at: None,
                outcome: None,
                error: None,
            });
            if ti.try_number > 1 {
                self.record.xcom.remove(&task_id);
            }
            self.events.push(EventType::TaskQueued {
                task_id: task_id.clone(),
                try_number: ti.try_number,
            });
            batch.push(task_id);
            capacity -= 1;
        }

        for ti in self.record.task_instances.values_mut() {
            if capacity == 0 {
                break;
            }
            if ti.state != TaskState::Running || self.in_flight.contains(&ti.task_id) {
                continue;
            }
            let Some(progress) = ti.sensor.as_mut() else {
                continue;
            };
            if progress.phase == SensorPhase::Waiting
                && progress.next_poke_at.map_or(true, |at| at <= now)
            {
                progress.phase = SensorPhase::Polling;
                progress.next_poke_at = None;
                batch.push(ti.task_id.clone());
                capacity -= 1;
            }
        }

        if batch.is_empty() {
            return self.checkpoint().await;
        }

        // Queued state is durable before any attempt starts
        self.dirty = true;
        self.checkpoint().await?;

        let xcom: Arc<XComStore> = Arc::new(self.record.xcom.clone());
        for task_id in batch {
            let (Some(task), Some(ti)) = (
                dag.task(&task_id),
                self.record.task_instances.get_mut(&task_id),
            ) else {
                continue;
            };

            if ti.state == TaskState::Queued {
                ti.state = TaskState::Running;
                if task.operator.is_sensor() {
                    ti.sensor = Some(SensorProgress {
                        phase: SensorPhase::Polling,
                        first_poke_at: now,
                        pokes: 0,
                        next_poke_at: None,
                    });
                }
                self.events.push(EventType::TaskStarted {
                    task_id: task_id.clone(),
                    try_number: ti.try_number,
                });
                tracing::info!(
                    "Starting task {} (try {}/{}) for run {}",
                    task_id,
                    ti.try_number,
                    ti.max_tries,
                    self.record.run.id
                );
            }

            let ctx = TaskContext::new(
                self.record.run.dag_id.clone(),
                self.record.run.id,
                task_id.clone(),
                self.record.run.logical_date,
                ti.try_number,
                self.record.run.run_type,
                self.record.run.conf.clone(),
                Arc::clone(&xcom),
                self.tasks.child_token(),
            );
            spawn_attempt(task, ctx, self.tx.clone());
            self.in_flight.insert(task_id);
        }

        self.dirty = true;
        self.checkpoint().await
    }

    fn apply_completion(&mut self, completion: Completion, now: DateTime<Utc>) {
        let Completion {
            task_id,
            try_number,
            result,
            pushed,
        } = completion;
        self.in_flight.remove(&task_id);

        let dag = Arc::clone(&self.dag);
        let (Some(task), Some(ti)) = (
            dag.task(&task_id),
            self.record.task_instances.get_mut(&task_id),
        ) else {
            return;
        };
        if ti.state != TaskState::Running || ti.try_number != try_number {
            tracing::debug!("Ignoring stale completion of task {}", task_id);
            return;
        }

        let output = match result {
            AttemptResult::Output(output) => Some(output),
            AttemptResult::Poked(poke) if poke.is_done => {
                if let Some(progress) = ti.sensor.as_mut() {
                    progress.phase = SensorPhase::Satisfied;
                    progress.pokes += 1;
                }
                Some(poke.xcom_value)
            }
            AttemptResult::Poked(_) => {
                self.dirty = true;
                let event = reschedule_sensor(ti, task, now);
                self.events.push(event);
                return;
            }
            AttemptResult::Failure(TaskFailure::Skip(reason)) => {
                ti.finish_attempt(now, AttemptOutcome::Skipped, Some(reason.clone()));
                ti.state = TaskState::Skipped;
                tracing::info!("Task {} in run {} skipped: {}", task_id, self.record.run.id, reason);
                self.events.push(EventType::TaskSkipped { task_id, reason });
                self.dirty = true;
                return;
            }
            AttemptResult::Failure(TaskFailure::Failed(error)) => {
                let event = fail_or_retry(ti, task, now, AttemptOutcome::Failed, error, true);
                self.events.push(event);
                self.dirty = true;
                return;
            }
            AttemptResult::Failure(TaskFailure::Fatal(error)) => {
                let event = fail_or_retry(ti, task, now, AttemptOutcome::Failed, error, false);
                self.events.push(event);
                self.dirty = true;
                return;
            }
            AttemptResult::TimedOut(limit) => {
                let error = format!("Task exceeded execution_timeout of {:?}", limit);
                let event = fail_or_retry(ti, task, now, AttemptOutcome::TimedOut, error, true);
                self.events.push(event);
                self.dirty = true;
                return;
            }
            // Only seen when the run itself is being torn down
            AttemptResult::Cancelled => return,
        };

        ti.finish_attempt(now, AttemptOutcome::Success, None);
        ti.state = TaskState::Success;
        self.events.push(EventType::TaskSucceeded {
            task_id: task_id.clone(),
            try_number,
        });
        tracing::info!(
            "Task {} succeeded (try {}) for run {}",
            task_id,
            try_number,
            self.record.run.id
        );

        let mut values = pushed;
        if let Some(Some(value)) = output {
            values.insert(RETURN_VALUE_KEY.to_string(), value);
        }
        if !values.is_empty() {
            self.record
                .xcom
                .entry(task_id.clone())
                .or_default()
                .extend(values);
        }

        for outlet in &task.outlets {
            self.outlets.push(DatasetEvent {
                dataset: outlet.id.clone(),
                timestamp: now,
                source: Some(DatasetSource {
                    dag_id: self.record.run.dag_id.clone(),
                    run_id: self.record.run.id,
                    task_id: task_id.clone(),
                }),
            });
            self.events.push(EventType::DatasetUpdated {
                dataset: outlet.id.clone(),
                task_id: task_id.clone(),
            });
        }
        self.dirty = true;
    }

    async fn abort(&mut self, reason: AbortReason) -> Result<()> {
        self.tasks.cancel();
        self.in_flight.clear();
        let now = Utc::now();

        let (state, note) = match reason {
            AbortReason::Cancelled => (DagRunState::Failed, "Run cancelled".to_string()),
            AbortReason::TimedOut(timeout) => (
                DagRunState::TimedOut,
                format!("Run exceeded dagrun_timeout of {:?}", timeout),
            ),
        };
        tracing::warn!("Aborting run {}: {}", self.record.run.id, note);

        for ti in self.record.task_instances.values_mut() {
            match ti.state {
                TaskState::Queued | TaskState::Running => {
                    ti.finish_attempt(now, AttemptOutcome::Cancelled, Some(note.clone()));
                    ti.state = TaskState::Failed;
                    if let Some(progress) = ti.sensor.as_mut() {
                        progress.next_poke_at = None;
                    }
                    self.events.push(EventType::TaskFailed {
                        task_id: ti.task_id.clone(),
                        try_number: ti.try_number,
                        error: note.clone(),
                        will_retry: false,
                    });
                }
                TaskState::None | TaskState::Scheduled | TaskState::UpForRetry => {
                    ti.state = TaskState::Skipped;
                    ti.next_retry_at = None;
                    self.events.push(EventType::TaskSkipped {
                        task_id: ti.task_id.clone(),
                        reason: note.clone(),
                    });
                }
                _ => {}
            }
        }

        self.record.run.note = Some(note);
        self.finish_with(state, now).await
    }

    async fn finish(&mut self, now: DateTime<Utc>) -> Result<()> {
        let failed: Vec<String> = self
            .record
            .task_instances
            .values()
            .filter(|ti| !ti.state.satisfies_downstream())
            .map(|ti| ti.task_id.to_string())
            .collect();

        if failed.is_empty() {
            self.finish_with(DagRunState::Success, now).await
        } else {
            self.record.run.note = Some(format!("Unsuccessful tasks: {}", failed.join(", ")));
            self.finish_with(DagRunState::Failed, now).await
        }
    }

    async fn finish_with(&mut self, state: DagRunState, now: DateTime<Utc>) -> Result<()> {
        self.record.run.state = state;
        self.record.run.end_date = Some(now);

        let has_callback = self.callback().is_some();
        if !has_callback {
            self.record.run.callback_delivered = true;
        }

        let duration_secs = self
            .record
            .run
            .start_date
            .map_or(0, |start| (now - start).num_seconds());
        self.events.push(EventType::RunFinished {
            state,
            duration_secs,
        });
        self.dirty = true;
        self.checkpoint().await?;

        tracing::info!(
            "DAG run finished: dag_id={}, run_id={}, state={}",
            self.record.run.dag_id,
            self.record.run.id,
            state
        );

        if has_callback {
            self.deliver_notification().await?;
        }
        Ok(())
    }

    fn callback(&self) -> Option<Arc<dyn RunCallback>> {
        match self.record.run.state {
            DagRunState::Success => self.dag.on_success().cloned(),
            _ => self.dag.on_failure().cloned(),
        }
    }

    /// Deliver the terminal notification, then record that it went out. A
    /// crash between the two repeats the delivery on recovery.
    async fn deliver_notification(&mut self) -> Result<()> {
        if let Some(callback) = self.callback() {
            let notification = RunNotification::for_run(&self.record);
            callback.notify(&notification).await;
        }
        self.record.run.callback_delivered = true;
        self.dirty = true;
        self.checkpoint().await
    }

    /// Persist pending changes, then emit the events and dataset updates
    /// that describe them
    async fn checkpoint(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        self.record.version = persist_with_retry(
            self.exec.store.as_ref(),
            &self.record,
            &self.exec.persist_retry,
        )
        .await?;
        self.dirty = false;

        for event_type in std::mem::take(&mut self.events) {
            self.exec.emit(&self.record.run, event_type).await;
        }
        for event in std::mem::take(&mut self.outlets) {
            if self.exec.datasets.send(event).is_err() {
                tracing::debug!("Dataset channel closed, dropping outlet update");
            }
        }
        Ok(())
    }
}

/// Close a failed attempt; schedule a retry while tries remain
fn fail_or_retry(
    ti: &mut TaskInstance,
    task: &TaskDefinition,
    now: DateTime<Utc>,
    outcome: AttemptOutcome,
    error: String,
    retryable: bool,
) -> EventType {
    ti.finish_attempt(now, outcome, Some(error.clone()));
    let will_retry = retryable && ti.try_number < ti.max_tries;

    if will_retry {
        let delay = task.retry_delay_for(ti.try_number);
        ti.state = TaskState::UpForRetry;
        ti.next_retry_at = Some(now + to_chrono(delay));
        ti.sensor = None;
        tracing::warn!(
            "Task {} failed (try {}/{}), retrying in {:?}: {}",
            ti.task_id,
            ti.try_number,
            ti.max_tries,
            delay,
            error
        );
    } else {
        ti.state = TaskState::Failed;
        tracing::warn!(
            "Task {} failed (try {}/{}): {}",
            ti.task_id,
            ti.try_number,
            ti.max_tries,
            error
        );
    }

    EventType::TaskFailed {
        task_id: ti.task_id.clone(),
        try_number: ti.try_number,
        error,
        will_retry,
    }
}

/// Handle a poke whose condition does not hold yet
fn reschedule_sensor(ti: &mut TaskInstance, task: &TaskDefinition, now: DateTime<Utc>) -> EventType {
    let (poke_interval, timeout) = match &task.operator {
        TaskOperator::Sensor {
            poke_interval,
            timeout,
            ..
        } => (*poke_interval, *timeout),
        TaskOperator::Callable(_) => (Duration::ZERO, Duration::ZERO),
    };

    let progress = ti.sensor.get_or_insert(SensorProgress {
        phase: SensorPhase::Polling,
        first_poke_at: now,
        pokes: 0,
        next_poke_at: None,
    });
    progress.pokes += 1;

    if now - progress.first_poke_at >= to_chrono(timeout) {
        progress.phase = SensorPhase::TimedOut;
        progress.next_poke_at = None;
        let error = format!(
            "Sensor timed out after {:?} ({} pokes)",
            timeout, progress.pokes
        );
        return fail_or_retry(ti, task, now, AttemptOutcome::TimedOut, error, false);
    }

    let next_poke_at = now + to_chrono(poke_interval);
    progress.phase = SensorPhase::Waiting;
    progress.next_poke_at = Some(next_poke_at);
    tracing::debug!(
        "Sensor {} not satisfied after {} pokes, next poke at {}",
        ti.task_id,
        progress.pokes,
        next_poke_at
    );

    EventType::SensorRescheduled {
        task_id: ti.task_id.clone(),
        pokes: progress.pokes,
        next_poke_at,
    }
}

fn spawn_attempt(task: &TaskDefinition, ctx: TaskContext, tx: mpsc::UnboundedSender<Completion>) {
    let operator = task.operator.clone();
    let execution_timeout = task.execution_timeout;

    tokio::spawn(async move {
        let token = ctx.cancellation().clone();
        let work_ctx = ctx.clone();
        let mut handle = tokio::spawn(async move {
            match operator {
                TaskOperator::Callable(callable) => match callable.run(work_ctx).await {
                    Ok(output) => AttemptResult::Output(output),
                    Err(failure) => AttemptResult::Failure(failure),
                },
                TaskOperator::Sensor { sensor, .. } => match sensor.poke(work_ctx).await {
                    Ok(poke) => AttemptResult::Poked(poke),
                    Err(failure) => AttemptResult::Failure(failure),
                },
            }
        });
        let abort = handle.abort_handle();

        let result = tokio::select! {
            _ = token.cancelled() => {
                abort.abort();
                AttemptResult::Cancelled
            }
            result = join_attempt(&mut handle, execution_timeout) => result,
        };
        if matches!(result, AttemptResult::TimedOut(_)) {
            token.cancel();
        }

        let completion = Completion {
            task_id: ctx.task_id.clone(),
            try_number: ctx.try_number,
            result,
            pushed: ctx.take_pushed(),
        };
        if tx.send(completion).is_err() {
            tracing::debug!("Run loop gone, dropping completion of {}", ctx.task_id);
        }
    });
}

async fn join_attempt(
    handle: &mut JoinHandle<AttemptResult>,
    limit: Option<Duration>,
) -> AttemptResult {
    let joined = match limit {
        Some(limit) => match tokio::time::timeout(limit, &mut *handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return AttemptResult::TimedOut(limit);
            }
        },
        None => (&mut *handle).await,
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => AttemptResult::Failure(TaskFailure::failed("Task panicked")),
        Err(_) => AttemptResult::Cancelled,
    }
}
