//! The scheduler context object: owns registered DAGs, the trigger registry
//! and the executor, and exposes the administrative surface.
//!
//! Runs are executed on their own tokio tasks. The orchestrator tracks them
//! in memory; everything else lives in the run state store.

use crate::dag::DagDefinition;
use crate::error::{OrchestratorError, Result, StoreError};
use crate::events::{Event, EventLog, EventType};
use crate::executor::Executor;
use crate::notify::RunNotification;
use crate::schedule::ScheduleDescriptor;
use crate::scheduler::{DagRunHistory, RunPlan, RunScheduler};
use crate::storage::{persist_with_retry, PersistRetry, RunStateStore};
use crate::triggers::TriggerRegistry;
use crate::types::{
    DagId, DagRun, DagRunState, DagState, DatasetEvent, RunId, RunRecord, RunType, TaskInstance,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often `wait_for_run` re-reads the store
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Interval of the scheduling loop in [`Orchestrator::run`]
    pub tick_interval: Duration,
    pub persist_retry: PersistRetry,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            persist_retry: PersistRetry::default(),
        }
    }
}

struct ActiveRun {
    dag_id: DagId,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

pub struct Orchestrator {
    store: Arc<dyn RunStateStore>,
    event_log: Arc<dyn EventLog>,
    executor: Executor,
    scheduler: RunScheduler,
    settings: OrchestratorSettings,
    dags: RwLock<BTreeMap<DagId, Arc<DagDefinition>>>,
    triggers: Mutex<TriggerRegistry>,
    active: Arc<Mutex<HashMap<RunId, ActiveRun>>>,
    /// Outlet updates published by task instances
    dataset_rx: Mutex<mpsc::UnboundedReceiver<DatasetEvent>>,
    /// DAGs whose runs just ended and may have room again
    finished_tx: mpsc::UnboundedSender<DagId>,
    finished_rx: Mutex<mpsc::UnboundedReceiver<DagId>>,
    /// Serializes run creation
    evaluation: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RunStateStore>,
        event_log: Arc<dyn EventLog>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (dataset_tx, dataset_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let executor = Executor::new(
            Arc::clone(&store),
            Arc::clone(&event_log),
            dataset_tx,
            settings.persist_retry,
            shutdown.clone(),
        );

        Self {
            store,
            event_log,
            executor,
            scheduler: RunScheduler::new(),
            settings,
            dags: RwLock::new(BTreeMap::new()),
            triggers: Mutex::new(TriggerRegistry::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            dataset_rx: Mutex::new(dataset_rx),
            finished_tx,
            finished_rx: Mutex::new(finished_rx),
            evaluation: tokio::sync::Mutex::new(()),
            shutdown,
        }
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.event_log
    }

    /// Register a validated DAG and start tracking its schedule
    pub fn register_dag(&self, dag: DagDefinition) -> Result<()> {
        let mut dags = self.dags.write().unwrap();
        if dags.contains_key(dag.id()) {
            return Err(OrchestratorError::DuplicateDag(dag.id().clone()));
        }

        self.triggers.lock().unwrap().register(&dag);
        tracing::info!(
            "Registered DAG {} ({} tasks, schedule {})",
            dag.id(),
            dag.topological_order().len(),
            dag.schedule()
        );
        dags.insert(dag.id().clone(), Arc::new(dag));
        Ok(())
    }

    pub fn dags(&self) -> Vec<Arc<DagDefinition>> {
        self.dags.read().unwrap().values().cloned().collect()
    }

    pub fn dag(&self, dag_id: &DagId) -> Result<Arc<DagDefinition>> {
        self.dags
            .read()
            .unwrap()
            .get(dag_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownDag(dag_id.clone()))
    }

    pub fn dag_state(&self, dag_id: &DagId) -> Result<DagState> {
        Ok(self.store.dag_state(dag_id)?)
    }

    /// Bookkeeping of every DAG the store has seen, registered or not
    pub fn dag_states(&self) -> Result<Vec<DagState>> {
        Ok(self.store.list_dag_states()?)
    }

    /// Resume runs left incomplete by a previous process.
    ///
    /// Running runs restart their loop; terminal runs with a pending
    /// notification get it delivered; queued ones wait for a free slot.
    pub async fn recover(&self) -> Result<usize> {
        let _guard = self.evaluation.lock().await;
        let incomplete = self.store.load_incomplete()?;
        let mut resumed = 0;

        for record in incomplete {
            let dag = match self.dag(&record.run.dag_id) {
                Ok(dag) => dag,
                Err(_) => {
                    tracing::warn!(
                        "Skipping recovery of run {}: DAG {} is not registered",
                        record.run.id,
                        record.run.dag_id
                    );
                    continue;
                }
            };
            if record.run.state == DagRunState::Queued || self.is_active(&record.run.id) {
                continue;
            }

            tracing::info!(
                "Recovering run {} of DAG {} in state {}",
                record.run.id,
                record.run.dag_id,
                record.run.state
            );
            self.spawn_run(dag, record, CancellationToken::new());
            resumed += 1;
        }

        let dag_ids: Vec<DagId> = self.dags.read().unwrap().keys().cloned().collect();
        for dag_id in dag_ids {
            resumed += self.start_waiting_runs(&dag_id)?.len();
        }

        Ok(resumed)
    }

    /// Create a manual run. It bypasses failure suppression and starts as
    /// soon as `max_active_runs` leaves room.
    pub async fn trigger_run(&self, dag_id: &DagId, conf: serde_json::Value) -> Result<RunId> {
        let dag = self.dag(dag_id)?;
        let _guard = self.evaluation.lock().await;

        let dag_state = self.store.dag_state(dag_id)?;
        let now = Utc::now();
        let record = self
            .create_run(
                &dag,
                RunType::Manual,
                RunPlan {
                    logical_date: now,
                    data_interval: None,
                },
                Vec::new(),
                conf,
                dag_state.consecutive_failed_runs,
            )
            .await?;
        let run_id = record.run.id;

        self.start_waiting_runs(dag_id)?;
        Ok(run_id)
    }

    /// Start a DAG's queued runs that now fit under `max_active_runs`
    pub async fn start_queued_runs(&self, dag_id: &DagId) -> Result<Vec<RunId>> {
        let _guard = self.evaluation.lock().await;
        self.start_waiting_runs(dag_id)
    }

    /// Evaluate every DAG due at `now`, returning the runs created
    pub async fn on_time_tick(&self, now: DateTime<Utc>) -> Result<Vec<RunId>> {
        let _guard = self.evaluation.lock().await;
        self.process_time_tick(now).await
    }

    /// Feed an external dataset update, returning the runs created
    pub async fn on_dataset_updated(&self, event: DatasetEvent) -> Result<Vec<RunId>> {
        let _guard = self.evaluation.lock().await;
        self.process_dataset_event(&event, Utc::now()).await
    }

    /// One scheduling pass: absorb finished runs and outlet updates, start
    /// waiting runs, then evaluate time-based schedules
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<RunId>> {
        let _guard = self.evaluation.lock().await;

        let finished: Vec<DagId> = {
            let mut rx = self.finished_rx.lock().unwrap();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        {
            let mut triggers = self.triggers.lock().unwrap();
            for dag_id in &finished {
                triggers.request_evaluation(dag_id);
            }
        }

        let updates: Vec<DatasetEvent> = {
            let mut rx = self.dataset_rx.lock().unwrap();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };

        let mut created = Vec::new();
        for event in &updates {
            created.extend(self.process_dataset_event(event, now).await?);
        }

        let dag_ids: Vec<DagId> = self.dags.read().unwrap().keys().cloned().collect();
        for dag_id in &dag_ids {
            created.extend(self.start_waiting_runs(dag_id)?);
        }

        created.extend(self.process_time_tick(now).await?);
        Ok(created)
    }

    /// Scheduling loop until `shutdown` is cancelled, then a clean shutdown
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            "Orchestrator started: {} DAGs, tick every {:?}",
            self.dags.read().unwrap().len(),
            self.settings.tick_interval
        );

        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::error!("Error in scheduler tick: {}", e);
                    }
                }
            }
        }

        self.shutdown().await
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<RunRecord> {
        self.store
            .load(run_id)?
            .ok_or(OrchestratorError::UnknownRun(*run_id))
    }

    pub fn task_instances(&self, run_id: &RunId) -> Result<Vec<TaskInstance>> {
        Ok(self.get_run(run_id)?.task_instances.into_values().collect())
    }

    pub fn list_runs(&self, dag_id: Option<&DagId>) -> Result<Vec<DagRun>> {
        Ok(self.store.list_runs(dag_id)?)
    }

    /// Cancel a queued or running run; it ends `failed`
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        if self.get_run(run_id)?.run.state.is_terminal() {
            return Err(OrchestratorError::RunNotActive(*run_id));
        }
        if let Some(active) = self.active.lock().unwrap().get(run_id) {
            tracing::info!("Cancellation requested for run {}", run_id);
            active.cancel.cancel();
            return Ok(());
        }

        let _guard = self.evaluation.lock().await;
        let record = self.get_run(run_id)?;
        if record.run.state != DagRunState::Queued || self.is_active(run_id) {
            return Err(OrchestratorError::RunNotActive(*run_id));
        }

        // A waiting run is finalized by the executor with a pre-cancelled token
        let dag = self.dag(&record.run.dag_id)?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        tracing::info!("Cancelling queued run {}", run_id);
        self.spawn_run(dag, record, cancel);
        Ok(())
    }

    /// Clear a DAG's consecutive failure counter so scheduling resumes
    pub fn reset_failures(&self, dag_id: &DagId) -> Result<DagState> {
        self.dag(dag_id)?;
        let state = self.store.update_dag_state(dag_id, &mut |state| {
            state.consecutive_failed_runs = 0;
            state.suppression_notified = false;
        })?;
        self.triggers.lock().unwrap().request_evaluation(dag_id);
        tracing::info!("Reset consecutive failures of DAG {}", dag_id);
        Ok(state)
    }

    /// Wait until a run is terminal and its notification went out
    pub async fn wait_for_run(&self, run_id: &RunId, timeout: Duration) -> Result<RunRecord> {
        tokio::time::timeout(timeout, self.poll_until_finished(run_id))
            .await
            .map_err(|_| OrchestratorError::Timeout(timeout))?
    }

    /// Stop all run loops, leaving unfinished runs for recovery, and flush
    /// the event log and store
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .active
            .lock()
            .unwrap()
            .values_mut()
            .filter_map(|run| run.handle.take())
            .collect();
        tracing::info!("Shutting down, waiting for {} run loops", handles.len());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Run loop ended abnormally: {}", e);
            }
        }

        self.event_log
            .flush_all()
            .await
            .map_err(|e| OrchestratorError::Store(StoreError::Backend(e)))?;
        self.store.flush()?;
        Ok(())
    }

    async fn poll_until_finished(&self, run_id: &RunId) -> Result<RunRecord> {
        loop {
            let record = self.get_run(run_id)?;
            if record.run.state.is_terminal() && record.run.callback_delivered {
                return Ok(record);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    fn is_active(&self, run_id: &RunId) -> bool {
        self.active.lock().unwrap().contains_key(run_id)
    }

    fn active_count(&self, dag_id: &DagId) -> usize {
        self.active
            .lock()
            .unwrap()
            .values()
            .filter(|run| &run.dag_id == dag_id)
            .count()
    }

    /// Queued runs without a run loop, oldest first
    fn waiting_runs(&self, dag_id: &DagId) -> Result<Vec<DagRun>> {
        let active = self.active.lock().unwrap();
        let mut waiting: Vec<DagRun> = self
            .store
            .list_runs(Some(dag_id))?
            .into_iter()
            .filter(|run| run.state == DagRunState::Queued && !active.contains_key(&run.id))
            .collect();
        waiting.sort_by_key(|run| run.queued_at);
        Ok(waiting)
    }

    fn history(&self, dag_id: &DagId) -> Result<DagRunHistory> {
        let dag_state = self.store.dag_state(dag_id)?;
        let active_runs = self.active_count(dag_id) + self.waiting_runs(dag_id)?.len();
        Ok(DagRunHistory {
            active_runs: u32::try_from(active_runs).unwrap_or(u32::MAX),
            consecutive_failed_runs: dag_state.consecutive_failed_runs,
            last_scheduled_logical_date: dag_state.last_scheduled_logical_date,
        })
    }

    /// Start waiting runs while `max_active_runs` leaves room
    fn start_waiting_runs(&self, dag_id: &DagId) -> Result<Vec<RunId>> {
        let dag = self.dag(dag_id)?;
        let running = self.active_count(dag_id);
        let slots = (dag.max_active_runs() as usize).saturating_sub(running);
        if slots == 0 {
            return Ok(Vec::new());
        }

        let mut started = Vec::new();
        for run in self.waiting_runs(dag_id)?.into_iter().take(slots) {
            let Some(record) = self.store.load(&run.id)? else {
                continue;
            };
            self.spawn_run(Arc::clone(&dag), record, CancellationToken::new());
            started.push(run.id);
        }
        Ok(started)
    }

    async fn process_time_tick(&self, now: DateTime<Utc>) -> Result<Vec<RunId>> {
        let eligible = self.triggers.lock().unwrap().on_time_tick(now);
        let mut created = Vec::new();
        for dag_id in eligible {
            created.extend(self.evaluate_dag(&dag_id, now).await?);
        }
        Ok(created)
    }

    async fn process_dataset_event(
        &self,
        event: &DatasetEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<RunId>> {
        tracing::info!("Dataset {} updated", event.dataset);
        let eligible = self.triggers.lock().unwrap().on_dataset_updated(event);
        let mut created = Vec::new();
        for dag_id in eligible {
            created.extend(self.evaluate_dag(&dag_id, now).await?);
        }
        Ok(created)
    }

    /// Materialize whatever runs a DAG's schedule asks for at `now`
    async fn evaluate_dag(&self, dag_id: &DagId, now: DateTime<Utc>) -> Result<Vec<RunId>> {
        let dag = self.dag(dag_id)?;
        let history = self.history(dag_id)?;

        let plans: Vec<(RunType, RunPlan, Vec<DatasetEvent>)> = match dag.schedule() {
            ScheduleDescriptor::Datasets(_) => {
                let slots = match self.scheduler.admission(&dag, &history) {
                    Ok(slots) => slots,
                    Err(OrchestratorError::RunSuppressed {
                        consecutive_failed,
                        limit,
                        ..
                    }) => {
                        self.handle_suppressed(&dag, consecutive_failed, limit).await?;
                        return Ok(Vec::new());
                    }
                    Err(e) => return Err(e),
                };
                if slots == 0 {
                    tracing::debug!("DAG {} has no free run slot, deferring dataset batch", dag_id);
                    self.triggers.lock().unwrap().request_evaluation(dag_id);
                    return Ok(Vec::new());
                }

                let events = self.triggers.lock().unwrap().consume(dag_id);
                match self.scheduler.dataset_run(&dag, &history, &events, now)? {
                    Some(plan) => vec![(RunType::DatasetTriggered, plan, events)],
                    None => Vec::new(),
                }
            }
            _ => match self.scheduler.due_runs(&dag, &history, now) {
                Ok(decision) => {
                    if decision.deferred {
                        self.triggers.lock().unwrap().request_evaluation(dag_id);
                    }
                    decision
                        .plans
                        .into_iter()
                        .map(|plan| (RunType::Scheduled, plan, Vec::new()))
                        .collect()
                }
                Err(OrchestratorError::RunSuppressed {
                    consecutive_failed,
                    limit,
                    ..
                }) => {
                    self.handle_suppressed(&dag, consecutive_failed, limit).await?;
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e),
            },
        };

        let mut created = Vec::new();
        for (run_type, plan, events) in plans {
            let record = self
                .create_run(
                    &dag,
                    run_type,
                    plan,
                    events,
                    serde_json::Value::Null,
                    history.consecutive_failed_runs,
                )
                .await?;
            created.push(record.run.id);
            self.spawn_run(Arc::clone(&dag), record, CancellationToken::new());
        }
        Ok(created)
    }

    async fn create_run(
        &self,
        dag: &DagDefinition,
        run_type: RunType,
        plan: RunPlan,
        triggering_events: Vec<DatasetEvent>,
        conf: serde_json::Value,
        consecutive_failed_runs: u32,
    ) -> Result<RunRecord> {
        let mut record = RunRecord {
            version: 0,
            run: DagRun {
                id: RunId::new(),
                dag_id: dag.id().clone(),
                run_type,
                logical_date: plan.logical_date,
                state: DagRunState::Queued,
                queued_at: Utc::now(),
                start_date: None,
                end_date: None,
                consecutive_failed_runs,
                data_interval: plan.data_interval,
                triggering_events,
                conf,
                note: None,
                callback_delivered: false,
            },
            task_instances: dag.new_task_instances(),
            xcom: Default::default(),
        };
        // A scheduled run advances the DAG's schedule cursor in the same write
        record.version =
            persist_with_retry(self.store.as_ref(), &record, &self.settings.persist_retry).await?;

        let event = Event::new(
            record.run.id,
            dag.id().clone(),
            EventType::RunQueued {
                run_type,
                logical_date: plan.logical_date,
            },
        );
        if let Err(e) = self.event_log.append(event).await {
            tracing::warn!("Failed to append event for run {}: {:#}", record.run.id, e);
        }

        tracing::info!(
            "Created {:?} run {} of DAG {} for {}",
            run_type,
            record.run.id,
            dag.id(),
            plan.logical_date
        );
        Ok(record)
    }

    /// Tell the failure callback about a suppression, once per streak
    async fn handle_suppressed(
        &self,
        dag: &DagDefinition,
        consecutive_failed: u32,
        limit: u32,
    ) -> Result<()> {
        let mut first = false;
        self.store.update_dag_state(dag.id(), &mut |state| {
            first = !state.suppression_notified;
            state.suppression_notified = true;
        })?;
        if !first {
            return Ok(());
        }

        tracing::warn!(
            "Suppressing runs of DAG {} after {} consecutive failures (limit {})",
            dag.id(),
            consecutive_failed,
            limit
        );
        if let Some(callback) = dag.on_failure() {
            let notification =
                RunNotification::suppressed(dag.id().clone(), consecutive_failed, limit);
            callback.notify(&notification).await;
        }
        Ok(())
    }

    fn spawn_run(&self, dag: Arc<DagDefinition>, record: RunRecord, cancel: CancellationToken) {
        let run_id = record.run.id;
        let dag_id = record.run.dag_id.clone();
        let executor = self.executor.clone();
        let active = Arc::clone(&self.active);
        let finished = self.finished_tx.clone();

        // Holding the lock keeps the loop from deregistering before it is registered
        let mut runs = self.active.lock().unwrap();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let dag_id = record.run.dag_id.clone();
            match executor.execute(dag, record, run_cancel).await {
                Ok(record) => tracing::debug!(
                    "Run loop of {} exited in state {}",
                    record.run.id,
                    record.run.state
                ),
                Err(e) => tracing::error!("Run loop of {} failed: {}", run_id, e),
            }
            active.lock().unwrap().remove(&run_id);
            let _ = finished.send(dag_id);
        });
        runs.insert(
            run_id,
            ActiveRun {
                dag_id,
                cancel,
                handle: Some(handle),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{task_fn, DagBuilder, TaskBuilder};
    use crate::storage::{InMemoryRunStateStore, MemoryEventLog};

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(InMemoryRunStateStore::new()),
            Arc::new(MemoryEventLog::new()),
            OrchestratorSettings::default(),
        )
    }

    fn dag(id: &str) -> DagDefinition {
        DagBuilder::new(id)
            .task(TaskBuilder::new("t", task_fn(|_ctx| async { Ok(None) })))
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_dag_rejects_duplicates() {
        let orchestrator = orchestrator();
        orchestrator.register_dag(dag("ecom")).unwrap();
        orchestrator.register_dag(dag("extractor")).unwrap();

        assert!(matches!(
            orchestrator.register_dag(dag("ecom")),
            Err(OrchestratorError::DuplicateDag(_))
        ));
        let ids: Vec<String> = orchestrator
            .dags()
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(ids, vec!["ecom", "extractor"]);
    }

    #[test]
    fn test_dag_states_lists_every_known_dag() {
        let orchestrator = orchestrator();
        orchestrator.register_dag(dag("ecom")).unwrap();
        assert!(orchestrator.dag_states().unwrap().is_empty());

        orchestrator.reset_failures(&DagId::new("ecom")).unwrap();
        let states = orchestrator.dag_states().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].dag_id, DagId::new("ecom"));
        assert_eq!(states[0].consecutive_failed_runs, 0);
    }

    #[test]
    fn test_admin_operations_on_unknown_targets() {
        let orchestrator = orchestrator();
        assert!(matches!(
            orchestrator.reset_failures(&DagId::new("missing")),
            Err(OrchestratorError::UnknownDag(_))
        ));
        assert!(matches!(
            orchestrator.get_run(&RunId::new()),
            Err(OrchestratorError::UnknownRun(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_run_times_out_on_queued_run() {
        let orchestrator = orchestrator();
        orchestrator
            .register_dag(
                DagBuilder::new("ecom")
                    .max_active_runs(1)
                    .task(TaskBuilder::new(
                        "t",
                        task_fn(|_ctx| async {
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            Ok(None)
                        }),
                    ))
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let dag_id = DagId::new("ecom");
        let first = orchestrator.trigger_run(&dag_id, serde_json::Value::Null).await.unwrap();
        let second = orchestrator.trigger_run(&dag_id, serde_json::Value::Null).await.unwrap();

        assert!(orchestrator.is_active(&first));
        assert_eq!(orchestrator.waiting_runs(&dag_id).unwrap().len(), 1);
        assert_eq!(orchestrator.history(&dag_id).unwrap().active_runs, 2);
        assert!(matches!(
            orchestrator.wait_for_run(&second, Duration::from_millis(50)).await,
            Err(OrchestratorError::Timeout(_))
        ));

        orchestrator.shutdown().await.unwrap();
    }
}
