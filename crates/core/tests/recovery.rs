mod common;

use arbor_core::dag::{sensor_fn, task_fn, DagBuilder, DagDefinition, PokeOutcome, TaskBuilder};
use arbor_core::events::EventType;
use arbor_core::executor::Executor;
use arbor_core::notify::{ChannelCallback, NotificationKind};
use arbor_core::storage::{InMemoryRunStateStore, PersistRetry, RunStateStore};
use arbor_core::{
    AttemptOutcome, DagId, DagRun, DagRunState, DagState, OrchestratorError, RunId, RunRecord,
    RunType, SensorPhase, SensorProgress, StoreError, TaskAttempt, TaskId, TaskState,
};
use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn counting(calls: Arc<AtomicU32>) -> Arc<dyn arbor_core::dag::TaskCallable> {
    task_fn(move |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(None) }
    })
}

fn record_for(dag: &DagDefinition, state: DagRunState) -> RunRecord {
    let now = Utc::now();
    RunRecord {
        version: 0,
        run: DagRun {
            id: RunId::new(),
            dag_id: dag.id().clone(),
            run_type: RunType::Manual,
            logical_date: now,
            state,
            queued_at: now,
            start_date: (state != DagRunState::Queued).then_some(now),
            end_date: None,
            consecutive_failed_runs: 0,
            data_interval: None,
            triggering_events: Vec::new(),
            conf: json!(null),
            note: None,
            callback_delivered: false,
        },
        task_instances: dag.new_task_instances(),
        xcom: Default::default(),
    }
}

fn attempt(outcome: Option<AttemptOutcome>) -> TaskAttempt {
    let now = Utc::now();
    TaskAttempt {
        try_number: 1,
        started_at: now,
        ended_at: outcome.map(|_| now),
        outcome,
        error: None,
    }
}

#[tokio::test]
async fn test_recover_discards_interrupted_attempt() {
    let store = Arc::new(InMemoryRunStateStore::new());
    let extract_calls = Arc::new(AtomicU32::new(0));
    let load_calls = Arc::new(AtomicU32::new(0));
    let build = || {
        DagBuilder::new("etl")
            .task(TaskBuilder::new("extract", counting(extract_calls.clone())))
            .task(TaskBuilder::new("load", counting(load_calls.clone())).upstream("extract"))
            .build()
            .unwrap()
    };

    // State a crashed process left behind: extract done, load mid-attempt
    let dag = build();
    let mut record = record_for(&dag, DagRunState::Running);
    {
        let extract = record.task_instances.get_mut(&TaskId::new("extract")).unwrap();
        extract.state = TaskState::Success;
        extract.try_number = 1;
        extract.attempts.push(attempt(Some(AttemptOutcome::Success)));
        let load = record.task_instances.get_mut(&TaskId::new("load")).unwrap();
        load.state = TaskState::Running;
        load.try_number = 1;
        load.attempts.push(attempt(None));
    }
    store.persist(&record).unwrap();

    let h = harness_with_store(store.clone());
    h.orchestrator.register_dag(dag).unwrap();
    assert_eq!(h.orchestrator.recover().await.unwrap(), 1);

    let recovered = h.orchestrator.wait_for_run(&record.id(), WAIT).await.unwrap();
    assert_eq!(recovered.run.state, DagRunState::Success);
    assert_eq!(extract_calls.load(Ordering::SeqCst), 0);
    assert_eq!(load_calls.load(Ordering::SeqCst), 1);

    let load = recovered.task(&TaskId::new("load")).unwrap();
    assert_eq!(load.try_number, 1);
    assert_eq!(load.attempts.len(), 1);
    assert_eq!(load.attempts[0].outcome, Some(AttemptOutcome::Success));

    let events = h.orchestrator.event_log().get_run_events(record.id()).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::RunResumed));
}

#[tokio::test]
async fn test_recover_resumes_waiting_sensor() {
    let store = Arc::new(InMemoryRunStateStore::new());
    let dag = DagBuilder::new("stock_market")
        .task(TaskBuilder::sensor(
            "is_api_available",
            sensor_fn(|_ctx| async { Ok(PokeOutcome::done()) }),
            Duration::from_secs(30),
            Duration::from_secs(300),
        ))
        .build()
        .unwrap();

    let mut record = record_for(&dag, DagRunState::Running);
    {
        let sensor = record
            .task_instances
            .get_mut(&TaskId::new("is_api_available"))
            .unwrap();
        sensor.state = TaskState::Running;
        sensor.try_number = 1;
        sensor.attempts.push(attempt(None));
        sensor.sensor = Some(SensorProgress {
            phase: SensorPhase::Polling,
            first_poke_at: Utc::now() - ChronoDuration::seconds(60),
            pokes: 2,
            next_poke_at: None,
        });
    }
    store.persist(&record).unwrap();

    let h = harness_with_store(store.clone());
    h.orchestrator.register_dag(dag).unwrap();
    h.orchestrator.recover().await.unwrap();

    let recovered = h.orchestrator.wait_for_run(&record.id(), WAIT).await.unwrap();
    assert_eq!(recovered.run.state, DagRunState::Success);
    let sensor = recovered.task(&TaskId::new("is_api_available")).unwrap();
    assert_eq!(sensor.try_number, 1);
    let progress = sensor.sensor.as_ref().unwrap();
    assert_eq!(progress.phase, SensorPhase::Satisfied);
    assert_eq!(progress.pokes, 3);
}

#[tokio::test]
async fn test_pending_notification_delivered_once_across_restarts() {
    let store = Arc::new(InMemoryRunStateStore::new());
    let (callback, mut rx) = ChannelCallback::new();
    let build = |callback: Arc<ChannelCallback>| {
        DagBuilder::new("ecom")
            .on_failure(callback)
            .task(TaskBuilder::new("t", noop()))
            .build()
            .unwrap()
    };

    let dag = build(callback.clone());
    let mut record = record_for(&dag, DagRunState::Failed);
    record.run.end_date = Some(Utc::now());
    {
        let t = record.task_instances.get_mut(&TaskId::new("t")).unwrap();
        t.state = TaskState::Failed;
        t.try_number = 1;
        t.attempts.push(attempt(Some(AttemptOutcome::Failed)));
    }
    store.persist(&record).unwrap();

    let first = harness_with_store(store.clone());
    first.orchestrator.register_dag(dag).unwrap();
    assert_eq!(first.orchestrator.recover().await.unwrap(), 1);
    let delivered = first.orchestrator.wait_for_run(&record.id(), WAIT).await.unwrap();
    assert!(delivered.run.callback_delivered);

    let second = harness_with_store(store.clone());
    second.orchestrator.register_dag(build(callback.clone())).unwrap();
    assert_eq!(second.orchestrator.recover().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let notifications: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationKind::Failed);
    assert_eq!(notifications[0].failed_tasks, vec![TaskId::new("t")]);

    // A failure recorded before the crash still counts exactly once
    assert_eq!(
        store.dag_state(&DagId::new("ecom")).unwrap().consecutive_failed_runs,
        1
    );
}

#[tokio::test]
async fn test_shutdown_leaves_run_for_next_process() {
    let store = Arc::new(InMemoryRunStateStore::new());
    let build = || {
        DagBuilder::new("slow")
            .task(TaskBuilder::new("long", sleeping(Duration::from_millis(300))))
            .build()
            .unwrap()
    };

    let first = harness_with_store(store.clone());
    first.orchestrator.register_dag(build()).unwrap();
    let run_id = first
        .orchestrator
        .trigger_run(&DagId::new("slow"), json!(null))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    first.orchestrator.shutdown().await.unwrap();

    let interrupted = store.load(&run_id).unwrap().unwrap();
    assert_eq!(interrupted.run.state, DagRunState::Running);
    assert_eq!(
        interrupted.task(&TaskId::new("long")).unwrap().state,
        TaskState::Running
    );

    let second = harness_with_store(store.clone());
    second.orchestrator.register_dag(build()).unwrap();
    assert_eq!(second.orchestrator.recover().await.unwrap(), 1);
    let record = second.orchestrator.wait_for_run(&run_id, WAIT).await.unwrap();

    assert_eq!(record.run.state, DagRunState::Success);
    let long = record.task(&TaskId::new("long")).unwrap();
    assert_eq!(long.try_number, 1);
    assert_eq!(long.attempts.len(), 1);
}

#[tokio::test]
async fn test_recover_starts_queued_runs_within_limit() {
    let store = Arc::new(InMemoryRunStateStore::new());
    let dag = DagBuilder::new("ecom")
        .max_active_runs(1)
        .task(TaskBuilder::new("t", sleeping(Duration::from_millis(20))))
        .build()
        .unwrap();

    for _ in 0..3 {
        store.persist(&record_for(&dag, DagRunState::Queued)).unwrap();
    }

    let h = harness_with_store(store.clone());
    h.orchestrator.register_dag(dag).unwrap();
    assert_eq!(h.orchestrator.recover().await.unwrap(), 1);

    let runs = tick_until(&h.orchestrator, Utc::now(), &DagId::new("ecom"), |runs| {
        runs.iter().all(|r| r.state == DagRunState::Success)
    })
    .await;
    assert_eq!(runs.len(), 3);
    for pair in runs.windows(2) {
        assert!(pair[1].start_date >= pair[0].end_date, "runs overlapped");
    }
}

/// Accepts a fixed number of writes, then reports the backend as down
struct FailingStore {
    inner: InMemoryRunStateStore,
    /// Writes rejected before the store comes up
    leading_failures: AtomicU32,
    healthy_writes: AtomicU32,
    attempts: AtomicU32,
}

impl FailingStore {
    fn new(healthy_writes: u32) -> Self {
        Self {
            inner: InMemoryRunStateStore::new(),
            leading_failures: AtomicU32::new(0),
            healthy_writes: AtomicU32::new(healthy_writes),
            attempts: AtomicU32::new(0),
        }
    }

    fn hiccup(failures: u32) -> Self {
        Self {
            leading_failures: AtomicU32::new(failures),
            ..Self::new(u32::MAX)
        }
    }
}

impl RunStateStore for FailingStore {
    fn persist(&self, record: &RunRecord) -> Result<u64, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failures = self.leading_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.leading_failures.store(failures - 1, Ordering::SeqCst);
            return Err(StoreError::Backend(anyhow::anyhow!("transient")));
        }
        let remaining = self.healthy_writes.load(Ordering::SeqCst);
        if remaining == 0 {
            return Err(StoreError::Backend(anyhow::anyhow!("disk unavailable")));
        }
        self.healthy_writes.store(remaining - 1, Ordering::SeqCst);
        self.inner.persist(record)
    }

    fn load(&self, run_id: &RunId) -> Result<Option<RunRecord>, StoreError> {
        self.inner.load(run_id)
    }

    fn list_runs(&self, dag_id: Option<&DagId>) -> Result<Vec<DagRun>, StoreError> {
        self.inner.list_runs(dag_id)
    }

    fn load_incomplete(&self) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.load_incomplete()
    }

    fn dag_state(&self, dag_id: &DagId) -> Result<DagState, StoreError> {
        self.inner.dag_state(dag_id)
    }

    fn update_dag_state(
        &self,
        dag_id: &DagId,
        update: &mut dyn FnMut(&mut DagState),
    ) -> Result<DagState, StoreError> {
        self.inner.update_dag_state(dag_id, update)
    }

    fn list_dag_states(&self) -> Result<Vec<DagState>, StoreError> {
        self.inner.list_dag_states()
    }
}

#[tokio::test]
async fn test_store_outage_stops_run_without_executing_tasks() {
    let store = Arc::new(FailingStore::new(1));
    let calls = Arc::new(AtomicU32::new(0));
    let dag = Arc::new(
        DagBuilder::new("ecom")
            .task(TaskBuilder::new("t", counting(calls.clone())))
            .build()
            .unwrap(),
    );

    let mut record = record_for(&dag, DagRunState::Queued);
    record.version = store.persist(&record).unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let executor = Executor::new(
        store.clone(),
        Arc::new(arbor_core::storage::MemoryEventLog::new()),
        tx,
        PersistRetry {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        },
        CancellationToken::new(),
    );

    let result = executor
        .execute(Arc::clone(&dag), record.clone(), CancellationToken::new())
        .await;
    assert!(matches!(
        result,
        Err(OrchestratorError::StoreUnavailable { attempts: 3, .. })
    ));
    assert_eq!(store.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        store.load(&record.id()).unwrap().unwrap().run.state,
        DagRunState::Queued
    );
}

#[tokio::test]
async fn test_trigger_fails_when_store_is_down() {
    let h = harness_with_store(Arc::new(FailingStore::new(0)));
    h.orchestrator
        .register_dag(
            DagBuilder::new("ecom")
                .task(TaskBuilder::new("t", noop()))
                .build()
                .unwrap(),
        )
        .unwrap();

    let result = h
        .orchestrator
        .trigger_run(&DagId::new("ecom"), json!(null))
        .await;
    assert!(matches!(
        result,
        Err(OrchestratorError::StoreUnavailable { .. })
    ));
    assert!(h.orchestrator.list_runs(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_store_error_creates_one_run_per_interval() {
    let store = Arc::new(FailingStore::hiccup(2));
    let h = harness_with_store(store.clone());
    h.orchestrator
        .register_dag(
            DagBuilder::new("ecom")
                .schedule_expr("@daily")
                .unwrap()
                .start_date(at(2025, 1, 1))
                .catchup(false)
                .task(TaskBuilder::new("t", noop()))
                .build()
                .unwrap(),
        )
        .unwrap();
    let dag_id = DagId::new("ecom");

    let now = at(2025, 1, 6);
    let created = h.orchestrator.tick(now).await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(
        h.orchestrator.dag_state(&dag_id).unwrap().last_scheduled_logical_date,
        Some(at(2025, 1, 5))
    );

    h.orchestrator.wait_for_run(&created[0], WAIT).await.unwrap();
    for _ in 0..3 {
        assert!(h.orchestrator.tick(now).await.unwrap().is_empty());
    }

    let runs = h.orchestrator.list_runs(Some(&dag_id)).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].logical_date, at(2025, 1, 5));
    assert_eq!(runs[0].state, DagRunState::Success);
}

/// Rejects writes that record a delivered notification, as if the process
/// died right after the callback ran
struct LosesDeliveryStore {
    inner: Arc<InMemoryRunStateStore>,
    rejections: AtomicU32,
}

impl RunStateStore for LosesDeliveryStore {
    fn persist(&self, record: &RunRecord) -> Result<u64, StoreError> {
        if record.run.callback_delivered && self.rejections.load(Ordering::SeqCst) > 0 {
            self.rejections.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Backend(anyhow::anyhow!("process died")));
        }
        self.inner.persist(record)
    }

    fn load(&self, run_id: &RunId) -> Result<Option<RunRecord>, StoreError> {
        self.inner.load(run_id)
    }

    fn list_runs(&self, dag_id: Option<&DagId>) -> Result<Vec<DagRun>, StoreError> {
        self.inner.list_runs(dag_id)
    }

    fn load_incomplete(&self) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.load_incomplete()
    }

    fn dag_state(&self, dag_id: &DagId) -> Result<DagState, StoreError> {
        self.inner.dag_state(dag_id)
    }

    fn update_dag_state(
        &self,
        dag_id: &DagId,
        update: &mut dyn FnMut(&mut DagState),
    ) -> Result<DagState, StoreError> {
        self.inner.update_dag_state(dag_id, update)
    }

    fn list_dag_states(&self) -> Result<Vec<DagState>, StoreError> {
        self.inner.list_dag_states()
    }
}

#[tokio::test]
async fn test_unrecorded_delivery_is_repeated_with_same_run_id() {
    let inner = Arc::new(InMemoryRunStateStore::new());
    let (callback, mut rx) = ChannelCallback::new();
    let build = |callback: Arc<ChannelCallback>| {
        DagBuilder::new("ecom")
            .on_failure(callback)
            .task(TaskBuilder::new("t", failing("boom")))
            .build()
            .unwrap()
    };

    let first = harness_with_store(Arc::new(LosesDeliveryStore {
        inner: inner.clone(),
        rejections: AtomicU32::new(3),
    }));
    first.orchestrator.register_dag(build(callback.clone())).unwrap();
    let run_id = first
        .orchestrator
        .trigger_run(&DagId::new("ecom"), json!(null))
        .await
        .unwrap();

    let delivered = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(delivered.run_id, Some(run_id));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = inner.load(&run_id).unwrap().unwrap();
    assert_eq!(stored.run.state, DagRunState::Failed);
    assert!(!stored.run.callback_delivered);

    let second = harness_with_store(inner.clone());
    second.orchestrator.register_dag(build(callback.clone())).unwrap();
    assert_eq!(second.orchestrator.recover().await.unwrap(), 1);
    let record = second.orchestrator.wait_for_run(&run_id, WAIT).await.unwrap();
    assert!(record.run.callback_delivered);

    let repeated = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(repeated.run_id, Some(run_id));
    assert_eq!(repeated.kind, NotificationKind::Failed);

    // Recorded now, so a third process stays quiet
    let third = harness_with_store(inner.clone());
    third.orchestrator.register_dag(build(callback)).unwrap();
    assert_eq!(third.orchestrator.recover().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    // The failure itself still counts once
    assert_eq!(
        inner.dag_state(&DagId::new("ecom")).unwrap().consecutive_failed_runs,
        1
    );
}
