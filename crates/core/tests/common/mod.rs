#![allow(dead_code)]

use arbor_core::dag::{task_fn, TaskCallable};
use arbor_core::storage::{InMemoryRunStateStore, MemoryEventLog, PersistRetry, RunStateStore};
use arbor_core::{DagId, DagRun, Orchestrator, OrchestratorSettings, TaskFailure};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Generous bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(10);

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        tick_interval: Duration::from_millis(10),
        persist_retry: PersistRetry {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub events: Arc<MemoryEventLog>,
}

pub fn harness() -> Harness {
    harness_with_store(Arc::new(InMemoryRunStateStore::new()))
}

pub fn harness_with_store(store: Arc<dyn RunStateStore>) -> Harness {
    let events = Arc::new(MemoryEventLog::new());
    let orchestrator = Orchestrator::new(store, events.clone(), fast_settings());
    Harness {
        orchestrator,
        events,
    }
}

pub fn noop() -> Arc<dyn TaskCallable> {
    task_fn(|_ctx| async { Ok(None) })
}

pub fn failing(message: &'static str) -> Arc<dyn TaskCallable> {
    task_fn(move |_ctx| async move { Err(TaskFailure::failed(message)) })
}

/// Fails its first `failures` attempts, then succeeds; `calls` counts attempts
pub fn flaky(calls: Arc<AtomicU32>, failures: u32) -> Arc<dyn TaskCallable> {
    task_fn(move |_ctx| {
        let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if attempt <= failures {
                Err(TaskFailure::failed(format!("attempt {} failed", attempt)))
            } else {
                Ok(None)
            }
        }
    })
}

pub fn sleeping(duration: Duration) -> Arc<dyn TaskCallable> {
    task_fn(move |_ctx| async move {
        tokio::time::sleep(duration).await;
        Ok(None)
    })
}

/// Tick at a fixed logical `now` until `done` holds for the DAG's runs
pub async fn tick_until<F>(
    orchestrator: &Orchestrator,
    now: DateTime<Utc>,
    dag_id: &DagId,
    done: F,
) -> Vec<DagRun>
where
    F: Fn(&[DagRun]) -> bool,
{
    let result = tokio::time::timeout(WAIT, async {
        loop {
            orchestrator.tick(now).await.unwrap();
            let runs = orchestrator.list_runs(Some(dag_id)).unwrap();
            if done(&runs) {
                return runs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    result.expect("condition not reached in time")
}
