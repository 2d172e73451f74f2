//! Maps external events (clock ticks, dataset updates) to DAGs eligible for a
//! new run evaluation. Nothing is executed here.

use crate::dag::DagDefinition;
use crate::schedule::ScheduleDescriptor;
use crate::types::{DagId, DatasetEvent, DatasetId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

struct TriggerEntry {
    schedule: ScheduleDescriptor,
    /// Next fire time at which a cron DAG becomes eligible again, or the
    /// start date a future `@once` DAG waits for
    next_due: Option<DateTime<Utc>>,
    /// Dataset updates received since the last created run
    pending: BTreeMap<DatasetId, DatasetEvent>,
    needs_evaluation: bool,
}

impl TriggerEntry {
    fn datasets_satisfied(&self) -> bool {
        match &self.schedule {
            ScheduleDescriptor::Datasets(condition) => {
                condition.is_satisfied_by(self.pending.keys())
            }
            _ => false,
        }
    }
}

/// Registry of per-DAG schedule descriptors
#[derive(Default)]
pub struct TriggerRegistry {
    entries: HashMap<DagId, TriggerEntry>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a DAG; time-based DAGs are evaluated on the next tick
    pub fn register(&mut self, dag: &DagDefinition) {
        let next_due = match dag.schedule() {
            ScheduleDescriptor::Once => dag.start_date(),
            _ => None,
        };
        let entry = TriggerEntry {
            schedule: dag.schedule().clone(),
            next_due,
            pending: BTreeMap::new(),
            needs_evaluation: dag.schedule().is_time_based(),
        };
        self.entries.insert(dag.id().clone(), entry);
    }

    /// DAGs due for evaluation at `now`
    pub fn on_time_tick(&mut self, now: DateTime<Utc>) -> BTreeSet<DagId> {
        let mut eligible = BTreeSet::new();

        for (dag_id, entry) in self.entries.iter_mut() {
            let due = match &entry.schedule {
                ScheduleDescriptor::Cron(cron) => {
                    let due = entry.needs_evaluation || entry.next_due.is_some_and(|d| d <= now);
                    if due || entry.next_due.is_none() {
                        entry.next_due = cron.next_after(now);
                    }
                    due
                }
                ScheduleDescriptor::Once => {
                    let reached = entry.next_due.is_some_and(|d| d <= now);
                    if reached {
                        entry.next_due = None;
                    }
                    entry.needs_evaluation || reached
                }
                // Deferred dataset batches are retried on ticks
                ScheduleDescriptor::Datasets(_) => {
                    entry.needs_evaluation && entry.datasets_satisfied()
                }
                ScheduleDescriptor::Manual => false,
            };

            entry.needs_evaluation = false;
            if due {
                eligible.insert(dag_id.clone());
            }
        }

        eligible
    }

    /// Record an update and return the DAGs whose dataset condition now holds
    pub fn on_dataset_updated(&mut self, event: &DatasetEvent) -> BTreeSet<DagId> {
        let mut eligible = BTreeSet::new();

        for (dag_id, entry) in self.entries.iter_mut() {
            if !entry.schedule.consumes(&event.dataset) {
                continue;
            }
            entry
                .pending
                .insert(event.dataset.clone(), event.clone());
            if entry.datasets_satisfied() {
                eligible.insert(dag_id.clone());
            }
        }

        if eligible.is_empty() {
            tracing::debug!("Dataset {} updated, no DAG eligible", event.dataset);
        }
        eligible
    }

    /// Take the pending batch of a dataset DAG once its condition holds
    pub fn consume(&mut self, dag_id: &DagId) -> Vec<DatasetEvent> {
        match self.entries.get_mut(dag_id) {
            Some(entry) if entry.datasets_satisfied() => {
                let mut events: Vec<DatasetEvent> =
                    std::mem::take(&mut entry.pending).into_values().collect();
                events.sort_by_key(|e| e.timestamp);
                events
            }
            _ => Vec::new(),
        }
    }

    /// Re-evaluate a DAG on the next tick, e.g. after capacity frees up
    pub fn request_evaluation(&mut self, dag_id: &DagId) {
        if let Some(entry) = self.entries.get_mut(dag_id) {
            entry.needs_evaluation = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{task_fn, DagBuilder, TaskBuilder};
    use crate::schedule::DatasetMode;
    use chrono::TimeZone;

    fn dag(id: &str, schedule: ScheduleDescriptor) -> DagDefinition {
        DagBuilder::new(id)
            .schedule(schedule)
            .start_date(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
            .task(TaskBuilder::new("t", task_fn(|_ctx| async { Ok(None) })))
            .build()
            .unwrap()
    }

    fn update(uri: &str) -> DatasetEvent {
        DatasetEvent::external(DatasetId::new(uri), Utc::now())
    }

    #[test]
    fn test_cron_dag_eligible_on_first_tick_and_when_due() {
        let mut registry = TriggerRegistry::new();
        registry.register(&dag("daily", ScheduleDescriptor::parse("@daily").unwrap()));
        registry.register(&dag("manual", ScheduleDescriptor::Manual));

        let t0 = Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap();
        let eligible = registry.on_time_tick(t0);
        assert_eq!(eligible, [DagId::new("daily")].into_iter().collect());

        assert!(registry.on_time_tick(t0 + chrono::Duration::hours(1)).is_empty());

        let next_day = Utc.with_ymd_and_hms(2025, 1, 7, 0, 0, 0).unwrap();
        assert_eq!(registry.on_time_tick(next_day).len(), 1);
    }

    #[test]
    fn test_any_mode_fires_on_single_update() {
        let mut registry = TriggerRegistry::new();
        registry.register(&dag(
            "consumer",
            ScheduleDescriptor::datasets(["s3://a", "s3://b"], DatasetMode::Any),
        ));
        registry.register(&dag(
            "unrelated",
            ScheduleDescriptor::datasets(["s3://c"], DatasetMode::Any),
        ));

        let eligible = registry.on_dataset_updated(&update("s3://a"));
        assert_eq!(eligible, [DagId::new("consumer")].into_iter().collect());

        let batch = registry.consume(&DagId::new("consumer"));
        assert_eq!(batch.len(), 1);
        assert!(registry.consume(&DagId::new("consumer")).is_empty());
    }

    #[test]
    fn test_all_mode_waits_for_every_dataset() {
        let mut registry = TriggerRegistry::new();
        registry.register(&dag(
            "joiner",
            ScheduleDescriptor::datasets(["s3://a", "s3://b"], DatasetMode::All),
        ));

        assert!(registry.on_dataset_updated(&update("s3://a")).is_empty());
        assert!(registry.on_dataset_updated(&update("s3://a")).is_empty());
        assert!(registry.consume(&DagId::new("joiner")).is_empty());

        let eligible = registry.on_dataset_updated(&update("s3://b"));
        assert!(eligible.contains(&DagId::new("joiner")));
        assert_eq!(registry.consume(&DagId::new("joiner")).len(), 2);
    }

    #[test]
    fn test_deferred_dataset_batch_retried_on_tick() {
        let mut registry = TriggerRegistry::new();
        registry.register(&dag(
            "consumer",
            ScheduleDescriptor::datasets(["s3://a"], DatasetMode::Any),
        ));

        registry.on_dataset_updated(&update("s3://a"));
        assert!(registry.on_time_tick(Utc::now()).is_empty());

        registry.request_evaluation(&DagId::new("consumer"));
        assert_eq!(registry.on_time_tick(Utc::now()).len(), 1);
    }

    #[test]
    fn test_once_dag_eligible_again_when_start_date_arrives() {
        let mut registry = TriggerRegistry::new();
        registry.register(&dag("once", ScheduleDescriptor::Once));

        let before = Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(registry.on_time_tick(before).len(), 1);
        assert!(registry.on_time_tick(before).is_empty());

        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(registry.on_time_tick(start).len(), 1);
        assert!(registry.on_time_tick(start + chrono::Duration::days(1)).is_empty());
    }
}
