use crate::dag::DagDefinition;
use crate::error::{OrchestratorError, Result};
use crate::schedule::{CronSchedule, ScheduleDescriptor};
use crate::types::{DataInterval, DatasetEvent};
use chrono::{DateTime, Utc};

/// What the scheduler needs to know about a DAG's existing runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DagRunHistory {
    /// Runs that are running or queued
    pub active_runs: u32,
    pub consecutive_failed_runs: u32,
    /// Logical date of the most recent scheduled run ever created
    pub last_scheduled_logical_date: Option<DateTime<Utc>>,
}

/// A run the scheduler wants created
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub logical_date: DateTime<Utc>,
    pub data_interval: Option<DataInterval>,
}

/// Outcome of evaluating one DAG
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulingDecision {
    pub plans: Vec<RunPlan>,
    /// More runs are due but `max_active_runs` leaves no room yet
    pub deferred: bool,
}

/// Decides when new runs of a DAG are materialized
#[derive(Debug, Clone, Copy, Default)]
pub struct RunScheduler;

impl RunScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Free run slots, or `RunSuppressed` when the consecutive failure limit is reached
    pub fn admission(&self, dag: &DagDefinition, history: &DagRunHistory) -> Result<u32> {
        let limit = dag.max_consecutive_failed_runs();
        if limit > 0 && history.consecutive_failed_runs >= limit {
            return Err(OrchestratorError::RunSuppressed {
                dag_id: dag.id().clone(),
                consecutive_failed: history.consecutive_failed_runs,
                limit,
            });
        }

        Ok(dag.max_active_runs().saturating_sub(history.active_runs))
    }

    /// Time-based runs due at `now`
    pub fn due_runs(
        &self,
        dag: &DagDefinition,
        history: &DagRunHistory,
        now: DateTime<Utc>,
    ) -> Result<SchedulingDecision> {
        let slots = self.admission(dag, history)?;

        let wanted = match dag.schedule() {
            ScheduleDescriptor::Cron(cron) => {
                // One past the slots tells us whether anything was held back
                let limit = slots as usize + 1;
                if dag.catchup() {
                    self.catchup_intervals(dag, cron, history, now, limit)
                } else {
                    self.latest_interval(dag, cron, history, now)
                        .into_iter()
                        .collect()
                }
            }
            ScheduleDescriptor::Once => self.once_run(dag, history, now).into_iter().collect(),
            ScheduleDescriptor::Manual | ScheduleDescriptor::Datasets(_) => Vec::new(),
        };

        let deferred = wanted.len() > slots as usize;
        let plans: Vec<RunPlan> = wanted.into_iter().take(slots as usize).collect();

        if deferred {
            tracing::debug!(
                "DAG {} has due runs held back by max_active_runs={}",
                dag.id(),
                dag.max_active_runs()
            );
        }

        Ok(SchedulingDecision { plans, deferred })
    }

    /// A run for a qualifying batch of dataset events; calendar catch-up does not apply
    pub fn dataset_run(
        &self,
        dag: &DagDefinition,
        history: &DagRunHistory,
        events: &[DatasetEvent],
        now: DateTime<Utc>,
    ) -> Result<Option<RunPlan>> {
        if events.is_empty() {
            return Ok(None);
        }
        if self.admission(dag, history)? == 0 {
            return Ok(None);
        }

        Ok(Some(RunPlan {
            logical_date: now,
            data_interval: None,
        }))
    }

    /// Every missed interval since the last scheduled run, oldest first
    fn catchup_intervals(
        &self,
        dag: &DagDefinition,
        cron: &CronSchedule,
        history: &DagRunHistory,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<RunPlan> {
        let first = match history.last_scheduled_logical_date {
            Some(last) => cron.next_after(last),
            None => dag.start_date().and_then(|start| cron.first_at_or_after(start)),
        };

        let mut plans = Vec::new();
        let mut current = first;
        while let Some(start) = current {
            if plans.len() >= limit || dag.end_date().is_some_and(|end| start > end) {
                break;
            }
            let Some(end) = cron.next_after(start) else {
                break;
            };
            if end > now {
                break;
            }
            plans.push(RunPlan {
                logical_date: start,
                data_interval: Some(DataInterval { start, end }),
            });
            current = Some(end);
        }

        plans
    }

    /// Only the most recent complete interval
    fn latest_interval(
        &self,
        dag: &DagDefinition,
        cron: &CronSchedule,
        history: &DagRunHistory,
        now: DateTime<Utc>,
    ) -> Option<RunPlan> {
        let end = cron.latest_at_or_before(now)?;
        let start = cron.previous_before(end)?;

        let started = dag.start_date().map_or(true, |s| start >= s);
        let not_ended = dag.end_date().map_or(true, |e| start <= e);
        let fresh = history
            .last_scheduled_logical_date
            .map_or(true, |last| start > last);

        (started && not_ended && fresh).then_some(RunPlan {
            logical_date: start,
            data_interval: Some(DataInterval { start, end }),
        })
    }

    fn once_run(
        &self,
        dag: &DagDefinition,
        history: &DagRunHistory,
        now: DateTime<Utc>,
    ) -> Option<RunPlan> {
        if history.last_scheduled_logical_date.is_some() {
            return None;
        }
        let logical_date = dag.start_date().unwrap_or(now);
        (logical_date <= now).then_some(RunPlan {
            logical_date,
            data_interval: None,
        })
    }
}
