//! Schedule descriptors: when a DAG should get new runs.

use crate::error::DagError;
use crate::types::DatasetId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Whether a dataset-scheduled DAG fires on any listed update or needs all of them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetMode {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetCondition {
    pub datasets: BTreeSet<DatasetId>,
    pub mode: DatasetMode,
}

impl DatasetCondition {
    /// Whether the updated set fulfils the condition
    pub fn is_satisfied_by<'a>(&self, updated: impl IntoIterator<Item = &'a DatasetId>) -> bool {
        let updated: BTreeSet<&DatasetId> = updated
            .into_iter()
            .filter(|d| self.datasets.contains(*d))
            .collect();
        match self.mode {
            DatasetMode::Any => !updated.is_empty(),
            DatasetMode::All => updated.len() == self.datasets.len(),
        }
    }
}

/// Calendar recurrence backed by the `cron` crate
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse a preset (`@daily`), a five-field unix expression or a
    /// six/seven-field expression with seconds.
    pub fn parse(expr: &str) -> Result<Self, DagError> {
        let normalized = normalize_cron(expr);
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| DagError::InvalidSchedule {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expr: expr.trim().to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `t`
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&t).next()
    }

    /// First fire time at or after `t`
    pub fn first_at_or_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&(t - chrono::Duration::seconds(1)))
            .find(|fire| *fire >= t)
    }

    /// Latest fire time at or before `t`
    pub fn latest_at_or_before(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&(t + chrono::Duration::seconds(1)))
            .rev()
            .find(|fire| *fire <= t)
    }

    /// Fire time immediately before `t`
    pub fn previous_before(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&t).rev().find(|fire| *fire < t)
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    match expr {
        "@hourly" => "0 0 * * * *".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@weekly" => "0 0 0 * * Sun".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
        _ if expr.split_whitespace().count() == 5 => format!("0 {}", expr),
        _ => expr.to_string(),
    }
}

/// When new runs of a DAG are created
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleDescriptor {
    /// Only manual triggers
    Manual,
    /// A single run at the DAG's start date
    Once,
    Cron(CronSchedule),
    Datasets(DatasetCondition),
}

impl ScheduleDescriptor {
    /// Parse a schedule string: `none`/`null`/empty for manual, `@once`, or a cron expression
    pub fn parse(expr: &str) -> Result<Self, DagError> {
        match expr.trim() {
            "" | "none" | "null" | "manual" => Ok(Self::Manual),
            "@once" => Ok(Self::Once),
            other => Ok(Self::Cron(CronSchedule::parse(other)?)),
        }
    }

    pub fn datasets<I, D>(datasets: I, mode: DatasetMode) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DatasetId>,
    {
        Self::Datasets(DatasetCondition {
            datasets: datasets.into_iter().map(Into::into).collect(),
            mode,
        })
    }

    pub fn is_time_based(&self) -> bool {
        matches!(self, Self::Cron(_) | Self::Once)
    }

    pub fn consumes(&self, dataset: &DatasetId) -> bool {
        match self {
            Self::Datasets(condition) => condition.datasets.contains(dataset),
            _ => false,
        }
    }
}

impl std::fmt::Display for ScheduleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => f.write_str("manual"),
            Self::Once => f.write_str("@once"),
            Self::Cron(cron) => f.write_str(cron.expr()),
            Self::Datasets(condition) => {
                let names: Vec<&str> = condition.datasets.iter().map(|d| d.uri()).collect();
                write!(f, "datasets[{:?}]({})", condition.mode, names.join(", "))
            }
        }
    }
}
