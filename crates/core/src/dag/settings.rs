use crate::schedule::DatasetMode;
use serde::{Deserialize, Serialize};

/// Schedule value of the configuration surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleSetting {
    /// Cron expression, preset, `@once` or `none`
    Expr(String),
    /// Dataset URIs the DAG consumes
    Datasets(Vec<String>),
}

/// DAG options settable from configuration; unset fields keep the code's values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DagSettings {
    #[serde(default)]
    pub schedule: Option<ScheduleSetting>,
    #[serde(default)]
    pub dataset_mode: Option<DatasetMode>,
    #[serde(default)]
    pub catchup: Option<bool>,
    #[serde(default)]
    pub max_active_runs: Option<u32>,
    /// 0 = unlimited
    #[serde(default)]
    pub max_consecutive_failed_dag_runs: Option<u32>,
    #[serde(default)]
    pub dagrun_timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
}
