use anyhow::{Context, Result};
use arbor_core::dag::DagSettings;
use arbor_core::storage::{JsonlEventLog, PersistRetry, RedbRunStateStore};
use arbor_core::{Orchestrator, OrchestratorSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArborConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-DAG overrides, keyed by DAG id
    #[serde(default)]
    pub dags: BTreeMap<String, DagSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_state_file")]
    pub state_file: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,
}

fn default_state_file() -> String {
    "state.redb".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            event_log_dir: default_event_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_persist_max_attempts")]
    pub persist_max_attempts: u32,

    #[serde(default = "default_persist_backoff_ms")]
    pub persist_backoff_ms: u64,
}

fn default_tick_interval_secs() -> u64 {
    1
}

fn default_persist_max_attempts() -> u32 {
    5
}

fn default_persist_backoff_ms() -> u64 {
    100
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            persist_max_attempts: default_persist_max_attempts(),
            persist_backoff_ms: default_persist_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json: bool,
}

impl ArborConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.state_file)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    /// Settings for a DAG, empty when the file has none
    pub fn dag_settings(&self, dag_id: &str) -> DagSettings {
        self.dags.get(dag_id).cloned().unwrap_or_default()
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let initial_backoff = Duration::from_millis(self.scheduler.persist_backoff_ms);
        OrchestratorSettings {
            tick_interval: Duration::from_secs(self.scheduler.tick_interval_secs.max(1)),
            persist_retry: PersistRetry {
                max_attempts: self.scheduler.persist_max_attempts.max(1),
                initial_backoff,
                max_backoff: initial_backoff.saturating_mul(32),
            },
        }
    }

    /// Open the durable stores and build an orchestrator on top of them
    pub fn open_orchestrator(&self) -> Result<Orchestrator> {
        let store = Arc::new(
            RedbRunStateStore::new(self.state_path()).context("Failed to open run state store")?,
        );
        let event_log = Arc::new(
            JsonlEventLog::new(self.event_log_path()).context("Failed to create event log")?,
        );

        Ok(Orchestrator::new(
            store,
            event_log,
            self.orchestrator_settings(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::dag::ScheduleSetting;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ArborConfig::load(
            &temp_dir.path().join("arbor.toml"),
            temp_dir.path().join("data"),
        )
        .unwrap();

        assert_eq!(config.state_path(), temp_dir.path().join("data/state.redb"));
        assert_eq!(config.scheduler.tick_interval_secs, 1);
        assert!(!config.logging.json);
        assert!(config.dags.is_empty());
    }

    #[test]
    fn test_parses_scheduler_and_dag_sections() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("arbor.toml");
        std::fs::write(
            &path,
            r#"
[storage]
state_file = "runs.redb"

[scheduler]
tick_interval_secs = 5
persist_max_attempts = 3

[logging]
json = true

[dags.ecom]
max_active_runs = 1
max_consecutive_failed_dag_runs = 2
dagrun_timeout_secs = 1200

[dags.cocktail_report]
schedule = ["file:///tmp/cocktail.json"]
dataset_mode = "all"
"#,
        )
        .unwrap();

        let config = ArborConfig::load(&path, temp_dir.path().join("data")).unwrap();
        assert_eq!(config.storage.state_file, "runs.redb");
        assert_eq!(config.storage.event_log_dir, "events");
        assert!(config.logging.json);

        let settings = config.orchestrator_settings();
        assert_eq!(settings.tick_interval, Duration::from_secs(5));
        assert_eq!(settings.persist_retry.max_attempts, 3);

        let ecom = config.dag_settings("ecom");
        assert_eq!(ecom.max_active_runs, Some(1));
        assert_eq!(ecom.dagrun_timeout_secs, Some(1200));
        assert_eq!(
            config.dag_settings("cocktail_report").schedule,
            Some(ScheduleSetting::Datasets(vec![
                "file:///tmp/cocktail.json".to_string()
            ]))
        );
        assert_eq!(config.dag_settings("unknown"), DagSettings::default());
    }

    #[test]
    fn test_unknown_dag_keys_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("arbor.toml");
        std::fs::write(&path, "[dags.ecom]\nmax_runs = 1\n").unwrap();

        assert!(ArborConfig::load(&path, temp_dir.path().join("data")).is_err());
    }
}
