//! DAGs bundled with the daemon.

use crate::config::ArborConfig;
use anyhow::{Context, Result};
use arbor_core::dag::{
    dataset_schedule, sensor_fn, task_fn, DagBuilder, DagDefinition, PokeOutcome, TaskBuilder,
};
use arbor_core::notify::{callback_fn, RunNotification};
use arbor_core::schedule::DatasetMode;
use arbor_core::{Dataset, TaskFailure};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

const COCKTAILS: &[&str] = &["Margarita", "Negroni", "Mojito", "Old Fashioned", "Daiquiri"];

/// File-backed dataset written by `extractor` and consumed by `cocktail_report`
pub fn cocktail_dataset(data_dir: &Path) -> Dataset {
    Dataset::new(format!("file://{}", data_dir.join("cocktail.json").display()))
}

fn dataset_path(dataset: &Dataset) -> PathBuf {
    PathBuf::from(dataset.uri().trim_start_matches("file://"))
}

/// Every bundled DAG with its configuration overrides applied
pub fn bundled_dags(config: &ArborConfig) -> Result<Vec<DagDefinition>> {
    let builders = [
        stock_market(&config.data_dir)?,
        ecom()?,
        extractor(&config.data_dir)?,
        cocktail_report(&config.data_dir),
    ];

    builders
        .into_iter()
        .map(|builder| {
            let id = builder.id().to_string();
            builder
                .with_settings(&config.dag_settings(&id))
                .and_then(DagBuilder::build)
                .with_context(|| format!("Failed to build DAG {}", id))
        })
        .collect()
}

fn date(s: &str) -> Result<DateTime<Utc>> {
    s.parse().with_context(|| format!("Invalid start date {}", s))
}

fn log_notification(notification: &RunNotification) {
    if notification.is_success() {
        tracing::info!(
            "DAG {} run {:?} succeeded",
            notification.dag_id,
            notification.run_id
        );
    } else {
        tracing::warn!(
            "DAG {} run {:?} did not succeed ({:?}): {}",
            notification.dag_id,
            notification.run_id,
            notification.kind,
            notification.note.as_deref().unwrap_or("no details")
        );
    }
}

/// Waits for the stock API descriptor to show up, then hands its URL downstream
fn stock_market(data_dir: &Path) -> Result<DagBuilder> {
    let descriptor = data_dir.join("stock_api.json");

    let is_api_available = sensor_fn(move |_ctx| {
        let descriptor = descriptor.clone();
        async move {
            if !descriptor.exists() {
                return Ok(PokeOutcome::not_yet());
            }
            let content = tokio::fs::read_to_string(&descriptor)
                .await
                .context("Failed to read stock API descriptor")?;
            let api: serde_json::Value =
                serde_json::from_str(&content).context("Invalid stock API descriptor")?;
            let url = format!(
                "{}{}",
                api["host"].as_str().unwrap_or_default(),
                api["endpoint"].as_str().unwrap_or_default()
            );
            tracing::info!("Stock API available at {}", url);
            Ok(PokeOutcome::done_with(json!(url)))
        }
    });

    Ok(DagBuilder::new("stock_market")
        .schedule_expr("@daily")?
        .start_date(date("2023-01-01T00:00:00Z")?)
        .catchup(false)
        .tags(["stock_market"])
        .task(TaskBuilder::sensor(
            "is_api_available",
            is_api_available,
            Duration::from_secs(30),
            Duration::from_secs(300),
        )))
}

fn ecom() -> Result<DagBuilder> {
    let ta = task_fn(|ctx| async move {
        tracing::info!("ta running for {}", ctx.logical_date);
        Ok(None)
    });
    let tb = task_fn(|ctx| async move {
        tracing::info!("tb running for {}", ctx.logical_date);
        Ok(None)
    });

    Ok(DagBuilder::new("ecom")
        .schedule_expr("@daily")?
        .start_date(date("2025-01-01T00:00:00Z")?)
        .catchup(false)
        .description("E-commerce daily pipeline")
        .tags(["team", "teamB"])
        .default_retries(1)
        .dagrun_timeout(Duration::from_secs(20 * 60))
        .max_consecutive_failed_runs(2)
        .max_active_runs(1)
        .on_failure(callback_fn(log_notification))
        .task(TaskBuilder::new("ta", ta))
        .task(TaskBuilder::new("tb", tb))
        .edge("ta", "tb"))
}

/// Writes a cocktail record to the shared dataset and checks its size
fn extractor(data_dir: &Path) -> Result<DagBuilder> {
    let dataset = cocktail_dataset(data_dir);
    let path = dataset_path(&dataset);

    let get_cocktail = task_fn(move |ctx| {
        let path = path.clone();
        async move {
            let pick = (ctx.logical_date.timestamp().unsigned_abs() as usize + ctx.try_number as usize)
                % COCKTAILS.len();
            let payload = serde_json::to_vec(&json!({
                "drinks": [{ "strDrink": COCKTAILS[pick], "idDrink": uuid::Uuid::new_v4().to_string() }]
            }))
            .context("Failed to encode cocktail")?;

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create dataset directory")?;
            }
            tokio::fs::write(&path, &payload)
                .await
                .context("Failed to write cocktail dataset")?;

            ctx.xcom_push("request_size", json!(payload.len()));
            Ok(None)
        }
    });

    let check_size = task_fn(|ctx| async move {
        let size = ctx
            .xcom_pull("get_cocktail", "request_size")
            .ok_or_else(|| TaskFailure::failed("get_cocktail pushed no request_size"))?;
        tracing::info!("Cocktail payload size: {}", size);
        Ok(Some(size))
    });

    Ok(DagBuilder::new("extractor")
        .schedule_expr("@daily")?
        .start_date(date("2025-01-01T00:00:00Z")?)
        .catchup(false)
        .on_success(callback_fn(log_notification))
        .on_failure(callback_fn(log_notification))
        .task(TaskBuilder::new("get_cocktail", get_cocktail).outlet(dataset))
        .task(TaskBuilder::new("check_size", check_size))
        .edge("get_cocktail", "check_size"))
}

/// Runs whenever a fresh cocktail lands in the dataset
fn cocktail_report(data_dir: &Path) -> DagBuilder {
    let dataset = cocktail_dataset(data_dir);
    let path = dataset_path(&dataset);

    let report = task_fn(move |_ctx| {
        let path = path.clone();
        async move {
            let content = tokio::fs::read(&path)
                .await
                .context("Failed to read cocktail dataset")?;
            let cocktail: serde_json::Value =
                serde_json::from_slice(&content).context("Invalid cocktail dataset")?;
            let name = cocktail["drinks"][0]["strDrink"].clone();
            tracing::info!("Latest cocktail: {}", name);
            Ok(Some(name))
        }
    });

    DagBuilder::new("cocktail_report")
        .schedule(dataset_schedule([dataset], DatasetMode::Any))
        .task(TaskBuilder::new("report", report))
}
