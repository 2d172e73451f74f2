// Core of the Arbor DAG task orchestrator

pub mod types;
pub mod error;
pub mod dag;
pub mod schedule;
pub mod triggers;
pub mod scheduler;
pub mod executor;
pub mod storage;
pub mod events;
pub mod notify;
pub mod orchestrator;

pub use error::{DagError, OrchestratorError, Result, StoreError, TaskFailure};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use types::*;
