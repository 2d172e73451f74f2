// DAG definitions: tasks, their dependency graph and the builder that validates them

pub mod builder;
pub mod graph;
pub mod settings;
pub mod task;

pub use builder::{dataset_schedule, DagBuilder, DagDefinition};
pub use graph::DependencyGraph;
pub use settings::{DagSettings, ScheduleSetting};
pub use task::{
    sensor_fn, task_fn, DefaultArgs, PokeOutcome, Sensor, TaskBuilder, TaskCallable,
    TaskDefinition, TaskOperator, TaskOutput,
};
