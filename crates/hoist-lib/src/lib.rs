#![deny(clippy::all)]
//! The run layer: everything between a built task graph and a build result.
//!
//! A [`run::Run`] owns the graph, the cache tiers, and the fingerprinting
//! machinery; [`run::Run::execute`] drives a worker pool over the graph,
//! consulting the cache tiers before every task and publishing to both after
//! every successful execution.

pub mod handlers;
pub mod run;
pub mod task_hash;

pub use run::{
    BuildResultStatus, CancelToken, ExecOutcome, ExecuteError, ExecutionResult, ProcessExecutor,
    Run, RunBuilder, RunError, RunOpts, RunSummary, StopSignal, TaskExecutor, TaskInvocation,
    TaskState, TaskSummary,
};
