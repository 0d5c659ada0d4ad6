//! A single build invocation, from configuration to summary.

mod cache;
mod executor;
mod scheduler;
mod state;
mod summary;

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

pub use cache::{CacheProbe, RunCache, TaskCache};
use camino::Utf8PathBuf;
pub use executor::{
    CancelToken, ExecOutcome, ExecuteError, ExecutionResult, ProcessExecutor, TaskExecutor,
    TaskInvocation,
};
use hoist_cache::{CacheError, CacheSource};
use hoist_config::WorkspaceConfig;
use hoist_engine::{Engine, EngineBuilder, TaskDefinitionResolver};
use hoist_hash::{Fingerprint, ToolchainIdentity};
use hoist_repository::PackageSet;
use hoist_task_id::TaskId;
use itertools::Itertools;
pub use scheduler::StopSignal;
use scheduler::{Scheduler, SchedulerResult};
use serde::Serialize;
pub use state::TaskState;
pub use summary::{BuildResultStatus, RunSummary, TaskFailure, TaskSummary};
use tracing::debug;

use crate::{handlers::HandlerRegistry, task_hash::TaskHasher};

const DEFAULT_STORE_DIR: &str = ".hoist-cache";

#[derive(Debug, Clone)]
pub struct RunOpts {
    /// Maximum number of tasks in `Running` at once.
    pub concurrency: usize,
    /// Per-task deadline; expiry fails the task.
    pub task_timeout: Option<Duration>,
    /// Skip cache reads. Successful runs still publish.
    pub force: bool,
    /// Stop scheduling new tasks after the first failure. Independent tasks
    /// already running finish either way.
    pub stop_on_failure: bool,
    /// Extra environment for every task invocation.
    pub env: BTreeMap<String, String>,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            task_timeout: None,
            force: false,
            stop_on_failure: false,
            env: BTreeMap::new(),
        }
    }
}

pub struct RunBuilder {
    workspace_root: Utf8PathBuf,
    package_set: PackageSet,
    config: WorkspaceConfig,
    tasks: Vec<String>,
    opts: RunOpts,
    toolchain: ToolchainIdentity,
    store_root: Option<Utf8PathBuf>,
}

impl RunBuilder {
    pub fn new(
        workspace_root: impl Into<Utf8PathBuf>,
        package_set: PackageSet,
        config: WorkspaceConfig,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            package_set,
            config,
            tasks: Vec::new(),
            opts: RunOpts::default(),
            toolchain: ToolchainIdentity::capture(""),
            store_root: None,
        }
    }

    pub fn with_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tasks = tasks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_opts(mut self, opts: RunOpts) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_toolchain(mut self, toolchain: ToolchainIdentity) -> Self {
        self.toolchain = toolchain;
        self
    }

    /// Override the shared store location. Defaults to `.hoist-cache` under
    /// the workspace root, or the configured `cacheDir`.
    pub fn with_store_root(mut self, store_root: impl Into<Utf8PathBuf>) -> Self {
        self.store_root = Some(store_root.into());
        self
    }

    /// Resolve definitions, build the task graph, and open both cache
    /// tiers. Configuration and graph problems abort here, before any task
    /// could run.
    pub fn build(self) -> Result<Run, RunError> {
        let lockfile_path = self.workspace_root.join(&self.config.lockfile);
        let lockfile_hash = hoist_hash::hash_file(lockfile_path.as_std_path()).map_err(|_| {
            RunError::MissingLockfile {
                path: lockfile_path.clone(),
            }
        })?;

        let resolver = TaskDefinitionResolver::new(&self.config);
        let engine = EngineBuilder::new(&self.package_set, &resolver)
            .with_tasks(self.tasks.iter().map(String::as_str))
            .build()?;
        for warning in engine.warnings() {
            debug!("task definition warning: {warning}");
        }

        let store_root = self.store_root.unwrap_or_else(|| {
            let dir = self
                .config
                .cache_dir
                .clone()
                .unwrap_or_else(|| DEFAULT_STORE_DIR.into());
            self.workspace_root.join(dir)
        });
        let run_cache = RunCache::new(&self.workspace_root, &store_root, self.opts.force)?;

        Ok(Run {
            workspace_root: self.workspace_root,
            engine,
            run_cache,
            toolchain: self.toolchain,
            lockfile_hash,
            registry: HandlerRegistry::default(),
            opts: self.opts,
            stop: StopSignal::new(),
        })
    }
}

pub struct Run {
    workspace_root: Utf8PathBuf,
    engine: Engine,
    run_cache: RunCache,
    toolchain: ToolchainIdentity,
    lockfile_hash: String,
    registry: HandlerRegistry,
    opts: RunOpts,
    stop: StopSignal,
}

impl Run {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Handle for stopping the build from another thread. Clone it before
    /// calling [`Run::execute`].
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Execute the graph with the given executor and collect the summary.
    pub fn execute(&self, executor: &dyn TaskExecutor) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let hasher = TaskHasher::new(
            &self.workspace_root,
            &self.toolchain,
            &self.lockfile_hash,
            &self.registry,
        );

        let result = if self.engine.is_empty() {
            SchedulerResult {
                tasks: Vec::new(),
                built: 0,
                restored: 0,
                up_to_date: 0,
                failed: 0,
                skipped: 0,
                publish_failures: 0,
                queue_wait_total: Duration::ZERO,
                time_saved_ms: 0,
            }
        } else {
            Scheduler {
                engine: &self.engine,
                hasher: &hasher,
                run_cache: &self.run_cache,
                registry: &self.registry,
                workspace_root: &self.workspace_root,
                opts: &self.opts,
                executor,
                stop: self.stop.clone(),
            }
            .run()
        };

        Ok(RunSummary {
            tasks: result.tasks,
            built: result.built,
            restored: result.restored,
            up_to_date: result.up_to_date,
            failed: result.failed,
            skipped: result.skipped,
            cache: self.run_cache.store().stats().snapshot(),
            local_hits: result.up_to_date,
            publish_failures: result.publish_failures,
            elapsed: started.elapsed(),
            queue_wait_total: result.queue_wait_total,
            time_saved_ms: result.time_saved_ms,
        })
    }

    /// Compute fingerprints and cache dispositions without executing
    /// anything or touching the working tree.
    pub fn dry_run(&self) -> Result<Vec<DryRunTask>, RunError> {
        let hasher = TaskHasher::new(
            &self.workspace_root,
            &self.toolchain,
            &self.lockfile_hash,
            &self.registry,
        );

        // Level order guarantees strong dependencies hash before their
        // dependents.
        let ordered: Vec<&TaskId<'static>> = self
            .engine
            .task_ids()
            .sorted_by_key(|task_id| (self.engine.level(task_id), task_id.to_string()))
            .collect();

        let mut report = Vec::with_capacity(ordered.len());
        for task_id in ordered {
            let leaf = self
                .engine
                .leaf_task(task_id)
                .expect("task ids come from the engine");
            let hash = hasher.hash_task(&self.engine, leaf)?;
            let task_cache = self.run_cache.task_cache(leaf, hash.fingerprint.clone());
            report.push(DryRunTask {
                task_id: task_id.clone(),
                fingerprint: hash.fingerprint,
                level: self.engine.level(task_id),
                cache: task_cache.peek(),
                command: leaf.command.clone(),
            });
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunTask {
    pub task_id: TaskId<'static>,
    pub fingerprint: Fingerprint,
    pub level: u32,
    /// Which tier would satisfy this task, if any.
    pub cache: Option<CacheSource>,
    pub command: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] hoist_config::Error),
    #[error("workspace lockfile not found at {path}")]
    MissingLockfile { path: Utf8PathBuf },
    #[error(transparent)]
    Packages(#[from] hoist_repository::Error),
    #[error(transparent)]
    Builder(#[from] hoist_engine::BuilderError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
