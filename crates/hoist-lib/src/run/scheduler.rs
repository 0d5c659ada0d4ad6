//! Priority-ordered, concurrency-bounded execution over the task graph.
//!
//! A pool of worker threads shares one ready queue guarded by a mutex and
//! condvar. Tasks become ready when every predecessor is terminal and every
//! strong predecessor is terminal-success; ready tasks are dispatched lowest
//! level first, longest critical path first. Each dispatched task goes
//! through the cache integration layer before anything is executed.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    time::{Duration, Instant},
};

use camino::Utf8Path;
use hoist_cache::{CacheSource, TASK_STATE_DIR};
use hoist_engine::{Engine, LeafTask, TaskNode};
use hoist_hash::Fingerprint;
use hoist_task_id::task_file_stem;
use parking_lot::{Condvar, Mutex};
use petgraph::{graph::NodeIndex, visit::EdgeRef, Direction};
use tracing::{debug, warn};

use super::{
    cache::{CacheProbe, RunCache},
    executor::{CancelToken, ExecOutcome, TaskExecutor, TaskInvocation},
    state::TaskState,
    summary::{TaskFailure, TaskSummary},
    RunOpts,
};
use crate::{
    handlers::{expand_globs, HandlerRegistry},
    task_hash::{TaskHashResult, TaskHasher},
};

/// External control over a running build. `stop` starts no new tasks and
/// lets running ones finish; `stop_and_kill` additionally trips the cancel
/// token handed to executors.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    stop: Arc<AtomicBool>,
    kill: CancelToken,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stop.store(true, AtomicOrdering::SeqCst);
    }

    pub fn stop_and_kill(&self) {
        self.stop();
        self.kill.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(AtomicOrdering::SeqCst)
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.kill
    }
}

/// Dispatch priority: lowest level first, then longest remaining critical
/// path, then insertion order.
#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    level: u32,
    weight: u32,
    seq: u64,
    node: NodeIndex,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .level
            .cmp(&self.level)
            .then(self.weight.cmp(&other.weight))
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct NodeRecord {
    state: TaskState,
    remaining: usize,
    ready_at: Option<Instant>,
    queue_wait: Option<Duration>,
    runtime: Option<Duration>,
    cache_source: Option<CacheSource>,
    fingerprint: Option<Fingerprint>,
    hash_result: Option<TaskHashResult>,
    failure: Option<TaskFailure>,
    time_saved: u64,
}

struct SchedState {
    records: Vec<NodeRecord>,
    ready: BinaryHeap<ReadyEntry>,
    seq: u64,
    unfinished: usize,
    stopped: bool,
    /// Fingerprints currently being checked or executed, for same-build
    /// publication dedup.
    inflight: HashMap<Fingerprint, NodeIndex>,
    /// Tasks parked because another task owns their fingerprint. Requeued
    /// when the owner reaches a terminal state.
    fingerprint_waiters: HashMap<Fingerprint, Vec<NodeIndex>>,
    publish_failures: usize,
}

pub(crate) struct SchedulerResult {
    pub tasks: Vec<TaskSummary>,
    pub built: usize,
    pub restored: usize,
    pub up_to_date: usize,
    pub failed: usize,
    pub skipped: usize,
    pub publish_failures: usize,
    pub queue_wait_total: Duration,
    pub time_saved_ms: u64,
}

pub(crate) struct Scheduler<'a> {
    pub engine: &'a Engine,
    pub hasher: &'a TaskHasher<'a>,
    pub run_cache: &'a RunCache,
    pub registry: &'a HandlerRegistry,
    pub workspace_root: &'a Utf8Path,
    pub opts: &'a RunOpts,
    pub executor: &'a dyn TaskExecutor,
    pub stop: StopSignal,
}

const STOP_POLL: Duration = Duration::from_millis(100);

impl Scheduler<'_> {
    pub fn run(self) -> SchedulerResult {
        let graph = self.engine.task_graph();
        let root = self.engine.root_index();

        let mut initial = SchedState {
            records: (0..graph.node_count()).map(|_| NodeRecord::default()).collect(),
            ready: BinaryHeap::new(),
            seq: 0,
            unfinished: 0,
            stopped: false,
            inflight: HashMap::new(),
            fingerprint_waiters: HashMap::new(),
            publish_failures: 0,
        };

        for node in graph.node_indices() {
            if node == root {
                continue;
            }
            initial.unfinished += 1;
            initial.records[node.index()].remaining = graph
                .edges_directed(node, Direction::Outgoing)
                .filter(|edge| edge.target() != root)
                .count();
        }
        for node in graph.node_indices() {
            if node != root && initial.records[node.index()].remaining == 0 {
                self.make_ready(&mut initial, node);
            }
        }

        let worker_count = self.opts.concurrency.max(1).min(initial.unfinished.max(1));
        let state = Mutex::new(initial);
        let condvar = Condvar::new();

        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                scope.spawn(|| self.worker(&state, &condvar));
            }
        });

        self.assemble(state.into_inner())
    }

    fn worker(&self, state: &Mutex<SchedState>, condvar: &Condvar) {
        loop {
            let entry = {
                let mut guard = state.lock();
                loop {
                    if guard.unfinished == 0 {
                        condvar.notify_all();
                        return;
                    }
                    if guard.stopped || self.stop.is_stopped() {
                        condvar.notify_all();
                        return;
                    }
                    if let Some(entry) = guard.ready.pop() {
                        break entry;
                    }
                    // Timed wait so an external stop signal is noticed even
                    // when no task completes.
                    let _ = condvar.wait_for(&mut guard, STOP_POLL);
                }
            };
            self.process(entry.node, state, condvar);
        }
    }

    fn process(&self, node: NodeIndex, state: &Mutex<SchedState>, condvar: &Condvar) {
        let graph = self.engine.task_graph();
        let Some(TaskNode::Task(task_id)) = graph.node_weight(node) else {
            return;
        };
        let task_id = task_id.clone();
        let leaf = self
            .engine
            .leaf_task(&task_id)
            .expect("scheduled nodes are leaf tasks")
            .clone();

        // Fingerprint first; a task parked for dedup keeps its result.
        let memoized = state.lock().records[node.index()].hash_result.clone();
        let hash_result = match memoized {
            Some(result) => result,
            None => match self.hasher.hash_task(self.engine, &leaf) {
                Ok(result) => result,
                Err(error) => {
                    let mut guard = state.lock();
                    guard.records[node.index()].failure = Some(TaskFailure {
                        message: format!("failed to hash task inputs: {error}"),
                        exit_code: None,
                        stderr: String::new(),
                    });
                    self.complete(&mut guard, node, TaskState::Failed);
                    condvar.notify_all();
                    return;
                }
            },
        };
        let fingerprint = hash_result.fingerprint.clone();

        // In-flight dedup: the first task with a fingerprint owns it; any
        // other parks until the owner publishes, then probes the cache.
        {
            let mut guard = state.lock();
            let record = &mut guard.records[node.index()];
            record.hash_result = Some(hash_result.clone());
            record.fingerprint = Some(fingerprint.clone());
            if leaf.cache {
                match guard.inflight.get(&fingerprint) {
                    Some(owner) if *owner != node => {
                        debug!(
                            "{task_id} shares fingerprint {fingerprint} with a running task; \
                             waiting for it to publish"
                        );
                        guard
                            .fingerprint_waiters
                            .entry(fingerprint)
                            .or_default()
                            .push(node);
                        return;
                    }
                    Some(_) => {}
                    None => {
                        guard.inflight.insert(fingerprint.clone(), node);
                    }
                }
            }
        }

        let task_cache = self.run_cache.task_cache(&leaf, fingerprint);
        if leaf.cache {
            match task_cache.probe() {
                CacheProbe::UpToDate(metadata) => {
                    let mut guard = state.lock();
                    let record = &mut guard.records[node.index()];
                    record.cache_source = Some(metadata.source);
                    record.time_saved = metadata.time_saved;
                    self.complete(&mut guard, node, TaskState::UpToDate);
                    condvar.notify_all();
                    return;
                }
                CacheProbe::Restored { metadata, outcome } => {
                    debug!(
                        "restored {} files for {task_id} from the shared store",
                        outcome.files.len()
                    );
                    let mut guard = state.lock();
                    let record = &mut guard.records[node.index()];
                    record.cache_source = Some(metadata.source);
                    record.time_saved = metadata.time_saved;
                    self.complete(&mut guard, node, TaskState::UpToDate);
                    condvar.notify_all();
                    return;
                }
                CacheProbe::Miss => {}
            }
        }

        {
            let mut guard = state.lock();
            let record = &mut guard.records[node.index()];
            record.queue_wait = record.ready_at.map(|ready_at| ready_at.elapsed());
            debug_assert!(record.state.can_transition_to(TaskState::Running));
            record.state = TaskState::Running;
        }

        let invocation = TaskInvocation {
            task_id: task_id.clone(),
            command: leaf.command.clone(),
            cwd: self.workspace_root.join(&leaf.package_dir),
            env: self.opts.env.clone(),
            timeout: self.opts.task_timeout,
        };
        let execution = self.executor.execute(&invocation, self.stop.cancel_token());

        match execution {
            Ok(result) if result.succeeded() => {
                match self.collect_outputs(&leaf, &result.stdout, &result.stderr) {
                    Ok(outputs) => {
                        let mut publish_failed = false;
                        if leaf.cache {
                            if let Err(error) =
                                task_cache.publish(&hash_result.inputs, &outputs, result.runtime)
                            {
                                warn!("failed to publish cache entry for {task_id}: {error}");
                                publish_failed = true;
                            }
                        }
                        let mut guard = state.lock();
                        if publish_failed {
                            guard.publish_failures += 1;
                        }
                        guard.records[node.index()].runtime = Some(result.runtime);
                        self.complete(&mut guard, node, TaskState::Succeeded);
                    }
                    Err(error) => {
                        let mut guard = state.lock();
                        let record = &mut guard.records[node.index()];
                        record.runtime = Some(result.runtime);
                        record.failure = Some(TaskFailure {
                            message: format!("failed to collect outputs: {error}"),
                            exit_code: result.exit_code(),
                            stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
                        });
                        self.complete(&mut guard, node, TaskState::Failed);
                    }
                }
            }
            Ok(result) => {
                let message = match result.outcome {
                    ExecOutcome::Completed { exit_code } => {
                        format!("command exited with code {exit_code}")
                    }
                    ExecOutcome::TimedOut => "command timed out".to_owned(),
                    ExecOutcome::Killed => "command was cancelled".to_owned(),
                };
                let mut guard = state.lock();
                let record = &mut guard.records[node.index()];
                record.runtime = Some(result.runtime);
                record.failure = Some(TaskFailure {
                    message,
                    exit_code: result.exit_code(),
                    stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
                });
                self.complete(&mut guard, node, TaskState::Failed);
                if self.opts.stop_on_failure {
                    guard.stopped = true;
                }
            }
            Err(error) => {
                let mut guard = state.lock();
                guard.records[node.index()].failure = Some(TaskFailure {
                    message: error.to_string(),
                    exit_code: None,
                    stderr: String::new(),
                });
                self.complete(&mut guard, node, TaskState::Failed);
                if self.opts.stop_on_failure {
                    guard.stopped = true;
                }
            }
        }
        condvar.notify_all();
    }

    /// Capture the task log, then enumerate the concrete output files the
    /// run produced. The log itself counts as an output so cache hits bring
    /// it back.
    fn collect_outputs(
        &self,
        leaf: &LeafTask,
        stdout: &[u8],
        stderr: &[u8],
    ) -> std::io::Result<Vec<String>> {
        let package_root = self.workspace_root.join(&leaf.package_dir);
        let log_relative = format!(
            "{TASK_STATE_DIR}/{}.log",
            task_file_stem(leaf.task_id.task())
        );
        let log_path = package_root.join(&log_relative);
        std::fs::create_dir_all(log_path.parent().expect("log path has a parent"))?;
        let mut log = Vec::with_capacity(stdout.len() + stderr.len());
        log.extend_from_slice(stdout);
        log.extend_from_slice(stderr);
        std::fs::write(&log_path, log)?;

        let handler = self.registry.handler_for(&leaf.command);
        let globs = handler.discover_outputs(&leaf.outputs);
        let mut outputs = expand_globs(&package_root, &globs)?;
        outputs.push(log_relative);
        outputs.sort();
        outputs.dedup();
        Ok(outputs)
    }

    /// Record a terminal state, release fingerprint ownership, and unblock
    /// dependents. Must be called with the state lock held.
    fn complete(&self, guard: &mut SchedState, node: NodeIndex, terminal: TaskState) {
        let record = &mut guard.records[node.index()];
        debug_assert!(terminal.is_terminal());
        record.state = terminal;
        guard.unfinished -= 1;

        if let Some(fingerprint) = guard.records[node.index()].fingerprint.clone() {
            if guard.inflight.get(&fingerprint) == Some(&node) {
                guard.inflight.remove(&fingerprint);
                if let Some(waiters) = guard.fingerprint_waiters.remove(&fingerprint) {
                    for waiter in waiters {
                        self.push_ready_entry(guard, waiter);
                    }
                }
            }
        }

        let graph = self.engine.task_graph();
        let dependents: Vec<NodeIndex> = graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        for dependent in dependents {
            let record = &mut guard.records[dependent.index()];
            record.remaining -= 1;
            if record.remaining == 0 && record.state == TaskState::Pending {
                self.evaluate_readiness(guard, dependent);
            }
        }
    }

    /// All predecessors are terminal; decide between ready and skipped.
    fn evaluate_readiness(&self, guard: &mut SchedState, node: NodeIndex) {
        let graph = self.engine.task_graph();
        let root = self.engine.root_index();
        let strong_preds_succeeded = graph
            .edges_directed(node, Direction::Outgoing)
            .filter(|edge| edge.target() != root)
            .filter(|edge| *edge.weight() == hoist_engine::EdgeKind::Strong)
            .all(|edge| guard.records[edge.target().index()].state.is_terminal_success());

        if strong_preds_succeeded {
            self.make_ready(guard, node);
        } else {
            // Failure containment: exactly the strong successors skip, and
            // the cascade continues through complete().
            self.complete(guard, node, TaskState::Skipped);
        }
    }

    fn make_ready(&self, guard: &mut SchedState, node: NodeIndex) {
        let record = &mut guard.records[node.index()];
        debug_assert!(record.state.can_transition_to(TaskState::Ready));
        record.state = TaskState::Ready;
        record.ready_at = Some(Instant::now());
        self.push_ready_entry(guard, node);
    }

    fn push_ready_entry(&self, guard: &mut SchedState, node: NodeIndex) {
        let graph = self.engine.task_graph();
        let Some(TaskNode::Task(task_id)) = graph.node_weight(node) else {
            return;
        };
        guard.seq += 1;
        let entry = ReadyEntry {
            level: self.engine.level(task_id),
            weight: self.engine.weight(task_id),
            seq: guard.seq,
            node,
        };
        guard.ready.push(entry);
    }

    fn assemble(&self, state: SchedState) -> SchedulerResult {
        let graph = self.engine.task_graph();
        let mut tasks = Vec::new();
        let mut result = SchedulerResult {
            tasks: Vec::new(),
            built: 0,
            restored: 0,
            up_to_date: 0,
            failed: 0,
            skipped: 0,
            publish_failures: state.publish_failures,
            queue_wait_total: Duration::ZERO,
            time_saved_ms: 0,
        };

        for node in graph.node_indices() {
            let Some(TaskNode::Task(task_id)) = graph.node_weight(node) else {
                continue;
            };
            let record = &state.records[node.index()];
            // Tasks never dispatched because of a stop read as skipped.
            let final_state = if record.state.is_terminal() {
                record.state
            } else {
                TaskState::Skipped
            };
            match (final_state, record.cache_source) {
                (TaskState::Succeeded, _) => result.built += 1,
                (TaskState::UpToDate, Some(CacheSource::Shared)) => result.restored += 1,
                (TaskState::UpToDate, _) => result.up_to_date += 1,
                (TaskState::Failed, _) => result.failed += 1,
                (TaskState::Skipped, _) => result.skipped += 1,
                _ => {}
            }
            if let Some(queue_wait) = record.queue_wait {
                result.queue_wait_total += queue_wait;
            }
            result.time_saved_ms += record.time_saved;

            tasks.push(TaskSummary {
                task_id: task_id.clone(),
                state: final_state,
                cache_source: record.cache_source,
                fingerprint: record.fingerprint.clone(),
                runtime: record.runtime,
                queue_wait: record.queue_wait,
                failure: record.failure.clone(),
            });
        }

        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        result.tasks = tasks;
        result
    }
}
