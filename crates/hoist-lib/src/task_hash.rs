//! Fingerprint computation for leaf tasks, and the tracker that carries
//! finished fingerprints to dependent tasks.

use std::{collections::HashMap, io, sync::Arc};

use camino::Utf8Path;
use hoist_engine::{Engine, LeafTask};
use hoist_hash::{Fingerprint, TaskHashable, ToolchainIdentity};
use hoist_task_id::TaskId;
use parking_lot::Mutex;

use crate::handlers::{executable_name, HandlerRegistry};

/// Fingerprints of completed tasks, shared across worker threads. A task's
/// fingerprint is recorded before it runs (or is restored), so by the time a
/// dependent is scheduled every strong dependency has an entry.
#[derive(Debug, Clone, Default)]
pub struct TaskHashTracker {
    inner: Arc<Mutex<HashMap<TaskId<'static>, Fingerprint>>>,
}

impl TaskHashTracker {
    pub fn insert(&self, task_id: TaskId<'static>, fingerprint: Fingerprint) {
        self.inner.lock().insert(task_id, fingerprint);
    }

    pub fn get(&self, task_id: &TaskId) -> Option<Fingerprint> {
        self.inner.lock().get(task_id).cloned()
    }
}

/// Everything computed while hashing one task: the fingerprint itself plus
/// the hashed inputs, which the cache layer reuses for the entry manifest.
#[derive(Debug, Clone)]
pub struct TaskHashResult {
    pub fingerprint: Fingerprint,
    pub inputs: Vec<(String, String)>,
}

pub struct TaskHasher<'a> {
    workspace_root: &'a Utf8Path,
    toolchain: &'a ToolchainIdentity,
    lockfile_hash: &'a str,
    registry: &'a HandlerRegistry,
    tracker: TaskHashTracker,
}

impl<'a> TaskHasher<'a> {
    pub fn new(
        workspace_root: &'a Utf8Path,
        toolchain: &'a ToolchainIdentity,
        lockfile_hash: &'a str,
        registry: &'a HandlerRegistry,
    ) -> Self {
        Self {
            workspace_root,
            toolchain,
            lockfile_hash,
            registry,
            tracker: TaskHashTracker::default(),
        }
    }

    pub fn tracker(&self) -> TaskHashTracker {
        self.tracker.clone()
    }

    /// Compute a task's fingerprint. Every strong dependency must already
    /// have a tracked fingerprint; the scheduler guarantees this by hashing
    /// tasks only after their strong predecessors reached terminal success.
    pub fn hash_task(&self, engine: &Engine, leaf: &LeafTask) -> io::Result<TaskHashResult> {
        let package_root = self.workspace_root.join(&leaf.package_dir);
        let handler = self.registry.handler_for(&leaf.command);

        let inputs = handler.discover_inputs(&package_root, &leaf.inputs, &leaf.outputs)?;

        let mut dependencies: Vec<(String, Fingerprint)> = Vec::new();
        for dependency in engine.strong_dependencies(&leaf.task_id) {
            let fingerprint = self
                .tracker
                .get(dependency)
                .expect("strong dependencies are hashed before their dependents");
            dependencies.push((dependency.to_string(), fingerprint));
        }

        // Handler extras fold into the command record so tool-specific
        // normalization (flag order, resolved config) affects the key.
        let mut command = leaf.command.clone();
        for extra in handler.command_fingerprint_extras(&leaf.command) {
            command.push('\u{1f}');
            command.push_str(&extra);
        }

        let fingerprint = TaskHashable {
            toolchain: self.toolchain,
            lockfile_hash: self.lockfile_hash,
            package: leaf.task_id.package(),
            task: leaf.task_id.task(),
            executable: &executable_name(&leaf.command),
            command: &command,
            inputs: &inputs,
            dependencies: &dependencies,
        }
        .hash();

        self.tracker.insert(leaf.task_id.clone(), fingerprint.clone());
        Ok(TaskHashResult {
            fingerprint,
            inputs,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tracker_is_send_and_sync() {
        // Worker threads both read and write the tracker concurrently.
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<TaskHashTracker>();
        assert_sync::<TaskHashTracker>();
    }

    #[test]
    fn test_tracker_round_trip() {
        let tracker = TaskHashTracker::default();
        let task_id = TaskId::new("pkg", "build").into_owned();
        assert!(tracker.get(&task_id).is_none());

        let fingerprint = Fingerprint::from_hex("a".repeat(64)).unwrap();
        tracker.insert(task_id.clone(), fingerprint.clone());
        assert_eq!(tracker.get(&task_id), Some(fingerprint));
    }
}
