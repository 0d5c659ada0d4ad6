//! Per-task and aggregate build reporting.

use std::time::Duration;

use hoist_cache::{CacheSource, CacheStatsSnapshot};
use hoist_hash::Fingerprint;
use hoist_task_id::TaskId;
use serde::Serialize;

use super::state::TaskState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BuildResultStatus {
    UpToDate,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub message: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId<'static>,
    pub state: TaskState,
    pub cache_source: Option<CacheSource>,
    pub fingerprint: Option<Fingerprint>,
    pub runtime: Option<Duration>,
    pub queue_wait: Option<Duration>,
    pub failure: Option<TaskFailure>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Per-task results, sorted by task id.
    pub tasks: Vec<TaskSummary>,
    pub built: usize,
    pub restored: usize,
    pub up_to_date: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Shared-store statistics for this run.
    pub cache: CacheStatsSnapshot,
    /// Local-tier hits (done-marker matches).
    pub local_hits: usize,
    pub publish_failures: usize,
    pub elapsed: Duration,
    pub queue_wait_total: Duration,
    /// Time saved across both tiers, from recorded original runtimes.
    pub time_saved_ms: u64,
}

impl RunSummary {
    /// Any failure makes the build `Failed`; otherwise actually running
    /// something makes it `Success`; a build that only hit caches (or had
    /// nothing to do) is `UpToDate`.
    pub fn result(&self) -> BuildResultStatus {
        if self.failed > 0 {
            BuildResultStatus::Failed
        } else if self.built > 0 {
            BuildResultStatus::Success
        } else {
            BuildResultStatus::UpToDate
        }
    }

    /// One line per failed task, stderr attached, for the failure report.
    pub fn failure_lines(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter_map(|task| {
                let failure = task.failure.as_ref()?;
                let mut line = format!("{}: {}", task.task_id, failure.message);
                let stderr = failure.stderr.trim();
                if !stderr.is_empty() {
                    line.push('\n');
                    for stderr_line in stderr.lines() {
                        line.push_str("  ");
                        line.push_str(stderr_line);
                        line.push('\n');
                    }
                    line.pop();
                }
                Some(line)
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn summary(built: usize, failed: usize) -> RunSummary {
        RunSummary {
            tasks: Vec::new(),
            built,
            restored: 0,
            up_to_date: 0,
            failed,
            skipped: 0,
            cache: CacheStatsSnapshot::default(),
            local_hits: 0,
            publish_failures: 0,
            elapsed: Duration::ZERO,
            queue_wait_total: Duration::ZERO,
            time_saved_ms: 0,
        }
    }

    #[test]
    fn test_result_precedence() {
        assert_eq!(summary(0, 0).result(), BuildResultStatus::UpToDate);
        assert_eq!(summary(2, 0).result(), BuildResultStatus::Success);
        assert_eq!(summary(2, 1).result(), BuildResultStatus::Failed);
    }

    #[test]
    fn test_failure_lines_include_stderr() {
        let mut summary = summary(1, 1);
        summary.tasks.push(TaskSummary {
            task_id: TaskId::new("web", "build").into_owned(),
            state: TaskState::Failed,
            cache_source: None,
            fingerprint: None,
            runtime: None,
            queue_wait: None,
            failure: Some(TaskFailure {
                message: "exited with code 1".to_owned(),
                exit_code: Some(1),
                stderr: "error TS2304: Cannot find name 'foo'.\n".to_owned(),
            }),
        });
        let lines = summary.failure_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("web#build: exited with code 1"));
        assert!(lines[0].contains("TS2304"));
    }
}
