//! Per-task lifecycle.
//!
//! ```text
//! Pending -> Ready -> UpToDate
//!                  -> Running -> Succeeded
//!                             -> Failed
//! Pending -> Skipped            (a transitive strong predecessor failed)
//! ```

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    #[default]
    Pending,
    Ready,
    Running,
    UpToDate,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::UpToDate | TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }

    /// The states that satisfy a strong predecessor requirement.
    pub fn is_terminal_success(self) -> bool {
        matches!(self, TaskState::UpToDate | TaskState::Succeeded)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Ready)
                | (TaskState::Pending, TaskState::Skipped)
                | (TaskState::Ready, TaskState::UpToDate)
                | (TaskState::Ready, TaskState::Running)
                | (TaskState::Ready, TaskState::Skipped)
                | (TaskState::Ready, TaskState::Failed)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Failed)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::UpToDate => "up-to-date",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        };
        f.write_str(name)
    }
}
