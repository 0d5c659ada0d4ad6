#![deny(clippy::all)]
//! Task identifiers and the dependency-reference grammar.
//!
//! A `TaskId` pins a task to a package (`web#build`). A `DependencySpec` is
//! one parsed entry of a `dependsOn`/`before`/`after` list and may refer to
//! tasks in the same package, in direct dependency packages, or in an
//! explicitly named package.

use std::{borrow::Cow, fmt};

use serde::Serialize;

pub const TASK_DELIMITER: &str = "#";

/// A task scoped to a specific package. Renders as `package#task`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId<'a> {
    package: Cow<'a, str>,
    task: Cow<'a, str>,
}

impl<'a> TaskId<'a> {
    pub fn new(package: &'a str, task: &'a str) -> Self {
        Self {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn from_owned(package: String, task: String) -> TaskId<'static> {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn into_owned(self) -> TaskId<'static> {
        let TaskId { package, task } = self;
        TaskId {
            package: package.into_owned().into(),
            task: task.into_owned().into(),
        }
    }
}

impl fmt::Display for TaskId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TASK_DELIMITER}{}", self.package, self.task)
    }
}

impl TryFrom<&str> for TaskId<'static> {
    type Error = ReferenceError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.split_once(TASK_DELIMITER) {
            Some((package, task)) if !package.is_empty() && !task.is_empty() => {
                Ok(TaskId::from_owned(package.to_owned(), task.to_owned()))
            }
            _ => Err(ReferenceError::InvalidTaskId {
                reference: value.to_owned(),
            }),
        }
    }
}

/// One parsed entry of a task definition's dependency lists.
///
/// The grammar:
/// - `T` — task `T` in the same package
/// - `^T` — task `T` in every direct dependency package
/// - `*` — every other scheduled task in the same package (`before`/`after`
///   only)
/// - `^*` — every task in every direct dependency package
/// - `@pkg#T` — task `T` in the named package
/// - `...` — splice point for the inherited global list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencySpec {
    Task(String),
    DependencyPackages(String),
    AllSiblings,
    AllDependencyTasks,
    Package { package: String, task: String },
    Inherit,
}

pub const INHERIT_SENTINEL: &str = "...";

impl DependencySpec {
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let invalid = |reason: &str| ReferenceError::InvalidReference {
            reference: raw.to_owned(),
            reason: reason.to_owned(),
        };

        if raw == INHERIT_SENTINEL {
            return Ok(Self::Inherit);
        }
        if raw == "*" {
            return Ok(Self::AllSiblings);
        }
        if raw == "^*" {
            return Ok(Self::AllDependencyTasks);
        }
        if let Some(rest) = raw.strip_prefix('^') {
            if rest.is_empty() {
                return Err(invalid("expected a task name after `^`"));
            }
            validate_task_name(rest).map_err(|reason| invalid(&reason))?;
            return Ok(Self::DependencyPackages(rest.to_owned()));
        }
        if let Some(rest) = raw.strip_prefix('@') {
            let Some((package, task)) = rest.split_once(TASK_DELIMITER) else {
                return Err(invalid("expected `@package#task`"));
            };
            if package.is_empty() || task.is_empty() {
                return Err(invalid("expected `@package#task`"));
            }
            validate_task_name(task).map_err(|reason| invalid(&reason))?;
            return Ok(Self::Package {
                package: package.to_owned(),
                task: task.to_owned(),
            });
        }
        if raw.contains(TASK_DELIMITER) {
            return Err(invalid(
                "cross-package references must use the `@package#task` form",
            ));
        }
        validate_task_name(raw).map_err(|reason| invalid(&reason))?;
        Ok(Self::Task(raw.to_owned()))
    }

    /// True for the fan-out forms that may only appear in `before`/`after`.
    pub fn is_ordering_only(&self) -> bool {
        matches!(self, Self::AllSiblings)
    }

    /// The referenced task name, when the reference names a single task.
    pub fn task(&self) -> Option<&str> {
        match self {
            Self::Task(task) | Self::DependencyPackages(task) => Some(task),
            Self::Package { task, .. } => Some(task),
            Self::AllSiblings | Self::AllDependencyTasks | Self::Inherit => None,
        }
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(task) => f.write_str(task),
            Self::DependencyPackages(task) => write!(f, "^{task}"),
            Self::AllSiblings => f.write_str("*"),
            Self::AllDependencyTasks => f.write_str("^*"),
            Self::Package { package, task } => write!(f, "@{package}{TASK_DELIMITER}{task}"),
            Self::Inherit => f.write_str(INHERIT_SENTINEL),
        }
    }
}

fn validate_task_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("task name is empty".to_owned());
    }
    if let Some(bad) = name
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '#' | '^' | '@' | '*'))
    {
        return Err(format!("task name contains invalid character `{bad}`"));
    }
    Ok(())
}

/// Escape a task name for use as a file stem (done markers, log files).
/// Mirrors the colon-escaping used for per-task log files so that
/// `build:prod` and `build/prod` cannot collide with plain names.
pub fn task_file_stem(task: &str) -> String {
    task.chars()
        .map(|c| match c {
            ':' => "$colon$".to_owned(),
            '/' => "$slash$".to_owned(),
            '\\' => "$backslash$".to_owned(),
            c => c.to_string(),
        })
        .collect()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("invalid task reference `{reference}`: {reason}")]
    InvalidReference { reference: String, reason: String },
    #[error("invalid task id `{reference}`, expected `package#task`")]
    InvalidTaskId { reference: String },
}
