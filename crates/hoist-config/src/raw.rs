//! Raw task definitions as they appear in configuration documents.

use std::collections::BTreeMap;

use hoist_task_id::{DependencySpec, INHERIT_SENTINEL};
use serde::{Deserialize, Serialize};

use crate::{DocumentKind, Error};

pub type TaskDefinitions = BTreeMap<String, RawTaskDefinition>;

/// A task definition as written in a document. List fields are `None` when
/// omitted, which means "inherit the global list"; a present list replaces
/// the global one wholesale unless it contains the `...` sentinel, which
/// splices the inherited list in at that position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawTaskDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,
    /// Whether the task is backed by a package script. Defaults to true;
    /// grouping tasks set this to false and list `children` instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
}

impl RawTaskDefinition {
    pub fn is_script_backed(&self) -> bool {
        self.script.unwrap_or(true)
    }

    /// Merge a per-package override over the global definition of the same
    /// task name. Absent fields inherit; present list fields replace unless
    /// they contain `...`, which splices the global list in.
    pub fn merge_with_global(&self, global: &RawTaskDefinition) -> RawTaskDefinition {
        RawTaskDefinition {
            depends_on: merge_list(self.depends_on.as_ref(), global.depends_on.as_ref()),
            before: merge_list(self.before.as_ref(), global.before.as_ref()),
            after: merge_list(self.after.as_ref(), global.after.as_ref()),
            children: merge_list(self.children.as_ref(), global.children.as_ref()),
            script: self.script.or(global.script),
            inputs: merge_list(self.inputs.as_ref(), global.inputs.as_ref()),
            outputs: merge_list(self.outputs.as_ref(), global.outputs.as_ref()),
            cache: self.cache.or(global.cache),
        }
    }

    pub(crate) fn validate(&self, key_path: &str, kind: DocumentKind) -> Result<(), Error> {
        for (field, list) in [
            ("dependsOn", self.depends_on.as_ref()),
            ("before", self.before.as_ref()),
            ("after", self.after.as_ref()),
        ] {
            let Some(list) = list else { continue };
            let ordering = field != "dependsOn";
            for (index, reference) in list.iter().enumerate() {
                let entry_path = format!("{key_path}.{field}[{index}]");
                let spec =
                    DependencySpec::parse(reference).map_err(|err| Error::InvalidValue {
                        key_path: entry_path.clone(),
                        reason: err.to_string(),
                    })?;
                if spec.is_ordering_only() && !ordering {
                    return Err(Error::InvalidValue {
                        key_path: entry_path,
                        reason: "`*` may only be used in `before` or `after`".to_owned(),
                    });
                }
                if spec == DependencySpec::Inherit && kind == DocumentKind::Workspace {
                    return Err(Error::InvalidValue {
                        key_path: entry_path,
                        reason: "`...` is only valid in package-level overrides".to_owned(),
                    });
                }
            }
        }

        if let Some(children) = &self.children {
            for (index, child) in children.iter().enumerate() {
                if child != INHERIT_SENTINEL && child.chars().any(|c| c.is_whitespace()) {
                    return Err(Error::InvalidValue {
                        key_path: format!("{key_path}.children[{index}]"),
                        reason: format!("invalid child task name `{child}`"),
                    });
                }
            }
        }

        let has_children = self.children.as_ref().is_some_and(|c| !c.is_empty());
        if !self.is_script_backed() && !has_children {
            return Err(Error::InvalidValue {
                key_path: format!("{key_path}.children"),
                reason: "a grouping task must list its children".to_owned(),
            });
        }
        if self.is_script_backed() && has_children {
            return Err(Error::InvalidValue {
                key_path: format!("{key_path}.script"),
                reason: "a task with children cannot also be script-backed; set `script: false`"
                    .to_owned(),
            });
        }

        Ok(())
    }
}

fn merge_list(package: Option<&Vec<String>>, global: Option<&Vec<String>>) -> Option<Vec<String>> {
    match (package, global) {
        (None, global) => global.cloned(),
        (Some(package), None) => Some(splice(package, &[])),
        (Some(package), Some(global)) => Some(splice(package, global)),
    }
}

fn splice(package: &[String], global: &[String]) -> Vec<String> {
    if !package.iter().any(|entry| entry == INHERIT_SENTINEL) {
        return package.to_vec();
    }
    let mut merged = Vec::with_capacity(package.len() + global.len());
    for entry in package {
        if entry == INHERIT_SENTINEL {
            merged.extend(global.iter().cloned());
        } else {
            merged.push(entry.clone());
        }
    }
    merged
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn list(entries: &[&str]) -> Option<Vec<String>> {
        Some(entries.iter().map(|s| (*s).to_owned()).collect())
    }

    #[test_case(None, list(&["^build"]), list(&["^build"]) ; "absent inherits")]
    #[test_case(list(&[]), list(&["^build"]), list(&[]) ; "empty replaces")]
    #[test_case(list(&["codegen"]), list(&["^build"]), list(&["codegen"]) ; "replaces wholesale")]
    #[test_case(
        list(&["codegen", "...", "bundle"]),
        list(&["^build", "prepare"]),
        list(&["codegen", "^build", "prepare", "bundle"])
        ; "sentinel splices inherited list"
    )]
    #[test_case(list(&["..."]), None, list(&[]) ; "sentinel with no global list")]
    fn test_merge_depends_on(
        package: Option<Vec<String>>,
        global: Option<Vec<String>>,
        expected: Option<Vec<String>>,
    ) {
        let package_def = RawTaskDefinition {
            depends_on: package,
            ..Default::default()
        };
        let global_def = RawTaskDefinition {
            depends_on: global,
            ..Default::default()
        };
        let merged = package_def.merge_with_global(&global_def);
        assert_eq!(merged.depends_on, expected);
    }

    #[test]
    fn test_merge_inherits_scalars() {
        let global = RawTaskDefinition {
            script: Some(true),
            cache: Some(false),
            outputs: Some(vec!["dist/**".to_owned()]),
            ..Default::default()
        };
        let package = RawTaskDefinition::default();
        let merged = package.merge_with_global(&global);
        assert_eq!(merged.script, Some(true));
        assert_eq!(merged.cache, Some(false));
        assert_eq!(merged.outputs, Some(vec!["dist/**".to_owned()]));

        let override_cache = RawTaskDefinition {
            cache: Some(true),
            ..Default::default()
        };
        assert_eq!(override_cache.merge_with_global(&global).cache, Some(true));
    }
}
