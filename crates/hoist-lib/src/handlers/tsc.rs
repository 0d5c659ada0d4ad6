//! Handler for TypeScript compilations.
//!
//! Two tsc-specific concerns: the project file is always an input even when
//! the task's input globs don't cover it, and incremental builds leave
//! `.tsbuildinfo` sidecars whose recorded timestamps must travel with the
//! outputs. The sidecars are declared as outputs so a cache restore brings
//! them back in the same state the original build left them.

use std::io;

use camino::Utf8Path;

use super::{shell::hash_matching_files, TaskHandler};

const PROJECT_FILES: &[&str] = &["tsconfig.json", "tsconfig.build.json"];
const SIDECAR_GLOBS: &[&str] = &["*.tsbuildinfo", "**/*.tsbuildinfo"];

#[derive(Debug, Default, Clone, Copy)]
pub struct TscHandler;

impl TaskHandler for TscHandler {
    fn discover_inputs(
        &self,
        package_root: &Utf8Path,
        inputs: &[String],
        outputs: &[String],
    ) -> io::Result<Vec<(String, String)>> {
        let mut entries = hash_matching_files(package_root, inputs, outputs)?;
        for project_file in PROJECT_FILES {
            let path = package_root.join(project_file);
            if path.is_file() && !entries.iter().any(|(existing, _)| existing == project_file) {
                let hash = hoist_hash::hash_file(path.as_std_path())?;
                entries.push(((*project_file).to_owned(), hash));
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn discover_outputs(&self, outputs: &[String]) -> Vec<String> {
        let mut outputs = outputs.to_vec();
        for sidecar in SIDECAR_GLOBS {
            if !outputs.iter().any(|existing| existing == sidecar) {
                outputs.push((*sidecar).to_owned());
            }
        }
        outputs
    }

    /// Sorted flags, so `tsc -p . --build` and `tsc --build -p .` share a
    /// fingerprint.
    fn command_fingerprint_extras(&self, command: &str) -> Vec<String> {
        let mut flags: Vec<String> = command
            .split_whitespace()
            .skip(1)
            .filter(|token| token.starts_with('-'))
            .map(str::to_owned)
            .collect();
        flags.sort();
        flags
    }
}
