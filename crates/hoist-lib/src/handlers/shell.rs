//! The generic handler: definition globs decide everything, with a
//! walk-everything default when a task declares no inputs.

use std::io;

use camino::Utf8Path;
use globset::{Glob, GlobSet, GlobSetBuilder};
use hoist_cache::TASK_STATE_DIR;
use ignore::WalkBuilder;

use super::TaskHandler;

/// Directories never considered task inputs.
const ALWAYS_EXCLUDED: &[&str] = &[TASK_STATE_DIR, "node_modules", ".git"];

#[derive(Debug, Default, Clone, Copy)]
pub struct ShellHandler;

impl TaskHandler for ShellHandler {
    fn discover_inputs(
        &self,
        package_root: &Utf8Path,
        inputs: &[String],
        outputs: &[String],
    ) -> io::Result<Vec<(String, String)>> {
        hash_matching_files(package_root, inputs, outputs)
    }

    fn discover_outputs(&self, outputs: &[String]) -> Vec<String> {
        outputs.to_vec()
    }
}

/// Walk the package directory and hash every file matched by `includes`
/// (every file, when empty), skipping task-state directories and anything
/// matched by `excludes`. Results are sorted by path.
pub(crate) fn hash_matching_files(
    package_root: &Utf8Path,
    includes: &[String],
    excludes: &[String],
) -> io::Result<Vec<(String, String)>> {
    let includes = build_glob_set(includes)?;
    let excludes = build_glob_set(excludes)?;

    let mut entries = Vec::new();
    for candidate in walk_files(package_root)? {
        if let Some(includes) = &includes {
            if !includes.is_match(&candidate) {
                continue;
            }
        }
        if let Some(excludes) = &excludes {
            if excludes.is_match(&candidate) {
                continue;
            }
        }
        let hash = hoist_hash::hash_file(package_root.join(&candidate).as_std_path())?;
        entries.push((candidate, hash));
    }
    entries.sort();
    Ok(entries)
}

/// Expand output globs into the concrete package-relative files currently on
/// disk. Used after a task runs to enumerate what it produced.
pub fn expand_globs(package_root: &Utf8Path, globs: &[String]) -> io::Result<Vec<String>> {
    if globs.is_empty() {
        return Ok(Vec::new());
    }
    let includes = build_glob_set(globs)?;
    let mut matches = Vec::new();
    for candidate in walk_files(package_root)? {
        if includes
            .as_ref()
            .is_some_and(|includes| includes.is_match(&candidate))
        {
            matches.push(candidate);
        }
    }
    matches.sort();
    Ok(matches)
}

fn walk_files(package_root: &Utf8Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = WalkBuilder::new(package_root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !ALWAYS_EXCLUDED.contains(&name.as_ref())
        })
        .build();

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_some_and(|ty| ty.is_file()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(package_root.as_std_path()) else {
            continue;
        };
        let Some(relative) = relative.to_str() else {
            // Non-UTF-8 paths can't appear in manifests; skip them.
            continue;
        };
        files.push(relative.replace('\\', "/"));
    }
    files.sort();
    Ok(files)
}

fn build_glob_set(globs: &[String]) -> io::Result<Option<GlobSet>> {
    if globs.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for glob in globs {
        builder.add(Glob::new(glob).map_err(io::Error::other)?);
    }
    Ok(Some(builder.build().map_err(io::Error::other)?))
}
