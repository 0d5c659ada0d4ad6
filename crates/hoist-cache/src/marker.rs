//! Done markers: the fast local up-to-date tier.
//!
//! A marker is one small JSON file per leaf task under the package's
//! `.hoist/` directory, written only after the task completed successfully.
//! A marker whose fingerprint equals the task's current fingerprint means
//! this exact task already ran to success on this machine.

use camino::{Utf8Path, Utf8PathBuf};
use hoist_hash::Fingerprint;
use hoist_task_id::task_file_stem;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::CacheError;

/// Directory inside each package that holds hoist's per-task state (done
/// markers and captured task logs).
pub const TASK_STATE_DIR: &str = ".hoist";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneMarker {
    pub fingerprint: Fingerprint,
    /// Package-relative paths of the outputs the run produced.
    pub outputs: Vec<String>,
    /// Combined content hash of the outputs, used to detect outputs that
    /// were edited or deleted since the marker was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs_digest: Option<String>,
    /// Wall-clock runtime of the recorded run, for time-saved statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_runtime_ms: Option<u64>,
}

/// Hash the current on-disk contents of a set of outputs into a single
/// digest comparable with [`DoneMarker::outputs_digest`]. Fails if any
/// listed file is missing.
pub fn compute_outputs_digest(
    package_root: &Utf8Path,
    outputs: &[String],
) -> std::io::Result<String> {
    let mut entries: Vec<(String, String)> = outputs
        .iter()
        .map(|path| {
            let hash = hoist_hash::hash_file(package_root.join(path).as_std_path())?;
            Ok((path.clone(), hash))
        })
        .collect::<std::io::Result<_>>()?;
    entries.sort();
    Ok(hoist_hash::hash_fields(
        entries
            .iter()
            .flat_map(|(path, hash)| [path.as_str(), hash.as_str()]),
    ))
}

/// The same digest computed from already-known `(path, hash)` pairs, e.g. a
/// shared-store manifest.
pub fn outputs_digest_from_pairs<'a>(
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> String {
    let mut entries: Vec<(&str, &str)> = pairs.into_iter().collect();
    entries.sort();
    hoist_hash::hash_fields(entries.iter().flat_map(|(path, hash)| [*path, *hash]))
}

#[derive(Debug, Clone)]
pub struct DoneMarkerStore {
    workspace_root: Utf8PathBuf,
}

impl DoneMarkerStore {
    pub fn new(workspace_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    pub fn marker_path(&self, package_dir: &Utf8Path, task: &str) -> Utf8PathBuf {
        self.workspace_root
            .join(package_dir)
            .join(TASK_STATE_DIR)
            .join(format!("done-{}.json", task_file_stem(task)))
    }

    /// Read the marker for a task. Absence and malformed contents both read
    /// as `None`; a malformed marker is logged and treated as never-ran.
    pub fn read(&self, package_dir: &Utf8Path, task: &str) -> Option<DoneMarker> {
        let path = self.marker_path(package_dir, task);
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(marker) => Some(marker),
            Err(error) => {
                warn!("ignoring malformed done marker at {path}: {error}");
                None
            }
        }
    }

    /// Atomically persist a marker: write to a temp file in the same
    /// directory, then rename into place.
    pub fn write(
        &self,
        package_dir: &Utf8Path,
        task: &str,
        marker: &DoneMarker,
    ) -> Result<(), CacheError> {
        let path = self.marker_path(package_dir, task);
        let dir = path.parent().expect("marker path always has a parent");
        std::fs::create_dir_all(dir)?;

        let contents = serde_json::to_string_pretty(marker).map_err(CacheError::InvalidMetadata)?;
        let temp = dir.join(format!(
            ".done-{}.{}.tmp",
            task_file_stem(task),
            std::process::id()
        ));
        std::fs::write(&temp, contents)?;
        std::fs::rename(&temp, &path)?;
        Ok(())
    }

    pub fn remove(&self, package_dir: &Utf8Path, task: &str) -> Result<(), CacheError> {
        let path = self.marker_path(package_dir, task);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
