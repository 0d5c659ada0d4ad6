//! The cache integration layer: one decision procedure per task.
//!
//! Order of consultation: the local done marker (with outputs verified on
//! disk), then the shared store (restore + marker rewrite), then execution.
//! Publication after a successful run feeds both tiers.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use hoist_cache::{
    compute_outputs_digest, outputs_digest_from_pairs, CacheError, CacheHitMetadata, CacheManifest,
    CacheSource, DoneMarker, DoneMarkerStore, InputDescriptor, OutputDescriptor, RestoreOutcome,
    SharedStore,
};
use hoist_engine::LeafTask;
use hoist_hash::Fingerprint;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum CacheProbe {
    /// The local done marker matches and every recorded output is intact.
    UpToDate(CacheHitMetadata),
    /// The shared store had the entry; outputs were restored and the done
    /// marker rewritten.
    Restored {
        metadata: CacheHitMetadata,
        outcome: RestoreOutcome,
    },
    Miss,
}

#[derive(Debug)]
pub struct RunCache {
    markers: DoneMarkerStore,
    store: SharedStore,
    workspace_root: Utf8PathBuf,
    /// When set, cache reads are skipped entirely; successful runs still
    /// publish.
    force: bool,
}

impl RunCache {
    pub fn new(
        workspace_root: &Utf8Path,
        store_root: &Utf8Path,
        force: bool,
    ) -> Result<Self, CacheError> {
        Ok(Self {
            markers: DoneMarkerStore::new(workspace_root),
            store: SharedStore::new(store_root)?,
            workspace_root: workspace_root.to_owned(),
            force,
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn task_cache<'a>(&'a self, leaf: &'a LeafTask, fingerprint: Fingerprint) -> TaskCache<'a> {
        TaskCache {
            run_cache: self,
            leaf,
            package_root: self.workspace_root.join(&leaf.package_dir),
            fingerprint,
        }
    }
}

pub struct TaskCache<'a> {
    run_cache: &'a RunCache,
    leaf: &'a LeafTask,
    package_root: Utf8PathBuf,
    fingerprint: Fingerprint,
}

impl TaskCache<'_> {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// The per-task decision procedure. Never fails the build: every
    /// corruption path degrades to `Miss`.
    pub fn probe(&self) -> CacheProbe {
        if self.run_cache.force {
            return CacheProbe::Miss;
        }

        if let Some(metadata) = self.local_hit() {
            return CacheProbe::UpToDate(metadata);
        }

        match self.run_cache.store.get(&self.fingerprint) {
            Ok(Some(entry)) => {
                match self.run_cache.store.restore(&entry, &self.package_root) {
                    Ok(outcome) => {
                        let manifest = entry.manifest();
                        self.write_marker_from_manifest(manifest);
                        CacheProbe::Restored {
                            metadata: CacheHitMetadata {
                                source: CacheSource::Shared,
                                time_saved: manifest.original_runtime_ms,
                            },
                            outcome,
                        }
                    }
                    Err(error) => {
                        warn!(
                            "cache entry {} failed to restore, rebuilding {}: {error}",
                            self.fingerprint, self.leaf.task_id
                        );
                        self.run_cache.store.stats().record_miss();
                        CacheProbe::Miss
                    }
                }
            }
            Ok(None) => CacheProbe::Miss,
            Err(error) => {
                warn!(
                    "shared store probe failed for {}, rebuilding: {error}",
                    self.leaf.task_id
                );
                self.run_cache.store.stats().record_miss();
                CacheProbe::Miss
            }
        }
    }

    /// The fast path: done marker present, fingerprint equal, and every
    /// recorded output still on disk with matching content.
    fn local_hit(&self) -> Option<CacheHitMetadata> {
        let marker = self
            .run_cache
            .markers
            .read(&self.leaf.package_dir, self.leaf.task_id.task())?;
        if marker.fingerprint != self.fingerprint {
            return None;
        }
        let digest = match compute_outputs_digest(&self.package_root, &marker.outputs) {
            Ok(digest) => digest,
            Err(error) => {
                debug!(
                    "done marker for {} lists missing outputs ({error}); ignoring it",
                    self.leaf.task_id
                );
                return None;
            }
        };
        if marker.outputs_digest.as_deref() != Some(digest.as_str()) {
            debug!(
                "outputs of {} changed since its last run; ignoring done marker",
                self.leaf.task_id
            );
            return None;
        }
        Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: marker.original_runtime_ms.unwrap_or(0),
        })
    }

    fn write_marker_from_manifest(&self, manifest: &CacheManifest) {
        let outputs: Vec<String> = manifest
            .outputs
            .iter()
            .map(|output| output.path.clone())
            .collect();
        let digest = outputs_digest_from_pairs(
            manifest
                .outputs
                .iter()
                .map(|output| (output.path.as_str(), output.hash.as_str())),
        );
        let marker = DoneMarker {
            fingerprint: self.fingerprint.clone(),
            outputs,
            outputs_digest: Some(digest),
            original_runtime_ms: Some(manifest.original_runtime_ms),
        };
        if let Err(error) =
            self.run_cache
                .markers
                .write(&self.leaf.package_dir, self.leaf.task_id.task(), &marker)
        {
            warn!(
                "failed to write done marker for {}: {error}",
                self.leaf.task_id
            );
        }
    }

    /// Publish a successful run to both tiers. Errors are reported to the
    /// caller for statistics; the task outcome is unaffected.
    pub fn publish(
        &self,
        inputs: &[(String, String)],
        output_paths: &[String],
        runtime: Duration,
    ) -> Result<(), CacheError> {
        let outputs: Vec<OutputDescriptor> = output_paths
            .iter()
            .map(|path| OutputDescriptor::for_file(&self.package_root, path))
            .collect::<Result<_, _>>()?;
        let manifest = CacheManifest {
            fingerprint: self.fingerprint.clone(),
            inputs: inputs
                .iter()
                .map(|(path, hash)| InputDescriptor {
                    path: path.clone(),
                    hash: hash.clone(),
                })
                .collect(),
            outputs,
            original_runtime_ms: runtime.as_millis() as u64,
        };
        self.run_cache.store.put(&self.package_root, &manifest)?;

        let digest = outputs_digest_from_pairs(
            manifest
                .outputs
                .iter()
                .map(|output| (output.path.as_str(), output.hash.as_str())),
        );
        self.run_cache.markers.write(
            &self.leaf.package_dir,
            self.leaf.task_id.task(),
            &DoneMarker {
                fingerprint: self.fingerprint.clone(),
                outputs: output_paths.to_vec(),
                outputs_digest: Some(digest),
                original_runtime_ms: Some(manifest.original_runtime_ms),
            },
        )?;
        Ok(())
    }

    /// Peek at both tiers without restoring anything. Used by dry runs.
    pub fn peek(&self) -> Option<CacheSource> {
        if self.local_hit().is_some() {
            return Some(CacheSource::Local);
        }
        self.run_cache
            .store
            .peek(&self.fingerprint)
            .map(|metadata| metadata.source)
    }
}
