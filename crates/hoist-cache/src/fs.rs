//! The content-addressed shared store.
//!
//! Layout: `<storeRoot>/<fingerprint>/manifest.json` plus the output files
//! preserving their package-relative paths. Publication is atomic: an entry
//! is assembled in a temp directory and renamed into place, so readers never
//! observe a half-written entry.

use std::{
    io::{Read, Write},
    sync::atomic::{AtomicU64, Ordering},
};

use camino::{Utf8Path, Utf8PathBuf};
use filetime::FileTime;
use hoist_hash::Fingerprint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{CacheError, CacheHitMetadata, CacheSource, CacheStats};

pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDescriptor {
    pub path: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDescriptor {
    pub path: String,
    pub size: u64,
    pub hash: String,
    /// Modification time of the file when it was published, preserved on
    /// restore so incremental compilers don't see outputs newer than their
    /// own bookkeeping files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime_ms: Option<i64>,
}

impl OutputDescriptor {
    /// Describe a file on disk, hashing its contents.
    pub fn for_file(anchor: &Utf8Path, path: &str) -> Result<Self, CacheError> {
        let absolute = anchor.join(path);
        let metadata = std::fs::metadata(&absolute)?;
        let hash = hoist_hash::hash_file(absolute.as_std_path())?;
        let mtime = FileTime::from_last_modification_time(&metadata);
        let mtime_ms = mtime.unix_seconds() * 1000 + i64::from(mtime.nanoseconds()) / 1_000_000;
        Ok(Self {
            path: path.to_owned(),
            size: metadata.len(),
            hash,
            mtime_ms: Some(mtime_ms),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    pub fingerprint: Fingerprint,
    pub inputs: Vec<InputDescriptor>,
    pub outputs: Vec<OutputDescriptor>,
    pub original_runtime_ms: u64,
}

/// A validated entry handle returned by [`SharedStore::get`].
#[derive(Debug)]
pub struct CacheEntry {
    dir: Utf8PathBuf,
    manifest: CacheManifest,
}

impl CacheEntry {
    pub fn manifest(&self) -> &CacheManifest {
        &self.manifest
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub files: Vec<String>,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct SharedStore {
    root: Utf8PathBuf,
    stats: CacheStats,
}

impl SharedStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            stats: CacheStats::default(),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn entry_dir(&self, fingerprint: &Fingerprint) -> Utf8PathBuf {
        self.root.join(fingerprint.as_str())
    }

    /// Publish an entry. The outputs listed in the manifest are copied from
    /// `anchor` (the package directory) into a temp directory which is then
    /// renamed into place. An existing entry for the same fingerprint is
    /// replaced, which is how corrupt entries get healed on the next build.
    pub fn put(&self, anchor: &Utf8Path, manifest: &CacheManifest) -> Result<(), CacheError> {
        // The sequence number keeps concurrent writers within one process
        // from staging into the same directory.
        static STAGING_SEQUENCE: AtomicU64 = AtomicU64::new(0);
        let staging = self.root.join(format!(
            ".{}-{}-{}.tmp",
            manifest.fingerprint,
            std::process::id(),
            STAGING_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        ));
        let result = self.stage_entry(&staging, anchor, manifest);
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&staging);
            return result;
        }

        let entry_dir = self.entry_dir(&manifest.fingerprint);
        let mut last_error = None;
        for _ in 0..5 {
            if entry_dir.exists() {
                let _ = std::fs::remove_dir_all(&entry_dir);
            }
            match std::fs::rename(&staging, &entry_dir) {
                Ok(()) => {
                    debug!(
                        "published cache entry {} ({} outputs)",
                        manifest.fingerprint,
                        manifest.outputs.len()
                    );
                    return Ok(());
                }
                // Another writer renamed its entry in between our removal
                // and rename. Retry; last writer wins.
                Err(error) => last_error = Some(error),
            }
        }
        let _ = std::fs::remove_dir_all(&staging);
        Err(last_error.expect("rename attempted at least once").into())
    }

    fn stage_entry(
        &self,
        staging: &Utf8Path,
        anchor: &Utf8Path,
        manifest: &CacheManifest,
    ) -> Result<(), CacheError> {
        std::fs::create_dir_all(staging)?;
        for output in &manifest.outputs {
            let relative = validated_relative_path(&output.path)?;
            let source = anchor.join(relative);
            let destination = staging.join(relative);
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, &destination)?;
            if let Some(mtime_ms) = output.mtime_ms {
                set_mtime(&destination, mtime_ms)?;
            }
        }
        let manifest_json =
            serde_json::to_string_pretty(manifest).map_err(CacheError::InvalidMetadata)?;
        let mut file = std::fs::File::create(staging.join(MANIFEST_NAME))?;
        file.write_all(manifest_json.as_bytes())?;
        Ok(())
    }

    /// Probe for an entry. Returns `None` — and counts a miss — when the
    /// entry is absent or fails integrity checks (missing or unparsable
    /// manifest, missing declared file, size mismatch). The entry directory
    /// is the only authoritative storage; nothing outside it is touched.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
        let dir = self.entry_dir(fingerprint);
        if !dir.is_dir() {
            self.stats.record_miss();
            return Ok(None);
        }

        let manifest_path = dir.join(MANIFEST_NAME);
        let contents = match std::fs::read_to_string(&manifest_path) {
            Ok(contents) => contents,
            Err(error) => {
                warn!("cache entry {fingerprint} has no readable manifest: {error}");
                self.stats.record_miss();
                return Ok(None);
            }
        };
        let manifest: CacheManifest = match serde_json::from_str(&contents) {
            Ok(manifest) => manifest,
            Err(error) => {
                warn!("cache entry {fingerprint} has a malformed manifest: {error}");
                self.stats.record_miss();
                return Ok(None);
            }
        };

        for output in &manifest.outputs {
            let relative = match validated_relative_path(&output.path) {
                Ok(relative) => relative,
                Err(error) => {
                    warn!("cache entry {fingerprint} is invalid: {error}");
                    self.stats.record_miss();
                    return Ok(None);
                }
            };
            let file = dir.join(relative);
            match std::fs::metadata(&file) {
                Ok(metadata) if metadata.len() == output.size => {}
                Ok(metadata) => {
                    warn!(
                        "cache entry {fingerprint} has a size mismatch for {}: expected {}, \
                         found {}",
                        output.path,
                        output.size,
                        metadata.len()
                    );
                    self.stats.record_miss();
                    return Ok(None);
                }
                Err(_) => {
                    warn!(
                        "cache entry {fingerprint} is missing declared output {}",
                        output.path
                    );
                    self.stats.record_miss();
                    return Ok(None);
                }
            }
        }

        Ok(Some(CacheEntry { dir, manifest }))
    }

    /// Restore an entry's outputs into the package directory, creating
    /// directories as needed and re-applying recorded modification times.
    /// Contents are verified against the manifest hashes while copying; a
    /// mismatch aborts with an error the caller treats as a miss.
    pub fn restore(
        &self,
        entry: &CacheEntry,
        package_root: &Utf8Path,
    ) -> Result<RestoreOutcome, CacheError> {
        let mut outcome = RestoreOutcome::default();
        for output in &entry.manifest.outputs {
            let relative = validated_relative_path(&output.path)?;
            let source = entry.dir.join(relative);
            let destination = package_root.join(relative);
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let (bytes, hash) = copy_hashing(&source, &destination)?;
            if hash != output.hash {
                return Err(CacheError::HashMismatch {
                    path: output.path.clone(),
                });
            }
            if let Some(mtime_ms) = output.mtime_ms {
                set_mtime(&destination, mtime_ms)?;
            }
            outcome.bytes += bytes;
            outcome.files.push(output.path.clone());
        }

        self.stats
            .record_hit(outcome.bytes, entry.manifest.original_runtime_ms);
        Ok(outcome)
    }

    /// Cheap existence probe that does not count toward hit/miss statistics.
    /// Used by dry runs.
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<CacheHitMetadata> {
        let manifest_path = self.entry_dir(fingerprint).join(MANIFEST_NAME);
        let contents = std::fs::read_to_string(manifest_path).ok()?;
        let manifest: CacheManifest = serde_json::from_str(&contents).ok()?;
        Some(CacheHitMetadata {
            source: CacheSource::Shared,
            time_saved: manifest.original_runtime_ms,
        })
    }
}

fn validated_relative_path(path: &str) -> Result<&Utf8Path, CacheError> {
    let relative = Utf8Path::new(path);
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, camino::Utf8Component::ParentDir | camino::Utf8Component::Prefix(_)));
    if escapes || path.is_empty() {
        return Err(CacheError::PathEscape {
            path: path.to_owned(),
        });
    }
    Ok(relative)
}

fn copy_hashing(source: &Utf8Path, destination: &Utf8Path) -> Result<(u64, String), CacheError> {
    let mut reader = std::fs::File::open(source)?;
    let mut writer = std::fs::File::create(destination)?;
    let mut digest = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        digest.update(&buffer[..read]);
        writer.write_all(&buffer[..read])?;
        total += read as u64;
    }
    Ok((total, hex::encode(digest.finalize())))
}

fn set_mtime(path: &Utf8Path, mtime_ms: i64) -> Result<(), CacheError> {
    let seconds = mtime_ms.div_euclid(1000);
    let nanos = (mtime_ms.rem_euclid(1000) * 1_000_000) as u32;
    filetime::set_file_mtime(path.as_std_path(), FileTime::from_unix_time(seconds, nanos))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn fingerprint(fill: char) -> Fingerprint {
        Fingerprint::from_hex(fill.to_string().repeat(64)).unwrap()
    }

    fn utf8(path: &std::path::Path) -> &Utf8Path {
        Utf8Path::from_path(path).unwrap()
    }

    fn write_package_file(package: &Utf8Path, path: &str, contents: &str) {
        let file = package.join(path);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(file, contents).unwrap();
    }

    fn manifest_for(
        package: &Utf8Path,
        fill: char,
        paths: &[&str],
        runtime_ms: u64,
    ) -> CacheManifest {
        CacheManifest {
            fingerprint: fingerprint(fill),
            inputs: vec![],
            outputs: paths
                .iter()
                .map(|path| OutputDescriptor::for_file(package, path).unwrap())
                .collect(),
            original_runtime_ms: runtime_ms,
        }
    }

    #[test]
    fn test_put_get_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let package = root.join("pkg");
        write_package_file(&package, "dist/index.js", "console.log('hi')");
        write_package_file(&package, "dist/nested/util.js", "util");

        let store = SharedStore::new(root.join("store")).unwrap();
        let manifest = manifest_for(
            &package,
            'a',
            &["dist/index.js", "dist/nested/util.js"],
            1200,
        );
        store.put(&package, &manifest).unwrap();

        // Wipe the outputs, then restore them from the store.
        std::fs::remove_dir_all(package.join("dist")).unwrap();
        let entry = store.get(&fingerprint('a')).unwrap().unwrap();
        assert_eq!(entry.manifest(), &manifest);

        let outcome = store.restore(&entry, &package).unwrap();
        assert_eq!(outcome.files.len(), 2);
        assert_eq!(
            std::fs::read_to_string(package.join("dist/index.js")).unwrap(),
            "console.log('hi')"
        );
        assert_eq!(
            std::fs::read_to_string(package.join("dist/nested/util.js")).unwrap(),
            "util"
        );

        let stats = store.stats().snapshot();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.time_saved_ms, 1200);
        assert!(stats.bytes_restored > 0);
    }

    #[test]
    fn test_restore_preserves_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let package = root.join("pkg");
        write_package_file(&package, "dist/out.js", "x");
        // Pin a known mtime before publishing.
        filetime::set_file_mtime(
            package.join("dist/out.js").as_std_path(),
            FileTime::from_unix_time(1_500_000_000, 0),
        )
        .unwrap();

        let store = SharedStore::new(root.join("store")).unwrap();
        let manifest = manifest_for(&package, 'a', &["dist/out.js"], 0);
        store.put(&package, &manifest).unwrap();

        std::fs::remove_dir_all(package.join("dist")).unwrap();
        let entry = store.get(&fingerprint('a')).unwrap().unwrap();
        store.restore(&entry, &package).unwrap();

        let metadata = std::fs::metadata(package.join("dist/out.js")).unwrap();
        let restored = FileTime::from_last_modification_time(&metadata);
        assert_eq!(restored.unix_seconds(), 1_500_000_000);
    }

    #[test]
    fn test_missing_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStore::new(utf8(dir.path()).join("store")).unwrap();
        assert!(store.get(&fingerprint('a')).unwrap().is_none());
        assert_eq!(store.stats().snapshot().misses, 1);
    }

    #[test]
    fn test_truncated_manifest_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let package = root.join("pkg");
        write_package_file(&package, "out.txt", "data");

        let store = SharedStore::new(root.join("store")).unwrap();
        let manifest = manifest_for(&package, 'a', &["out.txt"], 0);
        store.put(&package, &manifest).unwrap();

        let manifest_path = store.root().join(fingerprint('a').as_str()).join(MANIFEST_NAME);
        let full = std::fs::read_to_string(&manifest_path).unwrap();
        std::fs::write(&manifest_path, &full[..full.len() / 2]).unwrap();

        assert!(store.get(&fingerprint('a')).unwrap().is_none());
        assert_eq!(store.stats().snapshot().misses, 1);
    }

    #[test]
    fn test_size_mismatch_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let package = root.join("pkg");
        write_package_file(&package, "out.txt", "data");

        let store = SharedStore::new(root.join("store")).unwrap();
        let manifest = manifest_for(&package, 'a', &["out.txt"], 0);
        store.put(&package, &manifest).unwrap();

        let stored = store.root().join(fingerprint('a').as_str()).join("out.txt");
        std::fs::write(&stored, "tampered with").unwrap();

        assert!(store.get(&fingerprint('a')).unwrap().is_none());
    }

    #[test]
    fn test_put_replaces_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let package = root.join("pkg");
        write_package_file(&package, "out.txt", "first");

        let store = SharedStore::new(root.join("store")).unwrap();
        store
            .put(&package, &manifest_for(&package, 'a', &["out.txt"], 0))
            .unwrap();

        write_package_file(&package, "out.txt", "second");
        store
            .put(&package, &manifest_for(&package, 'a', &["out.txt"], 0))
            .unwrap();

        std::fs::remove_file(package.join("out.txt")).unwrap();
        let entry = store.get(&fingerprint('a')).unwrap().unwrap();
        store.restore(&entry, &package).unwrap();
        assert_eq!(
            std::fs::read_to_string(package.join("out.txt")).unwrap(),
            "second"
        );
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let package = root.join("pkg");
        write_package_file(&package, "out.txt", "data");

        let store = SharedStore::new(root.join("store")).unwrap();
        let manifest = CacheManifest {
            fingerprint: fingerprint('a'),
            inputs: vec![],
            outputs: vec![OutputDescriptor {
                path: "../escape.txt".to_owned(),
                size: 4,
                hash: hoist_hash::hash_bytes(b"data"),
                mtime_ms: None,
            }],
            original_runtime_ms: 0,
        };
        assert!(matches!(
            store.put(&package, &manifest),
            Err(CacheError::PathEscape { .. })
        ));
    }

    #[test]
    fn test_concurrent_puts_do_not_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path()).to_owned();
        let package = root.join("pkg");
        write_package_file(&package, "out.txt", "data");

        let store = std::sync::Arc::new(SharedStore::new(root.join("store")).unwrap());
        let manifest = manifest_for(&package, 'a', &["out.txt"], 0);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let package = package.clone();
                let manifest = manifest.clone();
                std::thread::spawn(move || store.put(&package, &manifest))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert!(store.get(&fingerprint('a')).unwrap().is_some());
        // No staging directories left behind.
        let leftovers: Vec<_> = std::fs::read_dir(store.root().as_std_path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}
