#![deny(clippy::all)]
//! Fingerprint engine.
//!
//! A fingerprint is a SHA-256 digest over a canonical serialization of
//! everything that determines a task's output: the toolchain, the lockfile,
//! the command, the hashed input files, and the fingerprints of every
//! dependency task. Equal inputs produce equal fingerprints on any machine.

use std::{
    fmt,
    fs::File,
    io::{self, Read},
    path::Path,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bumped whenever the fingerprint record layout changes so that stale cache
/// entries from older layouts can never be interpreted as hits.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// A fixed-width content hash, rendered as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_hex(hex: impl Into<String>) -> Result<Self, HashError> {
        let hex = hex.into();
        let valid = hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(HashError::InvalidFingerprint { value: hex });
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the toolchain a task runs under. Part of every fingerprint so
/// that artifacts built by a different runtime or on a different platform are
/// never shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolchainIdentity {
    pub runtime_version: String,
    pub arch: String,
    pub os: String,
}

impl ToolchainIdentity {
    /// Capture the host platform, with the runtime version supplied by the
    /// caller (the orchestrator does not probe toolchains itself).
    pub fn capture(runtime_version: impl Into<String>) -> Self {
        Self {
            runtime_version: runtime_version.into(),
            arch: std::env::consts::ARCH.to_owned(),
            os: std::env::consts::OS.to_owned(),
        }
    }
}

/// Writes length-prefixed fields into a SHA-256 digest. The length prefixes
/// make the serialization self-delimiting, so adjacent fields can never be
/// confused for one another regardless of their content.
struct CanonicalWriter {
    digest: Sha256,
}

impl CanonicalWriter {
    fn new() -> Self {
        Self {
            digest: Sha256::new(),
        }
    }

    fn field(&mut self, bytes: &[u8]) {
        self.digest.update((bytes.len() as u64).to_le_bytes());
        self.digest.update(bytes);
    }

    fn str_field(&mut self, value: &str) {
        self.field(value.as_bytes());
    }

    fn u32_field(&mut self, value: u32) {
        self.digest.update(4u64.to_le_bytes());
        self.digest.update(value.to_le_bytes());
    }

    fn list_len(&mut self, len: usize) {
        self.digest.update((len as u64).to_le_bytes());
    }

    fn finish(self) -> Fingerprint {
        Fingerprint(hex::encode(self.digest.finalize()))
    }
}

/// The ordered record a task fingerprint is computed from.
///
/// Input entries and dependency entries are sorted before hashing, so callers
/// may supply them in any order.
#[derive(Debug)]
pub struct TaskHashable<'a> {
    pub toolchain: &'a ToolchainIdentity,
    pub lockfile_hash: &'a str,
    pub package: &'a str,
    pub task: &'a str,
    pub executable: &'a str,
    pub command: &'a str,
    /// `(package-relative path, content hash)` per input file.
    pub inputs: &'a [(String, String)],
    /// `(qualified task name, fingerprint)` per strong dependency.
    pub dependencies: &'a [(String, Fingerprint)],
}

impl TaskHashable<'_> {
    pub fn hash(&self) -> Fingerprint {
        let mut writer = CanonicalWriter::new();
        writer.u32_field(CACHE_SCHEMA_VERSION);
        writer.str_field(&self.toolchain.runtime_version);
        writer.str_field(&self.toolchain.arch);
        writer.str_field(&self.toolchain.os);
        writer.str_field(self.lockfile_hash);
        writer.str_field(self.package);
        writer.str_field(self.task);
        writer.str_field(self.executable);
        writer.str_field(self.command);

        let mut inputs: Vec<_> = self.inputs.iter().collect();
        inputs.sort_by(|(path_a, _), (path_b, _)| path_a.cmp(path_b));
        writer.list_len(inputs.len());
        for (path, hash) in inputs {
            writer.str_field(path);
            writer.str_field(hash);
        }

        let mut dependencies: Vec<_> = self.dependencies.iter().collect();
        dependencies.sort_by(|(name_a, _), (name_b, _)| name_a.cmp(name_b));
        writer.list_len(dependencies.len());
        for (name, fingerprint) in dependencies {
            writer.str_field(name);
            writer.str_field(fingerprint.as_str());
        }

        writer.finish()
    }
}

/// Hash arbitrary bytes into the same fingerprint space. Used for lockfile
/// hashes and memoization keys.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a sequence of string fields with the canonical length-prefixed
/// layout. Used for composite keys where concatenation would be ambiguous.
pub fn hash_fields<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut writer = CanonicalWriter::new();
    for field in fields {
        writer.str_field(field.as_ref());
    }
    writer.finish().0
}

/// Content-hash a file, streaming so large artifacts don't get buffered
/// whole.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut digest = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        digest.update(&buffer[..read]);
    }
    Ok(hex::encode(digest.finalize()))
}

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("invalid fingerprint `{value}`, expected 64 hex characters")]
    InvalidFingerprint { value: String },
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn toolchain() -> ToolchainIdentity {
        ToolchainIdentity {
            runtime_version: "20.11.1".to_owned(),
            arch: "x86_64".to_owned(),
            os: "linux".to_owned(),
        }
    }

    fn hashable<'a>(
        toolchain: &'a ToolchainIdentity,
        inputs: &'a [(String, String)],
        dependencies: &'a [(String, Fingerprint)],
    ) -> TaskHashable<'a> {
        TaskHashable {
            toolchain,
            lockfile_hash: "lockfile",
            package: "web",
            task: "build",
            executable: "tsc",
            command: "tsc --build",
            inputs,
            dependencies,
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let toolchain = toolchain();
        let inputs = vec![("src/index.ts".to_owned(), "abc".to_owned())];
        let first = hashable(&toolchain, &inputs, &[]).hash();
        let second = hashable(&toolchain, &inputs, &[]).hash();
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 64);
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let toolchain = toolchain();
        let forward = vec![
            ("a.ts".to_owned(), "1".to_owned()),
            ("b.ts".to_owned(), "2".to_owned()),
        ];
        let reversed: Vec<_> = forward.iter().rev().cloned().collect();
        assert_eq!(
            hashable(&toolchain, &forward, &[]).hash(),
            hashable(&toolchain, &reversed, &[]).hash()
        );
    }

    #[test]
    fn test_dependency_fingerprint_changes_hash() {
        let toolchain = toolchain();
        let dep_a = vec![(
            "lib#build".to_owned(),
            Fingerprint::from_hex("a".repeat(64)).unwrap(),
        )];
        let dep_b = vec![(
            "lib#build".to_owned(),
            Fingerprint::from_hex("b".repeat(64)).unwrap(),
        )];
        assert_ne!(
            hashable(&toolchain, &[], &dep_a).hash(),
            hashable(&toolchain, &[], &dep_b).hash()
        );
    }

    #[test_case(|h: &mut TaskHashable| h.command = "tsc --build --force" ; "command")]
    #[test_case(|h: &mut TaskHashable| h.lockfile_hash = "other" ; "lockfile")]
    #[test_case(|h: &mut TaskHashable| h.package = "docs" ; "package")]
    #[test_case(|h: &mut TaskHashable| h.task = "lint" ; "task")]
    fn test_field_changes_hash(mutate: fn(&mut TaskHashable)) {
        let toolchain = toolchain();
        let base = hashable(&toolchain, &[], &[]).hash();
        let mut changed = hashable(&toolchain, &[], &[]);
        mutate(&mut changed);
        assert_ne!(base, changed.hash());
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        // "ab" + "c" must not hash like "a" + "bc".
        assert_ne!(hash_fields(["ab", "c"]), hash_fields(["a", "bc"]));
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, b"contents").unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(b"contents"));
    }

    #[test]
    fn test_fingerprint_parsing() {
        assert!(Fingerprint::from_hex("a".repeat(64)).is_ok());
        assert!(Fingerprint::from_hex("xyz").is_err());
        assert!(Fingerprint::from_hex("a".repeat(63)).is_err());
    }
}
