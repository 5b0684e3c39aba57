use std::collections::BTreeMap;
use std::fs;
use std::num::NonZeroUsize;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Atomic reference-counted string type used for identifiers.
pub type ArcStr = std::sync::Arc<str>;

/// A 32-byte BLAKE3 hash used for content fingerprinting.
///
/// Task bodies use it to decide whether their inputs changed since the last
/// successful run, see [`FingerprintCache`](crate::FingerprintCache).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Streaming hasher, lets any [`std::hash::Hash`] value feed a [`Hash32`].
#[derive(Default)]
pub struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// What the engine does once a task body fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Let running tasks finish, start nothing new.
    #[default]
    FailFast,
    /// Keep running every task whose predecessors all succeeded.
    KeepGoing,
}

/// Build-wide settings handed to every plugin.
///
/// # Example
///
/// ```rust
/// use kiln::{BuildConfig, FailurePolicy};
///
/// let config: BuildConfig = serde_json::from_str(r#"{
///     "root": "project",
///     "jobs": 4,
///     "failure": "keep-going"
/// }"#).unwrap();
///
/// assert_eq!(config.failure, FailurePolicy::KeepGoing);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Project root, all plugin paths are relative to it.
    #[serde(default = "default_root")]
    pub root: Utf8PathBuf,
    /// Worker count, defaults to the available parallelism.
    #[serde(default)]
    pub jobs: Option<usize>,
    #[serde(default)]
    pub failure: FailurePolicy,
    /// Free-form settings read by plugins.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_root() -> Utf8PathBuf {
    Utf8PathBuf::from(".")
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            jobs: None,
            failure: FailurePolicy::default(),
            properties: BTreeMap::new(),
        }
    }
}

impl BuildConfig {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)
            .map_err(|err| anyhow::anyhow!("Invalid build config {path}: {err}"))?;
        Ok(config)
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_failure(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Number of worker threads to run task bodies on.
    pub fn workers(&self) -> usize {
        self.jobs
            .filter(|jobs| *jobs > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(NonZeroUsize::get))
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex() {
        let hash = Hash32::hash(b"kiln");
        let hex = hash.to_hex();

        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hex, format!("{}", blake3::hash(b"kiln").to_hex()));
    }

    #[test]
    fn test_hasher_matches_buffer() {
        use std::hash::Hasher;

        let mut hasher = Blake3Hasher::default();
        hasher.write(b"abc");
        let hash: Hash32 = hasher.into();

        assert_eq!(hash, Hash32::hash(b"abc"));
    }

    #[test]
    fn test_config_defaults() {
        let config: BuildConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.root, Utf8PathBuf::from("."));
        assert_eq!(config.failure, FailurePolicy::FailFast);
        assert!(config.workers() >= 1);
    }

    #[test]
    fn test_config_workers() {
        let config = BuildConfig::default().with_jobs(3).with_property("a", "b");
        assert_eq!(config.workers(), 3);
        assert_eq!(config.property("a"), Some("b"));

        let config = BuildConfig::default().with_jobs(0);
        assert!(config.workers() >= 1);
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("kiln.json")).unwrap();
        fs::write(&path, r#"{"root": "src", "failure": "keep-going"}"#).unwrap();

        let config = BuildConfig::from_json_file(&path).unwrap();
        assert_eq!(config.root, Utf8PathBuf::from("src"));
        assert_eq!(config.failure, FailurePolicy::KeepGoing);

        fs::write(&path, "not json").unwrap();
        assert!(BuildConfig::from_json_file(&path).is_err());
    }
}
