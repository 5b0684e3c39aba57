//! Content fingerprints for up-to-date checks.
//!
//! The engine never decides on its own that a task can be skipped. A task body
//! hashes whatever it considers its inputs, asks the [`FingerprintCache`]
//! whether that hash matches the one recorded after its last successful run,
//! and returns [`Outcome::UpToDate`](crate::Outcome::UpToDate) if so.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::core::{ArcStr, Blake3Hasher, Hash32};

/// Hashes any value implementing [`Hash`].
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> Hash32 {
    let mut hasher = Blake3Hasher::default();
    value.hash(&mut hasher);
    hasher.into()
}

/// Hashes every file matched by a glob pattern. Both the paths and the file
/// contents contribute, so renames are detected too.
pub fn hash_glob(pattern: &str) -> anyhow::Result<Hash32> {
    let mut files = Vec::new();

    for entry in glob::glob(pattern)? {
        let path = Utf8PathBuf::try_from(entry?)?;
        if path.is_file() {
            files.push(path);
        }
    }

    hash_files(files)
}

/// Hashes a directory tree recursively. A missing directory hashes like an
/// empty one.
pub fn hash_tree(root: impl AsRef<Utf8Path>) -> anyhow::Result<Hash32> {
    let root = root.as_ref();
    let pattern = root.join("**").join("*");

    let mut files = Vec::new();
    for entry in glob::glob(pattern.as_str())? {
        let path = Utf8PathBuf::try_from(entry?)?;
        if path.is_file() {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_owned();
            files.push((relative, path));
        }
    }

    files.sort();

    let hashes = files
        .par_iter()
        .map(|(_, path)| Hash32::hash_file(path))
        .collect::<Result<Vec<_>, _>>()?;

    let mut hasher = blake3::Hasher::new();
    for ((relative, _), hash) in files.iter().zip(hashes) {
        hasher.update(relative.as_str().as_bytes());
        hasher.update(hash.as_bytes());
    }

    Ok(hasher.finalize().into())
}

fn hash_files(mut files: Vec<Utf8PathBuf>) -> anyhow::Result<Hash32> {
    files.sort();

    let hashes = files
        .par_iter()
        .map(Hash32::hash_file)
        .collect::<Result<Vec<_>, _>>()?;

    let mut hasher = blake3::Hasher::new();
    for (path, hash) in files.iter().zip(hashes) {
        hasher.update(path.as_str().as_bytes());
        hasher.update(hash.as_bytes());
    }

    Ok(hasher.finalize().into())
}

/// Fingerprints recorded by task bodies, shared by every run of an
/// [`Engine`](crate::Engine).
#[derive(Clone, Default, Debug)]
pub struct FingerprintCache {
    entries: Arc<Mutex<HashMap<ArcStr, Hash32>>>,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `hash` matches what was last recorded under `key`.
    pub fn is_fresh(&self, key: &str, hash: Hash32) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key) == Some(&hash)
    }

    /// Stores `hash` under `key`, returns the previous one.
    pub fn record(&self, key: &str, hash: Hash32) -> Option<Hash32> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.into(), hash)
    }

    pub fn get(&self, key: &str) -> Option<Hash32> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).copied()
    }

    pub fn forget(&self, key: &str) -> Option<Hash32> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
