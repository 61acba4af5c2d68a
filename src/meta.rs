//! Per-target build records and the two-generation metadata store.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::core::{Blake3Hasher, Hash32};

/// Identity of a declared file at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileStamp {
    /// Content hash, `None` when the file does not exist.
    pub hash: Option<Hash32>,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime: u64,
    pub size: u64,
}

impl FileStamp {
    /// Stamps `path`, reusing the hash of `previous` when size and mtime are
    /// unchanged.
    pub fn read(path: &str, previous: Option<&FileStamp>) -> std::io::Result<FileStamp> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(FileStamp::default()),
            Err(err) => return Err(err),
        };

        let mtime = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let size = meta.len();

        if let Some(previous) = previous
            && previous.hash.is_some()
            && previous.mtime == mtime
            && previous.size == size
        {
            return Ok(*previous);
        }

        let hash = if meta.is_dir() {
            Hash32::hash(path.as_bytes())
        } else {
            Hash32::hash_file(path)?
        };

        Ok(FileStamp {
            hash: Some(hash),
            mtime,
            size,
        })
    }

    /// Hash used in fingerprints; missing files hash to zero.
    pub fn content(&self) -> Hash32 {
        self.hash.unwrap_or_default()
    }
}

/// Record of the last successful build of a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    /// Hash of the canonical command text.
    pub command: Hash32,
    pub fingerprint: Hash32,
    /// Fingerprints of every dependency at build time.
    pub dependencies: BTreeMap<String, Hash32>,
    /// Stamps of declared input and output files.
    pub files: BTreeMap<String, FileStamp>,
    /// Hash of the built value.
    pub value: Hash32,
    pub built_at: u64,
    pub seed: u64,
    pub trigger: String,
    /// Hash of the last value of a `change` trigger expression.
    pub change: Option<Hash32>,
    /// Sub-targets of a dynamic target, in expansion order.
    pub subtargets: Vec<String>,
    pub format: String,
    /// Wall-clock time of the build, in milliseconds.
    pub duration: u64,
}

/// Inputs of a fingerprint, hashed in a fixed order.
#[derive(Clone, Copy)]
pub(crate) struct Fingerprint<'a> {
    pub command: Hash32,
    pub dependencies: &'a BTreeMap<String, Hash32>,
    pub trigger: Hash32,
    pub seed: u64,
    pub format: &'a str,
}

impl Fingerprint<'_> {
    pub(crate) fn hash(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::new();
        hasher.hash(&self.command);
        hasher.u64(self.dependencies.len() as u64);
        for (name, hash) in self.dependencies {
            hasher.field(name).hash(hash);
        }
        hasher.hash(&self.trigger).u64(self.seed).field(self.format);
        hasher.finish()
    }
}

/// Seed of a target: explicit, or derived from the run seed and the name.
pub(crate) fn resolve_seed(explicit: Option<u64>, run_seed: u64, name: &str) -> u64 {
    match explicit {
        Some(seed) => seed,
        None => {
            let mut hasher = Blake3Hasher::new();
            hasher.u64(run_seed).field(name);
            let bytes = hasher.finish();
            let mut head = [0u8; 8];
            head.copy_from_slice(&bytes.as_bytes()[..8]);
            u64::from_le_bytes(head)
        }
    }
}

/// Metadata of the previous run next to that of the current run.
///
/// The previous generation is loaded lazily from the cache, at most once per
/// target. The current generation is filled as targets are checked or built.
/// File stamps are memoized for the whole run.
#[derive(Default)]
pub(crate) struct MetadataStore {
    previous: HashMap<String, Option<Metadata>>,
    current: HashMap<String, Metadata>,
    files: HashMap<String, FileStamp>,
}

impl MetadataStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Metadata from before this run. Read failures degrade to "none".
    pub(crate) fn previous(&mut self, cache: &Cache, name: &str) -> Option<&Metadata> {
        self.previous
            .entry(name.to_string())
            .or_insert_with(|| match cache.metadata(name) {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::warn!("Couldn't read metadata of '{name}', assuming outdated: {err}");
                    None
                }
            })
            .as_ref()
    }

    pub(crate) fn current(&self, name: &str) -> Option<&Metadata> {
        self.current.get(name)
    }

    pub(crate) fn set_current(&mut self, meta: Metadata) {
        self.current.insert(meta.name.clone(), meta);
    }

    /// Stamp of a file, computed at most once per run.
    pub(crate) fn stamp(&mut self, path: &str, previous: Option<&FileStamp>) -> FileStamp {
        if let Some(stamp) = self.files.get(path) {
            return *stamp;
        }

        let stamp = FileStamp::read(path, previous).unwrap_or_else(|err| {
            tracing::warn!("Couldn't stamp file '{path}': {err}");
            FileStamp::default()
        });

        self.files.insert(path.to_string(), stamp);
        stamp
    }

    /// Drops a memoized stamp, e.g. after a target wrote the file.
    pub(crate) fn forget(&mut self, path: &str) {
        self.files.remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_missing_file() {
        let stamp = FileStamp::read("/definitely/not/here.csv", None).unwrap();
        assert_eq!(stamp.hash, None);
        assert_eq!(stamp.content(), Hash32::default());
    }

    #[test]
    fn test_stamp_reuses_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        fs::write(&path, "a,b\n1,2\n").unwrap();
        let path = path.to_str().unwrap();

        let first = FileStamp::read(path, None).unwrap();
        assert_eq!(first.hash, Some(Hash32::hash("a,b\n1,2\n")));

        // a fake previous hash with the same mtime and size is trusted
        let fake = FileStamp {
            hash: Some(Hash32::hash("other")),
            ..first
        };
        assert_eq!(FileStamp::read(path, Some(&fake)).unwrap(), fake);
    }

    #[test]
    fn test_fingerprint_inputs() {
        let mut deps = BTreeMap::new();
        deps.insert("raw".to_string(), Hash32::hash("1"));

        let base = Fingerprint {
            command: Hash32::hash("f(raw)"),
            dependencies: &deps,
            trigger: Hash32::default(),
            seed: 7,
            format: "native",
        };

        let other_seed = Fingerprint { seed: 8, ..base };
        assert_ne!(base.hash(), other_seed.hash());

        let base = Fingerprint { seed: 7, ..other_seed };
        let other_format = Fingerprint {
            format: "json",
            ..base
        };
        assert_ne!(base.hash(), other_format.hash());
    }

    #[test]
    fn test_resolve_seed() {
        assert_eq!(resolve_seed(Some(3), 1, "a"), 3);
        assert_eq!(resolve_seed(None, 1, "a"), resolve_seed(None, 1, "a"));
        assert_ne!(resolve_seed(None, 1, "a"), resolve_seed(None, 1, "b"));
        assert_ne!(resolve_seed(None, 1, "a"), resolve_seed(None, 2, "a"));
    }
}
