//! Namespaced byte stores backing the cache.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Mutex, RwLock};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::CacheError;

/// Top-level partitions of the persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// Built values, keyed by target.
    Values,
    /// Metadata of the latest successful build of each target.
    Metadata,
    /// Metadata of the build before that.
    MetadataPrevious,
    /// Documents written by format plugins.
    Formats,
    /// The append-only build history.
    Progress,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Namespace::Values,
        Namespace::Metadata,
        Namespace::MetadataPrevious,
        Namespace::Formats,
        Namespace::Progress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Values => "values",
            Namespace::Metadata => "metadata",
            Namespace::MetadataPrevious => "metadata_previous",
            Namespace::Formats => "formats",
            Namespace::Progress => "progress",
        }
    }
}

/// A namespaced key-value store with an append-only log.
///
/// Keys handed to a storage are fixed-length hex ids. `put` must be atomic:
/// a reader sees either the old bytes or the new ones, never a partial write.
pub trait Storage: Send + Sync {
    fn exists(&self, ns: Namespace, key: &str) -> Result<bool, CacheError>;

    fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    fn put(&self, ns: Namespace, key: &str, data: &[u8]) -> Result<(), CacheError>;

    /// Removing a missing key is not an error.
    fn remove(&self, ns: Namespace, key: &str) -> Result<(), CacheError>;

    fn keys(&self, ns: Namespace) -> Result<Vec<String>, CacheError>;

    /// Appends one line to the history log.
    fn append(&self, line: &str) -> Result<(), CacheError>;

    /// Every history line, oldest first.
    fn log(&self) -> Result<Vec<String>, CacheError>;
}

/// In-process storage, lost when dropped.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<(Namespace, String), Vec<u8>>>,
    history: Mutex<Vec<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn exists(&self, ns: Namespace, key: &str) -> Result<bool, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.contains_key(&(ns, key.to_string())))
    }

    fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(&(ns, key.to_string())).cloned())
    }

    fn put(&self, ns: Namespace, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        entries.insert((ns, key.to_string()), data.to_vec());
        Ok(())
    }

    fn remove(&self, ns: Namespace, key: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| CacheError::Poisoned)?;
        entries.remove(&(ns, key.to_string()));
        Ok(())
    }

    fn keys(&self, ns: Namespace) -> Result<Vec<String>, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::Poisoned)?;
        let mut keys: Vec<_> = entries
            .keys()
            .filter(|(space, _)| *space == ns)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn append(&self, line: &str) -> Result<(), CacheError> {
        let mut history = self.history.lock().map_err(|_| CacheError::Poisoned)?;
        history.push(line.to_string());
        Ok(())
    }

    fn log(&self) -> Result<Vec<String>, CacheError> {
        let history = self.history.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(history.clone())
    }
}

const FILE_HISTORY: &str = "history.jsonl";

/// Storage in a directory, one subdirectory per namespace.
///
/// Keys are sharded on their first two characters, so `3fa9..` lives in
/// `<ns>/3f/a9..`.
///
/// Layout:
/// - `<root>/values/<shard>/<id>` CBOR payloads
/// - `<root>/metadata/<shard>/<id>`, `<root>/metadata_previous/<shard>/<id>`
/// - `<root>/formats/<shard>/<reference>` plugin documents
/// - `<root>/progress/history.jsonl` one JSON event per line
pub struct FsStorage {
    root: Utf8PathBuf,
    history: Mutex<()>,
}

impl FsStorage {
    pub fn open(root: impl AsRef<Utf8Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        for ns in Namespace::ALL {
            fs::create_dir_all(root.join(ns.as_str()))?;
        }

        Ok(Self {
            root,
            history: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, ns: Namespace, key: &str) -> Utf8PathBuf {
        let dir = self.root.join(ns.as_str());
        match key.split_at_checked(2) {
            Some((prefix, suffix)) if !suffix.is_empty() => dir.join(prefix).join(suffix),
            _ => dir.join(key),
        }
    }

    fn history(&self) -> Utf8PathBuf {
        self.root.join(Namespace::Progress.as_str()).join(FILE_HISTORY)
    }
}

impl Storage for FsStorage {
    fn exists(&self, ns: Namespace, key: &str) -> Result<bool, CacheError> {
        Ok(self.path(ns, key).is_file())
    }

    fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(self.path(ns, key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, ns: Namespace, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let path = self.path(ns, key);
        let Some(dir) = path.parent() else {
            return Err(std::io::Error::other(format!("invalid storage key '{key}'")).into());
        };
        fs::create_dir_all(dir)?;

        // Write to a sibling temp file, then rename over the target. Process
        // and thread ids keep concurrent writers apart.
        let temp = dir.join(format!(
            ".{}.tmp.{}.{:?}",
            path.file_name().unwrap_or(key),
            std::process::id(),
            std::thread::current().id()
        ));

        let mut file = fs::File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp, &path)?;

        Ok(())
    }

    fn remove(&self, ns: Namespace, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.path(ns, key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn keys(&self, ns: Namespace) -> Result<Vec<String>, CacheError> {
        let mut keys = Vec::new();

        for entry in self.root.join(ns.as_str()).read_dir_utf8()? {
            let entry = entry?;
            let name = entry.file_name();
            if name.starts_with('.') {
                continue;
            }

            if entry.file_type()?.is_dir() {
                for inner in entry.path().read_dir_utf8()? {
                    let inner = inner?;
                    if !inner.file_name().starts_with('.') && inner.file_type()?.is_file() {
                        keys.push(format!("{name}{}", inner.file_name()));
                    }
                }
            } else if ns != Namespace::Progress {
                keys.push(name.to_string());
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn append(&self, line: &str) -> Result<(), CacheError> {
        let _guard = self.history.lock().map_err(|_| CacheError::Poisoned)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history())?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn log(&self) -> Result<Vec<String>, CacheError> {
        let file = match fs::File::open(self.history()) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }

        Ok(lines)
    }
}
