//! Content-addressable store of built values, their metadata and the build
//! history.
//!
//! The cache is keyed by target name (or derived sub-target name). A name
//! reaches the [`Storage`] as the hex blake3 hash of the name, so any name is
//! safe on any backend and every key has the same length.
//!
//! Payloads live in the values namespace under an id derived from the name
//! and the encoded payload, so a new payload never replaces one that is
//! still referenced. The metadata header names that id and is written last,
//! in one atomic put. An interrupted `store` leaves the previous entry in
//! place, plus an unreferenced payload that [`Cache::clean`] sweeps.

mod format;
mod storage;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32, now_millis};
use crate::error::CacheError;
use crate::meta::Metadata;
use crate::plan::Format;
use crate::value::Value;

pub use format::{FormatPlugin, StorageRef};
pub use storage::{FsStorage, MemoryStorage, Namespace, Storage};

use format::JsonFormat;

/// The payload of a value entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stored {
    Inline(Value),
    /// Written by a format plugin.
    External { format: String, reference: StorageRef },
    /// A dynamic target: the names of its sub-targets.
    Subtargets(Vec<String>),
}

/// Lifecycle states written to the build history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    Running,
    Built,
    Failed,
    Skipped,
}

/// One line of the build history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub target: String,
    pub progress: Progress,
    /// Milliseconds since the Unix epoch.
    pub at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Event {
    pub fn new(target: impl Into<String>, progress: Progress) -> Self {
        Self {
            target: target.into(),
            progress,
            at: now_millis(),
            message: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// What the metadata namespace holds for each entry.
#[derive(Serialize, Deserialize)]
struct Header {
    metadata: Metadata,
    /// Id of the payload in the values namespace.
    payload: String,
}

/// Typed access to a [`Storage`]. Cloning is cheap and shares the backend.
#[derive(Clone)]
pub struct Cache {
    storage: Arc<dyn Storage>,
    plugins: Arc<RwLock<HashMap<String, Arc<dyn FormatPlugin>>>>,
}

impl Cache {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let json: Arc<dyn FormatPlugin> = Arc::new(JsonFormat::new(storage.clone()));
        let plugins = HashMap::from([(json.name().to_string(), json)]);

        Self {
            storage,
            plugins: Arc::new(RwLock::new(plugins)),
        }
    }

    /// A cache that lives only as long as the process.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// A cache persisted under `root`.
    pub fn open(root: impl AsRef<Utf8Path>) -> Result<Self, CacheError> {
        Ok(Self::new(Arc::new(FsStorage::open(root)?)))
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Makes a format plugin available for reading entries it wrote.
    pub fn register(&self, plugin: Arc<dyn FormatPlugin>) -> Result<(), CacheError> {
        let mut plugins = self.plugins.write().map_err(|_| CacheError::Poisoned)?;
        plugins.insert(plugin.name().to_string(), plugin);
        Ok(())
    }

    fn plugin(&self, name: &str) -> Result<Arc<dyn FormatPlugin>, CacheError> {
        let plugins = self.plugins.read().map_err(|_| CacheError::Poisoned)?;
        plugins
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownFormat(name.to_string()))
    }

    fn key(name: &str) -> String {
        Hash32::hash(name).to_hex()
    }

    fn header(&self, ns: Namespace, name: &str) -> Result<Option<Header>, CacheError> {
        match self.storage.get(ns, &Self::key(name))? {
            Some(bytes) => Ok(Some(decode(name, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether a complete entry exists for `name`.
    pub fn exists(&self, name: &str) -> Result<bool, CacheError> {
        match self.entry(name)? {
            None => Ok(false),
            Some(Stored::Inline(_)) => Ok(true),
            Some(Stored::External { format, reference }) => Ok(self.plugin(&format)?.exists(&reference)),
            Some(Stored::Subtargets(names)) => {
                for name in &names {
                    if !self.exists(name)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Writes a built value and its metadata.
    pub fn store(&self, name: &str, value: &Value, metadata: &Metadata, format: &Format) -> Result<(), CacheError> {
        let stored = match format {
            Format::Native => Stored::Inline(value.clone()),
            Format::Json => self.external("json", name, value)?,
            Format::Plugin(plugin) => {
                self.register(plugin.clone())?;
                self.external(plugin.name(), name, value)?
            }
        };

        self.put(name, &stored, metadata)
    }

    /// Writes the entry of a dynamic target.
    pub fn store_subtargets(&self, name: &str, subtargets: Vec<String>, metadata: &Metadata) -> Result<(), CacheError> {
        self.put(name, &Stored::Subtargets(subtargets), metadata)
    }

    fn external(&self, format: &str, name: &str, value: &Value) -> Result<Stored, CacheError> {
        let reference = self
            .plugin(format)?
            .write(name, value)
            .map_err(|err| CacheError::Format(format.to_string(), err))?;

        Ok(Stored::External {
            format: format.to_string(),
            reference,
        })
    }

    fn put(&self, name: &str, stored: &Stored, metadata: &Metadata) -> Result<(), CacheError> {
        let bytes = encode(name, stored)?;
        let payload = Blake3Hasher::new().field(name).field(&bytes).finish().to_hex();
        let previous = self.header(Namespace::Metadata, name)?;

        self.storage.put(Namespace::Values, &payload, &bytes)?;

        let header = Header {
            metadata: metadata.clone(),
            payload,
        };
        self.storage
            .put(Namespace::Metadata, &Self::key(name), &encode(name, &header)?)?;

        // the new entry is visible, the old payload is garbage now
        if let Some(previous) = previous
            && previous.payload != header.payload
        {
            self.discard(name, &previous.payload)?;
        }

        Ok(())
    }

    /// Deletes a payload together with the JSON document it points at.
    fn discard(&self, name: &str, payload: &str) -> Result<(), CacheError> {
        if let Some(bytes) = self.storage.get(Namespace::Values, payload)?
            && let Ok(Stored::External { format, reference }) = decode::<Stored>(name, &bytes)
            && format == "json"
        {
            self.storage.remove(Namespace::Formats, reference.as_str())?;
        }
        self.storage.remove(Namespace::Values, payload)
    }

    /// The raw payload of an entry.
    pub fn entry(&self, name: &str) -> Result<Option<Stored>, CacheError> {
        let Some(header) = self.header(Namespace::Metadata, name)? else {
            return Ok(None);
        };

        match self.storage.get(Namespace::Values, &header.payload)? {
            Some(bytes) => Ok(Some(decode(name, &bytes)?)),
            None => Ok(None),
        }
    }

    /// The value of `name`. A dynamic target yields the list of its
    /// sub-target values.
    pub fn retrieve(&self, name: &str) -> Result<Value, CacheError> {
        match self.entry(name)? {
            None => Err(CacheError::Missing(name.to_string())),
            Some(Stored::Inline(value)) => Ok(value),
            Some(Stored::External { format, reference }) => self
                .plugin(&format)?
                .read(&reference)
                .map_err(|err| CacheError::Format(format, err)),
            Some(Stored::Subtargets(names)) => names
                .iter()
                .map(|name| self.retrieve(name))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
        }
    }

    /// Deletes the value and both metadata generations of `name`.
    pub fn remove(&self, name: &str) -> Result<(), CacheError> {
        let key = Self::key(name);
        let header = self.header(Namespace::Metadata, name)?;

        self.storage.remove(Namespace::Metadata, &key)?;
        self.storage.remove(Namespace::MetadataPrevious, &key)?;
        if let Some(header) = header {
            self.discard(name, &header.payload)?;
        }
        Ok(())
    }

    pub fn metadata(&self, name: &str) -> Result<Option<Metadata>, CacheError> {
        Ok(self.header(Namespace::Metadata, name)?.map(|header| header.metadata))
    }

    /// Metadata of the build before the latest one.
    pub fn previous_metadata(&self, name: &str) -> Result<Option<Metadata>, CacheError> {
        Ok(self
            .header(Namespace::MetadataPrevious, name)?
            .map(|header| header.metadata))
    }

    /// Copies the current metadata of `name` to `metadata_previous`, ahead of
    /// an overwrite.
    pub fn rotate_metadata(&self, name: &str) -> Result<(), CacheError> {
        let key = Self::key(name);
        if let Some(bytes) = self.storage.get(Namespace::Metadata, &key)? {
            self.storage.put(Namespace::MetadataPrevious, &key, &bytes)?;
        }
        Ok(())
    }

    /// Appends an event to the build history.
    pub fn record(&self, event: &Event) -> Result<(), CacheError> {
        let line = serde_json::to_string(event)
            .map_err(|err| CacheError::Encode(event.target.clone(), err.to_string()))?;
        self.storage.append(&line)
    }

    /// The full build history, oldest first.
    pub fn history(&self) -> Result<Vec<Event>, CacheError> {
        self.storage
            .log()?
            .iter()
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|err| CacheError::Decode("history".into(), err.to_string()))
            })
            .collect()
    }

    /// Latest recorded state of every target in the history.
    pub fn progress(&self) -> Result<BTreeMap<String, Progress>, CacheError> {
        let mut latest = BTreeMap::new();
        for event in self.history()? {
            latest.insert(event.target, event.progress);
        }
        Ok(latest)
    }

    /// Every header in the metadata namespace.
    fn headers(&self) -> Result<Vec<Header>, CacheError> {
        let mut headers = Vec::new();
        for key in self.storage.keys(Namespace::Metadata)? {
            if let Some(bytes) = self.storage.get(Namespace::Metadata, &key)? {
                headers.push(decode(&key, &bytes)?);
            }
        }
        Ok(headers)
    }

    /// Names of every entry with metadata.
    pub fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self
            .headers()?
            .into_iter()
            .map(|header| header.metadata.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Removes every entry not in `keep`, and payloads no entry refers to.
    /// Sub-targets of kept dynamic targets are kept too. Returns the removed
    /// names.
    pub fn clean(&self, keep: &BTreeSet<String>) -> Result<Vec<String>, CacheError> {
        let mut keep = keep.clone();
        let mut queue: Vec<String> = keep.iter().cloned().collect();
        while let Some(name) = queue.pop() {
            if let Some(meta) = self.metadata(&name)? {
                for sub in meta.subtargets {
                    if keep.insert(sub.clone()) {
                        queue.push(sub);
                    }
                }
            }
        }

        let mut removed = Vec::new();
        for name in self.keys()? {
            if !keep.contains(&name) {
                self.remove(&name)?;
                removed.push(name);
            }
        }

        let live: BTreeSet<String> = self.headers()?.into_iter().map(|header| header.payload).collect();
        let mut orphans = 0;
        for payload in self.storage.keys(Namespace::Values)? {
            if !live.contains(&payload) {
                self.discard(&payload, &payload)?;
                orphans += 1;
            }
        }

        if !removed.is_empty() || orphans > 0 {
            tracing::info!(
                "Removed {} stale cache entries and {} orphaned payloads",
                removed.len(),
                orphans
            );
        }

        Ok(removed)
    }
}

fn encode<T: Serialize>(name: &str, value: &T) -> Result<Vec<u8>, CacheError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer)
        .map_err(|err| CacheError::Encode(name.to_string(), err.to_string()))?;
    Ok(buffer)
}

fn decode<T: DeserializeOwned>(name: &str, bytes: &[u8]) -> Result<T, CacheError> {
    ciborium::from_reader(bytes).map_err(|err| CacheError::Decode(name.to_string(), err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, value: &Value) -> Metadata {
        Metadata {
            name: name.into(),
            command: Hash32::default(),
            fingerprint: Hash32::hash(name),
            dependencies: BTreeMap::new(),
            files: BTreeMap::new(),
            value: value.hash(),
            built_at: 0,
            seed: 0,
            trigger: "command".into(),
            change: None,
            subtargets: Vec::new(),
            format: "native".into(),
            duration: 0,
        }
    }

    struct Upper;

    impl FormatPlugin for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn write(&self, key: &str, value: &Value) -> anyhow::Result<StorageRef> {
            let text = value.as_str().unwrap_or_default().to_uppercase();
            Ok(StorageRef(format!("{key}:{text}")))
        }

        fn read(&self, reference: &StorageRef) -> anyhow::Result<Value> {
            let (_, text) = reference.as_str().split_once(':').unwrap_or_default();
            Ok(Value::from(text))
        }

        fn exists(&self, _: &StorageRef) -> bool {
            true
        }
    }

    #[test]
    fn test_store_retrieve() {
        let cache = Cache::memory();
        let value = Value::from(vec![1i64, 2]);

        assert!(!cache.exists("a").unwrap());
        cache.store("a", &value, &meta("a", &value), &Format::Native).unwrap();
        assert!(cache.exists("a").unwrap());
        assert_eq!(cache.retrieve("a").unwrap(), value);
        assert_eq!(cache.metadata("a").unwrap().unwrap().value, value.hash());
        assert_eq!(cache.keys().unwrap(), ["a"]);

        cache.remove("a").unwrap();
        assert!(!cache.exists("a").unwrap());
        assert!(matches!(cache.retrieve("a"), Err(CacheError::Missing(_))));
    }

    /// Fails every metadata write once armed.
    #[derive(Default)]
    struct Flaky {
        inner: MemoryStorage,
        armed: std::sync::atomic::AtomicBool,
    }

    impl Storage for Flaky {
        fn exists(&self, ns: Namespace, key: &str) -> Result<bool, CacheError> {
            self.inner.exists(ns, key)
        }

        fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            self.inner.get(ns, key)
        }

        fn put(&self, ns: Namespace, key: &str, data: &[u8]) -> Result<(), CacheError> {
            if ns == Namespace::Metadata && self.armed.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(std::io::Error::other("disk full").into());
            }
            self.inner.put(ns, key, data)
        }

        fn remove(&self, ns: Namespace, key: &str) -> Result<(), CacheError> {
            self.inner.remove(ns, key)
        }

        fn keys(&self, ns: Namespace) -> Result<Vec<String>, CacheError> {
            self.inner.keys(ns)
        }

        fn append(&self, line: &str) -> Result<(), CacheError> {
            self.inner.append(line)
        }

        fn log(&self) -> Result<Vec<String>, CacheError> {
            self.inner.log()
        }
    }

    #[test]
    fn test_value_without_metadata_is_absent() {
        let cache = Cache::memory();
        let bytes = encode("half", &Stored::Inline(Value::Int(1))).unwrap();
        cache.storage().put(Namespace::Values, &Cache::key("half"), &bytes).unwrap();
        assert!(!cache.exists("half").unwrap());
    }

    #[test]
    fn test_interrupted_overwrite_keeps_old_entry() {
        let storage = Arc::new(Flaky::default());
        let cache = Cache::new(storage.clone());
        let one = Value::Int(1);
        let two = Value::Int(2);

        cache.store("a", &one, &meta("a", &one), &Format::Native).unwrap();
        cache.store("j", &one, &meta("j", &one), &Format::Json).unwrap();

        storage.armed.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(cache.store("a", &two, &meta("a", &two), &Format::Native).is_err());
        assert!(cache.store("j", &two, &meta("j", &two), &Format::Json).is_err());

        for name in ["a", "j"] {
            assert!(cache.exists(name).unwrap());
            assert_eq!(cache.retrieve(name).unwrap(), one);
            assert_eq!(cache.metadata(name).unwrap().unwrap().value, one.hash());
        }

        // the payloads of the failed writes are swept
        storage.armed.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(storage.keys(Namespace::Values).unwrap().len(), 4);
        let keep = BTreeSet::from(["a".to_string(), "j".to_string()]);
        assert!(cache.clean(&keep).unwrap().is_empty());
        assert_eq!(storage.keys(Namespace::Values).unwrap().len(), 2);
        assert_eq!(cache.retrieve("j").unwrap(), one);
    }

    #[test]
    fn test_overwrite_drops_old_payload() {
        let cache = Cache::memory();
        for v in [1i64, 2, 3] {
            let value = Value::Int(v);
            cache.store("a", &value, &meta("a", &value), &Format::Json).unwrap();
        }
        assert_eq!(cache.storage().keys(Namespace::Values).unwrap().len(), 1);
        assert_eq!(cache.storage().keys(Namespace::Formats).unwrap().len(), 1);
        assert_eq!(cache.retrieve("a").unwrap(), Value::Int(3));
    }

    #[test]
    fn test_long_names_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let cache = Cache::open(root).unwrap();

        let name = "t".repeat(400);
        let value = Value::from("long");
        cache.store(&name, &value, &meta(&name, &value), &Format::Json).unwrap();
        assert_eq!(cache.retrieve(&name).unwrap(), value);
        assert_eq!(cache.keys().unwrap(), [name]);
    }

    #[test]
    fn test_json_and_plugin_formats() {
        let cache = Cache::memory();
        let value = Value::from("hello");

        cache.store("j", &value, &meta("j", &value), &Format::Json).unwrap();
        assert!(matches!(cache.entry("j").unwrap(), Some(Stored::External { .. })));
        assert_eq!(cache.retrieve("j").unwrap(), value);

        let plugin = Format::Plugin(Arc::new(Upper));
        cache.store("p", &value, &meta("p", &value), &plugin).unwrap();
        assert_eq!(cache.retrieve("p").unwrap(), Value::from("HELLO"));

        // a fresh cache over the same storage does not know the plugin
        let other = Cache::new(cache.storage().clone());
        assert!(matches!(other.retrieve("p"), Err(CacheError::UnknownFormat(_))));
    }

    #[test]
    fn test_subtargets() {
        let cache = Cache::memory();
        for (name, v) in [("d_1", 1i64), ("d_2", 2)] {
            let value = Value::Int(v);
            cache.store(name, &value, &meta(name, &value), &Format::Native).unwrap();
        }

        let parent = Value::Null;
        cache
            .store_subtargets("d", vec!["d_1".into(), "d_2".into()], &meta("d", &parent))
            .unwrap();

        assert!(cache.exists("d").unwrap());
        assert_eq!(cache.retrieve("d").unwrap(), Value::from(vec![1i64, 2]));

        cache.remove("d_2").unwrap();
        assert!(!cache.exists("d").unwrap());
    }

    #[test]
    fn test_rotate_metadata() {
        let cache = Cache::memory();
        let one = Value::Int(1);
        let two = Value::Int(2);

        cache.store("a", &one, &meta("a", &one), &Format::Native).unwrap();
        cache.rotate_metadata("a").unwrap();
        cache.store("a", &two, &meta("a", &two), &Format::Native).unwrap();

        assert_eq!(cache.previous_metadata("a").unwrap().unwrap().value, one.hash());
        assert_eq!(cache.metadata("a").unwrap().unwrap().value, two.hash());
    }

    #[test]
    fn test_history_and_progress() {
        let cache = Cache::memory();
        cache.record(&Event::new("a", Progress::Running)).unwrap();
        cache.record(&Event::new("b", Progress::Running)).unwrap();
        cache.record(&Event::new("a", Progress::Built)).unwrap();
        cache
            .record(&Event::new("b", Progress::Failed).message("boom"))
            .unwrap();

        assert_eq!(cache.history().unwrap().len(), 4);
        let progress = cache.progress().unwrap();
        assert_eq!(progress["a"], Progress::Built);
        assert_eq!(progress["b"], Progress::Failed);
    }

    #[test]
    fn test_clean_keeps_subtargets() {
        let cache = Cache::memory();
        for name in ["a", "gone", "d_1"] {
            let value = Value::from(name);
            cache.store(name, &value, &meta(name, &value), &Format::Native).unwrap();
        }
        let mut parent = meta("d", &Value::Null);
        parent.subtargets = vec!["d_1".into()];
        cache.store_subtargets("d", vec!["d_1".into()], &parent).unwrap();

        let keep = BTreeSet::from(["a".to_string(), "d".to_string()]);
        assert_eq!(cache.clean(&keep).unwrap(), ["gone"]);
        assert_eq!(cache.keys().unwrap(), ["a", "d", "d_1"]);
    }

    #[test]
    fn test_fs_cache_persists() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("state");
        let value = Value::from("kept");

        {
            let cache = Cache::open(&root).unwrap();
            cache.store("a", &value, &meta("a", &value), &Format::Json).unwrap();
            cache.record(&Event::new("a", Progress::Built)).unwrap();
        }

        let cache = Cache::open(&root).unwrap();
        assert_eq!(cache.retrieve("a").unwrap(), value);
        assert_eq!(cache.progress().unwrap()["a"], Progress::Built);

        let history = std::fs::read_to_string(root.join("progress/history.jsonl")).unwrap();
        assert!(history.contains(r#""progress":"built""#));
    }
}
