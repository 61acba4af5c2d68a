//! Pluggable serializers for values the cache does not store inline.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::storage::{Namespace, Storage};
use crate::core::Blake3Hasher;
use crate::value::Value;

/// Opaque handle returned by a format plugin. The cache stores it next to
/// the metadata and never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageRef(pub String);

impl StorageRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An external serializer for large or special values.
///
/// The cache hands the plugin the value and the name of the target, and keeps
/// whatever reference it returns. Reads go through the same plugin, looked up
/// by [`name`](FormatPlugin::name).
///
/// A write must not disturb the document behind an earlier reference: the
/// entry that points at it stays visible until the new metadata is written.
pub trait FormatPlugin: Send + Sync {
    /// Unique name, persisted in metadata.
    fn name(&self) -> &str;

    fn write(&self, key: &str, value: &Value) -> anyhow::Result<StorageRef>;

    fn read(&self, reference: &StorageRef) -> anyhow::Result<Value>;

    fn exists(&self, reference: &StorageRef) -> bool;
}

/// Writes JSON documents into the `formats` namespace of a storage, one
/// document per target and content.
pub(crate) struct JsonFormat {
    storage: Arc<dyn Storage>,
}

impl JsonFormat {
    pub(crate) fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl FormatPlugin for JsonFormat {
    fn name(&self) -> &str {
        "json"
    }

    fn write(&self, key: &str, value: &Value) -> anyhow::Result<StorageRef> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let id = Blake3Hasher::new().field(key).field(&bytes).finish();
        let reference = format!("{}.json", id.to_hex());
        self.storage.put(Namespace::Formats, &reference, &bytes)?;
        Ok(StorageRef(reference))
    }

    fn read(&self, reference: &StorageRef) -> anyhow::Result<Value> {
        match self.storage.get(Namespace::Formats, reference.as_str())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => anyhow::bail!("JSON document '{}' is missing", reference.as_str()),
        }
    }

    fn exists(&self, reference: &StorageRef) -> bool {
        self.storage
            .exists(Namespace::Formats, reference.as_str())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStorage;

    #[test]
    fn test_json_document() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let format = JsonFormat::new(storage.clone());

        let value = Value::from(vec![1i64, 2, 3]);
        let reference = format.write("model", &value).unwrap();

        assert!(format.exists(&reference));
        assert_eq!(format.read(&reference).unwrap(), value);

        let raw = storage.get(Namespace::Formats, reference.as_str()).unwrap().unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains('1'));

        // a new value gets its own document and leaves the old one readable
        let other = format.write("model", &Value::Int(7)).unwrap();
        assert_ne!(other, reference);
        assert_eq!(format.read(&reference).unwrap(), value);
        assert_eq!(format.read(&other).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_missing_document() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let format = JsonFormat::new(storage);
        let reference = StorageRef("nothing.json".into());
        assert!(!format.exists(&reference));
        assert!(format.read(&reference).is_err());
    }
}
