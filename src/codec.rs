//! Reversible, memoized encoding of file paths and namespaced symbols.
//!
//! The same names recur across many targets in a large workflow, so both
//! directions are cached in lookup tables.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use crate::core::ArcStr;
use crate::utils::{hex, unhex};

const PREFIX_PATH: &str = "p-";
const PREFIX_NAMESPACED: &str = "n-";

static GLOBAL: LazyLock<NameCodec> = LazyLock::new(NameCodec::default);

/// Shared process-wide codec.
pub fn codec() -> &'static NameCodec {
    &GLOBAL
}

#[derive(Default)]
pub struct NameCodec {
    encoded: RwLock<HashMap<(char, ArcStr), ArcStr>>,
    decoded: RwLock<HashMap<ArcStr, ArcStr>>,
}

impl NameCodec {
    /// Encoded identity of a file path, e.g. `p-646174612e637376`.
    pub fn encode_path(&self, path: &str) -> ArcStr {
        self.encode('p', PREFIX_PATH, path)
    }

    /// Encoded identity of a namespaced symbol such as `stats::mean`.
    pub fn encode_namespaced(&self, symbol: &str) -> ArcStr {
        self.encode('n', PREFIX_NAMESPACED, symbol)
    }

    /// Reverses any of the encodings above.
    pub fn decode(&self, encoded: &str) -> Option<ArcStr> {
        if let Ok(map) = self.decoded.read()
            && let Some(found) = map.get(encoded)
        {
            return Some(found.clone());
        }

        let body = [PREFIX_PATH, PREFIX_NAMESPACED]
            .iter()
            .find_map(|prefix| encoded.strip_prefix(prefix))?;

        let bytes = unhex(body)?;
        let plain: ArcStr = String::from_utf8(bytes).ok()?.into();

        if let Ok(mut map) = self.decoded.write() {
            map.insert(encoded.into(), plain.clone());
        }

        Some(plain)
    }

    fn encode(&self, tag: char, prefix: &str, plain: &str) -> ArcStr {
        let lookup = (tag, ArcStr::from(plain));

        if let Ok(map) = self.encoded.read()
            && let Some(found) = map.get(&lookup)
        {
            return found.clone();
        }

        let encoded: ArcStr = Arc::from(format!("{prefix}{}", hex(plain.as_bytes())));

        if let Ok(mut map) = self.encoded.write() {
            map.insert(lookup.clone(), encoded.clone());
        }
        if let Ok(mut map) = self.decoded.write() {
            map.insert(encoded.clone(), lookup.1);
        }

        encoded
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.encoded.read().map(|map| map.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let codec = NameCodec::default();
        let path = codec.encode_path("data/raw.csv");
        assert!(path.starts_with("p-"));
        assert_eq!(codec.decode(&path).as_deref(), Some("data/raw.csv"));

        let ns = codec.encode_namespaced("stats::mean");
        assert!(ns.starts_with("n-"));
        assert_eq!(codec.decode(&ns).as_deref(), Some("stats::mean"));
    }

    #[test]
    fn test_memoized() {
        let codec = NameCodec::default();
        let a = codec.encode_path("model.csv");
        let b = codec.encode_path("model.csv");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(codec.len(), 1);
    }

    #[test]
    fn test_tags_do_not_collide() {
        let codec = NameCodec::default();
        assert_ne!(codec.encode_path("x"), codec.encode_namespaced("x"));
    }

    #[test]
    fn test_decode_garbage() {
        let codec = NameCodec::default();
        assert_eq!(codec.decode("p-zz"), None);
        assert_eq!(codec.decode("plain"), None);
    }
}
