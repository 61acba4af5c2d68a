//! User-supplied functions and objects: the read-only base layer every
//! command can reference.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

use crate::core::{Blake3Hasher, Hash32};
use crate::value::Value;

/// Arguments of a native function call.
#[derive(Debug, Default, Clone)]
pub struct Args {
    pub positional: Vec<Value>,
    pub named: BTreeMap<String, Value>,
    /// Resolved seed of the target being built.
    pub seed: u64,
}

impl Args {
    /// Positional argument `index`, or an error naming it.
    pub fn get(&self, index: usize) -> anyhow::Result<&Value> {
        self.positional
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("missing argument #{index}"))
    }

    /// Named argument, falling back to a positional slot.
    pub fn named_or(&self, name: &str, index: usize) -> anyhow::Result<&Value> {
        match self.named.get(name) {
            Some(value) => Ok(value),
            None => self
                .positional
                .get(index)
                .ok_or_else(|| anyhow::anyhow!("missing argument '{name}'")),
        }
    }
}

/// Native function pointer registered by the user.
pub type NativeFn = Arc<dyn Fn(&Args) -> anyhow::Result<Value> + Send + Sync>;

/// A base-layer definition.
#[derive(Clone)]
pub enum Import {
    /// A Rust closure. Its code can't be hashed, so the user supplies a
    /// version tag which is part of the fingerprint.
    Native { version: String, func: NativeFn },
    /// A function written in the command language.
    Function { params: Vec<String>, body: String },
    /// A constant value.
    Constant(Value),
}

impl Debug for Import {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Import::Native { version, .. } => write!(f, "Import::Native({version}, *)"),
            Import::Function { params, body } => {
                write!(f, "Import::Function({}) {{ {body} }}", params.join(", "))
            }
            Import::Constant(value) => write!(f, "Import::Constant({value})"),
        }
    }
}

/// The collection of imports available to a workflow.
///
/// # Example
///
/// ```rust
/// use nagare::{Imports, Value};
///
/// let imports = Imports::new()
///     .native("double", "v1", |args| {
///         let x = args.get(0)?.as_int().unwrap_or_default();
///         Ok(Value::Int(x * 2))
///     })
///     .function("quad", ["x"], "double(double(x))")
///     .constant("threshold", Value::Int(10));
/// assert_eq!(imports.len(), 3);
/// ```
#[derive(Clone, Default, Debug)]
pub struct Imports {
    items: BTreeMap<String, Import>,
}

impl Imports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn native<F>(mut self, name: impl Into<String>, version: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Args) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.items.insert(
            name.into(),
            Import::Native {
                version: version.into(),
                func: Arc::new(func),
            },
        );
        self
    }

    pub fn function<P, S>(mut self, name: impl Into<String>, params: P, body: impl Into<String>) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.items.insert(
            name.into(),
            Import::Function {
                params: params.into_iter().map(Into::into).collect(),
                body: body.into(),
            },
        );
        self
    }

    pub fn constant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.items.insert(name.into(), Import::Constant(value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Import> {
        self.items.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Import)> {
        self.items.iter().map(|(name, import)| (name.as_str(), import))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Hash of the definition alone, without anything it calls.
    pub(crate) fn own_hash(&self, name: &str, canonical_body: Option<&str>) -> Hash32 {
        let mut hasher = Blake3Hasher::new();
        hasher.field(name);

        match self.items.get(name) {
            Some(Import::Native { version, .. }) => {
                hasher.field("native").field(version);
            }
            Some(Import::Function { params, body }) => {
                hasher.field("function");
                for param in params {
                    hasher.field(param);
                }
                hasher.field(canonical_body.unwrap_or(body));
            }
            Some(Import::Constant(value)) => {
                hasher.field("constant").hash(&value.hash());
            }
            None => {
                hasher.field("missing");
            }
        }

        hasher.finish()
    }
}

/// Combines an import's own hash with the hashes of every import it reaches,
/// in name order.
pub(crate) fn closure_hash(own: Hash32, reached: &BTreeSet<String>, hashes: &BTreeMap<String, Hash32>) -> Hash32 {
    let mut hasher = Blake3Hasher::new();
    hasher.hash(&own);
    for name in reached {
        hasher.field(name);
        if let Some(hash) = hashes.get(name) {
            hasher.hash(hash);
        }
    }
    hasher.finish()
}
