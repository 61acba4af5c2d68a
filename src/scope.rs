//! Layered bindings that expose dependency values to commands.
//!
//! Lookups go from the innermost layer outwards:
//!
//! 1. sub-target: elements bound for one dynamic sub-target
//! 2. aggregated: whole collections of dynamic targets
//! 3. static: values of ordinary targets
//! 4. base: the user's imports, read-only
//!
//! The [`ScopeManager`] owns the three upper layers for the duration of a run
//! and hands executors immutable [`Frame`] snapshots. Loading and unloading
//! touches exactly one binding of one layer; the base layer is shared behind
//! an `Arc` and never written.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::expr::Expr;
use crate::imports::{Import, Imports};
use crate::value::Value;

/// The read-only base layer: imports plus the parsed bodies of expression
/// functions.
#[derive(Debug, Default)]
pub struct Base {
    imports: Arc<Imports>,
    functions: HashMap<String, Arc<Expr>>,
}

impl Base {
    pub(crate) fn new(imports: Arc<Imports>, functions: HashMap<String, Arc<Expr>>) -> Self {
        Self { imports, functions }
    }

    pub fn imports(&self) -> &Imports {
        &self.imports
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Static,
    Aggregated,
    Subtarget,
}

impl Layer {
    fn slot(self) -> usize {
        match self {
            Layer::Static => 0,
            Layer::Aggregated => 1,
            Layer::Subtarget => 2,
        }
    }
}

/// Lookup order of the value layers, innermost first.
const LOOKUP: [Layer; 3] = [Layer::Subtarget, Layer::Aggregated, Layer::Static];

type Bindings = HashMap<String, Arc<Value>>;

/// What a name resolves to.
#[derive(Debug, Clone, Copy)]
pub enum Binding<'a> {
    Value(&'a Value),
    Import(&'a Import),
}

/// An immutable snapshot of the bindings visible to one command.
#[derive(Debug, Clone)]
pub struct Frame {
    base: Arc<Base>,
    layers: [Arc<Bindings>; 3],
}

impl Frame {
    /// A frame with nothing but the base layer.
    pub fn new(base: Arc<Base>) -> Self {
        Self {
            base,
            layers: Default::default(),
        }
    }

    /// Adds a binding to a layer of this snapshot.
    pub fn with(mut self, layer: Layer, name: impl Into<String>, value: impl Into<Value>) -> Self {
        Arc::make_mut(&mut self.layers[layer.slot()]).insert(name.into(), Arc::new(value.into()));
        self
    }

    pub fn lookup(&self, name: &str) -> Option<Binding<'_>> {
        for layer in LOOKUP {
            if let Some(value) = self.layers[layer.slot()].get(name) {
                return Some(Binding::Value(value));
            }
        }
        self.base.imports.get(name).map(Binding::Import)
    }

    /// The value bound to `name`, including import constants.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.lookup(name)? {
            Binding::Value(value) => Some(value),
            Binding::Import(Import::Constant(value)) => Some(value),
            Binding::Import(_) => None,
        }
    }

    /// The value bound in one specific layer.
    pub fn value_in(&self, layer: Layer, name: &str) -> Option<&Value> {
        self.layers[layer.slot()].get(name).map(|value| &**value)
    }

    pub fn import(&self, name: &str) -> Option<&Import> {
        self.base.imports.get(name)
    }

    /// Parameters and parsed body of an expression function.
    pub fn function(&self, name: &str) -> Option<(&[String], &Expr)> {
        match self.base.imports.get(name)? {
            Import::Function { params, .. } => {
                let body = self.base.functions.get(name)?;
                Some((params.as_slice(), &**body))
            }
            _ => None,
        }
    }

    pub fn base(&self) -> &Arc<Base> {
        &self.base
    }
}

/// When values are dropped from memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStrategy {
    /// Keep every loaded value until the run ends.
    #[default]
    Speed,
    /// Drop a value once every target that reads it has finished.
    Autoclean,
    /// Drop the values a target read as soon as it is dispatched.
    Unload,
}

/// Owner of the mutable layers during a run.
pub struct ScopeManager {
    base: Arc<Base>,
    layers: [Bindings; 3],
    strategy: MemoryStrategy,
}

impl ScopeManager {
    pub fn new(base: Arc<Base>, strategy: MemoryStrategy) -> Self {
        Self {
            base,
            layers: Default::default(),
            strategy,
        }
    }

    pub fn strategy(&self) -> MemoryStrategy {
        self.strategy
    }

    /// Binds `name` in `layer`, replacing an earlier binding of that layer.
    pub fn load(&mut self, layer: Layer, name: impl Into<String>, value: Arc<Value>) {
        self.layers[layer.slot()].insert(name.into(), value);
    }

    /// Removes a single binding. Returns whether it was bound.
    pub fn unload(&mut self, layer: Layer, name: &str) -> bool {
        self.layers[layer.slot()].remove(name).is_some()
    }

    pub fn is_loaded(&self, layer: Layer, name: &str) -> bool {
        self.layers[layer.slot()].contains_key(name)
    }

    pub fn get(&self, layer: Layer, name: &str) -> Option<&Arc<Value>> {
        self.layers[layer.slot()].get(name)
    }

    /// Number of bindings across the upper layers.
    pub fn len(&self) -> usize {
        self.layers.iter().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot holding the bindings of `names` in every layer.
    pub fn frame<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Frame {
        let mut layers: [Bindings; 3] = Default::default();

        for name in names {
            for (slot, layer) in self.layers.iter().enumerate() {
                if let Some(value) = layer.get(name) {
                    layers[slot].insert(name.to_string(), value.clone());
                }
            }
        }

        Frame {
            base: self.base.clone(),
            layers: layers.map(Arc::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Arc<Base> {
        let imports = Imports::new()
            .constant("x", Value::Int(0))
            .function("twice", ["v"], "v * 2");
        let functions = HashMap::from([("twice".to_string(), Arc::new(Expr::parse("v * 2").unwrap()))]);
        Arc::new(Base::new(Arc::new(imports), functions))
    }

    #[test]
    fn test_lookup_order() {
        let mut scope = ScopeManager::new(base(), MemoryStrategy::Speed);
        scope.load(Layer::Static, "x", Arc::new(Value::Int(1)));
        scope.load(Layer::Aggregated, "x", Arc::new(Value::Int(2)));
        scope.load(Layer::Subtarget, "x", Arc::new(Value::Int(3)));

        let frame = scope.frame(["x"]);
        assert_eq!(frame.value("x"), Some(&Value::Int(3)));
        assert_eq!(frame.value_in(Layer::Static, "x"), Some(&Value::Int(1)));

        scope.unload(Layer::Subtarget, "x");
        assert_eq!(scope.frame(["x"]).value("x"), Some(&Value::Int(2)));

        scope.unload(Layer::Aggregated, "x");
        scope.unload(Layer::Static, "x");
        // the base layer shows through again, untouched
        assert_eq!(scope.frame(["x"]).value("x"), Some(&Value::Int(0)));
    }

    #[test]
    fn test_unload_leaves_siblings() {
        let mut scope = ScopeManager::new(base(), MemoryStrategy::Unload);
        scope.load(Layer::Static, "a", Arc::new(Value::Int(1)));
        scope.load(Layer::Static, "b", Arc::new(Value::Int(2)));

        let before = scope.frame(["a", "b"]);
        assert!(scope.unload(Layer::Static, "a"));
        assert!(!scope.unload(Layer::Static, "a"));

        assert!(scope.is_loaded(Layer::Static, "b"));
        assert_eq!(scope.len(), 1);
        // snapshots are not affected by later unloads
        assert_eq!(before.value("a"), Some(&Value::Int(1)));
        assert_eq!(scope.frame(["a"]).value("a"), None);
    }

    #[test]
    fn test_frame_only_holds_requested_names() {
        let mut scope = ScopeManager::new(base(), MemoryStrategy::Speed);
        scope.load(Layer::Static, "a", Arc::new(Value::Int(1)));
        scope.load(Layer::Static, "b", Arc::new(Value::Int(2)));

        let frame = scope.frame(["a"]);
        assert!(frame.value("a").is_some());
        assert!(frame.value("b").is_none());
    }

    #[test]
    fn test_functions() {
        let frame = Frame::new(base()).with(Layer::Static, "y", 4i64);
        let (params, body) = frame.function("twice").unwrap();
        assert_eq!(params, ["v"]);
        assert_eq!(body.to_string(), "(v * 2)");
        assert!(frame.function("x").is_none());
        assert!(matches!(frame.lookup("twice"), Some(Binding::Import(_))));
        assert_eq!(frame.value("y"), Some(&Value::Int(4)));
    }
}
