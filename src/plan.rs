//! The plan: the catalog of targets of one workflow.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::FormatPlugin;
use crate::error::OptionsError;

/// Rule deciding whether a target must rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "expr", rename_all = "lowercase")]
pub enum Trigger {
    /// Rebuild when the command, a dependency or a declared file changes.
    #[default]
    Command,
    /// Rebuild when a declared file changes, ignoring command edits.
    File,
    /// Rebuild whenever the expression evaluates to `true`.
    Condition(String),
    /// Rebuild whenever the value of the expression changes.
    Change(String),
    Always,
    Never,
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Command => "command",
            Trigger::File => "file",
            Trigger::Condition(_) => "condition",
            Trigger::Change(_) => "change",
            Trigger::Always => "always",
            Trigger::Never => "never",
        }
    }

    /// Text of the expression evaluated by `condition` and `change`.
    pub fn expression(&self) -> Option<&str> {
        match self {
            Trigger::Condition(expr) | Trigger::Change(expr) => Some(expr),
            _ => None,
        }
    }
}

/// How a target's value is stored.
#[derive(Clone, Default)]
pub enum Format {
    /// CBOR, inline in the value entry.
    #[default]
    Native,
    /// A JSON document stored outside the value entry.
    Json,
    /// An external serializer.
    Plugin(Arc<dyn FormatPlugin>),
}

impl Format {
    pub fn name(&self) -> String {
        match self {
            Format::Native => "native".into(),
            Format::Json => "json".into(),
            Format::Plugin(plugin) => plugin.name().into(),
        }
    }
}

impl std::fmt::Debug for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Format({})", self.name())
    }
}

impl PartialEq for Format {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Serialize for Format {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.name())
    }
}

impl<'de> Deserialize<'de> for Format {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        match name.as_str() {
            "native" => Ok(Format::Native),
            "json" => Ok(Format::Json),
            other => Err(serde::de::Error::custom(format!(
                "unknown format '{other}', plugins must be set in code"
            ))),
        }
    }
}

/// Declares a target as dynamic: it branches over the elements of other
/// targets at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Dynamic {
    /// One sub-target per element; several targets are zipped.
    Map { over: Vec<String> },
    /// One sub-target per combination of elements.
    Cross { over: Vec<String> },
    /// One sub-target per distinct value of `by`, holding the matching
    /// elements of `over`.
    Group { over: String, by: String },
    /// A single sub-target holding every element.
    Aggregate { over: Vec<String> },
}

impl Dynamic {
    /// Targets whose elements are branched over.
    pub fn over(&self) -> Vec<&str> {
        match self {
            Dynamic::Map { over } | Dynamic::Cross { over } | Dynamic::Aggregate { over } => {
                over.iter().map(String::as_str).collect()
            }
            Dynamic::Group { over, .. } => vec![over.as_str()],
        }
    }

    /// Every target the expansion reads, including the grouping key.
    pub fn inputs(&self) -> Vec<&str> {
        let mut names = self.over();
        if let Dynamic::Group { by, .. } = self {
            names.push(by);
        }
        names
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Dynamic::Map { .. } => "map",
            Dynamic::Cross { .. } => "cross",
            Dynamic::Group { .. } => "group",
            Dynamic::Aggregate { .. } => "aggregate",
        }
    }
}

/// Who writes a built value to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Caching {
    /// The scheduler writes it after the worker hands the value back.
    #[default]
    Main,
    /// The worker writes it before reporting completion.
    Worker,
}

/// A named unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub format: Format,
    #[serde(default)]
    pub dynamic: Option<Dynamic>,
    /// Wall-clock budget per attempt.
    #[serde(default, with = "seconds")]
    pub elapsed: Option<Duration>,
    /// CPU budget per attempt, enforced by the executor.
    #[serde(default, with = "seconds")]
    pub cpu: Option<Duration>,
    /// Additional attempts after a failure.
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Opaque hints handed to the executor, e.g. for remote workers.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    /// Tie-breaker among targets that become ready together; higher first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub caching: Caching,
    /// Upper bound on the number of dynamic sub-targets.
    #[serde(default)]
    pub max_expand: Option<usize>,
}

impl Target {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            trigger: Trigger::default(),
            format: Format::default(),
            dynamic: None,
            elapsed: None,
            cpu: None,
            retries: None,
            seed: None,
            resources: BTreeMap::new(),
            priority: 0,
            caching: Caching::default(),
            max_expand: None,
        }
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn dynamic(mut self, dynamic: Dynamic) -> Self {
        self.dynamic = Some(dynamic);
        self
    }

    pub fn elapsed(mut self, budget: Duration) -> Self {
        self.elapsed = Some(budget);
        self
    }

    pub fn cpu(mut self, budget: Duration) -> Self {
        self.cpu = Some(budget);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn resource(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resources.insert(key.into(), value.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn caching(mut self, caching: Caching) -> Self {
        self.caching = caching;
        self
    }

    pub fn max_expand(mut self, max: usize) -> Self {
        self.max_expand = Some(max);
        self
    }
}

/// The ordered catalog of targets.
///
/// # Example
///
/// ```rust
/// use nagare::{Plan, Target};
///
/// let plan = Plan::new()
///     .target(Target::new("raw", r#"read(file_in("data.csv"))"#))
///     .target(Target::new("summary", "summarize(raw)"));
/// assert_eq!(plan.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    targets: Vec<Target>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a plan from a JSON array of target records.
    pub fn from_json(text: &str) -> Result<Self, OptionsError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn add(&mut self, target: Target) -> &mut Self {
        self.targets.push(target);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|target| target.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl FromIterator<Target> for Plan {
    fn from_iter<I: IntoIterator<Item = Target>>(iter: I) -> Self {
        Self {
            targets: iter.into_iter().collect(),
        }
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => s.serialize_some(&duration.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        match secs {
            Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
            Some(secs) => Err(serde::de::Error::custom(format!("invalid duration {secs}"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_from_json() {
        let plan = Plan::from_json(
            r#"[
                {"name": "raw", "command": "load()"},
                {
                    "name": "fit",
                    "command": "model(raw)",
                    "trigger": {"kind": "condition", "expr": "redo"},
                    "format": "json",
                    "dynamic": {"kind": "map", "over": ["raw"]},
                    "elapsed": 1.5,
                    "retries": 2,
                    "caching": "worker",
                    "max_expand": 3
                }
            ]"#,
        )
        .unwrap();

        assert_eq!(plan.len(), 2);
        let fit = plan.get("fit").unwrap();
        assert_eq!(fit.trigger, Trigger::Condition("redo".into()));
        assert_eq!(fit.format, Format::Json);
        assert_eq!(fit.elapsed, Some(Duration::from_millis(1500)));
        assert_eq!(fit.retries, Some(2));
        assert_eq!(fit.caching, Caching::Worker);
        assert_eq!(fit.max_expand, Some(3));
        assert_eq!(fit.dynamic.as_ref().unwrap().over(), ["raw"]);

        let raw = plan.get("raw").unwrap();
        assert_eq!(raw.trigger, Trigger::Command);
        assert_eq!(raw.format, Format::Native);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let err = Plan::from_json(r#"[{"name": "a", "command": "x", "format": "hdf5"}]"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_unit_trigger_json() {
        let plan = Plan::from_json(r#"[{"name": "a", "command": "x", "trigger": {"kind": "always"}}]"#)
            .unwrap();
        assert_eq!(plan.get("a").unwrap().trigger, Trigger::Always);
    }

    #[test]
    fn test_group_inputs() {
        let dynamic = Dynamic::Group {
            over: "rows".into(),
            by: "keys".into(),
        };
        assert_eq!(dynamic.over(), ["rows"]);
        assert_eq!(dynamic.inputs(), ["rows", "keys"]);
    }
}
