//! Running a workflow.
//!
//! A [`Run`] holds the state of one `build` or `outdated` call: a copy of the
//! graph that grows as dynamic targets expand, both metadata generations,
//! and the scopes holding loaded values. The [`scheduler`] drives it.

mod dynamic;
mod report;
mod scheduler;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::codec::codec;
use crate::core::{Blake3Hasher, Hash32, now_millis};
use crate::error::{CacheError, EngineError, TriggerEvaluationError};
use crate::executor::{self, Budget, ExecRequest, Executor};
use crate::graph::{DependencyGraph, Node};
use crate::meta::{FileStamp, Fingerprint, Metadata, MetadataStore, resolve_seed};
use crate::options::Options;
use crate::plan::{Caching, Dynamic, Format, Target};
use crate::scope::{Frame, Layer, ScopeManager};
use crate::trigger::{Decision, Staleness, decide, trigger_hash};
use crate::value::Value;
use crate::workflow::{Compiled, Workflow};

pub use report::{Failure, FailureKind, Report};

use dynamic::Expansion;

pub(crate) fn build(
    workflow: &Workflow,
    cache: &Cache,
    executor: Arc<dyn Executor>,
    options: &Options,
) -> Result<Report, EngineError> {
    let run = Run::new(workflow, cache, executor, options);
    scheduler::Scheduler::new(run)?.run()
}

pub(crate) fn outdated(
    workflow: &Workflow,
    cache: &Cache,
    executor: Arc<dyn Executor>,
    options: &Options,
) -> Result<BTreeSet<String>, EngineError> {
    Run::new(workflow, cache, executor, options).outdated()
}

/// A target, or a sub-target with its bound elements.
pub(crate) struct Unit<'u> {
    pub name: &'u str,
    pub compiled: &'u Compiled,
    pub bindings: &'u [(String, Value)],
    pub layer: Layer,
}

impl Unit<'_> {
    fn is_bound(&self, name: &str) -> bool {
        self.bindings.iter().any(|(bound, _)| bound == name)
    }
}

/// Metadata of a build, short of the value.
#[derive(Debug, Clone)]
pub(crate) struct Record {
    name: String,
    command: Hash32,
    fingerprint: Hash32,
    dependencies: BTreeMap<String, Hash32>,
    /// Stamps of the declared inputs, taken before the build.
    inputs: BTreeMap<String, FileStamp>,
    /// Declared outputs, stamped after the build.
    outputs: Vec<String>,
    seed: u64,
    trigger: &'static str,
    change: Option<Hash32>,
    format: String,
}

impl Record {
    fn finish(&self, value: Hash32, duration: Duration) -> Metadata {
        let mut files = self.inputs.clone();
        for path in &self.outputs {
            let stamp = FileStamp::read(path, None).unwrap_or_else(|err| {
                tracing::warn!("Couldn't stamp output '{path}' of '{}': {err}", self.name);
                FileStamp::default()
            });
            files.insert(path.clone(), stamp);
        }

        Metadata {
            name: self.name.clone(),
            command: self.command,
            fingerprint: self.fingerprint,
            dependencies: self.dependencies.clone(),
            files,
            value,
            built_at: now_millis(),
            seed: self.seed,
            trigger: self.trigger.to_string(),
            change: self.change,
            subtargets: Vec::new(),
            format: self.format.clone(),
            duration: duration.as_millis() as u64,
        }
    }
}

/// The result of the staleness check.
pub(crate) struct Verdict {
    pub decision: Decision,
    pub record: Record,
}

/// Everything a worker needs to build one target.
#[derive(Clone)]
pub(crate) struct Job {
    pub request: ExecRequest,
    pub record: Record,
    pub format: Format,
    pub caching: Caching,
}

/// Writes a built value with its metadata, keeping the metadata it replaces.
pub(crate) fn persist(cache: &Cache, job: &Job, value: &Value, duration: Duration) -> Result<Metadata, CacheError> {
    let meta = job.record.finish(value.hash(), duration);
    cache.rotate_metadata(&meta.name)?;
    cache.store(&meta.name, value, &meta, &job.format)?;
    Ok(meta)
}

pub(crate) struct Run<'a> {
    workflow: &'a Workflow,
    cache: &'a Cache,
    executor: Arc<dyn Executor>,
    options: &'a Options,
    graph: DependencyGraph,
    meta: MetadataStore,
    scope: ScopeManager,
}

impl<'a> Run<'a> {
    fn new(workflow: &'a Workflow, cache: &'a Cache, executor: Arc<dyn Executor>, options: &'a Options) -> Self {
        Self {
            workflow,
            cache,
            executor,
            options,
            graph: workflow.graph().clone(),
            meta: MetadataStore::new(),
            scope: ScopeManager::new(workflow.base().clone(), options.memory),
        }
    }

    /// Cap on the sub-targets of `target`.
    fn cap(&self, target: &Target) -> Option<usize> {
        match (target.max_expand, self.options.max_expand) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Layer the value of a dependency is loaded into.
    fn layer_of(&self, name: &str) -> Layer {
        match self.workflow.compiled(name) {
            Some(compiled) if compiled.target.dynamic.is_some() => Layer::Aggregated,
            _ => Layer::Static,
        }
    }

    /// Makes the cached value of a target available in its layer.
    fn load(&mut self, name: &str) -> Result<Arc<Value>, CacheError> {
        let layer = self.layer_of(name);
        if let Some(value) = self.scope.get(layer, name) {
            return Ok(value.clone());
        }

        let value = Arc::new(self.cache.retrieve(name)?);
        self.scope.load(layer, name, value.clone());
        Ok(value)
    }

    fn unload(&mut self, name: &str) {
        let layer = self.layer_of(name);
        if self.scope.unload(layer, name) {
            tracing::trace!("Unloaded '{name}'");
        }
    }

    /// A frame holding the targets in `names` and the bindings of `unit`.
    fn snapshot<'n>(
        &mut self,
        unit: &Unit<'_>,
        names: impl IntoIterator<Item = &'n String>,
    ) -> Result<Frame, (String, CacheError)> {
        let workflow = self.workflow;
        let mut visible: Vec<&str> = Vec::new();

        for name in names {
            // imports live in the base layer
            if unit.is_bound(name) || workflow.compiled(name).is_none() {
                continue;
            }
            self.load(name).map_err(|err| (name.clone(), err))?;
            visible.push(name);
        }

        // a binding may shadow a loaded input of the same name
        let mut shadowed = Vec::new();
        for (name, value) in unit.bindings {
            if let Some(loaded) = self.scope.get(unit.layer, name) {
                shadowed.push((name, loaded.clone()));
            }
            self.scope.load(unit.layer, name.clone(), Arc::new(value.clone()));
            visible.push(name);
        }

        let frame = self.scope.frame(visible);

        for (name, _) in unit.bindings {
            self.scope.unload(unit.layer, name);
        }
        for (name, loaded) in shadowed {
            self.scope.load(unit.layer, name.clone(), loaded);
        }

        Ok(frame)
    }

    /// Values of the targets a dynamic target branches over.
    fn inputs(&mut self, dynamic: &Dynamic) -> Result<BTreeMap<String, Value>, (String, CacheError)> {
        let mut inputs = BTreeMap::new();
        for name in dynamic.inputs() {
            let value = self.load(name).map_err(|err| (name.to_string(), err))?;
            inputs.insert(name.to_string(), Value::clone(&value));
        }
        Ok(inputs)
    }

    fn expand(&mut self, compiled: &Compiled) -> Result<Vec<Expansion>, Failure> {
        let Some(dynamic) = &compiled.target.dynamic else {
            return Ok(Vec::new());
        };

        let inputs = self.inputs(dynamic).map_err(|(name, err)| {
            Failure::new(
                FailureKind::Infrastructure,
                format!("Couldn't load '{name}' for expansion.\n{err}"),
                0,
            )
        })?;

        let cap = self.cap(&compiled.target);
        dynamic::expand(&compiled.target.name, dynamic, &inputs, cap)
            .map_err(|message| Failure::new(FailureKind::Expansion, message, 0))
    }

    /// Fingerprint and stamps of a unit as it stands now.
    fn record(&mut self, unit: &Unit<'_>) -> Record {
        let workflow = self.workflow;
        let compiled = unit.compiled;
        let target = &compiled.target;
        let spec = &compiled.spec;

        let mut dependencies = BTreeMap::new();

        let mut names: BTreeSet<&str> = spec.targets.iter().map(String::as_str).collect();
        if let Some(dynamic) = &target.dynamic {
            names.extend(dynamic.inputs());
        }
        for name in names {
            if !unit.is_bound(name) {
                let value = self.meta.current(name).map(|meta| meta.value).unwrap_or_default();
                dependencies.insert(name.to_string(), value);
            }
        }
        for (name, value) in unit.bindings {
            dependencies.insert(name.clone(), value.hash());
        }
        for name in &spec.imports {
            dependencies.insert(name.clone(), workflow.import_hash(name).unwrap_or_default());
        }

        let mut inputs = BTreeMap::new();
        for path in &spec.files_in {
            let previous = self.meta.previous(self.cache, unit.name).and_then(|meta| meta.files.get(path)).copied();
            let stamp = self.meta.stamp(path, previous.as_ref());
            dependencies.insert(codec().encode_path(path).to_string(), stamp.content());
            inputs.insert(path.clone(), stamp);
        }

        let seed = resolve_seed(target.seed, self.options.seed, unit.name);
        let canonical = compiled.trigger.as_ref().map(|expr| expr.to_string());
        let format = target.format.name();

        let fingerprint = Fingerprint {
            command: compiled.canonical,
            dependencies: &dependencies,
            trigger: trigger_hash(&target.trigger, canonical.as_deref()),
            seed,
            format: &format,
        }
        .hash();

        Record {
            name: unit.name.to_string(),
            command: compiled.canonical,
            fingerprint,
            dependencies,
            inputs,
            outputs: spec.files_out.iter().cloned().collect(),
            seed,
            trigger: target.trigger.name(),
            change: None,
            format,
        }
    }

    /// Decides whether a unit builds. A unit found current becomes part of
    /// the current generation right away.
    fn assess(&mut self, unit: &Unit<'_>) -> Result<Verdict, Failure> {
        let mut record = self.record(unit);
        let previous = self.meta.previous(self.cache, unit.name).cloned();

        let mut files = record.inputs.clone();
        for path in &record.outputs {
            let old = previous.as_ref().and_then(|meta| meta.files.get(path));
            files.insert(path.clone(), self.meta.stamp(path, old));
        }

        let value_exists = match self.cache.exists(unit.name) {
            Ok(exists) => exists,
            Err(err) => {
                tracing::warn!("Couldn't check the cache for '{}', assuming outdated: {err}", unit.name);
                false
            }
        };

        let staleness = Staleness {
            previous: previous.as_ref(),
            value_exists,
            fingerprint: record.fingerprint,
            files: &files,
        };

        let seed = record.seed;
        let outcome = decide(&unit.compiled.target.trigger, &staleness, || self.evaluate_trigger(unit, seed))
            .map_err(|err| Failure::new(FailureKind::Trigger, err.to_string(), 0))?;
        record.change = outcome.change;

        match (outcome.decision, previous) {
            (Decision::Skip, Some(mut current)) => {
                current.files = files;
                self.meta.set_current(current);
                Ok(Verdict {
                    decision: Decision::Skip,
                    record,
                })
            }
            (decision, _) => {
                if let Decision::Build(reason) = decision {
                    tracing::debug!("'{}' is outdated: {reason}", unit.name);
                }
                Ok(Verdict { decision, record })
            }
        }
    }

    fn evaluate_trigger(&mut self, unit: &Unit<'_>, seed: u64) -> Result<Value, TriggerEvaluationError> {
        let Some(expr) = unit.compiled.trigger.clone() else {
            return Ok(Value::Null);
        };

        let frame = self
            .snapshot(unit, &unit.compiled.spec.trigger)
            .map_err(|(name, err)| TriggerEvaluationError::Load(name, err))?;

        Ok(executor::guarded(|| self.executor.evaluate(&expr, &frame, seed))?)
    }

    /// Prepares the execution of an outdated unit.
    fn job(&mut self, unit: &Unit<'_>, record: Record) -> Result<Job, Failure> {
        let compiled = unit.compiled;
        let target = &compiled.target;

        let frame = self.snapshot(unit, &compiled.spec.targets).map_err(|(name, err)| {
            Failure::new(
                FailureKind::Infrastructure,
                format!("Couldn't load dependency '{name}'.\n{err}"),
                0,
            )
        })?;

        Ok(Job {
            request: ExecRequest {
                target: unit.name.to_string(),
                command: compiled.command.clone(),
                frame,
                seed: record.seed,
                resources: target.resources.clone(),
                budget: Budget {
                    elapsed: target.elapsed,
                    cpu: target.cpu,
                },
            },
            record,
            format: target.format.clone(),
            caching: target.caching,
        })
    }

    /// Records a dynamic target once all of its sub-targets are built.
    /// Returns whether anything changed.
    fn finish_parent(&mut self, record: &Record, subtargets: &[String], rebuilt: bool) -> Result<bool, CacheError> {
        let mut hasher = Blake3Hasher::new();
        for name in subtargets {
            let value = self.meta.current(name).map(|meta| meta.value).unwrap_or_default();
            hasher.field(name).hash(&value);
        }
        let value = hasher.finish();

        let previous = self.meta.previous(self.cache, &record.name).cloned();
        if !rebuilt
            && let Some(previous) = previous
            && previous.subtargets == subtargets
            && previous.fingerprint == record.fingerprint
            && previous.value == value
        {
            self.meta.set_current(previous);
            return Ok(false);
        }

        let mut meta = record.finish(value, Duration::ZERO);
        meta.subtargets = subtargets.to_vec();
        self.cache.rotate_metadata(&record.name)?;
        self.cache.store_subtargets(&record.name, meta.subtargets.clone(), &meta)?;
        self.meta.set_current(meta);
        Ok(true)
    }

    /// The dry run behind [`Workflow::outdated`].
    fn outdated(&mut self) -> Result<BTreeSet<String>, EngineError> {
        let workflow = self.workflow;
        let patterns = self.options.patterns()?;
        let selected = self.graph.select(&patterns);
        let order = self.graph.topological()?;

        let mut stale = HashSet::new();
        let mut names = BTreeSet::new();

        for index in order {
            if !selected.contains(&index) {
                continue;
            }
            let Node::Target(name) = self.graph.node(index) else {
                continue;
            };
            let Some(compiled) = workflow.compiled(name) else {
                continue;
            };

            let upstream = self.graph.upstream(index).iter().any(|node| stale.contains(node));
            let outdated = upstream
                || match &compiled.target.dynamic {
                    None => self.is_outdated(&Unit {
                        name: &compiled.target.name,
                        compiled,
                        bindings: &[],
                        layer: Layer::Static,
                    }),
                    Some(dynamic) => self.is_dynamic_outdated(compiled, dynamic),
                };

            if outdated {
                stale.insert(index);
                names.insert(compiled.target.name.clone());
            }
        }

        Ok(names)
    }

    fn is_outdated(&mut self, unit: &Unit<'_>) -> bool {
        match self.assess(unit) {
            Ok(verdict) => verdict.decision.is_build(),
            Err(failure) => {
                tracing::debug!("'{}' counts as outdated: {}", unit.name, failure.message);
                true
            }
        }
    }

    fn is_dynamic_outdated(&mut self, compiled: &Compiled, dynamic: &Dynamic) -> bool {
        let name = &compiled.target.name;
        let layer = dynamic::layer(dynamic);
        let record = self.record(&Unit {
            name,
            compiled,
            bindings: &[],
            layer,
        });

        let Some(previous) = self.meta.previous(self.cache, name).cloned() else {
            return true;
        };
        if previous.fingerprint != record.fingerprint {
            return true;
        }

        let Ok(expansions) = self.expand(compiled) else {
            return true;
        };
        let subtargets: Vec<&str> = expansions.iter().map(|sub| sub.name.as_str()).collect();
        if subtargets != previous.subtargets {
            return true;
        }

        let mut outdated = false;
        for sub in &expansions {
            outdated |= self.is_outdated(&Unit {
                name: &sub.name,
                compiled,
                bindings: &sub.bindings,
                layer,
            });
        }

        if !outdated {
            self.meta.set_current(previous);
        }
        outdated
    }
}
