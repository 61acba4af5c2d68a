//! The entry point: a plan and its imports, analysed and linked into a graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::analysis::{Names, SpecCache, Specification, analyse_body, reach, scan_reports};
use crate::cache::Cache;
use crate::core::Hash32;
use crate::engine::{self, Report};
use crate::error::{CacheError, EngineError, SpecificationError, SpecificationErrorKind};
use crate::executor::Executor;
use crate::expr::Expr;
use crate::graph::{DependencyGraph, Entry};
use crate::imports::{Import, Imports, closure_hash};
use crate::options::Options;
use crate::plan::{Plan, Target};
use crate::scope::Base;

/// A target together with everything derived from it at load time.
#[derive(Debug)]
pub(crate) struct Compiled {
    pub target: Target,
    pub command: Arc<Expr>,
    /// Hash of the canonical command text.
    pub canonical: Hash32,
    pub trigger: Option<Arc<Expr>>,
    pub spec: Specification,
    /// Position in the plan.
    pub order: usize,
}

/// An analysed, validated workflow.
///
/// Construction runs the static analysis of every command and builds the
/// dependency graph; a plan with unparsable commands or cycles never gets
/// this far. The workflow itself is immutable and can be built any number of
/// times against any cache.
///
/// # Example
///
/// ```rust
/// use nagare::{Args, Cache, Imports, Interpreter, Options, Plan, Target, Value, Workflow};
///
/// let imports = Imports::new().native("double", "1", |args: &Args| {
///     Ok(Value::Int(args.get(0)?.as_int().unwrap_or(0) * 2))
/// });
/// let plan = Plan::new()
///     .target(Target::new("a", "21"))
///     .target(Target::new("b", "double(a)"));
///
/// let workflow = Workflow::new(plan, imports).unwrap();
/// let cache = Cache::memory();
/// let report = workflow
///     .build(&cache, Interpreter::new(), &Options::new().progress(false))
///     .unwrap();
///
/// assert!(report.is_success());
/// assert_eq!(cache.retrieve("b").unwrap(), Value::Int(42));
/// ```
pub struct Workflow {
    targets: Vec<Compiled>,
    index: HashMap<String, usize>,
    import_hashes: BTreeMap<String, Hash32>,
    graph: DependencyGraph,
    base: Arc<Base>,
}

impl Workflow {
    pub fn new(plan: Plan, imports: Imports) -> Result<Self, EngineError> {
        Self::with_spec_cache(plan, imports, &mut SpecCache::new())
    }

    /// Like [`Workflow::new`], reusing the analysis of commands seen before.
    pub fn with_spec_cache(plan: Plan, imports: Imports, specs: &mut SpecCache) -> Result<Self, EngineError> {
        let names = Names::new(
            plan.iter().map(|target| target.name.clone()).collect(),
            imports.names().map(str::to_string).collect(),
        );

        let mut errors = Vec::new();

        // imports first, targets reach through their function bodies
        let mut functions = BTreeMap::new();
        let mut bodies = HashMap::new();
        for (name, import) in imports.iter() {
            let spec = match import {
                Import::Function { params, body } => match function(body, params, &names) {
                    Ok((expr, spec)) => {
                        bodies.insert(name.to_string(), Arc::new(expr));
                        spec
                    }
                    Err(kind) => {
                        errors.push(SpecificationError::import(name, kind));
                        Specification::default()
                    }
                },
                _ => Specification::default(),
            };
            functions.insert(name.to_string(), spec);
        }

        let mut own = BTreeMap::new();
        for name in functions.keys() {
            let canonical = bodies.get(name).map(|body| body.to_string());
            own.insert(name.clone(), imports.own_hash(name, canonical.as_deref()));
        }
        let import_hashes = functions
            .keys()
            .map(|name| {
                let (reached, _) = reach(&BTreeSet::from([name.clone()]), &functions);
                (name.clone(), closure_hash(own[name], &reached, &own))
            })
            .collect();

        let mut targets = Vec::with_capacity(plan.len());
        for (order, target) in plan.iter().enumerate() {
            match compile(target, order, &names, &functions, specs) {
                Ok(compiled) => targets.push(compiled),
                Err(mut errs) => errors.append(&mut errs),
            }
        }

        if !errors.is_empty() {
            return Err(EngineError::Specification(errors));
        }

        let entries: Vec<Entry<'_>> = targets
            .iter()
            .map(|compiled| Entry {
                name: &compiled.target.name,
                spec: &compiled.spec,
                dynamic: compiled.target.dynamic.as_ref(),
            })
            .collect();
        let graph = DependencyGraph::build(&entries, &functions)?;

        let index = targets
            .iter()
            .enumerate()
            .map(|(i, compiled)| (compiled.target.name.clone(), i))
            .collect();

        tracing::debug!(
            "Loaded {} targets and {} imports, {} graph nodes",
            targets.len(),
            imports.len(),
            graph.len()
        );

        Ok(Self {
            targets,
            index,
            import_hashes,
            graph,
            base: Arc::new(Base::new(Arc::new(imports), bodies)),
        })
    }

    /// Builds every outdated target, or the ones selected in `options`.
    ///
    /// Failures of single targets are reported in the [`Report`]. An `Err`
    /// means the run itself could not go on, e.g. because the cache could not
    /// be written.
    pub fn build(
        &self,
        cache: &Cache,
        executor: impl Executor + 'static,
        options: &Options,
    ) -> Result<Report, EngineError> {
        options.validate()?;
        engine::build(self, cache, Arc::new(executor), options)
    }

    /// Targets a `build` with the same arguments would run. Nothing is
    /// executed or written; unreadable cache entries count as outdated.
    pub fn outdated(
        &self,
        cache: &Cache,
        executor: impl Executor + 'static,
        options: &Options,
    ) -> Result<BTreeSet<String>, EngineError> {
        options.validate()?;
        engine::outdated(self, cache, Arc::new(executor), options)
    }

    /// Removes every cache entry that no longer belongs to a target of this
    /// workflow.
    pub fn clean(&self, cache: &Cache) -> Result<Vec<String>, CacheError> {
        let keep = self.targets.iter().map(|compiled| compiled.target.name.clone()).collect();
        cache.clean(&keep)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn specification(&self, name: &str) -> Option<&Specification> {
        self.compiled(name).map(|compiled| &compiled.spec)
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter().map(|compiled| &compiled.target)
    }

    pub fn imports(&self) -> &Imports {
        self.base.imports()
    }

    pub(crate) fn compiled(&self, name: &str) -> Option<&Compiled> {
        self.index.get(name).map(|&i| &self.targets[i])
    }

    pub(crate) fn import_hash(&self, name: &str) -> Option<Hash32> {
        self.import_hashes.get(name).copied()
    }

    pub(crate) fn base(&self) -> &Arc<Base> {
        &self.base
    }
}

fn function(body: &str, params: &[String], names: &Names) -> Result<(Expr, Specification), SpecificationErrorKind> {
    let expr = Expr::parse(body)?;
    let spec = analyse_body(&expr, params, names)?;
    Ok((expr, spec))
}

fn compile(
    target: &Target,
    order: usize,
    names: &Names,
    functions: &BTreeMap<String, Specification>,
    specs: &mut SpecCache,
) -> Result<Compiled, Vec<SpecificationError>> {
    let mut errors = Vec::new();
    let fail = |kind| SpecificationError::target(&target.name, kind);

    let (command, mut spec) = match specs.analyse(&target.command, names) {
        Ok(found) => found,
        Err(kind) => return Err(vec![fail(kind)]),
    };

    if let Err(kind) = scan_reports(&mut spec, names) {
        errors.push(fail(kind));
    }

    let (imports, reached) = reach(&spec.imports, functions);
    spec.imports = imports;
    spec.targets.extend(reached);

    let mut trigger = None;
    if let Some(text) = target.trigger.expression() {
        match specs.analyse(text, names) {
            Ok((expr, found)) => {
                let (imports, reached) = reach(&found.imports, functions);
                spec.trigger = found.targets.into_iter().chain(reached).chain(imports).collect();
                trigger = Some(expr);
            }
            Err(kind) => errors.push(fail(kind)),
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(Compiled {
        target: target.clone(),
        canonical: Hash32::hash(command.to_string()),
        command,
        trigger,
        spec,
        order,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CycleError;
    use crate::imports::Args;
    use crate::plan::Trigger;
    use crate::value::Value;

    #[test]
    fn test_specification_errors_are_collected() {
        let plan = Plan::new()
            .target(Target::new("a", "f("))
            .target(Target::new("b", "file_in(a)"))
            .target(Target::new("c", "1"));
        let imports = Imports::new().function("g", ["x"], "x +");

        let Err(EngineError::Specification(errors)) = Workflow::new(plan, imports) else {
            panic!("expected specification errors");
        };
        let owners: Vec<_> = errors.iter().map(|err| err.name.as_str()).collect();
        assert_eq!(owners, ["g", "a", "b"]);
    }

    #[test]
    fn test_deeply_nested_command_is_rejected() {
        let deep = format!("{}1{}", "[".repeat(50_000), "]".repeat(50_000));
        let plan = Plan::new().target(Target::new("deep", deep)).target(Target::new("ok", "1"));

        let Err(EngineError::Specification(errors)) = Workflow::new(plan, Imports::new()) else {
            panic!("expected specification errors");
        };
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].kind, SpecificationErrorKind::Parse(_)));
    }

    #[test]
    fn test_cycle_aborts() {
        let plan = Plan::new()
            .target(Target::new("a", "c + 1"))
            .target(Target::new("b", "a + 1"))
            .target(Target::new("c", "b + 1"));

        let Err(EngineError::Cycle(CycleError { cycle })) = Workflow::new(plan, Imports::new()) else {
            panic!("expected a cycle");
        };
        // a requires c, c requires b, b requires a
        assert_eq!(cycle, ["a", "c", "b"]);
    }

    #[test]
    fn test_functions_reach_targets() {
        let plan = Plan::new()
            .target(Target::new("raw", "[1, 2]"))
            .target(Target::new("out", "summary(0)").trigger(Trigger::Condition("flag(1)".into())));
        let imports = Imports::new()
            .function("summary", ["n"], "helper(n)")
            .function("helper", ["n"], "len(raw) + n")
            .native("flag", "1", |_: &Args| Ok(Value::Bool(true)));

        let workflow = Workflow::new(plan, imports).unwrap();
        let spec = workflow.specification("out").unwrap();
        assert!(spec.targets.contains("raw"));
        assert_eq!(spec.imports, BTreeSet::from(["helper".into(), "summary".into()]));
        assert_eq!(spec.trigger, BTreeSet::from(["flag".into()]));
    }

    #[test]
    fn test_import_hash_follows_callees() {
        let load = |body: &str| {
            let imports = Imports::new()
                .function("outer", ["x"], "inner(x)")
                .function("inner", ["x"], body.to_string());
            Workflow::new(Plan::new(), imports).unwrap()
        };

        let first = load("x + 1");
        let formatted = load("x   +   1");
        let edited = load("x + 2");

        assert_eq!(first.import_hash("outer"), formatted.import_hash("outer"));
        assert_ne!(first.import_hash("outer"), edited.import_hash("outer"));
    }
}
