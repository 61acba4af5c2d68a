//! The global dependency graph.
//!
//! Nodes are targets, imports, declared files and, once a run expands a
//! dynamic target, its sub-targets. Edges point from a dependency to its
//! dependent, so a topological order is a valid build order.
//!
//! ## Files
//!
//! Files are nodes of their own. A target reading `file_in("x")` gets an edge
//! `x -> target`, a target writing `file_out("x")` an edge `target -> x`.
//! When one target writes the file another one reads, the two are ordered
//! through the file node without any direct reference between them.
//!
//! ## Sub-targets
//!
//! Sub-targets are appended at runtime with a single edge from their parent.
//! The parent is already resolved at that point, so no insertion can close a
//! cycle and the graph is never re-validated.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use glob::Pattern;
use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use crate::analysis::Specification;
use crate::codec::codec;
use crate::error::{CycleError, EngineError, GraphError};
use crate::plan::Dynamic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Target(String),
    Import(String),
    File(String),
    Subtarget { parent: String, name: String },
}

impl Node {
    /// Target, import or sub-target name, or the file path.
    pub fn name(&self) -> &str {
        match self {
            Node::Target(name) | Node::Import(name) | Node::File(name) => name,
            Node::Subtarget { name, .. } => name,
        }
    }

    /// Whether the node is built by the scheduler.
    pub fn is_buildable(&self) -> bool {
        matches!(self, Node::Target(_) | Node::Subtarget { .. })
    }

    fn key(&self) -> String {
        match self {
            Node::File(path) => codec().encode_path(path).to_string(),
            other => other.name().to_string(),
        }
    }
}

/// A target as seen by the graph builder.
pub(crate) struct Entry<'a> {
    pub name: &'a str,
    pub spec: &'a Specification,
    pub dynamic: Option<&'a Dynamic>,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: Graph<Node, ()>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Assembles and validates the graph.
    ///
    /// `functions` holds the analysis of every import; only expression
    /// functions have non-empty specifications.
    pub(crate) fn build(
        targets: &[Entry<'_>],
        functions: &BTreeMap<String, Specification>,
    ) -> Result<Self, EngineError> {
        let mut this = Self::default();

        for name in functions.keys() {
            this.add(Node::Import(name.clone()));
        }

        for entry in targets {
            if functions.contains_key(entry.name) {
                return Err(GraphError::NameClash(entry.name.to_string()).into());
            }
            if this.index.contains_key(entry.name) {
                return Err(GraphError::DuplicateTarget(entry.name.to_string()).into());
            }
            this.add(Node::Target(entry.name.to_string()));
        }

        let mut producers: HashMap<&str, &str> = HashMap::new();

        for entry in targets {
            let target = this.index[entry.name];

            if let Some(dynamic) = entry.dynamic {
                for name in dynamic.inputs() {
                    match this.find(name) {
                        Some(dep) if matches!(this.graph[dep], Node::Target(_)) => {
                            this.graph.update_edge(dep, target, ());
                        }
                        _ => {
                            return Err(GraphError::UnknownDynamic {
                                target: entry.name.to_string(),
                                name: name.to_string(),
                            }
                            .into());
                        }
                    }
                }
            }

            let names = entry
                .spec
                .targets
                .iter()
                .chain(&entry.spec.imports)
                .chain(&entry.spec.trigger);
            for name in names {
                if let Some(dep) = this.find(name) {
                    this.graph.update_edge(dep, target, ());
                }
            }

            for path in &entry.spec.files_in {
                let file = this.add(Node::File(path.clone()));
                this.graph.update_edge(file, target, ());
            }

            for path in &entry.spec.files_out {
                if let Some(first) = producers.insert(path, entry.name) {
                    return Err(GraphError::DuplicateOutput {
                        path: path.clone(),
                        first: first.to_string(),
                        second: entry.name.to_string(),
                    }
                    .into());
                }
                let file = this.add(Node::File(path.clone()));
                this.graph.update_edge(target, file, ());
            }
        }

        for (name, spec) in functions {
            let import = this.index[name.as_str()];
            for dep in &spec.imports {
                if dep != name
                    && let Some(dep) = this.find(dep)
                {
                    this.graph.update_edge(dep, import, ());
                }
            }
        }

        this.check_cycles()?;
        Ok(this)
    }

    fn add(&mut self, node: Node) -> NodeIndex {
        let key = node.key();
        if let Some(&index) = self.index.get(&key) {
            return index;
        }
        let index = self.graph.add_node(node);
        self.index.insert(key, index);
        index
    }

    fn check_cycles(&self) -> Result<(), CycleError> {
        for scc in tarjan_scc(&self.graph) {
            let looped = scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]);
            if looped {
                return Err(self.cycle_in(&scc));
            }
        }
        Ok(())
    }

    /// A simple cycle through the strongly connected component, listed so
    /// that each member requires the next one.
    fn cycle_in(&self, scc: &[NodeIndex]) -> CycleError {
        let members: HashSet<NodeIndex> = scc.iter().copied().collect();
        let start = scc
            .iter()
            .copied()
            .min_by(|a, b| self.graph[*a].name().cmp(self.graph[*b].name()))
            .unwrap_or(scc[0]);

        // breadth-first over "requires" edges back to the start
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut last = start;

        'search: while let Some(node) = queue.pop_front() {
            for dep in self.graph.neighbors_directed(node, Direction::Incoming) {
                if !members.contains(&dep) {
                    continue;
                }
                if dep == start {
                    last = node;
                    break 'search;
                }
                if let std::collections::hash_map::Entry::Vacant(slot) = parent.entry(dep) {
                    slot.insert(node);
                    queue.push_back(dep);
                }
            }
        }

        let mut path = vec![last];
        while let Some(&prev) = parent.get(path.last().unwrap_or(&start)) {
            path.push(prev);
        }
        path.reverse();

        CycleError {
            cycle: path.iter().map(|&i| self.graph[i].name().to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.graph[index]
    }

    /// Index of a target, import or sub-target by name, or of a file by path.
    pub fn find(&self, name: &str) -> Option<NodeIndex> {
        self.index
            .get(name)
            .or_else(|| self.index.get(&*codec().encode_path(name)))
            .copied()
    }

    /// Every node, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.graph
            .node_indices()
            .map(|index| (index, &self.graph[index]))
    }

    pub fn dependencies(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> {
        self.graph.neighbors_directed(index, Direction::Incoming)
    }

    pub fn dependents(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> {
        self.graph.neighbors_directed(index, Direction::Outgoing)
    }

    /// Buildable nodes this one waits for. Files are looked through to the
    /// targets that write them.
    pub fn upstream(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.buildable_neighbors(index, Direction::Incoming)
    }

    /// Buildable nodes waiting for this one, looking through files.
    pub fn downstream(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.buildable_neighbors(index, Direction::Outgoing)
    }

    fn buildable_neighbors(&self, index: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut found = Vec::new();
        for next in self.graph.neighbors_directed(index, direction) {
            match &self.graph[next] {
                Node::File(_) => found.extend(
                    self.graph
                        .neighbors_directed(next, direction)
                        .filter(|&n| self.graph[n].is_buildable()),
                ),
                node if node.is_buildable() => found.push(next),
                _ => {}
            }
        }
        found.sort();
        found.dedup();
        found
    }

    /// Readiness: every upstream buildable node is satisfied. Imports and
    /// plain files are external and always satisfied.
    pub fn is_ready(&self, index: NodeIndex, satisfied: impl Fn(NodeIndex) -> bool) -> bool {
        self.upstream(index).into_iter().all(satisfied)
    }

    /// Every node reachable from `index`, excluding itself.
    pub fn descendants(&self, index: NodeIndex) -> HashSet<NodeIndex> {
        let mut found = HashSet::new();
        let mut dfs = Dfs::new(&self.graph, index);
        while let Some(next) = dfs.next(&self.graph) {
            found.insert(next);
        }
        found.remove(&index);
        found
    }

    /// Every node `index` depends on, excluding itself.
    pub fn ancestors(&self, index: NodeIndex) -> HashSet<NodeIndex> {
        let reversed = Reversed(&self.graph);
        let mut found = HashSet::new();
        let mut dfs = Dfs::new(reversed, index);
        while let Some(next) = dfs.next(reversed) {
            found.insert(next);
        }
        found.remove(&index);
        found
    }

    /// Nodes in dependency order.
    pub fn topological(&self) -> Result<Vec<NodeIndex>, CycleError> {
        toposort(&self.graph, None).map_err(|cycle| CycleError {
            cycle: vec![self.graph[cycle.node_id()].name().to_string()],
        })
    }

    /// Targets matching any of `patterns`, plus everything they depend on.
    /// No patterns select every node.
    pub fn select(&self, patterns: &[Pattern]) -> HashSet<NodeIndex> {
        if patterns.is_empty() {
            return self.graph.node_indices().collect();
        }

        let mut selected = HashSet::new();
        for (index, node) in self.nodes() {
            if let Node::Target(name) = node
                && patterns.iter().any(|pattern| pattern.matches(name))
            {
                selected.insert(index);
                selected.extend(self.ancestors(index));
            }
        }
        selected
    }

    /// Whether a target, import or sub-target is called `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Appends a sub-target with a single edge from its parent. Inserting the
    /// same name twice returns the existing node.
    pub fn insert_subtarget(&mut self, parent: NodeIndex, name: &str) -> NodeIndex {
        if let Some(&index) = self.index.get(name) {
            return index;
        }

        let node = Node::Subtarget {
            parent: self.graph[parent].name().to_string(),
            name: name.to_string(),
        };
        let index = self.add(node);
        self.graph.add_edge(parent, index, ());
        index
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn spec(targets: &[&str]) -> Specification {
        Specification {
            targets: targets.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn build(specs: &[(&str, Specification)]) -> Result<DependencyGraph, EngineError> {
        let entries: Vec<_> = specs
            .iter()
            .map(|(name, spec)| Entry {
                name,
                spec,
                dynamic: None,
            })
            .collect();
        DependencyGraph::build(&entries, &BTreeMap::new())
    }

    fn names(graph: &DependencyGraph, nodes: impl IntoIterator<Item = NodeIndex>) -> BTreeSet<String> {
        nodes
            .into_iter()
            .map(|i| graph.node(i).name().to_string())
            .collect()
    }

    #[test]
    fn test_topological() {
        let graph = build(&[("c", spec(&["b"])), ("b", spec(&["a"])), ("a", spec(&[]))]).unwrap();
        let order: Vec<_> = graph
            .topological()
            .unwrap()
            .into_iter()
            .map(|i| graph.node(i).name().to_string())
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_named() {
        let err = build(&[("a", spec(&["b"])), ("b", spec(&["c"])), ("c", spec(&["a"])), ("d", spec(&[]))])
            .unwrap_err();
        let EngineError::Cycle(cycle) = err else {
            panic!("expected a cycle, got {err}");
        };
        assert_eq!(cycle.cycle, ["a", "b", "c"]);
    }

    #[test]
    fn test_self_cycle() {
        let err = build(&[("a", spec(&["a"]))]).unwrap_err();
        assert!(matches!(err, EngineError::Cycle(CycleError { ref cycle }) if cycle == &["a"]));
    }

    #[test]
    fn test_duplicates() {
        let err = build(&[("a", spec(&[])), ("a", spec(&[]))]).unwrap_err();
        assert!(matches!(err, EngineError::Graph(GraphError::DuplicateTarget(_))));

        let out = Specification {
            files_out: BTreeSet::from(["x.png".into()]),
            ..Default::default()
        };
        let err = build(&[("a", out.clone()), ("b", out)]).unwrap_err();
        assert!(matches!(err, EngineError::Graph(GraphError::DuplicateOutput { .. })));
    }

    #[test]
    fn test_name_clash() {
        let a = spec(&[]);
        let entries = [Entry {
            name: "f",
            spec: &a,
            dynamic: None,
        }];
        let functions = BTreeMap::from([("f".to_string(), Specification::default())]);
        let err = DependencyGraph::build(&entries, &functions).unwrap_err();
        assert!(matches!(err, EngineError::Graph(GraphError::NameClash(_))));
    }

    #[test]
    fn test_unknown_dynamic() {
        let a = spec(&[]);
        let dynamic = Dynamic::Map {
            over: vec!["nothing".into()],
        };
        let entries = [Entry {
            name: "a",
            spec: &a,
            dynamic: Some(&dynamic),
        }];
        let err = DependencyGraph::build(&entries, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::Graph(GraphError::UnknownDynamic { .. })));
    }

    #[test]
    fn test_file_links_producer_and_consumer() {
        let producer = Specification {
            files_out: BTreeSet::from(["plot.png".into()]),
            ..Default::default()
        };
        let consumer = Specification {
            files_in: BTreeSet::from(["plot.png".into()]),
            ..Default::default()
        };
        let graph = build(&[("consume", consumer), ("produce", producer)]).unwrap();

        let consume = graph.find("consume").unwrap();
        let produce = graph.find("produce").unwrap();
        assert_eq!(graph.upstream(consume), [produce]);
        assert_eq!(graph.downstream(produce), [consume]);
        assert!(matches!(graph.node(graph.find("plot.png").unwrap()), Node::File(_)));
    }

    #[test]
    fn test_import_edges() {
        let target = Specification {
            imports: BTreeSet::from(["f".into()]),
            ..Default::default()
        };
        let entries = [Entry {
            name: "t",
            spec: &target,
            dynamic: None,
        }];
        let functions = BTreeMap::from([
            (
                "f".to_string(),
                Specification {
                    imports: BTreeSet::from(["f".into(), "g".into()]),
                    ..Default::default()
                },
            ),
            ("g".to_string(), Specification::default()),
        ]);

        let graph = DependencyGraph::build(&entries, &functions).unwrap();
        let t = graph.find("t").unwrap();
        assert_eq!(names(&graph, graph.ancestors(t)), BTreeSet::from(["f".into(), "g".into()]));
        // imports are external: a target depending only on imports is ready
        assert!(graph.is_ready(t, |_| false));
    }

    #[test]
    fn test_select_keeps_upstream() {
        let graph = build(&[
            ("raw", spec(&[])),
            ("fit_a", spec(&["raw"])),
            ("fit_b", spec(&["raw"])),
            ("other", spec(&[])),
        ])
        .unwrap();

        let pattern = Pattern::new("fit_a").unwrap();
        let selected = graph.select(&[pattern]);
        assert_eq!(names(&graph, selected), BTreeSet::from(["raw".into(), "fit_a".into()]));
        assert_eq!(graph.select(&[]).len(), 4);
    }

    #[test]
    fn test_insert_subtarget() {
        let mut graph = build(&[("raw", spec(&[])), ("fit", spec(&["raw"]))]).unwrap();
        let fit = graph.find("fit").unwrap();

        let sub = graph.insert_subtarget(fit, "fit_0a1b2c3d");
        assert_eq!(graph.insert_subtarget(fit, "fit_0a1b2c3d"), sub);
        assert_eq!(graph.upstream(sub), [fit]);
        assert!(graph.descendants(graph.find("raw").unwrap()).contains(&sub));
        assert!(matches!(graph.node(sub), Node::Subtarget { parent, .. } if parent == "fit"));
    }
}
