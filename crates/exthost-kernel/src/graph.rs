//! Dependency graph builder and topological scheduler.
//!
//! Extensions declare the ids of the extensions they depend on.  Before any
//! unit is activated the engine runs three passes over the full analyzed set:
//!
//! | Pass | Function | Cost |
//! |------|----------|------|
//! | Missing dependencies | [`missing_dependencies`] | O(units x deps) |
//! | Circular dependencies | [`direct_cycles`] (two-node) or [`find_cycles`] (any length) | O(units x deps) |
//! | Load order | [`topological_order`] | O(units + deps) |
//!
//! None of the passes fail: their results are reported per unit and the
//! caller decides what blocks activation.

use std::collections::{BTreeMap, HashMap, HashSet};

// ---------------------------------------------------------------------------
// Node abstraction
// ---------------------------------------------------------------------------

/// Anything that has an id and declares dependency ids.
pub trait GraphNode {
    /// Unique id of the node.
    fn id(&self) -> &str;

    /// Ids this node depends on, in declaration order.
    fn dependencies(&self) -> &[String];
}

/// Index from id to position.  The first node wins when ids repeat.
fn index_of<N: GraphNode>(nodes: &[N]) -> HashMap<&str, usize> {
    let mut index = HashMap::with_capacity(nodes.len());
    for (pos, node) in nodes.iter().enumerate() {
        index.entry(node.id()).or_insert(pos);
    }
    index
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|existing| existing == id) {
        list.push(id.to_owned());
    }
}

// ---------------------------------------------------------------------------
// Dependency passes
// ---------------------------------------------------------------------------

/// Declared dependency ids that are not present in `nodes`, per node id.
///
/// Nodes whose dependencies all resolve do not appear in the result.
pub fn missing_dependencies<N: GraphNode>(nodes: &[N]) -> BTreeMap<String, Vec<String>> {
    let index = index_of(nodes);
    let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for node in nodes {
        for dep in node.dependencies() {
            if !index.contains_key(dep.as_str()) {
                push_unique(missing.entry(node.id().to_owned()).or_default(), dep);
            }
        }
    }

    missing
}

/// Direct two-node cycles: `U` records `D` when `U` depends on `D` and `D`
/// depends on `U`.
///
/// Longer cycles (`A -> B -> C -> A`) are not reported; use [`find_cycles`]
/// for those.
pub fn direct_cycles<N: GraphNode>(nodes: &[N]) -> BTreeMap<String, Vec<String>> {
    let index = index_of(nodes);
    let mut circular: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for node in nodes {
        for dep in node.dependencies() {
            let Some(&pos) = index.get(dep.as_str()) else {
                continue;
            };
            if nodes[pos].dependencies().iter().any(|d| d == node.id()) {
                push_unique(circular.entry(node.id().to_owned()).or_default(), dep);
            }
        }
    }

    circular
}

/// Full cycle detection over strongly connected components.
///
/// Every node that sits on a cycle of any length records the dependencies it
/// declares on other members of the same cycle.  A node depending on itself
/// records its own id.  For two-node cycles the result matches
/// [`direct_cycles`].
pub fn find_cycles<N: GraphNode>(nodes: &[N]) -> BTreeMap<String, Vec<String>> {
    let index = index_of(nodes);
    let edges: Vec<Vec<usize>> = nodes
        .iter()
        .map(|node| {
            node.dependencies()
                .iter()
                .filter_map(|dep| index.get(dep.as_str()).copied())
                .collect()
        })
        .collect();

    let components = Tarjan::new(&edges).run();

    let mut circular: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for component in components {
        let members: HashSet<usize> = component.iter().copied().collect();
        let is_cycle = component.len() > 1 || edges[component[0]].contains(&component[0]);
        if !is_cycle {
            continue;
        }
        for &member in &component {
            for &dep in &edges[member] {
                if members.contains(&dep) {
                    push_unique(
                        circular.entry(nodes[member].id().to_owned()).or_default(),
                        nodes[dep].id(),
                    );
                }
            }
        }
    }

    circular
}

/// Tarjan's strongly connected components over an adjacency list.
struct Tarjan<'a> {
    edges: &'a [Vec<usize>],
    next_index: usize,
    index: Vec<Option<usize>>,
    low_link: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    components: Vec<Vec<usize>>,
}

impl<'a> Tarjan<'a> {
    fn new(edges: &'a [Vec<usize>]) -> Self {
        let n = edges.len();
        Self {
            edges,
            next_index: 0,
            index: vec![None; n],
            low_link: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<Vec<usize>> {
        for node in 0..self.edges.len() {
            if self.index[node].is_none() {
                self.connect(node);
            }
        }
        self.components
    }

    fn connect(&mut self, node: usize) {
        self.index[node] = Some(self.next_index);
        self.low_link[node] = self.next_index;
        self.next_index += 1;
        self.stack.push(node);
        self.on_stack[node] = true;

        let edges = self.edges;
        for &next in &edges[node] {
            match self.index[next] {
                None => {
                    self.connect(next);
                    self.low_link[node] = self.low_link[node].min(self.low_link[next]);
                }
                Some(next_index) if self.on_stack[next] => {
                    self.low_link[node] = self.low_link[node].min(next_index);
                }
                Some(_) => {}
            }
        }

        if Some(self.low_link[node]) == self.index[node] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack[member] = false;
                component.push(member);
                if member == node {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

// ---------------------------------------------------------------------------
// Topological scheduler
// ---------------------------------------------------------------------------

/// Load order as node ids: every resolvable dependency precedes its dependent.
///
/// Depth-first post-order: nodes are visited in input order, a visited node is
/// marked explored on entry, its not-yet-explored dependencies that exist in
/// the set are visited first, then the node itself is appended.  Explored
/// nodes are never revisited, so the traversal terminates even on cyclic
/// input; inside a cycle the relative order of its members is unspecified.
pub fn topological_order<N: GraphNode>(nodes: &[N]) -> Vec<String> {
    let index = index_of(nodes);
    let mut explored = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());

    fn visit<N: GraphNode>(
        pos: usize,
        nodes: &[N],
        index: &HashMap<&str, usize>,
        explored: &mut [bool],
        order: &mut Vec<String>,
    ) {
        explored[pos] = true;
        for dep in nodes[pos].dependencies() {
            if let Some(&dep_pos) = index.get(dep.as_str()) {
                if !explored[dep_pos] {
                    visit(dep_pos, nodes, index, explored, order);
                }
            }
        }
        order.push(nodes[pos].id().to_owned());
    }

    for pos in 0..nodes.len() {
        // Repeated ids resolve to their first occurrence.
        if index.get(nodes[pos].id()) != Some(&pos) {
            continue;
        }
        if !explored[pos] {
            visit(pos, nodes, &index, &mut explored, &mut order);
        }
    }

    order
}

// ---------------------------------------------------------------------------
// Combined report
// ---------------------------------------------------------------------------

/// Result of running every pass over one analyzed set.
#[derive(Debug, Clone, Default)]
pub struct DependencyReport {
    /// Missing dependency ids per node id.
    pub missing: BTreeMap<String, Vec<String>>,
    /// Circular dependency ids per node id.
    pub circular: BTreeMap<String, Vec<String>>,
    /// Load order.
    pub order: Vec<String>,
}

impl DependencyReport {
    /// Run all passes.  `strict` selects [`find_cycles`] over
    /// [`direct_cycles`].
    pub fn build<N: GraphNode>(nodes: &[N], strict: bool) -> Self {
        let circular = if strict {
            find_cycles(nodes)
        } else {
            direct_cycles(nodes)
        };
        Self {
            missing: missing_dependencies(nodes),
            circular,
            order: topological_order(nodes),
        }
    }

    /// Missing dependencies of `id` (empty if none).
    pub fn missing_for(&self, id: &str) -> &[String] {
        self.missing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Circular dependencies of `id` (empty if none).
    pub fn circular_for(&self, id: &str) -> &[String] {
        self.circular.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
