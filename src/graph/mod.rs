//! Build Graph
//!
//! Nodes are file paths; edges are rule invocations producing outputs
//! from inputs. Both live in arenas owned by `State` and refer to each
//! other by compact ids, so the cyclic node/edge cross-references never
//! need owning pointers.

pub mod dyndep;
pub mod scan;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::canon::canonicalize_path;
use crate::eval::{shell_escape, Env, Rule, ScopeId, Scopes};
use crate::fs::{DiskError, TimeStamp};

/// Index of a node in `State::nodes`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Index of an edge in `State::edges`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u32);

/// Errors surfaced while building the graph or running the build.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("dependency cycle: {0}")]
    Cycle(String),

    #[error("{0}")]
    MissingInput(String),

    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("{0}")]
    Dyndep(String),

    #[error("{0}")]
    Depfile(String),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error("interrupted by user")]
    Interrupted,

    #[error("cannot start command: {0}")]
    Spawn(String),

    #[error("build stopped: subcommand failed")]
    Failed,
}

/// A file participating in the graph.
#[derive(Debug)]
pub struct Node {
    pub path: String,
    pub slash_bits: u64,
    /// None = not statted yet; Some(0) = known missing.
    pub mtime: Option<TimeStamp>,
    pub dirty: bool,
    /// Set while this node is a dyndep file that has not been loaded.
    pub dyndep_pending: bool,
    pub in_edge: Option<EdgeId>,
    pub out_edges: Vec<EdgeId>,
    /// Edges that name this node as a validation.
    pub validation_out_edges: Vec<EdgeId>,
    /// Compact id assigned by the deps log; -1 until recorded.
    pub deps_log_id: i32,
}

impl Node {
    fn new(path: String, slash_bits: u64) -> Self {
        Self {
            path,
            slash_bits,
            mtime: None,
            dirty: false,
            dyndep_pending: false,
            in_edge: None,
            out_edges: Vec::new(),
            validation_out_edges: Vec::new(),
            deps_log_id: -1,
        }
    }

    pub fn exists(&self) -> bool {
        matches!(self.mtime, Some(t) if t > 0)
    }

    /// The mtime to use in freshness comparisons; 0 when missing.
    pub fn mtime_or_zero(&self) -> TimeStamp {
        self.mtime.unwrap_or(0)
    }
}

/// Visit mark used by the dirty scan for cycle detection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum VisitMark {
    #[default]
    None,
    InStack,
    Done,
}

/// A rule invocation: inputs, outputs, and a binding scope layered over
/// the rule and the enclosing file scope.
#[derive(Debug)]
pub struct Edge {
    pub rule: Rc<Rule>,
    pub scope: ScopeId,
    /// Index into `State::pools`.
    pub pool: usize,

    /// Explicit, then implicit, then order-only inputs.
    pub inputs: Vec<NodeId>,
    pub explicit_ins: usize,
    pub implicit_ins: usize,

    /// Explicit, then implicit outputs.
    pub outputs: Vec<NodeId>,
    pub explicit_outs: usize,

    pub validations: Vec<NodeId>,
    pub dyndep: Option<NodeId>,

    pub mark: VisitMark,
    /// True once every output is known up to date (or was built).
    pub outs_ready: bool,
    pub deps_loaded: bool,
    /// Set when loading recorded deps failed; restat must not clean it.
    pub deps_missing: bool,
}

impl Edge {
    pub fn is_phony(&self) -> bool {
        self.rule.name() == "phony"
    }

    /// Inputs that affect dirtiness (explicit + implicit).
    pub fn dirtying_ins(&self) -> &[NodeId] {
        &self.inputs[..self.explicit_ins + self.implicit_ins]
    }

    pub fn order_only_ins(&self) -> &[NodeId] {
        &self.inputs[self.explicit_ins + self.implicit_ins..]
    }

    pub fn is_order_only_input(&self, index: usize) -> bool {
        index >= self.explicit_ins + self.implicit_ins
    }
}

/// A named pool with integer capacity; edges assigned to it are
/// serialized down to `depth` concurrent jobs. Depth 0 is unbounded.
#[derive(Debug)]
pub struct Pool {
    pub name: String,
    pub depth: usize,
}

pub const DEFAULT_POOL: usize = 0;
pub const CONSOLE_POOL: usize = 1;

/// The top-level container: node and edge arenas, rule and pool tables,
/// defaults, and the scope arena. Threaded explicitly through the
/// parser and driver.
pub struct State {
    pub nodes: Vec<Node>,
    pub paths: HashMap<String, NodeId>,
    pub edges: Vec<Edge>,
    pub scopes: Scopes,
    pub root_scope: ScopeId,
    pub pools: IndexMap<String, Pool>,
    pub defaults: Vec<NodeId>,
}

impl State {
    pub fn new() -> Self {
        let (mut scopes, root_scope) = Scopes::new();
        scopes.add_rule(root_scope, Rule::phony());
        let mut pools = IndexMap::new();
        pools.insert(
            String::new(),
            Pool {
                name: String::new(),
                depth: 0,
            },
        );
        pools.insert(
            "console".to_string(),
            Pool {
                name: "console".to_string(),
                depth: 1,
            },
        );
        Self {
            nodes: Vec::new(),
            paths: HashMap::new(),
            edges: Vec::new(),
            scopes,
            root_scope,
            pools,
            defaults: Vec::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0 as usize]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        &mut self.edges[id.0 as usize]
    }

    /// Find or create the node for a path, canonicalizing first.
    pub fn get_or_create_node(&mut self, path: &str) -> NodeId {
        let (canon, slash_bits) = canonicalize_path(path);
        if let Some(&id) = self.paths.get(&canon) {
            return id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.paths.insert(canon.clone(), id);
        self.nodes.push(Node::new(canon, slash_bits));
        id
    }

    /// Look up a node by (possibly uncanonical) path without creating it.
    pub fn lookup_node(&self, path: &str) -> Option<NodeId> {
        let (canon, _) = canonicalize_path(path);
        self.paths.get(&canon).copied()
    }

    pub fn add_edge(&mut self, rule: Rc<Rule>, scope: ScopeId, pool: usize) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge {
            rule,
            scope,
            pool,
            inputs: Vec::new(),
            explicit_ins: 0,
            implicit_ins: 0,
            outputs: Vec::new(),
            explicit_outs: 0,
            validations: Vec::new(),
            dyndep: None,
            mark: VisitMark::None,
            outs_ready: false,
            deps_loaded: false,
            deps_missing: false,
        });
        id
    }

    /// Connect an output node to its producing edge. Returns false if
    /// another edge already produces this node.
    pub fn add_edge_output(&mut self, edge: EdgeId, node: NodeId) -> bool {
        if self.node(node).in_edge.is_some() {
            return false;
        }
        self.node_mut(node).in_edge = Some(edge);
        self.edge_mut(edge).outputs.push(node);
        true
    }

    pub fn add_edge_input(&mut self, edge: EdgeId, node: NodeId) {
        self.edge_mut(edge).inputs.push(node);
        self.node_mut(node).out_edges.push(edge);
    }

    pub fn add_edge_validation(&mut self, edge: EdgeId, node: NodeId) {
        self.edge_mut(edge).validations.push(node);
        self.node_mut(node).validation_out_edges.push(edge);
    }

    /// Append an input discovered from a depfile or the deps log as an
    /// implicit dependency.
    pub fn add_discovered_input(&mut self, edge: EdgeId, node: NodeId) {
        let e = self.edge_mut(edge);
        let pos = e.explicit_ins + e.implicit_ins;
        e.inputs.insert(pos, node);
        e.implicit_ins += 1;
        self.node_mut(node).out_edges.push(edge);
    }

    pub fn pool_index(&self, name: &str) -> Option<usize> {
        self.pools.get_index_of(name)
    }

    /// Nodes nothing depends on; the default when no targets are named
    /// and the manifest has no `default` statement.
    pub fn root_nodes(&self) -> Vec<NodeId> {
        let mut roots = Vec::new();
        for edge in &self.edges {
            for &out in &edge.outputs {
                if self.node(out).out_edges.is_empty() {
                    roots.push(out);
                }
            }
        }
        roots
    }

    // ------------------------------------------------------------------
    // Edge binding evaluation
    // ------------------------------------------------------------------

    /// Evaluate the edge's command string.
    pub fn evaluate_command(&self, edge: EdgeId) -> String {
        self.edge_binding_escaped(edge, "command")
    }

    /// The command plus the rspfile content, which must perturb the
    /// command hash when it changes.
    pub fn evaluate_command_for_hash(&self, edge: EdgeId) -> String {
        let mut command = self.evaluate_command(edge);
        let rsp = self.edge_binding(edge, "rspfile_content");
        if !rsp.is_empty() {
            command.push_str(";rspfile=");
            command.push_str(&rsp);
        }
        command
    }

    /// Evaluate a binding with `$in`/`$out` expanded as plain paths.
    pub fn edge_binding(&self, edge: EdgeId, name: &str) -> String {
        let env = EdgeEnv::new(self, edge, EscapeKind::DoNotEscape);
        env.lookup_variable(name).unwrap_or_default()
    }

    /// Evaluate a binding with `$in`/`$out` shell-quoted, as the
    /// command binding requires.
    pub fn edge_binding_escaped(&self, edge: EdgeId, name: &str) -> String {
        let env = EdgeEnv::new(self, edge, EscapeKind::ShellEscape);
        env.lookup_variable(name).unwrap_or_default()
    }

    /// A binding is true when it evaluates to a non-empty string.
    pub fn edge_binding_bool(&self, edge: EdgeId, name: &str) -> bool {
        !self.edge_binding(edge, name).is_empty()
    }

    /// The edge's description, falling back to the command for display.
    pub fn edge_description(&self, edge: EdgeId) -> String {
        let desc = self.edge_binding(edge, "description");
        if desc.is_empty() {
            self.evaluate_command(edge)
        } else {
            desc
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// How `$in`/`$out` path lists are rendered during expansion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EscapeKind {
    ShellEscape,
    DoNotEscape,
}

/// Per-edge environment: synthesizes `in`, `in_newline`, and `out`,
/// then edge bindings, then lazy rule bindings, then the file scope.
pub struct EdgeEnv<'a> {
    state: &'a State,
    edge: EdgeId,
    escape: EscapeKind,
    /// Rule bindings being expanded, to break self-referential rules.
    lookups_in_progress: RefCell<Vec<String>>,
}

impl<'a> EdgeEnv<'a> {
    pub fn new(state: &'a State, edge: EdgeId, escape: EscapeKind) -> Self {
        Self {
            state,
            edge,
            escape,
            lookups_in_progress: RefCell::new(Vec::new()),
        }
    }

    fn make_path_list(&self, nodes: &[NodeId], sep: char) -> String {
        let mut result = String::new();
        for &id in nodes {
            if !result.is_empty() {
                result.push(sep);
            }
            let path = &self.state.node(id).path;
            match self.escape {
                EscapeKind::ShellEscape => shell_escape(path, &mut result),
                EscapeKind::DoNotEscape => result.push_str(path),
            }
        }
        result
    }
}

impl<'a> Env for EdgeEnv<'a> {
    fn lookup_variable(&self, var: &str) -> Option<String> {
        let edge = self.state.edge(self.edge);

        match var {
            "in" => {
                return Some(self.make_path_list(&edge.inputs[..edge.explicit_ins], ' '));
            }
            "in_newline" => {
                return Some(self.make_path_list(&edge.inputs[..edge.explicit_ins], '\n'));
            }
            "out" => {
                return Some(self.make_path_list(&edge.outputs[..edge.explicit_outs], ' '));
            }
            _ => {}
        }

        // Edge-local bindings shadow the rule and the file scope.
        if let Some(value) = self.state.scopes.lookup_local(edge.scope, var) {
            return Some(value.to_string());
        }

        if let Some(template) = edge.rule.binding(var) {
            let mut in_progress = self.lookups_in_progress.borrow_mut();
            if in_progress.iter().any(|v| v == var) {
                return Some(String::new());
            }
            in_progress.push(var.to_string());
            drop(in_progress);
            let value = template.evaluate(self);
            self.lookups_in_progress.borrow_mut().pop();
            return Some(value);
        }

        self.state
            .scopes
            .lookup_in_parents(edge.scope, var)
            .map(str::to_string)
    }
}

/// Validate the structural invariants the parser and dyndep loader are
/// supposed to maintain; used by tests.
#[cfg(test)]
pub fn check_graph_invariants(state: &State) {
    for (i, edge) in state.edges.iter().enumerate() {
        let id = EdgeId(i as u32);
        assert!(
            !edge.outputs.is_empty(),
            "edge {} has no outputs",
            edge.rule.name()
        );
        for &out in &edge.outputs {
            assert_eq!(state.node(out).in_edge, Some(id));
        }
        for &input in &edge.inputs {
            assert!(state.node(input).out_edges.contains(&id));
        }
    }
    for (i, node) in state.nodes.iter().enumerate() {
        let id = NodeId(i as u32);
        if let Some(in_edge) = node.in_edge {
            assert!(state.edge(in_edge).outputs.contains(&id));
        }
        for &oe in &node.out_edges {
            assert!(state.edge(oe).inputs.contains(&id));
        }
    }
}
