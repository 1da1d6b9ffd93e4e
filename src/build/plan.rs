//! Build Plan
//!
//! The set of edges that must run to bring the requested targets up to
//! date, with readiness bookkeeping: an edge is ready once every input
//! is up to date (its producing edge finished or was already clean) and
//! its dyndep information, if any, has been loaded. Pools delay ready
//! edges beyond their capacity.

use std::collections::{HashMap, VecDeque};

use crate::graph::scan::DependencyScan;
use crate::graph::{BuildError, EdgeId, NodeId, State};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Want {
    /// In the plan only as dependency bookkeeping; nothing to run.
    Nothing,
    /// Dirty and waiting to be scheduled.
    ToStart,
    /// In the ready queue, a pool's delay queue, or running.
    Scheduled,
}

pub struct Plan {
    want: HashMap<EdgeId, Want>,
    ready: VecDeque<EdgeId>,
    pool_use: Vec<usize>,
    pool_delayed: Vec<VecDeque<EdgeId>>,
    wanted_edges: usize,
    command_edges: usize,
}

impl Plan {
    pub fn new(state: &State) -> Self {
        Self {
            want: HashMap::new(),
            ready: VecDeque::new(),
            pool_use: vec![0; state.pools.len()],
            pool_delayed: state.pools.iter().map(|_| VecDeque::new()).collect(),
            wanted_edges: 0,
            command_edges: 0,
        }
    }

    /// Number of non-phony edges the plan wants to run, for progress
    /// totals.
    pub fn command_edge_count(&self) -> usize {
        self.command_edges
    }

    pub fn more_to_do(&self) -> bool {
        self.wanted_edges > 0
    }

    /// Pull `node` (and its dirty prerequisites) into the plan.
    /// Returns false when the target is already up to date.
    pub fn add_target(&mut self, state: &State, node: NodeId) -> Result<bool, BuildError> {
        self.add_sub_target(state, node, None)
    }

    fn add_sub_target(
        &mut self,
        state: &State,
        node: NodeId,
        dependent: Option<NodeId>,
    ) -> Result<bool, BuildError> {
        let edge = match state.node(node).in_edge {
            None => {
                if state.node(node).dirty {
                    let mut message = format!("'{}'", state.node(node).path);
                    if let Some(dep) = dependent {
                        message.push_str(&format!(", needed by '{}'", state.node(dep).path));
                    }
                    message.push_str(", missing and no known rule to make it");
                    return Err(BuildError::MissingInput(message));
                }
                return Ok(false);
            }
            Some(edge) => edge,
        };

        if state.edge(edge).outs_ready {
            return Ok(false);
        }

        let first_visit = !self.want.contains_key(&edge);
        let want = self.want.entry(edge).or_insert(Want::Nothing);
        if state.node(node).dirty && *want == Want::Nothing {
            *want = Want::ToStart;
            self.wanted_edges += 1;
            if !state.edge(edge).is_phony() {
                self.command_edges += 1;
            }
        }
        if !first_visit {
            return Ok(true);
        }

        for &input in &state.edge(edge).inputs {
            self.add_sub_target(state, input, Some(node))?;
        }
        Ok(true)
    }

    /// Queue every wanted edge whose inputs are already up to date.
    /// Called once after the add_target phase, and again after dyndep
    /// loads add new work.
    pub fn schedule_pending(&mut self, state: &State) {
        let mut candidates: Vec<EdgeId> = self
            .want
            .iter()
            .filter(|(_, want)| **want == Want::ToStart)
            .map(|(&edge, _)| edge)
            .collect();
        candidates.sort();
        for edge in candidates {
            if Self::all_inputs_ready(state, edge) && !Self::dyndep_blocked(state, edge) {
                self.schedule_work(state, edge);
            }
        }
    }

    fn all_inputs_ready(state: &State, edge: EdgeId) -> bool {
        state.edge(edge).inputs.iter().all(|&input| {
            state
                .node(input)
                .in_edge
                .map_or(true, |ie| state.edge(ie).outs_ready)
        })
    }

    /// An edge whose dyndep file has not been loaded yet cannot be
    /// scheduled, even with all inputs ready.
    fn dyndep_blocked(state: &State, edge: EdgeId) -> bool {
        state
            .edge(edge)
            .dyndep
            .map_or(false, |dd| state.node(dd).dyndep_pending)
    }

    fn schedule_work(&mut self, state: &State, edge: EdgeId) {
        if self.want.get(&edge) == Some(&Want::Scheduled) {
            return;
        }
        self.want.insert(edge, Want::Scheduled);
        let pool = state.edge(edge).pool;
        let depth = state.pools[pool].depth;
        if depth > 0 && self.pool_use[pool] >= depth {
            self.pool_delayed[pool].push_back(edge);
        } else {
            if depth > 0 {
                self.pool_use[pool] += 1;
            }
            self.ready.push_back(edge);
        }
    }

    /// The next edge that can start right now, if any.
    pub fn find_work(&mut self) -> Option<EdgeId> {
        self.ready.pop_front()
    }

    /// Record an edge completion, release its pool slot, and ripple
    /// readiness to its dependents. Failed edges stay wanted so
    /// more_to_do() keeps reporting unfinished work.
    pub fn edge_finished(&mut self, state: &mut State, edge: EdgeId, success: bool) {
        let directly_wanted = self.want.get(&edge) != Some(&Want::Nothing);

        let pool = state.edge(edge).pool;
        let depth = state.pools[pool].depth;
        if directly_wanted && depth > 0 {
            self.pool_use[pool] = self.pool_use[pool].saturating_sub(1);
        }
        while self.pool_use[pool] < depth || depth == 0 {
            match self.pool_delayed[pool].pop_front() {
                Some(delayed) => {
                    if depth > 0 {
                        self.pool_use[pool] += 1;
                    }
                    self.ready.push_back(delayed);
                }
                None => break,
            }
        }

        if !success {
            return;
        }

        if directly_wanted {
            self.wanted_edges -= 1;
        }
        self.want.remove(&edge);
        state.edge_mut(edge).outs_ready = true;

        for &out in &state.edge(edge).outputs.clone() {
            self.node_finished(state, out);
        }
    }

    fn node_finished(&mut self, state: &mut State, node: NodeId) {
        state.node_mut(node).dirty = false;
        for oe in state.node(node).out_edges.clone() {
            if self.want.contains_key(&oe) {
                self.edge_maybe_ready(state, oe);
            }
        }
    }

    fn edge_maybe_ready(&mut self, state: &mut State, edge: EdgeId) {
        if !Self::all_inputs_ready(state, edge) || Self::dyndep_blocked(state, edge) {
            return;
        }
        match self.want.get(&edge) {
            Some(Want::ToStart) => self.schedule_work(state, edge),
            Some(Want::Nothing) => {
                // Nothing to run, but dependents may be waiting on its
                // outputs.
                self.edge_finished(state, edge, true);
            }
            _ => {}
        }
    }

    /// Restat cascade: `node`'s producing edge ran but did not change
    /// it. Re-mark the node clean and drop from the plan any dependent
    /// edge whose remaining reason to run was this node.
    pub fn clean_node(
        &mut self,
        scan: &mut DependencyScan,
        node: NodeId,
    ) -> Result<(), BuildError> {
        scan.state.node_mut(node).dirty = false;

        for oe in scan.state.node(node).out_edges.clone() {
            let want = match self.want.get(&oe) {
                Some(want) => *want,
                None => continue,
            };
            if want == Want::Nothing {
                continue;
            }
            // An edge whose recorded deps could not be loaded must run
            // no matter what the mtimes say.
            if scan.state.edge(oe).deps_missing {
                continue;
            }

            let dirtying = scan.state.edge(oe).dirtying_ins().to_vec();
            if dirtying.iter().any(|&input| scan.state.node(input).dirty) {
                continue;
            }
            let most_recent_input = dirtying
                .iter()
                .copied()
                .max_by_key(|&input| scan.state.node(input).mtime_or_zero());
            if scan.recompute_outputs_dirty(oe, most_recent_input)? {
                continue;
            }

            for out in scan.state.edge(oe).outputs.clone() {
                self.clean_node(scan, out)?;
            }
            self.want.insert(oe, Want::Nothing);
            self.wanted_edges -= 1;
        }
        Ok(())
    }

    /// After a dyndep load added inputs to `edges`, pull any new
    /// prerequisite work into the plan and refresh readiness.
    pub fn dyndeps_loaded(
        &mut self,
        state: &State,
        edges: &[EdgeId],
    ) -> Result<(), BuildError> {
        for &edge in edges {
            if !self.want.contains_key(&edge) {
                continue;
            }
            let output = state.edge(edge).outputs[0];
            for input in state.edge(edge).inputs.clone() {
                self.add_sub_target(state, input, Some(output))?;
            }
        }
        self.schedule_pending(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryDisk;
    use crate::logs::{BuildLog, DepsLog};
    use crate::parser::ManifestParser;

    struct Harness {
        state: State,
        disk: InMemoryDisk,
        build_log: BuildLog,
        deps_log: DepsLog,
    }

    impl Harness {
        fn new(manifest: &str) -> Self {
            let disk = InMemoryDisk::new();
            let mut state = State::new();
            let scope = state.root_scope;
            let mut parser = ManifestParser::new(&mut state, &disk);
            parser.parse("build.ninja", manifest, scope).unwrap();
            Self {
                state,
                disk,
                build_log: BuildLog::new(),
                deps_log: DepsLog::new(),
            }
        }

        fn scan_and_plan(&mut self, target: &str) -> Plan {
            let node = self.state.lookup_node(target).unwrap();
            let mut validations = Vec::new();
            let mut scan = DependencyScan {
                state: &mut self.state,
                disk: &self.disk,
                build_log: &self.build_log,
                deps_log: &self.deps_log,
                explain: false,
            };
            scan.recompute_dirty(node, &mut validations).unwrap();
            let mut plan = Plan::new(&self.state);
            plan.add_target(&self.state, node).unwrap();
            plan.schedule_pending(&self.state);
            plan
        }

        fn edge_producing(&self, path: &str) -> EdgeId {
            let node = self.state.lookup_node(path).unwrap();
            self.state.node(node).in_edge.unwrap()
        }
    }

    const CAT: &str = "rule cat\n  command = cat $in > $out\n";

    #[test]
    fn test_ready_edges_have_no_pending_inputs() {
        let mut h = Harness::new(&format!(
            "{}build mid: cat a\nbuild out: cat mid\n",
        CAT));
        h.disk.create("a", "x");
        let mut plan = h.scan_and_plan("out");

        // Only the producer of mid can start; out waits.
        let first = plan.find_work().unwrap();
        assert_eq!(first, h.edge_producing("mid"));
        assert!(plan.find_work().is_none());

        plan.edge_finished(&mut h.state, first, true);
        let second = plan.find_work().unwrap();
        assert_eq!(second, h.edge_producing("out"));
        plan.edge_finished(&mut h.state, second, true);
        assert!(!plan.more_to_do());
    }

    #[test]
    fn test_missing_source_error_names_dependent() {
        let mut h = Harness::new(&format!("{}build out: cat gone\n", CAT));
        let node = h.state.lookup_node("out").unwrap();
        let mut validations = Vec::new();
        let mut scan = DependencyScan {
            state: &mut h.state,
            disk: &h.disk,
            build_log: &h.build_log,
            deps_log: &h.deps_log,
            explain: false,
        };
        scan.recompute_dirty(node, &mut validations).unwrap();
        let mut plan = Plan::new(&h.state);
        let err = plan.add_target(&h.state, node).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("'gone'"));
        assert!(message.contains("needed by 'out'"));
        assert!(message.contains("no known rule"));
    }

    #[test]
    fn test_pool_serializes_edges() {
        let mut h = Harness::new(
            "pool serial\n  depth = 1\nrule r\n  command = r $out\n  pool = serial\nbuild a: r\nbuild b: r\nbuild c: r\nbuild all: phony a b c\n",
        );
        let mut plan = h.scan_and_plan("all");

        // Depth 1: exactly one ready at a time.
        let first = plan.find_work().unwrap();
        assert!(plan.find_work().is_none());
        plan.edge_finished(&mut h.state, first, true);
        let second = plan.find_work().unwrap();
        assert_ne!(first, second);
        assert!(plan.find_work().is_none());
        plan.edge_finished(&mut h.state, second, true);
        let third = plan.find_work().unwrap();
        plan.edge_finished(&mut h.state, third, true);

        // Only the phony group remains.
        let phony = plan.find_work().unwrap();
        assert!(h.state.edge(phony).is_phony());
        plan.edge_finished(&mut h.state, phony, true);
        assert!(!plan.more_to_do());
    }

    #[test]
    fn test_default_pool_unbounded() {
        let mut h = Harness::new(&format!(
            "{}build a: cat s\nbuild b: cat s\nbuild c: cat s\nbuild all: phony a b c\n",
        CAT));
        h.disk.create("s", "x");
        let mut plan = h.scan_and_plan("all");
        assert!(plan.find_work().is_some());
        assert!(plan.find_work().is_some());
        assert!(plan.find_work().is_some());
    }

    #[test]
    fn test_phony_passthrough_cascades() {
        let mut h = Harness::new(&format!(
            "{}build a: cat s\nbuild group: phony a\nbuild out: cat group\n",
        CAT));
        h.disk.create("s", "x");
        let mut plan = h.scan_and_plan("out");

        let edge_a = plan.find_work().unwrap();
        assert_eq!(edge_a, h.edge_producing("a"));
        plan.edge_finished(&mut h.state, edge_a, true);

        // The phony group becomes ready next, then unblocks out.
        let phony = plan.find_work().unwrap();
        assert!(h.state.edge(phony).is_phony());
        plan.edge_finished(&mut h.state, phony, true);
        assert_eq!(plan.find_work().unwrap(), h.edge_producing("out"));
    }

    #[test]
    fn test_failed_edge_keeps_plan_unfinished() {
        let mut h = Harness::new(&format!("{}build out: cat a\n", CAT));
        h.disk.create("a", "x");
        let mut plan = h.scan_and_plan("out");
        let edge = plan.find_work().unwrap();
        plan.edge_finished(&mut h.state, edge, false);
        assert!(plan.more_to_do());
        assert!(plan.find_work().is_none());
    }

    #[test]
    fn test_clean_target_plans_nothing() {
        let mut h = Harness::new(&format!("{}build out: cat a\n", CAT));
        h.disk.create("a", "x");
        h.disk.create("out", "y");
        let node = h.state.lookup_node("out").unwrap();
        let edge = h.edge_producing("out");
        let hash = crate::hash::hash_command(&h.state.evaluate_command_for_hash(edge));
        h.build_log
            .record("out", hash, 0, 0, h.disk.mtime("out"))
            .unwrap();

        let mut validations = Vec::new();
        let mut scan = DependencyScan {
            state: &mut h.state,
            disk: &h.disk,
            build_log: &h.build_log,
            deps_log: &h.deps_log,
            explain: false,
        };
        scan.recompute_dirty(node, &mut validations).unwrap();
        let mut plan = Plan::new(&h.state);
        assert!(!plan.add_target(&h.state, node).unwrap());
        assert!(!plan.more_to_do());
    }
}
