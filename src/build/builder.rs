//! Builder
//!
//! The top-level driver: scans targets, computes the plan, then loops
//! launching ready edges and finishing completed ones until the plan is
//! empty, the failure limit is reached, or a signal arrives.

use std::collections::HashMap;
use std::time::Instant;

use crate::build::plan::Plan;
use crate::build::runner::{CommandResult, CommandRunner};
use crate::build::BuildConfig;
use crate::canon::canon_path;
use crate::fs::Disk;
use crate::graph::dyndep::load_dyndeps;
use crate::graph::scan::DependencyScan;
use crate::graph::{BuildError, EdgeId, NodeId, State, VisitMark, CONSOLE_POOL};
use crate::hash::hash_command;
use crate::logs::{BuildLog, DepsLog};
use crate::parser::parse_depfile;
use crate::status::StatusPrinter;

pub struct Builder<'a> {
    pub state: &'a mut State,
    pub config: BuildConfig,
    pub plan: Plan,
    disk: &'a dyn Disk,
    pub build_log: &'a mut BuildLog,
    pub deps_log: &'a mut DepsLog,
    status: StatusPrinter,
    start_time: Instant,
    running_since: HashMap<EdgeId, i32>,
}

impl<'a> Builder<'a> {
    pub fn new(
        state: &'a mut State,
        config: BuildConfig,
        disk: &'a dyn Disk,
        build_log: &'a mut BuildLog,
        deps_log: &'a mut DepsLog,
        status: StatusPrinter,
    ) -> Self {
        let plan = Plan::new(state);
        Self {
            state,
            config,
            plan,
            disk,
            build_log,
            deps_log,
            status,
            start_time: Instant::now(),
            running_since: HashMap::new(),
        }
    }

    fn scan(&mut self) -> DependencyScan<'_> {
        DependencyScan {
            state: &mut *self.state,
            disk: self.disk,
            build_log: &*self.build_log,
            deps_log: &*self.deps_log,
            explain: self.config.explain,
        }
    }

    /// Add a target by name, scanning its subgraph for dirtiness.
    pub fn add_target_by_name(&mut self, name: &str) -> Result<bool, BuildError> {
        let node = self
            .state
            .lookup_node(name)
            .ok_or_else(|| BuildError::UnknownTarget(name.to_string()))?;
        self.add_target(node)
    }

    /// Returns false when the target was already up to date.
    pub fn add_target(&mut self, node: NodeId) -> Result<bool, BuildError> {
        let mut validation_nodes = Vec::new();
        self.scan().recompute_dirty(node, &mut validation_nodes)?;
        let added = self.plan.add_target(self.state, node)?;

        // Validation targets discovered during the scan become top-level
        // targets of their own, transitively.
        while let Some(validation) = validation_nodes.pop() {
            let mut more = Vec::new();
            self.scan().recompute_dirty(validation, &mut more)?;
            self.plan.add_target(self.state, validation)?;
            validation_nodes.extend(more);
        }
        Ok(added)
    }

    pub fn already_up_to_date(&self) -> bool {
        !self.plan.more_to_do()
    }

    /// Run the plan to completion.
    pub fn build(&mut self, runner: &mut dyn CommandRunner) -> Result<(), BuildError> {
        self.plan.schedule_pending(self.state);
        self.status
            .plan_has_total_edges(self.plan.command_edge_count());

        let mut pending = 0usize;
        let mut failures = 0usize;

        while self.plan.more_to_do() {
            let failures_allowed =
                self.config.failures_allowed == 0 || failures < self.config.failures_allowed;

            if failures_allowed && runner.can_run_more() {
                if let Some(edge) = self.plan.find_work() {
                    if self.state.edge(edge).is_phony() {
                        self.plan.edge_finished(self.state, edge, true);
                        self.load_ready_dyndeps(edge)?;
                        continue;
                    }
                    self.start_edge(edge, runner)?;
                    pending += 1;
                    continue;
                }
            }

            if pending > 0 {
                let result = match runner.wait_for_command() {
                    Some(result) => result,
                    None => {
                        let active = runner.active_edges();
                        runner.abort();
                        self.cleanup(&active);
                        self.status.finish();
                        return Err(BuildError::Interrupted);
                    }
                };
                pending -= 1;
                if !self.finish_command(result)? {
                    failures += 1;
                }
                continue;
            }

            // Nothing running and nothing startable: only reachable
            // once failures stopped new work from starting.
            break;
        }

        self.status.finish();
        if failures > 0 {
            return Err(BuildError::Failed);
        }
        Ok(())
    }

    fn elapsed_ms(&self) -> i32 {
        self.start_time.elapsed().as_millis().min(i32::MAX as u128) as i32
    }

    fn start_edge(
        &mut self,
        edge: EdgeId,
        runner: &mut dyn CommandRunner,
    ) -> Result<(), BuildError> {
        for &out in &self.state.edge(edge).outputs.clone() {
            self.disk.make_dirs_for(&self.state.node(out).path)?;
        }

        let rspfile = self.state.edge_binding(edge, "rspfile");
        if !rspfile.is_empty() {
            let content = self.state.edge_binding(edge, "rspfile_content");
            self.disk.write_file(&rspfile, content.as_bytes())?;
        }

        let command = self.state.evaluate_command(edge);
        let description = self.state.edge_description(edge);
        self.status.edge_started(&description, &command);
        self.running_since.insert(edge, self.elapsed_ms());

        let use_console = self.state.edge(edge).pool == CONSOLE_POOL;
        runner.start_command(edge, &command, use_console)
    }

    /// Process one completed command. Returns false if the edge failed.
    fn finish_command(&mut self, result: CommandResult) -> Result<bool, BuildError> {
        let edge = result.edge;
        let mut output = result.output;
        let mut success = result.status.success();

        // Dependency extraction filters the captured output (the
        // /showIncludes notes must disappear even on failure), so it
        // runs before anything is printed.
        let deps_type = self.state.edge_binding(edge, "deps");
        let mut deps_nodes = Vec::new();
        if !deps_type.is_empty() {
            match self.extract_deps(edge, &deps_type, &mut output) {
                Ok(nodes) => deps_nodes = nodes,
                Err(message) => {
                    if success {
                        success = false;
                        if !output.is_empty() {
                            output.push('\n');
                        }
                        output.push_str(&message);
                    }
                }
            }
        }

        let description = self.state.edge_description(edge);
        let command = self.state.evaluate_command(edge);
        self.status
            .edge_finished(&description, &command, success, &output);

        let start_ms = self.running_since.remove(&edge).unwrap_or(0);
        let end_ms = self.elapsed_ms();

        let restat = self.state.edge_binding_bool(edge, "restat");
        let generator = self.state.edge_binding_bool(edge, "generator");

        if !success {
            self.plan.edge_finished(self.state, edge, false);
            if !restat && !generator {
                self.remove_edge_outputs(edge);
            }
            self.remove_rspfile(edge);
            return Ok(false);
        }

        // Re-stat outputs. A restat edge that left an output untouched
        // lets us re-mark it clean and skip the work downstream of it.
        let mut node_cleaned = false;
        if !self.config.dry_run {
            for out in self.state.edge(edge).outputs.clone() {
                let old_mtime = self.state.node(out).mtime_or_zero();
                let new_mtime = self.disk.stat(&self.state.node(out).path)?;
                self.state.node_mut(out).mtime = Some(new_mtime);
                if restat && new_mtime == old_mtime {
                    let mut scan = DependencyScan {
                        state: &mut *self.state,
                        disk: self.disk,
                        build_log: &*self.build_log,
                        deps_log: &*self.deps_log,
                        explain: self.config.explain,
                    };
                    self.plan.clean_node(&mut scan, out)?;
                    node_cleaned = true;
                }
            }
        }

        // With outputs proven unchanged, the log must instead prove the
        // outputs were current against the newest input.
        let restat_mtime = if node_cleaned {
            self.state
                .edge(edge)
                .dirtying_ins()
                .iter()
                .map(|&input| self.state.node(input).mtime_or_zero())
                .max()
                .unwrap_or(0)
        } else {
            0
        };

        self.plan.edge_finished(self.state, edge, true);
        self.load_ready_dyndeps(edge)?;
        self.remove_rspfile(edge);

        if !self.config.dry_run {
            let hash = hash_command(&self.state.evaluate_command_for_hash(edge));
            for out in self.state.edge(edge).outputs.clone() {
                let mtime = if node_cleaned {
                    restat_mtime
                } else {
                    self.state.node(out).mtime_or_zero()
                };
                self.build_log
                    .record(&self.state.node(out).path, hash, start_ms, end_ms, mtime)
                    .map_err(|e| BuildError::Spawn(format!("writing build log: {}", e)))?;
            }

            if !deps_type.is_empty() {
                let out = self.state.edge(edge).outputs[0];
                let deps_mtime = self.state.node(out).mtime_or_zero();
                self.deps_log
                    .record_deps(self.state, out, deps_mtime, &deps_nodes)
                    .map_err(|e| BuildError::Spawn(format!("writing deps log: {}", e)))?;
                for dep in deps_nodes {
                    if !self.state.edge(edge).inputs.contains(&dep) {
                        self.state.add_discovered_input(edge, dep);
                    }
                }
            }
        }

        Ok(true)
    }

    /// If this edge produced a pending dyndep file, load it and fold
    /// the discovered structure into the graph and the plan.
    fn load_ready_dyndeps(&mut self, edge: EdgeId) -> Result<(), BuildError> {
        for out in self.state.edge(edge).outputs.clone() {
            if !self.state.node(out).dyndep_pending {
                continue;
            }
            let updated = load_dyndeps(self.state, self.disk, out)?;

            // Rescan the updated edges so new inputs get dirty state
            // and any introduced cycle is caught before scheduling.
            for &updated_edge in &updated {
                self.state.edge_mut(updated_edge).mark = VisitMark::None;
                self.state.edge_mut(updated_edge).outs_ready = false;
                let target = self.state.edge(updated_edge).outputs[0];
                let mut validation_nodes = Vec::new();
                self.scan().recompute_dirty(target, &mut validation_nodes)?;
            }
            self.plan.dyndeps_loaded(self.state, &updated)?;
        }
        Ok(())
    }

    fn extract_deps(
        &mut self,
        edge: EdgeId,
        deps_type: &str,
        output: &mut String,
    ) -> Result<Vec<NodeId>, String> {
        match deps_type {
            "msvc" => {
                let prefix = {
                    let p = self.state.edge_binding(edge, "msvc_deps_prefix");
                    if p.is_empty() {
                        "Note: including file: ".to_string()
                    } else {
                        p
                    }
                };
                let mut deps = Vec::new();
                let mut filtered = String::new();
                for line in output.lines() {
                    match line.strip_prefix(&prefix) {
                        Some(path) => {
                            let node = self.state.get_or_create_node(path.trim());
                            if !deps.contains(&node) {
                                deps.push(node);
                            }
                        }
                        None => {
                            filtered.push_str(line);
                            filtered.push('\n');
                        }
                    }
                }
                *output = filtered;
                Ok(deps)
            }
            "gcc" => {
                let depfile = self.state.edge_binding(edge, "depfile");
                if depfile.is_empty() {
                    return Err("edge with deps=gcc but no depfile".to_string());
                }
                let contents = self
                    .disk
                    .read_file(&depfile)
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("expected depfile '{}' but it is missing", depfile))?;
                let text = String::from_utf8_lossy(&contents).into_owned();
                let parsed = parse_depfile(&text).map_err(|e| format!("{}: {}", depfile, e))?;

                let first_out = &self.state.node(self.state.edge(edge).outputs[0]).path;
                if !parsed.outs.iter().any(|o| &canon_path(o) == first_out) {
                    return Err(format!(
                        "expected depfile '{}' to mention '{}', got '{}'",
                        depfile,
                        first_out,
                        parsed.outs.first().map(String::as_str).unwrap_or("")
                    ));
                }
                let deps = parsed
                    .ins
                    .iter()
                    .map(|path| self.state.get_or_create_node(path))
                    .collect();
                // The depfile's content now lives in the deps log.
                let _ = self.disk.remove_file(&depfile);
                Ok(deps)
            }
            other => Err(format!("unknown deps type '{}'", other)),
        }
    }

    fn remove_edge_outputs(&mut self, edge: EdgeId) {
        for out in self.state.edge(edge).outputs.clone() {
            let path = self.state.node(out).path.clone();
            let _ = self.disk.remove_file(&path);
            self.state.node_mut(out).mtime = Some(0);
        }
    }

    fn remove_rspfile(&mut self, edge: EdgeId) {
        let rspfile = self.state.edge_binding(edge, "rspfile");
        if !rspfile.is_empty() {
            let _ = self.disk.remove_file(&rspfile);
        }
    }

    /// Delete partial outputs of edges that were running when the build
    /// was interrupted.
    fn cleanup(&mut self, active_edges: &[EdgeId]) {
        for &edge in active_edges {
            let restat = self.state.edge_binding_bool(edge, "restat");
            let generator = self.state.edge_binding_bool(edge, "generator");
            if !restat && !generator {
                self.remove_edge_outputs(edge);
            }
            self.remove_rspfile(edge);
        }
    }
}
