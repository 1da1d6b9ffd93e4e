//! Dyndep Loading
//!
//! Applies a parsed dyndep file to the graph: extra implicit inputs and
//! outputs for the edges that declared `dyndep = FILE`, plus an
//! optional restat flag. Loading happens either during the dirty scan
//! (when the file already exists and is clean) or mid-build, right
//! after the edge producing the file finishes.

use std::collections::HashSet;

use crate::fs::Disk;
use crate::graph::{BuildError, EdgeId, NodeId, State};
use crate::parser::parse_dyndep;

/// Load a dyndep file and update every edge bound to it. Returns the
/// updated edges so the caller can rescan them and refresh the plan.
pub fn load_dyndeps(
    state: &mut State,
    disk: &dyn Disk,
    dyndep_node: NodeId,
) -> Result<Vec<EdgeId>, BuildError> {
    let path = state.node(dyndep_node).path.clone();
    let contents = disk
        .read_file(&path)?
        .ok_or_else(|| BuildError::Dyndep(format!("loading '{}': file not found", path)))?;
    let text = String::from_utf8_lossy(&contents).into_owned();
    let file =
        parse_dyndep(&path, &text).map_err(|e| BuildError::Dyndep(e.to_string()))?;

    // The edges that asked for this file; each must be mentioned.
    let bound_edges: Vec<EdgeId> = (0..state.edges.len() as u32)
        .map(EdgeId)
        .filter(|&e| state.edge(e).dyndep == Some(dyndep_node))
        .collect();

    let mut updated: HashSet<EdgeId> = HashSet::new();
    for entry in &file.entries {
        let out_node = state.lookup_node(&entry.output).ok_or_else(|| {
            BuildError::Dyndep(format!(
                "dyndep file '{}' mentions unknown output '{}'",
                path, entry.output
            ))
        })?;
        let edge = state
            .node(out_node)
            .in_edge
            .filter(|e| state.edge(*e).dyndep == Some(dyndep_node))
            .ok_or_else(|| {
                BuildError::Dyndep(format!(
                    "dyndep file '{}' mentions output '{}' whose build statement \
                     does not have a dyndep binding for the file",
                    path, entry.output
                ))
            })?;
        if !updated.insert(edge) {
            return Err(BuildError::Dyndep(format!(
                "dyndep file '{}' mentions output '{}' more than once",
                path, entry.output
            )));
        }

        if entry.restat {
            let scope = state.edge(edge).scope;
            state.scopes.add_binding(scope, "restat", "1".to_string());
        }
        for out_path in &entry.implicit_outputs {
            let node = state.get_or_create_node(out_path);
            if !state.add_edge_output(edge, node) {
                return Err(BuildError::Dyndep(format!(
                    "multiple rules generate {}",
                    state.node(node).path
                )));
            }
        }
        for in_path in &entry.implicit_inputs {
            let node = state.get_or_create_node(in_path);
            state.add_discovered_input(edge, node);
        }
    }

    for &edge in &bound_edges {
        if !updated.contains(&edge) {
            let out = state.edge(edge).outputs[0];
            return Err(BuildError::Dyndep(format!(
                "'{}' not mentioned in its dyndep file '{}'",
                state.node(out).path, path
            )));
        }
    }

    state.node_mut(dyndep_node).dyndep_pending = false;
    Ok(bound_edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryDisk;
    use crate::parser::ManifestParser;

    fn load_manifest(disk: &InMemoryDisk, text: &str) -> State {
        let mut state = State::new();
        let scope = state.root_scope;
        let mut parser = ManifestParser::new(&mut state, disk);
        parser.parse("build.ninja", text, scope).unwrap();
        state
    }

    #[test]
    fn test_load_adds_inputs_and_outputs() {
        let disk = InMemoryDisk::new();
        disk.create(
            "dd",
            "ninja_dyndep_version = 1\nbuild out | out.extra: dyndep | dep.extra\n",
        );
        let mut state = load_manifest(
            &disk,
            "rule r\n  command = x\nbuild out: r in || dd\n  dyndep = dd\n",
        );
        let dd = state.lookup_node("dd").unwrap();
        let updated = load_dyndeps(&mut state, &disk, dd).unwrap();
        assert_eq!(updated.len(), 1);

        let edge = updated[0];
        let e = state.edge(edge);
        assert_eq!(e.outputs.len(), 2);
        assert_eq!(e.implicit_ins, 1);
        assert!(!state.node(dd).dyndep_pending);
        let extra_out = state.lookup_node("out.extra").unwrap();
        assert_eq!(state.node(extra_out).in_edge, Some(edge));
    }

    #[test]
    fn test_restat_flag_applied() {
        let disk = InMemoryDisk::new();
        disk.create(
            "dd",
            "ninja_dyndep_version = 1\nbuild out: dyndep\n  restat = 1\n",
        );
        let mut state = load_manifest(
            &disk,
            "rule r\n  command = x\nbuild out: r in || dd\n  dyndep = dd\n",
        );
        let dd = state.lookup_node("dd").unwrap();
        let updated = load_dyndeps(&mut state, &disk, dd).unwrap();
        assert!(state.edge_binding_bool(updated[0], "restat"));
    }

    #[test]
    fn test_unknown_output_is_fatal() {
        let disk = InMemoryDisk::new();
        disk.create("dd", "ninja_dyndep_version = 1\nbuild nothere: dyndep\n");
        let mut state = load_manifest(
            &disk,
            "rule r\n  command = x\nbuild out: r in || dd\n  dyndep = dd\n",
        );
        let dd = state.lookup_node("dd").unwrap();
        let err = load_dyndeps(&mut state, &disk, dd).unwrap_err();
        assert!(err.to_string().contains("unknown output 'nothere'"));
    }

    #[test]
    fn test_edge_without_entry_is_fatal() {
        let disk = InMemoryDisk::new();
        disk.create("dd", "ninja_dyndep_version = 1\nbuild out: dyndep\n");
        let mut state = load_manifest(
            &disk,
            "rule r\n  command = x\nbuild out: r in || dd\n  dyndep = dd\nbuild out2: r in2 || dd\n  dyndep = dd\n",
        );
        let dd = state.lookup_node("dd").unwrap();
        let err = load_dyndeps(&mut state, &disk, dd).unwrap_err();
        assert!(err.to_string().contains("not mentioned"));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let disk = InMemoryDisk::new();
        disk.create(
            "dd",
            "ninja_dyndep_version = 1\nbuild out | other: dyndep\n",
        );
        let mut state = load_manifest(
            &disk,
            "rule r\n  command = x\nbuild out: r in || dd\n  dyndep = dd\nbuild other: r\n",
        );
        let dd = state.lookup_node("dd").unwrap();
        let err = load_dyndeps(&mut state, &disk, dd).unwrap_err();
        assert!(err.to_string().contains("multiple rules generate other"));
    }
}
