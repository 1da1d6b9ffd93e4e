//! Auxiliary Tools
//!
//! Read-only inspection tools over the loaded state, dispatched from
//! `-t NAME`:
//! - `compdb [RULE...]`: JSON compilation database
//! - `targets [depth [N]]`: the target tree, to a depth
//! - `query TARGET...`: a target's rule, inputs, and outputs

use serde::Serialize;

use crate::graph::{BuildError, EdgeId, NodeId, State};

#[derive(Serialize)]
struct CompdbEntry {
    directory: String,
    command: String,
    file: String,
    output: String,
}

pub fn run_tool(state: &State, name: &str, args: &[String]) -> Result<(), BuildError> {
    match name {
        "compdb" => compdb(state, args),
        "targets" => targets(state, args),
        "query" => query(state, args),
        other => Err(BuildError::UnknownTarget(format!(
            "unknown tool '{}'; tools are: compdb, targets, query",
            other
        ))),
    }
}

fn compdb(state: &State, rules: &[String]) -> Result<(), BuildError> {
    let directory = std::env::current_dir()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut entries = Vec::new();
    for i in 0..state.edges.len() {
        let edge_id = EdgeId(i as u32);
        let edge = state.edge(edge_id);
        if edge.is_phony() {
            continue;
        }
        if !rules.is_empty() && !rules.iter().any(|r| r == edge.rule.name()) {
            continue;
        }
        let file = edge
            .inputs
            .first()
            .map(|&n| state.node(n).path.clone())
            .unwrap_or_default();
        let output = state.node(edge.outputs[0]).path.clone();
        entries.push(CompdbEntry {
            directory: directory.clone(),
            command: state.evaluate_command(edge_id),
            file,
            output,
        });
    }
    let json = serde_json::to_string_pretty(&entries)
        .map_err(|e| BuildError::Spawn(e.to_string()))?;
    println!("{}", json);
    Ok(())
}

fn targets(state: &State, args: &[String]) -> Result<(), BuildError> {
    let depth = match args {
        [mode] if mode.as_str() == "depth" => 1,
        [mode, n] if mode.as_str() == "depth" => n.parse().unwrap_or(1),
        [] => 1,
        _ => {
            return Err(BuildError::UnknownTarget(
                "targets tool takes 'depth [N]'".to_string(),
            ))
        }
    };
    for node in state.root_nodes() {
        print_target(state, node, 0, depth);
    }
    Ok(())
}

fn print_target(state: &State, node: NodeId, indent: usize, depth_left: usize) {
    let rule = state
        .node(node)
        .in_edge
        .map(|e| state.edge(e).rule.name().to_string())
        .unwrap_or_default();
    println!("{}{}: {}", "  ".repeat(indent), state.node(node).path, rule);
    if depth_left <= 1 {
        return;
    }
    if let Some(edge) = state.node(node).in_edge {
        for &input in &state.edge(edge).inputs {
            if state.node(input).in_edge.is_some() {
                print_target(state, input, indent + 1, depth_left - 1);
            }
        }
    }
}

fn query(state: &State, args: &[String]) -> Result<(), BuildError> {
    if args.is_empty() {
        return Err(BuildError::UnknownTarget(
            "query tool needs at least one target".to_string(),
        ));
    }
    for name in args {
        let node = state
            .lookup_node(name)
            .ok_or_else(|| BuildError::UnknownTarget(name.clone()))?;
        println!("{}:", state.node(node).path);
        if let Some(edge) = state.node(node).in_edge {
            println!("  input: {}", state.edge(edge).rule.name());
            for &input in &state.edge(edge).inputs {
                println!("    {}", state.node(input).path);
            }
        }
        println!("  outputs:");
        for &oe in &state.node(node).out_edges {
            for &out in &state.edge(oe).outputs {
                println!("    {}", state.node(out).path);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryDisk;
    use crate::parser::ManifestParser;

    fn load(manifest: &str) -> State {
        let disk = InMemoryDisk::new();
        let mut state = State::new();
        let scope = state.root_scope;
        let mut parser = ManifestParser::new(&mut state, &disk);
        parser.parse("build.ninja", manifest, scope).unwrap();
        state
    }

    #[test]
    fn test_unknown_tool() {
        let state = load("rule r\n  command = x\nbuild out: r\n");
        assert!(run_tool(&state, "browse", &[]).is_err());
    }

    #[test]
    fn test_query_unknown_target() {
        let state = load("rule r\n  command = x\nbuild out: r\n");
        assert!(query(&state, &["nope".to_string()]).is_err());
    }

    #[test]
    fn test_compdb_runs() {
        let state = load(
            "rule cc\n  command = cc $in -o $out\nbuild a.o: cc a.c\nbuild all: phony a.o\n",
        );
        assert!(compdb(&state, &[]).is_ok());
        assert!(compdb(&state, &["cc".to_string()]).is_ok());
    }
}
