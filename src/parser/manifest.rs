//! Manifest Parser
//!
//! Consumes lexer tokens and materializes the static build graph: the
//! rule table, pools, edges, defaults, and scoped bindings. Parsing is
//! fully eager; nothing is evaluated during the build except command
//! strings.

use std::rc::Rc;

use crate::eval::{EvalString, Rule, ScopeEnv, ScopeId};
use crate::fs::Disk;
use crate::graph::{Pool, State, DEFAULT_POOL};
use crate::parser::lexer::{Lexer, Token};
use crate::parser::types::{ParseException, MAX_INCLUDE_DEPTH};

pub struct ManifestParser<'a> {
    state: &'a mut State,
    disk: &'a dyn Disk,
    include_depth: usize,
}

impl<'a> ManifestParser<'a> {
    pub fn new(state: &'a mut State, disk: &'a dyn Disk) -> Self {
        Self {
            state,
            disk,
            include_depth: 0,
        }
    }

    /// Parse the top-level manifest file.
    pub fn load(&mut self, path: &str) -> Result<(), ParseException> {
        let scope = self.state.root_scope;
        self.load_file(path, scope)
    }

    fn load_file(&mut self, path: &str, scope: ScopeId) -> Result<(), ParseException> {
        let contents = self
            .disk
            .read_file(path)
            .map_err(|e| ParseException::file_error(path, e.to_string()))?
            .ok_or_else(|| {
                ParseException::file_error(path, format!("loading '{}': file not found", path))
            })?;
        let text = String::from_utf8_lossy(&contents).into_owned();
        self.parse(path, &text, scope)
    }

    /// Parse manifest text into the state. Exposed for tests.
    pub fn parse(
        &mut self,
        filename: &str,
        text: &str,
        scope: ScopeId,
    ) -> Result<(), ParseException> {
        let mut lexer = Lexer::new(filename, text);
        loop {
            match lexer.read_token()? {
                Token::Pool => self.parse_pool(&mut lexer, scope)?,
                Token::Build => self.parse_edge(&mut lexer, scope)?,
                Token::Rule => self.parse_rule(&mut lexer, scope)?,
                Token::Default => self.parse_default(&mut lexer, scope)?,
                Token::Ident => {
                    let (name, value) = self.parse_let(&mut lexer)?;
                    let evaluated = value.evaluate(&ScopeEnv {
                        scopes: &self.state.scopes,
                        scope,
                    });
                    self.state.scopes.add_binding(scope, &name, evaluated);
                }
                Token::Include => self.parse_file_inclusion(&mut lexer, scope, false)?,
                Token::Subninja => self.parse_file_inclusion(&mut lexer, scope, true)?,
                Token::Newline => {}
                Token::Eof => break,
                token => {
                    return Err(lexer.error(format!("unexpected {}", token.as_str())));
                }
            }
        }
        Ok(())
    }

    fn expect_token(&self, lexer: &mut Lexer, expected: Token) -> Result<(), ParseException> {
        let token = lexer.read_token()?;
        if token != expected {
            return Err(lexer.error(format!(
                "expected {}, got {}",
                expected.as_str(),
                token.as_str()
            )));
        }
        Ok(())
    }

    /// A newline, or end of input (for manifests missing the final
    /// newline).
    fn expect_statement_end(&self, lexer: &mut Lexer) -> Result<(), ParseException> {
        let token = lexer.read_token()?;
        if token != Token::Newline && token != Token::Eof {
            return Err(lexer.error(format!("expected newline, got {}", token.as_str())));
        }
        Ok(())
    }

    /// `NAME = value` (the value stays lazy).
    fn parse_let(&self, lexer: &mut Lexer) -> Result<(String, EvalString), ParseException> {
        let name = lexer
            .read_ident()
            .ok_or_else(|| lexer.error("expected variable name"))?;
        self.expect_token(lexer, Token::Equals)?;
        let value = lexer.read_var_value()?;
        Ok((name, value))
    }

    fn parse_rule(&mut self, lexer: &mut Lexer, scope: ScopeId) -> Result<(), ParseException> {
        let name = lexer
            .read_ident()
            .ok_or_else(|| lexer.error("expected rule name"))?;
        if self.state.scopes.has_rule_local(scope, &name) || name == "phony" {
            return Err(lexer.error(format!("duplicate rule '{}'", name)));
        }
        self.expect_statement_end(lexer)?;

        let mut rule = Rule::new(&name);
        while lexer.peek_token(Token::Indent)? {
            let (key, value) = self.parse_let(lexer)?;
            if !Rule::is_reserved_binding(&key) {
                return Err(lexer.error(format!("unexpected variable '{}'", key)));
            }
            rule.add_binding(&key, value);
        }

        if rule.binding("rspfile").is_some() != rule.binding("rspfile_content").is_some() {
            return Err(
                lexer.error("rspfile and rspfile_content need to be both specified")
            );
        }
        self.state.scopes.add_rule(scope, Rc::new(rule));
        Ok(())
    }

    fn parse_pool(&mut self, lexer: &mut Lexer, scope: ScopeId) -> Result<(), ParseException> {
        let name = lexer
            .read_ident()
            .ok_or_else(|| lexer.error("expected pool name"))?;
        if self.state.pools.contains_key(&name) {
            return Err(lexer.error(format!("duplicate pool '{}'", name)));
        }
        self.expect_statement_end(lexer)?;

        let mut depth: Option<usize> = None;
        while lexer.peek_token(Token::Indent)? {
            let (key, value) = self.parse_let(lexer)?;
            if key != "depth" {
                return Err(lexer.error(format!("unexpected variable '{}'", key)));
            }
            let text = value.evaluate(&ScopeEnv {
                scopes: &self.state.scopes,
                scope,
            });
            depth = Some(
                text.parse::<usize>()
                    .map_err(|_| lexer.error(format!("invalid pool depth '{}'", text)))?,
            );
        }

        let depth = depth.ok_or_else(|| lexer.error("expected 'depth =' line"))?;
        self.state.pools.insert(name.clone(), Pool { name, depth });
        Ok(())
    }

    fn parse_default(&mut self, lexer: &mut Lexer, scope: ScopeId) -> Result<(), ParseException> {
        let mut found = false;
        while let Some(path) = lexer.read_path()? {
            found = true;
            let evaluated = path.evaluate(&ScopeEnv {
                scopes: &self.state.scopes,
                scope,
            });
            let node = self
                .state
                .lookup_node(&evaluated)
                .ok_or_else(|| lexer.error(format!("unknown target '{}'", evaluated)))?;
            self.state.defaults.push(node);
        }
        if !found {
            return Err(lexer.error("expected target name"));
        }
        self.expect_statement_end(lexer)
    }

    fn parse_file_inclusion(
        &mut self,
        lexer: &mut Lexer,
        scope: ScopeId,
        new_scope: bool,
    ) -> Result<(), ParseException> {
        let path = lexer
            .read_path()?
            .ok_or_else(|| lexer.error("expected path"))?;
        self.expect_statement_end(lexer)?;
        let evaluated = path.evaluate(&ScopeEnv {
            scopes: &self.state.scopes,
            scope,
        });

        if self.include_depth >= MAX_INCLUDE_DEPTH {
            return Err(lexer.error(format!(
                "include nesting too deep at '{}'",
                evaluated
            )));
        }
        let child_scope = if new_scope {
            self.state.scopes.add_child(scope)
        } else {
            scope
        };
        self.include_depth += 1;
        let result = self.load_file(&evaluated, child_scope);
        self.include_depth -= 1;
        result
    }

    fn parse_edge(&mut self, lexer: &mut Lexer, scope: ScopeId) -> Result<(), ParseException> {
        let mut outs: Vec<EvalString> = Vec::new();
        while let Some(path) = lexer.read_path()? {
            outs.push(path);
        }
        if outs.is_empty() {
            return Err(lexer.error("expected path"));
        }

        let mut implicit_outs = 0;
        if lexer.peek_token(Token::Pipe)? {
            while let Some(path) = lexer.read_path()? {
                outs.push(path);
                implicit_outs += 1;
            }
        }

        self.expect_token(lexer, Token::Colon)?;
        let rule_name = lexer
            .read_ident()
            .ok_or_else(|| lexer.error("expected build command name"))?;
        let rule = self
            .state
            .scopes
            .lookup_rule(scope, &rule_name)
            .cloned()
            .ok_or_else(|| lexer.error(format!("unknown build rule '{}'", rule_name)))?;

        let mut ins: Vec<EvalString> = Vec::new();
        while let Some(path) = lexer.read_path()? {
            ins.push(path);
        }
        let explicit_ins = ins.len();

        let mut implicit_ins = 0;
        if lexer.peek_token(Token::Pipe)? {
            while let Some(path) = lexer.read_path()? {
                ins.push(path);
                implicit_ins += 1;
            }
        }

        if lexer.peek_token(Token::Pipe2)? {
            while let Some(path) = lexer.read_path()? {
                ins.push(path);
            }
        }

        let mut validations: Vec<EvalString> = Vec::new();
        if lexer.peek_token(Token::PipeAt)? {
            while let Some(path) = lexer.read_path()? {
                validations.push(path);
            }
        }

        self.expect_statement_end(lexer)?;

        // Edge bindings live in a child scope so they shadow the file
        // scope; values are evaluated eagerly and may reference earlier
        // bindings on the same edge.
        let edge_scope = self.state.scopes.add_child(scope);
        while lexer.peek_token(Token::Indent)? {
            let (key, value) = self.parse_let(lexer)?;
            let evaluated = value.evaluate(&ScopeEnv {
                scopes: &self.state.scopes,
                scope: edge_scope,
            });
            self.state.scopes.add_binding(edge_scope, &key, evaluated);
        }

        let edge = self.state.add_edge(rule, edge_scope, DEFAULT_POOL);

        let env = ScopeEnv {
            scopes: &self.state.scopes,
            scope: edge_scope,
        };
        let out_paths: Vec<String> = outs.iter().map(|p| p.evaluate(&env)).collect();
        let in_paths: Vec<String> = ins.iter().map(|p| p.evaluate(&env)).collect();
        let validation_paths: Vec<String> =
            validations.iter().map(|p| p.evaluate(&env)).collect();

        for path in &out_paths {
            if path.is_empty() {
                return Err(lexer.error("empty path"));
            }
            let node = self.state.get_or_create_node(path);
            if !self.state.add_edge_output(edge, node) {
                return Err(lexer.error(format!("multiple rules generate {}", path)));
            }
        }
        self.state.edge_mut(edge).explicit_outs = out_paths.len() - implicit_outs;

        for path in &in_paths {
            if path.is_empty() {
                return Err(lexer.error("empty path"));
            }
            let node = self.state.get_or_create_node(path);
            self.state.add_edge_input(edge, node);
        }
        self.state.edge_mut(edge).explicit_ins = explicit_ins;
        self.state.edge_mut(edge).implicit_ins = implicit_ins;

        for path in &validation_paths {
            let node = self.state.get_or_create_node(path);
            self.state.add_edge_validation(edge, node);
        }

        let pool_name = self.state.edge_binding(edge, "pool");
        if !pool_name.is_empty() {
            let pool = self
                .state
                .pool_index(&pool_name)
                .ok_or_else(|| lexer.error(format!("unknown pool name '{}'", pool_name)))?;
            self.state.edge_mut(edge).pool = pool;
        }

        let dyndep = self.state.edge_binding(edge, "dyndep");
        if !dyndep.is_empty() {
            let node = self.state.get_or_create_node(&dyndep);
            if !self.state.edge(edge).inputs.contains(&node) {
                return Err(lexer.error(format!("dyndep '{}' is not an input", dyndep)));
            }
            self.state.node_mut(node).dyndep_pending = true;
            self.state.edge_mut(edge).dyndep = Some(node);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryDisk;

    fn parse_ok(text: &str) -> State {
        let mut state = State::new();
        let disk = InMemoryDisk::new();
        let mut parser = ManifestParser::new(&mut state, &disk);
        let scope = parser.state.root_scope;
        parser.parse("build.ninja", text, scope).unwrap();
        state
    }

    fn parse_err(text: &str) -> ParseException {
        let mut state = State::new();
        let disk = InMemoryDisk::new();
        let mut parser = ManifestParser::new(&mut state, &disk);
        let scope = parser.state.root_scope;
        parser.parse("build.ninja", text, scope).unwrap_err()
    }

    #[test]
    fn test_basic_manifest() {
        let state = parse_ok(
            "rule cat\n  command = cat $in > $out\nbuild out: cat a b\n",
        );
        assert_eq!(state.edges.len(), 1);
        let edge = crate::graph::EdgeId(0);
        assert_eq!(state.evaluate_command(edge), "cat a b > out");
        assert_eq!(state.edge(edge).explicit_ins, 2);
        assert_eq!(state.edge(edge).explicit_outs, 1);
        crate::graph::check_graph_invariants(&state);
    }

    #[test]
    fn test_implicit_and_order_only_inputs() {
        let state = parse_ok(
            "rule cc\n  command = cc $in\nbuild o: cc a | b c || d\n",
        );
        let e = state.edge(crate::graph::EdgeId(0));
        assert_eq!(e.explicit_ins, 1);
        assert_eq!(e.implicit_ins, 2);
        assert_eq!(e.order_only_ins().len(), 1);
        // Order-only and implicit inputs stay out of $in.
        assert_eq!(state.evaluate_command(crate::graph::EdgeId(0)), "cc a");
    }

    #[test]
    fn test_implicit_outputs_and_validations() {
        let state = parse_ok(
            "rule cc\n  command = cc\nbuild o | o.d: cc a |@ check\n",
        );
        let e = state.edge(crate::graph::EdgeId(0));
        assert_eq!(e.outputs.len(), 2);
        assert_eq!(e.explicit_outs, 1);
        assert_eq!(e.validations.len(), 1);
        let check = state.lookup_node("check").unwrap();
        assert_eq!(
            state.node(check).validation_out_edges,
            vec![crate::graph::EdgeId(0)]
        );
    }

    #[test]
    fn test_variable_scoping_on_edges() {
        let state = parse_ok(
            "flags = -O1\nrule cc\n  command = cc $flags $in\nbuild a.o: cc a.c\nbuild b.o: cc b.c\n  flags = -O2\n",
        );
        assert_eq!(
            state.evaluate_command(crate::graph::EdgeId(0)),
            "cc -O1 a.c"
        );
        assert_eq!(
            state.evaluate_command(crate::graph::EdgeId(1)),
            "cc -O2 b.c"
        );
    }

    #[test]
    fn test_edge_binding_references_earlier_binding() {
        let state = parse_ok(
            "rule r\n  command = $combined\nbuild o: r i\n  base = x\n  combined = ${base}-y\n",
        );
        assert_eq!(state.evaluate_command(crate::graph::EdgeId(0)), "x-y");
    }

    #[test]
    fn test_phony_is_builtin() {
        let state = parse_ok("build all: phony a b\n");
        assert!(state.edge(crate::graph::EdgeId(0)).is_phony());
    }

    #[test]
    fn test_pool_declaration_and_use() {
        let state = parse_ok(
            "pool link\n  depth = 2\nrule ld\n  command = ld\n  pool = link\nbuild out: ld a\n",
        );
        let pool = state.edge(crate::graph::EdgeId(0)).pool;
        assert_eq!(state.pools.get_index(pool).unwrap().0, "link");
        assert_eq!(state.pools["link"].depth, 2);
    }

    #[test]
    fn test_console_pool_is_predefined() {
        let state = parse_ok(
            "rule r\n  command = x\n  pool = console\nbuild out: r\n",
        );
        assert_eq!(
            state.edge(crate::graph::EdgeId(0)).pool,
            crate::graph::CONSOLE_POOL
        );
    }

    #[test]
    fn test_defaults() {
        let state = parse_ok(
            "rule r\n  command = x\nbuild a: r\nbuild b: r\ndefault a\n",
        );
        assert_eq!(state.defaults.len(), 1);
        assert_eq!(state.node(state.defaults[0]).path, "a");
    }

    #[test]
    fn test_paths_are_canonicalized() {
        let state = parse_ok(
            "rule r\n  command = x\nbuild ./out: r foo/../a.c\n",
        );
        assert!(state.lookup_node("out").is_some());
        assert!(state.lookup_node("a.c").is_some());
        assert_eq!(state.nodes.len(), 2);
    }

    #[test]
    fn test_dyndep_binding() {
        let state = parse_ok(
            "rule r\n  command = x\nbuild out: r in || dd\n  dyndep = dd\n",
        );
        let e = state.edge(crate::graph::EdgeId(0));
        let dd = state.lookup_node("dd").unwrap();
        assert_eq!(e.dyndep, Some(dd));
        assert!(state.node(dd).dyndep_pending);
    }

    #[test]
    fn test_error_duplicate_rule() {
        let err = parse_err("rule cc\n  command = a\nrule cc\n  command = b\n");
        assert!(err.message.contains("duplicate rule 'cc'"));
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_error_duplicate_output() {
        let err = parse_err(
            "rule r\n  command = x\nbuild out: r a\nbuild out: r b\n",
        );
        assert!(err.message.contains("multiple rules generate out"));
    }

    #[test]
    fn test_error_unknown_rule() {
        let err = parse_err("build out: nope in\n");
        assert!(err.message.contains("unknown build rule 'nope'"));
    }

    #[test]
    fn test_error_unknown_default() {
        let err = parse_err("default nothing\n");
        assert!(err.message.contains("unknown target 'nothing'"));
    }

    #[test]
    fn test_error_bad_pool_depth() {
        let err = parse_err("pool p\n  depth = many\n");
        assert!(err.message.contains("invalid pool depth"));
        let err = parse_err("pool p\n");
        assert!(err.message.contains("expected 'depth ='"));
    }

    #[test]
    fn test_error_unknown_pool() {
        let err = parse_err(
            "rule r\n  command = x\nbuild out: r\n  pool = nope\n",
        );
        assert!(err.message.contains("unknown pool name 'nope'"));
    }

    #[test]
    fn test_error_dyndep_not_an_input() {
        let err = parse_err(
            "rule r\n  command = x\nbuild out: r in\n  dyndep = dd\n",
        );
        assert!(err.message.contains("dyndep 'dd' is not an input"));
    }

    #[test]
    fn test_error_rspfile_without_content() {
        let err = parse_err("rule r\n  command = x\n  rspfile = a.rsp\n");
        assert!(err.message.contains("rspfile_content"));
    }

    #[test]
    fn test_error_rule_with_unknown_binding() {
        let err = parse_err("rule r\n  command = x\n  stuff = y\n");
        assert!(err.message.contains("unexpected variable 'stuff'"));
    }

    #[test]
    fn test_include_inherits_scope_subninja_does_not_leak() {
        let mut state = State::new();
        let disk = InMemoryDisk::new();
        disk.create("inner.ninja", "x = from-include\n");
        disk.create(
            "sub.ninja",
            "x = from-sub\nrule r\n  command = $x\nbuild subout: r\n",
        );
        let mut parser = ManifestParser::new(&mut state, &disk);
        let scope = parser.state.root_scope;
        parser
            .parse(
                "build.ninja",
                "x = top\ninclude inner.ninja\nsubninja sub.ninja\nrule t\n  command = $x\nbuild topout: t\n",
                scope,
            )
            .unwrap();
        // include rebinds in the same scope; subninja's binding stays in
        // its child scope.
        assert_eq!(state.scopes.lookup(scope, "x"), Some("from-include"));
        let sub_edge = (0..state.edges.len())
            .map(|i| crate::graph::EdgeId(i as u32))
            .find(|e| state.node(state.edge(*e).outputs[0]).path == "subout")
            .unwrap();
        assert_eq!(state.evaluate_command(sub_edge), "from-sub");
    }

    #[test]
    fn test_missing_include_is_an_error() {
        let mut state = State::new();
        let disk = InMemoryDisk::new();
        let mut parser = ManifestParser::new(&mut state, &disk);
        let scope = parser.state.root_scope;
        let err = parser
            .parse("build.ninja", "include missing.ninja\n", scope)
            .unwrap_err();
        assert!(err.message.contains("missing.ninja"));
    }
}
