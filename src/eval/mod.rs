//! Evaluation Environment
//!
//! Manifest binding values are lazy template strings: sequences of
//! literal and variable segments built at parse time and expanded on
//! demand against a chain of scopes (edge over rule over file).
//! Expansion is pure; an undefined variable expands to the empty string.

use std::collections::HashMap;
use std::rc::Rc;

/// One segment of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalPart {
    Literal(String),
    Variable(String),
}

/// A parsed template string, e.g. `cc -c $in -o $out`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalString {
    parts: Vec<EvalPart>,
}

impl EvalString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn literal(text: &str) -> Self {
        let mut s = Self::new();
        s.push_literal(text);
        s
    }

    pub fn push_literal(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        // Coalesce adjacent literals so evaluation is a simple walk.
        if let Some(EvalPart::Literal(last)) = self.parts.last_mut() {
            last.push_str(text);
        } else {
            self.parts.push(EvalPart::Literal(text.to_string()));
        }
    }

    pub fn push_char(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.push_literal(c.encode_utf8(&mut buf));
    }

    pub fn push_variable(&mut self, name: &str) {
        self.parts.push(EvalPart::Variable(name.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parts(&self) -> &[EvalPart] {
        &self.parts
    }

    /// Expand against an environment. Undefined variables become "".
    pub fn evaluate(&self, env: &dyn Env) -> String {
        let mut result = String::new();
        for part in &self.parts {
            match part {
                EvalPart::Literal(text) => result.push_str(text),
                EvalPart::Variable(name) => {
                    if let Some(value) = env.lookup_variable(name) {
                        result.push_str(&value);
                    }
                }
            }
        }
        result
    }
}

/// Variable lookup, implemented by scope chains and the per-edge
/// environment that synthesizes `in`/`out`.
pub trait Env {
    fn lookup_variable(&self, var: &str) -> Option<String>;
}

/// The empty environment: every variable is undefined.
pub struct NullEnv;

impl Env for NullEnv {
    fn lookup_variable(&self, _var: &str) -> Option<String> {
        None
    }
}

/// A named rule: a template for edges, with lazy binding values.
#[derive(Debug)]
pub struct Rule {
    name: String,
    bindings: HashMap<String, EvalString>,
}

impl Rule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: HashMap::new(),
        }
    }

    /// The built-in rule backing `build out: phony ...` edges.
    pub fn phony() -> Rc<Self> {
        Rc::new(Self::new("phony"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_binding(&mut self, name: &str, value: EvalString) {
        self.bindings.insert(name.to_string(), value);
    }

    pub fn binding(&self, name: &str) -> Option<&EvalString> {
        self.bindings.get(name)
    }

    /// Binding names a rule is allowed to declare.
    pub fn is_reserved_binding(name: &str) -> bool {
        matches!(
            name,
            "command"
                | "depfile"
                | "dyndep"
                | "description"
                | "deps"
                | "generator"
                | "pool"
                | "restat"
                | "rspfile"
                | "rspfile_content"
                | "msvc_deps_prefix"
        )
    }
}

/// Identifier for a scope in the scope arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScopeId(u32);

#[derive(Debug, Default)]
struct Scope {
    parent: Option<ScopeId>,
    bindings: HashMap<String, String>,
    rules: HashMap<String, Rc<Rule>>,
}

/// Arena of binding scopes. The root scope holds file-global bindings;
/// `subninja` files and edges get child scopes. Lookup walks
/// child-to-parent.
#[derive(Debug, Default)]
pub struct Scopes {
    scopes: Vec<Scope>,
}

impl Scopes {
    pub fn new() -> (Self, ScopeId) {
        let mut scopes = Self::default();
        let root = scopes.push(None);
        (scopes, root)
    }

    fn push(&mut self, parent: Option<ScopeId>) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            parent,
            ..Default::default()
        });
        id
    }

    pub fn add_child(&mut self, parent: ScopeId) -> ScopeId {
        self.push(Some(parent))
    }

    pub fn add_binding(&mut self, scope: ScopeId, name: &str, value: String) {
        self.scopes[scope.0 as usize]
            .bindings
            .insert(name.to_string(), value);
    }

    /// Walk the chain looking for a binding.
    pub fn lookup(&self, scope: ScopeId, var: &str) -> Option<&str> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = &self.scopes[id.0 as usize];
            if let Some(value) = s.bindings.get(var) {
                return Some(value);
            }
            current = s.parent;
        }
        None
    }

    /// Look up a binding in this scope only, ignoring parents.
    pub fn lookup_local(&self, scope: ScopeId, var: &str) -> Option<&str> {
        self.scopes[scope.0 as usize]
            .bindings
            .get(var)
            .map(String::as_str)
    }

    /// Look up a binding starting at the scope's parent.
    pub fn lookup_in_parents(&self, scope: ScopeId, var: &str) -> Option<&str> {
        match self.scopes[scope.0 as usize].parent {
            Some(parent) => self.lookup(parent, var),
            None => None,
        }
    }

    /// Register a rule. Returns false if the scope already has a rule
    /// with this name.
    pub fn add_rule(&mut self, scope: ScopeId, rule: Rc<Rule>) -> bool {
        let rules = &mut self.scopes[scope.0 as usize].rules;
        if rules.contains_key(rule.name()) {
            return false;
        }
        rules.insert(rule.name().to_string(), rule);
        true
    }

    /// Whether this scope (ignoring parents) already defines a rule.
    pub fn has_rule_local(&self, scope: ScopeId, name: &str) -> bool {
        self.scopes[scope.0 as usize].rules.contains_key(name)
    }

    /// Walk the chain looking for a rule.
    pub fn lookup_rule(&self, scope: ScopeId, name: &str) -> Option<&Rc<Rule>> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = &self.scopes[id.0 as usize];
            if let Some(rule) = s.rules.get(name) {
                return Some(rule);
            }
            current = s.parent;
        }
        None
    }
}

/// Env over a scope chain.
pub struct ScopeEnv<'a> {
    pub scopes: &'a Scopes,
    pub scope: ScopeId,
}

impl<'a> Env for ScopeEnv<'a> {
    fn lookup_variable(&self, var: &str) -> Option<String> {
        self.scopes.lookup(self.scope, var).map(str::to_string)
    }
}

/// Quote a path for inclusion in a `/bin/sh -c` command line.
pub fn shell_escape(input: &str, result: &mut String) {
    let safe = !input.is_empty()
        && input
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"_+-./=@%^,:".contains(&b));
    if safe {
        result.push_str(input);
        return;
    }
    result.push('\'');
    for c in input.chars() {
        if c == '\'' {
            result.push_str("'\\''");
        } else {
            result.push(c);
        }
    }
    result.push('\'');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_str(parts: &[(&str, bool)]) -> EvalString {
        let mut s = EvalString::new();
        for (text, is_var) in parts {
            if *is_var {
                s.push_variable(text);
            } else {
                s.push_literal(text);
            }
        }
        s
    }

    #[test]
    fn test_evaluate_literals_and_vars() {
        let (mut scopes, root) = Scopes::new();
        scopes.add_binding(root, "cflags", "-O2".to_string());
        let env = ScopeEnv {
            scopes: &scopes,
            scope: root,
        };
        let s = eval_str(&[("cc ", false), ("cflags", true), (" -c", false)]);
        assert_eq!(s.evaluate(&env), "cc -O2 -c");
    }

    #[test]
    fn test_undefined_variable_is_empty() {
        let s = eval_str(&[("a", false), ("nope", true), ("b", false)]);
        assert_eq!(s.evaluate(&NullEnv), "ab");
    }

    #[test]
    fn test_evaluation_is_pure() {
        let (mut scopes, root) = Scopes::new();
        scopes.add_binding(root, "x", "1".to_string());
        let env = ScopeEnv {
            scopes: &scopes,
            scope: root,
        };
        let s = eval_str(&[("v=", false), ("x", true)]);
        assert_eq!(s.evaluate(&env), s.evaluate(&env));
    }

    #[test]
    fn test_scope_chain_shadowing() {
        let (mut scopes, root) = Scopes::new();
        scopes.add_binding(root, "x", "outer".to_string());
        scopes.add_binding(root, "y", "kept".to_string());
        let child = scopes.add_child(root);
        scopes.add_binding(child, "x", "inner".to_string());

        assert_eq!(scopes.lookup(child, "x"), Some("inner"));
        assert_eq!(scopes.lookup(child, "y"), Some("kept"));
        assert_eq!(scopes.lookup(root, "x"), Some("outer"));
        assert_eq!(scopes.lookup_in_parents(child, "x"), Some("outer"));
    }

    #[test]
    fn test_rule_lookup_walks_parents() {
        let (mut scopes, root) = Scopes::new();
        let child = scopes.add_child(root);
        assert!(scopes.add_rule(root, Rc::new(Rule::new("cc"))));
        assert!(!scopes.add_rule(root, Rc::new(Rule::new("cc"))));
        // A child scope may shadow a parent rule.
        assert!(scopes.add_rule(child, Rc::new(Rule::new("cc"))));
        assert!(scopes.lookup_rule(child, "cc").is_some());
        assert!(scopes.lookup_rule(root, "phony").is_none());
    }

    #[test]
    fn test_shell_escape() {
        let mut out = String::new();
        shell_escape("plain/file.o", &mut out);
        assert_eq!(out, "plain/file.o");

        let mut out = String::new();
        shell_escape("has space", &mut out);
        assert_eq!(out, "'has space'");

        let mut out = String::new();
        shell_escape("it's", &mut out);
        assert_eq!(out, "'it'\\''s'");
    }
}
