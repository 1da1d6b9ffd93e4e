//! Dyndep File Parser
//!
//! A dyndep file describes, for edges that declared `dyndep = FILE`,
//! the implicit inputs and outputs discovered while building. The
//! format reuses the manifest lexer:
//!
//! ```text
//! ninja_dyndep_version = 1
//! build out | extra.out: dyndep | extra.in
//!   restat = 1
//! ```
//!
//! Applying the parsed entries to the graph happens in the dyndep
//! loader; this module is syntax only.

use crate::eval::NullEnv;
use crate::parser::lexer::{Lexer, Token};
use crate::parser::types::ParseException;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DyndepEntry {
    /// The explicit output naming the edge this entry updates.
    pub output: String,
    pub implicit_outputs: Vec<String>,
    pub implicit_inputs: Vec<String>,
    pub restat: bool,
}

#[derive(Debug, Default)]
pub struct DyndepFile {
    pub entries: Vec<DyndepEntry>,
}

pub fn parse_dyndep(filename: &str, text: &str) -> Result<DyndepFile, ParseException> {
    let mut lexer = Lexer::new(filename, text);
    let mut file = DyndepFile::default();
    let mut saw_version = false;

    loop {
        match lexer.read_token()? {
            Token::Ident if !saw_version => {
                let name = lexer
                    .read_ident()
                    .ok_or_else(|| lexer.error("expected variable name"))?;
                if name != "ninja_dyndep_version" {
                    return Err(
                        lexer.error("expected 'ninja_dyndep_version = ...' statement")
                    );
                }
                expect_token(&mut lexer, Token::Equals)?;
                let version = lexer.read_var_value()?.evaluate(&NullEnv);
                if version != "1" && !version.starts_with("1.") {
                    return Err(lexer.error(format!(
                        "unsupported 'ninja_dyndep_version = {}'",
                        version
                    )));
                }
                saw_version = true;
            }
            Token::Build if saw_version => {
                file.entries.push(parse_build(&mut lexer)?);
            }
            Token::Newline => {}
            Token::Eof => break,
            token if !saw_version => {
                return Err(lexer.error(format!(
                    "expected 'ninja_dyndep_version = ...' statement, got {}",
                    token.as_str()
                )));
            }
            token => {
                return Err(lexer.error(format!("unexpected {}", token.as_str())));
            }
        }
    }
    Ok(file)
}

fn expect_token(lexer: &mut Lexer, expected: Token) -> Result<(), ParseException> {
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

fn parse_build(lexer: &mut Lexer) -> Result<DyndepEntry, ParseException> {
    let mut entry = DyndepEntry::default();

    entry.output = lexer
        .read_path()?
        .ok_or_else(|| lexer.error("expected path"))?
        .evaluate(&NullEnv);
    if lexer.read_path()?.is_some() {
        return Err(lexer.error("dyndep 'build' statements take a single output"));
    }

    if lexer.peek_token(Token::Pipe)? {
        while let Some(path) = lexer.read_path()? {
            entry.implicit_outputs.push(path.evaluate(&NullEnv));
        }
    }

    expect_token(lexer, Token::Colon)?;
    let rule = lexer
        .read_ident()
        .ok_or_else(|| lexer.error("expected build command name"))?;
    if rule != "dyndep" {
        return Err(lexer.error(format!(
            "expected build command name 'dyndep', got '{}'",
            rule
        )));
    }

    if lexer.read_path()?.is_some() {
        return Err(lexer.error("dyndep 'build' statements take no explicit inputs"));
    }
    if lexer.peek_token(Token::Pipe)? {
        while let Some(path) = lexer.read_path()? {
            entry.implicit_inputs.push(path.evaluate(&NullEnv));
        }
    }
    if lexer.peek_token(Token::Pipe2)? || lexer.peek_token(Token::PipeAt)? {
        return Err(
            lexer.error("dyndep 'build' statements take only implicit inputs")
        );
    }

    let end = lexer.read_token()?;
    if end != Token::Newline && end != Token::Eof {
        return Err(lexer.error(format!("expected newline, got {}", end.as_str())));
    }

    while lexer.peek_token(Token::Indent)? {
        let key = lexer
            .read_ident()
            .ok_or_else(|| lexer.error("expected variable name"))?;
        if key != "restat" {
            return Err(lexer.error(format!("unexpected variable '{}'", key)));
        }
        expect_token(lexer, Token::Equals)?;
        let value = lexer.read_var_value()?.evaluate(&NullEnv);
        entry.restat = !value.is_empty();
    }

    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal() {
        let f = parse_dyndep("dd", "ninja_dyndep_version = 1\nbuild out: dyndep\n").unwrap();
        assert_eq!(f.entries.len(), 1);
        assert_eq!(f.entries[0].output, "out");
        assert!(!f.entries[0].restat);
    }

    #[test]
    fn test_implicit_ins_and_outs() {
        let f = parse_dyndep(
            "dd",
            "ninja_dyndep_version = 1\nbuild out | extra.out: dyndep | dep1 dep2\n  restat = 1\n",
        )
        .unwrap();
        let e = &f.entries[0];
        assert_eq!(e.implicit_outputs, vec!["extra.out"]);
        assert_eq!(e.implicit_inputs, vec!["dep1", "dep2"]);
        assert!(e.restat);
    }

    #[test]
    fn test_multiple_entries() {
        let f = parse_dyndep(
            "dd",
            "ninja_dyndep_version = 1\nbuild a: dyndep\nbuild b: dyndep | x\n",
        )
        .unwrap();
        assert_eq!(f.entries.len(), 2);
        assert_eq!(f.entries[1].implicit_inputs, vec!["x"]);
    }

    #[test]
    fn test_version_required_first() {
        let err = parse_dyndep("dd", "build out: dyndep\n").unwrap_err();
        assert!(err.message.contains("ninja_dyndep_version"));
    }

    #[test]
    fn test_unsupported_version() {
        let err = parse_dyndep("dd", "ninja_dyndep_version = 2\n").unwrap_err();
        assert!(err.message.contains("unsupported"));
    }

    #[test]
    fn test_wrong_rule_name() {
        let err = parse_dyndep(
            "dd",
            "ninja_dyndep_version = 1\nbuild out: phony\n",
        )
        .unwrap_err();
        assert!(err.message.contains("'dyndep'"));
    }

    #[test]
    fn test_multiple_outputs_rejected() {
        let err = parse_dyndep(
            "dd",
            "ninja_dyndep_version = 1\nbuild a b: dyndep\n",
        )
        .unwrap_err();
        assert!(err.message.contains("single output"));
    }

    #[test]
    fn test_explicit_inputs_rejected() {
        let err = parse_dyndep(
            "dd",
            "ninja_dyndep_version = 1\nbuild a: dyndep b\n",
        )
        .unwrap_err();
        assert!(err.message.contains("no explicit inputs"));
    }
}
