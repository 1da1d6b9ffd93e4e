//! Lexer for Build Manifests
//!
//! The lexer tokenizes manifest text into a stream of structural tokens
//! the parser consumes. It handles:
//! - Keywords and identifiers
//! - Paths and binding values with `$`-escapes
//! - Significant leading whitespace (binding-block continuation)
//! - Comments
//!
//! Paths and values are not plain strings: they lex into `EvalString`
//! templates whose variables expand later against a scope chain.

use std::collections::HashMap;

use crate::eval::EvalString;
use crate::parser::types::ParseException;

/// Token types for the manifest lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    Eof,
    Newline,
    Indent,
    Equals,  // =
    Colon,   // :
    Pipe,    // |
    Pipe2,   // ||
    PipeAt,  // |@

    // Keywords
    Build,
    Default,
    Include,
    Pool,
    Rule,
    Subninja,

    // A non-keyword identifier; the lexer rewinds so read_ident() can
    // pick up the text.
    Ident,
}

impl Token {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eof => "eof",
            Self::Newline => "newline",
            Self::Indent => "indent",
            Self::Equals => "'='",
            Self::Colon => "':'",
            Self::Pipe => "'|'",
            Self::Pipe2 => "'||'",
            Self::PipeAt => "'|@'",
            Self::Build => "'build'",
            Self::Default => "'default'",
            Self::Include => "'include'",
            Self::Pool => "'pool'",
            Self::Rule => "'rule'",
            Self::Subninja => "'subninja'",
            Self::Ident => "identifier",
        }
    }
}

lazy_static::lazy_static! {
    static ref KEYWORDS: HashMap<&'static str, Token> = {
        let mut m = HashMap::new();
        m.insert("build", Token::Build);
        m.insert("default", Token::Default);
        m.insert("include", Token::Include);
        m.insert("pool", Token::Pool);
        m.insert("rule", Token::Rule);
        m.insert("subninja", Token::Subninja);
        m
    };
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'-'
}

fn is_simple_var_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'-'
}

pub struct Lexer<'a> {
    filename: String,
    input: &'a [u8],
    ofs: usize,
    /// Start offset of the most recently read token, for errors.
    last_token: usize,
    at_bol: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(filename: impl Into<String>, input: &'a str) -> Self {
        Self {
            filename: filename.into(),
            input: input.as_bytes(),
            ofs: 0,
            last_token: 0,
            at_bol: true,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.ofs).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.ofs + offset).copied()
    }

    /// Build an error pointing at the most recent token.
    pub fn error(&self, message: impl Into<String>) -> ParseException {
        self.error_at(self.last_token, message)
    }

    fn error_at(&self, ofs: usize, message: impl Into<String>) -> ParseException {
        let mut line = 1;
        let mut line_start = 0;
        for (i, &b) in self.input.iter().enumerate().take(ofs) {
            if b == b'\n' {
                line += 1;
                line_start = i + 1;
            }
        }
        let line_end = self.input[line_start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| line_start + p)
            .unwrap_or(self.input.len());
        let context = String::from_utf8_lossy(&self.input[line_start..line_end])
            .trim_end_matches('\r')
            .to_string();
        ParseException::new(&self.filename, line, ofs - line_start + 1, message)
            .with_context(context)
    }

    /// Consume '\n' or '\r\n' at the current offset.
    fn consume_newline(&mut self) -> Result<(), ParseException> {
        match self.peek() {
            Some(b'\n') => {
                self.ofs += 1;
            }
            Some(b'\r') if self.peek_at(1) == Some(b'\n') => {
                self.ofs += 2;
            }
            Some(b'\r') => {
                return Err(self.error_at(self.ofs, "carriage return without newline"));
            }
            _ => {}
        }
        self.at_bol = true;
        Ok(())
    }

    /// Skip the rest of the line, including its newline.
    fn skip_comment(&mut self) -> Result<(), ParseException> {
        while let Some(c) = self.peek() {
            if c == b'\n' || c == b'\r' {
                break;
            }
            self.ofs += 1;
        }
        self.consume_newline()
    }

    pub fn read_token(&mut self) -> Result<Token, ParseException> {
        loop {
            self.last_token = self.ofs;

            if self.at_bol {
                let start = self.ofs;
                while self.peek() == Some(b' ') {
                    self.ofs += 1;
                }
                match self.peek() {
                    // Comment lines disappear entirely, indent and all.
                    Some(b'#') => {
                        self.skip_comment()?;
                        continue;
                    }
                    Some(b'\n') | Some(b'\r') => {
                        self.consume_newline()?;
                        continue;
                    }
                    None => return Ok(Token::Eof),
                    _ => {
                        self.at_bol = false;
                        if self.ofs > start {
                            return Ok(Token::Indent);
                        }
                    }
                }
                continue;
            }

            let c = match self.peek() {
                None => return Ok(Token::Eof),
                Some(c) => c,
            };
            match c {
                b'\n' | b'\r' => {
                    self.consume_newline()?;
                    return Ok(Token::Newline);
                }
                b' ' => {
                    self.ofs += 1;
                }
                b'=' => {
                    self.ofs += 1;
                    return Ok(Token::Equals);
                }
                b':' => {
                    self.ofs += 1;
                    return Ok(Token::Colon);
                }
                b'|' => {
                    self.ofs += 1;
                    return Ok(match self.peek() {
                        Some(b'|') => {
                            self.ofs += 1;
                            Token::Pipe2
                        }
                        Some(b'@') => {
                            self.ofs += 1;
                            Token::PipeAt
                        }
                        _ => Token::Pipe,
                    });
                }
                c if is_ident_char(c) => {
                    let start = self.ofs;
                    while self.peek().map_or(false, is_ident_char) {
                        self.ofs += 1;
                    }
                    let ident = &self.input[start..self.ofs];
                    if let Some(&keyword) = KEYWORDS.get(
                        std::str::from_utf8(ident).map_err(|_| {
                            self.error_at(start, "invalid utf-8 in identifier")
                        })?,
                    ) {
                        return Ok(keyword);
                    }
                    // Rewind so read_ident() picks up the text.
                    self.ofs = start;
                    return Ok(Token::Ident);
                }
                c => {
                    return Err(self.error_at(
                        self.ofs,
                        format!("unexpected character '{}'", c as char),
                    ));
                }
            }
        }
    }

    /// Read the given token if it is next; otherwise leave the input
    /// untouched.
    pub fn peek_token(&mut self, expected: Token) -> Result<bool, ParseException> {
        let saved = (self.ofs, self.last_token, self.at_bol);
        let token = self.read_token()?;
        if token == expected {
            return Ok(true);
        }
        (self.ofs, self.last_token, self.at_bol) = saved;
        Ok(false)
    }

    /// Read an identifier (variable or rule name), or None.
    pub fn read_ident(&mut self) -> Option<String> {
        while self.peek() == Some(b' ') {
            self.ofs += 1;
        }
        let start = self.ofs;
        while self.peek().map_or(false, is_ident_char) {
            self.ofs += 1;
        }
        if start == self.ofs {
            return None;
        }
        self.last_token = start;
        Some(String::from_utf8_lossy(&self.input[start..self.ofs]).into_owned())
    }

    /// Read a path. Stops, without consuming, at space, `:`, `|`, or
    /// newline. Returns None when no path is present.
    pub fn read_path(&mut self) -> Result<Option<EvalString>, ParseException> {
        while self.peek() == Some(b' ') {
            self.ofs += 1;
        }
        self.last_token = self.ofs;
        let eval = self.read_eval_string(true)?;
        if eval.is_empty() {
            Ok(None)
        } else {
            Ok(Some(eval))
        }
    }

    /// Read a binding value: everything to end of line, with `$`-escapes
    /// processed. Consumes the trailing newline.
    pub fn read_var_value(&mut self) -> Result<EvalString, ParseException> {
        while self.peek() == Some(b' ') {
            self.ofs += 1;
        }
        self.last_token = self.ofs;
        let eval = self.read_eval_string(false)?;
        self.consume_newline()?;
        Ok(eval)
    }

    fn read_eval_string(&mut self, path: bool) -> Result<EvalString, ParseException> {
        let mut eval = EvalString::new();
        loop {
            let c = match self.peek() {
                None => break,
                Some(c) => c,
            };
            match c {
                b'\n' => break,
                b'\r' if self.peek_at(1) == Some(b'\n') => break,
                b' ' | b':' | b'|' if path => break,
                b'$' => {
                    self.ofs += 1;
                    match self.peek() {
                        Some(b' ') => {
                            eval.push_char(' ');
                            self.ofs += 1;
                        }
                        Some(b':') => {
                            eval.push_char(':');
                            self.ofs += 1;
                        }
                        Some(b'$') => {
                            eval.push_char('$');
                            self.ofs += 1;
                        }
                        Some(b'\n') => {
                            // Line continuation: swallow the newline and
                            // the next line's leading indent.
                            self.ofs += 1;
                            while self.peek() == Some(b' ') {
                                self.ofs += 1;
                            }
                        }
                        Some(b'\r') if self.peek_at(1) == Some(b'\n') => {
                            self.ofs += 2;
                            while self.peek() == Some(b' ') {
                                self.ofs += 1;
                            }
                        }
                        Some(b'{') => {
                            self.ofs += 1;
                            let start = self.ofs;
                            while self.peek().map_or(false, is_ident_char) {
                                self.ofs += 1;
                            }
                            if start == self.ofs {
                                return Err(
                                    self.error_at(start, "expected variable after '${'")
                                );
                            }
                            if self.peek() != Some(b'}') {
                                return Err(self.error_at(self.ofs, "expected '}'"));
                            }
                            let name =
                                String::from_utf8_lossy(&self.input[start..self.ofs])
                                    .into_owned();
                            self.ofs += 1;
                            eval.push_variable(&name);
                        }
                        Some(c) if is_simple_var_char(c) => {
                            let start = self.ofs;
                            while self.peek().map_or(false, is_simple_var_char) {
                                self.ofs += 1;
                            }
                            let name =
                                String::from_utf8_lossy(&self.input[start..self.ofs])
                                    .into_owned();
                            eval.push_variable(&name);
                        }
                        None => {
                            return Err(self.error_at(
                                self.ofs - 1,
                                "unterminated $-escape at end of input",
                            ));
                        }
                        Some(_) => {
                            return Err(self.error_at(
                                self.ofs - 1,
                                "bad $-escape (literal $ must be written as $$)",
                            ));
                        }
                    }
                }
                c if c < 0x80 => {
                    eval.push_char(c as char);
                    self.ofs += 1;
                }
                c => {
                    // Multi-byte sequence: paths are opaque bytes, keep
                    // it intact.
                    let len = match c {
                        b if b >= 0xF0 => 4,
                        b if b >= 0xE0 => 3,
                        _ => 2,
                    };
                    let end = (self.ofs + len).min(self.input.len());
                    let text = String::from_utf8_lossy(&self.input[self.ofs..end]);
                    eval.push_literal(&text);
                    self.ofs = end;
                }
            }
        }
        Ok(eval)
    }
}
