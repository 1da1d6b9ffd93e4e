//! Depfile Parser
//!
//! Parses the Makefile subset compilers emit with `-MD`-style flags:
//! one or more targets, `:`, prerequisites, `\`-newline continuation,
//! `\ ` for spaces in paths, `$$` for a literal dollar. Variable
//! assignments, pattern rules, and recipes never appear in these files
//! and are not handled.
//!
//! `-MP` output adds dummy rules (a header as a target with no
//! prerequisites); their targets are ignored.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DepfileError {
    #[error("expected ':' in depfile")]
    ExpectedColon,

    #[error("expected target before ':' in depfile")]
    ExpectedTarget,

    #[error("unterminated escape at end of depfile")]
    UnterminatedEscape,
}

/// Parsed depfile contents: the first rule's targets and every rule's
/// prerequisites.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Depfile {
    pub outs: Vec<String>,
    pub ins: Vec<String>,
}

pub fn parse_depfile(content: &str) -> Result<Depfile, DepfileError> {
    let mut depfile = Depfile::default();
    let bytes = content.as_bytes();

    let mut word = String::new();
    let mut targets: Vec<String> = Vec::new();
    let mut seen_colon = false;
    let mut first_rule_done = false;

    fn flush(
        word: &mut String,
        seen_colon: bool,
        targets: &mut Vec<String>,
        ins: &mut Vec<String>,
    ) {
        if word.is_empty() {
            return;
        }
        let w = std::mem::take(word);
        if seen_colon {
            if !ins.contains(&w) {
                ins.push(w);
            }
        } else {
            targets.push(w);
        }
    }

    let mut end_rule = |targets: &mut Vec<String>,
                        seen_colon: &mut bool,
                        first_rule_done: &mut bool,
                        depfile: &mut Depfile|
     -> Result<(), DepfileError> {
        if targets.is_empty() && !*seen_colon {
            return Ok(());
        }
        if !*seen_colon {
            return Err(DepfileError::ExpectedColon);
        }
        if targets.is_empty() {
            return Err(DepfileError::ExpectedTarget);
        }
        if !*first_rule_done {
            depfile.outs.append(targets);
            *first_rule_done = true;
        } else {
            targets.clear();
        }
        *seen_colon = false;
        Ok(())
    };

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' => {
                flush(&mut word, seen_colon, &mut targets, &mut depfile.ins);
                i += 1;
            }
            b'\r' => {
                i += 1;
            }
            b'\n' => {
                flush(&mut word, seen_colon, &mut targets, &mut depfile.ins);
                end_rule(
                    &mut targets,
                    &mut seen_colon,
                    &mut first_rule_done,
                    &mut depfile,
                )?;
                i += 1;
            }
            b'\\' => match bytes.get(i + 1) {
                // Escaped newline: a word break that continues the rule.
                Some(b'\n') => {
                    flush(&mut word, seen_colon, &mut targets, &mut depfile.ins);
                    i += 2;
                }
                Some(b'\r') if bytes.get(i + 2) == Some(&b'\n') => {
                    flush(&mut word, seen_colon, &mut targets, &mut depfile.ins);
                    i += 3;
                }
                Some(b' ') => {
                    word.push(' ');
                    i += 2;
                }
                Some(b'#') => {
                    word.push('#');
                    i += 2;
                }
                Some(b'\\') => {
                    word.push('\\');
                    i += 2;
                }
                Some(&c) => {
                    // Make keeps unrecognized escapes verbatim.
                    word.push('\\');
                    word.push(c as char);
                    i += 2;
                }
                None => return Err(DepfileError::UnterminatedEscape),
            },
            b'$' => {
                if bytes.get(i + 1) == Some(&b'$') {
                    word.push('$');
                    i += 2;
                } else {
                    word.push('$');
                    i += 1;
                }
            }
            b':' if !seen_colon => {
                flush(&mut word, seen_colon, &mut targets, &mut depfile.ins);
                seen_colon = true;
                i += 1;
            }
            c => {
                // Paths are opaque bytes; pass non-ascii through intact.
                let ch_len = utf8_len(c);
                word.push_str(&content[i..i + ch_len]);
                i += ch_len;
            }
        }
    }

    flush(&mut word, seen_colon, &mut targets, &mut depfile.ins);
    end_rule(
        &mut targets,
        &mut seen_colon,
        &mut first_rule_done,
        &mut depfile,
    )?;
    Ok(depfile)
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic() {
        let d = parse_depfile("out.o: a.h b.h\n").unwrap();
        assert_eq!(d.outs, vec!["out.o"]);
        assert_eq!(d.ins, vec!["a.h", "b.h"]);
    }

    #[test]
    fn test_no_trailing_newline() {
        let d = parse_depfile("out.o: a.h").unwrap();
        assert_eq!(d.outs, vec!["out.o"]);
        assert_eq!(d.ins, vec!["a.h"]);
    }

    #[test]
    fn test_continuation() {
        let d = parse_depfile("out.o: a.h \\\n  b.h \\\n  c.h\n").unwrap();
        assert_eq!(d.ins, vec!["a.h", "b.h", "c.h"]);
    }

    #[test]
    fn test_crlf_continuation() {
        let d = parse_depfile("out.o: a.h \\\r\n  b.h\r\n").unwrap();
        assert_eq!(d.ins, vec!["a.h", "b.h"]);
    }

    #[test]
    fn test_escaped_space_in_path() {
        let d = parse_depfile("out.o: a\\ b.h c.h\n").unwrap();
        assert_eq!(d.ins, vec!["a b.h", "c.h"]);
    }

    #[test]
    fn test_dollar_escape() {
        let d = parse_depfile("out.o: a$$b.h\n").unwrap();
        assert_eq!(d.ins, vec!["a$b.h"]);
    }

    #[test]
    fn test_multiple_targets() {
        let d = parse_depfile("a.o b.o: x.h\n").unwrap();
        assert_eq!(d.outs, vec!["a.o", "b.o"]);
        assert_eq!(d.ins, vec!["x.h"]);
    }

    #[test]
    fn test_dummy_rules_ignored() {
        // gcc -MP emits empty rules so make tolerates deleted headers.
        let d = parse_depfile("out.o: a.h b.h\n\na.h:\n\nb.h:\n").unwrap();
        assert_eq!(d.outs, vec!["out.o"]);
        assert_eq!(d.ins, vec!["a.h", "b.h"]);
    }

    #[test]
    fn test_duplicate_prerequisites_collapse() {
        let d = parse_depfile("out.o: a.h a.h b.h\n").unwrap();
        assert_eq!(d.ins, vec!["a.h", "b.h"]);
    }

    #[test]
    fn test_colon_in_prerequisite_kept() {
        let d = parse_depfile("out.o: a:b.h\n").unwrap();
        assert_eq!(d.ins, vec!["a:b.h"]);
    }

    #[test]
    fn test_empty_file() {
        let d = parse_depfile("").unwrap();
        assert!(d.outs.is_empty());
        assert!(d.ins.is_empty());
    }

    #[test]
    fn test_error_missing_colon() {
        assert_eq!(
            parse_depfile("just some words\n"),
            Err(DepfileError::ExpectedColon)
        );
    }

    #[test]
    fn test_error_missing_target() {
        assert_eq!(parse_depfile(": a.h\n"), Err(DepfileError::ExpectedTarget));
    }

    #[test]
    fn test_error_unterminated_escape() {
        assert_eq!(
            parse_depfile("out.o: a.h\\"),
            Err(DepfileError::UnterminatedEscape)
        );
    }
}
