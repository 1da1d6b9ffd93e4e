//! Path Canonicalization
//!
//! Node paths are byte-identity keys into the graph, so every path read
//! from a manifest, depfile, or dyndep file is canonicalized first:
//! `./` components collapse, `..` components fold into their parent, and
//! duplicate separators disappear. Case is preserved verbatim.
//!
//! Canonicalization also computes a 64-bit slash-bit mask recording which
//! of the first 64 separators were written as backslashes, so the deps
//! log can re-derive the original spelling on platforms that accept both
//! separators. On POSIX, backslash is an ordinary path byte and the mask
//! is always zero.

#[cfg(windows)]
fn is_sep(c: char) -> bool {
    c == '/' || c == '\\'
}

#[cfg(not(windows))]
fn is_sep(c: char) -> bool {
    c == '/'
}

/// Canonicalize a path, returning the normalized string and its slash bits.
pub fn canonicalize_path(path: &str) -> (String, u64) {
    let rooted = path.chars().next().map_or(false, is_sep);
    let mut components: Vec<&str> = Vec::new();
    let mut slash_bits: u64 = 0;
    let mut sep_index: u32 = 0;

    let mut start = 0;
    let bytes = path.as_bytes();
    let mut i = 0;
    while i <= bytes.len() {
        let at_sep = i == bytes.len() || is_sep(bytes[i] as char);
        if at_sep {
            let comp = &path[start..i];
            match comp {
                "" | "." => {}
                ".." => {
                    if components.last().map_or(false, |c| *c != "..") {
                        components.pop();
                    } else if !rooted {
                        components.push("..");
                    }
                    // Rooted paths cannot climb above the root.
                }
                _ => {
                    if i < bytes.len() && bytes[i] == b'\\' && sep_index < 64 {
                        slash_bits |= 1 << sep_index;
                    }
                    components.push(comp);
                }
            }
            if i < bytes.len() {
                sep_index += 1;
            }
            start = i + 1;
        }
        i += 1;
    }

    let mut result = String::with_capacity(path.len());
    if rooted {
        result.push('/');
    }
    result.push_str(&components.join("/"));
    if result.is_empty() {
        result.push('.');
    }
    (result, slash_bits)
}

/// Canonicalize a path, discarding the slash bits.
pub fn canon_path(path: &str) -> String {
    canonicalize_path(path).0
}
