//! Status Printer
//!
//! Progress reporting for the build driver. On a smart terminal the
//! current edge's description overwrites a single status line; long
//! lines are elided in the middle. Each finished edge's captured output
//! is printed exactly once, in completion order.
//!
//! The progress prefix is formatted from `NINJA_STATUS` (default
//! `[%f/%t] `): %s started, %f finished, %t total, %r running,
//! %p percent, %e elapsed seconds, %% a percent sign.

use std::io::Write;
use std::time::Instant;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

pub struct StatusPrinter {
    verbosity: Verbosity,
    progress_format: String,
    smart_terminal: bool,
    keep_color_codes: bool,
    terminal_width: usize,
    total_edges: usize,
    started_edges: usize,
    finished_edges: usize,
    running_edges: usize,
    start_time: Instant,
    /// True when the last thing printed was an in-place status line.
    line_dirty: bool,
}

impl StatusPrinter {
    pub fn new(verbosity: Verbosity) -> Self {
        let smart_terminal = unsafe { libc::isatty(1) == 1 }
            && std::env::var("TERM").map_or(false, |t| t != "dumb");
        let keep_color_codes =
            smart_terminal || std::env::var("CLICOLOR_FORCE").map_or(false, |v| v != "0");
        let progress_format =
            std::env::var("NINJA_STATUS").unwrap_or_else(|_| "[%f/%t] ".to_string());
        Self {
            verbosity,
            progress_format,
            smart_terminal,
            keep_color_codes,
            terminal_width: terminal_width(),
            total_edges: 0,
            started_edges: 0,
            finished_edges: 0,
            running_edges: 0,
            start_time: Instant::now(),
            line_dirty: false,
        }
    }

    /// A non-terminal printer with a fixed format, for tests.
    pub fn for_tests() -> Self {
        Self {
            verbosity: Verbosity::Quiet,
            progress_format: "[%f/%t] ".to_string(),
            smart_terminal: false,
            keep_color_codes: true,
            terminal_width: 80,
            total_edges: 0,
            started_edges: 0,
            finished_edges: 0,
            running_edges: 0,
            start_time: Instant::now(),
            line_dirty: false,
        }
    }

    pub fn plan_has_total_edges(&mut self, total: usize) {
        self.total_edges = total;
    }

    pub fn edge_started(&mut self, description: &str, command: &str) {
        self.started_edges += 1;
        self.running_edges += 1;
        if self.verbosity == Verbosity::Quiet {
            return;
        }
        let text = if self.verbosity == Verbosity::Verbose {
            command
        } else {
            description
        };
        self.print_status(text);
    }

    pub fn edge_finished(&mut self, description: &str, command: &str, success: bool, output: &str) {
        self.finished_edges += 1;
        self.running_edges = self.running_edges.saturating_sub(1);

        if !success {
            self.clear_line();
            println!("FAILED: {}", description);
            println!("{}", command);
        } else if self.verbosity != Verbosity::Quiet {
            self.print_status(description);
        }

        if !output.is_empty() {
            self.clear_line();
            let text = if self.keep_color_codes {
                output.to_string()
            } else {
                strip_ansi_escape_codes(output)
            };
            print!("{}", text);
            if !text.ends_with('\n') {
                println!();
            }
            let _ = std::io::stdout().flush();
        }
    }

    /// Finish the in-place status line before other output or exit.
    pub fn finish(&mut self) {
        if self.line_dirty {
            println!();
            self.line_dirty = false;
            let _ = std::io::stdout().flush();
        }
    }

    fn clear_line(&mut self) {
        if self.line_dirty {
            print!("\r\x1b[K");
            self.line_dirty = false;
        }
    }

    fn print_status(&mut self, text: &str) {
        let line = format!("{}{}", self.format_progress(), text);
        if self.smart_terminal {
            let elided = elide_middle(&line, self.terminal_width);
            print!("\r\x1b[K{}", elided);
            let _ = std::io::stdout().flush();
            self.line_dirty = true;
        } else {
            println!("{}", line);
        }
    }

    /// Expand the `NINJA_STATUS` format against the current counters.
    pub fn format_progress(&self) -> String {
        let mut out = String::new();
        let mut chars = self.progress_format.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('s') => out.push_str(&self.started_edges.to_string()),
                Some('f') => out.push_str(&self.finished_edges.to_string()),
                Some('t') => out.push_str(&self.total_edges.to_string()),
                Some('r') => out.push_str(&self.running_edges.to_string()),
                Some('p') => {
                    let percent = if self.total_edges == 0 {
                        100
                    } else {
                        self.finished_edges * 100 / self.total_edges
                    };
                    out.push_str(&format!("{:3}%", percent));
                }
                Some('e') => {
                    out.push_str(&format!("{:.3}", self.start_time.elapsed().as_secs_f64()));
                }
                Some('%') => out.push('%'),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        out
    }

    #[cfg(test)]
    fn set_counts(&mut self, started: usize, finished: usize, total: usize, running: usize) {
        self.started_edges = started;
        self.finished_edges = finished;
        self.total_edges = total;
        self.running_edges = running;
    }
}

/// Shorten a line to `width` by replacing its middle with `...`.
pub fn elide_middle(line: &str, width: usize) -> String {
    const MARGIN: usize = 3;
    if width <= MARGIN * 2 || line.len() <= width {
        return line.to_string();
    }
    let keep = width - MARGIN;
    let head = keep / 2;
    let tail = keep - head;
    // Avoid splitting multi-byte sequences.
    let head_end = floor_char_boundary(line, head);
    let tail_start = floor_char_boundary(line, line.len() - tail);
    format!("{}...{}", &line[..head_end], &line[tail_start..])
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Drop `ESC [ ... <letter>` sequences from captured output.
pub fn strip_ansi_escape_codes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        }
    }
    out
}

fn terminal_width() -> usize {
    let mut size: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(1, libc::TIOCGWINSZ, &mut size) };
    if rc == 0 && size.ws_col > 0 {
        size.ws_col as usize
    } else {
        80
    }
}
