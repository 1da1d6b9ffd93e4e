//! Build Log
//!
//! Records, for every output ever built, the hash of the command that
//! produced it plus start/end times and the output mtime observed after
//! the command ran. The dirty scan compares these against the current
//! command and mtimes to decide what needs rebuilding.
//!
//! Format: a `# ninja log v6` header, then one tab-separated record per
//! line: `start end mtime command_hash path`. Appending is cheap;
//! replays keep only the latest record per output, and the file is
//! rewritten with live records once dead ones pile up.

use std::collections::HashMap;
use std::io::Write;

use crate::fs::TimeStamp;

const FILE_SIGNATURE: &str = "# ninja log v";
const VERSION: u32 = 6;

// Rewrite the file on close once dead records outnumber live ones by
// this ratio (and the file is big enough for it to matter).
const COMPACTION_RATIO: usize = 3;
const MIN_COMPACTION_ENTRIES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub output: String,
    pub command_hash: u64,
    pub start_time: i32,
    pub end_time: i32,
    pub mtime: TimeStamp,
}

/// Outcome of loading the log from disk.
#[derive(Debug, PartialEq, Eq)]
pub enum LoadStatus {
    NotFound,
    Loaded,
    /// Loaded, but the file needs rewriting (stale version or trailing
    /// corruption); carries a warning for the user.
    Recovered(String),
}

#[derive(Default)]
pub struct BuildLog {
    entries: HashMap<String, LogEntry>,
    file: Option<std::fs::File>,
    total_records: usize,
    needs_recompaction: bool,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, output: &str) -> Option<&LogEntry> {
        self.entries.get(output)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replay a log file into memory. Corruption truncates the replay
    /// at the last good record; a stale version discards the contents.
    pub fn load(&mut self, path: &str) -> std::io::Result<LoadStatus> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadStatus::NotFound)
            }
            Err(e) => return Err(e),
        };
        let text = String::from_utf8_lossy(&data);
        Ok(self.parse(&text, path))
    }

    /// Parse log text. Factored out of load() so tests can drive it
    /// with in-memory buffers.
    pub fn parse(&mut self, text: &str, path: &str) -> LoadStatus {
        let mut lines = text.split_inclusive('\n');

        match lines.next() {
            Some(header) => {
                let version = header
                    .strip_prefix(FILE_SIGNATURE)
                    .and_then(|v| v.trim().parse::<u32>().ok());
                if version != Some(VERSION) {
                    // A log from a different version is useless; start
                    // fresh and rewrite on close.
                    self.needs_recompaction = true;
                    return LoadStatus::Recovered(format!(
                        "build log {} version mismatch, starting over",
                        path
                    ));
                }
            }
            None => return LoadStatus::Recovered(format!("build log {} is empty", path)),
        }

        let mut truncated = false;
        for line in lines {
            if !line.ends_with('\n') {
                // Torn final record from a crashed build.
                truncated = true;
                break;
            }
            match parse_record(line.trim_end_matches(['\n', '\r'])) {
                Some(entry) => {
                    self.total_records += 1;
                    self.entries.insert(entry.output.clone(), entry);
                }
                None => {
                    truncated = true;
                    break;
                }
            }
        }

        if truncated {
            self.needs_recompaction = true;
            return LoadStatus::Recovered(format!(
                "build log {} is corrupt; dropping trailing records",
                path
            ));
        }
        if self.total_records > MIN_COMPACTION_ENTRIES
            && self.total_records > self.entries.len() * COMPACTION_RATIO
        {
            self.needs_recompaction = true;
        }
        LoadStatus::Loaded
    }

    /// Open (creating if needed) the log for appending.
    pub fn open_for_write(&mut self, path: &str) -> std::io::Result<()> {
        if self.needs_recompaction {
            self.recompact(path, |_| true)?;
        }
        let exists = std::fs::metadata(path).is_ok();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        if !exists {
            writeln!(file, "{}{}", FILE_SIGNATURE, VERSION)?;
            file.flush()?;
        }
        self.file = Some(file);
        Ok(())
    }

    /// Record a finished command. The in-memory map is updated even
    /// when no file is open (tests, dry runs).
    pub fn record(
        &mut self,
        output: &str,
        command_hash: u64,
        start_time: i32,
        end_time: i32,
        mtime: TimeStamp,
    ) -> std::io::Result<()> {
        let entry = LogEntry {
            output: output.to_string(),
            command_hash,
            start_time,
            end_time,
            mtime,
        };
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{}", format_record(&entry))?;
            file.flush()?;
        }
        self.total_records += 1;
        self.entries.insert(output.to_string(), entry);
        Ok(())
    }

    /// Rewrite the file keeping only live records for outputs the
    /// caller still knows about.
    pub fn recompact(
        &mut self,
        path: &str,
        is_live: impl Fn(&str) -> bool,
    ) -> std::io::Result<()> {
        self.file = None;
        self.entries.retain(|output, _| is_live(output));
        std::fs::write(path, self.serialize())?;
        self.total_records = self.entries.len();
        self.needs_recompaction = false;
        Ok(())
    }

    /// The full file contents for the current in-memory entries.
    pub fn serialize(&self) -> String {
        let mut out = format!("{}{}\n", FILE_SIGNATURE, VERSION);
        let mut entries: Vec<&LogEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.output.cmp(&b.output));
        for entry in entries {
            out.push_str(&format_record(entry));
            out.push('\n');
        }
        out
    }

    pub fn close(&mut self, path: &str) -> std::io::Result<()> {
        self.file = None;
        if self.needs_recompaction {
            self.recompact(path, |_| true)?;
        }
        Ok(())
    }
}

fn format_record(entry: &LogEntry) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}",
        entry.start_time, entry.end_time, entry.mtime, entry.command_hash, entry.output
    )
}

fn parse_record(line: &str) -> Option<LogEntry> {
    let mut fields = line.splitn(5, '\t');
    let start_time = fields.next()?.parse().ok()?;
    let end_time = fields.next()?.parse().ok()?;
    let mtime = fields.next()?.parse().ok()?;
    let command_hash = fields.next()?.parse().ok()?;
    let output = fields.next()?;
    if output.is_empty() {
        return None;
    }
    Some(LogEntry {
        output: output.to_string(),
        command_hash,
        start_time,
        end_time,
        mtime,
    })
}
