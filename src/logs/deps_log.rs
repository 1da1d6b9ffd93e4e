//! Deps Log
//!
//! Binary, little-endian store of header dependencies discovered while
//! running commands (from depfiles or /showIncludes output), so later
//! builds know them without re-running anything.
//!
//! Layout: the magic `# ninjadeps\n` and an int32 version, then
//! size-prefixed records. The size word's high bit distinguishes the
//! two kinds:
//! - path record: assigns the next compact id to a path; the payload is
//!   the path padded to 4 bytes plus an int32 checksum equal to `!id`,
//!   so a torn write is detectable.
//! - deps record: `out_id, mtime_lo, mtime_hi, in_id...`. A later
//!   record for the same output supersedes the earlier one.
//!
//! Deps records only ever reference previously assigned ids. Compaction
//! rewrites live entries with freshly numbered ids.

use std::io::Write;

use crate::fs::TimeStamp;
use crate::graph::{NodeId, State};

const MAGIC: &[u8] = b"# ninjadeps\n";
const VERSION: i32 = 4;

const DEPS_RECORD_FLAG: u32 = 0x8000_0000;
const MAX_RECORD_SIZE: u32 = (1 << 19) - 1;

const COMPACTION_RATIO: usize = 3;
const MIN_COMPACTION_ENTRIES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepsRecord {
    pub mtime: TimeStamp,
    pub deps: Vec<NodeId>,
}

/// Outcome of loading the log from disk.
#[derive(Debug, PartialEq, Eq)]
pub enum LoadStatus {
    NotFound,
    Loaded,
    Recovered(String),
}

enum Sink {
    None,
    File(std::fs::File),
    Memory(Vec<u8>),
}

impl Default for Sink {
    fn default() -> Self {
        Sink::None
    }
}

#[derive(Default)]
pub struct DepsLog {
    /// Node for each assigned id, in id order.
    nodes: Vec<NodeId>,
    /// Deps record per output id.
    deps: Vec<Option<DepsRecord>>,
    sink: Sink,
    total_records: usize,
    needs_recompaction: bool,
}

impl DepsLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded deps for an output node, if any.
    pub fn get_deps(&self, state: &State, node: NodeId) -> Option<&DepsRecord> {
        let id = state.node(node).deps_log_id;
        if id < 0 {
            return None;
        }
        self.deps.get(id as usize).and_then(|d| d.as_ref())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn needs_recompaction(&self) -> bool {
        self.needs_recompaction
    }

    /// Replay a deps log, assigning ids onto the state's nodes. A file
    /// with a bad magic or version is deleted and the build proceeds
    /// with no recorded deps. Trailing corruption truncates the file to
    /// the last good record.
    pub fn load(&mut self, path: &str, state: &mut State) -> std::io::Result<LoadStatus> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadStatus::NotFound)
            }
            Err(e) => return Err(e),
        };
        match self.parse(&data, state) {
            ParseResult::Ok => Ok(LoadStatus::Loaded),
            ParseResult::BadHeader => {
                std::fs::remove_file(path)?;
                Ok(LoadStatus::Recovered(format!(
                    "deps log {} is invalid; starting over",
                    path
                )))
            }
            ParseResult::Truncated(valid_len) => {
                let file = std::fs::OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len as u64)?;
                Ok(LoadStatus::Recovered(format!(
                    "deps log {} is corrupt; dropping trailing records",
                    path
                )))
            }
        }
    }

    /// Parse log bytes. Factored out of load() so tests can drive it
    /// with in-memory buffers.
    pub fn parse(&mut self, data: &[u8], state: &mut State) -> ParseResult {
        if data.len() < MAGIC.len() + 4 || &data[..MAGIC.len()] != MAGIC {
            return ParseResult::BadHeader;
        }
        let mut ofs = MAGIC.len();
        if read_i32(data, ofs) != Some(VERSION) {
            return ParseResult::BadHeader;
        }
        ofs += 4;

        let mut unique_deps = 0usize;
        while ofs < data.len() {
            let record_start = ofs;
            let header = match read_u32(data, ofs) {
                Some(h) => h,
                None => return ParseResult::Truncated(record_start),
            };
            let is_deps = header & DEPS_RECORD_FLAG != 0;
            let size = (header & !DEPS_RECORD_FLAG) as usize;
            if size as u32 > MAX_RECORD_SIZE || size % 4 != 0 {
                return ParseResult::Truncated(record_start);
            }
            if size < if is_deps { 12 } else { 4 } {
                return ParseResult::Truncated(record_start);
            }
            if ofs + 4 + size > data.len() {
                return ParseResult::Truncated(record_start);
            }
            let payload = &data[ofs + 4..ofs + 4 + size];

            if is_deps {
                let out_id = match read_i32(payload, 0) {
                    Some(id) if id >= 0 && (id as usize) < self.nodes.len() => id as usize,
                    _ => return ParseResult::Truncated(record_start),
                };
                let mtime_lo = read_u32(payload, 4).unwrap_or(0) as u64;
                let mtime_hi = read_u32(payload, 8).unwrap_or(0) as u64;
                let mtime = ((mtime_hi << 32) | mtime_lo) as i64;
                let mut deps = Vec::with_capacity((size - 12) / 4);
                let mut p = 12;
                let mut ok = true;
                while p < size {
                    match read_i32(payload, p) {
                        Some(id) if id >= 0 && (id as usize) < self.nodes.len() => {
                            deps.push(self.nodes[id as usize]);
                        }
                        _ => {
                            ok = false;
                            break;
                        }
                    }
                    p += 4;
                }
                if !ok {
                    return ParseResult::Truncated(record_start);
                }
                if self.deps[out_id].is_none() {
                    unique_deps += 1;
                }
                self.deps[out_id] = Some(DepsRecord { mtime, deps });
            } else {
                // Path record: path bytes padded to 4, then !id.
                let checksum = match read_u32(payload, size - 4) {
                    Some(c) => c,
                    None => return ParseResult::Truncated(record_start),
                };
                let id = self.nodes.len() as u32;
                if checksum != !id {
                    return ParseResult::Truncated(record_start);
                }
                let mut path_len = size - 4;
                while path_len > 0 && payload[path_len - 1] == 0 {
                    path_len -= 1;
                }
                let path = String::from_utf8_lossy(&payload[..path_len]).into_owned();
                let node = state.get_or_create_node(&path);
                if state.node(node).deps_log_id != -1 {
                    // A path recorded twice means the log is corrupt.
                    return ParseResult::Truncated(record_start);
                }
                state.node_mut(node).deps_log_id = id as i32;
                self.nodes.push(node);
                self.deps.push(None);
            }

            self.total_records += 1;
            ofs += 4 + size;
        }

        if self.total_records > MIN_COMPACTION_ENTRIES
            && self.total_records > unique_deps.max(1) * COMPACTION_RATIO
        {
            self.needs_recompaction = true;
        }
        ParseResult::Ok
    }

    pub fn open_for_write(&mut self, path: &str) -> std::io::Result<()> {
        let exists = std::fs::metadata(path).is_ok();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        if !exists {
            file.write_all(MAGIC)?;
            file.write_all(&VERSION.to_le_bytes())?;
            file.flush()?;
        }
        self.sink = Sink::File(file);
        Ok(())
    }

    /// Direct appends into a memory buffer; used by tests and
    /// compaction.
    pub fn open_memory(&mut self) {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        self.sink = Sink::Memory(buf);
    }

    pub fn take_memory(&mut self) -> Vec<u8> {
        match std::mem::take(&mut self.sink) {
            Sink::Memory(buf) => buf,
            _ => Vec::new(),
        }
    }

    pub fn close(&mut self) {
        self.sink = Sink::None;
    }

    /// Record deps for an output, assigning path ids as needed. Skips
    /// the write when the latest record already matches.
    pub fn record_deps(
        &mut self,
        state: &mut State,
        output: NodeId,
        mtime: TimeStamp,
        deps: &[NodeId],
    ) -> std::io::Result<()> {
        self.ensure_id(state, output)?;
        for &dep in deps {
            self.ensure_id(state, dep)?;
        }

        let out_id = state.node(output).deps_log_id as usize;
        if let Some(existing) = &self.deps[out_id] {
            if existing.mtime == mtime && existing.deps == deps {
                return Ok(());
            }
        }

        let mut payload = Vec::with_capacity(12 + deps.len() * 4);
        payload.extend_from_slice(&(out_id as i32).to_le_bytes());
        payload.extend_from_slice(&((mtime as u64 & 0xffff_ffff) as u32).to_le_bytes());
        payload.extend_from_slice(&(((mtime as u64) >> 32) as u32).to_le_bytes());
        for &dep in deps {
            payload.extend_from_slice(&state.node(dep).deps_log_id.to_le_bytes());
        }
        self.emit_record(&payload, true)?;

        self.deps[out_id] = Some(DepsRecord {
            mtime,
            deps: deps.to_vec(),
        });
        Ok(())
    }

    /// Assign the next compact id to a node, appending its path record.
    fn ensure_id(&mut self, state: &mut State, node: NodeId) -> std::io::Result<()> {
        if state.node(node).deps_log_id != -1 {
            return Ok(());
        }
        let id = self.nodes.len() as u32;
        let path = state.node(node).path.as_bytes().to_vec();
        let padding = (4 - path.len() % 4) % 4;

        let mut payload = Vec::with_capacity(path.len() + padding + 4);
        payload.extend_from_slice(&path);
        payload.extend(std::iter::repeat(0u8).take(padding));
        payload.extend_from_slice(&(!id).to_le_bytes());
        self.emit_record(&payload, false)?;

        state.node_mut(node).deps_log_id = id as i32;
        self.nodes.push(node);
        self.deps.push(None);
        Ok(())
    }

    fn emit_record(&mut self, payload: &[u8], is_deps: bool) -> std::io::Result<()> {
        let size = payload.len() as u32;
        if size > MAX_RECORD_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "deps log record too large",
            ));
        }
        let header = if is_deps { size | DEPS_RECORD_FLAG } else { size };
        self.total_records += 1;
        match &mut self.sink {
            Sink::None => Ok(()),
            Sink::File(file) => {
                file.write_all(&header.to_le_bytes())?;
                file.write_all(payload)?;
                file.flush()
            }
            Sink::Memory(buf) => {
                buf.extend_from_slice(&header.to_le_bytes());
                buf.extend_from_slice(payload);
                Ok(())
            }
        }
    }

    /// Rewrite the log keeping one record per live output, with compact
    /// fresh ids.
    pub fn recompact(
        &mut self,
        path: &str,
        state: &mut State,
        is_live: impl Fn(&State, NodeId) -> bool,
    ) -> std::io::Result<()> {
        let old_nodes = std::mem::take(&mut self.nodes);
        let old_deps = std::mem::take(&mut self.deps);
        self.total_records = 0;
        self.needs_recompaction = false;

        // Drop every id and reassign while re-recording live entries.
        for &node in &old_nodes {
            state.node_mut(node).deps_log_id = -1;
        }

        let temp = format!("{}.tmp", path);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp)?;
        self.sink = Sink::File(file);
        if let Sink::File(file) = &mut self.sink {
            file.write_all(MAGIC)?;
            file.write_all(&VERSION.to_le_bytes())?;
        }

        for (old_id, record) in old_deps.iter().enumerate() {
            let record = match record {
                Some(r) => r,
                None => continue,
            };
            let output = old_nodes[old_id];
            if !is_live(state, output) {
                continue;
            }
            self.record_deps(state, output, record.mtime, &record.deps)?;
        }

        self.sink = Sink::None;
        std::fs::rename(&temp, path)?;
        Ok(())
    }
}

/// Result of parsing log bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    Ok,
    BadHeader,
    /// Corrupt from this byte offset on; the file should be truncated
    /// to the returned length.
    Truncated(usize),
}

fn read_u32(data: &[u8], ofs: usize) -> Option<u32> {
    let bytes = data.get(ofs..ofs + 4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    Some(u32::from_le_bytes(buf))
}

fn read_i32(data: &[u8], ofs: usize) -> Option<i32> {
    read_u32(data, ofs).map(|v| v as i32)
}
