//! Incremental reader for a session's conversation log.
//!
//! Keeps a byte cursor into the append-only log and, on each poll, reads
//! only the delta. Complete lines are decoded and turned into messages; an
//! unterminated trailing fragment that does not decode is treated as a write
//! still in progress, so the cursor stays in front of it and the next poll
//! re-reads it.
//!
//! Streaming agent turns are held back and replaced in place while new
//! versions with the same id arrive. A held turn is released when its
//! terminal version shows up, when an entry with a different id follows it,
//! or when the caller flushes after the log has gone quiet.

use std::collections::HashSet;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::{LogEntry, SemanticMessage, decode_line, messages_from_entry};

pub struct LogTailer {
    path: PathBuf,
    cursor: u64,
    held: Vec<LogEntry>,
    answered: HashSet<String>,
}

impl LogTailer {
    /// Create a tailer reading from the start of the log.
    pub fn new(path: &Path) -> Self {
        Self::with_cursor(path, 0)
    }

    /// Create a tailer starting at a byte offset.
    ///
    /// Offsets beyond EOF are clamped during polling.
    pub fn with_cursor(path: &Path, cursor: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            cursor,
            held: Vec::new(),
            answered: HashSet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the first unconsumed byte.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Whether a streaming agent turn is being held back.
    pub fn has_held(&self) -> bool {
        !self.held.is_empty()
    }

    /// Read the delta since the last poll and return newly resolved messages.
    pub fn poll(&mut self) -> Result<Vec<SemanticMessage>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to open conversation log: {}", self.path.display())
                });
            }
        };

        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if self.cursor > file_len {
            warn!(
                log = %self.path.display(),
                cursor = self.cursor,
                len = file_len,
                "conversation log shrank; clamping cursor"
            );
            self.cursor = file_len;
        }

        file.seek(SeekFrom::Start(self.cursor))
            .context("failed to seek in conversation log")?;
        let mut delta = Vec::new();
        file.read_to_end(&mut delta)
            .context("failed to read conversation log")?;
        if delta.is_empty() {
            return Ok(Vec::new());
        }

        let (consumed, messages) = self.ingest_bytes(&delta);
        self.cursor += consumed as u64;
        debug!(
            log = %self.path.display(),
            consumed,
            messages = messages.len(),
            "processed log delta"
        );
        Ok(messages)
    }

    /// Release every held streaming turn as-is.
    pub fn flush(&mut self) -> Vec<SemanticMessage> {
        let mut out = Vec::new();
        self.release_held(&mut out);
        out
    }

    /// Decode as many lines of `delta` as possible; returns bytes consumed.
    fn ingest_bytes(&mut self, delta: &[u8]) -> (usize, Vec<SemanticMessage>) {
        let mut out = Vec::new();
        let mut consumed = 0;

        while consumed < delta.len() {
            let rest = &delta[consumed..];
            let (line, terminated) = match rest.iter().position(|b| *b == b'\n') {
                Some(pos) => (&rest[..pos], true),
                None => (rest, false),
            };

            let text = String::from_utf8_lossy(line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                if terminated {
                    consumed += line.len() + 1;
                    continue;
                }
                break;
            }

            match decode_line(trimmed) {
                Ok(entry) => self.ingest(entry, &mut out),
                Err(_) if !terminated => break,
                Err(e) => warn!(
                    log = %self.path.display(),
                    offset = self.cursor + consumed as u64,
                    error = %e,
                    "skipping malformed log line"
                ),
            }
            consumed += line.len() + usize::from(terminated);
        }

        (consumed, out)
    }

    fn ingest(&mut self, entry: LogEntry, out: &mut Vec<SemanticMessage>) {
        self.answered
            .extend(entry.tool_result_ids().map(str::to_string));

        if entry.agent_turn().is_some() && !entry.id.is_empty() {
            if let Some(slot) = self.held.iter().position(|held| held.id == entry.id) {
                if entry.is_streaming() {
                    self.held[slot] = entry;
                } else {
                    self.held.remove(slot);
                    self.release_held(out);
                    out.extend(messages_from_entry(&entry, &self.answered));
                }
                return;
            }
            self.release_held(out);
            if entry.is_streaming() {
                self.held.push(entry);
            } else {
                out.extend(messages_from_entry(&entry, &self.answered));
            }
            return;
        }

        self.release_held(out);
        out.extend(messages_from_entry(&entry, &self.answered));
    }

    fn release_held(&mut self, out: &mut Vec<SemanticMessage>) {
        for entry in std::mem::take(&mut self.held) {
            out.extend(messages_from_entry(&entry, &self.answered));
        }
    }
}
