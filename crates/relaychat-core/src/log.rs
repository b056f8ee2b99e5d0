//! Append-only message log and replay algorithm (spec §4.C).
//!
//! One file per node, path `<node_name>.json`, one JSON object per line.
//! Four line shapes: a bare upsert (the `Message` itself), an aggregate
//! `{"operation": "delete", "ids": [...]}`, an aggregate
//! `{"operation": "read", "ids": [...]}`, and a full-snapshot rewrite (the
//! file truncated, then one upsert line per message currently held).
//!
//! [`MessageLog::replay`] is the only place in this crate that
//! reconstructs insertion order from scratch: it returns messages in
//! **first-upsert order** with later deletes removing an entry and later
//! upserts updating a message in place without changing its position —
//! the same semantics a Python `dict` gives the original implementation
//! this was ported from. [`crate::store::Store`] relies on that order to
//! rebuild `inbox` buckets in arrival order (spec P3).

use crate::types::{Message, MessageId, Status};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur appending to or replaying the message log.
#[derive(Debug, Error)]
pub enum MessageLogError {
    /// Surfaces straight to the caller per spec §7 `StorageWriteError`:
    /// fatal to the request that triggered it, but not to the process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A malformed log line. Fatal at startup per spec §7
    /// `StorageReplayError` — the node refuses to start with an
    /// inconsistent on-disk log.
    #[error("malformed log line {line}: {source}")]
    Replay {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed log line {line}: unknown operation {op:?}")]
    UnknownOperation { line: usize, op: String },
}

/// An append-only per-node log of message mutations.
pub struct MessageLog {
    path: PathBuf,
}

impl MessageLog {
    /// Opens (lazily — the file is created on first write) the log at
    /// `path`. Conventionally `<node_name>.json` per spec §4.C.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a single upsert line for `msg`.
    pub fn append_upsert(&self, msg: &Message) -> Result<(), MessageLogError> {
        self.append_lines(std::iter::once(serde_json::to_string(msg)?))
    }

    /// Appends one aggregate delete line for `ids`. No-op (writes nothing)
    /// if `ids` is empty, per spec §4.E IncrementalSync ("an empty
    /// sub-list of any kind is skipped").
    pub fn append_delete(&self, ids: &[MessageId]) -> Result<(), MessageLogError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.append_operation("delete", ids)
    }

    /// Appends one aggregate read line for `ids`. No-op if `ids` is empty.
    pub fn append_read(&self, ids: &[MessageId]) -> Result<(), MessageLogError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.append_operation("read", ids)
    }

    fn append_operation(&self, operation: &str, ids: &[MessageId]) -> Result<(), MessageLogError> {
        let ids: Vec<&str> = ids.iter().map(MessageId::as_str).collect();
        let line = serde_json::to_string(&serde_json::json!({
            "operation": operation,
            "ids": ids,
        }))?;
        self.append_lines(std::iter::once(line))
    }

    fn append_lines(&self, lines: impl Iterator<Item = String>) -> Result<(), MessageLogError> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    /// Truncates the log and writes one upsert line per message in
    /// `messages`. Used for the full-snapshot rewrite (§4.C, §4.E
    /// FullSync, §4.I bootstrap step 6). `inbox` is never persisted — it
    /// is always reconstructible from `by_id` by [`Self::replay`].
    pub fn write_snapshot<'a>(
        &self,
        messages: impl Iterator<Item = &'a Message>,
    ) -> Result<(), MessageLogError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        for msg in messages {
            writeln!(file, "{}", serde_json::to_string(msg)?)?;
        }
        Ok(())
    }

    /// Replays the log into a flat list of messages in first-upsert order.
    /// A missing file yields an empty list (not an error). A malformed
    /// line is a fatal [`MessageLogError::Replay`] / `UnknownOperation`.
    pub fn replay(&self) -> Result<Vec<Message>, MessageLogError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<Message> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for (idx, line) in content.lines().enumerate() {
            let lineno = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let raw: serde_json::Value =
                serde_json::from_str(line).map_err(|source| MessageLogError::Replay { line: lineno, source })?;

            if let Some(op) = raw.get("operation").and_then(|v| v.as_str()) {
                let ids: Vec<String> = raw
                    .get("ids")
                    .cloned()
                    .map(serde_json::from_value::<Vec<String>>)
                    .transpose()
                    .map_err(|source| MessageLogError::Replay { line: lineno, source })?
                    .unwrap_or_default();

                match op {
                    "delete" => {
                        for id in ids {
                            if let Some(pos) = positions.remove(&id) {
                                entries.remove(pos);
                                for v in positions.values_mut() {
                                    if *v > pos {
                                        *v -= 1;
                                    }
                                }
                            }
                            // Missing ids are silently skipped (spec §4.C).
                        }
                    }
                    "read" => {
                        for id in ids {
                            if let Some(&pos) = positions.get(&id) {
                                entries[pos].status = Status::Read;
                            }
                            // Missing ids are silently skipped.
                        }
                    }
                    other => {
                        return Err(MessageLogError::UnknownOperation {
                            line: lineno,
                            op: other.to_string(),
                        });
                    }
                }
            } else {
                let msg: Message = serde_json::from_value(raw)
                    .map_err(|source| MessageLogError::Replay { line: lineno, source })?;
                match positions.get(msg.id.as_str()) {
                    Some(&pos) => entries[pos] = msg,
                    None => {
                        positions.insert(msg.id.as_str().to_string(), entries.len());
                        entries.push(msg);
                    }
                }
            }
        }

        Ok(entries)
    }
}

// `?` from `serde_json::to_string` needs a `From<serde_json::Error>` impl.
impl From<serde_json::Error> for MessageLogError {
    fn from(e: serde_json::Error) -> Self {
        MessageLogError::Replay { line: 0, source: e }
    }
}
