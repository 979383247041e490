//! Bounded in-memory history of a task's output and status notes
//!
//! Each supervised task owns one [`OutputBacklog`]. Capture tasks append the
//! child's stdout/stderr line by line, the supervisor loop appends status
//! notes, and API readers take copies. The backlog has its own lock so log
//! polling never waits on process control.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Default number of entries kept per task
pub const DEFAULT_BACKLOG_CAPACITY: usize = 1000;

/// Source of a backlog line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Line written by the child to stdout
    Stdout,
    /// Line written by the child to stderr
    Stderr,
    /// Lifecycle note written by the supervisor
    Status,
}

/// A single timestamped line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BacklogEntry {
    pub kind: EntryKind,
    pub text: String,
    /// Milliseconds since the Unix epoch
    pub timestamp_millis: i64,
}

impl BacklogEntry {
    pub fn new(kind: EntryKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Fixed-capacity ring of [`BacklogEntry`] values.
///
/// Cloning is cheap and yields another handle to the same ring.
#[derive(Debug, Clone)]
pub struct OutputBacklog {
    inner: Arc<RwLock<VecDeque<BacklogEntry>>>,
    capacity: usize,
}

impl OutputBacklog {
    /// Create an empty backlog. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, evicting the oldest one when full
    pub fn push(&self, entry: BacklogEntry) {
        let mut entries = self.inner.write();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Append a supervisor status note
    pub fn note(&self, text: impl Into<String>) {
        self.push(BacklogEntry::new(EntryKind::Status, text));
    }

    /// Copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<BacklogEntry> {
        self.inner.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

impl Default for OutputBacklog {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG_CAPACITY)
    }
}

/// Longest line kept as one entry; longer runs are split into several
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Read `reader` until EOF, appending one entry per line.
///
/// Partial writes are buffered until a newline arrives; a non-empty trailing
/// fragment without a newline is flushed as the last entry at EOF. A line
/// longer than [`MAX_LINE_BYTES`] is flushed in chunks of that size. Read
/// errors end the capture like EOF does.
pub async fn capture_lines<R>(reader: R, kind: EntryKind, backlog: OutputBacklog)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    // Set when the previous entry was a chunk cut at the size limit
    let mut split = false;

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                let complete = buf.last() == Some(&b'\n');
                if complete {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                // The newline ending a line that was already flushed in chunks
                if !(split && complete && buf.is_empty()) {
                    backlog.push(BacklogEntry::new(kind, String::from_utf8_lossy(&buf)));
                }
                split = !complete;
            }
            Err(e) => {
                tracing::debug!(?kind, error = %e, "Output capture ended with read error");
                break;
            }
        }
    }
}
