//! Append-only event journal.
//!
//! One UTF-8 JSON object per line, LF-terminated, one segment file per UTC
//! day. Records are never overwritten; the only mutation ever applied to a
//! segment is truncating a torn trailing record during recovery. The journal
//! is the single source of truth for "what happened"; the analytical store
//! and live caches are derived from it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use gantry_core::{EventRecord, RecordKind};
use thiserror::Error;
use tracing::{info, warn};

/// Result alias for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid journal root {0}: not a directory")]
    InvalidRoot(PathBuf),
}

/// Controls how aggressively appended records are forced to disk.
#[derive(Clone, Copy, Debug)]
pub struct FsyncPolicy {
    /// Sync when this much unsynced data has accumulated.
    pub max_unsynced_bytes: usize,
    /// Sync when the oldest unsynced byte is at least this old.
    pub max_unsynced_age: Duration,
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        Self {
            max_unsynced_bytes: 64 * 1024,
            max_unsynced_age: Duration::from_millis(100),
        }
    }
}

/// Append-only journal writer. Cheap to clone; all clones share one
/// per-file append lock, which is what serializes concurrent writers.
#[derive(Clone)]
pub struct Journal {
    inner: Arc<Mutex<Segment>>,
    root: PathBuf,
    policy: FsyncPolicy,
}

struct Segment {
    file: File,
    date: NaiveDate,
    unsynced_bytes: usize,
    oldest_unsynced: Option<Instant>,
}

impl Journal {
    /// Open (or create) the journal rooted at `root`.
    ///
    /// Recovery runs before the first append: a trailing record without its
    /// LF, or one that is not valid JSON, is truncated away.
    pub fn open(root: impl AsRef<Path>) -> JournalResult<Self> {
        Self::open_with_policy(root, FsyncPolicy::default())
    }

    pub fn open_with_policy(root: impl AsRef<Path>, policy: FsyncPolicy) -> JournalResult<Self> {
        let root = root.as_ref().to_path_buf();
        if root.exists() && !root.is_dir() {
            return Err(JournalError::InvalidRoot(root));
        }
        fs::create_dir_all(&root)?;

        let date = Utc::now().date_naive();
        let path = segment_path(&root, date);
        if path.exists() {
            let dropped = truncate_torn_tail(&path)?;
            if dropped > 0 {
                warn!(
                    path = %path.display(),
                    bytes = dropped,
                    "dropped torn trailing record during journal recovery"
                );
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "journal segment open");

        Ok(Self {
            inner: Arc::new(Mutex::new(Segment {
                file,
                date,
                unsynced_bytes: 0,
                oldest_unsynced: None,
            })),
            root,
            policy,
        })
    }

    /// Append a record, rotating to a fresh segment at the UTC day boundary.
    ///
    /// The line is written to the file before this call returns, which is
    /// what lets callers order journal writes ahead of cache updates;
    /// durability (fsync) is batched per the policy.
    pub fn append(&self, record: &EventRecord) -> JournalResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut segment = self.inner.lock().unwrap();
        let today = Utc::now().date_naive();
        if today != segment.date {
            let path = segment_path(&self.root, today);
            segment.file.sync_data()?;
            segment.file = OpenOptions::new().create(true).append(true).open(&path)?;
            segment.date = today;
            segment.unsynced_bytes = 0;
            segment.oldest_unsynced = None;
            info!(path = %path.display(), "journal rotated to new segment");
        }

        segment.file.write_all(line.as_bytes())?;
        segment.unsynced_bytes += line.len();
        if segment.oldest_unsynced.is_none() {
            segment.oldest_unsynced = Some(Instant::now());
        }

        let due_by_size = segment.unsynced_bytes >= self.policy.max_unsynced_bytes;
        let due_by_age = segment
            .oldest_unsynced
            .is_some_and(|t| t.elapsed() >= self.policy.max_unsynced_age);
        if due_by_size || due_by_age {
            segment.file.sync_data()?;
            segment.unsynced_bytes = 0;
            segment.oldest_unsynced = None;
        }
        Ok(())
    }

    /// Convenience: stamp and append a record of `kind`.
    pub fn record(&self, kind: RecordKind, data: serde_json::Value) -> JournalResult<()> {
        self.append(&EventRecord::now(kind, data))
    }

    /// Force any buffered bytes to disk. Called by the periodic flusher and
    /// on shutdown.
    pub fn flush(&self) -> JournalResult<()> {
        let mut segment = self.inner.lock().unwrap();
        if segment.unsynced_bytes > 0 {
            segment.file.sync_data()?;
            segment.unsynced_bytes = 0;
            segment.oldest_unsynced = None;
        }
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replay every record across all segments in append order.
    pub fn replay(&self) -> JournalResult<JournalReader> {
        JournalReader::open(&self.root)
    }
}

fn segment_path(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(format!("events-{date}.jsonl"))
}

/// Truncate a segment to its last valid LF boundary, returning dropped bytes.
fn truncate_torn_tail(path: &Path) -> JournalResult<u64> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }
    let mut buf = Vec::with_capacity(len as usize);
    file.read_to_end(&mut buf)?;

    let mut keep = buf.len();
    loop {
        // Drop anything after the final LF.
        let lf = match buf[..keep].iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos,
            None => {
                keep = 0;
                break;
            }
        };
        keep = lf + 1;
        // The final complete line must itself parse; a corrupt record is
        // treated exactly like a torn one.
        let line_start = buf[..lf].iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1);
        let line = &buf[line_start..lf];
        if serde_json::from_slice::<EventRecord>(line).is_ok() {
            break;
        }
        keep = line_start;
        if keep == 0 {
            break;
        }
    }

    let dropped = len - keep as u64;
    if dropped > 0 {
        file.set_len(keep as u64)?;
        file.seek(SeekFrom::End(0))?;
    }
    Ok(dropped)
}

/// Iterator over every record in a journal directory, in append order.
pub struct JournalReader {
    segments: std::vec::IntoIter<PathBuf>,
    current: Option<std::io::Lines<BufReader<File>>>,
}

impl JournalReader {
    /// Open a reader over all segments under `root`.
    pub fn open(root: impl AsRef<Path>) -> JournalResult<Self> {
        let pattern = root.as_ref().join("events-*.jsonl");
        let mut segments: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .ok()
            .into_iter()
            .flatten()
            .flatten()
            .collect();
        // Segment names embed the date, so lexical order is append order.
        segments.sort();
        Ok(Self {
            segments: segments.into_iter(),
            current: None,
        })
    }
}

impl Iterator for JournalReader {
    type Item = JournalResult<EventRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(lines) = self.current.as_mut() {
                for line in lines.by_ref() {
                    let line = match line {
                        Ok(line) => line,
                        Err(err) => return Some(Err(err.into())),
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<EventRecord>(&line) {
                        Ok(record) => return Some(Ok(record)),
                        Err(err) => {
                            // A torn tail in a non-live segment; recovery
                            // only rewrites the active one.
                            warn!(error = %err, "skipping unparseable journal line");
                            continue;
                        }
                    }
                }
                self.current = None;
            }
            let path = self.segments.next()?;
            match File::open(&path) {
                Ok(file) => self.current = Some(BufReader::new(file).lines()),
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn append_then_replay_preserves_order() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path()).unwrap();
        for i in 0..5 {
            journal
                .record(RecordKind::Metric, json!({ "i": i }))
                .unwrap();
        }
        journal.flush().unwrap();

        let values: Vec<i64> = journal
            .replay()
            .unwrap()
            .map(|r| r.unwrap().data["i"].as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn torn_tail_is_truncated_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let journal = Journal::open(dir.path()).unwrap();
            journal
                .record(RecordKind::OrderCreated, json!({ "order_id": "a" }))
                .unwrap();
            journal.flush().unwrap();
        }
        // Simulate a crash mid-append: valid record followed by a torn one.
        let path = segment_path(dir.path(), Utc::now().date_naive());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"ts\":\"2025-01-01T00:00:00Z\",\"kind\":\"FIL").unwrap();
        drop(file);

        let journal = Journal::open(dir.path()).unwrap();
        let records: Vec<_> = journal.replay().unwrap().map(Result::unwrap).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data["order_id"], "a");

        // The surviving bytes end exactly at the LF boundary.
        let bytes = fs::read(&path).unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');
    }

    #[test]
    fn corrupt_final_line_is_dropped_with_prior_records_intact() {
        let dir = tempdir().unwrap();
        {
            let journal = Journal::open(dir.path()).unwrap();
            journal.record(RecordKind::Halt, json!({ "n": 1 })).unwrap();
            journal.flush().unwrap();
        }
        let path = segment_path(dir.path(), Utc::now().date_naive());
        let before = fs::read(&path).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"not json at all\n").unwrap();
        drop(file);

        let _ = Journal::open(dir.path()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn appends_from_clones_interleave_without_loss() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path()).unwrap();
        let mut handles = Vec::new();
        for t in 0..4 {
            let journal = journal.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    journal
                        .record(RecordKind::Heartbeat, json!({ "t": t, "i": i }))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        journal.flush().unwrap();
        assert_eq!(journal.replay().unwrap().count(), 200);
    }
}
