//! Per-process append-only log journal plus a bounded in-memory tail (§4.2).
//!
//! Every spawned process gets one file under
//! `<home>/logs/missions/<missionId>/<processId>.log` and a ring buffer of
//! its last 100 non-empty lines for fast catch-up on stream resume. Writes
//! never block on readers: the ring is an in-process `Vec`, not a channel.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

/// Ring buffer capacity per process (§4.2).
pub const RING_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum LogJournalError {
    #[error("failed to open log file at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write to log file for process {process_id}: {source}")]
    Write {
        process_id: String,
        #[source]
        source: std::io::Error,
    },
}

struct Stream {
    path: PathBuf,
    file: Option<File>,
    ring: Vec<String>,
    /// The not-yet-newline-terminated tail of the stream. Never stored in
    /// `ring` itself; `recent_lines` appends it as a transient last entry
    /// so a partial line is still visible without polluting the ring with
    /// a persistent empty marker on every terminated chunk.
    pending: String,
}

fn push_line(ring: &mut Vec<String>, line: String) {
    if line.is_empty() {
        return;
    }
    ring.push(line);
    if ring.len() > RING_CAPACITY {
        let excess = ring.len() - RING_CAPACITY;
        ring.drain(0..excess);
    }
}

/// Per-process append-only journal. Cheap to clone: internal state lives
/// behind an `Arc`-free `Mutex` owned by the single shared instance the
/// process root wires up (see `crate::root`).
pub struct LogJournal {
    home: PathBuf,
    streams: Mutex<HashMap<String, Stream>>,
}

impl LogJournal {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn log_path(&self, mission_id: &str, process_id: &str) -> PathBuf {
        self.home
            .join("logs")
            .join("missions")
            .join(mission_id)
            .join(format!("{process_id}.log"))
    }

    /// Create the log file (and parent directories) for a process and
    /// register its ring buffer. Returns the file path.
    pub fn open(&self, process_id: &str, mission_id: &str) -> Result<PathBuf, LogJournalError> {
        let path = self.log_path(mission_id, process_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LogJournalError::Open {
                path: path.clone(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LogJournalError::Open {
                path: path.clone(),
                source,
            })?;

        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.insert(
            process_id.to_string(),
            Stream {
                path: path.clone(),
                file: Some(file),
                ring: Vec::new(),
                pending: String::new(),
            },
        );
        Ok(path)
    }

    /// Append raw bytes to the process's log file and fold them into the
    /// ring buffer, splitting on `'\n'` (§4.2/§8 property 4).
    pub fn write(&self, process_id: &str, data: &str) -> Result<(), LogJournalError> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(stream) = streams.get_mut(process_id) else {
            return Ok(());
        };

        if let Some(file) = stream.file.as_mut() {
            file.write_all(data.as_bytes())
                .map_err(|source| LogJournalError::Write {
                    process_id: process_id.to_string(),
                    source,
                })?;
        }

        // `data` may complete the pending partial line, add zero or more
        // whole lines, and leave a new partial tail behind. Only completed
        // lines ever enter the ring; the tail lives in `pending` until a
        // later write terminates it.
        let mut segments = data.split('\n');
        let first = segments.next().unwrap_or("");
        stream.pending.push_str(first);

        let rest: Vec<&str> = segments.collect();
        if let Some((last, completed)) = rest.split_last() {
            push_line(&mut stream.ring, std::mem::take(&mut stream.pending));
            for part in completed {
                push_line(&mut stream.ring, part.to_string());
            }
            stream.pending = last.to_string();
        }

        Ok(())
    }

    /// Full file contents, or `None` if the process was never opened (or
    /// the file has since been removed from disk).
    pub fn read_all(&self, process_id: &str) -> Option<String> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let stream = streams.get(process_id)?;
        std::fs::read_to_string(&stream.path).ok()
    }

    /// Snapshot of the current ring buffer contents, plus the not-yet-
    /// terminated tail line (if any) as a transient last entry.
    pub fn recent_lines(&self, process_id: &str) -> Vec<String> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(stream) = streams.get(process_id) else {
            return Vec::new();
        };
        let mut lines = stream.ring.clone();
        if !stream.pending.is_empty() {
            lines.push(stream.pending.clone());
            if lines.len() > RING_CAPACITY {
                lines.remove(0);
            }
        }
        lines
    }

    /// Flush and close the file handle for one process; ring buffer stays
    /// addressable (callers may still want `recent_lines` after exit).
    pub fn close(&self, process_id: &str) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = streams.get_mut(process_id) {
            if let Some(mut file) = stream.file.take() {
                let _ = file.flush();
            }
        }
    }

    /// Close every open stream and drop all in-memory state (shutdown).
    pub fn cleanup(&self) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        for stream in streams.values_mut() {
            if let Some(mut file) = stream.file.take() {
                let _ = file.flush();
            }
        }
        streams.clear();
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_parent_dirs_and_empty_file() {
        let tmp = TempDir::new().unwrap();
        let journal = LogJournal::new(tmp.path());
        let path = journal.open("proc-1", "mis-1").unwrap();
        assert!(path.exists());
        assert_eq!(journal.read_all("proc-1").unwrap(), "");
    }

    #[test]
    fn write_appends_and_feeds_ring() {
        let tmp = TempDir::new().unwrap();
        let journal = LogJournal::new(tmp.path());
        journal.open("proc-1", "mis-1").unwrap();

        journal.write("proc-1", "hello\n").unwrap();
        journal.write("proc-1", "world\n").unwrap();

        assert_eq!(journal.read_all("proc-1").unwrap(), "hello\nworld\n");
        assert_eq!(journal.recent_lines("proc-1"), vec!["hello", "world"]);
    }

    #[test]
    fn write_without_trailing_newline_keeps_partial_line_out_of_ring() {
        let tmp = TempDir::new().unwrap();
        let journal = LogJournal::new(tmp.path());
        journal.open("proc-1", "mis-1").unwrap();

        journal.write("proc-1", "partial").unwrap();
        assert_eq!(journal.read_all("proc-1").unwrap(), "partial");
        // No newline yet: the ring only gets a line once it sees '\n'.
        assert_eq!(journal.recent_lines("proc-1"), vec!["partial"]);

        journal.write("proc-1", " done\n").unwrap();
        assert_eq!(journal.read_all("proc-1").unwrap(), "partial done\n");
    }

    #[test]
    fn ring_buffer_evicts_oldest_past_capacity() {
        let tmp = TempDir::new().unwrap();
        let journal = LogJournal::new(tmp.path());
        journal.open("proc-1", "mis-1").unwrap();

        for i in 0..(RING_CAPACITY + 10) {
            journal.write("proc-1", &format!("line-{i}\n")).unwrap();
        }

        let lines = journal.recent_lines("proc-1");
        assert_eq!(lines.len(), RING_CAPACITY);
        assert_eq!(lines[0], "line-10");
        assert_eq!(lines[lines.len() - 1], format!("line-{}", RING_CAPACITY + 9));
    }

    #[test]
    fn read_all_missing_process_is_none() {
        let tmp = TempDir::new().unwrap();
        let journal = LogJournal::new(tmp.path());
        assert!(journal.read_all("nonexistent").is_none());
    }

    #[test]
    fn close_flushes_but_keeps_ring_readable() {
        let tmp = TempDir::new().unwrap();
        let journal = LogJournal::new(tmp.path());
        journal.open("proc-1", "mis-1").unwrap();
        journal.write("proc-1", "line\n").unwrap();
        journal.close("proc-1");

        assert_eq!(journal.recent_lines("proc-1"), vec!["line"]);
    }

    #[test]
    fn cleanup_drops_all_state() {
        let tmp = TempDir::new().unwrap();
        let journal = LogJournal::new(tmp.path());
        journal.open("proc-1", "mis-1").unwrap();
        journal.write("proc-1", "line\n").unwrap();
        journal.cleanup();

        assert!(journal.recent_lines("proc-1").is_empty());
        assert!(journal.read_all("proc-1").is_none());
    }
}
