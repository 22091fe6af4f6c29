//! Append-only chat log and login replay
//!
//! Every routed message and every join/leave notice is appended to the log as
//! `[YYYY-MM-DD HH:MM:SS] <message>`. On login the whole file is scanned again
//! and only the newest lines are kept for replay.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};

/// Timestamp layout used in the log
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Marker sent before replayed history
pub const HISTORY_BEGIN: &str = "--- Recent Chat History ---";

/// Marker sent after replayed history
pub const HISTORY_END: &str = "--- End of History ---";

/// Format one log record (without the trailing newline)
pub fn format_record<Tz: TimeZone>(at: &DateTime<Tz>, message: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("[{}] {}", at.format(TIMESTAMP_FORMAT), message)
}

// ============================================================================
// HistoryLog
// ============================================================================

/// Append-only log file plus bounded replay reads
pub struct HistoryLog {
    path: PathBuf,
    file: File,
}

impl HistoryLog {
    /// Open (or create) the log for appending
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(HistoryLog { path, file })
    }

    /// Append one message stamped with the current local time.
    ///
    /// Embedded line breaks are flattened so one event stays one line.
    pub fn append(&mut self, message: &str) -> io::Result<()> {
        let message = message.replace(['\r', '\n'], " ");
        let record = format_record(&Local::now(), &message);
        self.file.write_all(record.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()
    }

    /// Read the last `limit` lines of the log, oldest first.
    ///
    /// A log file that does not exist yet is an empty history.
    pub fn recent(&self, limit: usize) -> io::Result<Vec<String>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        last_lines(BufReader::new(file), limit)
    }
}

/// Keep only the newest `limit` lines of a reader
fn last_lines<R: BufRead>(mut reader: R, limit: usize) -> io::Result<Vec<String>> {
    let mut window: VecDeque<String> = VecDeque::with_capacity(limit);
    if limit == 0 {
        return Ok(Vec::new());
    }

    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        while matches!(raw.last(), Some(b'\n' | b'\r')) {
            raw.pop();
        }
        if window.len() == limit {
            window.pop_front();
        }
        window.push_back(String::from_utf8_lossy(&raw).into_owned());
    }

    Ok(window.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_format_record() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format_record(&at, "alice: hi"), "[2024-03-09 07:05:01] alice: hi");
    }

    #[test]
    fn test_missing_log_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.log");
        let log = HistoryLog::open(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(log.recent(20).unwrap().is_empty());
    }

    #[test]
    fn test_append_and_replay_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = HistoryLog::open(dir.path().join("chat.log")).unwrap();
        log.append("System: alice has joined the chat.").unwrap();
        log.append("alice: hello").unwrap();

        let lines = log.recent(20).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] System: alice has joined the chat."));
        assert!(lines[1].ends_with("] alice: hello"));
    }

    #[test]
    fn test_replay_keeps_newest_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = HistoryLog::open(dir.path().join("chat.log")).unwrap();
        for i in 0..25 {
            log.append(&format!("bob: message {}", i)).unwrap();
        }

        let lines = log.recent(20).unwrap();
        assert_eq!(lines.len(), 20);
        assert!(lines[0].ends_with("bob: message 5"));
        assert!(lines[19].ends_with("bob: message 24"));
    }

    #[test]
    fn test_append_flattens_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = HistoryLog::open(dir.path().join("chat.log")).unwrap();
        log.append("alice: one\ntwo").unwrap();
        let lines = log.recent(20).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("alice: one two"));
    }

    #[test]
    fn test_reopen_appends_to_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.log");
        HistoryLog::open(&path).unwrap().append("first").unwrap();
        HistoryLog::open(&path).unwrap().append("second").unwrap();

        let lines = HistoryLog::open(&path).unwrap().recent(20).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("second"));
    }

    #[test]
    fn test_last_lines_handles_crlf_and_no_trailing_newline() {
        let input = b"one\r\ntwo\r\nthree".as_slice();
        assert_eq!(last_lines(input, 2).unwrap(), vec!["two", "three"]);
    }
}
