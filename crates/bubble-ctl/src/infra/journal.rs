//! Session journal for safety-relevant events.
//!
//! One JSON object per line: link changes, sequence lifecycle, macros and
//! process start/stop. Entries carry both the session-monotonic and the
//! wall-clock timestamp.

use bubble_core::TimeBase;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventType {
    SystemStart,
    SystemShutdown,
    LinkConnected,
    LinkLost,
    SequenceLoaded,
    SequenceRejected,
    SequenceStarted,
    StepStarted,
    SequenceCompleted,
    SequenceAborted,
    MacroApplied,
    PressureLogSaved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Microseconds since session start
    pub timestamp_us: u64,
    pub unix_us: u64,
    pub event_type: JournalEventType,
    pub details: serde_json::Value,
}

/// Append-only JSONL writer shared by every task of the session.
pub struct SessionJournal {
    clock: TimeBase,
    writer: Mutex<BufWriter<File>>,
}

impl SessionJournal {
    /// Opens `path` in append mode, creating parent directories.
    pub fn open(path: &Path, clock: TimeBase) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            clock,
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn write(&self, entry: &JournalEntry) -> std::io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    /// Stamps and writes one event.
    pub fn record(
        &self,
        event_type: JournalEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.write(&JournalEntry {
            timestamp_us: self.clock.now_us(),
            unix_us: self.clock.unix_us(),
            event_type,
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn writes_one_json_object_per_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("journal.jsonl");
        let journal = SessionJournal::open(&path, TimeBase::new()).unwrap();

        journal
            .record(
                JournalEventType::SystemStart,
                serde_json::json!({"version": "0.1.0"}),
            )
            .unwrap();
        journal
            .record(
                JournalEventType::SequenceAborted,
                serde_json::json!({"reason": "valve controller not connected"}),
            )
            .unwrap();

        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);

        let first: JournalEntry = serde_json::from_str(lines[0]).unwrap();
        let second: JournalEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(first.event_type, JournalEventType::SystemStart);
        assert_eq!(second.event_type, JournalEventType::SequenceAborted);
        assert!(second.timestamp_us >= first.timestamp_us);
        assert_eq!(second.details["reason"], "valve controller not connected");
        assert!(lines[1].contains("\"sequence_aborted\""));
    }

    #[test]
    fn reopening_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        for _ in 0..2 {
            let journal = SessionJournal::open(&path, TimeBase::new()).unwrap();
            journal
                .record(JournalEventType::SystemShutdown, serde_json::json!({}))
                .unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
