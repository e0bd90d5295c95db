//! Sequence files dropped by the external instrument-control program.
//!
//! The program writes `sequence.txt` into a shared directory and then polls
//! `prospa.txt` for `1` (sequence accepted and running) or `0` (rejected).
//! The sequence file is consumed either way. Rejections are answered here;
//! an accepted sequence is answered by the caller once it has tried to start
//! it.

use bubble_core::{ParseError, Sequence, SequenceParser};
use chrono::{DateTime, Local};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};

pub const SEQUENCE_FILE: &str = "sequence.txt";
pub const HANDSHAKE_FILE: &str = "prospa.txt";

#[derive(Debug, Error)]
pub enum SequenceFileError {
    #[error("sequence file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid sequence: {0}")]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedSequence {
    pub sequence: Sequence,
    /// Where the pressure CSV for this run goes.
    pub save_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SequenceInbox {
    dir: PathBuf,
    default_save_dir: PathBuf,
}

impl SequenceInbox {
    pub fn new(dir: impl Into<PathBuf>, default_save_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            default_save_dir: default_save_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sequence_path(&self) -> PathBuf {
        self.dir.join(SEQUENCE_FILE)
    }

    pub fn handshake_path(&self) -> PathBuf {
        self.dir.join(HANDSHAKE_FILE)
    }

    /// Consumes a pending sequence file, if there is one. Unreadable or
    /// invalid files are answered with `0`; an accepted sequence leaves the
    /// handshake to [`SequenceInbox::write_handshake`]. `Ok(None)` means
    /// nothing was waiting.
    pub fn poll(&self, motor_ready: bool) -> Result<Option<AcceptedSequence>, SequenceFileError> {
        let path = self.sequence_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read sequence file");
                self.remove_sequence_file();
                self.write_handshake(false)?;
                return Err(e.into());
            }
        };
        info!(path = %path.display(), "Sequence file found");

        let parsed = SequenceParser::new(motor_ready).parse(&raw);
        self.remove_sequence_file();

        match parsed {
            Ok(sequence) => {
                let save_path = resolve_save_path(
                    sequence.save_path.as_deref(),
                    &self.default_save_dir,
                    Local::now(),
                );
                info!(
                    steps = sequence.len(),
                    total_ms = sequence.total_duration_ms,
                    requires_motor = sequence.requires_motor,
                    save_path = %save_path.display(),
                    "Sequence accepted"
                );
                Ok(Some(AcceptedSequence {
                    sequence,
                    save_path,
                }))
            }
            Err(e) => {
                error!(error = %e, "Error loading sequence file");
                self.write_handshake(false)?;
                Err(e.into())
            }
        }
    }

    /// Writes the one-character handshake the external program polls.
    pub fn write_handshake(&self, accepted: bool) -> Result<(), SequenceFileError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.handshake_path(), if accepted { "1" } else { "0" })?;
        Ok(())
    }

    fn remove_sequence_file(&self) {
        match fs::remove_file(self.sequence_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!(error = %e, "Failed to delete sequence file"),
        }
    }
}

/// A `.csv` path is used as given, any other non-empty path is a directory
/// that receives a timestamped file, and no path means the default directory.
pub fn resolve_save_path(
    requested: Option<&str>,
    default_dir: &Path,
    now: DateTime<Local>,
) -> PathBuf {
    let file_name = format!("pressure_data_{}.csv", now.format("%m%d-%H%M"));
    match requested.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) if path.to_ascii_lowercase().ends_with(".csv") => PathBuf::from(path),
        Some(dir) => Path::new(dir).join(file_name),
        None => default_dir.join(file_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bubble_core::StepType;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn inbox(dir: &Path) -> SequenceInbox {
        SequenceInbox::new(dir, dir.join("results"))
    }

    #[test]
    fn nothing_pending() {
        let dir = tempdir().unwrap();
        let inbox = inbox(dir.path());
        assert!(inbox.poll(false).unwrap().is_none());
        assert!(!inbox.handshake_path().exists());
    }

    #[test]
    fn accepted_sequence_is_consumed_and_acknowledged() {
        let dir = tempdir().unwrap();
        let inbox = inbox(dir.path());
        let target = dir.path().join("out").join("run1.csv");
        fs::write(
            inbox.sequence_path(),
            format!("d100n200\n{}\n", target.display()),
        )
        .unwrap();

        let accepted = inbox.poll(false).unwrap().unwrap();
        assert_eq!(accepted.sequence.len(), 2);
        assert_eq!(accepted.sequence.steps[1].step_type, StepType::Nitrogen);
        assert_eq!(accepted.save_path, target);
        assert!(!inbox.sequence_path().exists());
        assert!(!inbox.handshake_path().exists());

        inbox.write_handshake(true).unwrap();
        assert_eq!(fs::read_to_string(inbox.handshake_path()).unwrap(), "1");
    }

    #[test]
    fn accepted_sequence_that_fails_to_start_answers_zero() {
        let dir = tempdir().unwrap();
        let inbox = inbox(dir.path());
        fs::write(inbox.handshake_path(), "1").unwrap();
        fs::write(inbox.sequence_path(), "s100\n").unwrap();

        assert!(inbox.poll(false).unwrap().is_some());
        inbox.write_handshake(false).unwrap();
        assert_eq!(fs::read_to_string(inbox.handshake_path()).unwrap(), "0");
    }

    #[test]
    fn rejected_sequence_writes_zero() {
        let dir = tempdir().unwrap();
        let inbox = inbox(dir.path());
        fs::write(inbox.sequence_path(), "Mb300m-50\n\n").unwrap();

        let err = inbox.poll(false).unwrap_err();
        assert!(matches!(
            err,
            SequenceFileError::Parse(ParseError::MotorNotReady)
        ));
        assert!(!inbox.sequence_path().exists());
        assert_eq!(fs::read_to_string(inbox.handshake_path()).unwrap(), "0");
    }

    #[test]
    fn save_path_rules() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 14, 5, 0).unwrap();
        let default_dir = Path::new("results");
        assert_eq!(
            resolve_save_path(None, default_dir, now),
            Path::new("results").join("pressure_data_0307-1405.csv")
        );
        assert_eq!(
            resolve_save_path(Some("  "), default_dir, now),
            Path::new("results").join("pressure_data_0307-1405.csv")
        );
        assert_eq!(
            resolve_save_path(Some("runs/a.CSV"), default_dir, now),
            PathBuf::from("runs/a.CSV")
        );
        assert_eq!(
            resolve_save_path(Some("runs"), default_dir, now),
            Path::new("runs").join("pressure_data_0307-1405.csv")
        );
    }
}
