//! Turns link, scheduler and supervisor events into CSV rows, journal
//! entries and counters.

use crate::infra::journal::{JournalEventType, SessionJournal};
use bubble_core::DeviceRole;
use bubble_io::metrics::{
    record_reading, HEARTBEAT_TIMEOUTS, LINKS_LOST, SEQUENCES_ABORTED, SEQUENCES_COMPLETED,
    UNKNOWN_LINES,
};
use bubble_io::sequence_file::resolve_save_path;
use bubble_io::{CsvLayout, LinkEvent, PressureLogger, SchedulerEvent, SupervisorEvent};
use chrono::Local;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct SessionRecorder {
    save_dir: PathBuf,
    layout: CsvLayout,
    journal: Option<Arc<SessionJournal>>,
    armed: Option<PathBuf>,
    logger: Option<PressureLogger>,
    saved: Vec<PathBuf>,
}

impl SessionRecorder {
    pub fn new(save_dir: PathBuf, layout: CsvLayout, journal: Option<Arc<SessionJournal>>) -> Self {
        Self {
            save_dir,
            layout,
            journal,
            armed: None,
            logger: None,
            saved: Vec::new(),
        }
    }

    /// Sets the CSV path used by the next sequence start.
    pub fn arm(&mut self, path: PathBuf) {
        self.armed = Some(path);
    }

    pub fn disarm(&mut self) {
        self.armed = None;
    }

    pub fn is_logging(&self) -> bool {
        self.logger.is_some()
    }

    /// CSV files closed so far this session.
    pub fn saved(&self) -> &[PathBuf] {
        &self.saved
    }

    pub fn journal(&self, event_type: JournalEventType, details: serde_json::Value) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(event_type, details) {
                warn!(error = %e, "Failed to write journal entry");
            }
        }
    }

    pub fn on_link_event(&mut self, event: &LinkEvent) {
        match event {
            LinkEvent::Reading(reading) => {
                record_reading(reading);
                if let Some(logger) = self.logger.as_mut() {
                    if let Err(e) = logger.append(reading) {
                        error!(path = %logger.path().display(), error = %e, "Failed to write pressure row, logging stopped");
                        self.close_log();
                    }
                }
            }
            LinkEvent::UnknownResponse { .. } => UNKNOWN_LINES.inc(),
            LinkEvent::Connected(role) => {
                self.journal(JournalEventType::LinkConnected, json!({ "device": role.as_str() }));
            }
            LinkEvent::LinkLost { role, reason } => {
                if *role == DeviceRole::Valve {
                    HEARTBEAT_TIMEOUTS.inc();
                }
                self.journal(
                    JournalEventType::LinkLost,
                    json!({ "device": role.as_str(), "reason": reason }),
                );
            }
            LinkEvent::Faulted { role, error } => {
                self.journal(
                    JournalEventType::LinkLost,
                    json!({ "device": role.as_str(), "reason": error }),
                );
            }
            _ => {}
        }
    }

    pub fn on_scheduler_event(&mut self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::Started {
                steps,
                total_ms,
                requires_motor,
                ..
            } => {
                let path = self
                    .armed
                    .take()
                    .unwrap_or_else(|| resolve_save_path(None, &self.save_dir, Local::now()));
                self.close_log();
                match PressureLogger::create(&path, self.layout) {
                    Ok(logger) => self.logger = Some(logger),
                    Err(e) => error!(path = %path.display(), error = %e, "Failed to start pressure log"),
                }
                self.journal(
                    JournalEventType::SequenceStarted,
                    json!({
                        "steps": steps,
                        "total_ms": total_ms,
                        "requires_motor": requires_motor,
                        "csv": path.display().to_string(),
                    }),
                );
            }
            SchedulerEvent::StepStarted { index, step } => {
                self.journal(
                    JournalEventType::StepStarted,
                    json!({ "index": index, "step": step }),
                );
            }
            SchedulerEvent::Completed => {
                SEQUENCES_COMPLETED.inc();
                self.journal(JournalEventType::SequenceCompleted, json!({}));
                self.close_log();
            }
            SchedulerEvent::Aborted(reason) => {
                SEQUENCES_ABORTED.inc();
                self.journal(
                    JournalEventType::SequenceAborted,
                    json!({ "reason": reason.as_str() }),
                );
                self.close_log();
            }
        }
    }

    pub fn on_supervisor_event(&mut self, event: &SupervisorEvent) {
        if let SupervisorEvent::LinkLost { role, state } = event {
            LINKS_LOST.inc();
            warn!(device = %role, state = state.as_str(), "Supervisor reported link loss");
        }
    }

    /// Closes any open CSV.
    pub fn finish(&mut self) {
        self.close_log();
    }

    fn close_log(&mut self) {
        let Some(logger) = self.logger.take() else {
            return;
        };
        let rows = logger.rows();
        match logger.finish() {
            Ok(path) => {
                info!(path = %path.display(), rows, "Pressure data saved");
                self.journal(
                    JournalEventType::PressureLogSaved,
                    json!({ "path": path.display().to_string(), "rows": rows }),
                );
                self.saved.push(path);
            }
            Err(e) => error!(error = %e, "Failed to close pressure log"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bubble_core::{AbortReason, Reading, StepType, TimeBase, ValveStateVector};
    use tempfile::tempdir;

    fn reading(raw: f64) -> Reading {
        Reading {
            unix_us: 1_700_000_000_000_000,
            pressures: [raw, raw, raw],
            external_pressure: None,
            valves: ValveStateVector::all_closed(),
        }
    }

    fn started() -> SchedulerEvent {
        SchedulerEvent::Started {
            steps: 2,
            total_ms: 300,
            requires_motor: false,
            save_path: None,
        }
    }

    #[test]
    fn logs_rows_only_while_a_sequence_runs() {
        let dir = tempdir().unwrap();
        let csv = dir.path().join("runs").join("first.csv");
        let mut recorder = SessionRecorder::new(dir.path().to_path_buf(), CsvLayout::Pressure, None);

        recorder.on_link_event(&LinkEvent::Reading(reading(300.0)));
        assert!(!recorder.is_logging());

        recorder.arm(csv.clone());
        recorder.on_scheduler_event(&started());
        assert!(recorder.is_logging());
        recorder.on_link_event(&LinkEvent::Reading(reading(300.0)));
        recorder.on_link_event(&LinkEvent::Reading(reading(310.0)));
        recorder.on_scheduler_event(&SchedulerEvent::Completed);
        recorder.on_link_event(&LinkEvent::Reading(reading(320.0)));

        assert!(!recorder.is_logging());
        assert_eq!(recorder.saved(), &[csv.clone()]);
        let content = std::fs::read_to_string(&csv).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "Time,Pressure1,Pressure2,Pressure3,Pressure4");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn unarmed_start_uses_save_dir_and_abort_closes() {
        let dir = tempdir().unwrap();
        let mut recorder = SessionRecorder::new(dir.path().to_path_buf(), CsvLayout::Full, None);

        recorder.on_scheduler_event(&started());
        recorder.on_link_event(&LinkEvent::Reading(reading(300.0)));
        recorder.on_scheduler_event(&SchedulerEvent::Aborted(AbortReason::ValveLinkDown));

        let saved = recorder.saved().to_vec();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].parent(), Some(dir.path()));
        let name = saved[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("pressure_data_") && name.ends_with(".csv"));
        let content = std::fs::read_to_string(&saved[0]).unwrap();
        assert!(content.starts_with("Time,Pressure1,Pressure2,Pressure3,ValveState1"));
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn journals_sequence_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = Arc::new(SessionJournal::open(&path, TimeBase::new()).unwrap());
        let mut recorder = SessionRecorder::new(
            dir.path().join("csv"),
            CsvLayout::Pressure,
            Some(journal),
        );

        recorder.on_link_event(&LinkEvent::Connected(DeviceRole::Valve));
        recorder.on_scheduler_event(&started());
        recorder.on_scheduler_event(&SchedulerEvent::StepStarted {
            index: 1,
            step: bubble_core::Step::new(StepType::Nitrogen, 100, None).unwrap(),
        });
        recorder.on_scheduler_event(&SchedulerEvent::Aborted(AbortReason::Requested));

        let content = std::fs::read_to_string(&path).unwrap();
        let kinds: Vec<String> = content
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["event_type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            kinds,
            [
                "link_connected",
                "sequence_started",
                "step_started",
                "sequence_aborted",
                "pressure_log_saved"
            ]
        );
    }
}
