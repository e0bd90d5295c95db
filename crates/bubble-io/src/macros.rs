//! Valve and motor macros.
//!
//! Macro definitions are edited elsewhere and stored as JSON arrays; only the
//! decoded form is used here. A valve macro is applied for a fixed time by
//! `MacroTimer`, after which the valves it touched go back to how they were.

use crate::error::LinkError;
use crate::motor_link::MotorLink;
use crate::task::{stopped, TaskSet};
use crate::valve_link::ValveLink;
use bubble_core::{ValveCodeError, ValveState, ValveStateVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub const VALVE_MACRO_FILE: &str = "valve_macro_data.json";
pub const MOTOR_MACRO_FILE: &str = "motor_macro_data.json";

const DEFAULT_VALVE_MACROS: usize = 4;
const DEFAULT_MOTOR_MACROS: usize = 6;

#[derive(Debug, Error)]
pub enum MacroError {
    #[error("macro file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid macro file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("macro {number} has invalid valve states: {source}")]
    InvalidValves {
        number: MacroNumber,
        source: ValveCodeError,
    },
    #[error("macro {number} timer must be positive, got {timer}")]
    InvalidTimer { number: MacroNumber, timer: f64 },
    #[error("no macro {0}")]
    NotFound(String),
    #[error("a macro is already running")]
    MacroBusy,
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Macro numbers are written as numbers by some editors and as strings by
/// others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MacroNumber {
    Number(u32),
    Text(String),
}

impl fmt::Display for MacroNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacroNumber::Number(n) => write!(f, "{n}"),
            MacroNumber::Text(s) => f.write_str(s),
        }
    }
}

fn default_timer() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValveMacro {
    #[serde(rename = "Macro No.")]
    pub number: MacroNumber,
    #[serde(rename = "Label", default)]
    pub label: String,
    #[serde(rename = "Valves")]
    pub valves: Vec<u8>,
    /// Seconds.
    #[serde(rename = "Timer", default = "default_timer")]
    pub timer: f64,
}

impl ValveMacro {
    /// Valve vector padded to eight entries with `Ignore`.
    pub fn vector(&self) -> Result<ValveStateVector, MacroError> {
        ValveStateVector::from_codes(&self.valves).map_err(|source| MacroError::InvalidValves {
            number: self.number.clone(),
            source,
        })
    }

    pub fn duration(&self) -> Result<Duration, MacroError> {
        if !(self.timer.is_finite() && self.timer > 0.0) {
            return Err(MacroError::InvalidTimer {
                number: self.number.clone(),
                timer: self.timer,
            });
        }
        Ok(Duration::from_secs_f64(self.timer))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorMacro {
    #[serde(rename = "Macro No.")]
    pub number: MacroNumber,
    #[serde(rename = "Label", default)]
    pub label: String,
    /// Millimetres below the calibrated top.
    #[serde(rename = "Position", default)]
    pub position: f64,
}

impl MotorMacro {
    pub async fn apply(&self, motor: &MotorLink) -> Result<(), MacroError> {
        motor.move_to_target(self.position).await?;
        info!(number = %self.number, label = %self.label, position_mm = self.position, "Motor macro applied");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroSet {
    pub valve: Vec<ValveMacro>,
    pub motor: Vec<MotorMacro>,
}

impl Default for MacroSet {
    fn default() -> Self {
        Self {
            valve: default_valve_macros(),
            motor: default_motor_macros(),
        }
    }
}

impl MacroSet {
    /// Loads both macro files from `dir`. A missing file falls back to the
    /// defaults for that kind.
    pub fn load_dir(dir: &Path) -> Result<Self, MacroError> {
        let valve = read_or_default(&dir.join(VALVE_MACRO_FILE), default_valve_macros)?;
        let motor = read_or_default(&dir.join(MOTOR_MACRO_FILE), default_motor_macros)?;
        for valve_macro in &valve {
            valve_macro.vector()?;
            valve_macro.duration()?;
        }
        info!(valve = valve.len(), motor = motor.len(), dir = %dir.display(), "Loaded macros");
        Ok(Self { valve, motor })
    }

    pub fn valve_macro(&self, number: &str) -> Result<&ValveMacro, MacroError> {
        self.valve
            .iter()
            .find(|m| m.number.to_string() == number)
            .ok_or_else(|| MacroError::NotFound(number.to_string()))
    }

    pub fn motor_macro(&self, number: &str) -> Result<&MotorMacro, MacroError> {
        self.motor
            .iter()
            .find(|m| m.number.to_string() == number)
            .ok_or_else(|| MacroError::NotFound(number.to_string()))
    }
}

fn read_or_default<T: serde::de::DeserializeOwned>(
    path: &Path,
    default: fn() -> Vec<T>,
) -> Result<Vec<T>, MacroError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "Macro file not found, using defaults");
            Ok(default())
        }
        Err(e) => Err(e.into()),
    }
}

fn default_valve_macros() -> Vec<ValveMacro> {
    (1..=DEFAULT_VALVE_MACROS as u32)
        .map(|n| {
            let code = u8::from(n % 2 == 1);
            ValveMacro {
                number: MacroNumber::Number(n),
                label: format!("Macro {n}"),
                valves: vec![code; 5],
                timer: default_timer(),
            }
        })
        .collect()
}

fn default_motor_macros() -> Vec<MotorMacro> {
    (1..=DEFAULT_MOTOR_MACROS as u32)
        .map(|n| MotorMacro {
            number: MacroNumber::Number(n),
            label: format!("Macro {n}"),
            position: 0.0,
        })
        .collect()
}

/// One-shot valve pattern with automatic restore. Only one may be pending.
pub struct MacroTimer {
    active: Arc<AtomicBool>,
    task: Mutex<Option<TaskSet>>,
}

impl MacroTimer {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Applies `vector` now and restores the touched valves after `duration`.
    pub async fn run(
        &self,
        link: &Arc<ValveLink>,
        vector: ValveStateVector,
        duration: Duration,
    ) -> Result<(), MacroError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Macro already running");
            return Err(MacroError::MacroBusy);
        }

        let previous = link.valve_states();
        if let Err(e) = link.set_valve_states(&vector) {
            self.active.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        let restore = restore_pattern(&vector, &previous);
        info!(valves = %vector, duration_ms = duration.as_millis() as u64, "Macro started");

        // The previous timer has already finished by the time `active` is
        // clear again.
        let finished = self.lock_task().take();
        if let Some(done) = finished {
            done.stop().await;
        }

        let mut task = TaskSet::new("macro-timer");
        let mut shutdown = task.shutdown_signal();
        let link = Arc::clone(link);
        let active = Arc::clone(&self.active);
        task.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    match link.set_valve_states(&restore) {
                        Ok(()) => info!(valves = %restore, "Macro finished, valves restored"),
                        Err(e) => error!(error = %e, "Failed to restore valves after macro"),
                    }
                }
                _ = stopped(&mut shutdown) => {}
            }
            active.store(false, Ordering::SeqCst);
        });
        *self.lock_task() = Some(task);
        Ok(())
    }

    /// Cancels a pending restore, leaving the macro pattern applied.
    pub async fn cancel(&self) {
        let task = self.lock_task().take();
        if let Some(task) = task {
            task.stop().await;
        }
        self.active.store(false, Ordering::SeqCst);
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<TaskSet>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MacroTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Valves the macro drives go back to their previous state; the rest are
/// left alone.
fn restore_pattern(applied: &ValveStateVector, previous: &ValveStateVector) -> ValveStateVector {
    let mut restore = ValveStateVector::unchanged();
    for (index, state) in applied.states().iter().enumerate() {
        if *state != ValveState::Ignore {
            restore = restore.with(index, previous.get(index).unwrap_or(ValveState::Ignore));
        }
    }
    restore
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_editor_json() {
        let raw = r#"[
            {"Macro No.": "1", "Label": "Purge", "Valves": [1, 1, 0, 2, 0], "Timer": 2.5},
            {"Macro No.": 2, "Valves": [0, 0, 0, 0, 0]}
        ]"#;
        let macros: Vec<ValveMacro> = serde_json::from_str(raw).unwrap();
        assert_eq!(macros[0].label, "Purge");
        assert_eq!(macros[0].duration().unwrap(), Duration::from_millis(2500));
        assert_eq!(
            macros[0].vector().unwrap().codes(),
            [1, 1, 0, 2, 0, 2, 2, 2]
        );
        assert_eq!(macros[1].number, MacroNumber::Number(2));
        assert_eq!(macros[1].timer, 1.0);

        let motor: Vec<MotorMacro> =
            serde_json::from_str(r#"[{"Macro No.": "M1", "Label": "Deep", "Position": 12.5}]"#)
                .unwrap();
        assert_eq!(motor[0].position, 12.5);
    }

    #[test]
    fn rejects_bad_valve_codes_and_timers() {
        let bad = ValveMacro {
            number: MacroNumber::Number(3),
            label: String::new(),
            valves: vec![0, 5],
            timer: 0.0,
        };
        assert!(matches!(bad.vector(), Err(MacroError::InvalidValves { .. })));
        assert!(matches!(bad.duration(), Err(MacroError::InvalidTimer { .. })));
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(MOTOR_MACRO_FILE),
            r#"[{"Macro No.": 1, "Label": "Top", "Position": 0}]"#,
        )
        .unwrap();
        let set = MacroSet::load_dir(dir.path()).unwrap();
        assert_eq!(set.valve.len(), 4);
        assert_eq!(set.valve[0].valves, vec![1; 5]);
        assert_eq!(set.valve[1].valves, vec![0; 5]);
        assert_eq!(set.motor.len(), 1);
        assert_eq!(set.motor_macro("1").unwrap().label, "Top");
        assert!(matches!(set.valve_macro("9"), Err(MacroError::NotFound(_))));
    }

    #[test]
    fn restore_only_touches_driven_valves() {
        let previous = ValveStateVector::from_codes(&[1, 0, 0, 0, 1, 0, 0, 0]).unwrap();
        let restore = restore_pattern(&ValveStateVector::quick_bubble(), &previous);
        assert_eq!(restore.codes(), [2, 0, 0, 0, 2, 2, 2, 2]);
    }
}
