use bubble_core::{CalibrationState, DeviceRole, Reading};

/// Everything a link reports upward. Delivered on a broadcast channel, so
/// slow subscribers may observe `Lagged` and skip ahead.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected(DeviceRole),
    Disconnected(DeviceRole),
    HeartbeatAck,
    Reading(Reading),
    SequenceAck { loaded: bool },
    DeviceLog { role: DeviceRole, message: String },
    UnknownResponse { role: DeviceRole, line: String },
    Calibration(CalibrationState),
    Position { steps: i64, mm: f64 },
    LinkLost { role: DeviceRole, reason: String },
    Faulted { role: DeviceRole, error: String },
}

pub(crate) const EVENT_CAPACITY: usize = 256;
