//! Wire codecs for the valve and motor controllers.
//!
//! Both devices take single ASCII command bytes and answer with
//! newline-terminated text lines. Valve commands use uppercase for "on" and
//! lowercase for the matching "off".

use bubble_core::valve::{ValveState, ValveStateVector, DRIVEN_VALVES, VALVE_COUNT};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown command {0:?}")]
pub struct UnknownCommand(pub String);

// ============================================================================
// Valve controller
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValveCommand {
    Heartbeat,
    DecodeSequence,
    ExecuteSequence,
    EnablePressureLog,
    DisablePressureLog,
    SwitchToManual,
    SwitchToAutoControl,
    EnableTtlControl,
    DisableTtlControl,
    TurnOnShortValve,
    TurnOffShortValve,
    TurnOnInputValve,
    TurnOffInputValve,
    TurnOnOutputValve,
    TurnOffOutputValve,
    TurnOnNnValve,
    TurnOffNnValve,
    TurnOnOphValve,
    TurnOffOphValve,
    Reset,
}

/// (command, wire byte, symbolic name)
const VALVE_COMMANDS: [(ValveCommand, u8, &str); 20] = [
    (ValveCommand::Heartbeat, b'y', "HEARTBEAT"),
    (ValveCommand::DecodeSequence, b'i', "DECODE_SEQUENCE"),
    (ValveCommand::ExecuteSequence, b'R', "EXECUTE_SEQUENCE"),
    (ValveCommand::EnablePressureLog, b'K', "ENABLE_PRESSURE_LOG"),
    (ValveCommand::DisablePressureLog, b'k', "DISABLE_PRESSURE_LOG"),
    (ValveCommand::SwitchToManual, b'm', "SWITCH_TO_MANUAL"),
    (ValveCommand::SwitchToAutoControl, b'M', "SWITCH_TO_AUTO_CONTROL"),
    (ValveCommand::EnableTtlControl, b'T', "ENABLE_TTL_CONTROL"),
    (ValveCommand::DisableTtlControl, b't', "DISABLE_TTL_CONTROL"),
    (ValveCommand::TurnOnShortValve, b'Z', "TURN_ON_SHORT_VALVE"),
    (ValveCommand::TurnOffShortValve, b'z', "TURN_OFF_SHORT_VALVE"),
    (ValveCommand::TurnOnInputValve, b'C', "TURN_ON_INPUT_VALVE"),
    (ValveCommand::TurnOffInputValve, b'c', "TURN_OFF_INPUT_VALVE"),
    (ValveCommand::TurnOnOutputValve, b'V', "TURN_ON_OUTPUT_VALVE"),
    (ValveCommand::TurnOffOutputValve, b'v', "TURN_OFF_OUTPUT_VALVE"),
    (ValveCommand::TurnOnNnValve, b'X', "TURN_ON_NN_VALVE"),
    (ValveCommand::TurnOffNnValve, b'x', "TURN_OFF_NN_VALVE"),
    (ValveCommand::TurnOnOphValve, b'H', "TURN_ON_OPH_VALVE"),
    (ValveCommand::TurnOffOphValve, b'h', "TURN_OFF_OPH_VALVE"),
    (ValveCommand::Reset, b's', "RESET"),
];

/// On/off commands for valves 1-5, in manifold order.
const VALVE_SWITCHES: [(ValveCommand, ValveCommand); DRIVEN_VALVES] = [
    (ValveCommand::TurnOnOphValve, ValveCommand::TurnOffOphValve),
    (ValveCommand::TurnOnInputValve, ValveCommand::TurnOffInputValve),
    (ValveCommand::TurnOnOutputValve, ValveCommand::TurnOffOutputValve),
    (ValveCommand::TurnOnNnValve, ValveCommand::TurnOffNnValve),
    (ValveCommand::TurnOnShortValve, ValveCommand::TurnOffShortValve),
];

impl ValveCommand {
    pub fn all() -> impl Iterator<Item = ValveCommand> {
        VALVE_COMMANDS.iter().map(|(command, _, _)| *command)
    }

    fn entry(self) -> &'static (ValveCommand, u8, &'static str) {
        VALVE_COMMANDS
            .iter()
            .find(|(command, _, _)| *command == self)
            .unwrap_or(&VALVE_COMMANDS[0])
    }

    pub fn code(self) -> u8 {
        self.entry().1
    }

    pub fn name(self) -> &'static str {
        self.entry().2
    }

    pub fn from_code(code: u8) -> Option<Self> {
        VALVE_COMMANDS
            .iter()
            .find(|(_, byte, _)| *byte == code)
            .map(|(command, _, _)| *command)
    }

    /// Command that drives one manifold position. `index` is zero-based.
    pub fn for_valve(index: usize, open: bool) -> Option<Self> {
        VALVE_SWITCHES
            .get(index)
            .map(|(on, off)| if open { *on } else { *off })
    }
}

impl FromStr for ValveCommand {
    type Err = UnknownCommand;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        VALVE_COMMANDS
            .iter()
            .find(|(_, _, symbol)| symbol.eq_ignore_ascii_case(name.trim()))
            .map(|(command, _, _)| *command)
            .ok_or_else(|| UnknownCommand(name.to_string()))
    }
}

impl fmt::Display for ValveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encodes a valve vector as one write: the on/off byte for every driven
/// position that is not `Ignore`, in index order. Empty when nothing changes.
pub fn encode_valve_states(vector: &ValveStateVector) -> Vec<u8> {
    vector
        .states()
        .iter()
        .take(DRIVEN_VALVES)
        .enumerate()
        .filter_map(|(index, state)| match state {
            ValveState::Open => ValveCommand::for_valve(index, true),
            ValveState::Closed => ValveCommand::for_valve(index, false),
            ValveState::Ignore => None,
        })
        .map(ValveCommand::code)
        .collect()
}

/// Pressure/valve frame as printed by the firmware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureFrame {
    pub pressures: [f64; 3],
    pub external_pressure: Option<f64>,
    pub valves: ValveStateVector,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValveResponse {
    HeartbeatAck,
    Reading(PressureFrame),
    SequenceAck { loaded: bool },
    Log(String),
    Unknown(String),
}

const FIELDS_WITH_EXTERNAL: usize = 4 + VALVE_COUNT;

impl ValveResponse {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line == "HEARTBEAT_ACK" {
            return ValveResponse::HeartbeatAck;
        }
        if let Some(body) = line.strip_prefix("P ") {
            return match parse_frame(body) {
                Some(frame) => ValveResponse::Reading(frame),
                None => ValveResponse::Unknown(line.to_string()),
            };
        }
        if let Some(rest) = line.strip_prefix("SEQ: ") {
            return ValveResponse::SequenceAck {
                loaded: !rest.ends_with("False"),
            };
        }
        if let Some(message) = line.strip_prefix("LOG: ") {
            return ValveResponse::Log(message.to_string());
        }
        ValveResponse::Unknown(line.to_string())
    }
}

fn parse_frame(body: &str) -> Option<PressureFrame> {
    let mut fields: Vec<&str> = body.split_whitespace().collect();
    if fields.last() == Some(&"C") {
        fields.pop();
    }

    let pressure_count = if fields.len() == FIELDS_WITH_EXTERNAL { 4 } else { 3 };
    if fields.len() < 3 {
        return None;
    }

    let mut pressures = [0.0; 3];
    for (slot, field) in pressures.iter_mut().zip(fields.iter()) {
        *slot = field.parse::<f64>().ok()?;
    }
    let external_pressure = if pressure_count == 4 {
        Some(fields[3].parse::<f64>().ok()?)
    } else {
        None
    };

    let codes: Vec<u8> = fields
        .iter()
        .skip(pressure_count)
        .take(VALVE_COUNT)
        .map(|field| match *field {
            "0" => 0,
            "1" => 1,
            _ => 2,
        })
        .collect();
    let valves = ValveStateVector::from_codes(&codes).ok()?;

    Some(PressureFrame {
        pressures,
        external_pressure,
        valves,
    })
}

// ============================================================================
// Motor controller
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorCommand {
    Heartbeat,
    Start,
    Stop,
    Calibrate,
    Status,
    TopPosition,
    CurrentPosition,
    MoveTo(i64),
    Ascent,
    ToTop,
}

impl MotorCommand {
    pub fn encode(self) -> Vec<u8> {
        match self {
            MotorCommand::Heartbeat => b"y".to_vec(),
            MotorCommand::Start => b"S".to_vec(),
            MotorCommand::Stop => b"s".to_vec(),
            MotorCommand::Calibrate => b"c".to_vec(),
            MotorCommand::Status => b"t".to_vec(),
            MotorCommand::TopPosition => b"o".to_vec(),
            MotorCommand::CurrentPosition => b"g".to_vec(),
            MotorCommand::MoveTo(steps) => format!("p{steps}\n").into_bytes(),
            MotorCommand::Ascent => b"u".to_vec(),
            MotorCommand::ToTop => b"U".to_vec(),
        }
    }

    /// Whether the firmware answers this command with a line.
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            MotorCommand::Heartbeat
                | MotorCommand::Status
                | MotorCommand::TopPosition
                | MotorCommand::CurrentPosition
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MotorResponse {
    HeartbeatAck,
    Calibration(bool),
    TopPosition(i64),
    Position(i64),
    Log(String),
    Unknown(String),
}

impl MotorResponse {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line == "HEARTBEAT_ACK" {
            return MotorResponse::HeartbeatAck;
        }
        if let Some(message) = line.strip_prefix("LOG: ") {
            return MotorResponse::Log(message.to_string());
        }
        let parsed = if let Some(flag) = line.strip_prefix("CAL ") {
            match flag.trim() {
                "1" => Some(MotorResponse::Calibration(true)),
                "0" => Some(MotorResponse::Calibration(false)),
                _ => None,
            }
        } else if let Some(steps) = line.strip_prefix("TOP ") {
            steps.trim().parse().ok().map(MotorResponse::TopPosition)
        } else if let Some(steps) = line.strip_prefix("POS ") {
            steps.trim().parse().ok().map(MotorResponse::Position)
        } else {
            None
        };
        parsed.unwrap_or_else(|| MotorResponse::Unknown(line.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_table_round_trips() {
        for command in ValveCommand::all() {
            assert_eq!(ValveCommand::from_code(command.code()), Some(command));
            assert_eq!(command.name().parse::<ValveCommand>(), Ok(command));
        }
        assert_eq!(ValveCommand::all().count(), VALVE_COMMANDS.len());
    }

    #[test]
    fn valve_vector_skips_ignored_positions() {
        let vector = ValveStateVector::from_codes(&[2, 1, 0, 2, 1, 1, 1, 1]).unwrap();
        assert_eq!(encode_valve_states(&vector), b"CvZ".to_vec());
        assert!(encode_valve_states(&ValveStateVector::unchanged()).is_empty());
    }
}
