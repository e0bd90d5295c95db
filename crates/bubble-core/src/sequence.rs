//! Sequence mini-language.
//!
//! A sequence file holds a token stream on its first line and an optional save
//! path on its second. Each token is a step type character, a duration in
//! milliseconds, and in motor sequences an optional `m` suffix carrying a
//! signed motor target in steps, e.g. `Md500b3000m-6400s200`. A capital `M`
//! anywhere in the stream marks the sequence as needing the motor; motor steps
//! without a suffix target step 0.

use crate::valve::{ValveState, ValveStateVector};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

const MOTOR_MARKER: char = 'M';
const MOTOR_SUFFIX: char = 'm';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Depressurise,
    Nitrogen,
    Evacuate,
    Bubble,
    Sleep,
    HoldBubble,
}

impl StepType {
    pub const ALL: [StepType; 6] = [
        StepType::Depressurise,
        StepType::Nitrogen,
        StepType::Evacuate,
        StepType::Bubble,
        StepType::Sleep,
        StepType::HoldBubble,
    ];

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'd' => Some(StepType::Depressurise),
            'n' => Some(StepType::Nitrogen),
            'e' => Some(StepType::Evacuate),
            'b' => Some(StepType::Bubble),
            's' => Some(StepType::Sleep),
            'h' => Some(StepType::HoldBubble),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            StepType::Depressurise => 'd',
            StepType::Nitrogen => 'n',
            StepType::Evacuate => 'e',
            StepType::Bubble => 'b',
            StepType::Sleep => 's',
            StepType::HoldBubble => 'h',
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StepType::Depressurise => "Depressurise",
            StepType::Nitrogen => "Nitrogen",
            StepType::Evacuate => "Evacuate",
            StepType::Bubble => "Bubble",
            StepType::Sleep => "Sleep",
            StepType::HoldBubble => "Hold Bubble",
        }
    }

    /// Fixed manifold pattern applied when a step of this type starts.
    pub fn valve_pattern(self) -> ValveStateVector {
        use ValveState::*;
        match self {
            StepType::Depressurise | StepType::Evacuate => {
                ValveStateVector::new([Closed, Closed, Closed, Closed, Closed, Ignore, Ignore, Ignore])
            }
            StepType::Nitrogen => {
                ValveStateVector::new([Open, Open, Open, Open, Open, Ignore, Ignore, Ignore])
            }
            StepType::Bubble => {
                ValveStateVector::new([Ignore, Open, Open, Open, Closed, Ignore, Ignore, Ignore])
            }
            StepType::Sleep => {
                ValveStateVector::new([Ignore, Ignore, Ignore, Closed, Closed, Ignore, Ignore, Ignore])
            }
            StepType::HoldBubble => {
                ValveStateVector::new([Ignore, Closed, Closed, Closed, Closed, Ignore, Ignore, Ignore])
            }
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Step {
    pub step_type: StepType,
    pub duration_ms: u64,
    pub motor_position: Option<i64>,
}

impl Step {
    /// Returns `None` for a zero duration.
    pub fn new(step_type: StepType, duration_ms: u64, motor_position: Option<i64>) -> Option<Self> {
        (duration_ms > 0).then_some(Self {
            step_type,
            duration_ms,
            motor_position,
        })
    }

    pub fn valve_pattern(&self) -> ValveStateVector {
        self.step_type.valve_pattern()
    }

    /// Motor target to push when this step starts. Negative targets mean
    /// "stay where you are".
    pub fn motor_target(&self) -> Option<i64> {
        self.motor_position.filter(|steps| *steps >= 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sequence {
    pub steps: Vec<Step>,
    pub total_duration_ms: u64,
    pub requires_motor: bool,
    pub save_path: Option<String>,
}

impl Sequence {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("sequence is empty")]
    EmptySequence,
    #[error("invalid step type {found:?} at position {position}")]
    InvalidStepType { position: usize, found: char },
    #[error("invalid duration at position {position}")]
    InvalidDuration { position: usize },
    #[error("invalid motor position at position {position}")]
    InvalidMotorPosition { position: usize },
    #[error("sequence requires the motor but the motor is not ready")]
    MotorNotReady,
}

/// Compiles sequence text into steps. Motor readiness is captured at
/// construction because it gates whether a motor sequence is accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceParser {
    motor_ready: bool,
}

impl SequenceParser {
    pub fn new(motor_ready: bool) -> Self {
        Self { motor_ready }
    }

    /// Parses the two-line sequence file content.
    pub fn parse(&self, raw: &str) -> Result<Sequence, ParseError> {
        let mut lines = raw.lines();
        let tokens = lines.next().unwrap_or_default();
        let save_path = lines.next().unwrap_or_default();
        self.parse_lines(tokens, save_path)
    }

    pub fn parse_lines(&self, tokens: &str, save_path: &str) -> Result<Sequence, ParseError> {
        let tokens = tokens.trim();
        let requires_motor = tokens.contains(MOTOR_MARKER);
        let stream: Vec<char> = tokens.chars().filter(|c| *c != MOTOR_MARKER).collect();

        if stream.is_empty() {
            return Err(ParseError::EmptySequence);
        }
        if requires_motor && !self.motor_ready {
            log::warn!("sequence requires motor but motor is not ready");
            return Err(ParseError::MotorNotReady);
        }

        let mut steps = Vec::new();
        let mut pos = 0;
        while pos < stream.len() {
            let found = stream[pos];
            let step_type =
                StepType::from_char(found).ok_or(ParseError::InvalidStepType { position: pos, found })?;
            pos += 1;

            let duration_start = pos;
            let digits = take_digits(&stream, &mut pos);
            let duration_ms = digits
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or(ParseError::InvalidDuration {
                    position: duration_start,
                })?;

            let mut motor_position = requires_motor.then_some(0);
            if requires_motor && stream.get(pos) == Some(&MOTOR_SUFFIX) {
                pos += 1;
                let suffix_start = pos;
                let negative = stream.get(pos) == Some(&'-');
                if negative {
                    pos += 1;
                }
                let magnitude = take_digits(&stream, &mut pos)
                    .parse::<i64>()
                    .map_err(|_| ParseError::InvalidMotorPosition {
                        position: suffix_start,
                    })?;
                motor_position = Some(if negative { -magnitude } else { magnitude });
            }

            steps.push(Step {
                step_type,
                duration_ms,
                motor_position,
            });
        }

        let total_duration_ms = steps
            .iter()
            .try_fold(0u64, |total, step| total.checked_add(step.duration_ms))
            .ok_or(ParseError::InvalidDuration {
                position: stream.len(),
            })?;
        let save_path = Some(save_path.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        log::debug!(
            "parsed sequence: {} steps, {} ms, motor={}",
            steps.len(),
            total_duration_ms,
            requires_motor
        );

        Ok(Sequence {
            steps,
            total_duration_ms,
            requires_motor,
            save_path,
        })
    }
}

fn take_digits(stream: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < stream.len() && stream[*pos].is_ascii_digit() {
        *pos += 1;
    }
    stream[start..*pos].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(seq: &Sequence) -> Vec<(char, u64, i64)> {
        seq.steps
            .iter()
            .map(|s| (s.step_type.as_char(), s.duration_ms, s.motor_position.unwrap_or(0)))
            .collect()
    }

    #[test]
    fn parses_plain_sequence() {
        let seq = SequenceParser::new(false).parse_lines("d100n200", "").unwrap();
        assert_eq!(steps(&seq), vec![('d', 100, 0), ('n', 200, 0)]);
        assert_eq!(seq.total_duration_ms, 300);
        assert!(!seq.requires_motor);
        assert_eq!(seq.save_path, None);
    }

    #[test]
    fn motor_sequence_needs_ready_motor() {
        let seq = SequenceParser::new(true).parse_lines("Mb300m-50", "").unwrap();
        assert_eq!(steps(&seq), vec![('b', 300, -50)]);
        assert!(seq.requires_motor);

        assert_eq!(
            SequenceParser::new(false).parse_lines("Mb300m-50", ""),
            Err(ParseError::MotorNotReady)
        );
    }

    #[test]
    fn motor_marker_may_appear_anywhere() {
        let seq = SequenceParser::new(true).parse_lines("d100Mn50m6400", "").unwrap();
        assert!(seq.requires_motor);
        assert_eq!(steps(&seq), vec![('d', 100, 0), ('n', 50, 6400)]);
    }

    #[test]
    fn motor_steps_default_to_position_zero() {
        let seq = SequenceParser::new(true).parse_lines("Md100b200m640", "").unwrap();
        assert_eq!(seq.steps[0].motor_position, Some(0));
        assert_eq!(seq.steps[0].motor_target(), Some(0));
        assert_eq!(seq.steps[1].motor_target(), Some(640));
    }

    #[test]
    fn motor_suffix_needs_motor_marker() {
        assert!(matches!(
            SequenceParser::new(true).parse_lines("b100m500", ""),
            Err(ParseError::InvalidStepType { position: 4, found: 'm' })
        ));
        let seq = SequenceParser::new(true).parse_lines("b100n50", "").unwrap();
        assert!(seq.steps.iter().all(|s| s.motor_position.is_none()));
    }

    #[test]
    fn rejects_total_duration_overflow() {
        let parser = SequenceParser::new(false);
        assert!(matches!(
            parser.parse_lines("d18446744073709551615d1", ""),
            Err(ParseError::InvalidDuration { .. })
        ));
        let seq = parser.parse_lines("d18446744073709551614d1", "").unwrap();
        assert_eq!(seq.total_duration_ms, u64::MAX);
    }

    #[test]
    fn rejects_bad_tokens() {
        let parser = SequenceParser::new(true);
        assert!(matches!(
            parser.parse_lines("x100", ""),
            Err(ParseError::InvalidStepType { found: 'x', .. })
        ));
        assert!(matches!(
            parser.parse_lines("d0", ""),
            Err(ParseError::InvalidDuration { .. })
        ));
        assert!(matches!(
            parser.parse_lines("d", ""),
            Err(ParseError::InvalidDuration { .. })
        ));
        assert!(matches!(
            parser.parse_lines("Md100m", ""),
            Err(ParseError::InvalidMotorPosition { .. })
        ));
        assert!(matches!(
            parser.parse_lines("Md100m-", ""),
            Err(ParseError::InvalidMotorPosition { .. })
        ));
        assert_eq!(parser.parse_lines("   ", ""), Err(ParseError::EmptySequence));
        assert_eq!(parser.parse_lines("M", ""), Err(ParseError::EmptySequence));
    }

    #[test]
    fn reads_save_path_from_second_line() {
        let seq = SequenceParser::new(false)
            .parse("e250s100\r\n  C:\\data\\run1.csv  \n")
            .unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.save_path.as_deref(), Some("C:\\data\\run1.csv"));
    }

    #[test]
    fn negative_motor_target_holds_position() {
        let step = Step::new(StepType::Bubble, 10, Some(-1)).unwrap();
        assert_eq!(step.motor_target(), None);
        assert!(Step::new(StepType::Bubble, 0, None).is_none());
    }

    #[test]
    fn step_patterns() {
        assert_eq!(StepType::Depressurise.valve_pattern().codes(), [0, 0, 0, 0, 0, 2, 2, 2]);
        assert_eq!(StepType::Evacuate.valve_pattern().codes(), [0, 0, 0, 0, 0, 2, 2, 2]);
        assert_eq!(StepType::Nitrogen.valve_pattern().codes(), [1, 1, 1, 1, 1, 2, 2, 2]);
        assert_eq!(StepType::Bubble.valve_pattern().codes(), [2, 1, 1, 1, 0, 2, 2, 2]);
        assert_eq!(StepType::Sleep.valve_pattern().codes(), [2, 2, 2, 0, 0, 2, 2, 2]);
        assert_eq!(StepType::HoldBubble.valve_pattern().codes(), [2, 0, 0, 0, 0, 2, 2, 2]);
    }
}
