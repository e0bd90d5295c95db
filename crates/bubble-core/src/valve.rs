use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of positions in every valve-state vector.
pub const VALVE_COUNT: usize = 8;

/// Positions the current manifold revision actually drives (valves 1-5).
pub const DRIVEN_VALVES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ValveState {
    #[default]
    Closed,
    Open,
    /// Leave the valve as it is.
    Ignore,
}

impl ValveState {
    pub fn code(self) -> u8 {
        match self {
            ValveState::Closed => 0,
            ValveState::Open => 1,
            ValveState::Ignore => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ValveState::Closed),
            1 => Some(ValveState::Open),
            2 => Some(ValveState::Ignore),
            _ => None,
        }
    }
}

impl From<ValveState> for u8 {
    fn from(state: ValveState) -> Self {
        state.code()
    }
}

impl TryFrom<u8> for ValveState {
    type Error = ValveCodeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        ValveState::from_code(code).ok_or(ValveCodeError::InvalidCode { index: 0, code })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValveCodeError {
    #[error("valve {index} has invalid state code {code}")]
    InvalidCode { index: usize, code: u8 },
    #[error("expected at most {VALVE_COUNT} valve states, got {0}")]
    TooMany(usize),
}

/// Eight position-addressed valve states. Index 0 is valve 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValveStateVector([ValveState; VALVE_COUNT]);

impl ValveStateVector {
    pub const fn new(states: [ValveState; VALVE_COUNT]) -> Self {
        Self(states)
    }

    /// Everything `Ignore`; applying it changes nothing.
    pub const fn unchanged() -> Self {
        Self([ValveState::Ignore; VALVE_COUNT])
    }

    /// Builds a vector from numeric codes, padding missing trailing entries
    /// with `Ignore`.
    pub fn from_codes(codes: &[u8]) -> Result<Self, ValveCodeError> {
        if codes.len() > VALVE_COUNT {
            return Err(ValveCodeError::TooMany(codes.len()));
        }
        let mut states = [ValveState::Ignore; VALVE_COUNT];
        for (index, code) in codes.iter().enumerate() {
            states[index] = ValveState::from_code(*code).ok_or(ValveCodeError::InvalidCode {
                index,
                code: *code,
            })?;
        }
        Ok(Self(states))
    }

    pub fn codes(&self) -> [u8; VALVE_COUNT] {
        self.0.map(ValveState::code)
    }

    pub fn states(&self) -> &[ValveState; VALVE_COUNT] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<ValveState> {
        self.0.get(index).copied()
    }

    pub fn with(mut self, index: usize, state: ValveState) -> Self {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = state;
        }
        self
    }

    pub fn is_unchanged(&self) -> bool {
        self.0.iter().all(|s| *s == ValveState::Ignore)
    }

    /// Entries of `self` that are `Ignore` take the value from `base`.
    pub fn overlay(&self, base: &ValveStateVector) -> ValveStateVector {
        let mut merged = self.0;
        for (slot, fallback) in merged.iter_mut().zip(base.0.iter()) {
            if *slot == ValveState::Ignore {
                *slot = *fallback;
            }
        }
        Self(merged)
    }

    pub const fn all_closed() -> Self {
        use ValveState::*;
        Self([Closed, Closed, Closed, Closed, Closed, Ignore, Ignore, Ignore])
    }

    pub const fn all_open() -> Self {
        use ValveState::*;
        Self([Open, Open, Open, Open, Open, Ignore, Ignore, Ignore])
    }

    pub const fn quick_bubble() -> Self {
        use ValveState::*;
        Self([Ignore, Open, Open, Open, Ignore, Ignore, Ignore, Ignore])
    }

    pub const fn quick_vent() -> Self {
        use ValveState::*;
        Self([Ignore, Ignore, Open, Closed, Open, Ignore, Ignore, Ignore])
    }

    pub const fn slow_vent() -> Self {
        use ValveState::*;
        Self([Ignore, Ignore, Open, Open, Open, Ignore, Ignore, Ignore])
    }

    /// Flips one valve relative to `current`, leaving the rest untouched.
    /// A valve whose state is unknown is opened.
    pub fn toggle(current: &ValveStateVector, index: usize) -> Self {
        let next = match current.get(index) {
            Some(ValveState::Open) => ValveState::Closed,
            _ => ValveState::Open,
        };
        Self::unchanged().with(index, next)
    }

    /// Build pressure: toggles the inlet valve (valve 2).
    pub fn build_pressure(current: &ValveStateVector) -> Self {
        Self::toggle(current, 1)
    }

    /// Switch gas: toggles the gas switch valve (valve 1).
    pub fn switch_gas(current: &ValveStateVector) -> Self {
        Self::toggle(current, 0)
    }
}

impl Default for ValveStateVector {
    fn default() -> Self {
        Self::unchanged()
    }
}

impl fmt::Display for ValveStateVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, state) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", state.code())?;
        }
        f.write_str("]")
    }
}
