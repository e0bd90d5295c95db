use crate::valve::ValveStateVector;
use serde::Serialize;
use std::collections::VecDeque;

/// Default number of readings retained per valve link.
pub const READING_CAPACITY: usize = 10;

const SENSOR_OFFSET: f64 = 203.53;
const SENSOR_GAIN: f64 = 0.8248;

/// Converts a raw transducer value to bar.
pub fn raw_to_bar(raw: f64) -> f64 {
    (raw - SENSOR_OFFSET) / SENSOR_GAIN / 100.0
}

/// One decoded pressure frame. Valves the firmware did not report are `Ignore`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub unix_us: u64,
    pub pressures: [f64; 3],
    /// Fourth transducer, only on firmware that reports it.
    pub external_pressure: Option<f64>,
    pub valves: ValveStateVector,
}

impl Reading {
    pub fn calibrated(&self) -> [f64; 3] {
        self.pressures.map(raw_to_bar)
    }

    pub fn calibrated_external(&self) -> Option<f64> {
        self.external_pressure.map(raw_to_bar)
    }
}

/// Fixed-capacity FIFO of the most recent readings.
#[derive(Debug, Clone)]
pub struct ReadingRing {
    readings: VecDeque<Reading>,
    capacity: usize,
}

impl ReadingRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            readings: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a reading, evicting the oldest when full.
    pub fn push(&mut self, reading: Reading) {
        if self.readings.len() == self.capacity {
            self.readings.pop_front();
        }
        self.readings.push_back(reading);
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.readings.back()
    }

    /// Copy of the buffered readings, oldest first.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.readings.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.readings.clear();
    }
}

impl Default for ReadingRing {
    fn default() -> Self {
        Self::new(READING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(n: u64) -> Reading {
        Reading {
            unix_us: n,
            pressures: [n as f64, 0.0, 0.0],
            external_pressure: None,
            valves: ValveStateVector::unchanged(),
        }
    }

    #[test]
    fn ring_keeps_latest_ten_in_arrival_order() {
        let mut ring = ReadingRing::default();
        for n in 1..=15 {
            ring.push(reading(n));
        }
        assert_eq!(ring.len(), 10);
        let order: Vec<u64> = ring.snapshot().iter().map(|r| r.unix_us).collect();
        assert_eq!(order, (6..=15).collect::<Vec<_>>());
        assert_eq!(ring.latest().map(|r| r.unix_us), Some(15));
    }

    #[test]
    fn calibration_is_linear() {
        assert!(raw_to_bar(203.53).abs() < 1e-12);
        let one_bar = 203.53 + 82.48;
        assert!((raw_to_bar(one_bar) - 1.0).abs() < 1e-9);
    }
}
