//! In-process stand-ins for the valve and motor microcontrollers.
//!
//! Each simulator is a cheap clonable handle: one clone is handed to a link
//! as its transport, another stays with the caller to inspect the wire log or
//! inject faults.

use crate::transport::{Connector, Transport, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Steps between the motor's home and calibrated top position.
pub const SIM_TOP_POSITION: i64 = 64_000;

const FRAME_INTERVAL: Duration = Duration::from_millis(100);
const ATMOSPHERE_RAW: f64 = 285.0;
const SUPPLY_RAW: f64 = 1_030.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Write(Vec<u8>),
    Close,
}

#[derive(Debug, Default)]
struct Faults {
    fail_open: bool,
    fail_io: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn io_fault() -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "simulated device fault",
    ))
}

// ============================================================================
// Valve controller
// ============================================================================

#[derive(Debug)]
struct ValveSim {
    valves: [u8; 5],
    pressures: [f64; 3],
    outbound: VecDeque<String>,
    wire: Vec<WireEvent>,
    answer_heartbeats: bool,
    pressure_log: bool,
    auto_mode: bool,
    sequence_upload: Option<String>,
    last_frame: Option<Instant>,
    closed: bool,
    faults: Faults,
}

#[derive(Debug, Clone)]
pub struct SimulatedValveController {
    shared: Arc<Mutex<ValveSim>>,
}

impl SimulatedValveController {
    pub fn new() -> Self {
        let mut sim = ValveSim {
            valves: [0; 5],
            pressures: [ATMOSPHERE_RAW; 3],
            outbound: VecDeque::new(),
            wire: Vec::new(),
            answer_heartbeats: true,
            pressure_log: false,
            auto_mode: false,
            sequence_upload: None,
            last_frame: None,
            closed: false,
            faults: Faults::default(),
        };
        sim.outbound.push_back("HEARTBEAT_ACK".to_string());
        Self {
            shared: Arc::new(Mutex::new(sim)),
        }
    }

    pub fn set_answer_heartbeats(&self, answer: bool) {
        lock(&self.shared).answer_heartbeats = answer;
    }

    pub fn set_fail_io(&self, fail: bool) {
        lock(&self.shared).faults.fail_io = fail;
    }

    pub fn set_fail_open(&self, fail: bool) {
        lock(&self.shared).faults.fail_open = fail;
    }

    /// Queues a raw line as if the firmware had printed it.
    pub fn push_line(&self, line: &str) {
        lock(&self.shared).outbound.push_back(line.to_string());
    }

    pub fn emit_frame(&self) {
        let mut sim = lock(&self.shared);
        let frame = sim.frame();
        sim.outbound.push_back(frame);
    }

    pub fn valves(&self) -> [u8; 5] {
        lock(&self.shared).valves
    }

    pub fn wire_log(&self) -> Vec<WireEvent> {
        lock(&self.shared).wire.clone()
    }

    /// Every byte written since the simulator was created.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.shared)
            .wire
            .iter()
            .filter_map(|event| match event {
                WireEvent::Write(bytes) => Some(bytes.clone()),
                WireEvent::Close => None,
            })
            .flatten()
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared).closed
    }

    pub fn is_auto_mode(&self) -> bool {
        lock(&self.shared).auto_mode
    }
}

impl Default for SimulatedValveController {
    fn default() -> Self {
        Self::new()
    }
}

impl ValveSim {
    fn frame(&self) -> String {
        let mut frame = String::from("P");
        for p in self.pressures {
            frame.push_str(&format!(" {p:.2}"));
        }
        for v in self.valves {
            frame.push_str(&format!(" {v}"));
        }
        frame.push_str(" 0 0 0 C");
        frame
    }

    fn set_valve(&mut self, index: usize, open: bool) {
        if self.auto_mode {
            self.outbound
                .push_back("LOG: valve command ignored in auto mode".to_string());
            return;
        }
        self.valves[index] = u8::from(open);
        let frame = self.frame();
        self.outbound.push_back(frame);
    }

    fn settle_pressures(&mut self) {
        let inlet_open = self.valves[1] == 1;
        let vented = self.valves[3] == 1 || self.valves[4] == 1;
        let target = if inlet_open {
            SUPPLY_RAW
        } else if vented {
            ATMOSPHERE_RAW
        } else {
            self.pressures[0]
        };
        for p in self.pressures.iter_mut() {
            *p += (target - *p) * 0.1;
        }
    }

    fn apply(&mut self, byte: u8) {
        if let Some(upload) = self.sequence_upload.as_mut() {
            if byte == b'\n' {
                let accepted = !upload.is_empty() && self.auto_mode;
                self.sequence_upload = None;
                self.outbound.push_back(format!(
                    "SEQ: {}",
                    if accepted { "True" } else { "False" }
                ));
            } else {
                upload.push(byte as char);
            }
            return;
        }

        match byte {
            b'y' => {
                if self.answer_heartbeats {
                    self.outbound.push_back("HEARTBEAT_ACK".to_string());
                }
            }
            b'H' | b'h' => self.set_valve(0, byte.is_ascii_uppercase()),
            b'C' | b'c' => self.set_valve(1, byte.is_ascii_uppercase()),
            b'V' | b'v' => self.set_valve(2, byte.is_ascii_uppercase()),
            b'X' | b'x' => self.set_valve(3, byte.is_ascii_uppercase()),
            b'Z' | b'z' => self.set_valve(4, byte.is_ascii_uppercase()),
            b'K' => self.pressure_log = true,
            b'k' => self.pressure_log = false,
            b'M' => self.auto_mode = true,
            b'm' => self.auto_mode = false,
            b'T' | b't' | b'R' => {}
            b'i' => self.sequence_upload = Some(String::new()),
            b's' => {
                self.valves = [0; 5];
                self.auto_mode = false;
                self.outbound.push_back("LOG: RESET".to_string());
            }
            other => {
                self.outbound
                    .push_back(format!("LOG: unknown command {}", other as char));
            }
        }
    }
}

impl Transport for SimulatedValveController {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut sim = lock(&self.shared);
        if sim.faults.fail_io {
            return Err(io_fault());
        }
        if sim.closed {
            return Err(TransportError::Closed);
        }
        sim.wire.push(WireEvent::Write(bytes.to_vec()));
        for byte in bytes {
            sim.apply(*byte);
        }
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>, TransportError> {
        let mut sim = lock(&self.shared);
        if sim.faults.fail_io {
            return Err(io_fault());
        }
        if sim.closed {
            return Err(TransportError::Closed);
        }
        if sim.outbound.is_empty() && sim.pressure_log {
            let due = sim
                .last_frame
                .map_or(true, |last| last.elapsed() >= FRAME_INTERVAL);
            if due {
                sim.settle_pressures();
                sim.last_frame = Some(Instant::now());
                let frame = sim.frame();
                sim.outbound.push_back(frame);
            }
        }
        Ok(sim.outbound.pop_front())
    }

    fn close(&mut self) {
        let mut sim = lock(&self.shared);
        if !sim.closed {
            sim.closed = true;
            sim.wire.push(WireEvent::Close);
        }
    }
}

impl Connector for SimulatedValveController {
    fn open(&self, port: &str, _baud: u32) -> Result<Box<dyn Transport>, TransportError> {
        let mut sim = lock(&self.shared);
        if sim.faults.fail_open {
            return Err(TransportError::Open {
                port: port.to_string(),
                reason: "simulated open failure".to_string(),
            });
        }
        sim.closed = false;
        drop(sim);
        Ok(Box::new(self.clone()))
    }
}

// ============================================================================
// Motor controller
// ============================================================================

#[derive(Debug)]
struct MotorSim {
    started: bool,
    calibrated: bool,
    position: i64,
    outbound: VecDeque<String>,
    wire: Vec<WireEvent>,
    pending_move: Option<String>,
    silent: bool,
    closed: bool,
    faults: Faults,
}

#[derive(Debug, Clone)]
pub struct SimulatedMotorController {
    shared: Arc<Mutex<MotorSim>>,
}

impl SimulatedMotorController {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(MotorSim {
                started: false,
                calibrated: false,
                position: 0,
                outbound: VecDeque::new(),
                wire: Vec::new(),
                pending_move: None,
                silent: false,
                closed: false,
                faults: Faults::default(),
            })),
        }
    }

    /// A motor that has already been homed.
    pub fn calibrated() -> Self {
        let sim = Self::new();
        {
            let mut state = lock(&sim.shared);
            state.calibrated = true;
            state.position = SIM_TOP_POSITION;
        }
        sim
    }

    pub fn set_fail_io(&self, fail: bool) {
        lock(&self.shared).faults.fail_io = fail;
    }

    pub fn set_fail_open(&self, fail: bool) {
        lock(&self.shared).faults.fail_open = fail;
    }

    /// Stop replying to requests without failing the port.
    pub fn set_silent(&self, silent: bool) {
        lock(&self.shared).silent = silent;
    }

    pub fn position(&self) -> i64 {
        lock(&self.shared).position
    }

    pub fn is_started(&self) -> bool {
        lock(&self.shared).started
    }

    pub fn wire_log(&self) -> Vec<WireEvent> {
        lock(&self.shared).wire.clone()
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.shared)
            .wire
            .iter()
            .filter_map(|event| match event {
                WireEvent::Write(bytes) => Some(bytes.clone()),
                WireEvent::Close => None,
            })
            .flatten()
            .collect()
    }
}

impl Default for SimulatedMotorController {
    fn default() -> Self {
        Self::new()
    }
}

impl MotorSim {
    fn reply(&mut self, line: String) {
        if !self.silent {
            self.outbound.push_back(line);
        }
    }

    fn apply(&mut self, byte: u8) {
        if let Some(target) = self.pending_move.as_mut() {
            if byte == b'\n' {
                let parsed = target.parse::<i64>();
                self.pending_move = None;
                match parsed {
                    Ok(steps) if self.calibrated => self.position = steps,
                    Ok(_) => self.reply("LOG: move ignored, not calibrated".to_string()),
                    Err(_) => self.reply("LOG: bad move target".to_string()),
                }
            } else {
                target.push(byte as char);
            }
            return;
        }

        match byte {
            b'y' => self.reply("HEARTBEAT_ACK".to_string()),
            b'S' => self.started = true,
            b's' => self.started = false,
            b'c' => {
                self.calibrated = true;
                self.position = SIM_TOP_POSITION;
            }
            b't' => {
                let flag = u8::from(self.calibrated);
                self.reply(format!("CAL {flag}"));
            }
            b'o' => {
                let top = if self.calibrated { SIM_TOP_POSITION } else { 0 };
                self.reply(format!("TOP {top}"));
            }
            b'g' => {
                let position = self.position;
                self.reply(format!("POS {position}"));
            }
            b'p' => self.pending_move = Some(String::new()),
            b'u' => self.position = (self.position + 6_400).min(SIM_TOP_POSITION),
            b'U' => self.position = SIM_TOP_POSITION,
            other => self.reply(format!("LOG: unknown command {}", other as char)),
        }
    }
}

impl Transport for SimulatedMotorController {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut sim = lock(&self.shared);
        if sim.faults.fail_io {
            return Err(io_fault());
        }
        if sim.closed {
            return Err(TransportError::Closed);
        }
        sim.wire.push(WireEvent::Write(bytes.to_vec()));
        for byte in bytes {
            sim.apply(*byte);
        }
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>, TransportError> {
        let mut sim = lock(&self.shared);
        if sim.faults.fail_io {
            return Err(io_fault());
        }
        if sim.closed {
            return Err(TransportError::Closed);
        }
        Ok(sim.outbound.pop_front())
    }

    fn close(&mut self) {
        let mut sim = lock(&self.shared);
        if !sim.closed {
            sim.closed = true;
            sim.wire.push(WireEvent::Close);
        }
    }
}

impl Connector for SimulatedMotorController {
    fn open(&self, port: &str, _baud: u32) -> Result<Box<dyn Transport>, TransportError> {
        let mut sim = lock(&self.shared);
        if sim.faults.fail_open {
            return Err(TransportError::Open {
                port: port.to_string(),
                reason: "simulated open failure".to_string(),
            });
        }
        sim.closed = false;
        drop(sim);
        Ok(Box::new(self.clone()))
    }
}
