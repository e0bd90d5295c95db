//! Valve-controller link.
//!
//! Two periodic tasks run per connection: a heartbeat sender and a response
//! reader. The reader also evaluates the heartbeat watchdog on every tick, so
//! a silent device is detected even when no lines arrive. Transport, decoded
//! state and the reading ring all sit behind one mutex that is never held
//! across an await point.

use crate::error::LinkError;
use crate::event::{LinkEvent, EVENT_CAPACITY};
use crate::protocol::{encode_valve_states, ValveCommand, ValveResponse};
use crate::serial::DEFAULT_BAUD;
use crate::task::{stopped, TaskSet};
use bubble_core::transport::{Connector, Transport};
use bubble_core::{DeviceRole, LinkState, Reading, ReadingRing, TimeBase, ValveStateVector};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const ROLE: DeviceRole = DeviceRole::Valve;

#[derive(Clone, Debug)]
pub struct ValveLinkConfig {
    pub baud: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reader_tick: Duration,
    pub reading_capacity: usize,
    /// Upper bound on lines decoded per reader tick.
    pub max_lines_per_tick: usize,
}

impl Default for ValveLinkConfig {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            heartbeat_interval: Duration::from_millis(4_500),
            heartbeat_timeout: Duration::from_secs(5),
            reader_tick: Duration::from_millis(10),
            reading_capacity: bubble_core::READING_CAPACITY,
            max_lines_per_tick: 64,
        }
    }
}

#[derive(Clone, Default, Debug)]
pub struct ValveLinkStats {
    pub lines_decoded: u64,
    pub readings: u64,
    pub heartbeats_acked: u64,
    pub unknown_lines: u64,
    pub commands_written: u64,
    pub watchdog_trips: u64,
}

/// Copy of the link's state for presentation.
#[derive(Clone, Debug)]
pub struct ValveLinkSnapshot {
    pub state: LinkState,
    pub port: Option<String>,
    pub valve_states: ValveStateVector,
    pub latest_reading: Option<Reading>,
    pub sequence_loaded: bool,
    pub auto_mode: bool,
    pub stats: ValveLinkStats,
}

struct ValveInner {
    state: LinkState,
    port: Option<String>,
    transport: Option<Box<dyn Transport>>,
    last_heartbeat: Instant,
    readings: ReadingRing,
    valve_states: ValveStateVector,
    sequence_loaded: bool,
    auto_mode: bool,
    stats: ValveLinkStats,
}

impl ValveInner {
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.state != LinkState::Connected {
            return Err(LinkError::NotConnected(ROLE));
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or(LinkError::NotConnected(ROLE))?;
        match transport.write_bytes(bytes) {
            Ok(()) => {
                self.stats.commands_written += 1;
                Ok(())
            }
            Err(e) => {
                self.fault();
                Err(e.into())
            }
        }
    }

    fn fault(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.state = LinkState::Faulted;
    }

    /// Best-effort RESET, then close. Used by both explicit and watchdog
    /// disconnects.
    fn reset_and_close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if self.state == LinkState::Connected {
                if let Err(e) = transport.write_bytes(&[ValveCommand::Reset.code()]) {
                    warn!(error = %e, "Failed to send RESET before closing");
                }
            }
            transport.close();
        }
        self.state = LinkState::Disconnected;
        self.valve_states = ValveStateVector::unchanged();
        self.sequence_loaded = false;
        self.auto_mode = false;
    }

    fn dispatch(&mut self, line: &str, now: Instant, clock: &TimeBase) -> LinkEvent {
        self.stats.lines_decoded += 1;
        match ValveResponse::parse(line) {
            ValveResponse::HeartbeatAck => {
                self.last_heartbeat = now;
                self.stats.heartbeats_acked += 1;
                LinkEvent::HeartbeatAck
            }
            ValveResponse::Reading(frame) => {
                let reading = Reading {
                    unix_us: clock.unix_us(),
                    pressures: frame.pressures,
                    external_pressure: frame.external_pressure,
                    valves: frame.valves,
                };
                self.readings.push(reading);
                self.valve_states = frame.valves.overlay(&self.valve_states);
                self.stats.readings += 1;
                LinkEvent::Reading(reading)
            }
            ValveResponse::SequenceAck { loaded } => {
                info!(loaded, "Valve controller sequence acknowledgement");
                self.sequence_loaded = loaded;
                LinkEvent::SequenceAck { loaded }
            }
            ValveResponse::Log(message) => {
                info!(device = %ROLE, "{}", message);
                LinkEvent::DeviceLog {
                    role: ROLE,
                    message,
                }
            }
            ValveResponse::Unknown(line) => {
                warn!(line = %line, "Unknown response from valve controller");
                self.stats.unknown_lines += 1;
                LinkEvent::UnknownResponse { role: ROLE, line }
            }
        }
    }
}

struct ValveShared {
    config: ValveLinkConfig,
    clock: TimeBase,
    inner: Mutex<ValveInner>,
    events: broadcast::Sender<LinkEvent>,
}

impl ValveShared {
    fn lock(&self) -> MutexGuard<'_, ValveInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }
}

pub struct ValveLink {
    connector: Arc<dyn Connector>,
    shared: Arc<ValveShared>,
    tasks: Mutex<Option<TaskSet>>,
}

impl ValveLink {
    pub fn new(connector: Arc<dyn Connector>, config: ValveLinkConfig) -> Self {
        Self::with_clock(connector, config, TimeBase::new())
    }

    pub fn with_clock(
        connector: Arc<dyn Connector>,
        config: ValveLinkConfig,
        clock: TimeBase,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = ValveInner {
            state: LinkState::Disconnected,
            port: None,
            transport: None,
            last_heartbeat: Instant::now(),
            readings: ReadingRing::new(config.reading_capacity),
            valve_states: ValveStateVector::unchanged(),
            sequence_loaded: false,
            auto_mode: false,
            stats: ValveLinkStats::default(),
        };
        Self {
            connector,
            shared: Arc::new(ValveShared {
                config,
                clock,
                inner: Mutex::new(inner),
                events,
            }),
            tasks: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Opens the port and starts the heartbeat and reader tasks.
    pub async fn connect(&self, port: &str) -> Result<(), LinkError> {
        {
            let mut inner = self.shared.lock();
            if matches!(inner.state, LinkState::Connected | LinkState::Connecting) {
                return Err(LinkError::AlreadyConnected(ROLE));
            }
            inner.state = LinkState::Connecting;
        }

        // Reap tasks left behind by a watchdog or fault teardown.
        if let Some(stale) = self.take_tasks() {
            stale.stop().await;
        }

        let transport = match self.connector.open(port, self.shared.config.baud) {
            Ok(transport) => transport,
            Err(e) => {
                error!(port = %port, error = %e, "Failed to connect to valve controller");
                self.shared.lock().state = LinkState::Disconnected;
                return Err(e.into());
            }
        };

        {
            let mut inner = self.shared.lock();
            inner.transport = Some(transport);
            inner.port = Some(port.to_string());
            inner.last_heartbeat = Instant::now();
            inner.readings.clear();
            inner.state = LinkState::Connected;
        }

        let mut tasks = TaskSet::new("valve-link");
        tasks.spawn(heartbeat_loop(
            Arc::clone(&self.shared),
            tasks.shutdown_signal(),
        ));
        tasks.spawn(reader_loop(Arc::clone(&self.shared), tasks.shutdown_signal()));
        *self.lock_tasks() = Some(tasks);

        info!(port = %port, baud = self.shared.config.baud, "Connected to valve controller");
        self.shared.emit(LinkEvent::Connected(ROLE));
        Ok(())
    }

    /// Sends RESET, closes the port and stops both tasks. Safe to call more
    /// than once and from any task other than the link's own.
    pub async fn disconnect(&self) {
        let tasks = self.take_tasks();

        let was = {
            let mut inner = self.shared.lock();
            let was = inner.state;
            inner.reset_and_close();
            was
        };

        if let Some(tasks) = tasks {
            tasks.stop().await;
        }

        if was != LinkState::Disconnected {
            info!("Disconnected from valve controller");
            self.shared.emit(LinkEvent::Disconnected(ROLE));
        }
    }

    /// Looks up a command by its symbolic name and sends it.
    pub fn send_command(&self, name: &str) -> Result<(), LinkError> {
        let command: ValveCommand = name.parse()?;
        self.send(command)
    }

    pub fn send(&self, command: ValveCommand) -> Result<(), LinkError> {
        let result = {
            let mut inner = self.shared.lock();
            let result = inner.write(&[command.code()]);
            if result.is_ok() {
                match command {
                    ValveCommand::SwitchToAutoControl => inner.auto_mode = true,
                    ValveCommand::SwitchToManual | ValveCommand::Reset => inner.auto_mode = false,
                    _ => {}
                }
            }
            result
        };
        self.report(command.name(), result)
    }

    /// Applies a valve vector in one write. `Ignore` positions and the
    /// reserved positions 6-8 are not sent.
    pub fn set_valve_states(&self, vector: &ValveStateVector) -> Result<(), LinkError> {
        let bytes = encode_valve_states(vector);
        let result = {
            let mut inner = self.shared.lock();
            if inner.state != LinkState::Connected {
                Err(LinkError::NotConnected(ROLE))
            } else if bytes.is_empty() {
                Ok(())
            } else {
                inner.write(&bytes)
            }
        };
        if result.is_ok() {
            debug!(valves = %vector, "Applied valve states");
        }
        self.report("set_valve_states", result)
    }

    /// Closes every driven valve, then sends RESET.
    pub fn reset_valves(&self) -> Result<(), LinkError> {
        self.set_valve_states(&ValveStateVector::all_closed())?;
        self.send(ValveCommand::Reset)
    }

    /// Uploads a sequence for the firmware to run itself. Only accepted in
    /// automatic mode; the device answers with a `SEQ:` line.
    pub fn send_sequence(&self, tokens: &str) -> Result<(), LinkError> {
        let result = {
            let mut inner = self.shared.lock();
            if inner.state != LinkState::Connected {
                Err(LinkError::NotConnected(ROLE))
            } else if !inner.auto_mode {
                Err(LinkError::NotInAutoMode)
            } else {
                let mut bytes = vec![ValveCommand::DecodeSequence.code()];
                bytes.extend_from_slice(tokens.trim().as_bytes());
                bytes.push(b'\n');
                inner.write(&bytes)
            }
        };
        self.report("send_sequence", result)
    }

    fn report(&self, what: &str, result: Result<(), LinkError>) -> Result<(), LinkError> {
        if let Err(LinkError::Transport(e)) = &result {
            error!(command = what, error = %e, "Valve controller write failed");
            self.shared.emit(LinkEvent::Faulted {
                role: ROLE,
                error: e.to_string(),
            });
        }
        result
    }

    pub fn state(&self) -> LinkState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// State re-derived from heartbeat freshness. A link that still claims
    /// `Connected` but whose last acknowledgement is too old reads as
    /// `Faulted`.
    pub fn live_state(&self) -> LinkState {
        let inner = self.shared.lock();
        if inner.state == LinkState::Connected
            && inner.last_heartbeat.elapsed() > self.shared.config.heartbeat_timeout
        {
            LinkState::Faulted
        } else {
            inner.state
        }
    }

    /// Latest decoded valve states; not a hardware poll.
    pub fn valve_states(&self) -> ValveStateVector {
        self.shared.lock().valve_states
    }

    pub fn recent_readings(&self) -> Vec<Reading> {
        self.shared.lock().readings.snapshot()
    }

    pub fn latest_reading(&self) -> Option<Reading> {
        self.shared.lock().readings.latest().copied()
    }

    pub fn sequence_loaded(&self) -> bool {
        self.shared.lock().sequence_loaded
    }

    pub fn snapshot(&self) -> ValveLinkSnapshot {
        let inner = self.shared.lock();
        ValveLinkSnapshot {
            state: inner.state,
            port: inner.port.clone(),
            valve_states: inner.valve_states,
            latest_reading: inner.readings.latest().copied(),
            sequence_loaded: inner.sequence_loaded,
            auto_mode: inner.auto_mode,
            stats: inner.stats.clone(),
        }
    }

    pub fn config(&self) -> &ValveLinkConfig {
        &self.shared.config
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Option<TaskSet>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_tasks(&self) -> Option<TaskSet> {
        self.lock_tasks().take()
    }
}

async fn heartbeat_loop(shared: Arc<ValveShared>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped(&mut shutdown) => break,
        }

        let result = {
            let mut inner = shared.lock();
            if inner.state != LinkState::Connected {
                break;
            }
            inner.write(&[ValveCommand::Heartbeat.code()])
        };

        match result {
            Ok(()) => debug!("Sent heartbeat"),
            Err(e) => {
                error!(error = %e, "Failed to send heartbeat");
                shared.emit(LinkEvent::Faulted {
                    role: ROLE,
                    error: e.to_string(),
                });
                break;
            }
        }
    }
}

async fn reader_loop(shared: Arc<ValveShared>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.reader_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped(&mut shutdown) => break,
        }

        let now = Instant::now();
        let mut events = Vec::new();
        let mut finished = false;
        {
            let mut inner = shared.lock();
            if inner.state != LinkState::Connected {
                break;
            }

            for _ in 0..shared.config.max_lines_per_tick {
                let polled = match inner.transport.as_mut() {
                    Some(transport) => transport.read_line(Duration::ZERO),
                    None => break,
                };
                match polled {
                    Ok(Some(line)) => {
                        debug!(line = %line, "Valve controller line");
                        events.push(inner.dispatch(&line, now, &shared.clock));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to read from valve controller");
                        inner.fault();
                        events.push(LinkEvent::Faulted {
                            role: ROLE,
                            error: e.to_string(),
                        });
                        finished = true;
                        break;
                    }
                }
            }

            if !finished {
                let silent_for = now.saturating_duration_since(inner.last_heartbeat);
                if silent_for > shared.config.heartbeat_timeout {
                    error!(
                        silent_ms = silent_for.as_millis() as u64,
                        "No heartbeat from valve controller, disconnecting"
                    );
                    inner.stats.watchdog_trips += 1;
                    inner.reset_and_close();
                    events.push(LinkEvent::LinkLost {
                        role: ROLE,
                        reason: format!("no heartbeat for {} ms", silent_for.as_millis()),
                    });
                    events.push(LinkEvent::Disconnected(ROLE));
                    finished = true;
                }
            }
        }

        for event in events {
            shared.emit(event);
        }
        if finished {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bubble_core::{SimulatedValveController, WireEvent};

    fn link_with(sim: &SimulatedValveController) -> ValveLink {
        ValveLink::new(Arc::new(sim.clone()), ValveLinkConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn commands_require_connection() {
        let sim = SimulatedValveController::new();
        let link = link_with(&sim);
        assert!(matches!(
            link.send(ValveCommand::Reset),
            Err(LinkError::NotConnected(DeviceRole::Valve))
        ));
        assert!(matches!(
            link.set_valve_states(&ValveStateVector::all_closed()),
            Err(LinkError::NotConnected(_))
        ));
        assert!(sim.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_command_name_is_rejected() {
        let sim = SimulatedValveController::new();
        let link = link_with(&sim);
        link.connect("SIM").await.unwrap();
        assert!(matches!(
            link.send_command("OPEN_EVERYTHING"),
            Err(LinkError::UnknownCommand(_))
        ));
        link.send_command("TURN_ON_SHORT_VALVE").unwrap();
        assert!(sim.written().contains(&b'Z'));
        link.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let sim = SimulatedValveController::new();
        let link = link_with(&sim);
        link.connect("SIM").await.unwrap();
        link.disconnect().await;
        link.disconnect().await;
        assert_eq!(link.state(), LinkState::Disconnected);
        let closes = sim
            .wire_log()
            .iter()
            .filter(|e| **e == WireEvent::Close)
            .count();
        assert_eq!(closes, 1);
        assert_eq!(sim.written().last(), Some(&b's'));
    }
}
