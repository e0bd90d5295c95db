//! Motor-controller link.
//!
//! Every exchange with the motor is a request followed by at most one reply,
//! so the transport lives behind an async mutex held for the whole exchange.
//! That keeps exactly one command outstanding on the port. Status for
//! presentation is published into a separate snapshot that is only written
//! while the exchange lock is held.

use crate::error::LinkError;
use crate::event::{LinkEvent, EVENT_CAPACITY};
use crate::protocol::{MotorCommand, MotorResponse};
use crate::serial::DEFAULT_BAUD;
use crate::task::{stopped, TaskSet};
use bubble_core::transport::{Connector, Transport};
use bubble_core::{CalibrationState, DeviceRole, LinkState};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const ROLE: DeviceRole = DeviceRole::Motor;

/// Fixed lead-screw ratio.
pub const STEPS_PER_MM: i64 = 6400;

pub fn steps_to_mm(steps: i64) -> f64 {
    steps as f64 / STEPS_PER_MM as f64
}

pub fn mm_to_steps(mm: f64) -> i64 {
    (mm * STEPS_PER_MM as f64).round() as i64
}

#[derive(Clone, Debug)]
pub struct MotorLinkConfig {
    pub baud: u32,
    pub poll_interval: Duration,
    pub response_timeout: Duration,
}

impl Default for MotorLinkConfig {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            poll_interval: Duration::from_millis(10),
            response_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MotorStatus {
    pub state: LinkState,
    pub calibration: CalibrationState,
    pub port: Option<String>,
    pub top_position: Option<i64>,
    pub current_position: Option<i64>,
    /// Depth below the calibrated top, in millimetres.
    pub position_mm: Option<f64>,
}

impl MotorStatus {
    pub fn is_ready(&self) -> bool {
        self.state.is_connected() && self.calibration == CalibrationState::Calibrated
    }
}

struct MotorInner {
    transport: Option<Box<dyn Transport>>,
}

struct MotorShared {
    config: MotorLinkConfig,
    inner: AsyncMutex<MotorInner>,
    status: RwLock<MotorStatus>,
    events: broadcast::Sender<LinkEvent>,
}

impl MotorShared {
    fn status(&self) -> MotorStatus {
        self.status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update_status(&self, f: impl FnOnce(&mut MotorStatus)) {
        let mut status = self
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut status);
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Checks connection and, if asked, calibration before anything is
    /// written.
    fn require(&self, inner: &MotorInner, calibrated: bool) -> Result<(), LinkError> {
        let status = self.status();
        if !status.state.is_connected() || inner.transport.is_none() {
            return Err(LinkError::NotConnected(ROLE));
        }
        if calibrated && status.calibration != CalibrationState::Calibrated {
            return Err(LinkError::NotCalibrated);
        }
        Ok(())
    }

    /// Writes one command and, when the command has a reply, waits for it.
    /// Device log lines and stray lines are skipped while waiting.
    async fn exchange(
        &self,
        inner: &mut MotorInner,
        command: MotorCommand,
    ) -> Result<Option<MotorResponse>, LinkError> {
        let transport = inner
            .transport
            .as_mut()
            .ok_or(LinkError::NotConnected(ROLE))?;
        transport.write_bytes(&command.encode())?;
        if !command.expects_reply() {
            return Ok(None);
        }

        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            match transport.read_line(Duration::ZERO)? {
                Some(line) => match MotorResponse::parse(&line) {
                    MotorResponse::Log(message) => {
                        debug!(device = %ROLE, "{}", message);
                    }
                    MotorResponse::Unknown(line) => {
                        warn!(line = %line, "Unknown response from motor controller");
                        self.emit(LinkEvent::UnknownResponse { role: ROLE, line });
                    }
                    MotorResponse::HeartbeatAck if command != MotorCommand::Heartbeat => {}
                    response => return Ok(Some(response)),
                },
                None => {
                    if Instant::now() >= deadline {
                        return Err(LinkError::Timeout {
                            role: ROLE,
                            timeout: self.config.response_timeout,
                        });
                    }
                    sleep(Duration::from_millis(1)).await;
                }
            }
        }
    }

    /// Runs an exchange; fatal failures fault the link.
    async fn checked_exchange(
        &self,
        inner: &mut MotorInner,
        command: MotorCommand,
    ) -> Result<Option<MotorResponse>, LinkError> {
        let result = self.exchange(inner, command).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(command = ?command, error = %e, "Motor controller exchange failed");
                self.fault(inner, e);
            }
        }
        result
    }

    fn fault(&self, inner: &mut MotorInner, error: &LinkError) {
        if let Some(mut transport) = inner.transport.take() {
            transport.close();
        }
        self.update_status(|status| {
            status.state = LinkState::Faulted;
            status.calibration = CalibrationState::Uncalibrated;
            status.top_position = None;
        });
        self.emit(LinkEvent::Faulted {
            role: ROLE,
            error: error.to_string(),
        });
    }

    /// Best-effort stop, then close and forget calibration.
    fn reset_inner(&self, inner: &mut MotorInner) -> LinkState {
        let was = self.status().state;
        if let Some(mut transport) = inner.transport.take() {
            if was.is_connected() {
                if let Err(e) = transport.write_bytes(&MotorCommand::Stop.encode()) {
                    warn!(error = %e, "Failed to stop motor before closing");
                }
            }
            transport.close();
        }
        self.update_status(|status| {
            *status = MotorStatus::default();
        });
        was
    }

    async fn query_calibrated(&self, inner: &mut MotorInner) -> Result<bool, LinkError> {
        match self.checked_exchange(inner, MotorCommand::Status).await? {
            Some(MotorResponse::Calibration(flag)) => {
                self.record_calibration(flag);
                Ok(flag)
            }
            other => Err(invalid(other)),
        }
    }

    fn record_calibration(&self, calibrated: bool) {
        let previous = self.status().calibration;
        let next = match (calibrated, previous) {
            (true, _) => CalibrationState::Calibrated,
            (false, CalibrationState::Calibrating) => CalibrationState::Calibrating,
            (false, _) => CalibrationState::Uncalibrated,
        };
        if next != previous {
            info!(from = ?previous, to = ?next, "Motor calibration state changed");
            self.update_status(|status| {
                status.calibration = next;
                if next != CalibrationState::Calibrated {
                    status.top_position = None;
                }
            });
            self.emit(LinkEvent::Calibration(next));
        }
    }

    async fn query_top(&self, inner: &mut MotorInner) -> Result<i64, LinkError> {
        if let Some(top) = self.status().top_position {
            return Ok(top);
        }
        match self.checked_exchange(inner, MotorCommand::TopPosition).await? {
            Some(MotorResponse::TopPosition(top)) => {
                info!(top_steps = top, "Motor top position recorded");
                self.update_status(|status| status.top_position = Some(top));
                Ok(top)
            }
            other => Err(invalid(other)),
        }
    }

    async fn query_position(&self, inner: &mut MotorInner) -> Result<i64, LinkError> {
        match self
            .checked_exchange(inner, MotorCommand::CurrentPosition)
            .await?
        {
            Some(MotorResponse::Position(steps)) => {
                let status = self.status();
                let mm = status.top_position.map(|top| steps_to_mm(top - steps));
                if status.current_position != Some(steps) {
                    self.update_status(|status| {
                        status.current_position = Some(steps);
                        status.position_mm = mm;
                    });
                    if let Some(mm) = mm {
                        self.emit(LinkEvent::Position { steps, mm });
                    }
                }
                Ok(steps)
            }
            other => Err(invalid(other)),
        }
    }

    async fn poll_once(&self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().await;
        if inner.transport.is_none() || !self.status().state.is_connected() {
            return Err(LinkError::NotConnected(ROLE));
        }
        if self.query_calibrated(&mut inner).await? {
            self.query_top(&mut inner).await?;
            self.query_position(&mut inner).await?;
        }
        Ok(())
    }
}

fn invalid(response: Option<MotorResponse>) -> LinkError {
    LinkError::InvalidResponse {
        role: ROLE,
        line: response.map(|r| format!("{r:?}")).unwrap_or_default(),
    }
}

pub struct MotorLink {
    connector: Arc<dyn Connector>,
    shared: Arc<MotorShared>,
    tasks: Mutex<Option<TaskSet>>,
}

impl MotorLink {
    pub fn new(connector: Arc<dyn Connector>, config: MotorLinkConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector,
            shared: Arc::new(MotorShared {
                config,
                inner: AsyncMutex::new(MotorInner { transport: None }),
                status: RwLock::new(MotorStatus::default()),
                events,
            }),
            tasks: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Opens the port, starts the motor and begins polling calibration and
    /// position.
    pub async fn connect(&self, port: &str) -> Result<(), LinkError> {
        if matches!(
            self.shared.status().state,
            LinkState::Connected | LinkState::Connecting
        ) {
            return Err(LinkError::AlreadyConnected(ROLE));
        }
        // Reap a poll task that stopped itself after a fault.
        if let Some(stale) = self.take_tasks() {
            stale.stop().await;
        }

        let mut inner = self.shared.inner.lock().await;
        self.shared
            .update_status(|status| status.state = LinkState::Connecting);

        let transport = match self.connector.open(port, self.shared.config.baud) {
            Ok(transport) => transport,
            Err(e) => {
                error!(port = %port, error = %e, "Failed to connect to motor controller");
                self.shared
                    .update_status(|status| status.state = LinkState::Disconnected);
                return Err(e.into());
            }
        };
        inner.transport = Some(transport);
        self.shared.update_status(|status| {
            status.state = LinkState::Connected;
            status.port = Some(port.to_string());
        });

        if let Err(e) = self
            .shared
            .checked_exchange(&mut inner, MotorCommand::Start)
            .await
        {
            self.shared.reset_inner(&mut inner);
            return Err(e);
        }
        drop(inner);

        let mut tasks = TaskSet::new("motor-link");
        tasks.spawn(poll_loop(Arc::clone(&self.shared), tasks.shutdown_signal()));
        *self.lock_tasks() = Some(tasks);

        info!(port = %port, "Connected to motor controller");
        self.shared.emit(LinkEvent::Connected(ROLE));
        Ok(())
    }

    /// Stops the motor, closes the port, forgets calibration and joins the
    /// poll task. Idempotent.
    pub async fn reset(&self) {
        if let Some(tasks) = self.take_tasks() {
            tasks.stop().await;
        }
        let was = {
            let mut inner = self.shared.inner.lock().await;
            self.shared.reset_inner(&mut inner)
        };
        if was != LinkState::Disconnected {
            info!("Disconnected from motor controller");
            self.shared.emit(LinkEvent::Disconnected(ROLE));
        }
    }

    pub async fn disconnect(&self) {
        self.reset().await;
    }

    /// Starts homing. Clears the cached top position.
    pub async fn calibrate(&self) -> Result<(), LinkError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.require(&inner, false)?;
        self.shared.update_status(|status| {
            status.calibration = CalibrationState::Calibrating;
            status.top_position = None;
        });
        self.shared.emit(LinkEvent::Calibration(CalibrationState::Calibrating));
        self.shared
            .checked_exchange(&mut inner, MotorCommand::Calibrate)
            .await?;
        info!("Motor calibration started");
        Ok(())
    }

    pub async fn check_calibrated(&self) -> Result<bool, LinkError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.require(&inner, false)?;
        self.shared.query_calibrated(&mut inner).await
    }

    /// Steps at the calibrated top. Cached after the first read.
    pub async fn get_top_position(&self) -> Result<i64, LinkError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.require(&inner, true)?;
        self.shared.query_top(&mut inner).await
    }

    pub async fn get_current_position(&self) -> Result<i64, LinkError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.require(&inner, true)?;
        self.shared.query_position(&mut inner).await
    }

    pub async fn move_to_position(&self, steps: i64) -> Result<(), LinkError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.require(&inner, true)?;
        self.shared
            .checked_exchange(&mut inner, MotorCommand::MoveTo(steps))
            .await?;
        debug!(steps, "Motor move requested");
        Ok(())
    }

    pub async fn move_to_target(&self, mm: f64) -> Result<(), LinkError> {
        self.move_to_position(mm_to_steps(mm)).await
    }

    pub async fn ascent(&self) -> Result<(), LinkError> {
        self.simple(MotorCommand::Ascent).await
    }

    pub async fn to_top(&self) -> Result<(), LinkError> {
        self.simple(MotorCommand::ToTop).await
    }

    async fn simple(&self, command: MotorCommand) -> Result<(), LinkError> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.require(&inner, true)?;
        self.shared.checked_exchange(&mut inner, command).await?;
        Ok(())
    }

    pub fn status(&self) -> MotorStatus {
        self.shared.status()
    }

    pub fn state(&self) -> LinkState {
        self.shared.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_calibrated(&self) -> bool {
        self.shared.status().calibration == CalibrationState::Calibrated
    }

    pub fn is_ready(&self) -> bool {
        self.shared.status().is_ready()
    }

    pub fn position_mm(&self) -> Option<f64> {
        self.shared.status().position_mm
    }

    pub fn config(&self) -> &MotorLinkConfig {
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

async fn poll_loop(shared: Arc<MotorShared>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped(&mut shutdown) => break,
        }

        if let Err(e) = shared.poll_once().await {
            if matches!(e, LinkError::NotConnected(_)) {
                break;
            }
            error!(error = %e, "Motor poll failed, resetting motor link");
            let mut inner = shared.inner.lock().await;
            shared.reset_inner(&mut inner);
            drop(inner);
            shared.emit(LinkEvent::LinkLost {
                role: ROLE,
                reason: e.to_string(),
            });
            shared.emit(LinkEvent::Disconnected(ROLE));
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bubble_core::SimulatedMotorController;

    fn link_with(sim: &SimulatedMotorController) -> MotorLink {
        MotorLink::new(Arc::new(sim.clone()), MotorLinkConfig::default())
    }

    #[test]
    fn converts_between_mm_and_steps() {
        assert_eq!(mm_to_steps(1.0), 6400);
        assert_eq!(mm_to_steps(-0.5), -3200);
        assert!((steps_to_mm(64_000) - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn not_connected_before_connect() {
        let sim = SimulatedMotorController::new();
        let link = link_with(&sim);
        assert!(matches!(
            link.calibrate().await,
            Err(LinkError::NotConnected(DeviceRole::Motor))
        ));
        assert!(matches!(
            link.move_to_position(100).await,
            Err(LinkError::NotConnected(_))
        ));
        assert!(sim.written().is_empty());
    }
}
