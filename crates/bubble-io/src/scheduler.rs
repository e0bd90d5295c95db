//! Drives a `SequenceRunner` on a fixed tick against the live links.

use crate::motor_link::MotorLink;
use crate::task::{stopped, TaskSet};
use crate::valve_link::ValveLink;
use bubble_core::{
    AbortReason, Readiness, RunnerEvent, RunnerState, SchedulerConfig, Sequence, SequenceRunner,
    StartError, Step, StepCommand,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Started {
        steps: usize,
        total_ms: u64,
        requires_motor: bool,
        save_path: Option<String>,
    },
    StepStarted {
        index: usize,
        step: Step,
    },
    Completed,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub state: RunnerState,
    pub current_step: Option<Step>,
    pub steps_remaining: usize,
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
}

struct SchedulerShared {
    valve: Arc<ValveLink>,
    motor: Option<Arc<MotorLink>>,
    runner: Mutex<SequenceRunner>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerShared {
    fn runner(&self) -> MutexGuard<'_, SequenceRunner> {
        self.runner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn readiness(&self) -> Readiness {
        let (motor_connected, motor_calibrated) = match &self.motor {
            Some(motor) => {
                let status = motor.status();
                (
                    status.state.is_connected(),
                    status.calibration == bubble_core::CalibrationState::Calibrated,
                )
            }
            None => (false, false),
        };
        Readiness {
            valve_connected: self.valve.is_connected(),
            motor_connected,
            motor_calibrated,
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    /// Valve pattern first, then the motor target.
    async fn push(&self, command: StepCommand) {
        if let Err(e) = self.valve.set_valve_states(&command.valves) {
            error!(step = %command.step.step_type, error = %e, "Failed to apply step valve states");
        }
        if let (Some(target), Some(motor)) = (command.motor_target, &self.motor) {
            if let Err(e) = motor.move_to_position(target).await {
                error!(step = %command.step.step_type, target, error = %e, "Failed to move motor for step");
            }
        }
    }

    fn report(&self, event: RunnerEvent) -> bool {
        match event {
            RunnerEvent::StepStarted { index, step } => {
                info!(
                    index,
                    step = %step.step_type,
                    duration_ms = step.duration_ms,
                    "Step started"
                );
                self.emit(SchedulerEvent::StepStarted { index, step });
                false
            }
            RunnerEvent::Completed => {
                info!("Sequence complete");
                self.emit(SchedulerEvent::Completed);
                true
            }
            RunnerEvent::Aborted(reason) => {
                error!(reason = reason.as_str(), "Sequence aborted");
                self.emit(SchedulerEvent::Aborted(reason));
                true
            }
        }
    }
}

pub struct SequenceScheduler {
    shared: Arc<SchedulerShared>,
    tick: Duration,
    task: Mutex<Option<TaskSet>>,
}

impl SequenceScheduler {
    pub fn new(
        valve: Arc<ValveLink>,
        motor: Option<Arc<MotorLink>>,
        config: SchedulerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let tick = config.tick;
        Self {
            shared: Arc::new(SchedulerShared {
                valve,
                motor,
                runner: Mutex::new(SequenceRunner::new(config)),
                events,
            }),
            tick,
            task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    /// Applies the first step immediately and starts ticking.
    pub async fn start(&self, sequence: Sequence) -> Result<(), StartError> {
        let announce = SchedulerEvent::Started {
            steps: sequence.len(),
            total_ms: sequence.total_duration_ms,
            requires_motor: sequence.requires_motor,
            save_path: sequence.save_path.clone(),
        };

        let readiness = self.shared.readiness();
        let first = {
            // Explicit scope: the guard must drop before the awaits below.
            let mut runner = self.shared.runner();
            runner.start(sequence, Instant::now().into_std(), readiness)?
        };

        // A previous run's task has already exited on its own.
        if let Some(previous) = self.take_task() {
            previous.stop().await;
        }

        info!(
            step = %first.step.step_type,
            duration_ms = first.step.duration_ms,
            "Sequence started"
        );
        self.shared.emit(announce);
        self.shared.push(first).await;

        let mut task = TaskSet::new("scheduler");
        task.spawn(tick_loop(
            Arc::clone(&self.shared),
            self.tick,
            task.shutdown_signal(),
        ));
        *self.lock_task() = Some(task);
        Ok(())
    }

    /// Stops the running sequence without touching the valves. Must not be
    /// called from a scheduler event handler running on the tick task.
    pub async fn abort(&self) {
        let event = self.shared.runner().abort();
        if let Some(task) = self.take_task() {
            task.stop().await;
        }
        if let Some(event) = event {
            self.shared.report(event);
        }
    }

    /// Aborts at once when a link the running sequence needs has gone.
    pub fn link_lost(&self) {
        let readiness = self.shared.readiness();
        let event = self.shared.runner().check_links(readiness);
        if let Some(event) = event {
            warn!("Link lost during sequence");
            self.shared.report(event);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.runner().is_running()
    }

    pub fn status(&self) -> SchedulerStatus {
        let runner = self.shared.runner();
        SchedulerStatus {
            state: runner.state(),
            current_step: runner.current_step(),
            steps_remaining: runner.steps_remaining(),
            elapsed_ms: runner.elapsed().as_millis() as u64,
            remaining_ms: runner.remaining().as_millis() as u64,
        }
    }

    pub async fn shutdown(&self) {
        self.abort().await;
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<TaskSet>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_task(&self) -> Option<TaskSet> {
        self.lock_task().take()
    }
}

async fn tick_loop(
    shared: Arc<SchedulerShared>,
    tick: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped(&mut shutdown) => break,
        }

        let readiness = shared.readiness();
        let outcome = shared
            .runner()
            .tick(Instant::now().into_std(), readiness);

        if let Some(command) = outcome.command {
            shared.push(command).await;
        }
        if let Some(event) = outcome.event {
            if shared.report(event) {
                break;
            }
        }
        if !shared.runner().is_running() {
            break;
        }
    }
}
