use crate::link::Readiness;
use crate::sequence::{Sequence, Step};
use crate::valve::ValveStateVector;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    #[default]
    Idle,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    ValveLinkDown,
    MotorNotReady,
    Requested,
}

impl AbortReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AbortReason::ValveLinkDown => "valve controller not connected",
            AbortReason::MotorNotReady => "motor not ready",
            AbortReason::Requested => "aborted by operator",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("a sequence is already running")]
    AlreadyRunning,
    #[error("sequence has no steps")]
    Empty,
    #[error("cannot start sequence: {}", .0.as_str())]
    NotReady(AbortReason),
}

/// What to push to the devices when a step begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCommand {
    pub step: Step,
    pub valves: ValveStateVector,
    pub motor_target: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerEvent {
    StepStarted { index: usize, step: Step },
    Completed,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub command: Option<StepCommand>,
    pub event: Option<RunnerEvent>,
}

#[derive(Clone, Default, Debug)]
pub struct RunnerStats {
    pub ticks: u64,
    pub steps_started: u64,
    pub sequences_completed: u64,
    pub sequences_aborted: u64,
    pub max_tick_lag_us: u64,
}

/// Walks a parsed sequence on an externally driven clock.
///
/// The runner performs no I/O: callers feed it instants and link readiness and
/// push the returned `StepCommand`s to the valve and motor links themselves.
pub struct SequenceRunner {
    config: SchedulerConfig,
    state: RunnerState,
    queue: VecDeque<Step>,
    current: Option<Step>,
    requires_motor: bool,
    total_duration: Duration,
    started_at: Option<Instant>,
    last_tick: Option<Instant>,
    elapsed: Duration,
    step_elapsed: Duration,
    step_index: usize,
    last_abort: Option<AbortReason>,
    stats: RunnerStats,
}

impl SequenceRunner {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: RunnerState::Idle,
            queue: VecDeque::new(),
            current: None,
            requires_motor: false,
            total_duration: Duration::ZERO,
            started_at: None,
            last_tick: None,
            elapsed: Duration::ZERO,
            step_elapsed: Duration::ZERO,
            step_index: 0,
            last_abort: None,
            stats: RunnerStats::default(),
        }
    }

    /// Begins a sequence and returns the first step to apply. The first step
    /// does not produce a `StepStarted` event.
    pub fn start(
        &mut self,
        sequence: Sequence,
        now: Instant,
        readiness: Readiness,
    ) -> Result<StepCommand, StartError> {
        if self.state == RunnerState::Running {
            return Err(StartError::AlreadyRunning);
        }
        if let Some(reason) = unready_reason(sequence.requires_motor, readiness) {
            return Err(StartError::NotReady(reason));
        }

        let mut queue: VecDeque<Step> = sequence.steps.into();
        let first = queue.pop_front().ok_or(StartError::Empty)?;

        self.queue = queue;
        self.current = Some(first);
        self.requires_motor = sequence.requires_motor;
        self.total_duration = Duration::from_millis(sequence.total_duration_ms);
        self.started_at = Some(now);
        self.last_tick = Some(now);
        self.elapsed = Duration::ZERO;
        self.step_elapsed = Duration::ZERO;
        self.step_index = 0;
        self.last_abort = None;
        self.state = RunnerState::Running;
        self.stats.steps_started += 1;

        Ok(self.command_for(first))
    }

    pub fn tick(&mut self, now: Instant, readiness: Readiness) -> TickOutcome {
        if self.state != RunnerState::Running {
            return TickOutcome::default();
        }
        self.stats.ticks += 1;

        if let Some(event) = self.check_links(readiness) {
            return TickOutcome {
                command: None,
                event: Some(event),
            };
        }

        // Advance by the real delta so late ticks do not accumulate drift.
        let delta = self
            .last_tick
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or_default();
        self.last_tick = Some(now);
        self.elapsed += delta;
        self.step_elapsed += delta;
        if let Some(lag) = delta.checked_sub(self.config.tick) {
            self.stats.max_tick_lag_us = self.stats.max_tick_lag_us.max(lag.as_micros() as u64);
        }

        let Some(current) = self.current else {
            return TickOutcome::default();
        };
        if self.step_elapsed < Duration::from_millis(current.duration_ms) {
            return TickOutcome::default();
        }

        self.step_elapsed = Duration::ZERO;
        match self.queue.pop_front() {
            None => {
                self.current = None;
                self.state = RunnerState::Completed;
                self.stats.sequences_completed += 1;
                TickOutcome {
                    command: None,
                    event: Some(RunnerEvent::Completed),
                }
            }
            Some(next) => {
                self.current = Some(next);
                self.step_index += 1;
                self.stats.steps_started += 1;
                TickOutcome {
                    command: Some(self.command_for(next)),
                    event: Some(RunnerEvent::StepStarted {
                        index: self.step_index,
                        step: next,
                    }),
                }
            }
        }
    }

    /// Aborts immediately if a link the sequence depends on is not ready.
    pub fn check_links(&mut self, readiness: Readiness) -> Option<RunnerEvent> {
        if self.state != RunnerState::Running {
            return None;
        }
        let reason = unready_reason(self.requires_motor, readiness)?;
        self.enter_aborted(reason)
    }

    /// Stops the active sequence. The manifold keeps whatever the last step
    /// applied.
    pub fn abort(&mut self) -> Option<RunnerEvent> {
        self.enter_aborted(AbortReason::Requested)
    }

    fn enter_aborted(&mut self, reason: AbortReason) -> Option<RunnerEvent> {
        if self.state != RunnerState::Running {
            return None;
        }
        self.state = RunnerState::Aborted;
        self.queue.clear();
        self.current = None;
        self.last_abort = Some(reason);
        self.stats.sequences_aborted += 1;
        Some(RunnerEvent::Aborted(reason))
    }

    fn command_for(&self, step: Step) -> StepCommand {
        StepCommand {
            step,
            valves: step.valve_pattern(),
            motor_target: if self.requires_motor {
                step.motor_target()
            } else {
                None
            },
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == RunnerState::Running
    }

    pub fn current_step(&self) -> Option<Step> {
        self.current
    }

    /// Steps not yet finished, including the current one.
    pub fn steps_remaining(&self) -> usize {
        self.queue.len() + usize::from(self.current.is_some())
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn step_elapsed(&self) -> Duration {
        self.step_elapsed
    }

    /// Estimate only; scheduling decisions use per-step elapsed time.
    pub fn remaining(&self) -> Duration {
        if self.state != RunnerState::Running {
            return Duration::ZERO;
        }
        self.total_duration.saturating_sub(self.elapsed)
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn last_abort(&self) -> Option<AbortReason> {
        self.last_abort
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }
}

impl Default for SequenceRunner {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

fn unready_reason(requires_motor: bool, readiness: Readiness) -> Option<AbortReason> {
    if !readiness.valve_connected {
        Some(AbortReason::ValveLinkDown)
    } else if requires_motor && !readiness.motor_ready() {
        Some(AbortReason::MotorNotReady)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{SequenceParser, StepType};

    const READY: Readiness = Readiness {
        valve_connected: true,
        motor_connected: true,
        motor_calibrated: true,
    };

    fn run_ticks(
        runner: &mut SequenceRunner,
        start: Instant,
        until_ms: u64,
    ) -> Vec<(u64, TickOutcome)> {
        let mut outcomes = Vec::new();
        let mut t = 0;
        while t <= until_ms {
            let outcome = runner.tick(start + Duration::from_millis(t), READY);
            if outcome.event.is_some() {
                outcomes.push((t, outcome));
            }
            t += 10;
        }
        outcomes
    }

    #[test]
    fn two_step_sequence_timeline() {
        let seq = SequenceParser::new(false).parse_lines("d100n50", "").unwrap();
        let mut runner = SequenceRunner::default();
        let t0 = Instant::now();

        let first = runner.start(seq, t0, READY).unwrap();
        assert_eq!(first.step.step_type, StepType::Depressurise);
        assert_eq!(first.valves, StepType::Depressurise.valve_pattern());
        assert_eq!(runner.steps_remaining(), 2);

        let outcomes = run_ticks(&mut runner, t0, 300);
        assert_eq!(outcomes.len(), 2);

        let (t_step, step) = &outcomes[0];
        assert_eq!(*t_step, 100);
        assert_eq!(
            step.command.map(|c| c.valves),
            Some(StepType::Nitrogen.valve_pattern())
        );
        assert!(matches!(
            step.event,
            Some(RunnerEvent::StepStarted { index: 1, .. })
        ));

        let (t_done, done) = &outcomes[1];
        assert_eq!(*t_done, 150);
        assert_eq!(done.event, Some(RunnerEvent::Completed));
        assert_eq!(runner.state(), RunnerState::Completed);
        assert_eq!(runner.stats().steps_started, 2);
    }

    #[test]
    fn late_ticks_use_real_delta() {
        let seq = SequenceParser::new(false).parse_lines("s100", "").unwrap();
        let mut runner = SequenceRunner::default();
        let t0 = Instant::now();
        runner.start(seq, t0, READY).unwrap();

        assert_eq!(runner.tick(t0 + Duration::from_millis(40), READY).event, None);
        assert_eq!(runner.elapsed(), Duration::from_millis(40));
        let outcome = runner.tick(t0 + Duration::from_millis(105), READY);
        assert_eq!(outcome.event, Some(RunnerEvent::Completed));
        assert_eq!(runner.stats().max_tick_lag_us, 55_000);
    }

    #[test]
    fn aborts_when_valve_link_drops() {
        let seq = SequenceParser::new(false).parse_lines("d100n100", "").unwrap();
        let mut runner = SequenceRunner::default();
        let t0 = Instant::now();
        runner.start(seq, t0, READY).unwrap();

        let down = Readiness {
            valve_connected: false,
            ..READY
        };
        let outcome = runner.tick(t0 + Duration::from_millis(10), down);
        assert_eq!(
            outcome.event,
            Some(RunnerEvent::Aborted(AbortReason::ValveLinkDown))
        );
        assert_eq!(outcome.command, None);
        assert_eq!(runner.state(), RunnerState::Aborted);
        assert_eq!(runner.tick(t0 + Duration::from_millis(20), READY), TickOutcome::default());
    }

    #[test]
    fn motor_sequence_aborts_when_motor_uncalibrated() {
        let seq = SequenceParser::new(true).parse_lines("Mb100m6400", "").unwrap();
        let mut runner = SequenceRunner::default();
        let t0 = Instant::now();
        let first = runner.start(seq, t0, READY).unwrap();
        assert_eq!(first.motor_target, Some(6400));

        let uncalibrated = Readiness {
            motor_calibrated: false,
            ..READY
        };
        assert_eq!(
            runner.tick(t0 + Duration::from_millis(10), uncalibrated).event,
            Some(RunnerEvent::Aborted(AbortReason::MotorNotReady))
        );
    }

    #[test]
    fn motor_step_without_suffix_targets_zero() {
        let seq = SequenceParser::new(true).parse_lines("Md100b200m640", "").unwrap();
        let mut runner = SequenceRunner::default();
        let t0 = Instant::now();
        let first = runner.start(seq, t0, READY).unwrap();
        assert_eq!(first.motor_target, Some(0));

        let outcomes = run_ticks(&mut runner, t0, 100);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].1.command.and_then(|c| c.motor_target), Some(640));
    }

    #[test]
    fn plain_sequence_ignores_motor_state() {
        let seq = SequenceParser::new(true).parse_lines("b100n50", "").unwrap();
        let mut runner = SequenceRunner::default();
        let t0 = Instant::now();
        let no_motor = Readiness {
            valve_connected: true,
            ..Readiness::default()
        };
        let first = runner.start(seq, t0, no_motor).unwrap();
        assert_eq!(first.motor_target, None);
        assert_eq!(runner.tick(t0 + Duration::from_millis(10), no_motor).event, None);
    }

    #[test]
    fn rejects_second_start_and_external_abort_is_terminal() {
        let parser = SequenceParser::new(false);
        let mut runner = SequenceRunner::default();
        let t0 = Instant::now();
        runner.start(parser.parse_lines("h500", "").unwrap(), t0, READY).unwrap();
        assert_eq!(
            runner.start(parser.parse_lines("h500", "").unwrap(), t0, READY),
            Err(StartError::AlreadyRunning)
        );

        assert_eq!(
            runner.abort(),
            Some(RunnerEvent::Aborted(AbortReason::Requested))
        );
        assert_eq!(runner.abort(), None);
        assert_eq!(runner.remaining(), Duration::ZERO);

        let restarted = runner.start(parser.parse_lines("n10", "").unwrap(), t0, READY);
        assert!(restarted.is_ok());
    }

    #[test]
    fn refuses_start_when_links_not_ready() {
        let seq = SequenceParser::new(false).parse_lines("d100", "").unwrap();
        let mut runner = SequenceRunner::default();
        assert_eq!(
            runner.start(seq, Instant::now(), Readiness::default()),
            Err(StartError::NotReady(AbortReason::ValveLinkDown))
        );
        assert_eq!(runner.state(), RunnerState::Idle);
    }
}
