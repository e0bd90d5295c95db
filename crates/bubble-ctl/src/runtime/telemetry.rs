use bubble_io::metrics::{
    init_metrics, serve_metrics, set_link_flags, MOTOR_POSITION_MM, STEPS_REMAINING,
    TIME_REMAINING_MS,
};
use bubble_io::{MotorLink, SequenceScheduler, ValveLink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

const UPDATE_PERIOD: Duration = Duration::from_millis(200);

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Mirrors link and sequence state into the gauges until `stop` is set.
/// Pressure gauges are fed per frame by the session recorder instead.
pub fn start_metrics_updater(
    valve: Arc<ValveLink>,
    motor: Option<Arc<MotorLink>>,
    scheduler: Arc<SequenceScheduler>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            let motor_status = motor.as_ref().map(|m| m.status()).unwrap_or_default();
            set_link_flags(
                valve.is_connected(),
                motor_status.state.is_connected(),
                motor_status.is_ready(),
            );
            if let Some(mm) = motor_status.position_mm {
                MOTOR_POSITION_MM.set(mm);
            }

            let sequence = scheduler.status();
            STEPS_REMAINING.set(sequence.steps_remaining as f64);
            TIME_REMAINING_MS.set(sequence.remaining_ms as f64);

            thread::sleep(UPDATE_PERIOD);
        }
    })
}
