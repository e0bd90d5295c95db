//! Prometheus metrics for the bubble controller.
//!
//! Gauges mirror the latest link and sequence state; counters accumulate
//! protocol and sequence outcomes over the process lifetime.

use bubble_core::{tags, Reading};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::new(name, help).unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
}

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
}

// ============================================================================
// Pressure Metrics
// ============================================================================

pub static PRESSURE_1_BAR: LazyLock<Gauge> =
    LazyLock::new(|| gauge(tags::PRESSURE_1.metric, "Calibrated pressure, sensor 1 (bar)"));

pub static PRESSURE_2_BAR: LazyLock<Gauge> =
    LazyLock::new(|| gauge(tags::PRESSURE_2.metric, "Calibrated pressure, sensor 2 (bar)"));

pub static PRESSURE_3_BAR: LazyLock<Gauge> =
    LazyLock::new(|| gauge(tags::PRESSURE_3.metric, "Calibrated pressure, sensor 3 (bar)"));

pub static READINGS_DECODED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "bubble_readings_decoded_total",
        "Pressure frames decoded from the valve controller",
    )
});

pub static UNKNOWN_LINES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "bubble_unknown_lines_total",
        "Unrecognised response lines from either controller",
    )
});

// ============================================================================
// Link Metrics
// ============================================================================

/// Valve link status (1 = connected, 0 = not)
pub static VALVE_LINK_UP: LazyLock<Gauge> =
    LazyLock::new(|| gauge(tags::VALVE_LINK_UP.metric, "Valve controller link up (1/0)"));

/// Motor link status (1 = connected, 0 = not)
pub static MOTOR_LINK_UP: LazyLock<Gauge> =
    LazyLock::new(|| gauge(tags::MOTOR_LINK_UP.metric, "Motor controller link up (1/0)"));

pub static MOTOR_CALIBRATED: LazyLock<Gauge> =
    LazyLock::new(|| gauge(tags::MOTOR_CALIBRATED.metric, "Motor calibrated (1/0)"));

pub static MOTOR_POSITION_MM: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        tags::MOTOR_POSITION_MM.metric,
        "Motor depth below the calibrated top (mm)",
    )
});

pub static HEARTBEAT_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "bubble_heartbeat_timeouts_total",
        "Valve links dropped by the heartbeat watchdog",
    )
});

pub static LINKS_LOST: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "bubble_links_lost_total",
        "Connected links observed lost by the supervisor",
    )
});

// ============================================================================
// Sequence Metrics
// ============================================================================

pub static STEPS_REMAINING: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        tags::STEPS_REMAINING.metric,
        "Steps left in the running sequence",
    )
});

pub static TIME_REMAINING_MS: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        tags::TIME_REMAINING_MS.metric,
        "Estimated time left in the running sequence (ms)",
    )
});

pub static SEQUENCES_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "bubble_sequences_completed_total",
        "Sequences that ran to completion",
    )
});

pub static SEQUENCES_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter("bubble_sequences_aborted_total", "Sequences aborted")
});

pub static SEQUENCES_REJECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "bubble_sequences_rejected_total",
        "Sequence files that failed to load",
    )
});

/// Updates the pressure gauges from one decoded frame.
pub fn record_reading(reading: &Reading) {
    let [p1, p2, p3] = reading.calibrated();
    PRESSURE_1_BAR.set(p1);
    PRESSURE_2_BAR.set(p2);
    PRESSURE_3_BAR.set(p3);
    READINGS_DECODED.inc();
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

pub fn set_link_flags(valve_up: bool, motor_up: bool, motor_calibrated: bool) {
    VALVE_LINK_UP.set(flag(valve_up));
    MOTOR_LINK_UP.set(flag(motor_up));
    MOTOR_CALIBRATED.set(flag(motor_calibrated));
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();

                    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }

                    let response = Response::from_data(buffer).with_header(
                        tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        )
                        .unwrap(),
                    );
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    // Ready once the valve controller is connected
                    if VALVE_LINK_UP.get() > 0.0 {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = PRESSURE_1_BAR.get();
    let _ = PRESSURE_2_BAR.get();
    let _ = PRESSURE_3_BAR.get();
    let _ = READINGS_DECODED.get();
    let _ = UNKNOWN_LINES.get();
    let _ = VALVE_LINK_UP.get();
    let _ = MOTOR_LINK_UP.get();
    let _ = MOTOR_CALIBRATED.get();
    let _ = MOTOR_POSITION_MM.get();
    let _ = HEARTBEAT_TIMEOUTS.get();
    let _ = LINKS_LOST.get();
    let _ = STEPS_REMAINING.get();
    let _ = TIME_REMAINING_MS.get();
    let _ = SEQUENCES_COMPLETED.get();
    let _ = SEQUENCES_ABORTED.get();
    let _ = SEQUENCES_REJECTED.get();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bubble_core::ValveStateVector;

    #[test]
    fn reading_updates_pressure_gauges() {
        init_metrics();
        let before = READINGS_DECODED.get();
        record_reading(&Reading {
            unix_us: 0,
            pressures: [203.53, 286.01, 203.53],
            external_pressure: None,
            valves: ValveStateVector::unchanged(),
        });
        assert!(READINGS_DECODED.get() > before);
        assert!((PRESSURE_2_BAR.get() - 1.0).abs() < 1e-9);

        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == tags::VALVE_LINK_UP.metric));
        assert!(names.iter().any(|n| n == "bubble_sequences_aborted_total"));
    }
}
