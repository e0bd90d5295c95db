use crate::infra::journal::{JournalEventType, SessionJournal};
use crate::runtime::config::{OperatingMode, Preset, RuntimeConfig};
use crate::runtime::logging::init_tracing;
use crate::runtime::recorder::SessionRecorder;
use crate::runtime::telemetry;
use bubble_core::transport::Connector;
use bubble_core::{
    SchedulerConfig, SimulatedMotorController, SimulatedValveController,
    SupervisorConfig, TimeBase, ValveStateVector,
};
use bubble_io::metrics::SEQUENCES_REJECTED;
use bubble_io::{
    LinkError, LinkEvent, MacroError, MacroSet, MacroTimer, MotorLink, MotorLinkConfig,
    SchedulerEvent, SequenceFileError, SequenceInbox, SequenceScheduler, SerialConnector,
    Supervisor, SupervisorEvent, ValveCommand, ValveLink, ValveLinkConfig,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

const INBOX_POLL: Duration = Duration::from_millis(500);
const CALIBRATION_TIMEOUT: Duration = Duration::from_secs(60);
const SIM_VALVE_PORT: &str = "SIM-VALVE";
const SIM_MOTOR_PORT: &str = "SIM-MOTOR";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("no valve controller port given (use --valve-port or --simulate)")]
    NoValvePort,
    #[error("failed to start async runtime: {0}")]
    Runtime(std::io::Error),
    #[error("failed to open journal: {0}")]
    Journal(std::io::Error),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Macro(#[from] MacroError),
}

type SharedRecorder = Arc<Mutex<SessionRecorder>>;

fn lock(recorder: &SharedRecorder) -> MutexGuard<'_, SessionRecorder> {
    recorder
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn run_from_args() {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Run with --help for usage.");
            std::process::exit(2);
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return;
    }
    if let Err(e) = run(config) {
        error!(error = %e, "bubble-ctl failed");
        std::process::exit(1);
    }
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let timebase = TimeBase::new();
    let journal = match &config.journal_path {
        Some(path) => {
            let journal = SessionJournal::open(path, timebase).map_err(AppError::Journal)?;
            info!(path = %path.display(), "Session journal enabled");
            Some(Arc::new(journal))
        }
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("bubble-ctl")
        .build()
        .map_err(AppError::Runtime)?;
    runtime.block_on(run_session(config, timebase, journal))
}

/// Valve and motor connectors plus the port names to open them with.
struct Devices {
    valve: (Arc<dyn Connector>, String),
    motor: Option<(Arc<dyn Connector>, String)>,
}

impl Devices {
    fn select(config: &RuntimeConfig) -> Result<Self, AppError> {
        if config.simulate {
            info!("Using simulated valve and motor controllers");
            let valve: Arc<dyn Connector> = Arc::new(SimulatedValveController::new());
            let motor: Arc<dyn Connector> = Arc::new(SimulatedMotorController::new());
            return Ok(Self {
                valve: (valve, SIM_VALVE_PORT.to_string()),
                motor: Some((motor, SIM_MOTOR_PORT.to_string())),
            });
        }

        let valve_port = config.valve_port.clone().ok_or(AppError::NoValvePort)?;
        let serial: Arc<dyn Connector> = Arc::new(SerialConnector);
        Ok(Self {
            valve: (Arc::clone(&serial), valve_port),
            motor: config
                .motor_port
                .clone()
                .map(|port| (Arc::clone(&serial), port)),
        })
    }
}

async fn run_session(
    config: RuntimeConfig,
    timebase: TimeBase,
    journal: Option<Arc<SessionJournal>>,
) -> Result<(), AppError> {
    let devices = Devices::select(&config)?;
    let recorder: SharedRecorder = Arc::new(Mutex::new(SessionRecorder::new(
        config.save_dir.clone(),
        config.csv_layout,
        journal.clone(),
    )));
    lock(&recorder).journal(
        JournalEventType::SystemStart,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "mode": config.mode.to_string(),
            "simulate": config.simulate,
        }),
    );

    let macros = match &config.macros_dir {
        Some(dir) => MacroSet::load_dir(dir)?,
        None => MacroSet::default(),
    };

    let (valve_connector, valve_port) = devices.valve;
    let valve = Arc::new(ValveLink::with_clock(
        valve_connector,
        ValveLinkConfig {
            baud: config.baud,
            ..ValveLinkConfig::default()
        },
        timebase,
    ));
    let valve_rx = valve.subscribe();
    valve.connect(&valve_port).await?;
    apply_mode(&valve, config.mode)?;

    let (motor, motor_rx) = match devices.motor {
        Some((connector, port)) => {
            let link = Arc::new(MotorLink::new(
                connector,
                MotorLinkConfig {
                    baud: config.baud,
                    ..MotorLinkConfig::default()
                },
            ));
            let rx = link.subscribe();
            match link.connect(&port).await {
                Ok(()) => (Some(link), Some(rx)),
                Err(e) => {
                    warn!(port = %port, error = %e, "Motor controller unavailable, continuing without it");
                    (None, None)
                }
            }
        }
        None => (None, None),
    };

    let scheduler = Arc::new(SequenceScheduler::new(
        Arc::clone(&valve),
        motor.clone(),
        SchedulerConfig::default(),
    ));
    let supervisor = Supervisor::new(
        SupervisorConfig::default(),
        Arc::clone(&valve),
        motor.clone(),
        Some(Arc::clone(&scheduler)),
    );
    let sched_rx = scheduler.subscribe();
    let sup_rx = supervisor.subscribe();
    supervisor.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = vec![tokio::spawn(pump_events(
        Arc::clone(&recorder),
        valve_rx,
        motor_rx,
        sched_rx,
        sup_rx,
        shutdown_rx.clone(),
    ))];

    let stop_metrics = Arc::new(AtomicBool::new(false));
    let metrics_updater = telemetry::start_metrics_updater(
        Arc::clone(&valve),
        motor.clone(),
        Arc::clone(&scheduler),
        Arc::clone(&stop_metrics),
    );

    if let Some(motor) = &motor {
        if config.calibrate {
            calibrate_motor(motor).await;
        }
        if let Some(number) = &config.motor_macro {
            let applied = match macros.motor_macro(number) {
                Ok(entry) => entry.apply(motor).await.map(|()| entry.position),
                Err(e) => Err(e),
            };
            match applied {
                Ok(position_mm) => lock(&recorder).journal(
                    JournalEventType::MacroApplied,
                    json!({ "kind": "motor", "macro": number, "position_mm": position_mm }),
                ),
                Err(e) => error!(number = %number, error = %e, "Motor macro failed"),
            }
        }
    }

    let macro_timer = MacroTimer::new();
    run_manual_actions(&config, &valve, &macros, &macro_timer, &recorder).await;

    if config.mode == OperatingMode::Automatic {
        let inbox = SequenceInbox::new(config.sequence_dir.clone(), config.save_dir.clone());
        info!(dir = %inbox.dir().display(), "Watching for sequence files");
        tasks.push(tokio::spawn(watch_inbox(
            inbox,
            Arc::clone(&valve),
            motor.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&recorder),
            shutdown_rx,
        )));
    }

    info!(mode = %config.mode, "bubble-ctl running");
    wait_for_exit(config.run_seconds).await;

    info!("Shutting down");
    scheduler.shutdown().await;
    macro_timer.cancel().await;
    supervisor.stop().await;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Session task ended abnormally");
        }
    }

    futures::join!(valve.disconnect(), async {
        if let Some(motor) = &motor {
            motor.reset().await;
        }
    });

    stop_metrics.store(true, Ordering::Relaxed);
    let _ = metrics_updater.join();

    let mut recorder = lock(&recorder);
    recorder.finish();
    let stats = valve.snapshot().stats;
    info!(
        readings = stats.readings,
        heartbeats_acked = stats.heartbeats_acked,
        unknown_lines = stats.unknown_lines,
        csv_files = recorder.saved().len(),
        "Run complete"
    );
    recorder.journal(
        JournalEventType::SystemShutdown,
        json!({
            "readings": stats.readings,
            "csv_files": recorder.saved().len(),
        }),
    );
    Ok(())
}

/// Sequences run host-side in automatic mode, so the firmware stays under
/// host control in every mode except TTL.
fn apply_mode(valve: &ValveLink, mode: OperatingMode) -> Result<(), LinkError> {
    valve.send(ValveCommand::EnablePressureLog)?;
    match mode {
        OperatingMode::Manual | OperatingMode::Automatic => {
            valve.send(ValveCommand::DisableTtlControl)?
        }
        OperatingMode::Ttl => valve.send(ValveCommand::EnableTtlControl)?,
    }
    info!(%mode, "Operating mode applied");
    Ok(())
}

async fn calibrate_motor(motor: &MotorLink) {
    if motor.is_calibrated() {
        info!("Motor already calibrated");
        return;
    }
    if let Err(e) = motor.calibrate().await {
        error!(error = %e, "Failed to start motor calibration");
        return;
    }
    let mut rx = motor.subscribe();
    let waited = tokio::time::timeout(CALIBRATION_TIMEOUT, async {
        while !motor.is_calibrated() {
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;
    if waited.is_err() || !motor.is_calibrated() {
        warn!("Motor did not report calibration in time");
    }
}

async fn run_manual_actions(
    config: &RuntimeConfig,
    valve: &Arc<ValveLink>,
    macros: &MacroSet,
    timer: &MacroTimer,
    recorder: &SharedRecorder,
) {
    if let Some(preset) = config.preset {
        let current = valve.valve_states();
        let result = match preset {
            Preset::QuickVent => valve.set_valve_states(&ValveStateVector::quick_vent()),
            Preset::SlowVent => valve.set_valve_states(&ValveStateVector::slow_vent()),
            Preset::BuildPressure => {
                valve.set_valve_states(&ValveStateVector::build_pressure(&current))
            }
            Preset::SwitchGas => valve.set_valve_states(&ValveStateVector::switch_gas(&current)),
            Preset::Reset => valve.reset_valves(),
        };
        match result {
            Ok(()) => info!(?preset, "Preset applied"),
            Err(e) => error!(?preset, error = %e, "Failed to apply preset"),
        }
    }

    if let Some(secs) = config.quick_bubble_secs {
        let duration = Duration::from_secs_f64(secs);
        match timer
            .run(valve, ValveStateVector::quick_bubble(), duration)
            .await
        {
            Ok(()) => lock(recorder).journal(
                JournalEventType::MacroApplied,
                json!({ "kind": "quick_bubble", "seconds": secs }),
            ),
            Err(e) => error!(error = %e, "Quick bubble failed"),
        }
    } else if let Some(number) = &config.valve_macro {
        let applied = match macros.valve_macro(number) {
            Ok(entry) => match (entry.vector(), entry.duration()) {
                (Ok(vector), Ok(duration)) => timer.run(valve, vector, duration).await,
                (Err(e), _) | (_, Err(e)) => Err(e),
            },
            Err(e) => Err(e),
        };
        match applied {
            Ok(()) => lock(recorder).journal(
                JournalEventType::MacroApplied,
                json!({ "kind": "valve", "macro": number }),
            ),
            Err(e) => error!(number = %number, error = %e, "Valve macro failed"),
        }
    }
}

async fn wait_for_exit(run_seconds: Option<u64>) {
    match run_seconds {
        Some(seconds) => {
            info!(seconds, "Running for limited duration");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
        }
    }
}

fn received<T>(
    result: Result<T, broadcast::error::RecvError>,
    stream: &'static str,
) -> Option<T> {
    match result {
        Ok(event) => Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(stream, skipped, "Event subscriber lagged");
            None
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

async fn next_motor_event(
    rx: &mut Option<broadcast::Receiver<LinkEvent>>,
) -> Result<LinkEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn pump_events(
    recorder: SharedRecorder,
    mut valve_rx: broadcast::Receiver<LinkEvent>,
    mut motor_rx: Option<broadcast::Receiver<LinkEvent>>,
    mut sched_rx: broadcast::Receiver<SchedulerEvent>,
    mut sup_rx: broadcast::Receiver<SupervisorEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = valve_rx.recv() => {
                if let Some(event) = received(event, "valve") {
                    lock(&recorder).on_link_event(&event);
                }
            }
            event = next_motor_event(&mut motor_rx) => {
                if let Some(event) = received(event, "motor") {
                    lock(&recorder).on_link_event(&event);
                }
            }
            event = sched_rx.recv() => {
                if let Some(event) = received(event, "scheduler") {
                    lock(&recorder).on_scheduler_event(&event);
                }
            }
            event = sup_rx.recv() => {
                if let Some(event) = received(event, "supervisor") {
                    lock(&recorder).on_supervisor_event(&event);
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Terminal scheduler events raced with shutdown still close the CSV.
    while let Ok(event) = sched_rx.try_recv() {
        lock(&recorder).on_scheduler_event(&event);
    }
}

async fn watch_inbox(
    inbox: SequenceInbox,
    valve: Arc<ValveLink>,
    motor: Option<Arc<MotorLink>>,
    scheduler: Arc<SequenceScheduler>,
    recorder: SharedRecorder,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(INBOX_POLL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        // A file dropped mid-run waits for the current sequence.
        if scheduler.is_running() || !valve.is_connected() {
            continue;
        }

        let motor_ready = motor.as_ref().is_some_and(|m| m.is_ready());
        match inbox.poll(motor_ready) {
            Ok(None) => {}
            Ok(Some(accepted)) => {
                {
                    let mut recorder = lock(&recorder);
                    recorder.journal(
                        JournalEventType::SequenceLoaded,
                        json!({
                            "steps": accepted.sequence.len(),
                            "total_ms": accepted.sequence.total_duration_ms,
                            "csv": accepted.save_path.display().to_string(),
                        }),
                    );
                    recorder.arm(accepted.save_path);
                }
                let started = scheduler.start(accepted.sequence).await;
                if let Err(e) = inbox.write_handshake(started.is_ok()) {
                    warn!(error = %e, "Failed to write sequence handshake");
                }
                if let Err(e) = started {
                    error!(error = %e, "Sequence not started");
                    let mut recorder = lock(&recorder);
                    recorder.disarm();
                    recorder.journal(
                        JournalEventType::SequenceRejected,
                        json!({ "reason": e.to_string() }),
                    );
                }
            }
            Err(SequenceFileError::Parse(e)) => {
                error!(error = %e, "Rejected sequence file, disconnecting valve controller");
                SEQUENCES_REJECTED.inc();
                lock(&recorder).journal(
                    JournalEventType::SequenceRejected,
                    json!({ "reason": e.to_string() }),
                );
                valve.disconnect().await;
            }
            Err(e) => warn!(error = %e, "Sequence inbox poll failed"),
        }
    }
}
