//! Periodic link health check.
//!
//! Each period the supervisor re-derives both links' states and, on a
//! Connected to not-Connected edge, tears the link down and tells the
//! scheduler so a running sequence aborts without waiting for its next tick.

use crate::motor_link::MotorLink;
use crate::scheduler::SequenceScheduler;
use crate::task::{stopped, TaskSet};
use crate::valve_link::ValveLink;
use bubble_core::{DeviceRole, LinkMonitor, LinkState, LinkTransition, SupervisorConfig};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    LinkEstablished(DeviceRole),
    LinkLost { role: DeviceRole, state: LinkState },
}

struct Monitors {
    valve: LinkMonitor,
    motor: LinkMonitor,
}

struct SupervisorShared {
    valve: Arc<ValveLink>,
    motor: Option<Arc<MotorLink>>,
    scheduler: Option<Arc<SequenceScheduler>>,
    monitors: Mutex<Monitors>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl SupervisorShared {
    fn monitors(&self) -> MutexGuard<'_, Monitors> {
        self.monitors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn check(&self) {
        let valve_live = self.valve.live_state();
        let motor_live = self.motor.as_ref().map(|m| m.state());

        let transitions: Vec<LinkTransition> = {
            let mut monitors = self.monitors();
            let mut found = Vec::new();
            found.extend(monitors.valve.observe(valve_live));
            if let Some(live) = motor_live {
                found.extend(monitors.motor.observe(live));
            }
            found
        };

        for transition in transitions {
            match transition {
                LinkTransition::Established(role) => {
                    info!(device = %role, "Link healthy");
                    let _ = self.events.send(SupervisorEvent::LinkEstablished(role));
                }
                LinkTransition::Lost { role, now } => {
                    error!(device = %role, state = now.as_str(), "Link lost, disconnecting");
                    match role {
                        DeviceRole::Valve => self.valve.disconnect().await,
                        DeviceRole::Motor => {
                            if let Some(motor) = &self.motor {
                                motor.reset().await;
                            }
                        }
                    }
                    if let Some(scheduler) = &self.scheduler {
                        scheduler.link_lost();
                    }
                    let _ = self
                        .events
                        .send(SupervisorEvent::LinkLost { role, state: now });
                }
            }
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    shared: Arc<SupervisorShared>,
    task: Mutex<Option<TaskSet>>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        valve: Arc<ValveLink>,
        motor: Option<Arc<MotorLink>>,
        scheduler: Option<Arc<SequenceScheduler>>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            config,
            shared: Arc::new(SupervisorShared {
                valve,
                motor,
                scheduler,
                monitors: Mutex::new(Monitors {
                    valve: LinkMonitor::new(DeviceRole::Valve),
                    motor: LinkMonitor::new(DeviceRole::Motor),
                }),
                events,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.shared.events.subscribe()
    }

    pub fn start(&self) {
        let mut slot = self.lock_task();
        if slot.is_some() {
            return;
        }
        let mut task = TaskSet::new("supervisor");
        task.spawn(supervise(
            Arc::clone(&self.shared),
            self.config.clone(),
            task.shutdown_signal(),
        ));
        *slot = Some(task);
        info!(period_ms = self.config.period.as_millis() as u64, "Supervisor started");
    }

    pub async fn stop(&self) {
        let task = self.lock_task().take();
        if let Some(task) = task {
            task.stop().await;
            info!("Supervisor stopped");
        }
    }

    /// Runs one health check outside the periodic task.
    pub async fn check_now(&self) {
        self.shared.check().await;
    }

    pub fn losses(&self, role: DeviceRole) -> u64 {
        let monitors = self.shared.monitors();
        match role {
            DeviceRole::Valve => monitors.valve.losses(),
            DeviceRole::Motor => monitors.motor.losses(),
        }
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<TaskSet>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn supervise(
    shared: Arc<SupervisorShared>,
    config: SupervisorConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = interval(config.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => shared.check().await,
            _ = stopped(&mut shutdown) => break,
        }
    }
}
