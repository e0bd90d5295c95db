use crate::link::{DeviceRole, LinkState};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub period: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTransition {
    Established(DeviceRole),
    Lost { role: DeviceRole, now: LinkState },
}

/// Tracks the last state a link was seen in and reports edges.
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    role: DeviceRole,
    seen: LinkState,
    losses: u64,
}

impl LinkMonitor {
    pub fn new(role: DeviceRole) -> Self {
        Self {
            role,
            seen: LinkState::Disconnected,
            losses: 0,
        }
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn seen(&self) -> LinkState {
        self.seen
    }

    pub fn losses(&self) -> u64 {
        self.losses
    }

    pub fn observe(&mut self, live: LinkState) -> Option<LinkTransition> {
        let previous = std::mem::replace(&mut self.seen, live);
        match (previous.is_connected(), live.is_connected()) {
            (true, false) => {
                self.losses += 1;
                Some(LinkTransition::Lost {
                    role: self.role,
                    now: live,
                })
            }
            (false, true) => Some(LinkTransition::Established(self.role)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_each_edge_once() {
        let mut monitor = LinkMonitor::new(DeviceRole::Valve);
        assert_eq!(monitor.observe(LinkState::Connecting), None);
        assert_eq!(
            monitor.observe(LinkState::Connected),
            Some(LinkTransition::Established(DeviceRole::Valve))
        );
        assert_eq!(monitor.observe(LinkState::Connected), None);
        assert_eq!(
            monitor.observe(LinkState::Faulted),
            Some(LinkTransition::Lost {
                role: DeviceRole::Valve,
                now: LinkState::Faulted
            })
        );
        assert_eq!(monitor.observe(LinkState::Disconnected), None);
        assert_eq!(monitor.losses(), 1);
    }
}
