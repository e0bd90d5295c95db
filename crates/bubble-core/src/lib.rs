pub mod link;
pub mod reading;
pub mod scheduler;
pub mod sequence;
mod sequence_proptest;
#[cfg(feature = "simulation")]
pub mod sim;
pub mod supervisor;
pub mod tags;
pub mod timebase;
pub mod transport;
pub mod valve;

pub use link::{CalibrationState, DeviceRole, LinkState, Readiness};
pub use reading::{raw_to_bar, Reading, ReadingRing, READING_CAPACITY};
pub use scheduler::{
    AbortReason, RunnerEvent, RunnerState, RunnerStats, SchedulerConfig, SequenceRunner,
    StartError, StepCommand, TickOutcome,
};
pub use sequence::{ParseError, Sequence, SequenceParser, Step, StepType};
#[cfg(feature = "simulation")]
pub use sim::{SimulatedMotorController, SimulatedValveController, WireEvent};
pub use supervisor::{LinkMonitor, LinkTransition, SupervisorConfig};
pub use timebase::TimeBase;
pub use transport::{Connector, LineBuffer, Transport, TransportError};
pub use valve::{ValveCodeError, ValveState, ValveStateVector, VALVE_COUNT};
