pub mod error;
pub mod event;
pub mod macros;
pub mod metrics;
pub mod motor_link;
pub mod pressure_log;
pub mod protocol;
pub mod scheduler;
pub mod sequence_file;
pub mod serial;
pub mod supervisor;
mod task;
pub mod valve_link;

pub use error::LinkError;
pub use event::LinkEvent;
pub use macros::{MacroError, MacroNumber, MacroSet, MacroTimer, MotorMacro, ValveMacro};
pub use metrics::{init_metrics, serve_metrics};
pub use motor_link::{
    mm_to_steps, steps_to_mm, MotorLink, MotorLinkConfig, MotorStatus, STEPS_PER_MM,
};
pub use pressure_log::{CsvLayout, PressureLogError, PressureLogger};
pub use protocol::{
    encode_valve_states, MotorCommand, MotorResponse, PressureFrame, UnknownCommand,
    ValveCommand, ValveResponse,
};
pub use scheduler::{SchedulerEvent, SchedulerStatus, SequenceScheduler};
pub use sequence_file::{AcceptedSequence, SequenceFileError, SequenceInbox};
pub use serial::{list_ports, SerialConnector, SerialTransport, DEFAULT_BAUD};
pub use supervisor::{Supervisor, SupervisorEvent};
pub use valve_link::{ValveLink, ValveLinkConfig, ValveLinkSnapshot, ValveLinkStats};
