use crate::protocol::UnknownCommand;
use bubble_core::transport::TransportError;
use bubble_core::DeviceRole;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{0} controller is not connected")]
    NotConnected(DeviceRole),
    #[error(transparent)]
    UnknownCommand(#[from] UnknownCommand),
    #[error("motor is not calibrated")]
    NotCalibrated,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0} controller stopped responding")]
    LinkLost(DeviceRole),
    #[error("{role} controller did not reply within {timeout:?}")]
    Timeout { role: DeviceRole, timeout: Duration },
    #[error("unexpected reply from {role} controller: {line:?}")]
    InvalidResponse { role: DeviceRole, line: String },
    #[error("{0} controller is already connected")]
    AlreadyConnected(DeviceRole),
    #[error("sequence upload requires automatic mode")]
    NotInAutoMode,
}

impl LinkError {
    /// Errors after which the link has been torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::Transport(_) | LinkError::LinkLost(_) | LinkError::Timeout { .. }
        )
    }
}
