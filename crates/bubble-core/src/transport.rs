use std::time::Duration;
use thiserror::Error;

/// Failure on the byte channel to a device. Never retried in place; the owning
/// link treats any of these as a fault.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport closed")]
    Closed,
}

/// One open serial channel carrying single-byte commands out and
/// newline-terminated text lines back.
pub trait Transport: Send {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Returns a complete line (terminator stripped) if one is buffered by the
    /// time `timeout` elapses. `Duration::ZERO` is a pure poll.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError>;

    fn close(&mut self);
}

/// Opens transports by port identifier.
pub trait Connector: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn Transport>, TransportError>;
}

/// Splits a byte stream into text lines. Carriage returns are dropped so both
/// `\n` and `\r\n` terminated firmware output decode the same way.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending
            .extend(bytes.iter().copied().filter(|b| *b != b'\r'));
    }

    pub fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line[..end]).trim().to_string())
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_chunks() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"HEARTBEAT_A");
        assert_eq!(buffer.next_line(), None);
        buffer.extend(b"CK\r\nP 1 2 3 C\n");
        assert_eq!(buffer.next_line().as_deref(), Some("HEARTBEAT_ACK"));
        assert_eq!(buffer.next_line().as_deref(), Some("P 1 2 3 C"));
        assert_eq!(buffer.next_line(), None);
    }
}
