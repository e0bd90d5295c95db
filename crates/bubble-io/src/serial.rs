use bubble_core::transport::{Connector, LineBuffer, Transport, TransportError};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_BAUD: u32 = 9600;

const PORT_TIMEOUT: Duration = Duration::from_millis(10);
const POLL_BACKOFF: Duration = Duration::from_millis(1);

/// Serial port transport. Reads drain whatever the driver has buffered and
/// never wait for more unless the caller asks for a timeout.
pub struct SerialTransport {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    lines: LineBuffer,
}

impl SerialTransport {
    pub fn open(name: &str, baud: u32) -> Result<Self, TransportError> {
        let port = serialport::new(name, baud)
            .timeout(PORT_TIMEOUT)
            .open()
            .map_err(|e| TransportError::Open {
                port: name.to_string(),
                reason: e.to_string(),
            })?;
        info!(port = %name, baud, "Opened serial port");
        Ok(Self {
            name: name.to_string(),
            port: Some(port),
            lines: LineBuffer::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn fill(&mut self) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        let available = port.bytes_to_read().map_err(std::io::Error::from)? as usize;
        if available == 0 {
            return Ok(());
        }
        let mut buffer = vec![0u8; available];
        match port.read(&mut buffer) {
            Ok(n) => {
                self.lines.extend(&buffer[..n]);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

impl Transport for SerialTransport {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        port.write_all(bytes)?;
        port.flush()?;
        debug!(port = %self.name, bytes = %String::from_utf8_lossy(bytes).escape_debug(), "Serial write");
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(Some(line));
            }
            self.fill()?;
            if let Some(line) = self.lines.next_line() {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_BACKOFF);
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            self.lines.clear();
            info!(port = %self.name, "Closed serial port");
        }
    }
}

/// Opens real serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(SerialTransport::open(port, baud)?))
    }
}

/// Names of the serial ports present on this machine.
pub fn list_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            warn!(error = %e, "Failed to enumerate serial ports");
            Vec::new()
        }
    }
}
