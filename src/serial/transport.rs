use std::io::{self, Read, Write};
#[cfg(test)]
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use serialport::SerialPort;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::events::AppEvent;

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const READ_BUFFER: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// We closed the port ourselves.
    Requested,
    /// The device went away underneath us.
    Disconnected,
}

/// Lifecycle and data notifications from a transport's reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Data(Bytes),
    Closed(CloseReason),
    Error(String),
}

/// The byte link under a session.
pub trait SessionTransport: Send {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn is_open(&self) -> bool;
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn port(&self) -> &str;
    fn baud_rate(&self) -> u32;
}

/// A `serialport` device with a blocking reader thread feeding the app channel.
pub struct SerialTransport {
    session: String,
    port_name: String,
    baud_rate: u32,
    sender: mpsc::Sender<AppEvent>,
    port: Option<Box<dyn SerialPort>>,
    cancel_token: Option<CancellationToken>,
}

impl SerialTransport {
    pub fn new(
        session: impl Into<String>,
        port_name: impl Into<String>,
        baud_rate: u32,
        sender: mpsc::Sender<AppEvent>,
    ) -> Self {
        Self {
            session: session.into(),
            port_name: port_name.into(),
            baud_rate,
            sender,
            port: None,
            cancel_token: None,
        }
    }

    fn spawn_reader(&self, mut reader: Box<dyn SerialPort>, cancel_token: CancellationToken) {
        let sender = self.sender.clone();
        let session = self.session.clone();
        let port_name = self.port_name.clone();

        thread::spawn(move || {
            let post = |event: TransportEvent| {
                sender
                    .blocking_send(AppEvent::Transport {
                        session: session.clone(),
                        event,
                    })
                    .is_ok()
            };

            if !post(TransportEvent::Opened) {
                return;
            }

            let mut buf = [0u8; READ_BUFFER];
            let reason = loop {
                if cancel_token.is_cancelled() {
                    break CloseReason::Requested;
                }
                match reader.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        if !post(TransportEvent::Data(Bytes::copy_from_slice(&buf[..n]))) {
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if cancel_token.is_cancelled() {
                            break CloseReason::Requested;
                        }
                        tracing::warn!("Serial read on {} failed: {}", port_name, e);
                        break CloseReason::Disconnected;
                    }
                }
            };

            tracing::info!("Serial reader for {} stopped: {:?}", port_name, reason);
            post(TransportEvent::Closed(reason));
        });
    }
}

impl SessionTransport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        let reader = port.try_clone()?;

        let cancel_token = CancellationToken::new();
        self.spawn_reader(reader, cancel_token.clone());
        self.cancel_token = Some(cancel_token);
        self.port = Some(port);

        tracing::info!("Opened {} at {} baud", self.port_name, self.baud_rate);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        if let Some(mut port) = self.port.take() {
            port.flush()
                .map_err(|e| AppError::CloseError(e.to_string()))?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| AppError::SerialError(format!("Port {} is not open", self.port_name)))?;
        port.write_all(data)
            .map_err(|e| AppError::SerialError(format!("Failed to write to {}: {}", self.port_name, e)))
    }

    fn port(&self) -> &str {
        &self.port_name
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
struct MemoryState {
    open: bool,
    written: Vec<u8>,
    opens: usize,
    closes: usize,
    fail_open: bool,
    fail_writes: bool,
}

/// In-memory transport that records writes. Clones share state.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    port_name: String,
    baud_rate: u32,
    state: Arc<Mutex<MemoryState>>,
}

#[cfg(test)]
impl MemoryTransport {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn written(&self) -> Vec<u8> {
        self.with_state(|s| s.written.clone())
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    pub fn take_written(&self) -> String {
        let bytes = self.with_state(|s| std::mem::take(&mut s.written));
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn open_count(&self) -> usize {
        self.with_state(|s| s.opens)
    }

    pub fn close_count(&self) -> usize {
        self.with_state(|s| s.closes)
    }

    pub fn fail_open(&self, fail: bool) {
        self.with_state(|s| s.fail_open = fail);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.with_state(|s| s.fail_writes = fail);
    }

    /// Mark the link dropped without going through `close`.
    pub fn unplug(&self) {
        self.with_state(|s| s.open = false);
    }
}

#[cfg(test)]
impl SessionTransport for MemoryTransport {
    fn open(&mut self) -> Result<()> {
        let port = self.port_name.clone();
        self.with_state(|s| {
            if s.fail_open {
                return Err(AppError::SerialError(format!("No such device: {port}")));
            }
            s.open = true;
            s.opens += 1;
            Ok(())
        })
    }

    fn close(&mut self) -> Result<()> {
        self.with_state(|s| {
            s.open = false;
            s.closes += 1;
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.with_state(|s| s.open)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port_name.clone();
        self.with_state(|s| {
            if s.fail_writes || !s.open {
                return Err(AppError::SerialError(format!("Failed to write to {port}")));
            }
            s.written.extend_from_slice(data);
            Ok(())
        })
    }

    fn port(&self) -> &str {
        &self.port_name
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_transport_records_writes_across_clones() {
        let mut transport = MemoryTransport::new("/dev/ttyACM0", 115200);
        let handle = transport.clone();

        assert!(transport.write(b"x").is_err());
        transport.open().unwrap();
        transport.write(b"print(1)\r\n").unwrap();
        assert_eq!(handle.written_text(), "print(1)\r\n");
        assert_eq!(handle.take_written(), "print(1)\r\n");
        assert!(handle.written().is_empty());

        handle.unplug();
        assert!(!transport.is_open());
        transport.close().unwrap();
        assert_eq!((handle.open_count(), handle.close_count()), (1, 1));
    }

    #[test]
    fn test_memory_transport_open_failure() {
        let mut transport = MemoryTransport::new("COM9", 9600);
        transport.fail_open(true);
        assert!(matches!(transport.open(), Err(AppError::SerialError(_))));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_serial_transport_write_requires_open_port() {
        let (tx, _rx) = mpsc::channel(4);
        let mut transport = SerialTransport::new("COM3", "COM3", 115200, tx);
        assert!(!transport.is_open());
        assert!(matches!(transport.write(b"x"), Err(AppError::SerialError(_))));
        assert!(transport.close().is_ok());
    }
}
