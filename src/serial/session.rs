use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ports::PortScanner;
use super::transport::{CloseReason, TransportEvent};
use crate::error::{AppError, Result};
use crate::events::{AppEvent, BusEvent, EventBus, topic};
use crate::protocol::{CommandLabel, Dimensions, SessionProtocol};

/// Device-side path the deep listing helper is uploaded to.
pub const LIST_SCRIPT_PATH: &str = "/usr/q_init_fs.py";

const LIST_SCRIPT: &str = include_str!("../device/list_fs.py");

/// The five tagged lines that list `/usr` on a fresh connection.
pub const BOOTSTRAP_LINES: [&str; 5] = [
    "for elem in uos.ilistdir('/usr'):\r\n",
    "print(elem)\r\n",
    "\r\n",
    "\r\n",
    "\r\n",
];

/// One open serial terminal: protocol state plus port lifecycle.
pub struct SerialSession {
    name: String,
    protocol: SessionProtocol,
    scanner: Arc<dyn PortScanner>,
    sender: mpsc::Sender<AppEvent>,
    reconnect_interval: Duration,
    reconnect_token: Option<CancellationToken>,
}

impl SerialSession {
    pub fn new(
        name: impl Into<String>,
        protocol: SessionProtocol,
        scanner: Arc<dyn PortScanner>,
        sender: mpsc::Sender<AppEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            protocol,
            scanner,
            sender,
            reconnect_interval: Duration::from_millis(1000),
            reconnect_token: None,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &str {
        self.protocol.transport().port()
    }

    pub fn baud_rate(&self) -> u32 {
        self.protocol.transport().baud_rate()
    }

    pub fn is_open(&self) -> bool {
        self.protocol.transport().is_open()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnect_token.is_some()
    }

    pub fn protocol(&self) -> &SessionProtocol {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut SessionProtocol {
        &mut self.protocol
    }

    /// Print the banner and open the port. Open failures are rendered, not returned.
    pub fn open(&mut self, dimensions: Option<Dimensions>) {
        let banner = format!(
            "\rmcuterm serial terminal\r\nPort: {}\r\nBaud rate: {} baud\r\n\r\n",
            self.port(),
            self.baud_rate()
        );
        self.protocol.inject_text(&banner);

        if !self.is_open() {
            self.open_transport();
        }
        self.protocol.open(dimensions);
    }

    fn open_transport(&mut self) -> bool {
        match self.protocol.transport_mut().open() {
            Ok(()) => true,
            Err(e) => {
                self.protocol.on_transport_error(&e.to_string());
                false
            }
        }
    }

    pub fn on_transport_event(&mut self, event: TransportEvent, bus: &mut EventBus) {
        match event {
            TransportEvent::Opened => {
                info!("Session {} connected on {}", self.name, self.port());
                bus.emit(topic::STATUS_CONNECTED, &BusEvent::Signal);
                self.stop_reconnect_poll();
                if let Err(e) = self.read_stat_files() {
                    error!("Bootstrap listing failed: {}", e);
                    self.protocol.on_transport_error(&e.to_string());
                }
            }
            TransportEvent::Data(bytes) => {
                if let Some((label, text)) = self.protocol.on_device_bytes(&bytes) {
                    let reply = BusEvent::Reply {
                        session: self.name.clone(),
                        text,
                    };
                    bus.emit(label.topic(), &reply);
                }
            }
            TransportEvent::Closed(reason) => self.on_closed(reason, bus),
            TransportEvent::Error(message) => self.protocol.on_transport_error(&message),
        }
    }

    fn on_closed(&mut self, reason: CloseReason, bus: &mut EventBus) {
        info!("Session {} closed: {:?}", self.name, reason);
        bus.emit(topic::STATUS_DISCONNECTED, &BusEvent::Signal);
        self.protocol.reset_command();
        if let Err(e) = self.protocol.transport_mut().close() {
            debug!("Releasing dropped port failed: {}", e);
        }

        if !self.protocol.ends_with_newline() {
            self.protocol.inject_text("\r\n");
        }
        if reason == CloseReason::Disconnected {
            self.protocol.inject_text("Device disconnected.");
            self.start_reconnect_poll();
        }
        self.protocol.inject_text("\r\n");
    }

    /// The polled port showed up again: reopen it.
    pub fn on_device_reappeared(&mut self) {
        if self.is_open() {
            return;
        }
        self.stop_reconnect_poll();
        if !self.protocol.ends_with_newline() {
            self.protocol.inject_text("\r\n");
        }
        let message = format!("Device reconnected at port {}.\r\n", self.port());
        self.protocol.inject_text(&message);
        if !self.open_transport() {
            self.start_reconnect_poll();
        }
    }

    /// Reopen a port that was held closed for an external transfer.
    pub fn reopen(&mut self) -> bool {
        if self.is_open() {
            return true;
        }
        info!("Reopening {}", self.port());
        self.open_transport()
    }

    fn start_reconnect_poll(&mut self) {
        self.stop_reconnect_poll();

        let token = CancellationToken::new();
        let cancel = token.clone();
        let scanner = Arc::clone(&self.scanner);
        let sender = self.sender.clone();
        let session = self.name.clone();
        let port = self.port().to_string();
        let period = self.reconnect_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match scanner.contains(&port) {
                            Ok(true) => {
                                let event = AppEvent::DeviceReappeared { session: session.clone() };
                                if sender.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Ok(false) => {}
                            Err(e) => warn!("Port scan failed: {}", e),
                        }
                    }
                }
            }
            debug!("Reconnect poll for {} stopped", port);
        });

        self.reconnect_token = Some(token);
    }

    fn stop_reconnect_poll(&mut self) {
        if let Some(token) = self.reconnect_token.take() {
            token.cancel();
        }
    }

    /// List `/usr` one entry per line.
    pub fn read_stat_files(&mut self) -> Result<()> {
        for line in BOOTSTRAP_LINES {
            self.protocol
                .handle_input(&CommandLabel::BootstrapList.tagged(line))?;
        }
        Ok(())
    }

    /// Upload and run a helper that prints the whole tree as one list literal.
    pub fn read_tree_deep(&mut self) -> Result<()> {
        self.protocol
            .issue_command(CommandLabel::ListDir, &deep_listing_lines())
    }

    /// Close the port and the terminal. A failed close is fatal to the caller.
    pub fn close(&mut self) -> Result<()> {
        self.stop_reconnect_poll();
        let closed = if self.is_open() {
            self.protocol
                .transport_mut()
                .close()
                .map_err(|e| match e {
                    AppError::CloseError(_) => e,
                    other => AppError::CloseError(other.to_string()),
                })
        } else {
            Ok(())
        };
        self.protocol.shutdown();
        closed
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.stop_reconnect_poll();
    }
}

/// Device statements that write, execute and remove the listing helper.
pub fn deep_listing_lines() -> Vec<String> {
    let mut lines = vec![
        format!("f = open('{LIST_SCRIPT_PATH}', 'wb')\r\n"),
        "w = f.write\r\n".to_string(),
    ];
    lines.extend(
        LIST_SCRIPT
            .lines()
            .map(|line| format!("w(b\"{line}\\r\\n\")\r\n")),
    );
    lines.push("f.close()\r\n".to_string());
    lines.push("import example\r\n".to_string());
    lines.push(format!(
        "example.exec('{}')\r\n",
        LIST_SCRIPT_PATH.trim_start_matches('/')
    ));
    lines.push(format!("uos.remove('{LIST_SCRIPT_PATH}')\r\n"));
    lines
}
