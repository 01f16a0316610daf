#[cfg(test)]
use std::sync::{Arc, Mutex};

use serialport::SerialPortType;

use crate::error::{AppError, Result};

pub const DEFAULT_BAUD_RATE: u32 = 115200;

pub const SUPPORTED_BAUD_RATES: [u32; 13] = [
    1200, 2400, 4800, 9600, 14400, 19200, 38400, 57600, 115200, 230400, 256000, 460800, 921600,
];

/// Product name of the REPL port on the boards we target.
pub const MAIN_PORT_PRODUCT: &str = "USB Serial Device";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

impl PortInfo {
    pub fn is_main_port(&self) -> bool {
        self.description.contains(MAIN_PORT_PRODUCT)
    }
}

/// Source of currently attached serial ports.
pub trait PortScanner: Send + Sync {
    fn available_ports(&self) -> Result<Vec<PortInfo>>;

    fn contains(&self, port: &str) -> Result<bool> {
        Ok(self.available_ports()?.iter().any(|p| p.name == port))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortScanner;

impl PortScanner for SystemPortScanner {
    fn available_ports(&self) -> Result<Vec<PortInfo>> {
        let mut ports: Vec<PortInfo> = serialport::available_ports()?
            .into_iter()
            .map(|port| {
                let description = match port.port_type {
                    SerialPortType::UsbPort(info) => {
                        let product = info.product.unwrap_or_default();
                        format!("{} ({:04x}:{:04x})", product, info.vid, info.pid)
                    }
                    SerialPortType::PciPort => "PCI".to_string(),
                    SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                    SerialPortType::Unknown => String::new(),
                };
                PortInfo {
                    name: port.port_name,
                    description,
                }
            })
            .collect();
        // REPL ports first
        ports.sort_by_key(|p| !p.is_main_port());
        Ok(ports)
    }
}

/// Scanner over a port list the caller controls.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct FixedPortScanner {
    ports: Arc<Mutex<Vec<String>>>,
}

#[cfg(test)]
impl FixedPortScanner {
    pub fn new<S: Into<String>>(ports: impl IntoIterator<Item = S>) -> Self {
        Self {
            ports: Arc::new(Mutex::new(ports.into_iter().map(Into::into).collect())),
        }
    }

    pub fn set_ports<S: Into<String>>(&self, ports: impl IntoIterator<Item = S>) {
        let mut guard = match self.ports.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = ports.into_iter().map(Into::into).collect();
    }
}

#[cfg(test)]
impl PortScanner for FixedPortScanner {
    fn available_ports(&self) -> Result<Vec<PortInfo>> {
        let guard = self
            .ports
            .lock()
            .map_err(|_| AppError::SerialError("Port list lock poisoned".to_string()))?;
        Ok(guard
            .iter()
            .map(|name| PortInfo {
                name: name.clone(),
                description: String::new(),
            })
            .collect())
    }
}

/// Parse a user-entered baud rate. Zero and non-numeric input are rejected.
pub fn validate_baud_rate(input: &str) -> Result<u32> {
    let trimmed = input.trim();
    let baud: u32 = trimmed
        .parse()
        .map_err(|_| AppError::ValidationError(format!("Invalid baud rate: {trimmed:?}")))?;
    if baud == 0 {
        return Err(AppError::ValidationError(
            "Baud rate must be greater than 0".to_string(),
        ));
    }
    if !SUPPORTED_BAUD_RATES.contains(&baud) {
        tracing::warn!("Baud rate {} is not in the supported list", baud);
    }
    Ok(baud)
}
