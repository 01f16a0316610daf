mod ports;
mod session;
mod transport;

#[cfg(test)]
pub use ports::FixedPortScanner;
pub use ports::{DEFAULT_BAUD_RATE, PortInfo, PortScanner, SystemPortScanner, validate_baud_rate};
pub use session::SerialSession;
pub use transport::{SerialTransport, SessionTransport, TransportEvent};
#[cfg(test)]
pub use transport::{CloseReason, MemoryTransport};
