mod app;
mod config;
mod error;
mod escape;
mod events;
mod filesystem;
mod key_event;
mod protocol;
mod serial;
mod transfer;
mod utils;

// Re-export commonly used types
pub use app::{App, SessionRegistry};
pub use config::{AppSettings, ConfigManager, FIRMWARE_FILE, FirmwareSelection};
pub use error::{AppError, Result};
pub use escape::unescape;
pub use events::{AppEvent, BusEvent, EventBus, Notification, NotifyLevel, topic};
pub use filesystem::{FileNode, FileTree};
pub use protocol::{CommandLabel, Dimensions, SessionProtocol, TerminalOutput};
pub use serial::{PortInfo, PortScanner, SerialSession, SystemPortScanner, validate_baud_rate};
pub use transfer::{DownloadResponse, FileData, TransferProgress};
pub use utils::{LOG_FILE, enter_raw_terminal, init_panic_hook, init_tracing, restore_terminal};
