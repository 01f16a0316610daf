pub mod firmware;
pub mod manager;

pub use firmware::{FIRMWARE_FILE, FirmwareSelection};
pub use manager::{AppSettings, ConfigManager};
