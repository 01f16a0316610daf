pub mod ansi;
mod command;
mod filter;
mod line_editor;
mod machine;

pub use command::{CommandLabel, PendingCommand};
pub use filter::{DEFAULT_UNSUPPORTED_PATTERN, InputFilter};
pub use line_editor::{DEFAULT_HISTORY_LIMIT, LineEditor};
pub use machine::{Dimensions, SessionProtocol, TerminalOutput};
