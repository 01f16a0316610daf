use std::io;
use std::path::Path;

use crossterm::cursor::Show;
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{AppError, Result};

pub const LOG_FILE: &str = "mcuterm.log";

/// Put the host terminal into the raw, paste-aware mode the REPL needs.
pub fn enter_raw_terminal() -> io::Result<()> {
    enable_raw_mode()?;
    #[cfg(not(windows))]
    execute!(io::stdout(), crossterm::event::EnableBracketedPaste)?;
    Ok(())
}

/// Undo [`enter_raw_terminal`]. Every step is attempted even if one fails;
/// the first failure is returned.
pub fn restore_terminal() -> io::Result<()> {
    let mut stdout = io::stdout();
    #[cfg(not(windows))]
    let paste = execute!(stdout, crossterm::event::DisableBracketedPaste);
    #[cfg(windows)]
    let paste: io::Result<()> = Ok(());
    let raw = disable_raw_mode();
    let cursor = execute!(stdout, Show);
    paste.and(raw).and(cursor)
}

pub fn init_panic_hook() {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        // already panicking, nothing useful to do with an error here
        let _ = restore_terminal();
        original_hook(panic_info);
    }));
}

/// Log to `LOG_FILE` under `log_dir` so device output on stdout stays clean.
///
/// Buffered lines are written until the returned guard is dropped.
pub fn init_tracing(log_level: &str, log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // RUST_LOG wins over the command line level
    let env_filter = log_filter(log_level)?;

    let fmt_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("Failed to initialize tracing: {}", e)))?;

    Ok(guard)
}

fn log_filter(log_level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(log_level)
        .map_err(|e| AppError::ConfigError(format!("Invalid log level {log_level:?}: {e}")))
}
