use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::event::EventStream;
use futures::StreamExt;
use tokio::{select, sync::mpsc, time};
use tracing::{info, warn};

use mcuterm::{
    App, AppEvent, ConfigManager, Dimensions, FIRMWARE_FILE, PortScanner, SystemPortScanner,
    enter_raw_terminal, init_panic_hook, init_tracing, restore_terminal, validate_baud_rate,
};

const TICK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(version, about = "Serial terminal and file manager for MicroPython-style boards")]
struct Args {
    /// Serial port to open on startup
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate, defaults to the configured one
    #[arg(short, long)]
    baud: Option<String>,

    /// Line terminator sent on Enter, with escapes, e.g. "\r\n"
    #[arg(long)]
    line_end: Option<String>,

    /// Show device output as hex pairs
    #[arg(long)]
    hex: bool,

    /// Log level written to mcuterm.log next to the config file
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Config file instead of ~/.config/mcuterm/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports and exit
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::Ports) = args.command {
        for port in SystemPortScanner.available_ports()? {
            println!("{}\t{}", port.name, port.description);
        }
        return Ok(());
    }

    let log_dir = match &args.config {
        Some(path) => path.parent().map(Path::to_path_buf).unwrap_or_default(),
        None => ConfigManager::config_dir()?,
    };
    let _log_guard = init_tracing(&args.log_level, &log_dir)?;
    init_panic_hook();

    let mut config = match &args.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(),
    }
    .context("Failed to load config")?;

    let baud = match &args.baud {
        Some(baud) => Some(validate_baud_rate(baud)?),
        None => None,
    };
    {
        let settings = config.settings_mut();
        if let Some(line_end) = &args.line_end {
            settings.line_end = line_end.clone();
        }
        if args.hex {
            settings.translate_hex = false;
        }
        if let Some(baud) = baud {
            settings.default_baud = baud;
        }
    }
    let baud = config.settings().default_baud;
    let firmware_file = ConfigManager::config_dir()?.join(FIRMWARE_FILE);

    enter_raw_terminal()?;

    let (tx, mut rx) = mpsc::channel::<AppEvent>(100);
    spawn_input_task(tx.clone());

    let mut app = App::new(io::stdout(), config.settings().clone(), tx).with_config(config);
    app = match app.with_firmware_file(firmware_file) {
        Ok(app) => app,
        Err(e) => {
            restore();
            return Err(e.into());
        }
    };
    if let Ok((columns, rows)) = crossterm::terminal::size() {
        app.set_dimensions(Dimensions { columns, rows });
    }

    match &args.port {
        Some(port) => {
            info!("Connecting to {} at {} baud", port, baud);
            if let Err(e) = app.connect(port, baud) {
                app.report(&e);
            }
        }
        None => app.welcome(),
    }

    let res = app.run(&mut rx).await;

    restore();
    res.map_err(Into::into)
}

/// Terminal events and a periodic tick, forwarded to the app loop.
fn spawn_input_task(tx: mpsc::Sender<AppEvent>) {
    let mut ticker = time::interval(TICK_INTERVAL);
    let mut event_stream = EventStream::new();

    tokio::spawn(async move {
        loop {
            let event = select! {
                event_result = event_stream.next() => match event_result {
                    None => break,
                    Some(Err(e)) => {
                        warn!("Terminal input failed: {}", e);
                        break;
                    }
                    Some(Ok(event)) => AppEvent::Input(event),
                },
                _ = ticker.tick() => AppEvent::Tick,
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
}

fn restore() {
    if let Err(e) = restore_terminal() {
        warn!("Failed to restore terminal: {}", e);
    }
}
