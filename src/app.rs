mod registry;

pub use registry::SessionRegistry;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{Event, KeyEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{AppSettings, ConfigManager, FirmwareSelection};
use crate::error::{AppError, Result};
use crate::escape::unescape;
use crate::events::{AppEvent, BusEvent, EventBus, Notification, NotifyLevel, topic};
use crate::filesystem::{Completion, DEVICE_ROOT, FileTree, ReplyDispatcher, ReplyInbox};
use crate::key_event::{CommandPrompt, KeyAction, PromptOutcome, map_terminal_key};
use crate::protocol::{
    CommandLabel, Dimensions, PendingCommand, SessionProtocol, TerminalOutput, ansi,
};
use crate::serial::{
    PortScanner, SerialSession, SerialTransport, SessionTransport, SystemPortScanner,
    TransportEvent, validate_baud_rate,
};
use crate::transfer::push::{push_statements, schedule_push};
use crate::transfer::tool::{DownloadJob, ToolCommand, spawn_download, spawn_flash};
use crate::transfer::{DownloadResponse, FileData, TransferProgress};

const HELP: &[&str] = &[
    "connect <port> [baud]    open a serial session (or switch to it)",
    "use <port>               switch the terminal to an open session",
    "sessions                 list open sessions",
    "disconnect               close the active session",
    "lineend <escaped>        line terminator sent on Enter, e.g. \\r\\n",
    "hex                      toggle text / hex display",
    "clear                    clear the terminal",
    "ls [deep]                refresh the device file tree",
    "tree                     print the device file tree",
    "run <path>               run a script on the device",
    "rm <path>                remove a device file",
    "rmdir <path>             remove a device directory",
    "mkdir <path>             create a directory under /usr/",
    "push <local> [dir]       copy a local file to the device",
    "ports                    list serial ports",
    "fw [select <path>|clear|flash [port]]   firmware selection and flashing",
    "quit                     leave mcuterm",
];

type TransportFactory =
    Box<dyn Fn(&str, u32, mpsc::Sender<AppEvent>) -> Box<dyn SessionTransport> + Send>;

/// An in-band push waiting for its last paced line.
struct PushJob {
    session: String,
    file_data: FileData,
    parent_path: String,
    token: CancellationToken,
}

/// Owns every session, the event bus, one reply dispatch table per session and
/// the shared device tree. All mutation happens on the task that drives [`App::run`].
pub struct App<W: Write> {
    out: W,
    /// Host-side text written before session output on the next flush.
    host_pending: String,
    settings: AppSettings,
    config: Option<ConfigManager>,
    firmware: FirmwareSelection,
    firmware_file: Option<PathBuf>,
    registry: SessionRegistry,
    bus: EventBus,
    inbox: ReplyInbox,
    /// Reply parsers keyed by session name.
    dispatchers: HashMap<String, ReplyDispatcher>,
    tree: FileTree,
    scanner: Arc<dyn PortScanner>,
    sender: mpsc::Sender<AppEvent>,
    transport_factory: TransportFactory,
    dimensions: Option<Dimensions>,
    prompt: CommandPrompt,
    prompt_open: bool,
    push: Option<PushJob>,
    /// Session whose port the download tool holds.
    tool_session: Option<String>,
    progress: Option<TransferProgress>,
    should_quit: bool,
}

impl<W: Write> App<W> {
    pub fn new(out: W, settings: AppSettings, sender: mpsc::Sender<AppEvent>) -> Self {
        let mut bus = EventBus::new();
        let (inbox, _) = ReplyInbox::subscribe(&mut bus);
        Self {
            out,
            host_pending: String::new(),
            settings,
            config: None,
            firmware: FirmwareSelection::default(),
            firmware_file: None,
            registry: SessionRegistry::new(),
            bus,
            inbox,
            dispatchers: HashMap::new(),
            tree: FileTree::new(),
            scanner: Arc::new(SystemPortScanner),
            sender,
            transport_factory: Box::new(
                |port: &str, baud: u32, sender: mpsc::Sender<AppEvent>| -> Box<dyn SessionTransport> {
                    Box::new(SerialTransport::new(port, port, baud, sender))
                },
            ),
            dimensions: None,
            prompt: CommandPrompt::default(),
            prompt_open: false,
            push: None,
            tool_session: None,
            progress: None,
            should_quit: false,
        }
    }

    /// Take settings from `config` and record recent ports in it.
    pub fn with_config(mut self, config: ConfigManager) -> Self {
        self.settings = config.settings().clone();
        self.config = Some(config);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn PortScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_transport_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str, u32, mpsc::Sender<AppEvent>) -> Box<dyn SessionTransport> + Send + 'static,
    {
        self.transport_factory = Box::new(factory);
        self
    }

    /// Load the firmware selection from `file` and persist changes back to it.
    pub fn with_firmware_file(mut self, file: PathBuf) -> Result<Self> {
        self.firmware = FirmwareSelection::load(&file)?;
        self.firmware_file = Some(file);
        Ok(self)
    }

    pub fn writer(&self) -> &W {
        &self.out
    }

    pub fn bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn session(&self, name: &str) -> Option<&SerialSession> {
        self.registry.get(name)
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn firmware(&self) -> &FirmwareSelection {
        &self.firmware
    }

    pub fn progress(&self) -> Option<&TransferProgress> {
        self.progress.as_ref()
    }

    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    pub fn set_dimensions(&mut self, dimensions: Dimensions) {
        self.dimensions = Some(dimensions);
        for (_, session) in self.registry.iter_mut() {
            session.protocol_mut().set_dimensions(dimensions);
        }
    }

    pub fn welcome(&mut self) {
        self.host_pending
            .push_str("mcuterm: press Ctrl-] for the command prompt, type help for commands.\r\n");
    }

    /// Show an error that happened outside the event loop, e.g. at startup.
    pub fn report(&mut self, error: &AppError) {
        self.notify(Notification::error(error.to_string()));
    }

    pub async fn run(&mut self, rx: &mut mpsc::Receiver<AppEvent>) -> Result<()> {
        self.flush_output()?;
        while !self.should_quit {
            let Some(event) = rx.recv().await else {
                warn!("App event channel closed");
                break;
            };
            self.handle_event(event)?;
        }
        self.shutdown()
    }

    /// Apply one event. Only host I/O failures and failed port closes are returned;
    /// everything else is shown to the user.
    pub fn handle_event(&mut self, event: AppEvent) -> Result<()> {
        match event {
            AppEvent::Input(input) => self.on_input(input)?,
            AppEvent::Transport { session, event } => self.on_transport_event(&session, event),
            AppEvent::DeviceReappeared { session } => {
                if let Some(session) = self.registry.get_mut(&session) {
                    session.on_device_reappeared();
                }
            }
            AppEvent::CommandSentinel { session, command } => {
                self.on_command_sentinel(&session, command)
            }
            AppEvent::CommandSettled { session, command } => {
                if let Some(session) = self.registry.get_mut(&session) {
                    session.protocol_mut().finish_pending(command);
                }
            }
            AppEvent::PushLine {
                session,
                line,
                index,
                total,
            } => self.on_push_line(&session, &line, index, total),
            AppEvent::ToolProgress { session, percent } => self.on_tool_progress(&session, percent),
            AppEvent::DownloadDone {
                session,
                label,
                response,
            } => self.on_download_done(session, label, response),
            AppEvent::FlashDone { success } => self.on_flash_done(success),
            AppEvent::Tick => {}
        }
        self.process_replies();
        self.flush_output()
    }

    /// Close every session. The first failed close is returned.
    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(job) = self.push.take() {
            job.token.cancel();
        }
        let mut result = Ok(());
        for mut session in self.registry.drain() {
            if let Err(e) = session.close() {
                error!("Closing {} failed: {}", session.name(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.tree.clear();
        result
    }

    fn on_input(&mut self, input: Event) -> Result<()> {
        match input {
            Event::Key(key) => return self.on_key(key),
            Event::Paste(text) => self.send_input(&text),
            Event::Resize(columns, rows) => self.set_dimensions(Dimensions { columns, rows }),
            _ => {}
        }
        Ok(())
    }

    fn on_key(&mut self, key: KeyEvent) -> Result<()> {
        if !self.prompt_open {
            match map_terminal_key(&key) {
                KeyAction::OpenPrompt => {
                    self.prompt_open = true;
                    let line = format!("\r\n{}", self.prompt.render());
                    self.host_pending.push_str(&line);
                }
                KeyAction::Send(text) => self.send_input(&text),
                KeyAction::Ignore => {}
            }
            return Ok(());
        }

        match self.prompt.handle_key(&key) {
            PromptOutcome::Editing => {
                let line = self.prompt.render();
                self.host_pending.push_str(&line);
            }
            PromptOutcome::Cancel => {
                self.prompt_open = false;
                self.host_pending.push('\r');
                self.host_pending.push_str(ansi::CLEAR_LINE);
                self.redraw_active();
            }
            PromptOutcome::Submit(line) => {
                self.prompt_open = false;
                self.host_pending.push_str("\r\n");
                match self.execute_command(&line) {
                    Ok(()) => {}
                    Err(e @ AppError::CloseError(_)) => return Err(e),
                    Err(e) => self.notify(Notification::error(e.to_string())),
                }
                self.redraw_active();
            }
        }
        Ok(())
    }

    fn send_input(&mut self, text: &str) {
        let Some(session) = self.registry.active_mut() else {
            self.notify(Notification::info(
                "No serial session. Press Ctrl-] and type connect <port>.",
            ));
            return;
        };
        if let Err(e) = session.protocol_mut().handle_input(text) {
            warn!("Input not sent: {}", e);
        }
    }

    fn redraw_active(&mut self) {
        let dimensions = self.dimensions;
        if let Some(session) = self.registry.active_mut() {
            session.protocol_mut().open(dimensions);
        }
    }

    fn on_transport_event(&mut self, name: &str, event: TransportEvent) {
        let Some(session) = self.registry.get_mut(name) else {
            debug!("Event for closed session {}: {:?}", name, event);
            return;
        };
        let opened = event == TransportEvent::Opened;
        let closed = matches!(event, TransportEvent::Closed(_));
        session.on_transport_event(event, &mut self.bus);
        let bootstrapping = opened
            && session
                .protocol()
                .pending()
                .is_some_and(|p| p.label == CommandLabel::BootstrapList);

        if bootstrapping {
            self.track_command(name, CommandLabel::BootstrapList);
        }
        if closed {
            if self.tool_session.as_deref() == Some(name) {
                debug!("Port {} held closed for a download", name);
            } else {
                self.abort_push(name);
                self.tree.clear();
                self.bus.emit(topic::TREE_REFRESH, &BusEvent::Signal);
            }
        }
    }

    /// Re-emit the command token for replies that never terminate on their own.
    /// Only the exact command the timer was armed for is finished.
    fn on_command_sentinel(&mut self, name: &str, command: PendingCommand) {
        let pending = self.registry.get(name).and_then(|s| s.protocol().pending());
        if pending != Some(command) {
            debug!("Stale sentinel for {} #{} on {}", command.label, command.seq, name);
            return;
        }
        debug!("Sentinel for {} on {}", command.label, name);
        let reply = BusEvent::Reply {
            session: name.to_string(),
            text: command.label.tag().to_string(),
        };
        self.bus.emit(command.label.topic(), &reply);
    }

    fn begin_reply(&mut self, session: &str, label: CommandLabel) {
        self.dispatchers
            .entry(session.to_string())
            .or_default()
            .begin(label);
    }

    fn track_command(&mut self, session: &str, label: CommandLabel) {
        self.begin_reply(session, label);
        let pending = self
            .registry
            .get(session)
            .and_then(|s| s.protocol().pending())
            .filter(|p| p.label == label);
        if let Some(command) = pending
            && let Some(delay) = self.settings.sentinel_delay(label)
        {
            self.schedule(
                delay,
                AppEvent::CommandSentinel {
                    session: session.to_string(),
                    command,
                },
            );
        }
    }

    fn schedule(&self, delay: Duration, event: AppEvent) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(event).await.is_err() {
                debug!("Timer fired after the app loop stopped");
            }
        });
    }

    fn process_replies(&mut self) {
        for (label, event) in self.inbox.drain() {
            let Some(name) = event.session().map(str::to_string) else {
                continue;
            };
            let Some(dispatcher) = self.dispatchers.get_mut(&name) else {
                warn!("Reply for {} from unknown session {}", label, name);
                continue;
            };
            if let Some(completion) = dispatcher.dispatch(label, &event, &mut self.tree) {
                self.apply_completion(name, label, completion);
            }
        }
    }

    fn apply_completion(&mut self, name: String, label: CommandLabel, completion: Completion) {
        if completion.tree_changed {
            self.bus.emit(topic::TREE_REFRESH, &BusEvent::Signal);
        }

        let settle = self.settings.settle_delay(label);
        let mut settle_later = None;
        if let Some(session) = self.registry.get_mut(&name) {
            let protocol = session.protocol_mut();
            if let Some(text) = &completion.inject {
                protocol.inject_text(text);
            }
            if completion.error.is_some() {
                protocol.reset_command();
            } else if settle.is_zero() {
                protocol.finish_command(label);
            } else {
                settle_later = protocol.pending().filter(|p| p.label == label);
            }
            if completion.reopen && !session.reopen() {
                warn!("Could not reopen {} after download", name);
            }
        }
        if let Some(command) = settle_later {
            self.schedule(
                settle,
                AppEvent::CommandSettled {
                    session: name,
                    command,
                },
            );
        }

        if matches!(
            label,
            CommandLabel::DownloadFile | CommandLabel::SelectiveDownload
        ) {
            let success = completion.error.is_none();
            if let Some(progress) = self.finish_transfer(success)
                && success
            {
                self.notify(Notification::info(format!(
                    "{} copied in {:.1}s",
                    progress.name,
                    progress.elapsed().as_secs_f64()
                )));
            }
        }
        if let Some(message) = completion.error {
            self.notify(Notification::error(message));
        }
    }

    fn notify(&mut self, notification: Notification) {
        match notification.level {
            NotifyLevel::Info => info!("{}", notification.message),
            NotifyLevel::Error => error!("{}", notification.message),
        }
        self.bus
            .emit(topic::NOTIFICATION, &BusEvent::Notify(notification.clone()));
        self.print(&format!("[mcuterm] {}\r\n", notification.message));
    }

    /// Show local text in the active terminal, or on the host without one.
    fn print(&mut self, text: &str) {
        match self.registry.active_mut() {
            Some(session) => {
                let protocol = session.protocol_mut();
                if !protocol.ends_with_newline() {
                    protocol.inject_text("\r\n");
                }
                protocol.inject_text(text);
            }
            None => self.host_pending.push_str(text),
        }
    }

    fn print_lines(&mut self, lines: &[String]) {
        let mut text = lines.join("\r\n");
        text.push_str("\r\n");
        self.print(&text);
    }

    fn flush_output(&mut self) -> Result<()> {
        if !self.host_pending.is_empty() {
            self.out.write_all(self.host_pending.as_bytes())?;
            self.host_pending.clear();
        }

        let active = self.registry.active_name().map(str::to_string);
        let mut closed = Vec::new();
        for (name, session) in self.registry.iter_mut() {
            let visible = active.as_deref() == Some(name.as_str());
            for output in session.protocol_mut().take_output() {
                match output {
                    TerminalOutput::Text(text) if visible => self.out.write_all(text.as_bytes())?,
                    TerminalOutput::Text(_) => {}
                    TerminalOutput::Close => closed.push(name.clone()),
                }
            }
        }

        for name in closed {
            self.drop_session(&name);
        }
        if !self.host_pending.is_empty() {
            self.out.write_all(self.host_pending.as_bytes())?;
            self.host_pending.clear();
        }
        self.out.flush()?;
        Ok(())
    }

    /// The device asked to end the session.
    fn drop_session(&mut self, name: &str) {
        let Some(mut session) = self.registry.remove(name) else {
            return;
        };
        if session.is_open()
            && let Err(e) = session.close()
        {
            warn!("Closing {} failed: {}", name, e);
        }
        self.forget_session(name);
    }

    fn close_session(&mut self, name: &str) -> Result<()> {
        let mut session = self
            .registry
            .remove(name)
            .ok_or(AppError::NoActiveSession)?;
        let result = session.close();
        self.forget_session(name);
        result
    }

    fn forget_session(&mut self, name: &str) {
        info!("Session {} closed", name);
        self.dispatchers.remove(name);
        self.abort_push(name);
        self.tree.clear();
        self.bus.emit(topic::TREE_REFRESH, &BusEvent::Signal);
        self.bus.emit(topic::STATUS_DISCONNECTED, &BusEvent::Signal);
        self.host_pending
            .push_str(&format!("\r\n[mcuterm] Session {name} closed.\r\n"));

        if self.registry.active_name().is_none()
            && let Some(next) = self.registry.names().into_iter().next()
            && self.registry.set_active(&next).is_ok()
        {
            self.redraw_active();
        }
    }

    fn active_session_name(&self) -> Result<String> {
        self.registry
            .active_name()
            .map(str::to_string)
            .ok_or(AppError::NoActiveSession)
    }

    fn active_session_mut(&mut self) -> Result<&mut SerialSession> {
        self.registry.active_mut().ok_or(AppError::NoActiveSession)
    }

    /// Parse and run one command prompt line.
    pub fn execute_command(&mut self, line: &str) -> Result<()> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((command, args)) = words.split_first() else {
            return Ok(());
        };
        debug!("Command: {}", line);

        match (*command, args) {
            ("connect", [port]) => {
                let baud = self.settings.default_baud;
                self.connect(port, baud)
            }
            ("connect", [port, baud]) => {
                let baud = validate_baud_rate(baud)?;
                self.connect(port, baud)
            }
            ("use", [name]) => {
                self.registry.set_active(name)?;
                self.redraw_active();
                Ok(())
            }
            ("sessions", []) => {
                self.show_sessions();
                Ok(())
            }
            ("disconnect", []) => self.disconnect(),
            ("lineend", [ending]) => self.set_line_end(ending),
            ("hex", []) => self.toggle_hex(),
            ("clear", []) => self.clear_terminal(),
            ("ls", []) => self.list_files(false),
            ("ls", ["deep"]) => self.list_files(true),
            ("tree", []) => {
                self.show_tree();
                Ok(())
            }
            ("run", [path]) => self.run_script(path),
            ("rm", [path]) => self.remove_file(path),
            ("rmdir", [path]) => self.remove_dir(path),
            ("mkdir", [path]) => self.make_dir(path),
            ("push", [local]) => self.push_file(Path::new(local), DEVICE_ROOT),
            ("push", [local, dir]) => self.push_file(Path::new(local), dir),
            ("ports", []) => self.show_ports(),
            ("fw", []) => {
                self.show_firmware();
                Ok(())
            }
            ("fw", ["select", path]) => self.select_firmware(path),
            ("fw", ["clear"]) => self.clear_firmware(),
            ("fw", ["flash"]) => self.flash_firmware(None),
            ("fw", ["flash", port]) => self.flash_firmware(Some(*port)),
            ("help", []) => {
                let lines: Vec<String> = HELP.iter().map(|l| l.to_string()).collect();
                self.print_lines(&lines);
                Ok(())
            }
            ("quit" | "exit", []) => {
                self.should_quit = true;
                Ok(())
            }
            _ => Err(AppError::ValidationError(format!(
                "Unknown command: {line}. Type help for a list."
            ))),
        }
    }

    /// Open a session on `port`, or switch to it if one is already open.
    pub fn connect(&mut self, port: &str, baud: u32) -> Result<()> {
        if port.trim().is_empty() {
            return Err(AppError::ValidationError("Port name is empty".to_string()));
        }
        let baud = validate_baud_rate(&baud.to_string())?;
        if self.registry.contains(port) {
            info!("Switching to open session {}", port);
            self.registry.set_active(port)?;
            self.redraw_active();
            return Ok(());
        }

        let transport = (self.transport_factory)(port, baud, self.sender.clone());
        let protocol = SessionProtocol::new(
            transport,
            self.settings.translate_hex,
            self.settings.line_end(),
        )
        .with_filter(self.settings.input_filter()?)
        .with_history_limit(self.settings.history_limit);
        let mut session = SerialSession::new(
            port,
            protocol,
            Arc::clone(&self.scanner),
            self.sender.clone(),
        )
        .with_reconnect_interval(self.settings.reconnect_interval());

        session.open(self.dimensions);
        self.registry.insert(session)?;
        if let Some(config) = self.config.as_mut()
            && let Err(e) = config.touch_port(port, baud)
        {
            warn!("Could not record recent port: {}", e);
        }
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        let name = self.active_session_name()?;
        self.close_session(&name)
    }

    pub fn set_line_end(&mut self, escaped: &str) -> Result<()> {
        self.active_session_mut()?
            .protocol_mut()
            .set_line_end(unescape(escaped));
        self.notify(Notification::info(format!("Line ending set to {escaped}")));
        Ok(())
    }

    pub fn toggle_hex(&mut self) -> Result<()> {
        let protocol = self.active_session_mut()?.protocol_mut();
        protocol.toggle_hex_translate();
        let mode = if protocol.translate_hex() { "text" } else { "hex" };
        self.notify(Notification::info(format!("Showing device output as {mode}")));
        Ok(())
    }

    pub fn clear_terminal(&mut self) -> Result<()> {
        self.active_session_mut()?.protocol_mut().clear();
        Ok(())
    }

    /// Refresh the tree: the per-entry `/usr` listing, or the whole tree via a helper.
    pub fn list_files(&mut self, deep: bool) -> Result<()> {
        let name = self.active_session_name()?;
        let label = if deep {
            CommandLabel::ListDir
        } else {
            CommandLabel::BootstrapList
        };
        let session = self.active_session_mut()?;
        if let Some(pending) = session.protocol().pending() {
            return Err(AppError::CommandPending {
                pending: pending.label,
                requested: label,
            });
        }
        if deep {
            session.read_tree_deep()?;
        } else {
            session.read_stat_files()?;
        }
        self.track_command(&name, label);
        Ok(())
    }

    pub fn run_script(&mut self, path: &str) -> Result<()> {
        validate_device_path(path)?;
        let lines = [
            "import example\r\n".to_string(),
            format!("example.exec('{}')\r\n", path.trim_start_matches('/')),
        ];
        self.issue(CommandLabel::RunScript, &lines)
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        validate_device_path(path)?;
        self.issue(
            CommandLabel::RemoveFile,
            &[format!("uos.remove('{path}')\r\n")],
        )
    }

    pub fn remove_dir(&mut self, path: &str) -> Result<()> {
        validate_device_path(path)?;
        self.issue(CommandLabel::RemoveDir, &[format!("uos.rmdir('{path}')\r\n")])
    }

    pub fn make_dir(&mut self, path: &str) -> Result<()> {
        validate_device_path(path)?;
        if !path.starts_with("/usr/") || path.trim_end_matches('/') == DEVICE_ROOT {
            return Err(AppError::ValidationError(
                "Directories can only be created under /usr/".to_string(),
            ));
        }
        let lines = [
            "import ql_fs\r\n".to_string(),
            format!("ql_fs.mkdirs('{path}')\r\n"),
        ];
        self.issue(CommandLabel::CreateDir, &lines)
    }

    fn issue(&mut self, label: CommandLabel, lines: &[String]) -> Result<()> {
        let name = self.active_session_name()?;
        self.active_session_mut()?
            .protocol_mut()
            .issue_command(label, lines)?;
        self.track_command(&name, label);
        Ok(())
    }

    /// Copy `local` into `remote_dir` on the device, through the REPL or the
    /// configured download tool.
    pub fn push_file(&mut self, local: &Path, remote_dir: &str) -> Result<()> {
        let name = self.active_session_name()?;
        let parent = device_dir(remote_dir)?;
        let filename = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                AppError::ValidationError(format!("{} is not a file", local.display()))
            })?;
        if self.push.is_some() || self.tool_session.is_some() {
            return Err(AppError::ValidationError(
                "A file transfer is already running".to_string(),
            ));
        }

        if self.settings.use_download_tool {
            self.push_with_tool(&name, local, &filename, parent)
        } else {
            self.push_in_band(&name, local, &filename, parent)
        }
    }

    fn push_in_band(&mut self, name: &str, local: &Path, filename: &str, parent: String) -> Result<()> {
        let content = std::fs::read(local)?;
        let remote = format!("{parent}/{filename}");
        let statements = push_statements(&content, &remote);
        let (open, body) = statements.split_at(2);

        self.active_session_mut()?
            .protocol_mut()
            .issue_command(CommandLabel::DownloadFile, open)?;
        self.track_command(name, CommandLabel::DownloadFile);

        let (base, step) = self.settings.push_delays();
        let token = schedule_push(name.to_string(), body.to_vec(), base, step, self.sender.clone());
        self.push = Some(PushJob {
            session: name.to_string(),
            file_data: FileData {
                filename: filename.to_string(),
                file_size_in_bytes: content.len() as u64,
            },
            parent_path: parent,
            token,
        });
        self.start_transfer(filename, body.len());
        Ok(())
    }

    fn push_with_tool(&mut self, name: &str, local: &Path, filename: &str, parent: String) -> Result<()> {
        if !local.is_file() {
            return Err(AppError::ValidationError(format!(
                "{} is not a file",
                local.display()
            )));
        }
        let tool = ToolCommand::parse(&self.settings.download_tool)?;
        let session = self.active_session_mut()?;
        if let Some(pending) = session.protocol().pending() {
            return Err(AppError::CommandPending {
                pending: pending.label,
                requested: CommandLabel::DownloadFile,
            });
        }
        let job = DownloadJob {
            session: name.to_string(),
            label: CommandLabel::DownloadFile,
            port: session.port().to_string(),
            baud: session.baud_rate(),
            source: local.to_string_lossy().into_owned(),
            parent_path: parent,
        };

        // The tool needs the port to itself
        session.protocol_mut().transport_mut().close()?;
        self.tool_session = Some(name.to_string());
        self.start_transfer(filename, 100);
        spawn_download(tool, job, self.sender.clone());
        Ok(())
    }

    fn on_push_line(&mut self, name: &str, line: &str, index: usize, total: usize) {
        if self.push.as_ref().is_none_or(|job| job.session != name) {
            debug!("Stale push line {} for {}", index, name);
            return;
        }
        let written = match self.registry.get_mut(name) {
            Some(session) => session.protocol_mut().write(line),
            None => Err(AppError::NoActiveSession),
        };
        match written {
            Ok(true) => {}
            Ok(false) => {
                warn!("Push line {} of {} was filtered", index + 1, total);
                self.complete_push(false);
                return;
            }
            Err(e) => {
                warn!("Push line {} of {} failed: {}", index + 1, total, e);
                self.complete_push(false);
                return;
            }
        }

        if let Some(progress) = self.progress.as_mut() {
            progress.update_step(index);
        }
        self.bus
            .emit(topic::UPDATE_PROGRESS, &BusEvent::Progress { index, total });
        if index + 1 == total {
            self.complete_push(true);
        }
    }

    /// Report the push result on the download topic like the tool path does.
    fn complete_push(&mut self, success: bool) {
        let Some(job) = self.push.take() else {
            return;
        };
        job.token.cancel();
        let response = DownloadResponse::new(job.file_data, job.parent_path, success);
        let event = BusEvent::Download {
            session: job.session,
            response,
        };
        self.bus.emit(CommandLabel::DownloadFile.topic(), &event);
    }

    fn abort_push(&mut self, name: &str) {
        if self.push.as_ref().is_some_and(|job| job.session == name) {
            if let Some(job) = self.push.take() {
                job.token.cancel();
            }
            if let Some(mut progress) = self.progress.take() {
                progress.mark_completed(false, Some("Port closed".to_string()));
                warn!("Push of {} aborted after {:?}", progress.name, progress.elapsed());
            }
            self.bus.emit(topic::DOWNLOAD_FINISHED, &BusEvent::Signal);
        }
    }

    fn on_tool_progress(&mut self, session: &str, percent: Option<u8>) {
        let Some(percent) = percent else {
            return;
        };
        trace!("{} tool progress {}%", session, percent);
        let Some(progress) = self.progress.as_mut() else {
            return;
        };
        progress.update_percent(percent);
        let line = format!("\r{}{}: {}%", ansi::CLEAR_LINE, progress.name, percent);
        self.bus
            .emit(topic::UPDATE_PROGRESS, &BusEvent::Percent(percent));
        self.host_pending.push_str(&line);
    }

    fn on_download_done(&mut self, session: String, label: CommandLabel, response: DownloadResponse) {
        if self.tool_session.as_deref() == Some(session.as_str()) {
            self.tool_session = None;
        }
        if !self.registry.contains(&session) {
            warn!("Download finished for closed session {}", session);
            self.finish_transfer(response.is_success());
            return;
        }
        self.begin_reply(&session, label);
        self.bus
            .emit(label.topic(), &BusEvent::Download { session, response });
    }

    fn on_flash_done(&mut self, success: bool) {
        self.finish_transfer(success);
        if success {
            self.notify(Notification::info("Firmware flashed."));
        } else {
            self.notify(Notification::error("Firmware flashing failed."));
        }
    }

    fn start_transfer(&mut self, name: &str, total: usize) {
        info!("Transfer of {} started", name);
        self.progress = Some(TransferProgress::new(name, total));
        self.bus.emit(topic::START_PROGRESS, &BusEvent::Signal);
    }

    fn finish_transfer(&mut self, success: bool) -> Option<TransferProgress> {
        self.bus.emit(topic::DOWNLOAD_FINISHED, &BusEvent::Signal);
        let mut progress = self.progress.take()?;
        progress.mark_completed(success, None);
        self.host_pending.push('\r');
        self.host_pending.push_str(ansi::CLEAR_LINE);
        Some(progress)
    }

    pub fn show_tree(&mut self) {
        let lines = self.tree.render_lines();
        if lines.is_empty() {
            self.print("(no files)\r\n");
        } else {
            self.print_lines(&lines);
        }
    }

    pub fn show_ports(&mut self) -> Result<()> {
        let ports = self.scanner.available_ports()?;
        if ports.is_empty() {
            self.print("No serial ports found.\r\n");
            return Ok(());
        }
        let lines: Vec<String> = ports
            .iter()
            .map(|port| {
                let open = if self.registry.contains(&port.name) { " (open)" } else { "" };
                format!("{}  {}{}", port.name, port.description, open)
            })
            .collect();
        self.print_lines(&lines);
        Ok(())
    }

    pub fn show_sessions(&mut self) {
        let active = self.registry.active_name().map(str::to_string);
        let lines: Vec<String> = self
            .registry
            .names()
            .into_iter()
            .map(|name| {
                let marker = if active.as_deref() == Some(name.as_str()) { "*" } else { " " };
                format!("{marker} {name}")
            })
            .collect();
        if lines.is_empty() {
            self.print("No open sessions.\r\n");
        } else {
            self.print_lines(&lines);
        }
    }

    pub fn show_firmware(&mut self) {
        let text = if self.firmware.is_empty() {
            "No firmware selected.\r\n".to_string()
        } else {
            format!("Firmware: {}\r\n", self.firmware.path)
        };
        self.print(&text);
    }

    pub fn select_firmware(&mut self, path: &str) -> Result<()> {
        self.firmware.select(path);
        self.save_firmware()?;
        self.notify(Notification::info(format!("Firmware set to {path}")));
        Ok(())
    }

    pub fn clear_firmware(&mut self) -> Result<()> {
        self.firmware.clear();
        self.save_firmware()?;
        self.notify(Notification::info("Firmware selection cleared"));
        Ok(())
    }

    fn save_firmware(&self) -> Result<()> {
        match &self.firmware_file {
            Some(file) => self.firmware.save(file),
            None => Ok(()),
        }
    }

    /// Flash the selected firmware on `port`, or the active session's port.
    /// An open session on that port is closed first.
    pub fn flash_firmware(&mut self, port: Option<&str>) -> Result<()> {
        let firmware = self.firmware.flashable_path()?;
        let port = match port {
            Some(port) => port.to_string(),
            None => self
                .registry
                .active()
                .map(|s| s.port().to_string())
                .ok_or(AppError::NoActiveSession)?,
        };
        let tool = ToolCommand::parse(&self.settings.flash_tool)?;
        if self.registry.contains(&port) {
            self.close_session(&port)?;
        }

        let firmware = firmware.to_string_lossy().into_owned();
        self.start_transfer(&firmware, 100);
        spawn_flash(tool, port, firmware, self.sender.clone());
        Ok(())
    }
}

/// Device paths are absolute and go inside single-quoted literals.
fn validate_device_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.contains('\'') || path.contains('\\') {
        return Err(AppError::ValidationError(format!(
            "Invalid device path: {path}"
        )));
    }
    Ok(())
}

/// Normalize a push target directory, which must lie under `/usr`.
fn device_dir(dir: &str) -> Result<String> {
    validate_device_path(dir)?;
    let trimmed = dir.trim_end_matches('/');
    if trimmed != DEVICE_ROOT && !trimmed.starts_with("/usr/") {
        return Err(AppError::ValidationError(format!(
            "Files can only be copied under {DEVICE_ROOT}"
        )));
    }
    Ok(trimmed.to_string())
}
