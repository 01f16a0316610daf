use tracing::{debug, error, trace};

use super::ansi;
use super::command::{CommandLabel, DISCONNECT_SENTINEL, PendingCommand};
use super::filter::InputFilter;
use super::line_editor::LineEditor;
use crate::error::{AppError, Result};
use crate::escape::unescape;
use crate::serial::SessionTransport;

const BACKSPACE: &str = "\x7f";
const DELETE: &str = "\x1b[3~";
const CSI: &str = "\x1b[";

/// Current size of the terminal view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub columns: u16,
    pub rows: u16,
}

/// What the host terminal should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutput {
    Text(String),
    Close,
}

/// Demultiplexes one device byte stream into visible output and command replies.
///
/// Idle, device bytes are rendered (as text or hex pairs) above a locally edited
/// input line. With a command pending, every chunk is returned as reply text for
/// the command's label instead and nothing is rendered until the issuer calls
/// [`SessionProtocol::finish_command`].
pub struct SessionProtocol {
    transport: Box<dyn SessionTransport>,
    pending: Option<PendingCommand>,
    next_seq: u64,
    /// `true` decodes device bytes as text, `false` shows them as hex pairs.
    translate_hex: bool,
    line_end: String,
    dimensions: Option<Dimensions>,
    editor: LineEditor,
    ends_with_newline: bool,
    hex_column: usize,
    filter: InputFilter,
    output: Vec<TerminalOutput>,
}

impl SessionProtocol {
    pub fn new(
        transport: Box<dyn SessionTransport>,
        translate_hex: bool,
        line_end: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            pending: None,
            next_seq: 0,
            translate_hex,
            line_end: line_end.into(),
            dimensions: None,
            editor: LineEditor::default(),
            ends_with_newline: false,
            hex_column: 0,
            filter: InputFilter::default(),
            output: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: InputFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.editor = LineEditor::new(limit);
        self
    }

    pub fn open(&mut self, dimensions: Option<Dimensions>) {
        self.dimensions = dimensions;
        self.update_input_area();
    }

    pub fn transport(&self) -> &dyn SessionTransport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn SessionTransport {
        self.transport.as_mut()
    }

    pub fn pending(&self) -> Option<PendingCommand> {
        self.pending
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drain everything rendered since the last call.
    pub fn take_output(&mut self) -> Vec<TerminalOutput> {
        std::mem::take(&mut self.output)
    }

    /// Forward text to the device unless the input filter rejects it.
    ///
    /// Returns `Ok(false)` when the text was dropped.
    pub fn write(&mut self, text: &str) -> Result<bool> {
        if self.filter.rejects(text) {
            debug!("Dropping unsupported input: {:?}", text);
            return Ok(false);
        }
        if let Err(e) = self.transport.write(text.as_bytes()) {
            self.on_transport_error(&e.to_string());
            return Err(e);
        }
        Ok(true)
    }

    /// Enter Command-Pending for `label`, rejecting if another command is out.
    pub fn begin_command(&mut self, label: CommandLabel) -> Result<()> {
        if let Some(pending) = self.pending {
            return Err(AppError::CommandPending {
                pending: pending.label,
                requested: label,
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!("Command {} #{} pending", label, seq);
        self.pending = Some(PendingCommand { label, seq });
        Ok(())
    }

    /// Send a whole internal command: enter Command-Pending, then write each line.
    pub fn issue_command<S: AsRef<str>>(&mut self, label: CommandLabel, lines: &[S]) -> Result<()> {
        self.begin_command(label)?;
        for line in lines {
            match self.write(line.as_ref()) {
                Ok(true) => {}
                Ok(false) => {
                    self.pending = None;
                    return Err(AppError::ValidationError(format!(
                        "Command {label} contains unsupported characters"
                    )));
                }
                Err(e) => {
                    self.pending = None;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Leave Command-Pending once the reply for `label` is complete.
    ///
    /// Returns false if `label` was not the pending command.
    pub fn finish_command(&mut self, label: CommandLabel) -> bool {
        match self.pending {
            Some(pending) if pending.label == label => {
                debug!("Command {} finished", label);
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Leave Command-Pending only if `command` is still the one pending.
    pub fn finish_pending(&mut self, command: PendingCommand) -> bool {
        if self.pending != Some(command) {
            debug!("Command {} #{} already gone", command.label, command.seq);
            return false;
        }
        self.finish_command(command.label)
    }

    /// Drop any pending command, e.g. after a parse error or a disconnect.
    pub fn reset_command(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("Command {} reset", pending.label);
        }
    }

    /// Host input: keystrokes, pasted text, or `[TAG]`-prefixed internal commands.
    pub fn handle_input(&mut self, data: &str) -> Result<()> {
        let mut rest = data;

        while !rest.is_empty() {
            if let Some((label, body)) = CommandLabel::split_tagged(rest) {
                let began = match self.pending {
                    Some(pending) if pending.label == label => false,
                    _ => {
                        self.begin_command(label)?;
                        true
                    }
                };
                let written = self.write(&unescape(body));
                if began && !matches!(written, Ok(true)) {
                    self.pending = None;
                }
                return match written {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(AppError::ValidationError(format!(
                        "Command {label} contains unsupported characters"
                    ))),
                    Err(e) => Err(e),
                };
            }

            if let Some(next) = rest.strip_prefix('\r') {
                self.submit_line()?;
                rest = next;
                continue;
            }

            if let Some(next) = rest.strip_prefix(BACKSPACE) {
                if self.editor.backspace() {
                    self.update_input_area();
                }
                rest = next;
                continue;
            }

            if let Some(next) = rest.strip_prefix(DELETE) {
                if self.editor.delete_forward() {
                    self.update_input_area();
                }
                rest = next;
                continue;
            }

            if let Some(after_csi) = rest.strip_prefix(CSI) {
                if let Some(consumed) = self.handle_csi(after_csi) {
                    rest = &after_csi[consumed..];
                    continue;
                }
            }

            let Some(ch) = rest.chars().next() else { break };
            self.editor.insert_char(ch);
            self.update_input_area();
            rest = &rest[ch.len_utf8()..];
        }

        Ok(())
    }

    /// Navigation keys and cursor reports after `ESC [`. Returns bytes consumed.
    fn handle_csi(&mut self, seq: &str) -> Option<usize> {
        match seq.chars().next()? {
            'A' => {
                if self.editor.history_prev() {
                    self.update_input_area();
                }
                Some(1)
            }
            'B' => {
                if self.editor.history_next() {
                    self.update_input_area();
                }
                Some(1)
            }
            'C' => {
                self.editor.move_right();
                self.update_input_area();
                Some(1)
            }
            'D' => {
                self.editor.move_left();
                self.update_input_area();
                Some(1)
            }
            'H' => {
                self.editor.move_home();
                self.update_input_area();
                Some(1)
            }
            'F' => {
                self.editor.move_end();
                self.update_input_area();
                Some(1)
            }
            _ => cursor_report_len(seq),
        }
    }

    fn submit_line(&mut self) -> Result<()> {
        let line = self.editor.submit();
        if !self.ends_with_newline {
            self.inject_text("\r\n");
        }
        let payload = format!("{}{}", unescape(&line), self.line_end);
        let written = self.write(&payload);
        self.update_input_area();
        written.map(|_| ())
    }

    /// Demultiplexing entry point for bytes read from the device.
    ///
    /// With a command pending the chunk is handed back as that command's reply
    /// and nothing is rendered.
    pub fn on_device_bytes(&mut self, data: &[u8]) -> Option<(CommandLabel, String)> {
        if let Some(pending) = self.pending {
            let text = String::from_utf8_lossy(data).into_owned();
            trace!(target: "device", "{} reply chunk: {:?}", pending.label, text);
            return Some((pending.label, text));
        }
        self.render(data);
        None
    }

    /// Render text as if the device had sent it, always in text mode.
    pub fn inject_text(&mut self, text: &str) {
        let previous = self.translate_hex;
        self.translate_hex = true;
        self.render(text.as_bytes());
        self.translate_hex = previous;
    }

    fn render(&mut self, data: &[u8]) {
        if data == DISCONNECT_SENTINEL.as_bytes() {
            debug!("Disconnect sentinel received, closing terminal");
            self.output.push(TerminalOutput::Close);
            return;
        }

        let text = String::from_utf8_lossy(data);
        debug!(target: "device", "{:?}", text);

        self.emit(ansi::RESTORE_CURSOR);
        self.emit(&ansi::clear_screen(0));

        if self.translate_hex {
            self.ends_with_newline = ends_on_clean_line(&text);
            if ends_on_clean_line(&text) || text.contains('\n') {
                self.hex_column = 0;
            }
            self.emit(&text);
        } else {
            let hex = self.hex_pairs(data);
            self.ends_with_newline = false;
            self.emit(&hex);
        }

        self.emit(ansi::SAVE_CURSOR);
        self.update_input_area();
    }

    fn hex_pairs(&mut self, data: &[u8]) -> String {
        let limit = self
            .dimensions
            .map(|dims| usize::from(dims.columns).saturating_sub(3));
        let mut out = String::with_capacity(data.len() * 3);
        for byte in data {
            if let Some(limit) = limit
                && self.hex_column > 0
                && self.hex_column >= limit
            {
                out.push_str("\r\n");
                self.hex_column = 0;
            }
            out.push_str(&format!("{byte:02x} "));
            self.hex_column += 3;
        }
        out
    }

    /// Render a backend stream error as a readable terminal line.
    pub fn on_transport_error(&mut self, message: &str) {
        error!("Serial transport error: {}", message);
        let line = format!("An error occurred: {message}").replace('\n', "\r\n");
        self.inject_text(&line);
    }

    /// Reset the screen and the input line, keeping history.
    pub fn clear(&mut self) {
        self.editor.reset_line();
        self.hex_column = 0;
        self.emit(ansi::RESET);
        self.emit(ansi::SAVE_CURSOR);
        self.update_input_area();
    }

    fn update_input_area(&mut self) {
        self.emit(ansi::RESTORE_CURSOR);
        if !self.ends_with_newline {
            self.emit("\r\n");
        }
        self.emit(&ansi::clear_screen(0));
        let line = self.editor.text.clone();
        self.emit(&line);
        let back = self.editor.cols_after_cursor();
        if back > 0 {
            self.emit(&ansi::cursor_back(back));
        }
    }

    fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.output.last_mut() {
            Some(TerminalOutput::Text(buffer)) => buffer.push_str(text),
            _ => self.output.push(TerminalOutput::Text(text.to_string())),
        }
    }

    pub fn set_dimensions(&mut self, dimensions: Dimensions) {
        self.dimensions = Some(dimensions);
        self.update_input_area();
    }

    pub fn dimensions(&self) -> Option<Dimensions> {
        self.dimensions
    }

    pub fn set_line_end(&mut self, line_end: impl Into<String>) {
        self.line_end = line_end.into();
    }

    pub fn line_end(&self) -> &str {
        &self.line_end
    }

    pub fn set_hex_translate(&mut self, translate: bool) {
        self.translate_hex = translate;
    }

    pub fn toggle_hex_translate(&mut self) {
        self.set_hex_translate(!self.translate_hex);
    }

    pub fn translate_hex(&self) -> bool {
        self.translate_hex
    }

    pub fn input_line(&self) -> &str {
        &self.editor.text
    }

    pub fn ends_with_newline(&self) -> bool {
        self.ends_with_newline
    }

    /// Release per-session state and tell the host to close the terminal.
    pub fn shutdown(&mut self) {
        self.reset_command();
        self.editor.reset_line();
        self.output.clear();
        self.output.push(TerminalOutput::Close);
    }
}

/// Whether rendered text leaves the cursor at the start of a fresh line.
fn ends_on_clean_line(text: &str) -> bool {
    let tail: String = text
        .chars()
        .rev()
        .take_while(|c| *c == '\r' || *c == '\n')
        .collect();
    tail.contains('\r') && tail.contains('\n')
}

/// Length of a `row;colR` cursor position report body.
fn cursor_report_len(seq: &str) -> Option<usize> {
    let (row, rest) = seq.split_once(';')?;
    if row.is_empty() || !row.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let col_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if col_len == 0 || rest[col_len..].chars().next() != Some('R') {
        return None;
    }
    Some(row.len() + 1 + col_len + 1)
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::serial::MemoryTransport;

    fn protocol() -> (SessionProtocol, MemoryTransport) {
        let transport = MemoryTransport::new("/dev/ttyUSB0", 115200);
        let handle = transport.clone();
        let mut protocol = SessionProtocol::new(Box::new(transport), true, "\r\n");
        protocol.transport_mut().open().unwrap();
        (protocol, handle)
    }

    fn rendered(protocol: &mut SessionProtocol) -> String {
        protocol
            .take_output()
            .into_iter()
            .filter_map(|out| match out {
                TerminalOutput::Text(text) => Some(text),
                TerminalOutput::Close => None,
            })
            .collect()
    }

    #[test]
    fn test_idle_bytes_render_as_text() {
        let (mut protocol, _) = protocol();
        assert_eq!(protocol.on_device_bytes(b">>> hello\r\n"), None);
        let out = rendered(&mut protocol);
        assert!(out.contains(">>> hello\r\n"));
        assert!(out.contains(ansi::SAVE_CURSOR));
    }

    #[test]
    fn test_pending_bytes_are_returned_as_reply() {
        let (mut protocol, _) = protocol();

        protocol.begin_command(CommandLabel::RemoveFile).unwrap();
        assert_eq!(
            protocol.on_device_bytes(b"uos.remove('/usr/a.py')\r\n"),
            Some((
                CommandLabel::RemoveFile,
                "uos.remove('/usr/a.py')\r\n".to_string()
            ))
        );
        assert!(protocol.take_output().is_empty());

        assert!(protocol.finish_command(CommandLabel::RemoveFile));
        assert_eq!(protocol.on_device_bytes(b">>> "), None);
        assert!(rendered(&mut protocol).contains(">>> "));
    }

    #[test]
    fn test_demux_invariant_over_random_chunking() {
        let mut rng = rand::thread_rng();
        let reply = b"[IST]for elem in uos.ilistdir('/usr'):\r\n... print(elem)\r\n('a.py', 32768, 0, 12)\r\n>>> ";
        let visible = b"Traceback? no, just output after the command\r\n";

        for _ in 0..50 {
            let (mut protocol, _) = protocol();
            let mut seen = String::new();

            protocol.begin_command(CommandLabel::BootstrapList).unwrap();
            let mut offset = 0;
            while offset < reply.len() {
                let len = rng.gen_range(1..=8).min(reply.len() - offset);
                let (label, text) = protocol
                    .on_device_bytes(&reply[offset..offset + len])
                    .unwrap();
                assert_eq!(label, CommandLabel::BootstrapList);
                seen.push_str(&text);
                assert!(protocol.take_output().is_empty());
                offset += len;
            }
            assert_eq!(seen.as_bytes(), reply);

            protocol.finish_command(CommandLabel::BootstrapList);
            assert_eq!(protocol.on_device_bytes(visible), None);
            assert!(rendered(&mut protocol).contains("just output after the command"));
        }
    }

    #[test]
    fn test_second_command_is_rejected() {
        let (mut protocol, transport) = protocol();
        protocol
            .issue_command(CommandLabel::RemoveFile, &["uos.remove('/usr/a.py')\r\n"])
            .unwrap();

        let err = protocol
            .issue_command(CommandLabel::CreateDir, &["ql_fs.mkdirs('/usr/x')\r\n"])
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::CommandPending {
                pending: CommandLabel::RemoveFile,
                requested: CommandLabel::CreateDir
            }
        ));
        assert_eq!(transport.written_text(), "uos.remove('/usr/a.py')\r\n");
        assert_eq!(
            protocol.pending().map(|p| p.label),
            Some(CommandLabel::RemoveFile)
        );
    }

    #[test]
    fn test_tagged_input_continues_same_label_and_rejects_others() {
        let (mut protocol, transport) = protocol();
        protocol.handle_input("[IST]print(elem)\\r\\n").unwrap();
        protocol.handle_input("[IST]\r\n").unwrap();
        assert_eq!(transport.written_text(), "print(elem)\r\n\r\n");

        let err = protocol.handle_input("[RUN]example.exec('usr/a.py')\r\n");
        assert!(matches!(err, Err(AppError::CommandPending { .. })));
    }

    #[test]
    fn test_filtered_tagged_input_leaves_no_pending_command() {
        let (mut protocol, transport) = protocol();
        let err = protocol.handle_input("[RMF]uos.remove('/usr/文件.py')\r\n");
        assert!(matches!(err, Err(AppError::ValidationError(_))));
        assert!(!protocol.is_pending());
        assert_eq!(transport.written_text(), "");

        // a dropped continuation line keeps the command it belongs to
        protocol.handle_input("[IST]print(elem)\r\n").unwrap();
        assert!(protocol.handle_input("[IST]print('你')\r\n").is_err());
        assert_eq!(
            protocol.pending().map(|p| p.label),
            Some(CommandLabel::BootstrapList)
        );
        assert_eq!(transport.written_text(), "print(elem)\r\n");
    }

    #[test]
    fn test_stale_command_cannot_finish_newer_one() {
        let (mut protocol, _) = protocol();
        protocol.begin_command(CommandLabel::ListDir).unwrap();
        let first = protocol.pending().unwrap();
        assert!(protocol.finish_pending(first));

        protocol.begin_command(CommandLabel::ListDir).unwrap();
        let second = protocol.pending().unwrap();
        assert_ne!(first.seq, second.seq);
        assert!(!protocol.finish_pending(first));
        assert_eq!(protocol.pending(), Some(second));
        assert!(protocol.finish_pending(second));
    }

    #[test]
    fn test_enter_sends_unescaped_line_with_line_end() {
        let (mut protocol, transport) = protocol();
        protocol.set_line_end("\n");
        protocol.handle_input("print('a\\tb')").unwrap();
        assert_eq!(protocol.input_line(), "print('a\\tb')");
        protocol.handle_input("\r").unwrap();
        assert_eq!(transport.written_text(), "print('a\tb')\n");
        assert_eq!(protocol.input_line(), "");
    }

    #[test]
    fn test_line_editing_keys() {
        let (mut protocol, transport) = protocol();
        protocol.handle_input("ab\x1b[Dx\x1b[Hy\x1b[F\x7fz").unwrap();
        assert_eq!(protocol.input_line(), "yaxz");
        protocol.handle_input("\x1b[H\x1b[3~").unwrap();
        assert_eq!(protocol.input_line(), "axz");
        protocol.handle_input("\x1b[12;40R").unwrap();
        assert_eq!(protocol.input_line(), "axz");
        protocol.handle_input("\r\x1b[A").unwrap();
        assert_eq!(protocol.input_line(), "axz");
        assert_eq!(transport.written_text(), "axz\r\n");
    }

    #[test]
    fn test_unsupported_input_is_dropped() {
        let (mut protocol, transport) = protocol();
        assert!(!protocol.write("print('你好')\r\n").unwrap());
        assert!(protocol.write("print('hi')\r\n").unwrap());
        assert_eq!(transport.written_text(), "print('hi')\r\n");

        let err = protocol.issue_command(CommandLabel::RemoveFile, &["uos.remove('/usr/文件')\r\n"]);
        assert!(matches!(err, Err(AppError::ValidationError(_))));
        assert!(!protocol.is_pending());
    }

    #[test]
    fn test_sentinel_closes_terminal() {
        let (mut protocol, _) = protocol();
        protocol.on_device_bytes(DISCONNECT_SENTINEL.as_bytes());
        assert_eq!(protocol.take_output(), vec![TerminalOutput::Close]);
    }

    #[test]
    fn test_hex_mode_wraps_on_known_width() {
        let (mut protocol, _) = protocol();
        protocol.set_hex_translate(false);
        protocol.set_dimensions(Dimensions {
            columns: 12,
            rows: 24,
        });
        protocol.take_output();

        protocol.on_device_bytes(&[0x00, 0x41, 0xff, 0x10]);
        let out = rendered(&mut protocol);
        assert!(out.contains("00 41 ff \r\n10 "));
    }

    #[test]
    fn test_hex_mode_unbounded_without_width() {
        let (mut protocol, _) = protocol();
        protocol.toggle_hex_translate();
        protocol.on_device_bytes(&[0xab; 40]);
        let out = rendered(&mut protocol);
        assert!(out.contains(&"ab ".repeat(40)));
    }

    #[test]
    fn test_injection_ignores_hex_mode() {
        let (mut protocol, _) = protocol();
        protocol.set_hex_translate(false);
        protocol.inject_text("Device disconnected.");
        assert!(rendered(&mut protocol).contains("Device disconnected."));
        assert!(!protocol.translate_hex());
    }

    #[test]
    fn test_transport_error_is_rendered_and_keeps_pending() {
        let (mut protocol, transport) = protocol();
        protocol.begin_command(CommandLabel::RunScript).unwrap();
        transport.fail_writes(true);
        assert!(protocol.write("x").is_err());
        assert!(rendered(&mut protocol).contains("An error occurred: "));
        assert!(protocol.is_pending());
    }

    #[test]
    fn test_clear_resets_screen_and_line() {
        let (mut protocol, _) = protocol();
        protocol.handle_input("abc").unwrap();
        protocol.take_output();
        protocol.clear();
        let out = rendered(&mut protocol);
        assert!(out.starts_with(ansi::RESET));
        assert_eq!(protocol.input_line(), "");
    }

    #[test]
    fn test_clean_line_detection() {
        assert!(ends_on_clean_line("abc\r\n"));
        assert!(ends_on_clean_line("abc\n\r"));
        assert!(!ends_on_clean_line("abc\n"));
        assert!(!ends_on_clean_line(">>> "));
    }
}
