use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::protocol::LineEditor;
use crate::protocol::ansi;

/// Number of commands remembered by the prompt.
const PROMPT_HISTORY: usize = 100;

pub const PROMPT: &str = "mcuterm> ";

/// What a key pressed at the device terminal should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    /// Feed these characters to the session's input handling.
    Send(String),
    /// Ctrl-] opens the command prompt.
    OpenPrompt,
    Ignore,
}

pub fn map_terminal_key(key: &KeyEvent) -> KeyAction {
    if key.kind == KeyEventKind::Release {
        return KeyAction::Ignore;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char(']') {
        return KeyAction::OpenPrompt;
    }
    match encode_key(key) {
        Some(text) => KeyAction::Send(text),
        None => KeyAction::Ignore,
    }
}

/// Encode a key event as the sequence the input line editor understands.
pub fn encode_key(key: &KeyEvent) -> Option<String> {
    let text = match key.code {
        KeyCode::Esc => "\x1b".to_string(),
        KeyCode::Enter => "\r".to_string(),
        KeyCode::Backspace => "\x7f".to_string(),
        KeyCode::Tab => "\t".to_string(),
        KeyCode::Left => "\x1b[D".to_string(),
        KeyCode::Right => "\x1b[C".to_string(),
        KeyCode::Up => "\x1b[A".to_string(),
        KeyCode::Down => "\x1b[B".to_string(),
        KeyCode::Home => "\x1b[H".to_string(),
        KeyCode::End => "\x1b[F".to_string(),
        KeyCode::Delete => "\x1b[3~".to_string(),
        KeyCode::Char(ch) => {
            // CTRL combinations for ASCII letters map to 0x01..0x1A
            if key.modifiers.contains(KeyModifiers::CONTROL) {
                let lower = ch.to_ascii_lowercase();
                if lower.is_ascii_lowercase() {
                    let code = (lower as u8) - b'a' + 1;
                    return Some(char::from(code).to_string());
                }
            }
            ch.to_string()
        }
        _ => return None,
    };
    Some(text)
}

/// Result of a key pressed at the command prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    Editing,
    Submit(String),
    Cancel,
}

/// Local command line opened with Ctrl-].
pub struct CommandPrompt {
    editor: LineEditor,
}

impl Default for CommandPrompt {
    fn default() -> Self {
        Self {
            editor: LineEditor::new(PROMPT_HISTORY),
        }
    }
}

impl CommandPrompt {
    pub fn text(&self) -> &str {
        &self.editor.text
    }

    pub fn handle_key(&mut self, key: &KeyEvent) -> PromptOutcome {
        if key.kind == KeyEventKind::Release {
            return PromptOutcome::Editing;
        }
        match key.code {
            KeyCode::Esc => {
                self.editor.reset_line();
                PromptOutcome::Cancel
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.editor.reset_line();
                PromptOutcome::Cancel
            }
            KeyCode::Enter => PromptOutcome::Submit(self.editor.submit()),
            KeyCode::Backspace => {
                self.editor.backspace();
                PromptOutcome::Editing
            }
            KeyCode::Delete => {
                self.editor.delete_forward();
                PromptOutcome::Editing
            }
            KeyCode::Left => {
                self.editor.move_left();
                PromptOutcome::Editing
            }
            KeyCode::Right => {
                self.editor.move_right();
                PromptOutcome::Editing
            }
            KeyCode::Home => {
                self.editor.move_home();
                PromptOutcome::Editing
            }
            KeyCode::End => {
                self.editor.move_end();
                PromptOutcome::Editing
            }
            KeyCode::Up => {
                self.editor.history_prev();
                PromptOutcome::Editing
            }
            KeyCode::Down => {
                self.editor.history_next();
                PromptOutcome::Editing
            }
            KeyCode::Char(ch) => {
                self.editor.insert_char(ch);
                PromptOutcome::Editing
            }
            _ => PromptOutcome::Editing,
        }
    }

    /// Redraw sequence for the prompt line.
    pub fn render(&self) -> String {
        let mut line = format!("\r{}{PROMPT}{}", ansi::CLEAR_LINE, self.editor.text);
        let back = self.editor.cols_after_cursor();
        if back > 0 {
            line.push_str(&ansi::cursor_back(back));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn test_encode_navigation_and_ctrl() {
        assert_eq!(
            encode_key(&key(KeyCode::Up, KeyModifiers::NONE)).as_deref(),
            Some("\x1b[A")
        );
        assert_eq!(
            encode_key(&key(KeyCode::Delete, KeyModifiers::NONE)).as_deref(),
            Some("\x1b[3~")
        );
        assert_eq!(
            encode_key(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)).as_deref(),
            Some("\x03")
        );
        assert_eq!(
            encode_key(&key(KeyCode::Char('é'), KeyModifiers::NONE)).as_deref(),
            Some("é")
        );
        assert_eq!(encode_key(&key(KeyCode::F(5), KeyModifiers::NONE)), None);
    }

    #[test]
    fn test_ctrl_bracket_opens_prompt() {
        assert_eq!(
            map_terminal_key(&key(KeyCode::Char(']'), KeyModifiers::CONTROL)),
            KeyAction::OpenPrompt
        );
        assert_eq!(
            map_terminal_key(&key(KeyCode::Enter, KeyModifiers::NONE)),
            KeyAction::Send("\r".into())
        );
    }

    #[test]
    fn test_prompt_editing_and_history() {
        let mut prompt = CommandPrompt::default();
        for ch in "ls deeq".chars() {
            prompt.handle_key(&key(KeyCode::Char(ch), KeyModifiers::NONE));
        }
        prompt.handle_key(&key(KeyCode::Backspace, KeyModifiers::NONE));
        prompt.handle_key(&key(KeyCode::Char('p'), KeyModifiers::NONE));
        assert_eq!(prompt.render(), "\r\x1b[2Kmcuterm> ls deep");
        assert_eq!(
            prompt.handle_key(&key(KeyCode::Enter, KeyModifiers::NONE)),
            PromptOutcome::Submit("ls deep".into())
        );

        prompt.handle_key(&key(KeyCode::Up, KeyModifiers::NONE));
        assert_eq!(prompt.text(), "ls deep");
        assert_eq!(
            prompt.handle_key(&key(KeyCode::Esc, KeyModifiers::NONE)),
            PromptOutcome::Cancel
        );
        assert_eq!(prompt.text(), "");
    }
}
