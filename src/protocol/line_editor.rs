use std::collections::VecDeque;

/// Default number of submitted lines kept for Up/Down recall.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// The line being typed at the device prompt, plus recall history.
#[derive(Clone, Debug)]
pub struct LineEditor {
    pub text: String,
    pub cursor_col: usize,
    history: VecDeque<String>,
    history_index: usize,
    history_limit: usize,
}

impl Default for LineEditor {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl LineEditor {
    pub fn new(history_limit: usize) -> Self {
        Self {
            text: String::new(),
            cursor_col: 0,
            history: VecDeque::new(),
            history_index: 0,
            history_limit: history_limit.max(1),
        }
    }

    pub fn insert_char(&mut self, ch: char) {
        self.clamp_cursor();
        let byte_index = char_to_byte_index(&self.text, self.cursor_col);
        self.text.insert(byte_index, ch);
        self.cursor_col += 1;
    }

    /// Returns false when there was nothing to delete.
    pub fn backspace(&mut self) -> bool {
        self.clamp_cursor();
        if self.cursor_col == 0 {
            return false;
        }

        let remove_col = self.cursor_col - 1;
        let byte_index = char_to_byte_index(&self.text, remove_col);
        self.text.remove(byte_index);
        self.cursor_col -= 1;
        true
    }

    pub fn delete_forward(&mut self) -> bool {
        self.clamp_cursor();
        if self.cursor_col >= self.text.chars().count() {
            return false;
        }

        let byte_index = char_to_byte_index(&self.text, self.cursor_col);
        self.text.remove(byte_index);
        true
    }

    pub fn move_left(&mut self) {
        self.clamp_cursor();
        self.cursor_col = self.cursor_col.saturating_sub(1);
    }

    pub fn move_right(&mut self) {
        self.clamp_cursor();
        self.cursor_col = (self.cursor_col + 1).min(self.text.chars().count());
    }

    pub fn move_home(&mut self) {
        self.cursor_col = 0;
    }

    pub fn move_end(&mut self) {
        self.cursor_col = self.text.chars().count();
    }

    /// Columns between the cursor and the end of the line.
    pub fn cols_after_cursor(&self) -> usize {
        self.text.chars().count().saturating_sub(self.cursor_col)
    }

    /// Take the current line, remember it, and start a fresh one.
    ///
    /// Empty lines and immediate repeats are not added to history.
    pub fn submit(&mut self) -> String {
        let line = std::mem::take(&mut self.text);
        if !line.is_empty() && self.history.back() != Some(&line) {
            self.history.push_back(line.clone());
            if self.history.len() > self.history_limit {
                self.history.pop_front();
            }
        }
        self.history_index = self.history.len();
        self.cursor_col = 0;
        line
    }

    /// Step back through history. Returns false at the oldest entry.
    pub fn history_prev(&mut self) -> bool {
        if self.history_index == 0 || self.history_index > self.history.len() {
            return false;
        }
        self.history_index -= 1;
        self.text = self.history[self.history_index].clone();
        self.move_end();
        true
    }

    /// Step forward through history; past the newest entry the line is empty.
    pub fn history_next(&mut self) -> bool {
        if self.history_index >= self.history.len() {
            return false;
        }
        self.history_index += 1;
        self.text = self
            .history
            .get(self.history_index)
            .cloned()
            .unwrap_or_default();
        self.move_end();
        true
    }

    /// Drop the current line and rewind the history cursor.
    pub fn reset_line(&mut self) {
        self.text.clear();
        self.cursor_col = 0;
        self.history_index = self.history.len();
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn clamp_cursor(&mut self) {
        let len = self.text.chars().count();
        self.cursor_col = self.cursor_col.min(len);
    }
}

fn char_to_byte_index(text: &str, char_index: usize) -> usize {
    if char_index == 0 {
        return 0;
    }
    match text.char_indices().nth(char_index) {
        Some((idx, _)) => idx,
        None => text.len(),
    }
}
