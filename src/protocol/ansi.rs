//! ANSI control sequences used to keep a stable input line under device output.

pub const SAVE_CURSOR: &str = "\x1b[s";
pub const RESTORE_CURSOR: &str = "\x1b[u";
pub const RESET: &str = "\x1bc";

/// Erase display. Level 0 clears from the cursor to the end of the screen.
pub fn clear_screen(level: u8) -> String {
    format!("\x1b[{level}J")
}

pub fn cursor_back(n: usize) -> String {
    format!("\x1b[{n}D")
}

pub fn cursor_forward(n: usize) -> String {
    format!("\x1b[{n}C")
}

pub fn cursor_up(n: usize) -> String {
    format!("\x1b[{n}A")
}

pub fn cursor_down(n: usize) -> String {
    format!("\x1b[{n}B")
}

/// Erase the whole current line.
pub const CLEAR_LINE: &str = "\x1b[2K";

/// Erase from the cursor to the end of the line.
pub const CLEAR_TO_LINE_END: &str = "\x1b[K";
