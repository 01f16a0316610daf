//! Per-command interpreters for device replies.
//!
//! Every parser buffers the chunks it is fed and reports a [`Completion`] once
//! its terminating condition shows up. Detection is plain text matching on the
//! REPL echo, so it is kept here and nowhere else.

use once_cell::sync::Lazy;
use regex::Regex;

use super::tree::{DEVICE_ROOT, FileNode, FileTree, ListingEntry, split_parent};
use crate::escape::{extract_file_path, extract_quoted_path};
use crate::events::BusEvent;
use crate::protocol::CommandLabel;

pub const TRACEBACK_MARKER: &str = "Traceback";

const MODE_DIR: i64 = 0x4000;
const MODE_FILE: i64 = 0x8000;

static RE_STAT_TUPLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\('([^']*)',\s*(-?\d+),\s*(-?\d+)(?:,\s*(-?\d+))?\)").unwrap()
});

/// What to do once a reply is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub tree_changed: bool,
    /// Text to render in the terminal as if the device had sent it.
    pub inject: Option<String>,
    /// The port was held closed for an external transfer and must be reopened.
    pub reopen: bool,
    /// User-facing failure message. Pending is reset right away when set.
    pub error: Option<String>,
}

impl Completion {
    fn tree_changed() -> Self {
        Self {
            tree_changed: true,
            ..Self::default()
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

pub trait ReplyParser: Send {
    /// Drop anything buffered for a previous command.
    fn reset(&mut self);

    /// Feed one bus payload. `None` means keep waiting.
    fn feed(&mut self, event: &BusEvent, tree: &mut FileTree) -> Option<Completion>;
}

fn is_sentinel(label: CommandLabel, text: &str) -> bool {
    text == label.tag()
}

/// Complete lines of `buffer`, without the unterminated tail.
fn complete_lines(buffer: &str) -> impl Iterator<Item = &str> {
    let end = buffer.rfind('\n').map_or(0, |i| i + 1);
    buffer[..end].lines().map(|line| line.trim_end_matches('\r'))
}

fn strip_prompt(line: &str) -> &str {
    line.trim()
        .trim_start_matches(">>>")
        .trim_start_matches("...")
        .trim()
}

/// Directory listings, both the per-line bootstrap and the one-line deep form.
pub struct ListingParser {
    label: CommandLabel,
    buffer: String,
}

impl ListingParser {
    pub fn new(label: CommandLabel) -> Self {
        Self {
            label,
            buffer: String::new(),
        }
    }

    fn failure() -> Completion {
        Completion::error("Failed to list files.")
    }

    fn finish(tree: &mut FileTree, nodes: Vec<FileNode>) -> Completion {
        tree.replace(nodes);
        Completion::tree_changed()
    }

    /// Scan buffered lines. `at_sentinel` accepts whatever was listed so far.
    fn try_complete(&self, tree: &mut FileTree, at_sentinel: bool) -> Option<Completion> {
        let mut tuples = Vec::new();
        let mut prompt_after_tuples = false;

        for line in complete_lines(&self.buffer) {
            let line = strip_prompt(line);
            if line.starts_with("[{") && line.ends_with("}]") {
                return Some(match parse_entry_list(line) {
                    Some(nodes) => Self::finish(tree, nodes),
                    None => Self::failure(),
                });
            }
            if line.starts_with("[(") && line.ends_with(")]") {
                return Some(Self::finish(tree, parse_stat_tuples(line)));
            }
            if line.starts_with("('") {
                tuples.extend(parse_stat_tuples(line));
                prompt_after_tuples = false;
            } else if line.is_empty() && !tuples.is_empty() {
                prompt_after_tuples = true;
            }
        }

        if !tuples.is_empty() && (prompt_after_tuples || at_sentinel) {
            return Some(Self::finish(tree, tuples));
        }
        if at_sentinel {
            if self.buffer.contains(TRACEBACK_MARKER) {
                return Some(Self::failure());
            }
            // Nothing under /usr
            return Some(Self::finish(tree, Vec::new()));
        }
        None
    }
}

impl ReplyParser for ListingParser {
    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn feed(&mut self, event: &BusEvent, tree: &mut FileTree) -> Option<Completion> {
        let BusEvent::Reply { text, .. } = event else {
            return None;
        };
        if is_sentinel(self.label, text) {
            return self.try_complete(tree, true);
        }
        self.buffer.push_str(text);
        self.try_complete(tree, false)
    }
}

/// Parse a printed list of entry dicts after normalizing quotes.
pub fn parse_entry_list(line: &str) -> Option<Vec<FileNode>> {
    let normalized = line.replace('\'', "\"");
    match serde_json::from_str::<Vec<ListingEntry>>(&normalized) {
        Ok(entries) => Some(entries.into_iter().map(FileNode::from).collect()),
        Err(e) => {
            tracing::warn!("Unparseable listing payload: {}", e);
            None
        }
    }
}

/// Parse `uos.ilistdir` tuples `(name, type, inode[, size])` found in `text`.
pub fn parse_stat_tuples(text: &str) -> Vec<FileNode> {
    RE_STAT_TUPLE
        .captures_iter(text)
        .map(|caps| {
            let name = caps[1].to_string();
            let mode: i64 = caps[2].parse().unwrap_or(0);
            let size: i64 = caps
                .get(4)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            let path = format!("{DEVICE_ROOT}/{name}");

            let is_dir = match mode {
                MODE_DIR => true,
                MODE_FILE => false,
                _ => !name.contains('.'),
            };
            if is_dir {
                FileNode::dir(name, path)
            } else {
                let label = if size > 0 {
                    format!("{size} B")
                } else {
                    String::new()
                };
                FileNode::file(name, label, path)
            }
        })
        .collect()
}

pub struct MkdirParser {
    buffer: String,
}

impl MkdirParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }
}

impl Default for MkdirParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyParser for MkdirParser {
    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn feed(&mut self, event: &BusEvent, tree: &mut FileTree) -> Option<Completion> {
        let BusEvent::Reply { text, .. } = event else {
            return None;
        };
        if !is_sentinel(CommandLabel::CreateDir, text) {
            self.buffer.push_str(text);
            return None;
        }

        const FAILED: &str = "Unable to create directory.";
        if self.buffer.contains(TRACEBACK_MARKER) {
            return Some(Completion::error(FAILED));
        }
        let Some(path) = extract_file_path(&self.buffer) else {
            return Some(Completion::error(FAILED));
        };
        let Some((parent, name)) = split_parent(&path) else {
            return Some(Completion::error(FAILED));
        };

        Some(match tree.insert(parent, FileNode::dir(name, path.as_str())) {
            Ok(()) => Completion::tree_changed(),
            Err(e) => Completion::error(e.to_string()),
        })
    }
}

/// Remove-file and remove-directory replies.
pub struct RemoveParser {
    label: CommandLabel,
    buffer: String,
}

impl RemoveParser {
    pub fn new(label: CommandLabel) -> Self {
        Self {
            label,
            buffer: String::new(),
        }
    }

    fn failure(&self) -> Completion {
        match self.label {
            CommandLabel::RemoveDir => Completion::error("Unable to remove directory."),
            _ => Completion::error("Unable to remove file."),
        }
    }
}

impl ReplyParser for RemoveParser {
    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn feed(&mut self, event: &BusEvent, tree: &mut FileTree) -> Option<Completion> {
        let BusEvent::Reply { text, .. } = event else {
            return None;
        };
        if !is_sentinel(self.label, text) {
            self.buffer.push_str(text);
            return None;
        }

        if self.buffer.contains(TRACEBACK_MARKER) {
            return Some(self.failure());
        }
        let Some(path) = extract_quoted_path(&self.buffer) else {
            return Some(self.failure());
        };
        if !tree.remove(&path) {
            tracing::debug!("Removed {} was not in the tree", path);
        }
        Some(Completion::tree_changed())
    }
}

/// Download completion status. Device echo seen meanwhile is ignored.
#[derive(Default)]
pub struct DownloadParser;

impl ReplyParser for DownloadParser {
    fn reset(&mut self) {}

    fn feed(&mut self, event: &BusEvent, tree: &mut FileTree) -> Option<Completion> {
        let BusEvent::Download { response, .. } = event else {
            return None;
        };

        let mut completion = Completion {
            reopen: true,
            ..Completion::default()
        };
        if !response.is_success() {
            completion.error = Some("Failed to download the file.".to_string());
            return Some(completion);
        }

        let size = format!("{} B", response.file_data.file_size_in_bytes);
        match tree.upsert_file(&response.parent_path, &response.file_data.filename, &size) {
            Ok(()) => completion.tree_changed = true,
            Err(e) => completion.error = Some(e.to_string()),
        }
        Some(completion)
    }
}

/// Script output: drop the two echoed statement lines, show the rest.
pub struct RunScriptParser {
    buffer: String,
}

impl RunScriptParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn remainder(&self) -> Option<&str> {
        let first = self.buffer.find('\n')?;
        let second = self.buffer[first + 1..].find('\n')?;
        Some(&self.buffer[first + 1 + second + 1..])
    }
}

impl Default for RunScriptParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyParser for RunScriptParser {
    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn feed(&mut self, event: &BusEvent, _tree: &mut FileTree) -> Option<Completion> {
        let BusEvent::Reply { text, .. } = event else {
            return None;
        };
        let at_sentinel = is_sentinel(CommandLabel::RunScript, text);
        if !at_sentinel {
            self.buffer.push_str(text);
        }

        let inject = match self.remainder() {
            Some(rest) => rest.to_string(),
            None if at_sentinel => String::new(),
            None => return None,
        };
        Some(Completion {
            inject: (!inject.is_empty()).then_some(inject),
            ..Completion::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{DownloadResponse, FileData};

    fn reply(text: &str) -> BusEvent {
        BusEvent::Reply {
            session: "COM3".to_string(),
            text: text.to_string(),
        }
    }

    fn sentinel(label: CommandLabel) -> BusEvent {
        reply(label.tag())
    }

    #[test]
    fn test_listing_bootstrap_echo_then_tuple_list() {
        let mut parser = ListingParser::new(CommandLabel::BootstrapList);
        let mut tree = FileTree::new();
        let echo = [
            "for elem in uos.ilistdir('/usr'):\r\n",
            "... print(elem)\r\n",
            "... \r\n",
            "... \r\n",
            "\r\n",
        ];
        for chunk in echo {
            assert!(parser.feed(&reply(chunk), &mut tree).is_none());
        }

        let done = parser
            .feed(&reply("[('a.py', 0, 0, 0), ('sub', 0, 0, 0)]\r\n"), &mut tree)
            .unwrap();
        assert!(done.tree_changed);
        assert!(done.error.is_none());

        let a = tree.find("/usr/a.py").unwrap();
        assert!(!a.is_dir());
        assert_eq!(a.size, "");
        assert_eq!(tree.find("/usr/sub").unwrap().children, Some(Vec::new()));
    }

    #[test]
    fn test_listing_per_line_tuples_finish_at_prompt() {
        let mut parser = ListingParser::new(CommandLabel::BootstrapList);
        let mut tree = FileTree::new();
        let stream = "('main.py', 32768, 0, 120)\r\n('lib', 16384, 0, 0)\r\n>>> \r\n";

        let mut result = None;
        for chunk in stream.as_bytes().chunks(7) {
            let text = String::from_utf8_lossy(chunk);
            if let Some(done) = parser.feed(&reply(&text), &mut tree) {
                result = Some(done);
            }
        }
        assert!(result.unwrap().tree_changed);
        assert_eq!(tree.nodes()[0].name, "lib");
        assert_eq!(tree.find("/usr/main.py").unwrap().size, "120 B");
    }

    #[test]
    fn test_listing_sentinel_finishes_partial_reply() {
        let mut parser = ListingParser::new(CommandLabel::BootstrapList);
        let mut tree = FileTree::new();
        assert!(
            parser
                .feed(&reply("('boot.py', 32768, 0, 5)\r\n"), &mut tree)
                .is_none()
        );
        let done = parser
            .feed(&sentinel(CommandLabel::BootstrapList), &mut tree)
            .unwrap();
        assert!(done.tree_changed);
        assert_eq!(tree.nodes().len(), 1);
    }

    #[test]
    fn test_listing_deep_payload_replaces_tree() {
        let mut parser = ListingParser::new(CommandLabel::ListDir);
        let mut tree = FileTree::new();
        tree.replace(vec![FileNode::file("stale.py", "1 B", "/usr/stale.py")]);

        let payload = "[{'name': 'lib', 'type': 'dir', 'size': '', 'path': '/usr/lib', 'sub': \
                       [{'name': 'x.py', 'type': 'file', 'size': '9 B', 'path': '/usr/lib/x.py'}]}]\r\n";
        let done = parser.feed(&reply(payload), &mut tree).unwrap();
        assert!(done.tree_changed);
        assert!(tree.find("/usr/stale.py").is_none());
        assert_eq!(tree.find("/usr/lib/x.py").unwrap().size, "9 B");
    }

    #[test]
    fn test_listing_bad_payload_is_error() {
        let mut parser = ListingParser::new(CommandLabel::ListDir);
        let mut tree = FileTree::new();
        let done = parser
            .feed(&reply("[{'name': broken}]\r\n"), &mut tree)
            .unwrap();
        assert_eq!(done.error.as_deref(), Some("Failed to list files."));
        assert!(!done.tree_changed);
    }

    #[test]
    fn test_mkdir_appends_under_parent() {
        let mut parser = MkdirParser::new();
        let mut tree = FileTree::new();
        tree.replace(vec![FileNode::dir("lib", "/usr/lib")]);

        parser.feed(&reply("import ql_fs\r\n>>> ql_fs.mkdirs("), &mut tree);
        parser.feed(&reply("'/usr/lib/net')\r\n>>> "), &mut tree);
        let done = parser
            .feed(&sentinel(CommandLabel::CreateDir), &mut tree)
            .unwrap();
        assert!(done.tree_changed);
        assert!(tree.find("/usr/lib/net").unwrap().is_dir());

        parser.reset();
        parser.feed(&reply("ql_fs.mkdirs('/usr/top')\r\n"), &mut tree);
        parser.feed(&sentinel(CommandLabel::CreateDir), &mut tree);
        assert_eq!(tree.nodes()[0].name, "lib");
        assert!(tree.find("/usr/top").is_some());
    }

    #[test]
    fn test_mkdir_traceback_is_error() {
        let mut parser = MkdirParser::new();
        let mut tree = FileTree::new();
        parser.feed(
            &reply("ql_fs.mkdirs('/usr/x')\r\nTraceback (most recent call last):\r\n"),
            &mut tree,
        );
        let done = parser
            .feed(&sentinel(CommandLabel::CreateDir), &mut tree)
            .unwrap();
        assert_eq!(done.error.as_deref(), Some("Unable to create directory."));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_remove_waits_for_sentinel_and_removes_by_path() {
        let mut parser = RemoveParser::new(CommandLabel::RemoveFile);
        let mut sub = FileNode::dir("sub", "/usr/sub");
        sub.children = Some(vec![FileNode::file("file.py", "3 B", "/usr/sub/file.py")]);
        let mut tree = FileTree::new();
        tree.replace(vec![sub, FileNode::file("main.py", "1 B", "/usr/main.py")]);

        assert!(
            parser
                .feed(&reply("uos.remove('/usr/sub/file.py')\r\n>>> "), &mut tree)
                .is_none()
        );
        assert!(tree.find("/usr/sub/file.py").is_some());

        let done = parser
            .feed(&sentinel(CommandLabel::RemoveFile), &mut tree)
            .unwrap();
        assert!(done.tree_changed);
        assert_eq!(tree.find("/usr/sub").unwrap().children, Some(Vec::new()));
        assert!(tree.find("/usr/main.py").is_some());
    }

    #[test]
    fn test_remove_dir_traceback() {
        let mut parser = RemoveParser::new(CommandLabel::RemoveDir);
        let mut tree = FileTree::new();
        parser.feed(
            &reply("uos.rmdir('/usr/sub')\r\nTraceback: OSError: 39\r\n"),
            &mut tree,
        );
        let done = parser
            .feed(&sentinel(CommandLabel::RemoveDir), &mut tree)
            .unwrap();
        assert_eq!(done.error.as_deref(), Some("Unable to remove directory."));
    }

    fn download(code: &str, parent: &str) -> BusEvent {
        BusEvent::Download {
            session: "COM3".to_string(),
            response: DownloadResponse {
                file_data: FileData {
                    filename: "app.py".to_string(),
                    file_size_in_bytes: 2048,
                },
                parent_path: parent.to_string(),
                code: code.to_string(),
            },
        }
    }

    #[test]
    fn test_download_success_inserts_one_node_and_reopens() {
        let mut parser = DownloadParser;
        let mut tree = FileTree::new();
        tree.replace(vec![FileNode::file("app.py", "1 B", "/usr/app.py")]);

        assert!(parser.feed(&reply("w(b'''x''')\r\n"), &mut tree).is_none());
        let done = parser.feed(&download("0", "/usr"), &mut tree).unwrap();
        assert!(done.reopen);
        assert!(done.error.is_none());
        let apps: Vec<_> = tree.nodes().iter().filter(|n| n.name == "app.py").collect();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].size, "2048 B");
    }

    #[test]
    fn test_download_failure_inserts_nothing_and_reopens() {
        let mut parser = DownloadParser;
        let mut tree = FileTree::new();
        let done = parser.feed(&download("1", "/usr"), &mut tree).unwrap();
        assert!(done.reopen);
        assert_eq!(done.error.as_deref(), Some("Failed to download the file."));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_run_script_strips_echo() {
        let mut parser = RunScriptParser::new();
        let mut tree = FileTree::new();
        assert!(parser.feed(&reply("import example\r\n"), &mut tree).is_none());
        let done = parser
            .feed(
                &reply(">>> example.exec('usr/main.py')\r\nhello\r\n>>> "),
                &mut tree,
            )
            .unwrap();
        assert_eq!(done.inject.as_deref(), Some("hello\r\n>>> "));
    }

    #[test]
    fn test_stat_tuple_typing() {
        let nodes = parse_stat_tuples("('x', 32768, 0, 0) ('y.d', 16384, 0, 0) ('z', 0, 0)");
        assert!(!nodes[0].is_dir());
        assert!(nodes[1].is_dir());
        assert!(nodes[2].is_dir());
    }
}
