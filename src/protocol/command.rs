use std::fmt;

/// Token that closes the terminal when it arrives verbatim from the device,
/// also injected locally to tear a session down.
pub const DISCONNECT_SENTINEL: &str = "SIG_TERM_9";

/// Length of every bracketed command tag, e.g. `[IST]`.
pub const TAG_LEN: usize = 5;

/// Internal command kinds. Each one tags the lines it writes and names the
/// event bus topic its reply is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandLabel {
    ListDir,
    BootstrapList,
    RunScript,
    RemoveFile,
    RemoveDir,
    CreateDir,
    DownloadFile,
    SelectiveDownload,
}

impl CommandLabel {
    pub const ALL: [CommandLabel; 8] = [
        CommandLabel::ListDir,
        CommandLabel::BootstrapList,
        CommandLabel::RunScript,
        CommandLabel::RemoveFile,
        CommandLabel::RemoveDir,
        CommandLabel::CreateDir,
        CommandLabel::DownloadFile,
        CommandLabel::SelectiveDownload,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            CommandLabel::ListDir => "[LST]",
            CommandLabel::BootstrapList => "[IST]",
            CommandLabel::RunScript => "[RUN]",
            CommandLabel::RemoveFile => "[RMF]",
            CommandLabel::RemoveDir => "[RMD]",
            CommandLabel::CreateDir => "[MKD]",
            CommandLabel::DownloadFile => "[DWF]",
            CommandLabel::SelectiveDownload => "[SDW]",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|label| label.tag() == tag)
    }

    /// Split `[TAG]rest` into its label and the command text after the tag.
    pub fn split_tagged(data: &str) -> Option<(Self, &str)> {
        let tag = data.get(..TAG_LEN)?;
        let label = Self::from_tag(tag)?;
        Some((label, &data[TAG_LEN..]))
    }

    /// Prefix `line` with this label's tag.
    pub fn tagged(self, line: &str) -> String {
        format!("{}{}", self.tag(), line)
    }

    pub fn topic(self) -> &'static str {
        self.tag()
    }
}

impl fmt::Display for CommandLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// The one internal command currently awaiting its reply.
///
/// `seq` is unique per session, so timers armed for an earlier command with
/// the same label can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand {
    pub label: CommandLabel,
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_tagged() {
        assert_eq!(
            CommandLabel::split_tagged("[RMF]uos.remove('/usr/a.py')\r\n"),
            Some((CommandLabel::RemoveFile, "uos.remove('/usr/a.py')\r\n"))
        );
        assert_eq!(CommandLabel::split_tagged("[XYZ]print(1)"), None);
        assert_eq!(CommandLabel::split_tagged("[IS"), None);
        assert_eq!(CommandLabel::split_tagged("print(1)"), None);
    }

    #[test]
    fn test_tags_are_unique_and_sized() {
        for label in CommandLabel::ALL {
            assert_eq!(label.tag().len(), TAG_LEN);
            assert_eq!(CommandLabel::from_tag(label.tag()), Some(label));
        }
    }
}
