//! File transfer to the device and firmware flashing.

pub mod push;
pub mod tool;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Name and size of a file sent to the device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub filename: String,
    pub file_size_in_bytes: u64,
}

/// Completion status of a file download. `code` is `"0"` on success.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub file_data: FileData,
    pub parent_path: String,
    pub code: String,
}

impl DownloadResponse {
    pub fn new(file_data: FileData, parent_path: impl Into<String>, success: bool) -> Self {
        Self {
            file_data,
            parent_path: parent_path.into(),
            code: if success { "0" } else { "1" }.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == "0"
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    InProgress,
    Completed,
    Failed(String),
}

/// Progress of the one running push, download or flash.
#[derive(Clone, Debug)]
pub struct TransferProgress {
    pub name: String,
    pub start_time: Instant,
    pub done: usize,
    pub total: usize,
    pub state: TransferState,
    /// Set when the user asked to stop watching; the transfer itself keeps going.
    pub cancel_requested: bool,
    finished_at: Option<Instant>,
}

impl TransferProgress {
    pub fn new(name: impl Into<String>, total: usize) -> Self {
        Self {
            name: name.into(),
            start_time: Instant::now(),
            done: 0,
            total,
            state: TransferState::Pending,
            cancel_requested: false,
            finished_at: None,
        }
    }

    /// Record `index` (zero based) of `total` steps as done.
    pub fn update_step(&mut self, index: usize) {
        if self.is_finished() {
            return;
        }
        self.done = (index + 1).min(self.total);
        self.state = TransferState::InProgress;
    }

    /// Record a tool-reported percentage.
    pub fn update_percent(&mut self, percent: u8) {
        if self.is_finished() {
            return;
        }
        self.total = 100;
        self.done = usize::from(percent.min(100));
        self.state = TransferState::InProgress;
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.done * 100) / self.total).min(100) as u8
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, TransferState::Completed | TransferState::Failed(_))
    }

    pub fn mark_completed(&mut self, success: bool, error: Option<String>) {
        if success {
            self.done = self.total;
            self.state = TransferState::Completed;
        } else {
            let message = error.unwrap_or_else(|| "Unknown error".to_string());
            self.state = TransferState::Failed(message);
        }
        self.finished_at = Some(Instant::now());
    }

    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_response_wire_names() {
        let response = DownloadResponse::new(
            FileData {
                filename: "main.py".into(),
                file_size_in_bytes: 42,
            },
            "/usr",
            true,
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["fileData"]["fileSizeInBytes"], 42);
        assert_eq!(json["parentPath"], "/usr");
        assert_eq!(json["code"], "0");
        assert!(response.is_success());
    }

    #[test]
    fn test_progress_steps_and_completion() {
        let mut progress = TransferProgress::new("main.py", 4);
        assert_eq!(progress.percent(), 0);
        progress.update_step(1);
        assert_eq!(progress.percent(), 50);
        progress.mark_completed(false, Some("port busy".into()));
        progress.update_step(3);
        assert_eq!(progress.percent(), 50);
        assert_eq!(progress.state, TransferState::Failed("port busy".into()));
    }

    #[test]
    fn test_progress_percent_updates() {
        let mut progress = TransferProgress::new("firmware", 0);
        progress.update_percent(130);
        assert_eq!(progress.percent(), 100);
        progress.mark_completed(true, None);
        assert!(progress.is_finished());
    }
}
