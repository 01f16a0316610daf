//! External download and flash tools run as child processes.

use std::path::Path;
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{DownloadResponse, FileData};
use crate::error::{AppError, Result};
use crate::events::AppEvent;
use crate::protocol::CommandLabel;

/// Baud rate the flash tool always talks at.
pub const FLASH_BAUD_RATE: u32 = 115200;

static RE_PERCENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,3})\s*%").unwrap());

/// A configured command line such as `python QuecPyComTools.py`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| AppError::ConfigError("Tool command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Arguments that copy `source` to `:<destination>` on the device.
    pub fn download_args(&self, port: &str, baud: u32, source: &str, destination: &str) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "-d".to_string(),
            port.to_string(),
            "-b".to_string(),
            baud.to_string(),
            "-f".to_string(),
            "cp".to_string(),
            source.to_string(),
            format!(":{destination}"),
        ]);
        args
    }

    pub fn flash_args(&self, port: &str, firmware: &str) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "-d".to_string(),
            port.to_string(),
            "-b".to_string(),
            FLASH_BAUD_RATE.to_string(),
            "-f".to_string(),
            firmware.to_string(),
        ]);
        args
    }

    /// Run to completion, handing every stdout line to `on_line`. Returns the exit code.
    pub async fn run<F>(&self, args: &[String], mut on_line: F) -> Result<i32>
    where
        F: FnMut(&str),
    {
        tracing::info!("Running {} {:?}", self.program, args);
        let mut child = Command::new(&self.program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::ToolError(format!("Failed to start {}: {}", self.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::ToolError("Failed to get stdout handle".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            let program = self.program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!("{} stderr: {}", program, line);
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            on_line(&line);
        }

        let status = child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Percentage printed by a tool progress line, if any.
pub fn parse_percent(line: &str) -> Option<u8> {
    RE_PERCENT
        .captures_iter(line)
        .last()
        .and_then(|caps| caps[1].parse::<u8>().ok())
        .filter(|p| *p <= 100)
}

/// Everything the tool download needs, captured before the port is closed.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub session: String,
    pub label: CommandLabel,
    pub port: String,
    pub baud: u32,
    pub source: String,
    pub parent_path: String,
}

impl DownloadJob {
    pub fn destination(&self) -> String {
        let filename = file_name(&self.source);
        format!("{}/{}", self.parent_path.trim_end_matches('/'), filename)
    }
}

pub fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Copy a file with the tool, reporting progress and the final status as events.
pub fn spawn_download(tool: ToolCommand, job: DownloadJob, sender: mpsc::Sender<AppEvent>) {
    tokio::spawn(async move {
        let size = tokio::fs::metadata(&job.source)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file_data = FileData {
            filename: file_name(&job.source),
            file_size_in_bytes: size,
        };
        let args = tool.download_args(&job.port, job.baud, &job.source, &job.destination());

        let progress = sender.clone();
        let session = job.session.clone();
        let result = tool
            .run(&args, |line| {
                let event = AppEvent::ToolProgress {
                    session: session.clone(),
                    percent: parse_percent(line),
                };
                if progress.try_send(event).is_err() {
                    tracing::debug!("Dropped tool progress line");
                }
            })
            .await;

        let success = match result {
            Ok(code) => code == 0,
            Err(e) => {
                tracing::error!("Download of {} failed: {}", job.source, e);
                false
            }
        };
        let response = DownloadResponse::new(file_data, job.parent_path.clone(), success);
        let _ = sender
            .send(AppEvent::DownloadDone {
                session: job.session,
                label: job.label,
                response,
            })
            .await;
    });
}

/// Flash a firmware image with the tool.
pub fn spawn_flash(tool: ToolCommand, port: String, firmware: String, sender: mpsc::Sender<AppEvent>) {
    tokio::spawn(async move {
        let args = tool.flash_args(&port, &firmware);
        let progress = sender.clone();
        let result = tool
            .run(&args, |line| {
                let event = AppEvent::ToolProgress {
                    session: port.clone(),
                    percent: parse_percent(line),
                };
                let _ = progress.try_send(event);
            })
            .await;

        let success = match result {
            Ok(code) => code == 0,
            Err(e) => {
                tracing::error!("Flashing {} failed: {}", firmware, e);
                false
            }
        };
        let _ = sender.send(AppEvent::FlashDone { success }).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_command() {
        let tool = ToolCommand::parse("python QuecPyComTools.py").unwrap();
        assert_eq!(tool.program, "python");
        assert_eq!(
            tool.download_args("COM3", 115200, "/tmp/main.py", "/usr/main.py"),
            vec![
                "QuecPyComTools.py",
                "-d",
                "COM3",
                "-b",
                "115200",
                "-f",
                "cp",
                "/tmp/main.py",
                ":/usr/main.py"
            ]
        );
        assert!(matches!(
            ToolCommand::parse("   "),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn test_flash_args_use_fixed_baud() {
        let tool = ToolCommand::parse("QuecPythonDownload").unwrap();
        assert_eq!(
            tool.flash_args("COM5", "fw.zip"),
            vec!["-d", "COM5", "-b", "115200", "-f", "fw.zip"]
        );
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("Progress: 45%"), Some(45));
        assert_eq!(parse_percent("[#####] 10 % then 100%"), Some(100));
        assert_eq!(parse_percent("no numbers"), None);
        assert_eq!(parse_percent("250%"), None);
    }

    #[test]
    fn test_download_destination() {
        let job = DownloadJob {
            session: "COM3".into(),
            label: CommandLabel::DownloadFile,
            port: "COM3".into(),
            baud: 115200,
            source: "/home/dev/proj/main.py".into(),
            parent_path: "/usr/".into(),
        };
        assert_eq!(job.destination(), "/usr/main.py");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_streams_lines_and_exit_code() {
        let tool = ToolCommand::parse("sh -c").unwrap();
        let mut args = tool.args.clone();
        args.push("echo 50%; echo done; exit 3".to_string());
        let mut seen = Vec::new();
        let code = tool
            .run(&args, |line| seen.push(line.to_string()))
            .await
            .unwrap();
        assert_eq!(code, 3);
        assert_eq!(seen, vec!["50%", "done"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_download_reports_source_size() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("boot.py");
        std::fs::write(&source, b"x = 1").unwrap();
        let job = DownloadJob {
            session: "COM3".into(),
            label: CommandLabel::DownloadFile,
            port: "COM3".into(),
            baud: 115200,
            source: source.to_string_lossy().into_owned(),
            parent_path: "/usr".into(),
        };
        let (tx, mut rx) = mpsc::channel(8);
        spawn_download(ToolCommand::parse("true").unwrap(), job, tx);

        loop {
            match rx.recv().await.unwrap() {
                AppEvent::ToolProgress { .. } => continue,
                AppEvent::DownloadDone {
                    session, response, ..
                } => {
                    assert_eq!(session, "COM3");
                    assert!(response.is_success());
                    assert_eq!(response.file_data.filename, "boot.py");
                    assert_eq!(response.file_data.file_size_in_bytes, 5);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}
