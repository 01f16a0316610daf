//! Writing a local file through the REPL, one bytes literal per line.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::AppEvent;

/// Delay before writing chunk `index`; later chunks wait longer so the REPL keeps up.
pub fn chunk_delay(base: Duration, step: Duration, index: usize) -> Duration {
    base + step * u32::try_from(index).unwrap_or(u32::MAX)
}

/// Escape one line of file content for a `b'''...'''` literal.
fn escape_chunk(line: &[u8]) -> String {
    let mut out = String::with_capacity(line.len());
    for &byte in line {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\x{byte:02x}")),
        }
    }
    out
}

/// Statements that recreate `content` at `remote` on the device.
///
/// The first two open the file, the last closes it; everything in between is
/// one chunk per source line. Content is raw bytes, so files that are not
/// UTF-8 arrive unchanged apart from line endings.
pub fn push_statements(content: &[u8], remote: &str) -> Vec<String> {
    let mut lines = vec![
        format!("f = open('{remote}', 'wb')\r\n"),
        "w = f.write\r\n".to_string(),
    ];

    let body = content.strip_suffix(b"\n").unwrap_or(content);
    if !content.is_empty() {
        for line in body.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            lines.push(format!("w(b'''{}\\r\\n''')\r\n", escape_chunk(line)));
        }
    }

    lines.push("f.close()\r\n".to_string());
    lines
}

/// Post each statement back to the controller on its paced schedule.
pub fn schedule_push(
    session: String,
    lines: Vec<String>,
    base: Duration,
    step: Duration,
    sender: mpsc::Sender<AppEvent>,
) -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    let total = lines.len();

    tokio::spawn(async move {
        for (index, line) in lines.into_iter().enumerate() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Push to {} cancelled at {}/{}", session, index, total);
                    return;
                }
                _ = tokio::time::sleep(chunk_delay(base, step, index)) => {}
            }
            let event = AppEvent::PushLine {
                session: session.clone(),
                line,
                index,
                total,
            };
            if sender.send(event).await.is_err() {
                return;
            }
        }
    });

    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_statements_wrap_lines() {
        let lines = push_statements(b"print('hi')\r\nx = 1\r\n", "/usr/main.py");
        assert_eq!(
            lines,
            vec![
                "f = open('/usr/main.py', 'wb')\r\n",
                "w = f.write\r\n",
                "w(b'''print(\\'hi\\')\\r\\n''')\r\n",
                "w(b'''x = 1\\r\\n''')\r\n",
                "f.close()\r\n",
            ]
        );
    }

    #[test]
    fn test_push_escapes_backslashes_and_non_ascii() {
        let lines = push_statements("a\\n é".as_bytes(), "/usr/a.txt");
        assert_eq!(lines[2], "w(b'''a\\\\n \\xc3\\xa9\\r\\n''')\r\n");
    }

    #[test]
    fn test_push_keeps_invalid_utf8_bytes() {
        let lines = push_statements(b"x\xff\xfe\r\n\x80", "/usr/blob.bin");
        assert_eq!(
            lines[2..4],
            ["w(b'''x\\xff\\xfe\\r\\n''')\r\n", "w(b'''\\x80\\r\\n''')\r\n"]
        );
        assert!(lines.iter().all(|l| !l.contains('\u{fffd}')));
    }

    #[test]
    fn test_push_empty_file() {
        assert_eq!(push_statements(b"", "/usr/e.py").len(), 3);
    }

    #[test]
    fn test_chunk_delay_grows_linearly() {
        let base = Duration::from_millis(50);
        let step = Duration::from_millis(5);
        assert_eq!(chunk_delay(base, step, 0), Duration::from_millis(50));
        assert_eq!(chunk_delay(base, step, 10), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_schedule_push_posts_lines_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let lines = push_statements(b"x = 1", "/usr/x.py");
        let _token = schedule_push(
            "COM3".into(),
            lines.clone(),
            Duration::from_millis(1),
            Duration::ZERO,
            tx,
        );

        for (expected_index, expected) in lines.iter().enumerate() {
            match rx.recv().await.unwrap() {
                AppEvent::PushLine {
                    line, index, total, ..
                } => {
                    assert_eq!(&line, expected);
                    assert_eq!(index, expected_index);
                    assert_eq!(total, lines.len());
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}
