//! Per-execution output capture.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const CHUNK: usize = 8 * 1024;

/// Which pipe a pump reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct Buffers {
    merged: Vec<u8>,
    stderr: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl Buffers {
    fn append(&mut self, bytes: &[u8], stream: Stream) {
        let room = self.limit.saturating_sub(self.merged.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.merged.extend_from_slice(&bytes[..bytes.len().min(room)]);

        if stream == Stream::Stderr {
            let room = self.limit.saturating_sub(self.stderr.len());
            self.stderr.extend_from_slice(&bytes[..bytes.len().min(room)]);
        }
    }
}

/// Drop a UTF-8 sequence cut short at the end of `bytes`.
fn trim_partial_char(bytes: &mut Vec<u8>) {
    let tail = bytes.len().saturating_sub(4);
    let Some(lead) = (tail..bytes.len()).rev().find(|&i| bytes[i] & 0xC0 != 0x80) else {
        return;
    };
    let width = match bytes[lead] {
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        b if b >= 0xC0 => 2,
        _ => 1,
    };
    if lead + width > bytes.len() {
        bytes.truncate(lead);
    }
}

/// What a finished capture holds.
#[derive(Debug, Default)]
pub(crate) struct Captured {
    /// stdout and stderr merged in arrival order, with a marker if truncated.
    pub output: String,
    /// stderr alone, for classifying how the program ended.
    pub stderr: String,
}

/// Output buffer owned by exactly one execution.
///
/// Pipes keep being drained past the limit so the child never blocks on a
/// full pipe; the excess is discarded.
#[derive(Debug, Clone)]
pub(crate) struct Capture {
    shared: Arc<Mutex<Buffers>>,
}

impl Capture {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Buffers {
                merged: Vec::new(),
                stderr: Vec::new(),
                limit,
                truncated: false,
            })),
        }
    }

    /// Drain `reader` into the buffer until EOF.
    pub(crate) fn pump<R>(&self, mut reader: R, stream: Stream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut chunk = vec![0u8; CHUNK];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => shared.lock().await.append(&chunk[..n], stream),
                    Err(e) => {
                        tracing::debug!(?stream, error = %e, "Capture pipe closed with error");
                        break;
                    }
                }
            }
        })
    }

    /// Take what has been captured so far.
    pub(crate) async fn finish(&self) -> Captured {
        let mut buffers = self.shared.lock().await;
        let mut merged = std::mem::take(&mut buffers.merged);
        let mut stderr = std::mem::take(&mut buffers.stderr);
        if buffers.truncated {
            trim_partial_char(&mut merged);
            trim_partial_char(&mut stderr);
        }
        let mut output = String::from_utf8_lossy(&merged).into_owned();
        if buffers.truncated {
            output.push_str(&format!(
                "\n... [output truncated at {} bytes]",
                buffers.limit
            ));
        }
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        Captured { output, stderr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merges_streams_and_keeps_stderr_separately() {
        let capture = Capture::new(1024);
        capture.pump(&b"out\n"[..], Stream::Stdout).await.ok();
        capture.pump(&b"err\n"[..], Stream::Stderr).await.ok();

        let captured = capture.finish().await;
        assert_eq!(captured.output, "out\nerr\n");
        assert_eq!(captured.stderr, "err\n");
    }

    #[tokio::test]
    async fn truncates_with_marker() {
        let capture = Capture::new(4);
        capture.pump(&b"abcdefgh"[..], Stream::Stdout).await.ok();

        let captured = capture.finish().await;
        assert!(captured.output.starts_with("abcd\n"));
        assert!(captured.output.contains("[output truncated at 4 bytes]"));
    }

    #[tokio::test]
    async fn truncation_never_splits_a_character() {
        // "né€" is 1 + 2 + 3 bytes; a limit of 5 lands inside the euro sign.
        let capture = Capture::new(5);
        capture.pump("né€x".as_bytes(), Stream::Stdout).await.ok();

        let captured = capture.finish().await;
        assert!(captured.output.starts_with("né\n"), "{:?}", captured.output);
        assert!(!captured.output.contains('\u{FFFD}'));
    }

    #[test]
    fn trims_only_incomplete_sequences() {
        let mut whole = "a€".as_bytes().to_vec();
        trim_partial_char(&mut whole);
        assert_eq!(whole, "a€".as_bytes());

        let mut cut = "a€".as_bytes()[..3].to_vec();
        trim_partial_char(&mut cut);
        assert_eq!(cut, b"a");

        let mut empty = Vec::new();
        trim_partial_char(&mut empty);
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn exact_fit_is_not_truncated() {
        let capture = Capture::new(3);
        capture.pump(&b"abc"[..], Stream::Stdout).await.ok();
        assert_eq!(capture.finish().await.output, "abc");
    }
}
