//! One-shot command execution over an interactive shell stream
//!
//! The remote end is a shell with no request/response framing, so command
//! boundaries are invented: the command is wrapped between two `echo`s of a
//! process-wide sentinel and the output is whatever appears between the two
//! printed sentinel lines. This is a best-effort text protocol. A shell that
//! mangles the sentinel (non-UTF-8 locales, line wrapping that puts the echoed
//! sentinel at the start of a line) can confuse the scan.

use std::sync::OnceLock;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::remote::connection::{Connection, FrameReader, Inbound};
use crate::remote::types::{ExecResult, TerminalError};

/// How long to wait for the shell's first frame before sending anyway
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(500);
/// Pause after the first frame so the shell can finish drawing its prompt
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

static SENTINEL: OnceLock<String> = OnceLock::new();

/// Sentinel shared by every framed command in this process
pub fn sentinel() -> &'static str {
    SENTINEL.get_or_init(|| format!("AGENTSH_{}", Uuid::new_v4().simple()))
}

/// The single line sent to the shell for `command`
pub fn compose_command(sentinel: &str, command: &str) -> String {
    format!("echo {sentinel}; {command}; echo; echo {sentinel}; exit\n")
}

/// Collapse CRLF and bare CR into LF
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn marker(sentinel: &str) -> String {
    format!("\n{sentinel}")
}

/// Number of sentinel lines printed so far. The echoed command line never
/// counts because its sentinels are preceded by `echo `, not a newline.
pub fn count_markers(text: &str, sentinel: &str) -> usize {
    normalize_line_endings(text).matches(&marker(sentinel)).count()
}

/// Text between the printed start and end sentinel lines, with terminal
/// escape sequences removed and surrounding whitespace trimmed.
///
/// Works on incomplete transcripts too: without an end sentinel everything
/// after the start line is returned, and without a start sentinel the whole
/// transcript is.
pub fn extract_output(text: &str, sentinel: &str) -> String {
    let text = normalize_line_endings(text);
    let marker = marker(sentinel);

    let body = match text.find(&marker) {
        Some(start) => {
            let after_marker = start + marker.len();
            let rest = match text[after_marker..].find('\n') {
                Some(newline) => &text[after_marker + newline..],
                None => "",
            };
            match rest.find(&marker) {
                Some(end) => &rest[..end],
                None => rest,
            }
        }
        None => text.as_str(),
    };

    strip_ansi_escapes::strip_str(body).trim().to_string()
}

/// Accumulates raw shell output until both sentinel lines have arrived
#[derive(Debug)]
pub struct OutputCollector {
    sentinel: String,
    raw: String,
}

impl OutputCollector {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
            raw: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.raw.push_str(chunk);
    }

    pub fn has_output(&self) -> bool {
        !self.raw.is_empty()
    }

    /// Line endings are normalized over the whole buffer on every scan, so a
    /// CRLF split across two frames is still a single line break.
    pub fn is_complete(&self) -> bool {
        count_markers(&self.raw, &self.sentinel) >= 2
    }

    pub fn extract(&self) -> String {
        extract_output(&self.raw, &self.sentinel)
    }
}

/// How the read loop ended
enum ExecEnd {
    /// Both sentinels seen
    Complete,
    /// Remote closed normally
    Closed,
    /// Remote stream failed
    Dropped(TerminalError),
}

/// Runs exactly one command on an open shell stream and closes it
pub struct FramedExec {
    connection: Connection,
    sentinel: String,
    ready_timeout: Duration,
    settle_delay: Duration,
}

impl FramedExec {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            sentinel: sentinel().to_string(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Use a fixed sentinel instead of the process-wide one
    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    /// Run `command` and return its output. The connection is closed before
    /// this returns, whatever the outcome.
    pub async fn run(self, command: &str, deadline: Duration) -> ExecResult {
        let Some(mut reader) = self.connection.take_reader() else {
            self.connection.close().await;
            return ExecResult::failure(
                String::new(),
                TerminalError::Connection("Stream reader already in use".to_string()),
            );
        };

        let mut collector = OutputCollector::new(self.sentinel.clone());
        let outcome = timeout(deadline, self.drive(&mut reader, &mut collector, command)).await;
        self.connection.close().await;

        match outcome {
            Ok(Ok(ExecEnd::Complete)) => {
                info!("Command completed");
                ExecResult::success(collector.extract())
            }
            Ok(Ok(ExecEnd::Closed)) => {
                if collector.has_output() {
                    warn!("Shell closed before the end sentinel, returning partial output");
                }
                ExecResult::success(collector.extract())
            }
            Ok(Ok(ExecEnd::Dropped(error))) => {
                if collector.has_output() {
                    warn!("Stream failed mid-command ({}), returning partial output", error);
                    ExecResult::success(collector.extract())
                } else {
                    ExecResult::failure(String::new(), error)
                }
            }
            Ok(Err(error)) => ExecResult::failure(collector.extract(), error),
            Err(_) => {
                warn!("Command did not complete within {:?}", deadline);
                ExecResult::failure(collector.extract(), TerminalError::Timeout(deadline))
            }
        }
    }

    async fn drive(
        &self,
        reader: &mut FrameReader,
        collector: &mut OutputCollector,
        command: &str,
    ) -> Result<ExecEnd, TerminalError> {
        match timeout(self.ready_timeout, reader.next()).await {
            Ok(Ok(Inbound::Data(banner))) => {
                debug!("Shell ready ({} bytes of banner)", banner.len());
                collector.push(&String::from_utf8_lossy(&banner));
            }
            Ok(Ok(Inbound::Closed)) => return Ok(ExecEnd::Closed),
            Ok(Err(error)) => return Ok(ExecEnd::Dropped(error)),
            Err(_) => debug!(
                "No banner within {:?}, sending command anyway",
                self.ready_timeout
            ),
        }

        sleep(self.settle_delay).await;
        self.connection
            .send_text(compose_command(&self.sentinel, command))
            .await?;
        debug!("Framed command sent");

        while !collector.is_complete() {
            match reader.next().await {
                Ok(Inbound::Data(chunk)) => collector.push(&String::from_utf8_lossy(&chunk)),
                Ok(Inbound::Closed) => return Ok(ExecEnd::Closed),
                Err(error) => return Ok(ExecEnd::Dropped(error)),
            }
        }

        Ok(ExecEnd::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: &str = "hello-marker";

    fn transcript(output: &str) -> String {
        format!("$ {}\r\n{M}\r\n{}\r\n\r\n{M}\r\n", compose_command(M, "cmd").trim_end(), output)
    }

    #[test]
    fn test_sentinel_is_stable_and_unique_looking() {
        assert_eq!(sentinel(), sentinel());
        assert!(sentinel().starts_with("AGENTSH_"));
        assert_eq!(sentinel().len(), "AGENTSH_".len() + 32);
    }

    #[test]
    fn test_compose_command_layout() {
        assert_eq!(
            compose_command(M, "echo hi"),
            "echo hello-marker; echo hi; echo; echo hello-marker; exit\n"
        );
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_line_endings("a\r\nb\rc\n"), "a\nb\nc\n");
        assert_eq!(normalize_line_endings("\r\r\n"), "\n\n");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        for input in ["a\r\nb", "\r\r\n\n", "plain", "x\ry\r\n\r", ""] {
            let once = normalize_line_endings(input);
            assert_eq!(normalize_line_endings(&once), once);
        }
    }

    #[test]
    fn test_echoed_command_does_not_count() {
        let echoed = format!("$ {}", compose_command(M, "ls").trim_end());
        assert_eq!(count_markers(&echoed, M), 0);
        assert_eq!(count_markers(&transcript("x"), M), 2);
    }

    #[test]
    fn test_extract_simple_output() {
        assert_eq!(extract_output(&transcript("hi"), M), "hi");
    }

    #[test]
    fn test_extract_multiline_output() {
        assert_eq!(
            extract_output(&transcript("line one\r\nline two"), M),
            "line one\nline two"
        );
    }

    #[test]
    fn test_extract_empty_output() {
        assert_eq!(extract_output(&transcript(""), M), "");
    }

    #[test]
    fn test_extract_strips_escape_sequences() {
        assert_eq!(
            extract_output(&transcript("\x1b[32mgreen\x1b[0m and \x1b[1mbold\x1b[0m"), M),
            "green and bold"
        );
    }

    #[test]
    fn test_sentinel_inside_output_is_not_a_boundary() {
        let samples = [
            format!("prefix {M} suffix"),
            format!("x{M}{M}"),
            format!("value={M}\r\nnext line {M}"),
            format!("tab\t{M}"),
            "ordinary output".to_string(),
        ];
        for sample in samples {
            let text = transcript(&sample);
            assert_eq!(count_markers(&text, M), 2, "sample: {sample:?}");
            assert_eq!(
                extract_output(&text, M),
                normalize_line_endings(&sample),
                "sample: {sample:?}"
            );
        }
    }

    #[test]
    fn test_extract_without_end_sentinel_returns_tail() {
        let text = format!("$ echo {M}; make\r\n{M}\r\nbuilding...\r\nstep 1");
        assert_eq!(extract_output(&text, M), "building...\nstep 1");
    }

    #[test]
    fn test_extract_without_any_sentinel_returns_everything() {
        assert_eq!(extract_output("welcome\r\n$ ", M), "welcome\n$");
    }

    #[test]
    fn test_collector_handles_split_frames() {
        let chars: Vec<char> = transcript("chunked output").chars().collect();
        let mut collector = OutputCollector::new(M);

        for piece in chars.chunks(3) {
            assert!(!collector.is_complete());
            collector.push(&piece.iter().collect::<String>());
        }

        assert!(collector.is_complete());
        assert_eq!(collector.extract(), "chunked output");
    }

    #[test]
    fn test_collector_crlf_split_across_frames() {
        let mut collector = OutputCollector::new(M);
        collector.push("$ prompt\r");
        collector.push(&format!("\n{M}\r"));
        collector.push(&format!("\nout\r\n\r\n{M}"));
        assert!(collector.is_complete());
        assert_eq!(collector.extract(), "out");
    }
}
