//! Line-checked G-code streaming
//!
//! In line-check mode every G-code line is framed as
//! `N<line> <cmd> *<checksum>`. The firmware acknowledges with
//! `L<line> <pending>` and the sender never runs ahead of the buffer
//! credit those acknowledgements advertise.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::command::{Progress, ProgressFn};
use crate::error::ControlError;
use crate::transport::{Incoming, Link};

/// Buffer credit before the first acknowledgement
pub const INITIAL_BUFFER_CREDIT: u32 = 20;
/// Lines the firmware can hold beyond the last acknowledged one
pub const BUFFER_HEADROOM: u32 = 12;
/// Ctrl-X, aborts the running stream
pub const STOP_BYTE: &str = "\x18";
/// Give up on a stream after this long without an acknowledgement
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// XOR-then-add over every non-space character, mod 65536
pub fn checksum(text: &str) -> u32 {
    let crc = text
        .chars()
        .filter(|c| *c != ' ')
        .fold(0u64, |crc, c| (crc ^ c as u64) + c as u64);
    (crc % 65536) as u32
}

/// `N<line> <cmd> *<checksum>`
pub fn frame_line(line: u32, command: &str) -> String {
    let body = format!("N{line} {command}");
    let crc = checksum(&body);
    format!("{body} *{crc}")
}

/// A firmware line in line-check mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineAck {
    /// `L<line> <pending>` or `LN<line> <pending>`
    Ack { line: u32, pending: u32 },
    /// `ERL<line>`: resend starting at this line
    Rewind(u32),
    /// `ER:RESET` or `error:`; the firmware gave up
    Fatal(String),
    /// Any other `ER` line
    Error(String),
}

pub fn parse_line(line: &str) -> Option<LineAck> {
    let line = line.trim();
    if line.contains("ER:RESET") || line.contains("error:") {
        return Some(LineAck::Fatal(line.to_string()));
    }
    if let Some(rest) = line.strip_prefix("ERL") {
        let number = rest.split_whitespace().next()?.parse().ok()?;
        return Some(LineAck::Rewind(number));
    }
    if line.starts_with("ER") {
        return Some(LineAck::Error(line.to_string()));
    }

    let rest = line.strip_prefix("LN").or_else(|| line.strip_prefix('L'))?;
    let mut parts = rest.split_whitespace();
    let acked = parts.next()?.parse().ok()?;
    let pending = parts.next()?.parse().ok()?;
    Some(LineAck::Ack { line: acked, pending })
}

/// Joins `status: raw` text fragments into complete lines
#[derive(Debug, Default)]
pub struct RawLines {
    partial: String,
}

impl RawLines {
    /// Feed a frame; returns the lines it completed
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Like [`push`](Self::push), but also yields the unterminated tail
    /// without consuming it. Firmware often omits the final newline.
    pub fn push_with_pending(&mut self, text: &str) -> Vec<String> {
        let mut lines = self.push(text);
        let tail = self.partial.trim();
        if !tail.is_empty() {
            lines.push(tail.to_string());
        }
        lines
    }

    /// Whatever has not been terminated yet
    pub fn pending(&self) -> &str {
        &self.partial
    }
}

/// Text of a `status: raw` frame
pub fn raw_text(frame: &Incoming) -> Option<&str> {
    match frame {
        Incoming::Message(value) if value.get("status").and_then(Value::as_str) == Some("raw") => {
            value.get("text").and_then(Value::as_str)
        }
        Incoming::Text(text) => Some(text),
        _ => None,
    }
}

/// Firmware-advertised buffer capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCredit {
    max_buffer: u32,
    executed: u32,
}

impl BufferCredit {
    pub fn new(max_buffer: u32) -> Self {
        Self {
            max_buffer,
            executed: 0,
        }
    }

    pub fn max_buffer(&self) -> u32 {
        self.max_buffer
    }

    /// Highest line known to have executed
    pub fn executed(&self) -> u32 {
        self.executed
    }

    pub fn can_send(&self, line: u32) -> bool {
        self.max_buffer > line
    }

    pub fn on_ack(&mut self, line: u32, pending: u32) {
        self.max_buffer = (line + BUFFER_HEADROOM).saturating_sub(pending);
        self.executed = line.saturating_sub(pending);
    }
}

impl Default for BufferCredit {
    fn default() -> Self {
        Self::new(INITIAL_BUFFER_CREDIT)
    }
}

/// How a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StreamOutcome {
    /// Every line was acknowledged as executed
    Completed { lines: u32 },
    /// The firmware went quiet for longer than the idle bound
    NotCompleted { sent: u32, executed: u32 },
    /// The caller asked to stop
    Stopped { executed: u32 },
}

/// Streams G-code over a link already in raw line-check mode
pub struct GcodeStreamer<'a> {
    link: &'a mut Link,
    credit: BufferCredit,
    idle_timeout: Duration,
    first_line: u32,
}

impl<'a> GcodeStreamer<'a> {
    /// `first_line` is the session's next line number
    pub fn new(link: &'a mut Link, first_line: u32) -> Self {
        Self {
            link,
            credit: BufferCredit::new(first_line.saturating_sub(1) + INITIAL_BUFFER_CREDIT),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            first_line,
        }
    }

    pub fn with_credit(mut self, credit: BufferCredit) -> Self {
        self.credit = credit;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Stream `lines`. Only lines starting with `G` are sent; anything else
    /// is skipped. Returns the outcome and the next free line number.
    pub async fn run(
        mut self,
        lines: &[String],
        progress: Option<&ProgressFn>,
        stop: &CancellationToken,
    ) -> Result<(StreamOutcome, u32), ControlError> {
        let gcode: Vec<&str> = lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| l.starts_with('G'))
            .collect();
        let skipped = lines.len() - gcode.len();
        debug!(lines = gcode.len(), skipped, "Streaming G-code");

        let total = gcode.len() as u32;
        let last_line = self.first_line + total;
        let mut next = self.first_line;
        let mut raw = RawLines::default();

        if total == 0 {
            return Ok((StreamOutcome::Completed { lines: 0 }, self.first_line));
        }

        while self.credit.executed() + 1 < last_line {
            if next < last_line && self.credit.can_send(next) {
                let command = gcode[(next - self.first_line) as usize];
                self.link.send(frame_line(next, command)).await?;
                trace!(line = next, command, "Sent");
                next += 1;
                continue;
            }

            let frame = tokio::select! {
                _ = stop.cancelled() => {
                    self.link.send(STOP_BYTE).await?;
                    let executed = self.executed_count();
                    return Ok((StreamOutcome::Stopped { executed }, next));
                }
                frame = timeout(self.idle_timeout, self.link.recv()) => frame,
            };

            let frame = match frame {
                Err(_) => {
                    warn!(sent = next - self.first_line, "No acknowledgement, stream idle");
                    let outcome = StreamOutcome::NotCompleted {
                        sent: next - self.first_line,
                        executed: self.executed_count(),
                    };
                    return Ok((outcome, next));
                }
                Ok(None) => return Err(ControlError::Disconnected),
                Ok(Some(Incoming::Fatal(_))) => return Err(ControlError::Disconnected),
                Ok(Some(frame)) => frame,
            };

            let Some(text) = raw_text(&frame) else {
                continue;
            };
            for line in raw.push(text) {
                match parse_line(&line) {
                    Some(LineAck::Ack { line, pending }) => {
                        self.credit.on_ack(line, pending);
                        if let Some(progress) = progress {
                            progress.call(Progress::new(self.executed_count() as u64, total as u64));
                        }
                    }
                    Some(LineAck::Rewind(line)) if (self.first_line..last_line).contains(&line) => {
                        debug!(line, "Firmware asked for resend");
                        next = line;
                    }
                    Some(LineAck::Fatal(text)) => {
                        return Err(ControlError::Protocol(text));
                    }
                    Some(LineAck::Rewind(_)) | Some(LineAck::Error(_)) | None => {
                        trace!(line = %line, "Firmware line");
                    }
                }
            }
        }

        Ok((StreamOutcome::Completed { lines: total }, last_line))
    }

    fn executed_count(&self) -> u32 {
        (self.credit.executed() + 1).saturating_sub(self.first_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Outgoing, RemoteEnd};
    use serde_json::json;

    fn raw(text: &str) -> Incoming {
        Incoming::Message(json!({"status": "raw", "text": text}))
    }

    async fn sent_line(remote: &mut RemoteEnd) -> String {
        match remote.rx.recv().await {
            Some(Outgoing::Text(text)) => text,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_checksum_deterministic() {
        let a = checksum("N1 G1X10Y10");
        let b = checksum("N1 G1X10Y10");
        assert_eq!(a, b);
        assert!(a < 65536);
    }

    #[test]
    fn test_checksum_ignores_spaces() {
        assert_eq!(checksum("N1 G1 X10"), checksum("N1G1X10"));
    }

    #[test]
    fn test_checksum_known_value() {
        // N=78: 0^78+78=156; 1=49: (156^49)+49=173+49=222
        assert_eq!(checksum("N1"), 222);
    }

    #[test]
    fn test_frame_line() {
        let framed = frame_line(1, "G28");
        assert!(framed.starts_with("N1 G28 *"));
        assert_eq!(framed, format!("N1 G28 *{}", checksum("N1 G28")));
    }

    #[test]
    fn test_parse_lines() {
        assert_eq!(parse_line("L5 2"), Some(LineAck::Ack { line: 5, pending: 2 }));
        assert_eq!(parse_line("LN7 0"), Some(LineAck::Ack { line: 7, pending: 0 }));
        assert_eq!(parse_line("ERL3"), Some(LineAck::Rewind(3)));
        assert_eq!(parse_line("ERL3 BAD_CHECKSUM"), Some(LineAck::Rewind(3)));
        assert!(matches!(parse_line("ER:RESET"), Some(LineAck::Fatal(_))));
        assert!(matches!(parse_line("error: limit"), Some(LineAck::Fatal(_))));
        assert!(matches!(parse_line("ER CHECKSUM"), Some(LineAck::Error(_))));
        assert_eq!(parse_line("ok"), None);
        assert_eq!(parse_line("LINECHECK"), None);
    }

    #[test]
    fn test_raw_lines_join_fragments() {
        let mut raw = RawLines::default();
        assert!(raw.push("L1 ").is_empty());
        assert_eq!(raw.push("0\r\nL2 0\nL3"), vec!["L1 0", "L2 0"]);
        assert_eq!(raw.pending(), "L3");
        assert_eq!(raw.push_with_pending(" 0\nok"), vec!["L3 0", "ok"]);
    }

    #[test]
    fn test_credit_update() {
        let mut credit = BufferCredit::default();
        assert!(credit.can_send(19));
        assert!(!credit.can_send(20));
        credit.on_ack(10, 3);
        assert_eq!(credit.max_buffer(), 19);
        assert_eq!(credit.executed(), 7);
    }

    #[tokio::test]
    async fn test_stream_blocks_on_credit() {
        let (mut link, mut remote) = Link::pair();
        let lines: Vec<String> = (1..=10).map(|i| format!("G1X{i}")).collect();
        let stop = CancellationToken::new();

        let streamer = tokio::spawn(async move {
            GcodeStreamer::new(&mut link, 1)
                .with_credit(BufferCredit::new(5))
                .with_idle_timeout(Duration::from_secs(5))
                .run(&lines, None, &stop)
                .await
        });

        for n in 1..=4 {
            assert!(sent_line(&mut remote).await.starts_with(&format!("N{n} ")));
        }
        tokio::task::yield_now().await;
        assert!(remote.rx.try_recv().is_err(), "line 5 must wait for credit");

        // Credit 4 + 12 - 2 = 14 unblocks the rest
        remote.tx.send(raw("L4 2\n")).await.unwrap();
        for n in 5..=10 {
            assert!(sent_line(&mut remote).await.starts_with(&format!("N{n} ")));
        }

        remote.tx.send(raw("L10 0\n")).await.unwrap();
        let (outcome, next) = streamer.await.unwrap().unwrap();
        assert_eq!(outcome, StreamOutcome::Completed { lines: 10 });
        assert_eq!(next, 11);
    }

    #[tokio::test]
    async fn test_stream_line_six_waits_for_ack() {
        let (mut link, mut remote) = Link::pair();
        let lines: Vec<String> = (1..=10).map(|i| format!("G0Y{i}")).collect();
        let stop = CancellationToken::new();

        let streamer = tokio::spawn(async move {
            GcodeStreamer::new(&mut link, 1)
                .with_credit(BufferCredit::new(5))
                .run(&lines, None, &stop)
                .await
        });

        let mut seen = Vec::new();
        for _ in 1..=4 {
            seen.push(sent_line(&mut remote).await);
        }
        tokio::task::yield_now().await;
        assert!(seen.iter().all(|l| !l.starts_with("N6 ")));

        // Credit becomes 7, so lines 5 and 6 go out but not 7
        remote.tx.send(raw("L1 6\n")).await.unwrap();
        assert!(sent_line(&mut remote).await.starts_with("N5 "));
        assert!(sent_line(&mut remote).await.starts_with("N6 "));
        tokio::task::yield_now().await;
        assert!(remote.rx.try_recv().is_err());

        stop_stream(&mut remote).await;
        drop(streamer);
    }

    async fn stop_stream(remote: &mut RemoteEnd) {
        remote.tx.send(raw("ER:RESET\n")).await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_skips_non_gcode() {
        let (mut link, mut remote) = Link::pair();
        let lines = vec!["; comment".to_string(), "G28".to_string(), "M5".to_string()];
        let stop = CancellationToken::new();

        let streamer = tokio::spawn(async move { GcodeStreamer::new(&mut link, 1).run(&lines, None, &stop).await });

        assert!(sent_line(&mut remote).await.starts_with("N1 G28 *"));
        remote.tx.send(raw("L1 0\n")).await.unwrap();
        let (outcome, _) = streamer.await.unwrap().unwrap();
        assert_eq!(outcome, StreamOutcome::Completed { lines: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_idle_bound() {
        let (mut link, mut remote) = Link::pair();
        let lines = vec!["G1X1".to_string(), "G1X2".to_string()];
        let stop = CancellationToken::new();

        let streamer = tokio::spawn(async move { GcodeStreamer::new(&mut link, 1).run(&lines, None, &stop).await });

        sent_line(&mut remote).await;
        sent_line(&mut remote).await;
        let (outcome, next) = streamer.await.unwrap().unwrap();
        assert_eq!(outcome, StreamOutcome::NotCompleted { sent: 2, executed: 0 });
        assert_eq!(next, 3);
        drop(remote);
    }

    #[tokio::test]
    async fn test_stream_rewind_resends() {
        let (mut link, mut remote) = Link::pair();
        let lines = vec!["G1X1".to_string(), "G1X2".to_string()];
        let stop = CancellationToken::new();

        let streamer = tokio::spawn(async move { GcodeStreamer::new(&mut link, 1).run(&lines, None, &stop).await });

        sent_line(&mut remote).await;
        sent_line(&mut remote).await;
        remote.tx.send(raw("ERL2\n")).await.unwrap();
        assert!(sent_line(&mut remote).await.starts_with("N2 G1X2"));
        remote.tx.send(raw("L2 0\n")).await.unwrap();
        let (outcome, _) = streamer.await.unwrap().unwrap();
        assert_eq!(outcome, StreamOutcome::Completed { lines: 2 });
    }

    #[tokio::test]
    async fn test_stream_stop_sends_ctrl_x() {
        let (mut link, mut remote) = Link::pair();
        let lines: Vec<String> = (1..=30).map(|i| format!("G1X{i}")).collect();
        let stop = CancellationToken::new();
        let stopper = stop.clone();

        let streamer = tokio::spawn(async move { GcodeStreamer::new(&mut link, 1).run(&lines, None, &stop).await });

        for _ in 1..=19 {
            sent_line(&mut remote).await;
        }
        stopper.cancel();
        assert_eq!(sent_line(&mut remote).await, STOP_BYTE);
        let (outcome, _) = streamer.await.unwrap().unwrap();
        assert_eq!(outcome, StreamOutcome::Stopped { executed: 0 });
    }
}
