//! AT command queue (component C), §4.2.
//!
//! A FIFO of outstanding commands with at most one in flight: the queue
//! head owns the response stream until a terminator line arrives. Lines
//! that match specific unsolicited forms (`+CIEV:`, `RING`, `+CLIP:`,
//! `+CCWA:`) are recognized by content and routed to the session's
//! unsolicited handler regardless of queue state; everything else that
//! isn't a terminator is an intermediate result line for the head
//! command. Grounded in the teacher's callback-with-bound-parameters
//! idiom (`bt/hfp.rs`'s per-call closures), generalized to a boxed
//! `FnMut` per the design notes' "small fixed-size event enum... or
//! zero-allocation closures where it doesn't matter" guidance — the
//! queue is not the per-event hot path the pump is, so a boxed closure
//! is the right cost/clarity tradeoff here.

use std::collections::VecDeque;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::bt::rfcomm::Transport;
use crate::errors::{Error, ProtocolError, Result, TransportError};

/// Maximum accepted line length, §6.1.
pub const MAX_LINE_LEN: usize = 511;
/// Ring buffer capacity backing the line reader, §4.2.
pub const LINE_BUF_CAPACITY: usize = 512;

/// Outcome delivered to a command's completion future. Exactly one is
/// delivered exactly once per queued command, per §8's invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Ok,
    Error,
    Aborted,
}

/// A line recognized by content rather than queue position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Unsolicited(String),
    Terminator(CommandOutcome),
    Intermediate(String),
}

/// Classifies a single already-trimmed line per §4.2/§4.4.
pub fn classify_line(line: &str) -> LineKind {
    if line == "OK" {
        return LineKind::Terminator(CommandOutcome::Ok);
    }
    if line == "ERROR" {
        return LineKind::Terminator(CommandOutcome::Error);
    }
    if line == "RING"
        || line.starts_with("+CIEV:")
        || line.starts_with("+CLIP:")
        || line.starts_with("+CCWA:")
    {
        return LineKind::Unsolicited(line.to_string());
    }
    LineKind::Intermediate(line.to_string())
}

/// An entry in the command FIFO.
pub struct AtCommand {
    pub text: String,
    completion: Option<oneshot::Sender<CommandOutcome>>,
    handler: Option<Box<dyn FnMut(&str) + Send>>,
}

impl AtCommand {
    /// Creates a command with no interest in intermediate result lines.
    pub fn new(text: impl Into<String>) -> (Self, oneshot::Receiver<CommandOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                text: text.into(),
                completion: Some(tx),
                handler: None,
            },
            rx,
        )
    }

    /// Creates a command that also inspects intermediate result lines
    /// (e.g. `+BRSF:`, `+CIND:`) via `handler`.
    pub fn with_handler(
        text: impl Into<String>,
        handler: impl FnMut(&str) + Send + 'static,
    ) -> (Self, oneshot::Receiver<CommandOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                text: text.into(),
                completion: Some(tx),
                handler: Some(Box::new(handler)),
            },
            rx,
        )
    }

    fn complete(&mut self, outcome: CommandOutcome) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
    }

    fn intermediate(&mut self, line: &str) {
        if let Some(handler) = self.handler.as_mut() {
            handler(line);
        }
    }
}

impl Drop for AtCommand {
    fn drop(&mut self) {
        self.complete(CommandOutcome::Aborted);
    }
}

/// The per-session FIFO. Queue invariants (§3, §4.2): at most one
/// in-flight command; a pending (non-head) command may be cancelled; the
/// head may not be cancelled and must await its terminator; on
/// disconnect every queued command's future resolves `Aborted`.
#[derive(Default)]
pub struct AtQueue {
    pending: VecDeque<AtCommand>,
}

impl AtQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Enqueues `cmd`; returns `true` if it became the new head (i.e. the
    /// caller must write its text to the transport now).
    pub fn push(&mut self, cmd: AtCommand) -> bool {
        let became_head = self.pending.is_empty();
        self.pending.push_back(cmd);
        became_head
    }

    pub fn head(&self) -> Option<&AtCommand> {
        self.pending.front()
    }

    /// Routes an intermediate result line to the head command, if any.
    pub fn deliver_intermediate(&mut self, line: &str) {
        if let Some(head) = self.pending.front_mut() {
            head.intermediate(line);
        }
    }

    /// Terminates the head command with `outcome`, popping it and
    /// returning whether a new head is now ready to be written.
    pub fn complete_head(&mut self, outcome: CommandOutcome) -> Option<bool> {
        let mut head = self.pending.pop_front()?;
        head.complete(outcome);
        Some(!self.pending.is_empty())
    }

    /// Cancels the first pending command matching `predicate`, as long
    /// as it isn't the head (the head cannot be cancelled, §4.2).
    pub fn cancel_pending(&mut self, predicate: impl Fn(&str) -> bool) -> bool {
        if self.pending.len() < 2 {
            return false;
        }
        let found = self
            .pending
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, cmd)| predicate(&cmd.text))
            .map(|(i, _)| i);
        if let Some(index) = found {
            self.pending.remove(index);
            true
        } else {
            false
        }
    }

    /// Aborts every queued command, head included. Used on disconnect.
    pub fn abort_all(&mut self) {
        while let Some(mut cmd) = self.pending.pop_front() {
            cmd.complete(CommandOutcome::Aborted);
        }
    }
}

/// Line-buffered reader over a [`Transport`], implementing §4.2's ring
/// buffer: leading whitespace and blank lines are skipped, and an
/// oversized line without a terminator is a protocol violation.
pub struct LineReader<T> {
    transport: T,
    buf: Vec<u8>,
}

impl<T: Transport> LineReader<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            buf: Vec::with_capacity(LINE_BUF_CAPACITY),
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Reads the next non-blank line, or `Ok(None)` on clean EOF.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\r' || b == b'\n') {
                let raw = self.buf.drain(..=pos).collect::<Vec<u8>>();
                // Swallow a paired \n following a \r (CRLF).
                if raw[raw.len() - 1] == b'\r' && self.buf.first() == Some(&b'\n') {
                    self.buf.remove(0);
                }
                let line = String::from_utf8_lossy(&raw[..raw.len() - 1])
                    .trim()
                    .to_string();
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }

            if self.buf.len() > MAX_LINE_LEN {
                return Err(Error::Transport(TransportError::ProtocolViolation(
                    format!("line exceeded {MAX_LINE_LEN} octets without a terminator"),
                )));
            }

            let mut chunk = [0u8; LINE_BUF_CAPACITY];
            let n = self
                .transport
                .read(&mut chunk)
                .await
                .map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Writes a single AT command line, terminated by one CR (§4.2).
pub async fn write_command<T: Transport>(transport: &mut T, text: &str) -> Result<()> {
    transport
        .write_all(text.as_bytes())
        .await
        .map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;
    transport
        .write_all(b"\r")
        .await
        .map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;
    transport
        .flush()
        .await
        .map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;
    Ok(())
}

/// Synchronous phone-number / DTMF-digit validation used both by
/// `telephony` and tests of the wire-level framing (§4.5/§8): optional
/// leading `+`, then 1..31 characters from `[0-9#*wW]`.
pub fn validate_phone_number(number: &str) -> Result<()> {
    let digits = number.strip_prefix('+').unwrap_or(number);
    if digits.is_empty() || digits.len() > 31 {
        return Err(Error::Protocol(ProtocolError::BadParameter(
            number.to_string(),
        )));
    }
    if !digits
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'#' | b'*' | b'w' | b'W'))
    {
        return Err(Error::Protocol(ProtocolError::BadParameter(
            number.to_string(),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_unsolicited_lines_by_content() {
        assert!(matches!(classify_line("RING"), LineKind::Unsolicited(_)));
        assert!(matches!(
            classify_line("+CIEV: 3,1"),
            LineKind::Unsolicited(_)
        ));
        assert!(matches!(
            classify_line("+CLIP: \"5551212\",129"),
            LineKind::Unsolicited(_)
        ));
        assert!(matches!(classify_line("OK"), LineKind::Terminator(CommandOutcome::Ok)));
        assert!(matches!(
            classify_line("ERROR"),
            LineKind::Terminator(CommandOutcome::Error)
        ));
        assert!(matches!(
            classify_line("+BRSF: 127"),
            LineKind::Intermediate(_)
        ));
    }

    #[test]
    fn queue_tracks_single_head_and_aborts_on_teardown() {
        let mut queue = AtQueue::new();
        let (c1, mut r1) = AtCommand::new("AT+BRSF=15");
        let (c2, mut r2) = AtCommand::new("AT+CIND=?");
        assert!(queue.push(c1));
        assert!(!queue.push(c2));

        assert_eq!(queue.complete_head(CommandOutcome::Ok), Some(true));
        assert_eq!(r1.try_recv().unwrap(), CommandOutcome::Ok);

        queue.abort_all();
        assert_eq!(r2.try_recv().unwrap(), CommandOutcome::Aborted);
    }

    #[test]
    fn cannot_cancel_the_head() {
        let mut queue = AtQueue::new();
        let (c1, _r1) = AtCommand::new("ATA");
        queue.push(c1);
        assert!(!queue.cancel_pending(|t| t == "ATA"));
    }

    #[test]
    fn cancels_pending_non_head_command() {
        let mut queue = AtQueue::new();
        let (c1, _r1) = AtCommand::new("ATA");
        let (c2, mut r2) = AtCommand::new("AT+CHUP");
        queue.push(c1);
        queue.push(c2);
        assert!(queue.cancel_pending(|t| t == "AT+CHUP"));
        assert_eq!(r2.try_recv().unwrap(), CommandOutcome::Aborted);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn phone_number_boundary_lengths() {
        let thirty_one = "1".repeat(31);
        let thirty_two = "1".repeat(32);
        assert!(validate_phone_number(&thirty_one).is_ok());
        assert!(validate_phone_number(&thirty_two).is_err());
        assert!(validate_phone_number("+15551212").is_ok());
        assert!(validate_phone_number("abc").is_err());
    }

    #[tokio::test]
    async fn line_reader_skips_blank_lines_and_strips_whitespace() {
        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(b"\r\n  OK  \r\n+CIEV: 1,1\r\n").await.unwrap();
        drop(client);

        let mut reader = LineReader::new(server);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("OK"));
        assert_eq!(
            reader.next_line().await.unwrap().as_deref(),
            Some("+CIEV: 1,1")
        );
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversize_line_without_terminator_is_protocol_violation() {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(&vec![b'x'; 600]).await.unwrap();
        drop(client);

        let mut reader = LineReader::new(server);
        assert!(reader.next_line().await.is_err());
    }

    #[tokio::test]
    async fn line_of_exactly_max_len_is_accepted() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut line = vec![b'+'; MAX_LINE_LEN];
        line.push(b'\r');
        client.write_all(&line).await.unwrap();
        drop(client);

        let mut reader = LineReader::new(server);
        let read = reader.next_line().await.unwrap().unwrap();
        assert_eq!(read.len(), MAX_LINE_LEN);
    }

    #[tokio::test]
    async fn line_one_octet_over_max_len_without_terminator_is_protocol_violation() {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(&vec![b'+'; MAX_LINE_LEN + 1]).await.unwrap();
        drop(client);

        let mut reader = LineReader::new(server);
        assert!(reader.next_line().await.is_err());
    }
}
