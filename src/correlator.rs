//! Command/response correlation.
//!
//! AT replies have no reliable end marker (data-session replies in particular
//! may never send `OK`), so a command is complete when its timeout elapses or
//! the cancel signal fires. Everything received in that window is the reply,
//! returned as one un-split string; callers search it for what they need.
//!
//! [`PendingCommand`] is the poll-driven state machine; [`Correlator::execute`]
//! drives it to completion on the calling thread.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::clock::{CancelSignal, Clock};
use crate::line::LineAssembler;
use crate::transport::{Echo, Transport};

/// Appended to every transmitted command.
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Why a pending command stopped collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The timeout window elapsed.
    TimedOut,
    /// The cancel signal was raised first.
    Cancelled,
}

/// The command last transmitted and the reply accumulated so far.
pub struct PendingCommand {
    command: String,
    timeout: Duration,
    started: Duration,
    response: Vec<u8>,
    /// Only used to log reply lines as they complete; the reply itself is raw.
    lines: LineAssembler,
}

impl PendingCommand {
    /// Command text (empty for a pure drain).
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reply accumulated so far.
    #[must_use]
    pub fn response(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.response)
    }

    /// Advance one step. Returns `Some` once the command is complete.
    ///
    /// Never blocks on the transport: when nothing is available the clock's
    /// idle hook runs and the caller polls again.
    pub fn poll<T: Transport>(
        &mut self,
        port: &mut T,
        echo: &mut Echo,
        clock: &dyn Clock,
        cancel: &dyn CancelSignal,
    ) -> Option<Completion> {
        if clock.now().saturating_sub(self.started) >= self.timeout {
            // Bytes already sitting in the transport still belong to this window.
            self.drain(port, echo);
            return Some(Completion::TimedOut);
        }
        if cancel.is_cancelled() {
            return Some(Completion::Cancelled);
        }
        if self.drain(port, echo) == 0 {
            clock.idle();
        }
        None
    }

    /// Consume the command, returning the full reply text.
    #[must_use]
    pub fn into_text(self) -> String {
        match String::from_utf8(self.response) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }

    fn drain<T: Transport>(&mut self, port: &mut T, echo: &mut Echo) -> usize {
        let mut n = 0;
        while port.byte_available() {
            let Some(b) = port.read_byte() else {
                break;
            };
            echo.byte(b);
            self.response.push(b);
            n += 1;
            if let Some(line) = self.lines.feed(b) {
                if !line.is_empty() {
                    trace!("AT {} < {line}", self.label());
                }
            }
        }
        n
    }

    fn label(&self) -> &str {
        if self.command.is_empty() {
            "(drain)"
        } else {
            &self.command
        }
    }
}

/// Sends commands and collects their replies with wall-clock timeouts.
///
/// Strictly half-duplex: at most one [`PendingCommand`] exists per call, and
/// the caller must not run the notification dispatcher on the same transport
/// until it returns.
pub struct Correlator {
    clock: Arc<dyn Clock>,
    cancel: Arc<dyn CancelSignal>,
}

impl Correlator {
    pub fn new(clock: Arc<dyn Clock>, cancel: Arc<dyn CancelSignal>) -> Self {
        Self { clock, cancel }
    }

    /// Transmit `command` followed by [`LINE_TERMINATOR`] and start its timeout
    /// window. An empty command transmits nothing and only drains.
    ///
    /// A write failure is logged; the window still runs so the caller gets
    /// whatever the modem sends.
    pub fn start<T: Transport>(
        &self,
        port: &mut T,
        command: &str,
        timeout: Duration,
    ) -> PendingCommand {
        if !command.is_empty() {
            debug!("AT > {command}");
            let mut line = Vec::with_capacity(command.len() + LINE_TERMINATOR.len());
            line.extend_from_slice(command.as_bytes());
            line.extend_from_slice(LINE_TERMINATOR);
            if let Err(e) = port.write(&line) {
                warn!("AT {command}: {e}");
            }
        }
        PendingCommand {
            command: command.to_string(),
            timeout,
            started: self.clock.now(),
            response: Vec::new(),
            lines: LineAssembler::new(),
        }
    }

    /// Poll `pending` once with this correlator's clock and cancel signal.
    pub fn poll<T: Transport>(
        &self,
        pending: &mut PendingCommand,
        port: &mut T,
        echo: &mut Echo,
    ) -> Option<Completion> {
        pending.poll(port, echo, self.clock.as_ref(), self.cancel.as_ref())
    }

    /// Send `command` and return everything received within `timeout`.
    ///
    /// Always occupies the full window unless cancelled. A timed-out empty
    /// reply and a genuinely empty reply are both `""`.
    pub fn execute<T: Transport>(
        &self,
        port: &mut T,
        echo: &mut Echo,
        command: &str,
        timeout: Duration,
    ) -> String {
        let mut pending = self.start(port, command, timeout);
        let completion = loop {
            if let Some(c) = self.poll(&mut pending, port, echo) {
                break c;
            }
        };
        debug!(
            "AT {}: {completion:?} after {:.1}s, {} bytes",
            pending.label(),
            self.clock.now().saturating_sub(pending.started).as_secs_f64(),
            pending.response.len()
        );
        pending.into_text()
    }
}
