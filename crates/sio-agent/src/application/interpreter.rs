//! The command interpreter.
//!
//! Routes completed lines in both directions:
//!
//! ```text
//! peer → device:   ping...  → Reply("pong!\n")
//!                  *cmd     → Reply(handler output) or Nothing
//!                  other    → Forward(payload)
//!
//! device → peer:   *cmd     → handler output (or nothing)
//!                  other    → the line itself, verbatim
//! ```
//!
//! Lines are passed in as produced by the line assembler, ending in `'\n'`.
//! The terminator is stripped before classification and never forwarded to
//! the device; the serial channel appends its own.

use tracing::debug;

use sio_core::{classify, escape_control, LineKind, LocalCommandHandler, PONG_REPLY};

/// What to do with a line that arrived from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    /// Send these bytes back to the peer; the device sees nothing.
    Reply(Vec<u8>),
    /// Write this payload (terminator excluded) to the serial device.
    Forward(Vec<u8>),
    /// Swallow the line: a local command that produced no reply.
    Nothing,
}

/// Applies the in-band command rules, delegating `*` commands to `H`.
#[derive(Debug)]
pub struct CommandInterpreter<H> {
    handler: H,
}

impl<H: LocalCommandHandler> CommandInterpreter<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    /// Interprets a line received from the peer.
    pub fn from_peer(&mut self, line: &[u8]) -> PeerAction {
        let payload = strip_terminator(line);
        match classify(payload) {
            LineKind::Keepalive => {
                debug!("keepalive from peer; sending pong");
                PeerAction::Reply(PONG_REPLY.to_vec())
            }
            LineKind::Local => match self.run_local(payload) {
                Some(reply) => PeerAction::Reply(reply),
                None => PeerAction::Nothing,
            },
            LineKind::Data => PeerAction::Forward(payload.to_vec()),
        }
    }

    /// Interprets a line received from the serial device while a peer is
    /// connected.  Returns the bytes to send to the peer, if any.
    ///
    /// Only the `*` rule applies in this direction; a device printing
    /// `ping` is relayed like any other text.
    pub fn from_serial(&mut self, line: &[u8]) -> Option<Vec<u8>> {
        match classify(strip_terminator(line)) {
            LineKind::Local => self.run_local(strip_terminator(line)),
            LineKind::Keepalive | LineKind::Data => Some(line.to_vec()),
        }
    }

    fn run_local(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        let command = String::from_utf8_lossy(payload);
        debug!("local command: {}", escape_control(payload));
        self.handler.handle(&command).map(String::into_bytes)
    }

    /// Access to the handler, mostly for tests.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\n").unwrap_or(line)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
