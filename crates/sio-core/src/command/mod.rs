//! The in-band command protocol carried on top of relayed lines.
//!
//! A completed line (terminator removed) falls into one of three classes:
//!
//! | Line starts with | Class                  | Handled by                    |
//! |------------------|------------------------|-------------------------------|
//! | `ping`           | [`LineKind::Keepalive`] | reply `pong!\n` to the peer   |
//! | `*`              | [`LineKind::Local`]     | a [`LocalCommandHandler`]     |
//! | anything else    | [`LineKind::Data`]      | forwarded to the other side   |
//!
//! Matching is case-sensitive and by prefix, so `pingpong` is a keepalive
//! and `Ping` is data.  The keepalive rule only applies to lines arriving
//! from the peer; the agent decides that, not this module.

pub mod builtin;

/// The exact reply sent for a keepalive.
pub const PONG_REPLY: &[u8] = b"pong!\n";

const KEEPALIVE_PREFIX: &[u8] = b"ping";
const LOCAL_PREFIX: u8 = b'*';

/// Classification of one completed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// A `ping` keepalive.
    Keepalive,
    /// A `*`-prefixed local command, answered without touching the device.
    Local,
    /// Ordinary data to be relayed.
    Data,
}

/// Classifies a line.  `line` may or may not still carry its terminator.
pub fn classify(line: &[u8]) -> LineKind {
    if line.starts_with(KEEPALIVE_PREFIX) {
        LineKind::Keepalive
    } else if line.first() == Some(&LOCAL_PREFIX) {
        LineKind::Local
    } else {
        LineKind::Data
    }
}

/// Answers `*`-prefixed local commands.
///
/// The handler receives the full command line including the leading `*`
/// and without its terminator.  It returns either nothing or a reply that
/// the agent sends to the peer verbatim; no terminator is added, so a reply
/// that should end a line must carry its own `'\n'`.
pub trait LocalCommandHandler: Send {
    /// Handles one local command.
    fn handle(&mut self, command: &str) -> Option<String>;
}

impl<H: LocalCommandHandler + ?Sized> LocalCommandHandler for Box<H> {
    fn handle(&mut self, command: &str) -> Option<String> {
        (**self).handle(command)
    }
}
