//! The line assembly buffer.
//!
//! Serial devices (and people typing at them) deliver bytes, not lines.
//! [`LineAssembler`] accumulates bytes one at a time and yields a completed
//! line whenever a terminator arrives.
//!
//! # Rules
//!
//! ```text
//! byte            buffer empty            buffer non-empty
//! ─────────────   ─────────────────────   ──────────────────────────────
//! '\r' or '\n'    Ignored                 Complete(line + '\n'), reset
//! '\b' (editing)  Ignored                 Erased (last byte removed)
//! other           Stored                  Stored, or Overflow when full
//! ```
//!
//! - The stored length never exceeds the configured capacity.  A byte that
//!   would push it past the capacity discards everything accumulated so far
//!   (and the byte itself).  Losing an over-long line is the defined
//!   behaviour, not an error.
//! - Both terminators are normalised to a single `'\n'`, so `"abc\r\n"`
//!   yields exactly one line: the `'\n'` arrives on an empty buffer.
//! - A [`passthrough`](LineAssembler::passthrough) assembler never emits a
//!   fragment of an over-long line.  After an overflow it discards bytes
//!   up to and including the next terminator, so the tail of that line is
//!   lost together with its head.
//!
//! Echoing is not done here.  The caller inspects the returned [`Feed`] and
//! decides what, if anything, to write back to the device.

use tracing::trace;

/// Outcome of feeding one byte into a [`LineAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// The byte was appended to the pending line.
    Stored(u8),
    /// A backspace removed the last pending byte.
    Erased,
    /// A terminator completed a line.  The line ends with exactly one `'\n'`.
    Complete(Vec<u8>),
    /// The byte had no effect: a terminator or backspace on an empty buffer.
    Ignored,
    /// The pending line exceeded the capacity and was discarded.
    Overflow,
}

/// Accumulates bytes into newline-terminated lines.
#[derive(Debug, Clone)]
pub struct LineAssembler {
    buf: Vec<u8>,
    capacity: usize,
    editing: bool,
    /// Drop the rest of an over-long line instead of starting a new one.
    drop_overlong: bool,
    discarding: bool,
}

impl LineAssembler {
    /// Creates an assembler that interprets backspace as "erase last byte".
    ///
    /// This is the serial-side behaviour, where a human may be typing.
    /// A `capacity` of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            editing: true,
            drop_overlong: false,
            discarding: false,
        }
    }

    /// Creates an assembler that stores backspace like any other byte.
    ///
    /// Used for bytes arriving from the peer, which are forwarded to the
    /// device byte-for-byte: a line longer than `capacity` is dropped as a
    /// whole rather than split.
    pub fn passthrough(capacity: usize) -> Self {
        Self {
            editing: false,
            drop_overlong: true,
            ..Self::new(capacity)
        }
    }

    /// Feeds one byte through the buffer.
    pub fn feed(&mut self, byte: u8) -> Feed {
        match byte {
            b'\r' | b'\n' if self.discarding => {
                self.discarding = false;
                Feed::Ignored
            }
            _ if self.discarding => Feed::Ignored,
            b'\r' | b'\n' => {
                if self.buf.is_empty() {
                    return Feed::Ignored;
                }
                let mut line = std::mem::replace(&mut self.buf, Vec::with_capacity(self.capacity));
                line.push(b'\n');
                Feed::Complete(line)
            }
            0x08 if self.editing => match self.buf.pop() {
                Some(_) => Feed::Erased,
                None => Feed::Ignored,
            },
            _ if self.buf.len() >= self.capacity => {
                trace!(
                    "line buffer overflow after {} bytes; discarding",
                    self.buf.len()
                );
                self.buf.clear();
                self.discarding = self.drop_overlong;
                Feed::Overflow
            }
            _ => {
                self.buf.push(byte);
                Feed::Stored(byte)
            }
        }
    }

    /// Feeds a slice and collects every completed line, in order.
    pub fn feed_all(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes
            .iter()
            .filter_map(|&b| match self.feed(b) {
                Feed::Complete(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    /// Drops any partially assembled line.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }

    /// Number of bytes currently pending (the cursor position).
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` when no bytes are pending.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Maximum number of payload bytes a line may hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The bytes accumulated so far, without a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
