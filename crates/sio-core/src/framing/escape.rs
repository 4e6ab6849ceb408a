//! Log-safe rendering of relayed bytes.
//!
//! Relayed data frequently contains carriage returns, backspaces and other
//! control bytes that would corrupt a log line.  [`escape_control`] renders
//! them in caret notation before the bytes reach a `tracing` macro.

use std::fmt::Write;

/// Renders `bytes` as printable text.
///
/// | Byte            | Rendering          |
/// |-----------------|--------------------|
/// | `0x20..=0x7E`   | itself             |
/// | `0x00..=0x1F`   | `^@` … `^_`        |
/// | `0x7F`          | `^?`               |
/// | `0x80..=0xFF`   | `\xNN` (lowercase) |
///
/// ```rust
/// use sio_core::escape_control;
///
/// assert_eq!(escape_control(b"ok\r\n"), "ok^M^J");
/// ```
pub fn escape_control(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            0x20..=0x7e => out.push(b as char),
            0x00..=0x1f => {
                out.push('^');
                out.push((b + 0x40) as char);
            }
            0x7f => out.push_str("^?"),
            _ => {
                // Writing to a String cannot fail.
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out
}
