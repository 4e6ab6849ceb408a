//! # sio-core
//!
//! Shared building blocks for the SIO agent: the serial settings model, the
//! line assembly buffer that turns a byte stream into discrete lines, and the
//! classification of lines into keepalives, local escape commands and
//! ordinary data.
//!
//! This crate performs no I/O.  It has no dependencies on sockets, terminals
//! or an async runtime, so every rule here can be tested with plain byte
//! slices.
//!
//! # Architecture overview
//!
//! ```text
//! peer socket ──► sio-agent relay ──► serial device
//!                     │
//!                     ├── framing::LineAssembler   bytes → lines
//!                     ├── command::classify         line  → LineKind
//!                     └── domain::SerialSettings    echo / baud / RS-485
//! ```
//!
//! - **`domain`** – Settings types and defaults (`BaudRate`, `SerialSettings`,
//!   `FramingMode`).
//! - **`framing`** – The line assembly buffer and the control-character
//!   escaping helper used before logging relayed bytes.
//! - **`command`** – The in-band command protocol: `ping` keepalives and
//!   `*`-prefixed local commands, plus the built-in local command handler.

pub mod command;
pub mod domain;
pub mod framing;

// Re-export the most-used types at the crate root so callers can write
// `sio_core::LineAssembler` instead of `sio_core::framing::assembler::LineAssembler`.
pub use command::builtin::BuiltinCommands;
pub use command::{classify, LineKind, LocalCommandHandler, PONG_REPLY};
pub use domain::settings::{BaudRate, FramingMode, SerialSettings, SettingsError};
pub use framing::assembler::{Feed, LineAssembler};
pub use framing::escape::escape_control;
