//! sio-agent library crate.
//!
//! The agent relays bytes between one serial device (or pseudo-terminal, or
//! the process's own stdio) and at most one socket client, framing them into
//! lines and answering a small in-band command protocol on the way.
//!
//! # Architecture
//!
//! ```text
//! client (TCP or Unix-domain socket, newline-terminated text)
//!         ↕
//! [sio-agent]
//!   ├── domain/           AgentConfig: every runtime setting in one value
//!   ├── application/      CommandInterpreter: ping / *local / data routing
//!   └── infrastructure/
//!         ├── endpoint/   listening socket and the single active peer
//!         ├── serial/     tty / pty / stdio device with line assembly
//!         ├── relay/      the event loop tying both sides together
//!         ├── shutdown/   SIGINT / SIGTERM stop flag
//!         ├── logging/    tracing subscriber setup
//!         └── config_file/ optional TOML configuration
//!         ↕
//! serial device
//! ```
//!
//! # Layer rules
//!
//! - `domain` holds plain data; no I/O.
//! - `application` decides what to do with a completed line but performs no
//!   I/O itself.
//! - `infrastructure` owns every file descriptor and drives the loop.

/// Domain layer: runtime configuration types.
pub mod domain;

/// Application layer: the command interpreter.
pub mod application;

/// Infrastructure layer: sockets, serial devices, the relay loop.
pub mod infrastructure;
