//! Application layer for sio-agent.
//!
//! Decides what happens to a completed line: answer it locally, forward it,
//! or drop it.  The decision is returned as a value; the relay loop in the
//! infrastructure layer performs the actual writes.

pub mod interpreter;

pub use interpreter::{CommandInterpreter, PeerAction};
