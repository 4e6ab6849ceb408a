//! Byte-stream framing: line assembly and log-safe escaping.

pub mod assembler;
pub mod escape;

pub use assembler::{Feed, LineAssembler};
pub use escape::escape_control;
