//! Domain layer for sio-agent.
//!
//! Plain configuration types shared by `main.rs`, the config-file loader and
//! the relay loop.  Nothing here opens a file or reads the environment.

pub mod config;

pub use config::{AgentConfig, ListenConfig, LogConfig, SerialSource};
