//! Agent configuration types.
//!
//! [`AgentConfig`] is the single source of truth for all runtime settings.
//! `main.rs` builds it from CLI arguments, environment variables and an
//! optional TOML file; tests build it directly or start from
//! [`AgentConfig::default`].
//!
//! Keeping configuration as a plain value passed into constructors (instead
//! of process-wide flags) lets several relays run side by side in one test
//! process.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use sio_core::domain::settings::{DEFAULT_LINE_CAPACITY, DEFAULT_SERIAL_DEVICE, DEFAULT_UNIX_SOCKET_PATH};
use sio_core::{FramingMode, SerialSettings};

/// Where the serial side of the relay comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialSource {
    /// A terminal device node such as `/dev/ttyUSB0`.
    Device(PathBuf),
    /// A freshly allocated pseudo-terminal; an external terminal program
    /// attaches to the reported slave path.
    Pty,
    /// The agent's own stdin/stdout.  Never re-opened.
    Stdio,
}

impl fmt::Display for SerialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialSource::Device(path) => write!(f, "{}", path.display()),
            SerialSource::Pty => f.write_str("pty"),
            SerialSource::Stdio => f.write_str("stdio"),
        }
    }
}

/// Listening endpoint selection.
///
/// A non-zero `tcp_port` selects TCP on the wildcard address; zero selects a
/// Unix-domain socket at `unix_socket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenConfig {
    pub tcp_port: u16,
    pub unix_socket: PathBuf,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            tcp_port: 0,
            unix_socket: PathBuf::from(DEFAULT_UNIX_SOCKET_PATH),
        }
    }
}

/// Log verbosity and destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Lower the default filter from `info` to `debug`.
    pub verbose: bool,
    /// Append to this file instead of writing to standard error.
    pub file: Option<PathBuf>,
}

/// All runtime configuration for the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub serial: SerialSource,
    pub settings: SerialSettings,
    pub framing: FramingMode,
    pub listen: ListenConfig,
    /// Capacity of each line assembly buffer, in bytes.  Always at least 1.
    pub line_capacity: usize,
    /// Pause between a failed serial open and the next attempt.
    pub reopen_delay: Duration,
    pub daemon: bool,
    pub log: LogConfig,
}

impl AgentConfig {
    /// Applies the rules that tie options together:
    ///
    /// - running as a daemon rules out the stdio serial source (falls back
    ///   to the default device);
    /// - with a stdio source the terminal already echoes, so local echo is
    ///   turned off;
    /// - a zero line capacity is raised to one.
    pub fn normalize(mut self) -> Self {
        if self.daemon && self.serial == SerialSource::Stdio {
            self.serial = SerialSource::Device(PathBuf::from(DEFAULT_SERIAL_DEVICE));
        }
        if self.serial == SerialSource::Stdio {
            self.settings.local_echo = false;
        }
        self.line_capacity = self.line_capacity.max(1);
        self
    }
}

impl Default for AgentConfig {
    /// | Field          | Default                 |
    /// |----------------|-------------------------|
    /// | serial         | `/dev/ttyUSB0`          |
    /// | settings       | 115200, no echo, no 485 |
    /// | framing        | line                    |
    /// | listen         | Unix `/tmp/sio-agent.sock` |
    /// | line_capacity  | 256                     |
    /// | reopen_delay   | 1 second                |
    fn default() -> Self {
        Self {
            serial: SerialSource::Device(PathBuf::from(DEFAULT_SERIAL_DEVICE)),
            settings: SerialSettings::default(),
            framing: FramingMode::Line,
            listen: ListenConfig::default(),
            line_capacity: DEFAULT_LINE_CAPACITY,
            reopen_delay: Duration::from_secs(1),
            daemon: false,
            log: LogConfig::default(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
