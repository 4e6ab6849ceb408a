//! Optional TOML configuration file.
//!
//! Every key is optional; a key that is absent leaves the decision to the
//! command line or the built-in default.  Command-line flags and
//! environment variables always win over the file.
//!
//! ```toml
//! [serial]
//! device = "/dev/ttyS1"     # or: pty = true / stdio = true
//! baud = 57600
//! echo = true
//! rs485 = false
//!
//! [listen]
//! tcp_port = 7880           # 0 or absent: Unix-domain socket
//! unix_socket = "/run/sio-agent.sock"
//!
//! [agent]
//! framing = "line"          # or "raw"
//! line_capacity = 256
//! reopen_delay_ms = 1000
//! daemon = false
//!
//! [log]
//! verbose = false
//! file = "/var/log/sio-agent.log"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use sio_core::FramingMode;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// The whole file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub serial: SerialSection,
    pub listen: ListenSection,
    pub agent: AgentSection,
    pub log: LogSection,
}

/// `[serial]`
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SerialSection {
    pub device: Option<PathBuf>,
    pub pty: Option<bool>,
    pub stdio: Option<bool>,
    /// Kept as a plain number so an unsupported rate can be rejected with a
    /// warning instead of failing the whole file.
    pub baud: Option<u32>,
    pub echo: Option<bool>,
    pub rs485: Option<bool>,
}

/// `[listen]`
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ListenSection {
    pub tcp_port: Option<u16>,
    pub unix_socket: Option<PathBuf>,
}

/// `[agent]`
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    pub framing: Option<FramingMode>,
    pub line_capacity: Option<usize>,
    pub reopen_delay_ms: Option<u64>,
    pub daemon: Option<bool>,
}

/// `[log]`
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub verbose: Option<bool>,
    pub file: Option<PathBuf>,
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Parses configuration text.
pub fn parse_config(text: &str) -> Result<FileConfig, ConfigError> {
    Ok(toml::from_str(text)?)
}

/// Reads and parses the file at `path`.
///
/// # Errors
///
/// Unlike a missing default location, an explicitly named file that does
/// not exist is an error: [`ConfigError::Io`].  Malformed TOML and unknown
/// keys give [`ConfigError::Parse`].
pub fn load_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&text)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
