//! The default local-command handler.
//!
//! Commands are matched on the first whitespace-separated word, without the
//! leading `*`, case-insensitively:
//!
//! ```text
//! *help      list commands
//! *version   agent name and version
//! *status    uptime, device and serial settings
//! ```
//!
//! Anything else is answered with `ERR unknown command '<cmd>'`.  Every reply
//! ends with `'\n'`.

use std::time::Instant;

use crate::command::LocalCommandHandler;
use crate::domain::settings::{FramingMode, SerialSettings};

const HELP_TEXT: &str = "commands: *help *version *status\n";

/// Built-in answers for `*help`, `*version` and `*status`.
#[derive(Debug, Clone)]
pub struct BuiltinCommands {
    started: Instant,
    device: String,
    settings: SerialSettings,
    framing: FramingMode,
}

impl BuiltinCommands {
    /// `device` is a human-readable description of the serial source
    /// (a path, `pty` or `stdio`) reported by `*status`.
    pub fn new(device: impl Into<String>, settings: SerialSettings, framing: FramingMode) -> Self {
        Self {
            started: Instant::now(),
            device: device.into(),
            settings,
            framing,
        }
    }

    fn status(&self) -> String {
        format!(
            "OK uptime={}s device={} baud={} echo={} rs485={} framing={}\n",
            self.started.elapsed().as_secs(),
            self.device,
            self.settings.baud,
            on_off(self.settings.local_echo),
            on_off(self.settings.rs485),
            self.framing,
        )
    }
}

impl LocalCommandHandler for BuiltinCommands {
    fn handle(&mut self, command: &str) -> Option<String> {
        let name = command
            .trim_start_matches('*')
            .split_whitespace()
            .next()
            .unwrap_or("");

        let reply = match name.to_ascii_lowercase().as_str() {
            "help" => HELP_TEXT.to_string(),
            "version" => format!("sio-agent {}\n", env!("CARGO_PKG_VERSION")),
            "status" => self.status(),
            _ => format!("ERR unknown command '{}'\n", command.trim()),
        };
        Some(reply)
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}
