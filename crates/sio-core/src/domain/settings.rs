//! Serial line settings and agent-wide defaults.
//!
//! [`SerialSettings`] is the session-wide record consulted every time the
//! agent opens (or re-opens) the serial device.  It replaces the process-wide
//! echo/baud flags an agent of this kind traditionally keeps: build one value
//! at startup and hand it to the serial channel and relay loop.
//!
//! # Supported baud rates
//!
//! Only the rates in [`BaudRate`] are accepted.  An unsupported rate passed
//! to [`SerialSettings::configure`] is rejected with a warning and the
//! previously configured rate is kept.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Default serial device when neither a path, a pty nor stdio is requested.
pub const DEFAULT_SERIAL_DEVICE: &str = "/dev/ttyUSB0";

/// Conventional TCP port used when `--tcp-port` is given without a value.
pub const DEFAULT_TCP_PORT: u16 = 7880;

/// Well-known path of the Unix-domain socket used when no TCP port is set.
pub const DEFAULT_UNIX_SOCKET_PATH: &str = "/tmp/sio-agent.sock";

/// Capacity of the line assembly buffer, in payload bytes.
pub const DEFAULT_LINE_CAPACITY: usize = 256;

/// Errors produced while validating settings values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// The requested rate is not one of the enumerated [`BaudRate`] values.
    #[error("unsupported baud rate: {0}")]
    UnsupportedBaud(u32),
}

/// The fixed set of serial bit rates the agent can program into a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    B1200,
    B2400,
    B4800,
    B9600,
    B19200,
    B38400,
    B57600,
    #[default]
    B115200,
    B230400,
}

impl BaudRate {
    /// Every supported rate, slowest first.
    pub const ALL: [BaudRate; 9] = [
        BaudRate::B1200,
        BaudRate::B2400,
        BaudRate::B4800,
        BaudRate::B9600,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
        BaudRate::B230400,
    ];

    /// Returns the rate in bits per second.
    pub fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::B1200 => 1200,
            BaudRate::B2400 => 2400,
            BaudRate::B4800 => 4800,
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115_200,
            BaudRate::B230400 => 230_400,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = SettingsError;

    fn try_from(rate: u32) -> Result<Self, Self::Error> {
        BaudRate::ALL
            .iter()
            .copied()
            .find(|b| b.bits_per_second() == rate)
            .ok_or(SettingsError::UnsupportedBaud(rate))
    }
}

impl From<BaudRate> for u32 {
    fn from(rate: BaudRate) -> Self {
        rate.bits_per_second()
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits_per_second())
    }
}

/// How bytes are framed between the peer and the serial device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    /// Bytes are assembled into lines and run through the command
    /// interpreter in both directions.
    #[default]
    Line,
    /// Arbitrary chunks are relayed verbatim; no terminator is appended and
    /// no command is interpreted.
    Raw,
}

impl fmt::Display for FramingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingMode::Line => f.write_str("line"),
            FramingMode::Raw => f.write_str("raw"),
        }
    }
}

/// Session-wide serial parameters applied on every open of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Echo received characters (and backspace erasures) back to the device.
    pub local_echo: bool,
    /// Bit rate programmed into a real device.  Ignored for pseudo-terminals.
    pub baud: BaudRate,
    /// Issue the RS-485 hardware configuration call after opening.
    pub rs485: bool,
}

impl SerialSettings {
    /// Records echo, baud and RS-485 settings in one call.
    ///
    /// An unsupported `baud` value is logged and ignored; the previously
    /// configured rate is retained and `false` is returned.  The other two
    /// settings always apply.
    pub fn configure(&mut self, local_echo: bool, baud: u32, rs485: bool) -> bool {
        self.local_echo = local_echo;
        self.rs485 = rs485;
        self.set_baud(baud)
    }

    /// Updates the baud rate, returning `false` (and keeping the old rate)
    /// if `rate` is not supported.
    pub fn set_baud(&mut self, rate: u32) -> bool {
        match BaudRate::try_from(rate) {
            Ok(baud) => {
                self.baud = baud;
                true
            }
            Err(e) => {
                warn!("{e}; keeping {} baud", self.baud);
                false
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
