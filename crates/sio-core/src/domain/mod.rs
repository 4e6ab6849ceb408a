//! Domain types shared by the agent: serial settings and their defaults.
//!
//! Nothing in this module touches a file descriptor.  Translating a
//! [`BaudRate`] into a platform `termios` speed is the agent's job.

pub mod settings;

pub use settings::{BaudRate, FramingMode, SerialSettings, SettingsError};
