//! Infrastructure layer for sio-agent.
//!
//! Everything that owns a file descriptor lives here:
//!
//! - [`serial`]: opening tty, pty and stdio sources; line-level serial I/O
//! - [`endpoint`]: the listening socket and the single connected peer
//! - [`relay`]: the event loop joining the two
//! - [`shutdown`]: the stop flag and SIGINT/SIGTERM handling
//! - [`logging`]: tracing subscriber setup
//! - [`config_file`]: the optional TOML configuration file

pub mod config_file;
pub mod endpoint;
pub mod logging;
pub mod relay;
pub mod serial;
pub mod shutdown;

pub use endpoint::{AddressFamily, EndpointError, Listener, Peer};
pub use relay::{Relay, RelayState};
pub use serial::{AnyOpener, DeviceOpener, SerialChannel, SerialError, StdioOpener, TtyOpener};
pub use shutdown::{install_signal_handlers, Shutdown, ShutdownTrigger};
