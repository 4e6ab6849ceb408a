//! sio-agent: serial-to-socket relay, entry point.
//!
//! Bridges one serial device (or a freshly allocated pseudo-terminal, or the
//! process's own stdin/stdout) to at most one socket client at a time.
//! Serial input is assembled into lines and sent to the client; client
//! lines are written to the device with a carriage return.  `ping` is
//! answered with `pong!` and `*`-prefixed lines are handled by the agent
//! itself (`*help`, `*version`, `*status`).
//!
//! # Usage
//!
//! ```text
//! sio-agent [OPTIONS]
//!
//! Options:
//!   --serial <DEV>        Serial device [default: /dev/ttyUSB0]
//!   --pty                 Allocate a pseudo-terminal instead
//!   --stdio               Use stdin/stdout as the serial side
//!   --baud <RATE>         1200..230400 [default: 115200]
//!   --echo                Local echo with backspace editing
//!   --rs485               Enable RS-485 transmit keying
//!   --tcp-port [<PORT>]   Listen on TCP (7880 when no value is given)
//!   --unix-socket <PATH>  Unix socket path [default: /tmp/sio-agent.sock]
//!   --raw                 Relay bytes verbatim, no line framing
//!   --daemon              Detach from the terminal
//!   --verbose             Debug logging
//!   --log-file <PATH>     Append logs to a file instead of stderr
//!   --config <PATH>       TOML configuration file
//! ```
//!
//! # Environment variables
//!
//! | Variable           | Equivalent flag |
//! |--------------------|-----------------|
//! | `SIO_AGENT_TTY`    | `--serial`      |
//! | `SIO_AGENT_CONFIG` | `--config`      |
//! | `RUST_LOG`         | log filter      |
//!
//! Command-line flags and environment variables take precedence over the
//! configuration file, which takes precedence over built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use sio_agent::domain::{AgentConfig, SerialSource};
use sio_agent::infrastructure::config_file::{load_config_file, FileConfig};
use sio_agent::infrastructure::logging::init_logging;
use sio_agent::infrastructure::shutdown;
use sio_agent::infrastructure::{install_signal_handlers, AnyOpener, DeviceOpener, Listener, Relay};
use sio_core::{BuiltinCommands, FramingMode};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Serial-to-socket relay with line framing and an in-band command protocol.
#[derive(Debug, Parser)]
#[command(name = "sio-agent", version)]
struct Cli {
    /// Serial device node.  Defaults to /dev/ttyUSB0.
    #[arg(long, env = "SIO_AGENT_TTY", conflicts_with_all = ["pty", "stdio"])]
    serial: Option<PathBuf>,

    /// Allocate a pseudo-terminal and log its slave path.
    #[arg(long, conflicts_with = "stdio")]
    pty: bool,

    /// Use stdin/stdout as the serial side.  Ignored with --daemon.
    #[arg(long)]
    stdio: bool,

    /// Line speed in bits per second.  Unsupported rates are ignored with a
    /// warning.
    #[arg(long)]
    baud: Option<u32>,

    /// Echo received characters back to the device and honour backspace.
    #[arg(long)]
    echo: bool,

    /// Key the RS-485 transmitter with RTS.
    #[arg(long)]
    rs485: bool,

    /// Listen on this TCP port on every interface.  Without a value the
    /// conventional port is used; 0 selects the Unix socket.
    #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "7880")]
    tcp_port: Option<u16>,

    /// Unix-domain socket path, used when no TCP port is set.
    #[arg(long, value_name = "PATH")]
    unix_socket: Option<PathBuf>,

    /// Relay bytes verbatim in both directions.
    #[arg(long)]
    raw: bool,

    /// Detach from the controlling terminal.
    #[arg(long)]
    daemon: bool,

    /// Log at debug level (RUST_LOG overrides).
    #[arg(long, short)]
    verbose: bool,

    /// Append log output to this file.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long, value_name = "PATH", env = "SIO_AGENT_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Merges the command line over `file` and built-in defaults.
    ///
    /// Returns the resolved configuration plus any warnings, which are
    /// logged once the subscriber is installed.
    fn resolve(self, file: FileConfig) -> (AgentConfig, Vec<String>) {
        let mut warnings = Vec::new();
        let mut config = AgentConfig::default();

        config.serial = if self.stdio {
            SerialSource::Stdio
        } else if self.pty {
            SerialSource::Pty
        } else if let Some(path) = self.serial {
            SerialSource::Device(path)
        } else if file.serial.stdio == Some(true) {
            SerialSource::Stdio
        } else if file.serial.pty == Some(true) {
            SerialSource::Pty
        } else if let Some(path) = file.serial.device {
            SerialSource::Device(path)
        } else {
            config.serial
        };

        let echo = self.echo || file.serial.echo.unwrap_or(false);
        let rs485 = self.rs485 || file.serial.rs485.unwrap_or(false);
        let rate = self
            .baud
            .or(file.serial.baud)
            .unwrap_or_else(|| config.settings.baud.into());
        if !config.settings.configure(echo, rate, rs485) {
            warnings.push(format!(
                "unsupported baud rate: {rate}; keeping {} baud",
                config.settings.baud
            ));
        }

        config.framing = if self.raw {
            FramingMode::Raw
        } else {
            file.agent.framing.unwrap_or_default()
        };

        if let Some(port) = self.tcp_port.or(file.listen.tcp_port) {
            config.listen.tcp_port = port;
        }
        if let Some(path) = self.unix_socket.or(file.listen.unix_socket) {
            config.listen.unix_socket = path;
        }

        if let Some(cap) = file.agent.line_capacity {
            if cap == 0 {
                warnings.push("line_capacity must be at least 1; using 1".to_string());
            }
            config.line_capacity = cap;
        }
        if let Some(ms) = file.agent.reopen_delay_ms {
            config.reopen_delay = Duration::from_millis(ms);
        }

        config.daemon = self.daemon || file.agent.daemon.unwrap_or(false);
        if config.daemon && config.serial == SerialSource::Stdio {
            warnings.push(format!(
                "stdio cannot be used as a daemon; falling back to {}",
                sio_core::domain::settings::DEFAULT_SERIAL_DEVICE
            ));
        }

        config.log.verbose = self.verbose || file.log.verbose.unwrap_or(false);
        config.log.file = self.log_file.or(file.log.file);

        (config.normalize(), warnings)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => load_config_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => FileConfig::default(),
    };
    let (mut config, warnings) = cli.resolve(file);

    if config.daemon {
        // daemon(3) changes to `/`; pin relative paths first.
        absolutize_paths(&mut config)?;
        daemonize()?;
    }

    init_logging(&config.log)?;
    for w in &warnings {
        warn!("{w}");
    }

    // Single-threaded: the relay is one event loop and never needs more.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;

    let result = runtime.block_on(run(config));
    shutdown_runtime(runtime);
    result
}

/// How long teardown waits for blocking-pool work before abandoning it.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Tears the runtime down without waiting on a blocked stdin read.
///
/// `tokio::io::stdin` reads on a blocking-pool thread that cannot be
/// cancelled; a plain drop would wait for the next byte of input.
fn shutdown_runtime(runtime: tokio::runtime::Runtime) {
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let (trigger, shutdown) = shutdown::channel();
    install_signal_handlers(trigger).context("failed to install signal handlers")?;

    let listener = Listener::listen(&config.listen).context("cannot set up listening endpoint")?;

    let opener = AnyOpener::from_source(&config.serial, config.settings);
    let handler = BuiltinCommands::new(opener.describe(), config.settings, config.framing);

    info!(
        "sio-agent {} starting: serial={} baud={} framing={} endpoint={}",
        env!("CARGO_PKG_VERSION"),
        config.serial,
        config.settings.baud,
        config.framing,
        endpoint_label(&config),
    );

    let mut relay = Relay::new(&config, opener, handler);
    relay.run(listener, shutdown).await
}

fn endpoint_label(config: &AgentConfig) -> String {
    if config.listen.tcp_port != 0 {
        format!("tcp:{}", config.listen.tcp_port)
    } else {
        format!("unix:{}", config.listen.unix_socket.display())
    }
}

fn absolutize_paths(config: &mut AgentConfig) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let fix = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { cwd.join(p) };

    if let SerialSource::Device(path) = &config.serial {
        config.serial = SerialSource::Device(fix(path));
    }
    config.listen.unix_socket = fix(&config.listen.unix_socket);
    if let Some(file) = &config.log.file {
        config.log.file = Some(fix(file));
    }
    Ok(())
}

/// Detaches from the terminal, keeping the standard descriptors open.
fn daemonize() -> anyhow::Result<()> {
    // SAFETY: called before any threads (and the runtime) exist.
    if unsafe { libc::daemon(0, 1) } != 0 {
        return Err(std::io::Error::last_os_error()).context("failed to daemonize");
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
