//! The serial channel: device opening and line-level I/O.
//!
//! This module is responsible for:
//!
//! 1. Opening the serial side of the relay (a tty node, a fresh
//!    pseudo-terminal, or the process's stdio) through a [`DeviceOpener`].
//! 2. Putting terminals into raw mode, programming the baud rate and,
//!    optionally, the RS-485 transmit keying.
//! 3. Wrapping the descriptor in a non-blocking [`TtyDevice`] that plugs into
//!    the tokio reactor.
//! 4. [`SerialChannel`]: chunk reads, per-byte line assembly with local
//!    echo, and best-effort writes with the carriage-return terminator.
//!
//! # Pseudo-terminals
//!
//! When no device path is configured the agent allocates a pty master and
//! logs the slave path so an operator can attach a terminal program to it.
//! The agent also keeps its own handle on the slave: without one, Linux
//! reports a hang-up on the master as soon as the last external program
//! detaches, which would force a new pty (with a new path) on every detach.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, trace, warn};

use sio_core::{escape_control, BaudRate, Feed, FramingMode, LineAssembler, SerialSettings};

use crate::domain::config::SerialSource;

/// Erase sequence echoed for a backspace: back, blank, back.
const ERASE_ECHO: &[u8] = b"\x08 \x08";
/// Echoed when a line completes.
const NEWLINE_ECHO: &[u8] = b"\r\n";
/// Appended to every line written to the device in line mode.
const LINE_TERMINATOR: u8 = b'\r';

/// Errors opening or configuring the serial side.
#[derive(Debug, Error)]
pub enum SerialError {
    /// The device node could not be opened.
    #[error("cannot open serial device {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Pseudo-terminal allocation failed at the named step.
    #[error("pseudo-terminal allocation failed in {step}: {source}")]
    Pty {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    /// Raw mode or baud rate could not be applied.
    #[error("cannot configure terminal attributes: {0}")]
    Termios(#[source] io::Error),

    /// The descriptor could not be registered with the async reactor.
    #[error("cannot register serial descriptor: {0}")]
    Register(#[source] io::Error),

    /// The serial source cannot be opened again (stdio after end of input).
    #[error("serial source {0} cannot be reopened")]
    Exhausted(String),
}

// ── Opening ───────────────────────────────────────────────────────────────────

/// Opens the serial side of the relay, once per session.
///
/// The relay calls [`open`](DeviceOpener::open) at the top of every outer
/// iteration: at startup and again after each read failure.
pub trait DeviceOpener {
    /// The byte stream produced by a successful open.
    type Device: AsyncRead + AsyncWrite + Unpin + Send;

    /// Opens (or re-opens) the device.
    fn open(&mut self) -> Result<Self::Device, SerialError>;

    /// Whether a failed or closed device should be opened again.
    fn reopenable(&self) -> bool {
        true
    }

    /// Human-readable name for log messages.
    fn describe(&self) -> String;
}

/// Opens a terminal device node or allocates a pseudo-terminal.
#[derive(Debug, Clone)]
pub struct TtyOpener {
    path: Option<PathBuf>,
    settings: SerialSettings,
}

impl TtyOpener {
    /// `path == None` requests a pseudo-terminal.
    pub fn new(path: Option<PathBuf>, settings: SerialSettings) -> Self {
        Self { path, settings }
    }
}

impl DeviceOpener for TtyOpener {
    type Device = TtyDevice;

    fn open(&mut self) -> Result<TtyDevice, SerialError> {
        match &self.path {
            Some(path) => open_device(path, &self.settings),
            None => open_pty(),
        }
    }

    fn describe(&self) -> String {
        self.path
            .as_ref()
            .map_or_else(|| "pty".to_string(), |p| p.display().to_string())
    }
}

/// Uses the process's stdin and stdout as the serial side.
///
/// Opens successfully exactly once; end of input is final.
#[derive(Debug, Default)]
pub struct StdioOpener {
    opened: bool,
}

impl StdioOpener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceOpener for StdioOpener {
    type Device = tokio::io::Join<tokio::io::Stdin, tokio::io::Stdout>;

    fn open(&mut self) -> Result<Self::Device, SerialError> {
        if self.opened {
            return Err(SerialError::Exhausted(self.describe()));
        }
        self.opened = true;
        Ok(tokio::io::join(tokio::io::stdin(), tokio::io::stdout()))
    }

    fn reopenable(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        "stdio".to_string()
    }
}

/// Either kind of opener, selected from a [`SerialSource`].
#[derive(Debug)]
pub enum AnyOpener {
    Tty(TtyOpener),
    Stdio(StdioOpener),
}

impl AnyOpener {
    pub fn from_source(source: &SerialSource, settings: SerialSettings) -> Self {
        match source {
            SerialSource::Device(path) => AnyOpener::Tty(TtyOpener::new(Some(path.clone()), settings)),
            SerialSource::Pty => AnyOpener::Tty(TtyOpener::new(None, settings)),
            SerialSource::Stdio => AnyOpener::Stdio(StdioOpener::new()),
        }
    }
}

impl DeviceOpener for AnyOpener {
    type Device = Box<dyn DuplexIo>;

    fn open(&mut self) -> Result<Self::Device, SerialError> {
        Ok(match self {
            AnyOpener::Tty(o) => Box::new(o.open()?),
            AnyOpener::Stdio(o) => Box::new(o.open()?),
        })
    }

    fn reopenable(&self) -> bool {
        match self {
            AnyOpener::Tty(o) => o.reopenable(),
            AnyOpener::Stdio(o) => o.reopenable(),
        }
    }

    fn describe(&self) -> String {
        match self {
            AnyOpener::Tty(o) => o.describe(),
            AnyOpener::Stdio(o) => o.describe(),
        }
    }
}

/// Object-safe alias for a bidirectional async byte stream.
pub trait DuplexIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexIo for T {}

fn open_device(path: &Path, settings: &SerialSettings) -> Result<TtyDevice, SerialError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)
        .map_err(|source| SerialError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    apply_raw_mode(file.as_raw_fd(), Some(settings.baud)).map_err(SerialError::Termios)?;

    if settings.rs485 {
        // Best effort: plenty of USB adapters reject the request.
        match enable_rs485(file.as_raw_fd()) {
            Ok(()) => info!("RS-485 mode enabled on {}", path.display()),
            Err(e) => warn!("RS-485 configuration failed on {}: {e}", path.display()),
        }
    }

    info!("opened {} at {} baud", path.display(), settings.baud);
    TtyDevice::new(file, None)
}

fn open_pty() -> Result<TtyDevice, SerialError> {
    let pty_err = |step: &'static str| move |source: io::Error| SerialError::Pty { step, source };

    // SAFETY: posix_openpt takes only flags; the result is checked below.
    let raw = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
    if raw < 0 {
        return Err(pty_err("posix_openpt")(io::Error::last_os_error()));
    }
    // SAFETY: `raw` is a freshly opened descriptor owned by nobody else.
    let master = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: `master` is a valid pty master descriptor.
    if unsafe { libc::grantpt(master.as_raw_fd()) } != 0 {
        return Err(pty_err("grantpt")(io::Error::last_os_error()));
    }
    // SAFETY: as above.
    if unsafe { libc::unlockpt(master.as_raw_fd()) } != 0 {
        return Err(pty_err("unlockpt")(io::Error::last_os_error()));
    }

    let slave_path = slave_name(master.as_raw_fd()).map_err(pty_err("ptsname"))?;
    let slave = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(&slave_path)
        .map_err(pty_err("open slave"))?;

    apply_raw_mode(slave.as_raw_fd(), None).map_err(SerialError::Termios)?;
    set_nonblocking(master.as_raw_fd()).map_err(pty_err("fcntl"))?;

    info!("pseudo-terminal allocated; slave port = {}", slave_path.display());
    TtyDevice::new(File::from(master), Some((slave, slave_path)))
}

#[cfg(target_os = "linux")]
fn slave_name(master: RawFd) -> io::Result<PathBuf> {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: `buf` is writable for its full length, which is passed along.
    let rc = unsafe { libc::ptsname_r(master, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    // SAFETY: ptsname_r NUL-terminates on success.
    let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
    Ok(PathBuf::from(name.to_string_lossy().into_owned()))
}

#[cfg(not(target_os = "linux"))]
fn slave_name(master: RawFd) -> io::Result<PathBuf> {
    // SAFETY: ptsname returns a pointer into static storage or null; it is
    // copied out immediately and the relay is single-threaded.
    let ptr = unsafe { libc::ptsname(master) };
    if ptr.is_null() {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: non-null result is a NUL-terminated string.
    let name = unsafe { std::ffi::CStr::from_ptr(ptr) };
    Ok(PathBuf::from(name.to_string_lossy().into_owned()))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFL/F_SETFL on a valid descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Raw 8N1, receiver on, modem lines ignored, one-byte minimum reads.
fn apply_raw_mode(fd: RawFd, baud: Option<BaudRate>) -> io::Result<()> {
    let mut tio = std::mem::MaybeUninit::<libc::termios>::uninit();
    // SAFETY: `fd` is an open terminal and `tio` a valid out-pointer.
    if unsafe { libc::tcgetattr(fd, tio.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: tcgetattr succeeded, so the struct is initialised.
    let mut tio = unsafe { tio.assume_init() };

    // SAFETY: cfmakeraw only mutates the struct it is given.
    unsafe { libc::cfmakeraw(&mut tio) };
    tio.c_cflag |= libc::CS8 | libc::CREAD | libc::CLOCAL;
    tio.c_cc[libc::VMIN] = 1;
    tio.c_cc[libc::VTIME] = 0;

    if let Some(baud) = baud {
        let speed = termios_speed(baud);
        // SAFETY: plain setters on a local struct.
        unsafe {
            libc::cfsetispeed(&mut tio, speed);
            libc::cfsetospeed(&mut tio, speed);
        }
    }

    // SAFETY: `fd` is an open terminal and `tio` fully initialised.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn termios_speed(baud: BaudRate) -> libc::speed_t {
    match baud {
        BaudRate::B1200 => libc::B1200,
        BaudRate::B2400 => libc::B2400,
        BaudRate::B4800 => libc::B4800,
        BaudRate::B9600 => libc::B9600,
        BaudRate::B19200 => libc::B19200,
        BaudRate::B38400 => libc::B38400,
        BaudRate::B57600 => libc::B57600,
        BaudRate::B115200 => libc::B115200,
        BaudRate::B230400 => libc::B230400,
    }
}

/// Layout of the kernel's `struct serial_rs485`.
#[cfg(target_os = "linux")]
#[repr(C)]
#[derive(Default)]
struct SerialRs485 {
    flags: u32,
    delay_rts_before_send: u32,
    delay_rts_after_send: u32,
    padding: [u32; 5],
}

#[cfg(target_os = "linux")]
const TIOCSRS485: libc::c_ulong = 0x542F;
#[cfg(target_os = "linux")]
const SER_RS485_ENABLED: u32 = 1 << 0;
#[cfg(target_os = "linux")]
const SER_RS485_RTS_ON_SEND: u32 = 1 << 1;

#[cfg(target_os = "linux")]
fn enable_rs485(fd: RawFd) -> io::Result<()> {
    let conf = SerialRs485 {
        flags: SER_RS485_ENABLED | SER_RS485_RTS_ON_SEND,
        ..SerialRs485::default()
    };
    // SAFETY: TIOCSRS485 reads a `struct serial_rs485`, which `conf` matches.
    if unsafe { libc::ioctl(fd, TIOCSRS485 as _, &conf as *const SerialRs485) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enable_rs485(_fd: RawFd) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "RS-485 keying is only available on Linux",
    ))
}

// ── Async device ──────────────────────────────────────────────────────────────

/// A non-blocking terminal descriptor registered with the tokio reactor.
pub struct TtyDevice {
    inner: AsyncFd<File>,
    slave: Option<(File, PathBuf)>,
}

impl TtyDevice {
    fn new(file: File, slave: Option<(File, PathBuf)>) -> Result<Self, SerialError> {
        let inner = AsyncFd::new(file).map_err(SerialError::Register)?;
        Ok(Self { inner, slave })
    }

    /// The pseudo-terminal slave path, when this device is a pty master.
    pub fn slave_path(&self) -> Option<&Path> {
        self.slave.as_ref().map(|(_, p)| p.as_path())
    }
}

impl std::fmt::Debug for TtyDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtyDevice")
            .field("fd", &self.inner.as_raw_fd())
            .field("slave", &self.slave_path())
            .finish()
    }
}

impl AsyncRead for TtyDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|fd| (&*fd.get_ref()).read(unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for TtyDevice {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match guard.try_io(|fd| (&*fd.get_ref()).write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ── Serial channel ────────────────────────────────────────────────────────────

/// One open serial session: the device plus its line assembly state.
///
/// Exclusively owned by the relay loop; dropped (closed) when a read fails
/// or the agent stops.
#[derive(Debug)]
pub struct SerialChannel<D> {
    device: D,
    assembler: LineAssembler,
    local_echo: bool,
    framing: FramingMode,
}

impl<D: AsyncRead + AsyncWrite + Unpin> SerialChannel<D> {
    pub fn new(device: D, settings: &SerialSettings, framing: FramingMode, line_capacity: usize) -> Self {
        Self {
            device,
            assembler: LineAssembler::new(line_capacity),
            local_echo: settings.local_echo,
            framing,
        }
    }

    /// Reads whatever the device has available.  `Ok(0)` is end of stream.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.read(buf).await
    }

    /// Feeds one received byte through the line assembly buffer.
    ///
    /// With local echo on, stored bytes are echoed back, a backspace erases
    /// the character on screen and a completed line echoes CR LF.  Echo
    /// failures are logged and otherwise ignored.
    pub async fn assemble_line(&mut self, byte: u8) -> Option<Vec<u8>> {
        let feed = self.assembler.feed(byte);

        if self.local_echo {
            let echo: &[u8] = match &feed {
                Feed::Stored(b) => std::slice::from_ref(b),
                Feed::Erased => ERASE_ECHO,
                Feed::Complete(_) => NEWLINE_ECHO,
                Feed::Ignored | Feed::Overflow => &[],
            };
            if !echo.is_empty() {
                if let Err(e) = self.device.write_all(echo).await {
                    warn!("serial echo failed: {e}");
                }
            }
        }

        match feed {
            Feed::Complete(line) => {
                debug!("serial line: {}", escape_control(&line));
                Some(line)
            }
            Feed::Overflow => {
                trace!("serial line exceeded {} bytes; dropped", self.assembler.capacity());
                None
            }
            _ => None,
        }
    }

    /// Writes `payload` to the device as one write.
    ///
    /// In line mode a carriage return is appended.  Failures are logged and
    /// not returned: the relay carries on.
    pub async fn write(&mut self, payload: &[u8]) {
        let result = match self.framing {
            FramingMode::Line => {
                let mut framed = Vec::with_capacity(payload.len() + 1);
                framed.extend_from_slice(payload);
                framed.push(LINE_TERMINATOR);
                self.device.write_all(&framed).await
            }
            FramingMode::Raw => self.device.write_all(payload).await,
        };
        match result.and(self.device.flush().await) {
            Ok(()) => debug!("to serial: {}", escape_control(payload)),
            Err(e) => warn!("serial write failed: {e}"),
        }
    }

    /// Releases the device.
    pub async fn close(mut self) {
        if let Err(e) = self.device.shutdown().await {
            debug!("serial shutdown: {e}");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
