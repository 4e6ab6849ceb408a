//! The listening endpoint and the connected peer.
//!
//! The agent serves one client at a time, so both listeners are created
//! with a backlog of one: a second client can complete its handshake but
//! waits, unserved, until the current peer goes away.
//!
//! A Unix-domain listener owns its socket file.  A stale file left behind
//! by a previous run is removed before binding, and [`Listener::close`]
//! removes the file again on the way out.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixSocket, UnixStream};
use tracing::{debug, info, warn};

use sio_core::{escape_control, LineAssembler};

use crate::domain::config::ListenConfig;

const BACKLOG: u32 = 1;

/// Smallest line the peer buffer holds.  Client lines are forwarded whole
/// or not at all, so the limit sits well above any sensible command.
pub const PEER_LINE_LIMIT: usize = 64 * 1024;

/// Errors setting up the listening endpoint.  All of them are fatal.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("cannot remove stale socket file {path}: {source}")]
    StaleSocket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot create listening socket: {0}")]
    Socket(#[source] io::Error),

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Which kind of listener is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Tcp,
    Unix,
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// A bound, listening socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Binds according to `config`: TCP on every interface when
    /// `tcp_port` is non-zero, otherwise a Unix socket at `unix_socket`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen(config: &ListenConfig) -> Result<Self, EndpointError> {
        if config.tcp_port != 0 {
            Self::listen_tcp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.tcp_port)))
        } else {
            Self::listen_unix(&config.unix_socket)
        }
    }

    /// Binds a TCP listener at `addr`.  Port 0 picks an ephemeral port.
    pub fn listen_tcp(addr: SocketAddr) -> Result<Self, EndpointError> {
        let socket = TcpSocket::new_v4().map_err(EndpointError::Socket)?;
        socket.set_reuseaddr(true).map_err(EndpointError::Socket)?;
        socket.bind(addr).map_err(|source| EndpointError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let listener = socket.listen(BACKLOG).map_err(|source| EndpointError::Listen {
            addr: addr.to_string(),
            source,
        })?;
        info!(
            "listening on tcp {}",
            listener.local_addr().unwrap_or(addr)
        );
        Ok(Listener::Tcp(listener))
    }

    /// Binds a Unix-domain listener at `path`, replacing a stale file.
    pub fn listen_unix(path: &Path) -> Result<Self, EndpointError> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed stale socket file {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(EndpointError::StaleSocket {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        let addr = path.display().to_string();
        let socket = UnixSocket::new_stream().map_err(EndpointError::Socket)?;
        socket.bind(path).map_err(|source| EndpointError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let listener = socket
            .listen(BACKLOG)
            .map_err(|source| EndpointError::Listen { addr, source })?;
        info!("listening on unix socket {}", path.display());
        Ok(Listener::Unix {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            Listener::Tcp(_) => AddressFamily::Tcp,
            Listener::Unix { .. } => AddressFamily::Unix,
        }
    }

    /// The bound TCP address, if this is a TCP listener.
    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Unix { .. } => None,
        }
    }

    /// Waits for the next client.
    pub async fn accept(&self, line_capacity: usize) -> io::Result<Peer> {
        match self {
            Listener::Tcp(l) => {
                let (stream, addr) = l.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {e}");
                }
                info!("client connected from {}", addr.ip());
                Ok(Peer::new(PeerStream::Tcp(stream), addr.ip().to_string(), line_capacity))
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                info!("client connected on local socket");
                Ok(Peer::new(PeerStream::Unix(stream), "local".to_string(), line_capacity))
            }
        }
    }

    /// Stops listening.  A Unix socket file is removed.
    pub fn close(self) {
        if let Listener::Unix { listener, path } = self {
            drop(listener);
            match std::fs::remove_file(&path) {
                Ok(()) => info!("removed socket file {}", path.display()),
                Err(e) => warn!("cannot remove socket file {}: {e}", path.display()),
            }
        }
    }
}

// ── Peer ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum PeerStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// The connected client, with its own line assembly buffer.
///
/// The buffer is created empty with each connection, so a partial line
/// left by one client never leaks into the next.  A line longer than the
/// buffer is dropped entirely, never split.
#[derive(Debug)]
pub struct Peer {
    stream: PeerStream,
    label: String,
    assembler: LineAssembler,
}

impl Peer {
    fn new(stream: PeerStream, label: String, line_capacity: usize) -> Self {
        Self {
            stream,
            label,
            assembler: LineAssembler::passthrough(line_capacity.max(PEER_LINE_LIMIT)),
        }
    }

    /// Peer address for logs: an IP, or `local` for Unix sockets.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn family(&self) -> AddressFamily {
        match self.stream {
            PeerStream::Tcp(_) => AddressFamily::Tcp,
            PeerStream::Unix(_) => AddressFamily::Unix,
        }
    }

    /// Reads available bytes.  `Ok(0)` means the client disconnected.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            PeerStream::Tcp(s) => s.read(buf).await,
            PeerStream::Unix(s) => s.read(buf).await,
        }
    }

    /// Feeds one received byte; returns a completed line ending in `'\n'`.
    pub fn assemble_line(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.assembler.feed(byte) {
            sio_core::Feed::Complete(line) => Some(line),
            _ => None,
        }
    }

    /// Sends `bytes` to the client.
    ///
    /// A failure is logged and reported as `false`; the relay keeps the
    /// peer until a read confirms the disconnect.
    pub async fn write(&mut self, bytes: &[u8]) -> bool {
        let result = match &mut self.stream {
            PeerStream::Tcp(s) => s.write_all(bytes).await,
            PeerStream::Unix(s) => s.write_all(bytes).await,
        };
        match result {
            Ok(()) => {
                debug!("to peer: {}", escape_control(bytes));
                true
            }
            Err(e) => {
                warn!("write to peer {} failed: {e}", self.label);
                false
            }
        }
    }

    /// Shuts the connection down.
    pub async fn close(mut self) {
        let result = match &mut self.stream {
            PeerStream::Tcp(s) => s.shutdown().await,
            PeerStream::Unix(s) => s.shutdown().await,
        };
        if let Err(e) = result {
            debug!("peer shutdown: {e}");
        }
        info!("client {} disconnected", self.label);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
