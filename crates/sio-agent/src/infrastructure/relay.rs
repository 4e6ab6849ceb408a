//! The relay loop.
//!
//! One task multiplexes four event sources with `tokio::select!`:
//!
//! ```text
//!   stop request ──────────┐
//!   listener (no peer only)┤
//!   peer bytes ────────────┼──► one event ──► handled to completion
//!   serial bytes ──────────┘
//! ```
//!
//! Every event is handled to completion before the next wait, so the line
//! buffers, the peer slot and the serial channel are only ever touched from
//! this one place and need no locking.
//!
//! # States
//!
//! ```text
//!             accept                       peer EOF / error
//!   NoPeer ───────────► PeerActive ─────────────────────────► NoPeer
//!     │  ▲                  │
//!     │  └──── reopen ──────┤ serial EOF / error (peer closed too)
//!     ▼                     ▼
//!   SerialDown ◄────────────┘
//! ```
//!
//! While a peer is active the listener is not polled; further clients
//! wait in the backlog until the peer leaves.

use std::future::pending;
use std::io;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, trace, warn};

use sio_core::{escape_control, FramingMode, LocalCommandHandler, SerialSettings};

use crate::application::{CommandInterpreter, PeerAction};
use crate::domain::config::AgentConfig;
use crate::infrastructure::endpoint::{Listener, Peer};
use crate::infrastructure::serial::{DeviceOpener, SerialChannel};
use crate::infrastructure::shutdown::Shutdown;

const READ_CHUNK: usize = 512;

/// Pause after a failed accept, so a persistent error (EMFILE and the
/// like) does not turn the loop into a busy spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Where the relay currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Serial open, waiting for a client.
    NoPeer,
    /// Serial open, one client connected.
    PeerActive,
    /// Serial closed; waiting to reopen.
    SerialDown,
}

/// How a serial session ended.
enum SessionEnd {
    Stop,
    SerialLost,
}

enum Event {
    Stop,
    Accepted(io::Result<Peer>),
    FromPeer(io::Result<usize>),
    FromSerial(io::Result<usize>),
}

/// Bridges one serial device and at most one socket client.
pub struct Relay<O, H> {
    opener: O,
    interpreter: CommandInterpreter<H>,
    settings: SerialSettings,
    framing: FramingMode,
    line_capacity: usize,
    reopen_delay: Duration,
    state: RelayState,
}

impl<O, H> Relay<O, H>
where
    O: DeviceOpener,
    H: LocalCommandHandler,
{
    pub fn new(config: &AgentConfig, opener: O, handler: H) -> Self {
        Self {
            opener,
            interpreter: CommandInterpreter::new(handler),
            settings: config.settings,
            framing: config.framing,
            line_capacity: config.line_capacity.max(1),
            reopen_delay: config.reopen_delay,
            state: RelayState::SerialDown,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Runs until `shutdown` fires, or until a serial source that cannot be
    /// reopened ends.  Closes the listener (removing a Unix socket file)
    /// before returning.
    pub async fn run(&mut self, listener: Listener, mut shutdown: Shutdown) -> Result<()> {
        let mut peer: Option<Peer> = None;

        while !shutdown.is_triggered() {
            let device = match self.opener.open() {
                Ok(device) => device,
                Err(e) => {
                    warn!("{e}");
                    if !self.opener.reopenable() || !shutdown.sleep(self.reopen_delay).await {
                        break;
                    }
                    continue;
                }
            };

            let mut serial = SerialChannel::new(device, &self.settings, self.framing, self.line_capacity);
            self.set_state(if peer.is_some() {
                RelayState::PeerActive
            } else {
                RelayState::NoPeer
            });

            let end = self.session(&listener, &mut serial, &mut peer, &mut shutdown).await;

            serial.close().await;
            if let Some(p) = peer.take() {
                p.close().await;
            }
            self.set_state(RelayState::SerialDown);

            match end {
                SessionEnd::Stop => break,
                SessionEnd::SerialLost => {
                    if !self.opener.reopenable() {
                        info!("serial source {} ended; stopping", self.opener.describe());
                        break;
                    }
                    if !shutdown.sleep(self.reopen_delay).await {
                        break;
                    }
                    info!("reopening {}", self.opener.describe());
                }
            }
        }

        if let Some(p) = peer.take() {
            p.close().await;
        }
        listener.close();
        info!("relay stopped");
        Ok(())
    }

    async fn session(
        &mut self,
        listener: &Listener,
        serial: &mut SerialChannel<O::Device>,
        peer: &mut Option<Peer>,
        shutdown: &mut Shutdown,
    ) -> SessionEnd {
        let mut peer_buf = [0u8; READ_CHUNK];
        let mut serial_buf = [0u8; READ_CHUNK];

        loop {
            let event = tokio::select! {
                _ = shutdown.triggered() => Event::Stop,
                accepted = listener.accept(self.line_capacity), if peer.is_none() => {
                    Event::Accepted(accepted)
                }
                n = read_peer(peer.as_mut(), &mut peer_buf) => Event::FromPeer(n),
                n = serial.read_chunk(&mut serial_buf) => Event::FromSerial(n),
            };

            match event {
                Event::Stop => return SessionEnd::Stop,

                Event::Accepted(Ok(p)) => {
                    *peer = Some(p);
                    self.set_state(RelayState::PeerActive);
                }
                Event::Accepted(Err(e)) => {
                    warn!("accept failed: {e}");
                    if !pause_after_accept_error(shutdown).await {
                        return SessionEnd::Stop;
                    }
                }

                Event::FromPeer(Ok(0)) => self.drop_peer(peer, None).await,
                Event::FromPeer(Err(e)) => self.drop_peer(peer, Some(e)).await,
                Event::FromPeer(Ok(n)) => {
                    if let Some(p) = peer.as_mut() {
                        self.on_peer_bytes(&peer_buf[..n], p, serial).await;
                    }
                }

                Event::FromSerial(Ok(0)) => {
                    warn!("end of stream on {}", self.opener.describe());
                    return SessionEnd::SerialLost;
                }
                Event::FromSerial(Err(e)) => {
                    warn!("read from {} failed: {e}", self.opener.describe());
                    return SessionEnd::SerialLost;
                }
                Event::FromSerial(Ok(n)) => {
                    self.on_serial_bytes(&serial_buf[..n], peer.as_mut(), serial).await;
                }
            }
        }
    }

    async fn on_peer_bytes(&mut self, bytes: &[u8], peer: &mut Peer, serial: &mut SerialChannel<O::Device>) {
        trace!("from peer: {}", escape_control(bytes));

        if self.framing == FramingMode::Raw {
            serial.write(bytes).await;
            return;
        }

        for &byte in bytes {
            let Some(line) = peer.assemble_line(byte) else {
                continue;
            };
            match self.interpreter.from_peer(&line) {
                PeerAction::Reply(reply) => {
                    peer.write(&reply).await;
                }
                PeerAction::Forward(payload) => serial.write(&payload).await,
                PeerAction::Nothing => {}
            }
        }
    }

    async fn on_serial_bytes(
        &mut self,
        bytes: &[u8],
        mut peer: Option<&mut Peer>,
        serial: &mut SerialChannel<O::Device>,
    ) {
        trace!("from serial: {}", escape_control(bytes));

        if self.framing == FramingMode::Raw {
            match peer {
                Some(p) => {
                    p.write(bytes).await;
                }
                None => debug!("no peer; dropped {} serial bytes", bytes.len()),
            }
            return;
        }

        for &byte in bytes {
            let Some(line) = serial.assemble_line(byte).await else {
                continue;
            };
            match peer.as_deref_mut() {
                Some(p) => {
                    if let Some(out) = self.interpreter.from_serial(&line) {
                        p.write(&out).await;
                    }
                }
                None => debug!("no peer; dropped serial line {}", escape_control(&line)),
            }
        }
    }

    async fn drop_peer(&mut self, peer: &mut Option<Peer>, error: Option<io::Error>) {
        if let Some(e) = error {
            warn!("read from peer failed: {e}");
        }
        if let Some(p) = peer.take() {
            p.close().await;
        }
        self.set_state(RelayState::NoPeer);
    }

    fn set_state(&mut self, next: RelayState) {
        if self.state != next {
            debug!("relay state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

async fn read_peer(peer: Option<&mut Peer>, buf: &mut [u8]) -> io::Result<usize> {
    match peer {
        Some(p) => p.read_chunk(buf).await,
        None => pending().await,
    }
}

/// Waits out [`ACCEPT_RETRY_DELAY`]; `false` when a stop arrived meanwhile.
async fn pause_after_accept_error(shutdown: &mut Shutdown) -> bool {
    shutdown.sleep(ACCEPT_RETRY_DELAY).await
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::serial::SerialError;
    use crate::infrastructure::shutdown;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::UnixStream;
    use uuid::Uuid;

    /// Hands out pre-made in-memory devices, then fails.
    struct ScriptedOpener {
        devices: VecDeque<DuplexStream>,
        reopenable: bool,
        opens: usize,
    }

    impl DeviceOpener for ScriptedOpener {
        type Device = DuplexStream;

        fn open(&mut self) -> Result<DuplexStream, SerialError> {
            self.opens += 1;
            self.devices
                .pop_front()
                .ok_or_else(|| SerialError::Exhausted("scripted".into()))
        }

        fn reopenable(&self) -> bool {
            self.reopenable
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    struct Echo;

    impl LocalCommandHandler for Echo {
        fn handle(&mut self, command: &str) -> Option<String> {
            Some(format!("local {command}\n"))
        }
    }

    fn config(framing: FramingMode) -> AgentConfig {
        AgentConfig {
            framing,
            reopen_delay: Duration::from_millis(20),
            ..AgentConfig::default()
        }
    }

    fn temp_socket() -> PathBuf {
        std::env::temp_dir().join(format!("sio_agent_relay_{}.sock", Uuid::new_v4()))
    }

    async fn read_n(stream: &mut (impl AsyncReadExt + Unpin), n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("timed out")
            .expect("read");
        buf
    }

    #[tokio::test]
    async fn test_line_relay_both_directions() {
        // Arrange
        let path = temp_socket();
        let (agent_side, mut device) = duplex(1024);
        let opener = ScriptedOpener {
            devices: VecDeque::from([agent_side]),
            reopenable: true,
            opens: 0,
        };
        let mut relay = Relay::new(&config(FramingMode::Line), opener, Echo);
        let listener = Listener::listen_unix(&path).unwrap();
        let (trigger, shutdown) = shutdown::channel();
        let task = tokio::spawn(async move { relay.run(listener, shutdown).await });

        let mut client = UnixStream::connect(&path).await.unwrap();

        // Act: peer → serial
        client.write_all(b"hello\n").await.unwrap();
        let to_device = read_n(&mut device, 6).await;

        // Act: serial → peer
        device.write_all(b"world\r").await.unwrap();
        let to_client = read_n(&mut client, 6).await;

        // Assert
        assert_eq!(to_device, b"hello\r");
        assert_eq!(to_client, b"world\n");

        trigger.trigger();
        task.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_ping_and_local_command_stay_local() {
        // Arrange
        let path = temp_socket();
        let (agent_side, mut device) = duplex(1024);
        let opener = ScriptedOpener {
            devices: VecDeque::from([agent_side]),
            reopenable: true,
            opens: 0,
        };
        let mut relay = Relay::new(&config(FramingMode::Line), opener, Echo);
        let listener = Listener::listen_unix(&path).unwrap();
        let (trigger, shutdown) = shutdown::channel();
        let task = tokio::spawn(async move { relay.run(listener, shutdown).await });
        let mut client = UnixStream::connect(&path).await.unwrap();

        // Act
        client.write_all(b"ping\n*status\nafter\n").await.unwrap();
        let pong = read_n(&mut client, 6).await;
        let local = read_n(&mut client, 14).await;
        let to_device = read_n(&mut device, 6).await;

        // Assert: only the data line reached the device
        assert_eq!(pong, b"pong!\n");
        assert_eq!(local, b"local *status\n");
        assert_eq!(to_device, b"after\r");

        trigger.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_raw_mode_passes_bytes_verbatim() {
        // Arrange
        let path = temp_socket();
        let (agent_side, mut device) = duplex(1024);
        let opener = ScriptedOpener {
            devices: VecDeque::from([agent_side]),
            reopenable: true,
            opens: 0,
        };
        let mut relay = Relay::new(&config(FramingMode::Raw), opener, Echo);
        let listener = Listener::listen_unix(&path).unwrap();
        let (trigger, shutdown) = shutdown::channel();
        let task = tokio::spawn(async move { relay.run(listener, shutdown).await });
        let mut client = UnixStream::connect(&path).await.unwrap();

        // Act
        client.write_all(b"ping").await.unwrap();
        let to_device = read_n(&mut device, 4).await;
        device.write_all(b"\x00\x01*x").await.unwrap();
        let to_client = read_n(&mut client, 4).await;

        // Assert
        assert_eq!(to_device, b"ping");
        assert_eq!(to_client, b"\x00\x01*x");

        trigger.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_non_reopenable_source_stops_on_eof() {
        // Arrange
        let path = temp_socket();
        let (agent_side, device) = duplex(64);
        let opener = ScriptedOpener {
            devices: VecDeque::from([agent_side]),
            reopenable: false,
            opens: 0,
        };
        let mut relay = Relay::new(&config(FramingMode::Line), opener, Echo);
        let listener = Listener::listen_unix(&path).unwrap();
        let (_trigger, shutdown) = shutdown::channel();

        // Act: closing the far end is end of stream
        drop(device);
        let result = tokio::time::timeout(Duration::from_secs(5), relay.run(listener, shutdown)).await;

        // Assert
        assert!(result.expect("relay should stop by itself").is_ok());
        assert_eq!(relay.state(), RelayState::SerialDown);
        assert_eq!(relay.opener.opens, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_failed_open_retries_until_shutdown() {
        // Arrange: no devices at all
        let path = temp_socket();
        let opener = ScriptedOpener {
            devices: VecDeque::new(),
            reopenable: true,
            opens: 0,
        };
        let mut relay = Relay::new(&config(FramingMode::Line), opener, Echo);
        let listener = Listener::listen_unix(&path).unwrap();
        let (trigger, shutdown) = shutdown::channel();

        // Act
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.trigger();
        });
        relay.run(listener, shutdown).await.unwrap();
        stopper.await.unwrap();

        // Assert: retried at the fixed delay, more than once
        assert!(relay.opener.opens >= 2, "opens = {}", relay.opener.opens);
    }

    #[tokio::test]
    async fn test_serial_loss_closes_peer_and_reopens() {
        // Arrange: two devices, the first one will vanish
        let path = temp_socket();
        let (first, first_far) = duplex(64);
        let (second, mut second_far) = duplex(64);
        let opener = ScriptedOpener {
            devices: VecDeque::from([first, second]),
            reopenable: true,
            opens: 0,
        };
        let mut relay = Relay::new(&config(FramingMode::Line), opener, Echo);
        let listener = Listener::listen_unix(&path).unwrap();
        let (trigger, shutdown) = shutdown::channel();
        let task = tokio::spawn(async move { relay.run(listener, shutdown).await });
        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(b"ping\n").await.unwrap();
        read_n(&mut client, 6).await;

        // Act: the device disappears
        drop(first_far);

        // Assert: the peer is closed
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // Assert: a new client is served on the reopened device
        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(b"again\n").await.unwrap();
        assert_eq!(read_n(&mut second_far, 6).await, b"again\r");

        trigger.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_client_waits_until_first_leaves() {
        // Arrange
        let path = temp_socket();
        let (agent_side, mut device) = duplex(1024);
        let opener = ScriptedOpener {
            devices: VecDeque::from([agent_side]),
            reopenable: true,
            opens: 0,
        };
        let mut relay = Relay::new(&config(FramingMode::Line), opener, Echo);
        let listener = Listener::listen_unix(&path).unwrap();
        let (trigger, shutdown) = shutdown::channel();
        let task = tokio::spawn(async move { relay.run(listener, shutdown).await });

        let mut first = UnixStream::connect(&path).await.unwrap();
        first.write_all(b"ping\n").await.unwrap();
        read_n(&mut first, 6).await;
        let mut second = UnixStream::connect(&path).await.unwrap();

        // Act: serial output goes to the first client only
        device.write_all(b"one\r").await.unwrap();
        let got_first = read_n(&mut first, 4).await;
        drop(first);

        // Act: once the first leaves, the second is accepted
        second.write_all(b"two\n").await.unwrap();
        let to_device = read_n(&mut device, 4).await;

        // Assert
        assert_eq!(got_first, b"one\n");
        assert_eq!(to_device, b"two\r");

        trigger.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_pauses_before_next_attempt() {
        // Arrange
        let (_trigger, mut shutdown) = shutdown::channel();
        let started = tokio::time::Instant::now();

        // Act
        let keep_going = pause_after_accept_error(&mut shutdown).await;

        // Assert
        assert!(keep_going);
        assert!(started.elapsed() >= ACCEPT_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_pause_ends_on_stop() {
        // Arrange
        let (trigger, mut shutdown) = shutdown::channel();
        trigger.trigger();
        let started = tokio::time::Instant::now();

        // Act
        let keep_going = pause_after_accept_error(&mut shutdown).await;

        // Assert
        assert!(!keep_going);
        assert!(started.elapsed() < ACCEPT_RETRY_DELAY);
    }
}
