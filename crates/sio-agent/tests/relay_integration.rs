//! End-to-end tests for the relay loop.
//!
//! Each test runs a full [`Relay`] over a real listening socket, with an
//! in-memory duplex stream standing in for the serial device.  The test
//! holds the far end of that stream and plays the part of the device.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpStream, UnixStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

use sio_agent::domain::AgentConfig;
use sio_agent::infrastructure::endpoint::PEER_LINE_LIMIT;
use sio_agent::infrastructure::shutdown::{self, ShutdownTrigger};
use sio_agent::infrastructure::{DeviceOpener, Listener, Relay, SerialError};
use sio_core::{FramingMode, LocalCommandHandler};

// ── Harness ───────────────────────────────────────────────────────────────────

const TIMEOUT: Duration = Duration::from_secs(5);

struct SimulatedDevices {
    queue: VecDeque<DuplexStream>,
}

impl DeviceOpener for SimulatedDevices {
    type Device = DuplexStream;

    fn open(&mut self) -> Result<DuplexStream, SerialError> {
        self.queue
            .pop_front()
            .ok_or_else(|| SerialError::Exhausted("simulated".into()))
    }

    fn describe(&self) -> String {
        "simulated".into()
    }
}

/// Answers `*status` with `OK`, stays silent for `*quiet`.
struct StubHandler;

impl LocalCommandHandler for StubHandler {
    fn handle(&mut self, command: &str) -> Option<String> {
        match command {
            "*status" => Some("OK\n".into()),
            _ => None,
        }
    }
}

struct Running {
    trigger: ShutdownTrigger,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn stop(self) {
        self.trigger.trigger();
        tokio::time::timeout(TIMEOUT, self.task)
            .await
            .expect("relay did not stop")
            .expect("relay panicked")
            .expect("relay failed");
    }
}

fn socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("sio_agent_it_{}.sock", Uuid::new_v4()))
}

fn start(listener: Listener, devices: Vec<DuplexStream>, framing: FramingMode) -> Running {
    let config = AgentConfig {
        framing,
        reopen_delay: Duration::from_millis(20),
        ..AgentConfig::default()
    };
    let opener = SimulatedDevices {
        queue: devices.into(),
    };
    let mut relay = Relay::new(&config, opener, StubHandler);
    let (trigger, shutdown) = shutdown::channel();
    let task = tokio::spawn(async move { relay.run(listener, shutdown).await });
    Running { trigger, task }
}

async fn expect_bytes(stream: &mut (impl AsyncReadExt + Unpin), expected: &[u8]) {
    let mut buf = vec![0u8; expected.len()];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for bytes")
        .expect("read failed");
    assert_eq!(
        String::from_utf8_lossy(&buf),
        String::from_utf8_lossy(expected)
    );
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_hello_world_round_trip_over_unix_socket() {
    // Arrange
    let path = socket_path();
    let (agent_side, mut device) = duplex(4096);
    let running = start(Listener::listen_unix(&path).unwrap(), vec![agent_side], FramingMode::Line);
    let mut client = UnixStream::connect(&path).await.unwrap();

    // Act / Assert: client → device, payload plus carriage return
    client.write_all(b"hello\r").await.unwrap();
    expect_bytes(&mut device, b"hello\r").await;

    // Act / Assert: device → client, terminator normalised to newline
    device.write_all(b"world\r").await.unwrap();
    expect_bytes(&mut client, b"world\n").await;

    running.stop().await;
}

#[tokio::test]
async fn test_ping_is_answered_and_never_reaches_device() {
    // Arrange
    let path = socket_path();
    let (agent_side, mut device) = duplex(4096);
    let running = start(Listener::listen_unix(&path).unwrap(), vec![agent_side], FramingMode::Line);
    let mut client = UnixStream::connect(&path).await.unwrap();

    // Act
    client.write_all(b"ping\n").await.unwrap();
    expect_bytes(&mut client, b"pong!\n").await;
    client.write_all(b"marker\n").await.unwrap();

    // Assert: the first thing the device sees is the marker
    expect_bytes(&mut device, b"marker\r").await;

    running.stop().await;
}

#[tokio::test]
async fn test_local_command_reply_goes_to_client_only() {
    // Arrange
    let path = socket_path();
    let (agent_side, mut device) = duplex(4096);
    let running = start(Listener::listen_unix(&path).unwrap(), vec![agent_side], FramingMode::Line);
    let mut client = UnixStream::connect(&path).await.unwrap();

    // Act
    client.write_all(b"*status\n*quiet\nmarker\n").await.unwrap();

    // Assert
    expect_bytes(&mut client, b"OK\n").await;
    expect_bytes(&mut device, b"marker\r").await;

    running.stop().await;
}

#[tokio::test]
async fn test_blank_lines_and_crlf_are_collapsed() {
    let path = socket_path();
    let (agent_side, mut device) = duplex(4096);
    let running = start(Listener::listen_unix(&path).unwrap(), vec![agent_side], FramingMode::Line);
    let mut client = UnixStream::connect(&path).await.unwrap();
    client.write_all(b"ping\n").await.unwrap();
    expect_bytes(&mut client, b"pong!\n").await;

    device.write_all(b"\r\n\r\nfirst\r\nsecond\n\n").await.unwrap();

    expect_bytes(&mut client, b"first\nsecond\n").await;
    running.stop().await;
}

#[tokio::test]
async fn test_serial_output_without_client_is_discarded() {
    // Arrange
    let path = socket_path();
    let (agent_side, mut device) = duplex(4096);
    let running = start(Listener::listen_unix(&path).unwrap(), vec![agent_side], FramingMode::Line);

    // Act: output before anyone connects, then give the relay time to eat it
    device.write_all(b"early\r").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut client = UnixStream::connect(&path).await.unwrap();
    client.write_all(b"ping\n").await.unwrap();
    expect_bytes(&mut client, b"pong!\n").await;
    device.write_all(b"late\r").await.unwrap();

    // Assert
    expect_bytes(&mut client, b"late\n").await;
    running.stop().await;
}

#[tokio::test]
async fn test_client_can_reconnect_after_disconnect() {
    // Arrange
    let path = socket_path();
    let (agent_side, mut device) = duplex(4096);
    let running = start(Listener::listen_unix(&path).unwrap(), vec![agent_side], FramingMode::Line);

    // Act: first client leaves halfway through a line
    let mut first = UnixStream::connect(&path).await.unwrap();
    first.write_all(b"ping\npartial").await.unwrap();
    expect_bytes(&mut first, b"pong!\n").await;
    drop(first);

    let mut second = UnixStream::connect(&path).await.unwrap();
    second.write_all(b"fresh\n").await.unwrap();

    // Assert: the partial line did not leak into the new session
    expect_bytes(&mut device, b"fresh\r").await;
    running.stop().await;
}

#[tokio::test]
async fn test_serial_eof_disconnects_client_and_device_is_reopened() {
    // Arrange
    let path = socket_path();
    let (first, first_far) = duplex(4096);
    let (second, mut second_far) = duplex(4096);
    let running = start(Listener::listen_unix(&path).unwrap(), vec![first, second], FramingMode::Line);
    let mut client = UnixStream::connect(&path).await.unwrap();
    client.write_all(b"ping\n").await.unwrap();
    expect_bytes(&mut client, b"pong!\n").await;

    // Act
    drop(first_far);

    // Assert: client sees end of stream
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    // Assert: a new client talks to the reopened device
    let mut client = UnixStream::connect(&path).await.unwrap();
    client.write_all(b"again\n").await.unwrap();
    expect_bytes(&mut second_far, b"again\r").await;

    running.stop().await;
}

#[tokio::test]
async fn test_shutdown_removes_unix_socket_file() {
    let path = socket_path();
    let (agent_side, _device) = duplex(64);
    let running = start(Listener::listen_unix(&path).unwrap(), vec![agent_side], FramingMode::Line);
    assert!(path.exists());

    running.stop().await;

    assert!(!path.exists());
}

#[tokio::test]
async fn test_stale_socket_file_is_replaced() {
    // Arrange: leftover from a crashed run
    let path = socket_path();
    std::fs::write(&path, b"").unwrap();
    let (agent_side, mut device) = duplex(4096);

    // Act
    let running = start(Listener::listen_unix(&path).unwrap(), vec![agent_side], FramingMode::Line);
    let mut client = UnixStream::connect(&path).await.unwrap();
    client.write_all(b"ok\n").await.unwrap();

    // Assert
    expect_bytes(&mut device, b"ok\r").await;
    running.stop().await;
}

#[tokio::test]
async fn test_tcp_endpoint_relays_lines() {
    // Arrange
    let listener = Listener::listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_tcp_addr().unwrap();
    let (agent_side, mut device) = duplex(4096);
    let running = start(listener, vec![agent_side], FramingMode::Line);
    let mut client = TcpStream::connect(addr).await.unwrap();

    // Act
    client.write_all(b"AT\r\n").await.unwrap();
    expect_bytes(&mut device, b"AT\r").await;
    device.write_all(b"OK\r\n").await.unwrap();

    // Assert
    expect_bytes(&mut client, b"OK\n").await;
    running.stop().await;
}

#[tokio::test]
async fn test_raw_mode_relays_chunks_unchanged() {
    let path = socket_path();
    let (agent_side, mut device) = duplex(4096);
    let running = start(Listener::listen_unix(&path).unwrap(), vec![agent_side], FramingMode::Raw);
    let mut client = UnixStream::connect(&path).await.unwrap();

    client.write_all(b"ping\n*status\n").await.unwrap();
    expect_bytes(&mut device, b"ping\n*status\n").await;
    device.write_all(b"\x02bin\x03").await.unwrap();
    expect_bytes(&mut client, b"\x02bin\x03").await;

    running.stop().await;
}

#[tokio::test]
async fn test_long_local_command_never_reaches_device() {
    // Arrange
    let path = socket_path();
    let (agent_side, mut device) = duplex(4096);
    let running = start(Listener::listen_unix(&path).unwrap(), vec![agent_side], FramingMode::Line);
    let mut client = UnixStream::connect(&path).await.unwrap();
    let mut command = vec![b'*'];
    command.extend(std::iter::repeat(b'x').take(299));
    command.push(b'\n');

    // Act
    client.write_all(&command).await.unwrap();
    client.write_all(b"marker\n").await.unwrap();

    // Assert: no fragment of the command precedes the marker
    expect_bytes(&mut device, b"marker\r").await;
    running.stop().await;
}

#[tokio::test]
async fn test_long_data_line_is_forwarded_whole() {
    // Arrange
    let path = socket_path();
    let (agent_side, mut device) = duplex(4096);
    let running = start(Listener::listen_unix(&path).unwrap(), vec![agent_side], FramingMode::Line);
    let mut client = UnixStream::connect(&path).await.unwrap();
    let payload: Vec<u8> = (0..300).map(|i| b'a' + (i % 26) as u8).collect();

    // Act
    client.write_all(&payload).await.unwrap();
    client.write_all(b"\n").await.unwrap();

    // Assert
    let mut expected = payload.clone();
    expected.push(b'\r');
    expect_bytes(&mut device, &expected).await;
    running.stop().await;
}

#[tokio::test]
async fn test_line_beyond_peer_limit_is_dropped_whole() {
    // Arrange
    let path = socket_path();
    let (agent_side, mut device) = duplex(4096);
    let running = start(Listener::listen_unix(&path).unwrap(), vec![agent_side], FramingMode::Line);
    let mut client = UnixStream::connect(&path).await.unwrap();
    let mut oversized = vec![b'*'];
    oversized.extend(std::iter::repeat(b'y').take(PEER_LINE_LIMIT + 100));
    oversized.push(b'\n');

    // Act
    client.write_all(&oversized).await.unwrap();
    client.write_all(b"marker\n").await.unwrap();

    // Assert: neither head nor tail of the oversized line was forwarded
    expect_bytes(&mut device, b"marker\r").await;
    running.stop().await;
}
