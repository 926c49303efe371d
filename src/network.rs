use crate::can_bus::{Received, VirtualCanBus};
use crate::errors::{BusError, SetupError};
use crate::stop::StopSignal;
use crate::types::CanFrame;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Network message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NetMessage {
    /// CAN frame message
    CanFrame(CanFrame),
    /// Client registration
    Register { client_name: String },
    /// Registration accepted
    Ack,
    /// Error message
    Error(String),
}

fn encode_line(msg: &NetMessage) -> Result<Vec<u8>, BusError> {
    let mut json = serde_json::to_vec(msg).map_err(|e| BusError::Transport(e.to_string()))?;
    json.push(b'\n');
    Ok(json)
}

/// Network client for communicating with the bus server
pub struct BusClient {
    reader: BusReader,
    writer: BusWriter,
    client_name: String,
}

impl BusClient {
    /// Connect to the bus server and register under `client_name`
    pub async fn connect(addr: &str, client_name: impl Into<String>) -> Result<Self, SetupError> {
        let client_name = client_name.into();
        let connect_err = |source: io::Error| SetupError::Connect {
            addr: addr.to_string(),
            source,
        };

        let stream = TcpStream::connect(addr).await.map_err(connect_err)?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BusReader::new(read_half),
            writer: BusWriter { writer: write_half },
            client_name: client_name.clone(),
        };

        client
            .writer
            .send_message(&NetMessage::Register { client_name })
            .await
            .map_err(|e| connect_err(io::Error::other(e.to_string())))?;

        let reply = tokio::time::timeout(REGISTER_TIMEOUT, client.reader.receive_message())
            .await
            .map_err(|_| {
                connect_err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no registration acknowledgement",
                ))
            })?;
        match reply {
            Ok(NetMessage::Ack) => Ok(client),
            Ok(NetMessage::Error(reason)) => Err(connect_err(io::Error::other(reason))),
            Ok(other) => Err(connect_err(io::Error::other(format!(
                "unexpected reply to registration: {:?}",
                other
            )))),
            Err(e) => Err(connect_err(io::Error::other(e.to_string()))),
        }
    }

    /// Send a CAN frame to the bus
    pub async fn send_frame(&mut self, frame: CanFrame) -> Result<(), BusError> {
        self.writer.send_frame(frame).await
    }

    /// Receive a message from the server
    pub async fn receive_message(&mut self) -> Result<NetMessage, BusError> {
        self.reader.receive_message().await
    }

    /// Split the client into read and write halves
    pub fn split(self) -> (BusReader, BusWriter) {
        (self.reader, self.writer)
    }

    /// Get the client name
    pub fn client_name(&self) -> &str {
        &self.client_name
    }
}

/// Read half of the bus client
pub struct BusReader {
    reader: BufReader<OwnedReadHalf>,
    pending: Vec<u8>,
}

impl BusReader {
    fn new(read_half: OwnedReadHalf) -> Self {
        Self {
            reader: BufReader::new(read_half),
            pending: Vec::new(),
        }
    }

    /// Receive a message from the server.
    ///
    /// Cancel-safe: a partially read line stays buffered for the next call.
    /// A broken connection reads as `BusError::Closed`; an unparseable line
    /// is a `Transport` error and the next call reads the following line.
    pub async fn receive_message(&mut self) -> Result<NetMessage, BusError> {
        let n = match self.reader.read_until(b'\n', &mut self.pending).await {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "bus connection read failed");
                return Err(BusError::Closed);
            }
        };
        if n == 0 && self.pending.is_empty() {
            return Err(BusError::Closed);
        }
        let line = std::mem::take(&mut self.pending);
        serde_json::from_slice(&line).map_err(|e| BusError::Transport(e.to_string()))
    }
}

/// Write half of the bus client
pub struct BusWriter {
    writer: OwnedWriteHalf,
}

impl BusWriter {
    /// Send a message to the server
    pub async fn send_message(&mut self, msg: &NetMessage) -> Result<(), BusError> {
        let line = encode_line(msg)?;
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    /// Send a CAN frame to the bus
    pub async fn send_frame(&mut self, frame: CanFrame) -> Result<(), BusError> {
        self.send_message(&NetMessage::CanFrame(frame)).await
    }
}

/// TCP broadcast bus: every frame a client sends goes to all other clients
pub struct BusServer {
    listener: TcpListener,
    tx: broadcast::Sender<(u64, CanFrame)>,
    next_client_id: Arc<AtomicU64>,
}

impl BusServer {
    pub async fn bind(addr: &str, buffer_size: usize) -> Result<Self, SetupError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SetupError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let (tx, _rx) = broadcast::channel(buffer_size.max(1));
        Ok(Self {
            listener,
            tx,
            next_client_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SetupError> {
        self.listener
            .local_addr()
            .map_err(|e| SetupError::BusUnavailable(e.to_string()))
    }

    /// Accept clients until `stop` trips
    pub async fn run(self, stop: StopSignal) {
        while !stop.is_stopped() {
            let accepted = tokio::time::timeout(POLL_INTERVAL, self.listener.accept()).await;
            let (socket, addr) = match accepted {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
                Err(_) => continue,
            };
            let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
            tracing::info!(%addr, client_id, "new connection");

            let tx = self.tx.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(socket, client_id, tx, stop).await {
                    tracing::warn!(client_id, error = %e, "client error");
                }
            });
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    client_id: u64,
    tx: broadcast::Sender<(u64, CanFrame)>,
    stop: StopSignal,
) -> Result<(), BusError> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BusReader::new(read_half);

    // Wait for client registration
    let client_name = match reader.receive_message().await? {
        NetMessage::Register { client_name } => client_name,
        _ => {
            let reply = encode_line(&NetMessage::Error(
                "First message must be Register".to_string(),
            ))?;
            let _ = write_half.write_all(&reply).await;
            return Err(BusError::Transport("first message must be Register".into()));
        }
    };
    // Subscribe before acknowledging so frames sent after the Ack reach this client
    let mut rx = tx.subscribe();
    let ack = encode_line(&NetMessage::Ack)?;
    write_half
        .write_all(&ack)
        .await
        .map_err(|e| BusError::Transport(e.to_string()))?;
    tracing::info!(client = %client_name, client_id, "registered");

    let forward_name = client_name.clone();
    let forward_stop = stop.clone();
    let forwarder = tokio::spawn(async move {
        let mut writer = BusWriter { writer: write_half };
        while !forward_stop.is_stopped() {
            let (origin, frame) =
                match tokio::time::timeout(POLL_INTERVAL, rx.recv()).await {
                    Ok(Ok(message)) => message,
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        tracing::warn!(
                            client = %forward_name,
                            skipped,
                            "client lagged (recovering...)"
                        );
                        continue;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => break,
                    Err(_) => continue,
                };
            if origin == client_id {
                continue;
            }
            if writer.send_frame(frame).await.is_err() {
                break;
            }
        }
    });

    let mut frame_count = 0u64;
    while !stop.is_stopped() {
        let msg = match tokio::time::timeout(POLL_INTERVAL, reader.receive_message()).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(BusError::Closed)) => break,
            Ok(Err(e)) => {
                tracing::warn!(client = %client_name, error = %e, "dropping unreadable message");
                continue;
            }
            Err(_) => continue,
        };
        if let NetMessage::CanFrame(frame) = msg {
            if !frame.is_valid() {
                tracing::warn!(client = %client_name, id = %frame.id, "invalid frame dropped");
                continue;
            }
            frame_count += 1;
            tracing::debug!(client = %client_name, id = %frame.id, "frame");
            // No receivers just means nobody else is connected yet
            let _ = tx.send((client_id, frame));
        }
    }

    forwarder.abort();
    tracing::info!(client = %client_name, frame_count, "disconnected");
    Ok(())
}

/// Bridge between a process-local bus and a remote bus server
pub struct RemoteLink {
    uplink: JoinHandle<()>,
    downlink: JoinHandle<()>,
}

impl RemoteLink {
    /// Wait for both directions to finish (after `stop` trips or the server goes away)
    pub async fn join(self) {
        let _ = self.uplink.await;
        let _ = self.downlink.await;
    }
}

/// Attach `bus` to the bus server at `addr`.
///
/// Local frames are forwarded to the server; frames from other server
/// clients are republished locally, restamped with the local bus clock.
/// Frames that came in through the bridge are never sent back out.
pub async fn attach_remote(
    bus: &VirtualCanBus,
    addr: &str,
    client_name: &str,
    stop: StopSignal,
) -> Result<RemoteLink, SetupError> {
    let client = BusClient::connect(addr, client_name).await?;
    let (mut reader, mut writer) = client.split();

    let bridge = bus.attach_sender(format!("{}-bridge", client_name))?;
    let mut local = bus.subscribe_excluding(&bridge)?;

    let up_stop = stop.clone();
    let uplink = tokio::spawn(async move {
        while !up_stop.is_stopped() {
            match local.recv_timeout(POLL_INTERVAL).await {
                Received::Frame(frame) => {
                    if let Err(e) = writer.send_frame(frame).await {
                        tracing::warn!(error = %e, "uplink send failed");
                        if e == BusError::Closed {
                            break;
                        }
                    }
                }
                Received::Timeout => {}
                Received::Closed => break,
            }
        }
    });

    let downlink = tokio::spawn(async move {
        while !stop.is_stopped() {
            match tokio::time::timeout(POLL_INTERVAL, reader.receive_message()).await {
                Ok(Ok(NetMessage::CanFrame(frame))) => {
                    let frame = frame.restamped(bridge.now());
                    if let Err(e) = bridge.publish(frame) {
                        tracing::warn!(error = %e, "downlink publish failed");
                        if e == BusError::Closed {
                            break;
                        }
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(BusError::Closed)) => {
                    // the shared bus is gone; end the whole run
                    tracing::warn!("bus server closed the connection");
                    stop.stop();
                    break;
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "downlink receive failed"),
                Err(_) => {}
            }
        }
    });

    Ok(RemoteLink { uplink, downlink })
}
