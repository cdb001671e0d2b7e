//! Grid Simulator
//!
//! A stand-in for the grid control server. It speaks the server side of the
//! protocol well enough to exercise the client: it answers heartbeats and
//! commands, keeps an uploaded grid configuration, serves it back in parts
//! and pushes periodic status reports.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};

use super::connection::{frame_halves, ConnectionError};
use crate::protocol::commands::{self, error, grid, server};
use crate::protocol::{
    decode_upload_part, download_parts, is_alive_frame, split, CommandHeader,
    ConfigLengthPayload, DeviceType, ErrorPayload, FrameHeader, GridElementConfig, Header,
    Message, PacketType, ProtocolResult, RespondHeader, ServerStatus, VersionInfo, WireSegment,
    MAX_FRAME_SIZE,
};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the simulator
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Simulator started
    Started { bind_addr: SocketAddr },
    /// Simulator stopped
    Stopped,
    /// A new client has connected
    ClientConnected { addr: SocketAddr, connection_id: u16 },
    /// A client has disconnected
    ClientDisconnected { addr: SocketAddr, reason: String },
    /// An upload completed
    GridReceived { elements: usize },
    /// The grid was started or stopped
    GridRunning { running: bool },
}

/// Simulator settings
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub bind_address: String,
    /// Port to listen on, 0 picks a free one
    pub port: u16,
    /// Interval of server status pushes, 0 disables them
    pub status_interval_ms: u64,
    /// Reply to ISALIVE frames
    pub answer_heartbeats: bool,
    /// Send configuration parts last to first
    pub reverse_config_parts: bool,
    pub max_frame_size: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            status_interval_ms: 0,
            answer_heartbeats: true,
            reverse_config_parts: false,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Default)]
struct GridState {
    elements: Vec<GridElementConfig>,
    upload: Vec<GridElementConfig>,
    next_part: u16,
    version: VersionInfo,
    loaded: bool,
    started: bool,
}

impl GridState {
    fn status(&self, used_connections: usize) -> ServerStatus {
        let mut status = 0;
        if self.loaded {
            status |= server::status::GRID_LOADED;
        }
        if self.started {
            status |= server::status::GRID_STARTED;
        }

        ServerStatus {
            used_connections: used_connections as u16,
            status,
            server_load: 0,
            connected_devices: self
                .elements
                .iter()
                .filter(|e| e.device_type().is_some())
                .count() as u16,
            file_version: self.version.version as u16,
        }
    }
}

struct Inner {
    config: SimulatorConfig,
    grid: RwLock<GridState>,
    clients: RwLock<HashMap<SocketAddr, mpsc::Sender<Message>>>,
    next_connection_id: AtomicU16,
    event_tx: mpsc::Sender<ServerEvent>,
}

impl Inner {
    fn emit(&self, event: ServerEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!("Simulator event dropped: {}", e);
        }
    }
}

/// Grid Simulator
pub struct GridSimulator {
    inner: Arc<Inner>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl GridSimulator {
    /// Create a new simulator
    pub fn new(config: SimulatorConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            inner: Arc::new(Inner {
                config,
                grid: RwLock::new(GridState::default()),
                clients: RwLock::new(HashMap::new()),
                next_connection_id: AtomicU16::new(1),
                event_tx,
            }),
            event_rx: Some(event_rx),
            shutdown_tx: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Start listening. Returns the bound address.
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        if self.shutdown_tx.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let bind_addr = format!("{}:{}", self.inner.config.bind_address, self.inner.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Simulator listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        self.inner.emit(ServerEvent::Started {
            bind_addr: local_addr,
        });

        tokio::spawn(accept_loop(self.inner.clone(), listener, shutdown_rx));
        Ok(local_addr)
    }

    /// Stop the simulator and drop all clients
    pub async fn stop(&mut self) -> ServerResult<()> {
        let tx = self.shutdown_tx.take().ok_or(ServerError::NotRunning)?;
        let _ = tx.send(true);
        Ok(())
    }

    /// Check if the simulator is running
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Send a frame to every connected client
    pub async fn broadcast(&self, message: Message) {
        let clients = self.inner.clients.read().await;
        for tx in clients.values() {
            let _ = tx.send(message.clone()).await;
        }
    }

    /// Number of connected clients
    pub async fn client_count(&self) -> usize {
        self.inner.clients.read().await.len()
    }

    /// Configuration received by the last complete upload
    pub async fn elements(&self) -> Vec<GridElementConfig> {
        self.inner.grid.read().await.elements.clone()
    }

    pub async fn grid_loaded(&self) -> bool {
        self.inner.grid.read().await.loaded
    }

    pub async fn grid_started(&self) -> bool {
        self.inner.grid.read().await.started
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::info!("New connection from {}", addr);

                        let inner = inner.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, addr, inner, shutdown_rx).await {
                                tracing::error!("Client handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("Simulator shutdown requested");
                break;
            }
        }
    }

    inner.emit(ServerEvent::Stopped);
}

/// Serve one client connection
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    inner: Arc<Inner>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> ServerResult<()> {
    let connection_id = inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
    let (mut reader, mut writer, _stats) = frame_halves(stream);

    let (push_tx, mut push_rx) = mpsc::channel::<Message>(256);
    inner.clients.write().await.insert(addr, push_tx);
    inner.emit(ServerEvent::ClientConnected {
        addr,
        connection_id,
    });

    let status_interval = inner.config.status_interval_ms;
    let mut status_timer = tokio::time::interval(Duration::from_millis(status_interval.max(1)));

    let disconnect_reason = loop {
        tokio::select! {
            result = reader.recv_frame() => {
                match result {
                    Ok(Some(frame)) => {
                        let replies = match answer(&inner, &frame, connection_id).await {
                            Ok(replies) => replies,
                            Err(e) => {
                                tracing::warn!("Cannot answer frame from {}: {}", addr, e);
                                error_frame(error::UNSUPPORTED, connection_id).unwrap_or_default()
                            }
                        };
                        let mut failed = None;
                        for reply in replies {
                            if let Err(e) = writer.send(&reply).await {
                                failed = Some(format!("Send error: {}", e));
                                break;
                            }
                        }
                        if let Some(reason) = failed {
                            break reason;
                        }
                    }
                    Ok(None) => break "Connection closed".to_string(),
                    Err(e) => break format!("Error: {}", e),
                }
            }

            Some(message) = push_rx.recv() => {
                let sent = match message.encode() {
                    Ok(frame) => writer.send(&frame).await,
                    Err(e) => {
                        tracing::warn!("Cannot encode push: {}", e);
                        Ok(())
                    }
                };
                if let Err(e) = sent {
                    break format!("Send error: {}", e);
                }
            }

            _ = status_timer.tick(), if status_interval > 0 => {
                let used = inner.clients.read().await.len();
                let status = inner.grid.read().await.status(used);
                let message = Message::ServerStatus {
                    header: stamped(
                        RespondHeader::new(DeviceType::Server, 0, server::result::STATUS_DATA, 0),
                        connection_id,
                    ),
                    status,
                };
                let sent = match message.encode() {
                    Ok(frame) => writer.send(&frame).await,
                    Err(e) => Err(ConnectionError::from(e)),
                };
                if let Err(e) = sent {
                    break format!("Send error: {}", e);
                }
            }

            _ = shutdown_rx.changed() => break "Simulator shutting down".to_string(),
        }
    };

    inner.clients.write().await.remove(&addr);
    let _ = writer.shutdown().await;

    tracing::info!("Client {} disconnected: {}", addr, disconnect_reason);
    inner.emit(ServerEvent::ClientDisconnected {
        addr,
        reason: disconnect_reason,
    });

    Ok(())
}

fn stamped(mut header: RespondHeader, connection_id: u16) -> RespondHeader {
    header.base_mut().connection_id = connection_id;
    header
}

fn reply(
    device_type: DeviceType,
    device_id: u16,
    result: u32,
    command_id: u32,
    connection_id: u16,
) -> ProtocolResult<Vec<BytesMut>> {
    let header = stamped(
        RespondHeader::new(device_type, device_id, result, command_id),
        connection_id,
    );
    Ok(vec![Message::Respond(header).encode()?])
}

fn error_frame(error: u32, connection_id: u16) -> ProtocolResult<Vec<BytesMut>> {
    let mut header = Header::new(PacketType::Error, DeviceType::None, 0);
    header.connection_id = connection_id;
    let message = Message::Error {
        header,
        payload: ErrorPayload { error, rsvd: 0 },
    };
    Ok(vec![message.encode()?])
}

/// Frames to send back for one received frame
async fn answer(inner: &Inner, frame: &[u8], connection_id: u16) -> ProtocolResult<Vec<BytesMut>> {
    let (header, _) = Header::decode(frame, 0)?;

    match header.packet_type {
        PacketType::IsAlive if inner.config.answer_heartbeats => Ok(vec![is_alive_frame()?]),
        PacketType::IsAlive => Ok(Vec::new()),
        PacketType::Command => answer_command(inner, frame, connection_id).await,
        other => {
            tracing::warn!("Unexpected {:?} frame from client", other);
            error_frame(error::UNSUPPORTED, connection_id)
        }
    }
}

async fn answer_command(
    inner: &Inner,
    frame: &[u8],
    connection_id: u16,
) -> ProtocolResult<Vec<BytesMut>> {
    let (command, _) = CommandHeader::decode(frame, 0)?;
    let tags = command.tags();
    let device_id = command.header.device_id;
    let command_id = command.command_id;
    tracing::debug!("Command {:#06x} for {:?} {}", tags.code, tags.device_type, device_id);

    match tags.device_type {
        DeviceType::Server => {
            let running = match tags.code {
                server::START_GRID => true,
                server::STOP_GRID => false,
                _ => {
                    return reply(
                        DeviceType::Server,
                        0,
                        server::result::UNKNOWN_COMMAND,
                        command_id,
                        connection_id,
                    )
                }
            };
            inner.grid.write().await.started = running;
            inner.emit(ServerEvent::GridRunning { running });
            reply(DeviceType::Server, 0, server::result::SUCCESS, command_id, connection_id)
        }
        DeviceType::Grid => answer_grid(inner, frame, tags.code, command_id, connection_id).await,
        DeviceType::None => error_frame(error::UNSUPPORTED, connection_id),
        device_type => reply(
            device_type,
            device_id,
            commands::DEVICE_SUCCESS,
            command_id,
            connection_id,
        ),
    }
}

async fn answer_grid(
    inner: &Inner,
    frame: &[u8],
    code: u32,
    command_id: u32,
    connection_id: u16,
) -> ProtocolResult<Vec<BytesMut>> {
    let grid_reply = |result| reply(DeviceType::Grid, 0, result, command_id, connection_id);

    match code {
        grid::CLEAR_ALL => {
            let mut state = inner.grid.write().await;
            state.elements.clear();
            state.upload.clear();
            state.next_part = 1;
            state.loaded = false;
            state.started = false;
            grid_reply(grid::result::SUCCESS)
        }
        grid::LOAD_GRID_CONFIG => {
            let (header, elements) = decode_upload_part(frame)?;
            let transfer = header.transfer;
            let mut state = inner.grid.write().await;

            if transfer.part == 1 {
                state.upload.clear();
                state.next_part = 1;
            }
            if transfer.part != state.next_part {
                tracing::warn!(
                    "Expected part {}, received {} of {}",
                    state.next_part,
                    transfer.part,
                    transfer.total_parts
                );
                return grid_reply(grid::result::FAILURE);
            }

            state.upload.extend(elements);
            state.next_part += 1;
            if transfer.part == transfer.total_parts {
                let upload = std::mem::take(&mut state.upload);
                state.elements = upload;
                state.version = transfer.version;
                inner.emit(ServerEvent::GridReceived {
                    elements: state.elements.len(),
                });
            }
            grid_reply(grid::result::SUCCESS)
        }
        grid::SETUP_GRID => {
            inner.grid.write().await.loaded = true;
            grid_reply(grid::result::SUCCESS)
        }
        grid::GET_CONFIG_LENGTH => {
            let state = inner.grid.read().await;
            let num_packets = split(&state.elements, inner.config.max_frame_size)?.len() as u32;
            let message = Message::ConfigLength {
                header: stamped(
                    RespondHeader::new(
                        DeviceType::Grid,
                        0,
                        grid::result::GET_CONFIG_LENGTH,
                        command_id,
                    ),
                    connection_id,
                ),
                payload: ConfigLengthPayload { num_packets },
            };
            Ok(vec![message.encode()?])
        }
        grid::GET_GRID_CONFIG => {
            let state = inner.grid.read().await;
            let mut parts = download_parts(
                &state.elements,
                state.version,
                command_id,
                inner.config.max_frame_size,
            )?;
            if inner.config.reverse_config_parts {
                parts.reverse();
            }

            parts
                .into_iter()
                .map(|mut part| {
                    part.header.respond = stamped(part.header.respond, connection_id);
                    Message::ConfigPart(part).encode()
                })
                .collect()
        }
        _ => grid_reply(grid::result::UNKNOWN_COMMAND),
    }
}
