//! Grid Client
//!
//! Connects to a grid server, keeps the connection alive and exchanges
//! commands with it. Replies are matched to their requests through the
//! [`Correlator`], device telemetry goes to subscribers and everything else
//! the server pushes becomes a [`ClientEvent`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use super::connection::{
    frame_halves, ConnectionState, ConnectionStats, FrameReader, FrameWriter, StatsSnapshot,
};
use super::correlation::{Correlator, ReplySlot, ReplyStream};
use super::NetworkConfig;
use crate::protocol::commands::{grid, is_fault};
use crate::protocol::{
    encode_upload, is_alive_frame, reassemble, DeviceData, DeviceType, GridElementConfig, Message,
    ProtocolError, Request, ServerStatus,
};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    ConnectTimeout,

    #[error("No reply to command {command_id:#010x}")]
    Timeout { command_id: u32 },

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Command rejected with result {result:#06x}")]
    Rejected { result: u32 },

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Transfer incomplete: {received} of {expected} parts")]
    IncompleteTransfer { expected: usize, received: usize },

    #[error("Server holds no grid configuration")]
    EmptyConfiguration,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Successfully connected to server
    Connected { server_addr: SocketAddr },
    /// Disconnected from server
    Disconnected { reason: String },
    /// Periodic status report of the server
    ServerStatus(ServerStatus),
    /// The server reported an error frame
    ServerError { error: u32 },
}

/// Telemetry of one device as delivered to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct DevicePush {
    pub device_type: DeviceType,
    pub device_id: u16,
    /// Running number the server stamps on every push
    pub sequence: u32,
    pub data: DeviceData,
}

const EVENT_CAPACITY: usize = 256;
const SUBSCRIBER_CAPACITY: usize = 64;

type SubscriberMap = HashMap<(DeviceType, u16), Vec<mpsc::Sender<DevicePush>>>;

struct Shared {
    config: NetworkConfig,
    state: RwLock<ConnectionState>,
    /// Bumped on every connect so loops of an old connection cannot tear
    /// down a newer one
    session: AtomicU64,
    writer: Mutex<Option<FrameWriter<OwnedWriteHalf>>>,
    correlator: Correlator,
    subscribers: Mutex<SubscriberMap>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    stats: RwLock<Option<Arc<ConnectionStats>>>,
    event_tx: mpsc::Sender<ClientEvent>,
    traffic_seen: AtomicBool,
}

/// Grid Client
pub struct GridClient {
    shared: Arc<Shared>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl GridClient {
    /// Create a new client
    pub fn new(config: NetworkConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                session: AtomicU64::new(0),
                writer: Mutex::new(None),
                correlator: Correlator::new(),
                subscribers: Mutex::new(HashMap::new()),
                shutdown_tx: Mutex::new(None),
                stats: RwLock::new(None),
                event_tx,
                traffic_seen: AtomicBool::new(false),
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to a server by address
    pub async fn connect(&self, server_addr: SocketAddr) -> ClientResult<()> {
        {
            let mut state = self.shared.state.write().await;
            if *state != ConnectionState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        tracing::info!("Connecting to {}", server_addr);

        let stream = match tokio::time::timeout(
            self.shared.config.connect_timeout(),
            TcpStream::connect(server_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::ConnectTimeout);
            }
        };
        stream.set_nodelay(true)?;

        let (reader, writer, stats) = frame_halves(stream);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = {
            let mut slot = self.shared.writer.lock().await;
            *slot = Some(writer);
            self.shared.session.fetch_add(1, Ordering::SeqCst) + 1
        };
        *self.shared.stats.write().await = Some(stats);
        *self.shared.shutdown_tx.lock().await = Some(shutdown_tx);
        // Counts as traffic so the first heartbeat tick has a full interval of grace
        self.shared.traffic_seen.store(true, Ordering::SeqCst);
        *self.shared.state.write().await = ConnectionState::Connected;

        tracing::info!("Connected to {}", server_addr);
        self.shared.emit(ClientEvent::Connected { server_addr });

        tokio::spawn(receive_loop(
            self.shared.clone(),
            reader,
            shutdown_rx.clone(),
            session,
        ));
        tokio::spawn(heartbeat_loop(self.shared.clone(), shutdown_rx, session));

        Ok(())
    }

    /// Connect to a server by hostname
    pub async fn connect_hostname(&self, hostname: &str, port: u16) -> ClientResult<()> {
        let addr = super::resolve_host(hostname, port).await?;
        self.connect(addr).await
    }

    /// Disconnect from the server. Does nothing when already disconnected.
    pub async fn disconnect(&self) -> ClientResult<()> {
        let session = self.shared.session.load(Ordering::SeqCst);
        self.shared
            .teardown(session, "Client disconnecting".to_string())
            .await;
        Ok(())
    }

    /// Send a request and wait for the reply carrying its command id
    pub async fn send_request(&self, request: Request) -> ClientResult<Message> {
        if !self.is_connected().await {
            return Err(ClientError::NotConnected);
        }

        let slot = self.shared.correlator.register_new().await;
        let frame = match request.encode(slot.id()) {
            Ok(frame) => frame,
            Err(e) => {
                self.shared.correlator.unregister(slot.id()).await;
                return Err(e.into());
            }
        };

        tracing::debug!("Sending {:?} as command {:#010x}", request, slot.id());
        self.exchange(slot, &frame).await
    }

    /// Send a request and fail unless the server reports success
    pub async fn execute(&self, request: Request) -> ClientResult<Message> {
        let reply = self.send_request(request).await?;
        check_result(reply)
    }

    /// Send a configuration in parts under one command id. Each part is
    /// acknowledged before the next one goes out. Returns the number of parts.
    pub async fn send_bulk(&self, configs: &[GridElementConfig]) -> ClientResult<usize> {
        if !self.is_connected().await {
            return Err(ClientError::NotConnected);
        }

        // the id stays registered until the last part is answered
        let mut stream = self.shared.correlator.register_multiple_new().await;
        let command_id = stream.id();
        let result = self.send_parts(&mut stream, configs).await;
        self.shared.correlator.unregister(command_id).await;
        result
    }

    async fn send_parts(
        &self,
        stream: &mut ReplyStream,
        configs: &[GridElementConfig],
    ) -> ClientResult<usize> {
        let command_id = stream.id();
        let frames = encode_upload(
            configs,
            self.shared.config.version,
            command_id,
            self.shared.config.max_frame_size,
        )?;
        let total = frames.len();

        for (index, frame) in frames.iter().enumerate() {
            self.shared.send_frame(frame).await?;
            let reply = match stream.next(self.shared.config.request_timeout()).await {
                Some(reply) => check_result(reply)?,
                None if self.is_connected().await => {
                    return Err(ClientError::Timeout { command_id })
                }
                None => return Err(ClientError::ConnectionLost),
            };
            if reply.result() != Some(grid::result::SUCCESS) {
                return Err(ClientError::UnexpectedReply(format!(
                    "part {} of {} answered with {:?}",
                    index + 1,
                    total,
                    reply
                )));
            }
            tracing::debug!("Part {}/{} acknowledged", index + 1, total);
        }

        tracing::info!("Sent {} elements in {} parts", configs.len(), total);
        Ok(total)
    }

    /// Replace the server's grid with `configs` and set it up
    pub async fn upload_grid(&self, configs: &[GridElementConfig]) -> ClientResult<()> {
        self.execute(Request::ClearGridConfig).await?;
        self.send_bulk(configs).await?;
        self.execute(Request::SetupGrid).await?;
        Ok(())
    }

    /// Download the server's grid configuration
    pub async fn fetch_bulk(&self) -> ClientResult<Vec<GridElementConfig>> {
        let expected = match self.execute(Request::GetConfigLength).await? {
            Message::ConfigLength { payload, .. } => payload.num_packets as usize,
            other => return Err(ClientError::UnexpectedReply(format!("{:?}", other))),
        };
        if expected == 0 {
            return Err(ClientError::EmptyConfiguration);
        }

        let stream = self.shared.correlator.register_multiple_new().await;
        let command_id = stream.id();
        let frame = match Request::GetGridConfig.encode(command_id) {
            Ok(frame) => frame,
            Err(e) => {
                self.shared.correlator.unregister(command_id).await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.shared.send_frame(&frame).await {
            self.shared.correlator.unregister(command_id).await;
            return Err(e);
        }

        let replies = self
            .shared
            .correlator
            .await_replies(
                stream,
                expected,
                self.shared.config.transfer_timeout(),
                |reply| !matches!(reply, Message::ConfigPart(_)),
            )
            .await;

        let mut parts = Vec::with_capacity(replies.len());
        for reply in replies {
            match check_result(reply)? {
                Message::ConfigPart(part) => parts.push(part),
                other => return Err(ClientError::UnexpectedReply(format!("{:?}", other))),
            }
        }

        if parts.len() < expected {
            if !self.is_connected().await {
                return Err(ClientError::ConnectionLost);
            }
            return Err(ClientError::IncompleteTransfer {
                expected,
                received: parts.len(),
            });
        }

        let configs = reassemble(parts);
        tracing::info!("Received {} elements in {} parts", configs.len(), expected);
        Ok(configs)
    }

    pub async fn start_grid(&self) -> ClientResult<()> {
        self.execute(Request::StartGrid).await.map(|_| ())
    }

    pub async fn stop_grid(&self) -> ClientResult<()> {
        self.execute(Request::StopGrid).await.map(|_| ())
    }

    /// Receive the telemetry pushed for one device
    pub async fn subscribe(&self, device_type: DeviceType, device_id: u16) -> mpsc::Receiver<DevicePush> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.shared
            .subscribers
            .lock()
            .await
            .entry((device_type, device_id))
            .or_default()
            .push(tx);
        rx
    }

    /// Get the current state
    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Traffic counters of the current or last connection
    pub async fn stats(&self) -> Option<StatsSnapshot> {
        self.shared
            .stats
            .read()
            .await
            .as_ref()
            .map(|stats| stats.snapshot())
    }

    /// Number of requests waiting for a reply
    pub async fn pending_requests(&self) -> usize {
        self.shared.correlator.pending().await
    }

    async fn exchange(&self, slot: ReplySlot, frame: &[u8]) -> ClientResult<Message> {
        let command_id = slot.id();
        if let Err(e) = self.shared.send_frame(frame).await {
            self.shared.correlator.unregister(command_id).await;
            return Err(e);
        }

        match self
            .shared
            .correlator
            .await_reply(slot, self.shared.config.request_timeout())
            .await
        {
            Some(reply) => Ok(reply),
            None if self.is_connected().await => Err(ClientError::Timeout { command_id }),
            None => Err(ClientError::ConnectionLost),
        }
    }
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!("Client event dropped: {}", e);
        }
    }

    /// Write one frame. A failed write, or one that does not finish within
    /// the write timeout, ends the connection. Waiting for the writer is
    /// abandoned as soon as the connection shuts down.
    async fn send_frame(&self, frame: &[u8]) -> ClientResult<()> {
        let mut shutdown_rx = match self.shutdown_tx.lock().await.as_ref() {
            Some(tx) => tx.subscribe(),
            None => return Err(ClientError::NotConnected),
        };

        let write = async {
            let mut writer = self.writer.lock().await;
            let session = self.session.load(Ordering::SeqCst);
            let Some(writer) = writer.as_mut() else {
                return Err(ClientError::NotConnected);
            };

            let limit = self.config.write_timeout();
            match tokio::time::timeout(limit, writer.send(frame)).await {
                Ok(Ok(())) => Ok(None),
                Ok(Err(e)) => Ok(Some((session, format!("Send error: {}", e)))),
                Err(_) => Ok(Some((session, format!("Write stalled for {:?}", limit)))),
            }
        };

        let failure = tokio::select! {
            result = write => result?,
            _ = shutdown_rx.changed() => return Err(ClientError::ConnectionLost),
        };

        if let Some((session, reason)) = failure {
            self.teardown(session, reason).await;
            return Err(ClientError::ConnectionLost);
        }
        Ok(())
    }

    async fn dispatch(&self, message: Message) {
        match message {
            Message::IsAlive { .. } => tracing::trace!("Server is alive"),
            Message::DeviceData { header, data } => {
                let push = DevicePush {
                    device_type: header.header.device_type,
                    device_id: header.header.device_id,
                    sequence: header.id,
                    data,
                };
                self.publish(push).await;
            }
            Message::ServerStatus { status, .. } => {
                tracing::debug!(
                    "Server status: {} connections, load {:.2}%",
                    status.used_connections,
                    status.load_percent()
                );
                self.emit(ClientEvent::ServerStatus(status));
            }
            Message::Error { payload, .. } => {
                tracing::warn!("Server reported error {:#04x}", payload.error);
                self.emit(ClientEvent::ServerError {
                    error: payload.error,
                });
            }
            reply => match reply.command_id() {
                Some(id) => {
                    self.correlator.deliver(id, reply).await;
                }
                None => tracing::warn!("Dropping uncorrelated frame {:?}", reply),
            },
        }
    }

    async fn publish(&self, push: DevicePush) {
        let key = (push.device_type, push.device_id);
        let mut subscribers = self.subscribers.lock().await;

        let Some(senders) = subscribers.get_mut(&key) else {
            tracing::trace!("No subscriber for {:?} {}", key.0, key.1);
            return;
        };

        senders.retain(|tx| match tx.try_send(push.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Subscriber of {:?} {} lagging, push dropped", key.0, key.1);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if senders.is_empty() {
            subscribers.remove(&key);
        }
    }

    /// End connection `session`. Later calls for the same session and calls
    /// for an outdated session do nothing.
    async fn teardown(&self, session: u64, reason: String) {
        {
            let mut state = self.state.write().await;
            if self.session.load(Ordering::SeqCst) != session
                || *state != ConnectionState::Connected
            {
                return;
            }
            *state = ConnectionState::Disconnecting;
        }

        // stops the loops and any write in progress, which frees the writer
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(true);
        }
        self.correlator.cancel_all().await;
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = tokio::time::timeout(self.config.write_timeout(), writer.shutdown()).await;
        }

        *self.state.write().await = ConnectionState::Disconnected;

        tracing::info!("Disconnected: {}", reason);
        self.emit(ClientEvent::Disconnected { reason });
    }
}

fn check_result(reply: Message) -> ClientResult<Message> {
    match reply.result() {
        Some(result) if is_fault(result) => Err(ClientError::Rejected { result }),
        Some(_) => Ok(reply),
        None => Err(ClientError::UnexpectedReply(format!("{:?}", reply))),
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut reader: FrameReader<OwnedReadHalf>,
    mut shutdown_rx: watch::Receiver<bool>,
    session: u64,
) {
    let reason = loop {
        tokio::select! {
            result = reader.recv() => {
                match result {
                    Ok(Some(message)) => {
                        shared.traffic_seen.store(true, Ordering::SeqCst);
                        shared.dispatch(message).await;
                    }
                    Ok(None) => break "Connection closed by server".to_string(),
                    Err(e) => break format!("Receive error: {}", e),
                }
            }
            _ = shutdown_rx.changed() => return,
        }
    };

    shared.teardown(session, reason).await;
}

async fn heartbeat_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>, session: u64) {
    let period = shared.config.heartbeat_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !shared.traffic_seen.swap(false, Ordering::SeqCst) {
                    shared
                        .teardown(session, format!("No traffic from server for {:?}", period))
                        .await;
                    return;
                }

                let frame = match is_alive_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!("Cannot build heartbeat: {}", e);
                        return;
                    }
                };
                if shared.send_frame(&frame).await.is_err() {
                    return;
                }
            }
            _ = shutdown_rx.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{GridSimulator, SimulatorConfig};
    use crate::protocol::commands::{error, server};
    use crate::protocol::{
        CommandHeader, ConfigLengthPayload, DeviceDataHeader, ErrorPayload, Header, NodeConfig,
        PacketType, PointConfig, RespondHeader, SwitchgearLiveData, WireSegment,
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpSocket};
    use tokio::task::JoinHandle;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            heartbeat_interval_ms: 200,
            request_timeout_ms: 2000,
            transfer_timeout_ms: 2000,
            ..Default::default()
        }
    }

    fn grid(count: usize) -> Vec<GridElementConfig> {
        (0..count)
            .map(|i| {
                if i % 2 == 0 {
                    GridElementConfig::Node(NodeConfig {
                        id: i as u16,
                        node_type: 1,
                    })
                } else {
                    GridElementConfig::Point(PointConfig {
                        id: i as u16,
                        node_id: (i - 1) as u16,
                        pos_x: i as u16,
                        pos_y: 2 * i as u16,
                    })
                }
            })
            .collect()
    }

    async fn simulator(config: SimulatorConfig) -> (GridSimulator, SocketAddr) {
        let mut simulator = GridSimulator::new(config);
        let addr = simulator.start().await.unwrap();
        (simulator, addr)
    }

    /// Server with a tiny receive buffer that never reads but keeps sending
    /// heartbeats, so the client sees traffic while its writes back up
    fn stalled_server() -> (SocketAddr, JoinHandle<()>) {
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(1024).unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let alive = is_alive_frame().unwrap();
            while stream.write_all(&alive).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        (addr, task)
    }

    /// Write until the connection refuses
    fn flood(client: Arc<GridClient>) -> JoinHandle<ClientError> {
        tokio::spawn(async move {
            let burst: Vec<u8> = (0..64)
                .flat_map(|_| is_alive_frame().unwrap().to_vec())
                .collect();
            loop {
                if let Err(e) = client.shared.send_frame(&burst).await {
                    return e;
                }
            }
        })
    }

    async fn wait_for_disconnect(events: &mut mpsc::Receiver<ClientEvent>) -> String {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Some(ClientEvent::Disconnected { reason })) => return reason,
                Ok(Some(_)) => continue,
                other => panic!("no disconnect event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = GridClient::new(NetworkConfig::default());
        assert!(!client.is_connected().await);
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert!(client.stats().await.is_none());
    }

    #[tokio::test]
    async fn test_request_without_connection() {
        let client = GridClient::new(NetworkConfig::default());
        assert!(matches!(
            client.send_request(Request::StartGrid).await,
            Err(ClientError::NotConnected)
        ));
        // disconnecting twice is fine
        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_request_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await.unwrap();
            let (command, _) = CommandHeader::decode(&buf, 0).unwrap();

            let reply = Message::Respond(RespondHeader::new(
                DeviceType::Server,
                0,
                server::result::SUCCESS,
                command.command_id,
            ));
            stream.write_all(&reply.encode().unwrap()).await.unwrap();
            (command, stream)
        });

        let client = GridClient::new(test_config());
        client.connect(addr).await.unwrap();
        assert!(matches!(
            client.connect(addr).await,
            Err(ClientError::AlreadyConnected)
        ));

        let reply = client.send_request(Request::StartGrid).await.unwrap();
        let (command, _stream) = server_task.await.unwrap();

        assert_eq!(command.command, server::START_GRID);
        assert_eq!(reply.command_id(), Some(command.command_id));
        assert_eq!(reply.result(), Some(server::result::SUCCESS));
        assert_eq!(client.pending_requests().await, 0);

        client.disconnect().await.unwrap();
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let (mut simulator, addr) = simulator(SimulatorConfig::default()).await;
        let client = GridClient::new(test_config());
        client.connect(addr).await.unwrap();

        let configs = grid(47);
        client.upload_grid(&configs).await.unwrap();
        assert!(simulator.grid_loaded().await);

        let downloaded = client.fetch_bulk().await.unwrap();
        assert_eq!(downloaded, configs);

        client.start_grid().await.unwrap();
        client.stop_grid().await.unwrap();

        client.disconnect().await.unwrap();
        simulator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_download_out_of_order() {
        let config = SimulatorConfig {
            reverse_config_parts: true,
            ..Default::default()
        };
        let (mut simulator, addr) = simulator(config).await;
        let client = GridClient::new(test_config());
        client.connect(addr).await.unwrap();

        let configs = grid(61);
        assert_eq!(client.send_bulk(&configs).await.unwrap(), 4);
        assert_eq!(client.fetch_bulk().await.unwrap(), configs);

        client.disconnect().await.unwrap();
        simulator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_download_empty_grid() {
        let (mut simulator, addr) = simulator(SimulatorConfig::default()).await;
        let client = GridClient::new(test_config());
        client.connect(addr).await.unwrap();

        assert!(matches!(
            client.fetch_bulk().await,
            Err(ClientError::EmptyConfiguration)
        ));

        client.disconnect().await.unwrap();
        simulator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_connection() {
        let (mut simulator, addr) = simulator(SimulatorConfig::default()).await;
        let client = GridClient::new(test_config());
        client.connect(addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(client.is_connected().await);

        let stats = client.stats().await.unwrap();
        assert!(stats.frames_sent >= 3);
        assert!(stats.frames_received >= 2);

        client.disconnect().await.unwrap();
        simulator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_connection_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // accepts and then stays silent
        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let config = NetworkConfig {
            heartbeat_interval_ms: 100,
            request_timeout_ms: 10_000,
            ..Default::default()
        };
        let mut client = GridClient::new(config);
        let mut events = client.take_event_receiver().unwrap();
        client.connect(addr).await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Connected { .. })
        ));

        let start = tokio::time::Instant::now();
        let result = client.send_request(Request::GetConfigLength).await;
        assert!(matches!(result, Err(ClientError::ConnectionLost)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Disconnected { .. })
        ));

        server_task.abort();
    }

    #[tokio::test]
    async fn test_disconnect_wakes_pending_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let config = NetworkConfig {
            heartbeat_interval_ms: 10_000,
            request_timeout_ms: 30_000,
            ..Default::default()
        };
        let client = Arc::new(GridClient::new(config));
        client.connect(addr).await.unwrap();

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.send_request(Request::StopGrid).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.disconnect().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("pending request should return")
            .unwrap();
        assert!(matches!(result, Err(ClientError::ConnectionLost)));
        assert_eq!(client.pending_requests().await, 0);

        server_task.abort();
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // answers heartbeats only
        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            while stream.read_exact(&mut buf).await.is_ok() {
                if buf[0] == 0x00 {
                    let _ = stream.write_all(&is_alive_frame().unwrap()).await;
                }
            }
        });

        let config = NetworkConfig {
            heartbeat_interval_ms: 100,
            request_timeout_ms: 300,
            ..Default::default()
        };
        let client = GridClient::new(config);
        client.connect(addr).await.unwrap();

        let result = client.send_request(Request::SetupGrid).await;
        assert!(matches!(result, Err(ClientError::Timeout { .. })));
        assert!(client.is_connected().await);

        client.disconnect().await.unwrap();
        server_task.abort();
    }

    #[tokio::test]
    async fn test_pushes_routed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let live = SwitchgearLiveData {
            closed_switches: 0b0011,
            voltage_p: 400,
            ..Default::default()
        };
        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let push = Message::DeviceData {
                header: DeviceDataHeader::new(DeviceType::FenSwitchgear, 3, 17),
                data: DeviceData::FenSwitchgear(live),
            };
            let other = Message::DeviceData {
                header: DeviceDataHeader::new(DeviceType::FenSwitchgear, 4, 18),
                data: DeviceData::FenSwitchgear(live),
            };
            let status = Message::ServerStatus {
                header: RespondHeader::new(DeviceType::Server, 0, server::result::STATUS_DATA, 0),
                status: ServerStatus {
                    used_connections: 2,
                    ..Default::default()
                },
            };
            for message in [other, push, status] {
                stream.write_all(&message.encode().unwrap()).await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut client = GridClient::new(test_config());
        let mut events = client.take_event_receiver().unwrap();
        let mut pushes = client.subscribe(DeviceType::FenSwitchgear, 3).await;
        client.connect(addr).await.unwrap();

        let push = tokio::time::timeout(Duration::from_secs(1), pushes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(push.device_id, 3);
        assert_eq!(push.sequence, 17);
        assert_eq!(push.data, DeviceData::FenSwitchgear(live));

        let status = loop {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(ClientEvent::ServerStatus(status))) => break status,
                Ok(Some(_)) => continue,
                other => panic!("no status event: {:?}", other),
            }
        };
        assert_eq!(status.used_connections, 2);

        client.disconnect().await.unwrap();
        server_task.abort();
    }

    #[tokio::test]
    async fn test_disconnect_with_stalled_write() {
        let (addr, server_task) = stalled_server();
        let config = NetworkConfig {
            heartbeat_interval_ms: 100,
            request_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            ..Default::default()
        };
        let client = Arc::new(GridClient::new(config));
        client.connect(addr).await.unwrap();

        let flooder = flood(client.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.send_request(Request::StartGrid).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.is_connected().await);

        tokio::time::timeout(Duration::from_secs(2), client.disconnect())
            .await
            .expect("disconnect should not wait for the blocked write")
            .unwrap();
        assert_eq!(client.state().await, ConnectionState::Disconnected);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("pending request should return")
            .unwrap();
        assert!(matches!(
            result,
            Err(ClientError::ConnectionLost) | Err(ClientError::NotConnected)
        ));
        let error = tokio::time::timeout(Duration::from_secs(1), flooder)
            .await
            .expect("writer should give up")
            .unwrap();
        assert!(matches!(
            error,
            ClientError::ConnectionLost | ClientError::NotConnected
        ));
        assert_eq!(client.pending_requests().await, 0);

        server_task.abort();
    }

    #[tokio::test]
    async fn test_stalled_write_ends_connection() {
        let (addr, server_task) = stalled_server();
        let config = NetworkConfig {
            heartbeat_interval_ms: 100,
            request_timeout_ms: 30_000,
            write_timeout_ms: 200,
            ..Default::default()
        };
        let mut client = GridClient::new(config);
        let mut events = client.take_event_receiver().unwrap();
        let client = Arc::new(client);
        client.connect(addr).await.unwrap();

        let flooder = flood(client.clone());
        let error = tokio::time::timeout(Duration::from_secs(5), flooder)
            .await
            .expect("stalled write should end the connection")
            .unwrap();
        assert!(matches!(
            error,
            ClientError::ConnectionLost | ClientError::NotConnected
        ));

        let reason = wait_for_disconnect(&mut events).await;
        assert!(reason.contains("stalled"), "{}", reason);
        assert_eq!(client.state().await, ConnectionState::Disconnected);

        server_task.abort();
    }

    #[tokio::test]
    async fn test_server_error_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let message = Message::Error {
                header: Header::new(PacketType::Error, DeviceType::None, 0),
                payload: ErrorPayload {
                    error: error::UNSUPPORTED,
                    rsvd: 0,
                },
            };
            stream.write_all(&message.encode().unwrap()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut client = GridClient::new(test_config());
        let mut events = client.take_event_receiver().unwrap();
        client.connect(addr).await.unwrap();

        let code = loop {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(ClientEvent::ServerError { error: code })) => break code,
                Ok(Some(_)) => continue,
                other => panic!("no error event: {:?}", other),
            }
        };
        assert_eq!(code, error::UNSUPPORTED);
        assert!(client.is_connected().await);

        client.disconnect().await.unwrap();
        server_task.abort();
    }

    #[tokio::test]
    async fn test_malformed_frame_ends_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // answers with a RESPOND that names no device
        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await.unwrap();
            let (command, _) = CommandHeader::decode(&buf, 0).unwrap();

            let reply = Message::Respond(RespondHeader::new(
                DeviceType::None,
                0,
                server::result::SUCCESS,
                command.command_id,
            ));
            stream.write_all(&reply.encode().unwrap()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let config = NetworkConfig {
            heartbeat_interval_ms: 10_000,
            request_timeout_ms: 10_000,
            ..Default::default()
        };
        let mut client = GridClient::new(config);
        let mut events = client.take_event_receiver().unwrap();
        client.connect(addr).await.unwrap();

        let start = tokio::time::Instant::now();
        let result = client.send_request(Request::StartGrid).await;
        assert!(matches!(result, Err(ClientError::ConnectionLost)));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert_eq!(client.pending_requests().await, 0);

        let reason = wait_for_disconnect(&mut events).await;
        assert!(reason.starts_with("Receive error"), "{}", reason);

        server_task.abort();
    }

    #[tokio::test]
    async fn test_reply_with_unknown_id_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // answers under a wrong id first, then under the right one
        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await.unwrap();
            let (command, _) = CommandHeader::decode(&buf, 0).unwrap();

            for id in [command.command_id.wrapping_add(1), command.command_id] {
                let reply = Message::Respond(RespondHeader::new(
                    DeviceType::Server,
                    0,
                    server::result::SUCCESS,
                    id,
                ));
                stream.write_all(&reply.encode().unwrap()).await.unwrap();
            }
            (command, stream)
        });

        let config = NetworkConfig {
            heartbeat_interval_ms: 10_000,
            ..test_config()
        };
        let client = GridClient::new(config);
        client.connect(addr).await.unwrap();

        let reply = client.send_request(Request::StopGrid).await.unwrap();
        let (command, _stream) = server_task.await.unwrap();
        assert_eq!(reply.command_id(), Some(command.command_id));
        assert!(client.is_connected().await);
        assert_eq!(client.pending_requests().await, 0);

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_download_rejected_early() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // promises three parts, then refuses the download
        let server_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];

            stream.read_exact(&mut buf).await.unwrap();
            let (command, _) = CommandHeader::decode(&buf, 0).unwrap();
            let length = Message::ConfigLength {
                header: RespondHeader::new(
                    DeviceType::Grid,
                    0,
                    grid::result::GET_CONFIG_LENGTH,
                    command.command_id,
                ),
                payload: ConfigLengthPayload { num_packets: 3 },
            };
            stream.write_all(&length.encode().unwrap()).await.unwrap();

            stream.read_exact(&mut buf).await.unwrap();
            let (command, _) = CommandHeader::decode(&buf, 0).unwrap();
            let refusal = Message::Respond(RespondHeader::new(
                DeviceType::Grid,
                0,
                grid::result::GET_CONFIG_ERROR,
                command.command_id,
            ));
            stream.write_all(&refusal.encode().unwrap()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let config = NetworkConfig {
            heartbeat_interval_ms: 10_000,
            transfer_timeout_ms: 30_000,
            ..test_config()
        };
        let client = GridClient::new(config);
        client.connect(addr).await.unwrap();

        let start = tokio::time::Instant::now();
        let result = client.fetch_bulk().await;
        assert!(matches!(
            result,
            Err(ClientError::Rejected {
                result: grid::result::GET_CONFIG_ERROR
            })
        ));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(client.is_connected().await);
        assert_eq!(client.pending_requests().await, 0);

        client.disconnect().await.unwrap();
        server_task.abort();
    }
}
