//! WebSocket front end of the session registry.
//!
//! ```text
//! socket A ──┐                       ┌── room "board-1" actor
//!            ├── SessionRegistry ────┤
//! socket B ──┘        │              └── room "board-2" actor
//!                     │
//!         one outbound queue per socket, fed by every room it joined
//! ```
//!
//! One socket per participant, multiplexed by room id. The socket task
//! remembers which identity it joined each room with, so later intents
//! are attributed to that user and cannot be spoofed per frame. When the
//! socket goes away every room it joined sees a disconnect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;

use crate::hub::{HubConfig, Outbound};
use crate::protocol::{ClientMessage, ConnectionId, RoomId, ServerMessage, UserId};
use crate::registry::SessionRegistry;
use crate::storage::PersistenceMode;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Transport ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Per-room limits and persistence policy
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_secs: 30,
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `TEAMBOARD_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ServerConfig::from_env`] with an arbitrary variable source.
    /// Malformed values are logged and the default kept.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("TEAMBOARD_BIND_ADDR") {
            if addr.trim().is_empty() {
                log::warn!("Ignoring empty TEAMBOARD_BIND_ADDR");
            } else {
                config.bind_addr = addr.trim().to_string();
            }
        }
        if let Some(raw) = lookup("TEAMBOARD_HEARTBEAT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.heartbeat_interval_secs = secs,
                _ => log::warn!("Ignoring invalid TEAMBOARD_HEARTBEAT_SECS={raw:?}"),
            }
        }
        if let Some(raw) = lookup("TEAMBOARD_MAX_PEERS") {
            match raw.trim().parse::<usize>() {
                Ok(max) if max > 0 => config.hub.max_peers_per_room = max,
                _ => log::warn!("Ignoring invalid TEAMBOARD_MAX_PEERS={raw:?}"),
            }
        }
        if let Some(raw) = lookup("TEAMBOARD_PERSISTENCE") {
            match PersistenceMode::parse(&raw) {
                Some(mode) => config.hub.persistence = mode,
                None => log::warn!("Ignoring invalid TEAMBOARD_PERSISTENCE={raw:?}"),
            }
        }

        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Binary frames received
    pub frames_in: u64,
    /// Frames that failed to decode or were not binary
    pub frames_rejected: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_in: AtomicU64,
    frames_rejected: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self, active_rooms: usize) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            active_rooms,
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = SessionRegistry::new(config.hub.clone());
        Self::with_registry(config, registry)
    }

    /// Serve a pre-built registry (custom store or authorizer).
    pub fn with_registry(config: ServerConfig, registry: SessionRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind `config.bind_addr` and start serving.
    pub async fn bind(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.spawn(listener)
    }

    /// Start the accept loop on an already bound listener.
    pub fn spawn(self, listener: TcpListener) -> std::io::Result<ServerHandle> {
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        log::info!(
            "Sync server listening on {local_addr} (persistence: {})",
            self.config.hub.persistence.as_str()
        );

        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let task = tokio::spawn(Self::accept_loop(
            listener,
            self.registry,
            self.stats,
            self.config.heartbeat_interval_secs,
            shutdown_rx,
        ));

        Ok(ServerHandle {
            local_addr,
            registry,
            stats,
            shutdown_tx,
            task,
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        registry: Arc<SessionRegistry>,
        stats: Arc<AtomicServerStats>,
        heartbeat_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,

                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let registry = registry.clone();
                    let stats = stats.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, addr, registry, stats, heartbeat_secs, shutdown).await
                        {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        log::info!("Sync server stopping, closing {} connections", connections.len());
        while connections.join_next().await.is_some() {}
        log::info!("Sync server stopped");
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        stats: Arc<AtomicServerStats>,
        heartbeat_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (out_tx, mut out_rx) = registry.outbound_channel();
        let mut session = SocketSession {
            addr,
            registry: registry.clone(),
            outbound: out_tx,
            joined: HashMap::new(),
        };

        let period = Duration::from_secs(heartbeat_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let result = async {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }

                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                stats.frames_in.fetch_add(1, Ordering::Relaxed);
                                match ClientMessage::decode(&data) {
                                    Ok(message) => session.handle(message).await,
                                    Err(e) => {
                                        stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                    }
                                }
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Text(_))) => {
                                stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                                log::warn!("Ignoring text frame from {addr}");
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing room events
                    Some(event) = out_rx.recv() => {
                        let encoded = event.encode()?;
                        ws_sender.send(Message::Binary(encoded.into())).await?;
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        session.disconnect_all().await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }
}

/// Per-socket state: which identity this socket holds in each room.
struct SocketSession {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    outbound: Outbound,
    joined: HashMap<RoomId, (UserId, ConnectionId)>,
}

impl SocketSession {
    async fn handle(&mut self, message: ClientMessage) {
        log::debug!(
            "{} from {} for room {}",
            message.kind(),
            self.addr,
            message.room_id()
        );

        match message {
            ClientMessage::Join(request) => {
                let room_id = request.room_id.clone();
                let user_id = request.user.user_id.clone();

                // a socket holds one identity per room
                if let Some((previous, connection_id)) = self.joined.remove(&room_id) {
                    if previous != user_id {
                        self.registry
                            .disconnect(&room_id, &previous, connection_id)
                            .await;
                    }
                }

                let connection_id = self.registry.next_connection_id();
                match self
                    .registry
                    .join(request, connection_id, self.outbound.clone())
                    .await
                {
                    Ok(_) => {
                        self.joined.insert(room_id, (user_id, connection_id));
                    }
                    Err(e) => {
                        let rejected = ServerMessage::JoinRejected {
                            room_id,
                            reason: e.to_string(),
                        };
                        if self.outbound.try_send(Arc::new(rejected)).is_err() {
                            log::warn!("Could not deliver join rejection to {}", self.addr);
                        }
                    }
                }
            }

            // scoped to this socket: a newer connection of the same user stays
            ClientMessage::Leave { room_id } => match self.joined.remove(&room_id) {
                Some((user_id, connection_id)) => {
                    self.registry
                        .disconnect(&room_id, &user_id, connection_id)
                        .await
                }
                None => log::debug!("Leave for unjoined room {room_id} from {}", self.addr),
            },

            ClientMessage::ElementUpdate { room_id, element } => {
                if let Some((user_id, connection_id)) = self.member(&room_id) {
                    self.registry
                        .mutate_element_from(&room_id, &user_id, connection_id, element)
                        .await;
                }
            }

            ClientMessage::ElementDelete {
                room_id,
                element_id,
            } => {
                if let Some((user_id, connection_id)) = self.member(&room_id) {
                    self.registry
                        .delete_element_from(&room_id, &user_id, connection_id, element_id)
                        .await;
                }
            }

            ClientMessage::CursorUpdate { room_id, cursor } => {
                if let Some((user_id, connection_id)) = self.member(&room_id) {
                    self.registry
                        .move_cursor_from(&room_id, &user_id, connection_id, cursor)
                        .await;
                }
            }
        }
    }

    fn member(&self, room_id: &str) -> Option<(UserId, ConnectionId)> {
        let member = self.joined.get(room_id).cloned();
        if member.is_none() {
            log::warn!(
                "Dropping intent for room {room_id} from {}: not joined",
                self.addr
            );
        }
        member
    }

    async fn disconnect_all(&mut self) {
        for (room_id, (user_id, connection_id)) in self.joined.drain() {
            self.registry
                .disconnect(&room_id, &user_id, connection_id)
                .await;
        }
    }
}

/// Running server. Dropping the handle also shuts the server down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicServerStats>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients can connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.snapshot(self.registry.room_count().await)
    }

    /// Stop accepting, close every socket, and wait for their cleanup.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            log::error!("Server task failed: {e}");
        }
    }
}
