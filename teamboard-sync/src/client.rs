//! WebSocket sync client: the connection state machine behind a canvas.
//!
//! ```text
//!                connect()            sync received
//! Disconnected ───────────► Connecting ───────────► Joined ◄──────────┐
//!      ▲                        │                     │               │
//!      │ connect failed         │        socket lost  ▼               │ sync received
//!      └────────────────────────┘              Reconnecting{n} ───────┘
//!                                                     │ attempts exhausted
//!                                                     ▼
//!                                                  GivenUp
//! ```
//!
//! Local edits are applied to the [`LocalCanvas`] immediately and sent as
//! fire-and-forget intents, but only while `Joined`. Edits made in any
//! other state stay local until the next `sync`, which replaces them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{
    CanvasElement, ClientMessage, CursorPosition, ElementData, ElementId, ElementKind,
    JoinRequest, PresenceRecord, ProtocolError, RoomId, ServerMessage, UserId, UserProfile,
};
use crate::replica::{LocalCanvas, RemoteChange};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Connecting,
    Joined,
    /// Waiting for, or performing, reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: u32 },
    GivenUp,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    ConnectRequested,
    /// A `sync` arrived for our room.
    Synced,
    TransportLost,
    AttemptFailed,
    /// The server refused our join; retrying will not help.
    Rejected,
    /// Explicit disconnect by the application.
    Closed,
}

impl SyncState {
    /// Pure transition function; unlisted combinations keep the state.
    pub fn on(self, signal: ConnectionSignal, policy: &ReconnectPolicy) -> SyncState {
        use ConnectionSignal as S;
        use SyncState::*;

        match (self, signal) {
            (_, S::Closed) => Disconnected,
            (Disconnected | GivenUp, S::ConnectRequested) => Connecting,
            (Connecting | Reconnecting { .. }, S::Synced) => Joined,
            (Connecting, S::AttemptFailed | S::TransportLost | S::Rejected) => Disconnected,
            (Reconnecting { .. }, S::Rejected) => GivenUp,
            (Joined, S::TransportLost) => {
                if policy.max_attempts == 0 {
                    GivenUp
                } else {
                    Reconnecting { attempt: 1 }
                }
            }
            (Reconnecting { attempt }, S::AttemptFailed | S::TransportLost) => {
                if attempt >= policy.max_attempts {
                    GivenUp
                } else {
                    Reconnecting {
                        attempt: attempt + 1,
                    }
                }
            }
            (state, _) => state,
        }
    }

    pub fn is_joined(&self) -> bool {
        matches!(self, SyncState::Joined)
    }
}

/// Bounded exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port`
    pub server_url: String,
    pub room_id: RoomId,
    pub user: UserProfile,
    /// Session credential passed to the server's authorizer.
    pub token: Option<String>,
    /// Time allowed from dialing to receiving the `sync`.
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, room_id: impl Into<RoomId>, user: UserProfile) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            user,
            token: None,
            handshake_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn join_request(&self) -> JoinRequest {
        JoinRequest {
            room_id: self.room_id.clone(),
            user: self.user.clone(),
            token: self.token.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("no sync within the handshake timeout")]
    HandshakeTimeout,
    #[error("join rejected: {0}")]
    Rejected(String),
    #[error("connection closed during handshake")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid in state {0:?}")]
    InvalidState(SyncState),
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(SyncState),
    /// Local view replaced by a server snapshot.
    Synced {
        elements: Vec<CanvasElement>,
        users: Vec<PresenceRecord>,
    },
    ElementChanged(ElementId),
    ElementRemoved(ElementId),
    PresenceChanged,
    CursorMoved(UserId),
    Rejected(String),
}

/// State shared between the client handle and its driver task.
struct Shared {
    state: RwLock<SyncState>,
    connected: AtomicBool,
    canvas: RwLock<LocalCanvas>,
    events: mpsc::Sender<SyncEvent>,
    policy: ReconnectPolicy,
}

impl Shared {
    async fn signal(&self, signal: ConnectionSignal) -> SyncState {
        let mut state = self.state.write().await;
        let next = state.on(signal, &self.policy);
        if next != *state {
            debug!("Sync state {:?} -> {:?} on {:?}", *state, next, signal);
            *state = next;
            self.connected.store(next.is_joined(), Ordering::Release);
            self.emit(SyncEvent::StateChanged(next));
        }
        next
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            debug!("Event queue full, dropped {:?}", event);
        }
    }

    async fn install_snapshot(&self, elements: Vec<CanvasElement>, users: Vec<PresenceRecord>) {
        self.canvas
            .write()
            .await
            .replace_with_snapshot(elements.clone(), &users);
        self.emit(SyncEvent::Synced { elements, users });
    }

    async fn apply_remote(&self, message: &ServerMessage) {
        let change = self.canvas.write().await.apply_remote(message);
        let event = match change {
            Some(RemoteChange::Synced) => match message {
                ServerMessage::Sync {
                    elements, users, ..
                } => SyncEvent::Synced {
                    elements: elements.clone(),
                    users: users.clone(),
                },
                _ => return,
            },
            Some(RemoteChange::ElementChanged(id)) => SyncEvent::ElementChanged(id),
            Some(RemoteChange::ElementRemoved(id)) => SyncEvent::ElementRemoved(id),
            Some(RemoteChange::PresenceChanged) => SyncEvent::PresenceChanged,
            Some(RemoteChange::CursorMoved(user_id)) => SyncEvent::CursorMoved(user_id),
            Some(RemoteChange::Rejected(reason)) => SyncEvent::Rejected(reason),
            None => return,
        };
        self.emit(event);
    }
}

/// The sync client.
///
/// Owns the local view of one room and keeps it joined to the server,
/// reconnecting with backoff when the socket drops.
pub struct SyncClient {
    config: ClientConfig,
    shared: Arc<Shared>,

    /// Channel to send intents to the driver task
    outgoing_tx: mpsc::Sender<ClientMessage>,
    /// Taken by the driver on first connect
    outgoing_rx: Option<mpsc::Receiver<ClientMessage>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    stop_tx: Option<watch::Sender<bool>>,
    driver: Option<JoinHandle<mpsc::Receiver<ClientMessage>>>,
}

impl SyncClient {
    /// Create a new sync client.
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        let canvas = LocalCanvas::new(config.room_id.clone(), config.user.user_id.clone());
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(SyncState::Disconnected),
                connected: AtomicBool::new(false),
                canvas: RwLock::new(canvas),
                events: event_tx,
                policy: config.reconnect.clone(),
            }),
            config,
            outgoing_tx,
            outgoing_rx: Some(outgoing_rx),
            event_rx: Some(event_rx),
            stop_tx: None,
            driver: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the room and wait for its snapshot.
    ///
    /// Returns once the client is `Joined`; from then on a background task
    /// keeps the room joined until [`SyncClient::disconnect`].
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let state = self.state().await;
        if !matches!(state, SyncState::Disconnected | SyncState::GivenUp) {
            return Err(ClientError::InvalidState(state));
        }
        // reclaim the intent queue from a driver that gave up
        if let Some(driver) = self.driver.take() {
            if let Ok(rx) = driver.await {
                self.outgoing_rx = Some(rx);
            }
        }
        let Some(mut outgoing_rx) = self.outgoing_rx.take() else {
            return Err(ClientError::InvalidState(state));
        };

        self.shared.signal(ConnectionSignal::ConnectRequested).await;
        let (ws, elements, users) = match open_session(&self.config).await {
            Ok(session) => session,
            Err(e) => {
                self.outgoing_rx = Some(outgoing_rx);
                let signal = match &e {
                    ClientError::Rejected(reason) => {
                        self.shared.emit(SyncEvent::Rejected(reason.clone()));
                        ConnectionSignal::Rejected
                    }
                    _ => ConnectionSignal::AttemptFailed,
                };
                self.shared.signal(signal).await;
                return Err(e);
            }
        };

        discard_pending(&mut outgoing_rx);
        self.shared.install_snapshot(elements, users).await;
        self.shared.signal(ConnectionSignal::Synced).await;
        info!(
            "Joined room {} as {}",
            self.config.room_id, self.config.user.user_id
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);
        self.driver = Some(tokio::spawn(drive(
            ws,
            self.config.clone(),
            self.shared.clone(),
            outgoing_rx,
            stop_rx,
        )));
        Ok(())
    }

    /// Leave the room and close the socket without reconnecting.
    pub async fn disconnect(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(true);
        }
        if let Some(driver) = self.driver.take() {
            match driver.await {
                Ok(rx) => self.outgoing_rx = Some(rx),
                Err(e) => warn!("Sync driver failed: {e}"),
            }
        }
        self.shared.signal(ConnectionSignal::Closed).await;
    }

    // ── Local edits ──────────────────────────────────────────────

    /// Upsert an element locally and send it if joined.
    /// Returns whether the intent was sent.
    pub async fn update_element(&self, element: CanvasElement) -> bool {
        let intent = self.shared.canvas.write().await.apply_local_update(element);
        self.send_intent(intent).await
    }

    /// Create an element on top of the stack and send it.
    pub async fn add_element(
        &self,
        kind: ElementKind,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        data: ElementData,
    ) -> CanvasElement {
        let element = {
            let mut canvas = self.shared.canvas.write().await;
            let element = canvas.new_element(kind, x, y, width, height).with_data(data);
            canvas.apply_local_update(element.clone());
            element
        };
        self.send_intent(ClientMessage::ElementUpdate {
            room_id: self.config.room_id.clone(),
            element: element.clone(),
        })
        .await;
        element
    }

    pub async fn delete_element(&self, element_id: &str) -> bool {
        let intent = self.shared.canvas.write().await.apply_local_delete(element_id);
        self.send_intent(intent).await
    }

    pub async fn bring_to_front(&self, element_id: &str) -> bool {
        let intent = self.shared.canvas.write().await.bring_to_front(element_id);
        match intent {
            Some(intent) => self.send_intent(intent).await,
            None => false,
        }
    }

    /// Callers producing pointer events at display rate should gate this
    /// with a [`crate::presence::CursorThrottle`].
    pub async fn move_cursor(&self, cursor: CursorPosition) -> bool {
        let intent = self.shared.canvas.read().await.cursor_intent(cursor);
        self.send_intent(intent).await
    }

    async fn send_intent(&self, intent: ClientMessage) -> bool {
        if !self.shared.state.read().await.is_joined() {
            debug!("Not joined, keeping {} local", intent.kind());
            return false;
        }
        match self.outgoing_tx.try_send(intent) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(intent)) => {
                warn!("Outgoing queue full, dropped {}", intent.kind());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Get the current connection state.
    pub async fn state(&self) -> SyncState {
        *self.shared.state.read().await
    }

    /// Connectivity indicator for the UI.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub async fn elements(&self) -> Vec<CanvasElement> {
        self.shared.canvas.read().await.elements()
    }

    pub async fn element(&self, element_id: &str) -> Option<CanvasElement> {
        self.shared.canvas.read().await.element(element_id).cloned()
    }

    /// Other members of the room.
    pub async fn peers(&self) -> Vec<PresenceRecord> {
        self.shared.canvas.read().await.peers()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(true);
        }
    }
}

/// Dial, join, and wait for the room snapshot.
async fn open_session(
    config: &ClientConfig,
) -> Result<(WsStream, Vec<CanvasElement>, Vec<PresenceRecord>), ClientError> {
    tokio::time::timeout(config.handshake_timeout, handshake(config))
        .await
        .map_err(|_| ClientError::HandshakeTimeout)?
}

async fn handshake(
    config: &ClientConfig,
) -> Result<(WsStream, Vec<CanvasElement>, Vec<PresenceRecord>), ClientError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(config.server_url.as_str())
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;

    let join = ClientMessage::Join(config.join_request()).encode()?;
    ws.send(Message::Binary(join.into()))
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;

    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                Ok(ServerMessage::Sync {
                    room_id,
                    elements,
                    users,
                }) if room_id == config.room_id => return Ok((ws, elements, users)),
                Ok(ServerMessage::JoinRejected { room_id, reason }) if room_id == config.room_id => {
                    return Err(ClientError::Rejected(reason));
                }
                Ok(other) => debug!("Ignoring {} before sync", other.kind()),
                Err(e) => warn!("Failed to decode frame during handshake: {e}"),
            },
            Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
            Some(Err(e)) => return Err(ClientError::Connect(e.to_string())),
            Some(Ok(_)) => {}
        }
    }
}

/// Edits queued while the socket was down belong to a superseded view.
fn discard_pending(outgoing_rx: &mut mpsc::Receiver<ClientMessage>) {
    let mut discarded = 0usize;
    while outgoing_rx.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        warn!("Discarded {discarded} unsent intents on rejoin");
    }
}

enum SessionEnd {
    Stopped,
    Lost,
}

/// Driver task: pumps one socket at a time and reconnects on loss.
/// Hands the intent queue back when it finishes.
async fn drive(
    mut ws: WsStream,
    config: ClientConfig,
    shared: Arc<Shared>,
    mut outgoing_rx: mpsc::Receiver<ClientMessage>,
    mut stop: watch::Receiver<bool>,
) -> mpsc::Receiver<ClientMessage> {
    loop {
        match pump(ws, &config, &shared, &mut outgoing_rx, &mut stop).await {
            SessionEnd::Stopped => {
                shared.signal(ConnectionSignal::Closed).await;
                return outgoing_rx;
            }
            SessionEnd::Lost => {
                warn!("Connection to {} lost", config.server_url);
            }
        }

        let mut state = shared.signal(ConnectionSignal::TransportLost).await;
        ws = loop {
            let SyncState::Reconnecting { attempt } = state else {
                info!("Giving up on {} after {:?}", config.server_url, state);
                return outgoing_rx;
            };

            let delay = shared.policy.delay_for(attempt);
            debug!("Reconnect attempt {attempt} in {delay:?}");
            tokio::select! {
                _ = stop.changed() => {
                    shared.signal(ConnectionSignal::Closed).await;
                    return outgoing_rx;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match open_session(&config).await {
                Ok((ws, elements, users)) => {
                    discard_pending(&mut outgoing_rx);
                    shared.install_snapshot(elements, users).await;
                    shared.signal(ConnectionSignal::Synced).await;
                    info!("Rejoined room {} on attempt {attempt}", config.room_id);
                    break ws;
                }
                Err(ClientError::Rejected(reason)) => {
                    warn!("Rejoin rejected: {reason}");
                    shared.emit(SyncEvent::Rejected(reason));
                    shared.signal(ConnectionSignal::Rejected).await;
                    return outgoing_rx;
                }
                Err(e) => {
                    debug!("Reconnect attempt {attempt} failed: {e}");
                    state = shared.signal(ConnectionSignal::AttemptFailed).await;
                }
            }
        };
    }
}

/// Run one joined socket until it drops or the client stops.
async fn pump(
    ws: WsStream,
    config: &ClientConfig,
    shared: &Shared,
    outgoing_rx: &mut mpsc::Receiver<ClientMessage>,
    stop: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut ws_writer, mut ws_reader) = ws.split();

    loop {
        tokio::select! {
            _ = stop.changed() => {
                let leave = ClientMessage::Leave { room_id: config.room_id.clone() };
                if let Ok(encoded) = leave.encode() {
                    let _ = ws_writer.send(Message::Binary(encoded.into())).await;
                }
                let _ = ws_writer.send(Message::Close(None)).await;
                return SessionEnd::Stopped;
            }

            intent = outgoing_rx.recv() => {
                let Some(intent) = intent else {
                    return SessionEnd::Stopped;
                };
                let encoded = match intent.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!("Failed to encode {}: {e}", intent.kind());
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    return SessionEnd::Lost;
                }
            }

            frame = ws_reader.next() => match frame {
                Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                    Ok(message) => shared.apply_remote(&message).await,
                    Err(e) => warn!("Failed to decode server frame: {e}"),
                },
                Some(Ok(Message::Ping(data))) => {
                    if ws_writer.send(Message::Pong(data)).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return SessionEnd::Lost,
                Some(Ok(_)) => {}
            },
        }
    }
}
