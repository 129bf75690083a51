//! Broadcast hub: one actor task per room.
//!
//! The actor exclusively owns the room's element snapshot, presence and
//! connection set. Joins, leaves, mutations and cursor moves for the room
//! arrive through a single bounded mailbox and are handled strictly in
//! arrival order, so no intra-room locking is needed. Different rooms run
//! on different tasks and share nothing.
//!
//! Fan-out goes through a bounded queue per connection. A full queue drops
//! that one event for that one recipient (counted in [`BroadcastStats`]);
//! the room never waits on a slow consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::auth::JoinError;
use crate::presence::PresenceTracker;
use crate::protocol::{
    now_millis, CanvasElement, ConnectionId, CursorPosition, ElementData, ElementId,
    PresenceRecord, RoomId, ServerMessage, UserId, UserProfile,
};
use crate::snapshot::CanvasSnapshot;
use crate::storage::{ElementStore, PersistenceMode, StoreError};

/// Per-connection outbound queue, shared by every room a socket joined.
pub type Outbound = mpsc::Sender<Arc<ServerMessage>>;

/// Limits and policies applied by every room.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Events buffered per connection before drops start.
    pub outbound_capacity: usize,
    /// Commands buffered per room mailbox.
    pub command_capacity: usize,
    /// Distinct users per room. Reconnects of a present user always pass.
    pub max_peers_per_room: usize,
    pub max_elements_per_room: usize,
    /// Largest accepted freehand path.
    pub max_payload_points: usize,
    pub persistence: PersistenceMode,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            command_capacity: 1024,
            max_peers_per_room: 100,
            max_elements_per_room: 10_000,
            max_payload_points: 10_000,
            persistence: PersistenceMode::Disabled,
        }
    }
}

/// Why an element mutation was dropped. Never reported to the sender.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("empty room id")]
    EmptyRoomId,
    #[error("empty element id")]
    EmptyElementId,
    #[error("non-finite {0}")]
    NonFinite(&'static str),
    #[error("negative size {width}x{height}")]
    NegativeSize { width: f32, height: f32 },
    #[error("{kind} element cannot carry this payload")]
    DataMismatch { kind: &'static str },
    #[error("path has {count} points, limit is {max}")]
    TooManyPoints { count: usize, max: usize },
    #[error("room already holds {0} elements")]
    TooManyElements(usize),
    #[error("sender is not a member of the room")]
    NotAMember,
    #[error("connection {sent} was replaced by {current}")]
    StaleConnection {
        sent: ConnectionId,
        current: ConnectionId,
    },
    #[error("store rejected write: {0}")]
    Store(#[from] StoreError),
}

/// Reject payloads no client should have produced.
pub fn validate_element(element: &CanvasElement, config: &HubConfig) -> Result<(), MutationError> {
    if element.id.trim().is_empty() {
        return Err(MutationError::EmptyElementId);
    }
    for (name, value) in [
        ("x", element.x),
        ("y", element.y),
        ("width", element.width),
        ("height", element.height),
    ] {
        if !value.is_finite() {
            return Err(MutationError::NonFinite(name));
        }
    }
    if element.width < 0.0 || element.height < 0.0 {
        return Err(MutationError::NegativeSize {
            width: element.width,
            height: element.height,
        });
    }
    if !element.data.fits(element.kind) {
        return Err(MutationError::DataMismatch {
            kind: element.kind.as_str(),
        });
    }
    match &element.data {
        ElementData::Path {
            points,
            stroke_width,
            ..
        } => {
            if points.len() > config.max_payload_points {
                return Err(MutationError::TooManyPoints {
                    count: points.len(),
                    max: config.max_payload_points,
                });
            }
            if !stroke_width.is_finite() || points.iter().flatten().any(|c| !c.is_finite()) {
                return Err(MutationError::NonFinite("path"));
            }
        }
        ElementData::Text { font_size, .. } if !font_size.is_finite() => {
            return Err(MutationError::NonFinite("font_size"));
        }
        _ => {}
    }
    Ok(())
}

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Events queued to recipients (one per recipient).
    pub messages_sent: u64,
    /// Events lost to full or closed recipient queues.
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Updated from `&self` on the fan-out path.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn snapshot(&self, active_peers: usize) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers,
        }
    }
}

/// Monitoring view of one room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomInfo {
    pub room_id: RoomId,
    /// Member user ids in join order.
    pub members: Vec<UserId>,
    pub element_count: usize,
    pub stats: BroadcastStats,
}

/// One joined participant as seen by a room.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub profile: UserProfile,
    pub sender: Outbound,
}

/// What a successful join hands back to the caller.
///
/// The same snapshot is queued to the connection as a `sync` event ahead
/// of any later room traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinAccepted {
    pub connection_id: ConnectionId,
    pub elements: Vec<CanvasElement>,
    pub users: Vec<PresenceRecord>,
}

pub(crate) enum JoinReply {
    Accepted(JoinAccepted),
    Rejected(JoinError),
    /// The room shut down before handling the join; retry on a fresh room.
    Closed,
}

pub(crate) enum RoomCommand {
    Join {
        connection: Connection,
        reply: oneshot::Sender<JoinReply>,
    },
    Leave {
        user_id: UserId,
        /// `Some` only removes the member if it is still this connection.
        connection_id: Option<ConnectionId>,
    },
    MutateElement {
        user_id: UserId,
        connection_id: Option<ConnectionId>,
        element: CanvasElement,
    },
    DeleteElement {
        user_id: UserId,
        connection_id: Option<ConnectionId>,
        element_id: ElementId,
    },
    MoveCursor {
        user_id: UserId,
        connection_id: Option<ConnectionId>,
        cursor: CursorPosition,
    },
    Inspect {
        reply: oneshot::Sender<RoomInfo>,
    },
}

impl RoomCommand {
    /// Only joins and leaves change membership; nothing else may close
    /// the room.
    fn changes_membership(&self) -> bool {
        matches!(self, RoomCommand::Join { .. } | RoomCommand::Leave { .. })
    }

    fn kind(&self) -> &'static str {
        match self {
            RoomCommand::Join { .. } => "join",
            RoomCommand::Leave { .. } => "leave",
            RoomCommand::MutateElement { .. } => "element-update",
            RoomCommand::DeleteElement { .. } => "element-delete",
            RoomCommand::MoveCursor { .. } => "cursor-update",
            RoomCommand::Inspect { .. } => "inspect",
        }
    }
}

/// Live rooms by id. The registry inserts, each room removes itself.
pub(crate) type RoomMap = Arc<RwLock<HashMap<RoomId, RoomHandle>>>;

/// Cheap, cloneable address of a room actor.
#[derive(Debug, Clone)]
pub(crate) struct RoomHandle {
    /// Distinguishes successive incarnations of the same room id.
    pub(crate) generation: u64,
    pub(crate) tx: mpsc::Sender<RoomCommand>,
}

enum PendingWrite {
    Upsert(CanvasElement),
    Delete(ElementId),
}

/// Start the actor for `room_id`. The caller registers the handle.
pub(crate) fn spawn_room(
    room_id: RoomId,
    generation: u64,
    config: Arc<HubConfig>,
    store: Option<Arc<dyn ElementStore>>,
    rooms: RoomMap,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel(config.command_capacity.max(1));

    let store = match config.persistence {
        PersistenceMode::Disabled => None,
        _ => store,
    };
    let write_behind = match (&store, config.persistence) {
        (Some(store), PersistenceMode::WriteBehind) => {
            Some(spawn_write_behind(room_id.clone(), store.clone()))
        }
        _ => None,
    };

    let actor = RoomActor {
        room_id,
        generation,
        config,
        snapshot: CanvasSnapshot::new(),
        presence: PresenceTracker::new(),
        connections: HashMap::new(),
        stats: AtomicBroadcastStats::default(),
        store,
        write_behind,
        rooms,
    };
    tokio::spawn(actor.run(rx));

    RoomHandle { generation, tx }
}

struct RoomActor {
    room_id: RoomId,
    generation: u64,
    config: Arc<HubConfig>,
    snapshot: CanvasSnapshot,
    presence: PresenceTracker,
    connections: HashMap<UserId, Connection>,
    stats: AtomicBroadcastStats,
    /// Present only when persistence is enabled.
    store: Option<Arc<dyn ElementStore>>,
    write_behind: Option<mpsc::UnboundedSender<PendingWrite>>,
    rooms: RoomMap,
}

impl RoomActor {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        self.hydrate().await;
        info!(
            "Room {} opened ({} elements)",
            self.room_id,
            self.snapshot.len()
        );

        while let Some(command) = rx.recv().await {
            debug!("Room {}: {}", self.room_id, command.kind());
            let membership = command.changes_membership();
            self.handle(command).await;
            if membership && self.connections.is_empty() {
                break;
            }
        }

        // Refuse new work, then answer whatever was already queued.
        rx.close();
        while let Some(command) = rx.recv().await {
            match command {
                RoomCommand::Join { reply, .. } => {
                    let _ = reply.send(JoinReply::Closed);
                }
                RoomCommand::Inspect { reply } => {
                    let _ = reply.send(self.info());
                }
                _ => {}
            }
        }

        let mut rooms = self.rooms.write().await;
        if rooms.get(&self.room_id).map(|h| h.generation) == Some(self.generation) {
            rooms.remove(&self.room_id);
        }
        info!("Room {} disposed", self.room_id);
    }

    async fn hydrate(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let room_id = self.room_id.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load(&room_id))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
            .and_then(|r| r);
        match loaded {
            Ok(elements) => self.snapshot = CanvasSnapshot::from_elements(elements),
            Err(e) => error!("Room {}: hydration failed, starting empty: {}", self.room_id, e),
        }
    }

    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join { connection, reply } => {
                let result = match self.join(connection) {
                    Ok(accepted) => JoinReply::Accepted(accepted),
                    Err(e) => JoinReply::Rejected(e),
                };
                let _ = reply.send(result);
            }
            RoomCommand::Leave {
                user_id,
                connection_id,
            } => self.leave(&user_id, connection_id),
            RoomCommand::MutateElement {
                user_id,
                connection_id,
                element,
            } => {
                let element_id = element.id.clone();
                if let Err(e) = self.mutate_element(&user_id, connection_id, element).await {
                    warn!(
                        "Room {}: dropped update of {} from {}: {}",
                        self.room_id, element_id, user_id, e
                    );
                }
            }
            RoomCommand::DeleteElement {
                user_id,
                connection_id,
                element_id,
            } => {
                if let Err(e) = self
                    .delete_element(&user_id, connection_id, &element_id)
                    .await
                {
                    warn!(
                        "Room {}: dropped delete of {} from {}: {}",
                        self.room_id, element_id, user_id, e
                    );
                }
            }
            RoomCommand::MoveCursor {
                user_id,
                connection_id,
                cursor,
            } => self.move_cursor(&user_id, connection_id, &cursor),
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.info());
            }
        }
    }

    fn join(&mut self, connection: Connection) -> Result<JoinAccepted, JoinError> {
        let user_id = connection.profile.user_id.clone();
        let replacing = self.connections.contains_key(&user_id);
        if !replacing && self.connections.len() >= self.config.max_peers_per_room {
            warn!("Room {} full, refusing {}", self.room_id, user_id);
            return Err(JoinError::RoomFull);
        }

        let record = self.presence.join(&connection.profile);
        let connection_id = connection.id;
        if let Some(old) = self.connections.insert(user_id.clone(), connection) {
            info!(
                "Room {}: {} reconnected (connection {} replaces {})",
                self.room_id, user_id, connection_id, old.id
            );
        } else {
            info!(
                "Room {}: {} joined ({} members)",
                self.room_id,
                user_id,
                self.connections.len()
            );
        }

        let accepted = JoinAccepted {
            connection_id,
            elements: self.snapshot.ordered(),
            users: self.presence.records(),
        };

        self.send_to(
            &user_id,
            ServerMessage::Sync {
                room_id: self.room_id.clone(),
                elements: accepted.elements.clone(),
                users: accepted.users.clone(),
            },
        );
        self.broadcast(
            ServerMessage::UserJoined {
                room_id: self.room_id.clone(),
                user: record,
            },
            Some(&user_id),
        );
        self.broadcast_presence();

        Ok(accepted)
    }

    fn leave(&mut self, user_id: &str, connection_id: Option<ConnectionId>) {
        let current = match self.connections.get(user_id) {
            Some(conn) => conn.id,
            None => return,
        };
        if connection_id.is_some_and(|id| id != current) {
            debug!(
                "Room {}: ignoring stale disconnect of {} (connection {:?}, current {})",
                self.room_id, user_id, connection_id, current
            );
            return;
        }

        self.connections.remove(user_id);
        self.presence.leave(user_id);
        info!(
            "Room {}: {} left ({} members)",
            self.room_id,
            user_id,
            self.connections.len()
        );

        self.broadcast(
            ServerMessage::UserLeft {
                room_id: self.room_id.clone(),
                user_id: user_id.to_string(),
            },
            None,
        );
        self.broadcast_presence();
    }

    /// `Some(id)` must name the member's current connection; `None` trusts
    /// whichever connection the user holds.
    fn check_sender(
        &self,
        user_id: &str,
        connection_id: Option<ConnectionId>,
    ) -> Result<(), MutationError> {
        let current = self
            .connections
            .get(user_id)
            .map(|conn| conn.id)
            .ok_or(MutationError::NotAMember)?;
        match connection_id {
            Some(sent) if sent != current => Err(MutationError::StaleConnection { sent, current }),
            _ => Ok(()),
        }
    }

    async fn mutate_element(
        &mut self,
        user_id: &str,
        connection_id: Option<ConnectionId>,
        element: CanvasElement,
    ) -> Result<(), MutationError> {
        self.check_sender(user_id, connection_id)?;
        validate_element(&element, &self.config)?;
        if !self.snapshot.contains(&element.id)
            && self.snapshot.len() >= self.config.max_elements_per_room
        {
            return Err(MutationError::TooManyElements(self.snapshot.len()));
        }

        if self.config.persistence == PersistenceMode::WriteThrough {
            self.persist_now(PendingWrite::Upsert(element.clone())).await?;
        }

        self.snapshot.upsert(element.clone());
        if let Some(queue) = &self.write_behind {
            let _ = queue.send(PendingWrite::Upsert(element.clone()));
        }

        self.broadcast(
            ServerMessage::ElementUpdate {
                room_id: self.room_id.clone(),
                user_id: user_id.to_string(),
                element,
                timestamp: now_millis(),
            },
            Some(user_id),
        );
        Ok(())
    }

    async fn delete_element(
        &mut self,
        user_id: &str,
        connection_id: Option<ConnectionId>,
        element_id: &str,
    ) -> Result<(), MutationError> {
        self.check_sender(user_id, connection_id)?;
        if element_id.trim().is_empty() {
            return Err(MutationError::EmptyElementId);
        }
        if !self.snapshot.contains(element_id) {
            debug!(
                "Room {}: delete of unknown element {} from {}",
                self.room_id, element_id, user_id
            );
            return Ok(());
        }

        if self.config.persistence == PersistenceMode::WriteThrough {
            self.persist_now(PendingWrite::Delete(element_id.to_string()))
                .await?;
        }

        self.snapshot.remove(element_id);
        if let Some(queue) = &self.write_behind {
            let _ = queue.send(PendingWrite::Delete(element_id.to_string()));
        }

        self.broadcast(
            ServerMessage::ElementDelete {
                room_id: self.room_id.clone(),
                user_id: user_id.to_string(),
                element_id: element_id.to_string(),
                timestamp: now_millis(),
            },
            Some(user_id),
        );
        Ok(())
    }

    fn move_cursor(&mut self, user_id: &str, connection_id: Option<ConnectionId>, cursor: &CursorPosition) {
        if let Err(e) = self.check_sender(user_id, connection_id) {
            trace!("Room {}: cursor from {} dropped: {}", self.room_id, user_id, e);
            return;
        }
        let Some(record) = self.presence.move_cursor(user_id, cursor) else {
            trace!("Room {}: cursor from non-member {}", self.room_id, user_id);
            return;
        };
        trace!(
            "Room {}: {} cursor ({}, {})",
            self.room_id,
            user_id,
            cursor.x,
            cursor.y
        );
        self.broadcast(
            ServerMessage::CursorUpdate {
                room_id: self.room_id.clone(),
                user: record,
            },
            Some(user_id),
        );
    }

    async fn persist_now(&self, write: PendingWrite) -> Result<(), StoreError> {
        match &self.store {
            Some(store) => persist(store.clone(), self.room_id.clone(), write).await,
            None => Ok(()),
        }
    }

    fn broadcast_presence(&self) {
        self.broadcast(
            ServerMessage::PresenceUpdate {
                room_id: self.room_id.clone(),
                users: self.presence.records(),
            },
            None,
        );
    }

    /// Queue `message` to every member except `exclude`.
    fn broadcast(&self, message: ServerMessage, exclude: Option<&str>) {
        let message = Arc::new(message);
        for (user_id, connection) in &self.connections {
            if exclude == Some(user_id.as_str()) {
                continue;
            }
            self.deliver(connection, message.clone());
        }
    }

    fn send_to(&self, user_id: &str, message: ServerMessage) {
        if let Some(connection) = self.connections.get(user_id) {
            self.deliver(connection, Arc::new(message));
        }
    }

    fn deliver(&self, connection: &Connection, message: Arc<ServerMessage>) {
        match connection.sender.try_send(message) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Room {}: slow consumer {} (connection {}), dropped {}",
                    self.room_id,
                    connection.profile.user_id,
                    connection.id,
                    message.kind()
                );
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Room {}: connection {} gone, dropped {}",
                    self.room_id,
                    connection.id,
                    message.kind()
                );
            }
        }
    }

    fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.room_id.clone(),
            members: self.presence.user_ids(),
            element_count: self.snapshot.len(),
            stats: self.stats.snapshot(self.connections.len()),
        }
    }
}

async fn persist(
    store: Arc<dyn ElementStore>,
    room_id: RoomId,
    write: PendingWrite,
) -> Result<(), StoreError> {
    tokio::task::spawn_blocking(move || match write {
        PendingWrite::Upsert(element) => store.upsert(&room_id, &element),
        PendingWrite::Delete(element_id) => store.delete(&room_id, &element_id),
    })
    .await
    .map_err(|e| StoreError::Unavailable(e.to_string()))?
}

/// Background writer for one room; applies writes in the order accepted.
fn spawn_write_behind(
    room_id: RoomId,
    store: Arc<dyn ElementStore>,
) -> mpsc::UnboundedSender<PendingWrite> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(write) = rx.recv().await {
            if let Err(e) = persist(store.clone(), room_id.clone(), write).await {
                error!("Room {}: write-behind failed: {}", room_id, e);
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ElementKind;

    fn rect(id: &str) -> CanvasElement {
        CanvasElement::new(id, ElementKind::Rectangle, 10.0, 10.0, 50.0, 50.0)
    }

    #[test]
    fn test_valid_element_passes() {
        let config = HubConfig::default();
        let element = rect("r1").with_data(ElementData::Shape {
            fill: "#fff".into(),
            stroke: Some("#000".into()),
        });
        assert!(validate_element(&element, &config).is_ok());
    }

    #[test]
    fn test_rejects_empty_id() {
        let config = HubConfig::default();
        assert_eq!(
            validate_element(&rect("  "), &config),
            Err(MutationError::EmptyElementId)
        );
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let config = HubConfig::default();

        let mut nan = rect("r1");
        nan.x = f32::NAN;
        assert_eq!(
            validate_element(&nan, &config),
            Err(MutationError::NonFinite("x"))
        );

        let mut negative = rect("r1");
        negative.height = -1.0;
        assert!(matches!(
            validate_element(&negative, &config),
            Err(MutationError::NegativeSize { .. })
        ));
    }

    #[test]
    fn test_rejects_payload_for_wrong_kind() {
        let config = HubConfig::default();
        let element = rect("r1").with_data(ElementData::Text {
            text: "hi".into(),
            font_size: 12.0,
            color: None,
        });
        assert_eq!(
            validate_element(&element, &config),
            Err(MutationError::DataMismatch { kind: "rectangle" })
        );
    }

    #[test]
    fn test_rejects_oversized_path() {
        let config = HubConfig {
            max_payload_points: 3,
            ..HubConfig::default()
        };
        let element = CanvasElement::new("p1", ElementKind::Path, 0.0, 0.0, 1.0, 1.0).with_data(
            ElementData::Path {
                points: vec![[0.0, 0.0]; 4],
                stroke: "#000".into(),
                stroke_width: 1.0,
            },
        );
        assert_eq!(
            validate_element(&element, &config),
            Err(MutationError::TooManyPoints { count: 4, max: 3 })
        );
    }

    #[test]
    fn test_rejects_non_finite_path_point() {
        let config = HubConfig::default();
        let element = CanvasElement::new("p1", ElementKind::Path, 0.0, 0.0, 1.0, 1.0).with_data(
            ElementData::Path {
                points: vec![[0.0, 0.0], [f32::INFINITY, 1.0]],
                stroke: "#000".into(),
                stroke_width: 1.0,
            },
        );
        assert_eq!(
            validate_element(&element, &config),
            Err(MutationError::NonFinite("path"))
        );
    }

    fn new_room(rooms: &RoomMap) -> RoomHandle {
        spawn_room(
            "r".into(),
            1,
            Arc::new(HubConfig::default()),
            None,
            rooms.clone(),
        )
    }

    async fn join_as(room: &RoomHandle, user: &str, id: ConnectionId) -> mpsc::Receiver<Arc<ServerMessage>> {
        let (sender, inbox) = mpsc::channel(64);
        let (reply_tx, reply_rx) = oneshot::channel();
        let connection = Connection {
            id,
            profile: UserProfile::new(user, user, "#000"),
            sender,
        };
        room.tx
            .send(RoomCommand::Join {
                connection,
                reply: reply_tx,
            })
            .await
            .unwrap();
        assert!(matches!(reply_rx.await.unwrap(), JoinReply::Accepted(_)));
        inbox
    }

    async fn inspect(room: &RoomHandle) -> RoomInfo {
        let (reply_tx, reply_rx) = oneshot::channel();
        room.tx.send(RoomCommand::Inspect { reply: reply_tx }).await.unwrap();
        reply_rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_inspect_before_first_join_keeps_room_open() {
        let rooms: RoomMap = Arc::new(RwLock::new(HashMap::new()));
        let room = new_room(&rooms);
        rooms.write().await.insert("r".into(), room.clone());

        assert!(inspect(&room).await.members.is_empty());
        let _inbox = join_as(&room, "a", 1).await;

        assert!(!room.tx.is_closed());
        assert_eq!(inspect(&room).await.members, vec!["a"]);
        assert_eq!(rooms.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_replaced_connection_loses_authority() {
        let rooms: RoomMap = Arc::new(RwLock::new(HashMap::new()));
        let room = new_room(&rooms);
        let _old = join_as(&room, "a", 1).await;
        let _new = join_as(&room, "a", 2).await;
        let mut b = join_as(&room, "b", 3).await;
        inspect(&room).await;
        while b.try_recv().is_ok() {}

        for command in [
            RoomCommand::MutateElement {
                user_id: "a".into(),
                connection_id: Some(1),
                element: rect("ghost"),
            },
            RoomCommand::MoveCursor {
                user_id: "a".into(),
                connection_id: Some(1),
                cursor: CursorPosition::new(5.0, 5.0),
            },
            RoomCommand::Leave {
                user_id: "a".into(),
                connection_id: Some(1),
            },
        ] {
            room.tx.send(command).await.unwrap();
        }

        let info = inspect(&room).await;
        assert_eq!(info.element_count, 0);
        assert_eq!(info.members, vec!["a", "b"]);
        assert!(b.try_recv().is_err());

        room.tx
            .send(RoomCommand::MutateElement {
                user_id: "a".into(),
                connection_id: Some(2),
                element: rect("real"),
            })
            .await
            .unwrap();
        assert_eq!(inspect(&room).await.element_count, 1);
        assert_eq!(b.recv().await.unwrap().actor(), Some("a"));
    }

    #[test]
    fn test_hub_config_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.command_capacity, 1024);
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.persistence, PersistenceMode::Disabled);
    }
}
