//! Session registry: room lifecycle and intent routing.
//!
//! Rooms are created lazily on the first join and dispose of themselves
//! when their last member leaves. The registry itself holds no room state
//! beyond the actor handles; everything else is owned by the actors in
//! [`crate::hub`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::auth::{validate_request, AllowAll, Authorizer, JoinError};
use crate::hub::{
    spawn_room, Connection, HubConfig, JoinAccepted, JoinReply, MutationError, Outbound, RoomCommand,
    RoomHandle, RoomInfo, RoomMap,
};
use crate::protocol::{
    CanvasElement, ConnectionId, CursorPosition, ElementId, JoinRequest, RoomId, ServerMessage,
};
use crate::storage::{ElementStore, PersistenceMode};

/// Attempts to reach a live room before a join gives up.
const JOIN_ATTEMPTS: usize = 3;

pub struct SessionRegistry {
    rooms: RoomMap,
    config: Arc<HubConfig>,
    store: Option<Arc<dyn ElementStore>>,
    authorizer: Arc<dyn Authorizer>,
    next_generation: AtomicU64,
    next_connection: AtomicU64,
}

impl SessionRegistry {
    pub fn new(config: HubConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
            store: None,
            authorizer: Arc::new(AllowAll),
            next_generation: AtomicU64::new(0),
            next_connection: AtomicU64::new(0),
        }
    }

    /// Attach the durable store used by the configured `PersistenceMode`.
    pub fn with_store(mut self, store: Arc<dyn ElementStore>) -> Self {
        if self.config.persistence == PersistenceMode::Disabled {
            warn!("Element store attached but persistence is disabled; it will not be used");
        }
        self.store = Some(store);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// A fresh outbound queue sized by `outbound_capacity`.
    pub fn outbound_channel(&self) -> (Outbound, mpsc::Receiver<Arc<ServerMessage>>) {
        mpsc::channel(self.config.outbound_capacity.max(1))
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Admit a participant into a room.
    ///
    /// Authorization runs before any room is created or contacted. On
    /// success the connection has been registered, the `sync` event is
    /// already queued on `sender`, and the other members have been told.
    /// A second join of the same user id replaces the earlier connection.
    pub async fn join(
        &self,
        request: JoinRequest,
        connection_id: ConnectionId,
        sender: Outbound,
    ) -> Result<JoinAccepted, JoinError> {
        validate_request(&request)?;
        if let Err(e) = self.authorizer.authorize(&request) {
            warn!(
                "Join of {} to {} refused: {}",
                request.user.user_id, request.room_id, e
            );
            return Err(e);
        }

        let JoinRequest { room_id, user, .. } = request;
        for _ in 0..JOIN_ATTEMPTS {
            let room = self.room_for_join(&room_id).await;
            let (reply_tx, reply_rx) = oneshot::channel();
            let command = RoomCommand::Join {
                connection: Connection {
                    id: connection_id,
                    profile: user.clone(),
                    sender: sender.clone(),
                },
                reply: reply_tx,
            };

            if room.tx.send(command).await.is_err() {
                self.evict(&room_id, room.generation).await;
                continue;
            }
            match reply_rx.await {
                Ok(JoinReply::Accepted(accepted)) => return Ok(accepted),
                Ok(JoinReply::Rejected(e)) => return Err(e),
                Ok(JoinReply::Closed) | Err(_) => {
                    debug!("Room {} closed during join, retrying", room_id);
                    self.evict(&room_id, room.generation).await;
                }
            }
        }

        warn!("Room {} unavailable for {}", room_id, user.user_id);
        Err(JoinError::RoomUnavailable)
    }

    /// Explicit leave: removes the user's connection, whichever it is.
    pub async fn leave(&self, room_id: &str, user_id: &str) {
        self.remove_member(room_id, user_id, None).await;
    }

    /// Transport loss of one specific connection. A no-op if the user has
    /// since reconnected on a different connection.
    pub async fn disconnect(&self, room_id: &str, user_id: &str, connection_id: ConnectionId) {
        self.remove_member(room_id, user_id, Some(connection_id))
            .await;
    }

    async fn remove_member(&self, room_id: &str, user_id: &str, connection_id: Option<ConnectionId>) {
        let Some(room) = self.get(room_id).await else {
            return;
        };
        let command = RoomCommand::Leave {
            user_id: user_id.to_string(),
            connection_id,
        };
        if room.tx.send(command).await.is_err() {
            debug!("Leave of {} from closed room {}", user_id, room_id);
        }
    }

    /// Fire-and-forget upsert. Invalid payloads and non-members are
    /// dropped inside the room and never broadcast.
    pub async fn mutate_element(&self, room_id: &str, user_id: &str, element: CanvasElement) {
        self.route(
            room_id,
            RoomCommand::MutateElement {
                user_id: user_id.to_string(),
                connection_id: None,
                element,
            },
        )
        .await;
    }

    /// Like [`SessionRegistry::mutate_element`], but dropped unless
    /// `connection_id` is still the user's current connection.
    pub async fn mutate_element_from(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: ConnectionId,
        element: CanvasElement,
    ) {
        self.route(
            room_id,
            RoomCommand::MutateElement {
                user_id: user_id.to_string(),
                connection_id: Some(connection_id),
                element,
            },
        )
        .await;
    }

    pub async fn delete_element(&self, room_id: &str, user_id: &str, element_id: impl Into<ElementId>) {
        self.route(
            room_id,
            RoomCommand::DeleteElement {
                user_id: user_id.to_string(),
                connection_id: None,
                element_id: element_id.into(),
            },
        )
        .await;
    }

    pub async fn delete_element_from(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: ConnectionId,
        element_id: impl Into<ElementId>,
    ) {
        self.route(
            room_id,
            RoomCommand::DeleteElement {
                user_id: user_id.to_string(),
                connection_id: Some(connection_id),
                element_id: element_id.into(),
            },
        )
        .await;
    }

    /// Ephemeral: never stored, but queued like any other intent so the
    /// final position of a drag always arrives.
    pub async fn move_cursor(&self, room_id: &str, user_id: &str, cursor: CursorPosition) {
        self.route(
            room_id,
            RoomCommand::MoveCursor {
                user_id: user_id.to_string(),
                connection_id: None,
                cursor,
            },
        )
        .await;
    }

    pub async fn move_cursor_from(
        &self,
        room_id: &str,
        user_id: &str,
        connection_id: ConnectionId,
        cursor: CursorPosition,
    ) {
        self.route(
            room_id,
            RoomCommand::MoveCursor {
                user_id: user_id.to_string(),
                connection_id: Some(connection_id),
                cursor,
            },
        )
        .await;
    }

    /// Members, element count and fan-out stats of a live room.
    pub async fn room_info(&self, room_id: &str) -> Option<RoomInfo> {
        let room = self.get(room_id).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        room.tx
            .send(RoomCommand::Inspect { reply: reply_tx })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Intents for rooms that do not exist are dropped: the sender cannot
    /// be a member of them.
    async fn route(&self, room_id: &str, command: RoomCommand) {
        if room_id.trim().is_empty() {
            warn!("Intent dropped: {}", MutationError::EmptyRoomId);
            return;
        }
        let Some(room) = self.get(room_id).await else {
            debug!("Intent for unknown room {} dropped", room_id);
            return;
        };
        if room.tx.send(command).await.is_err() {
            debug!("Intent for closed room {} dropped", room_id);
        }
    }

    async fn get(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn room_for_join(&self, room_id: &RoomId) -> RoomHandle {
        // Fast path: read lock
        if let Some(room) = self.get(room_id).await {
            if !room.tx.is_closed() {
                return room;
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            if !room.tx.is_closed() {
                return room.clone();
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let room = spawn_room(
            room_id.clone(),
            generation,
            self.config.clone(),
            self.store.clone(),
            self.rooms.clone(),
        );
        rooms.insert(room_id.clone(), room.clone());
        info!("Room {} created (generation {})", room_id, generation);
        room
    }

    async fn evict(&self, room_id: &str, generation: u64) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).map(|r| r.generation) == Some(generation) {
            rooms.remove(room_id);
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ElementData, ElementKind, UserId, UserProfile};
    use crate::storage::{MemoryElementStore, StoreError};
    use std::time::Duration;
    use tokio::time::timeout;

    type Inbox = mpsc::Receiver<Arc<ServerMessage>>;

    struct Member {
        user_id: UserId,
        connection_id: ConnectionId,
        inbox: Inbox,
        accepted: JoinAccepted,
    }

    async fn join(registry: &SessionRegistry, room: &str, user: &str) -> Member {
        let (tx, inbox) = registry.outbound_channel();
        let connection_id = registry.next_connection_id();
        let profile = UserProfile::new(user, user.to_uppercase(), "#336699");
        let accepted = registry
            .join(JoinRequest::new(room, profile), connection_id, tx)
            .await
            .unwrap();
        Member {
            user_id: user.to_string(),
            connection_id,
            inbox,
            accepted,
        }
    }

    async fn next(inbox: &mut Inbox) -> Arc<ServerMessage> {
        timeout(Duration::from_secs(2), inbox.recv())
            .await
            .expect("timed out waiting for event")
            .expect("outbound queue closed")
    }

    /// Receive until an event of `kind` shows up.
    async fn next_of(inbox: &mut Inbox, kind: &str) -> Arc<ServerMessage> {
        loop {
            let msg = next(inbox).await;
            if msg.kind() == kind {
                return msg;
            }
        }
    }

    /// Round-trip through the room mailbox so every earlier command is done.
    async fn settle(registry: &SessionRegistry, room: &str) -> Option<RoomInfo> {
        registry.room_info(room).await
    }

    fn drain(inbox: &mut Inbox) -> Vec<Arc<ServerMessage>> {
        let mut out = Vec::new();
        while let Ok(msg) = inbox.try_recv() {
            out.push(msg);
        }
        out
    }

    fn presence_ids(msg: &ServerMessage) -> Vec<String> {
        match msg {
            ServerMessage::PresenceUpdate { users, .. } | ServerMessage::Sync { users, .. } => {
                users.iter().map(|u| u.user_id.clone()).collect()
            }
            other => panic!("expected presence list, got {}", other.kind()),
        }
    }

    fn rect(id: &str) -> CanvasElement {
        CanvasElement::new(id, ElementKind::Rectangle, 10.0, 10.0, 50.0, 50.0)
    }

    async fn wait_for_room_count(registry: &SessionRegistry, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while registry.room_count().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("room count never settled");
    }

    // ── Scenarios ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_first_join_gets_empty_snapshot_and_self_presence() {
        let registry = SessionRegistry::default();
        let mut a = join(&registry, "board-1", "a").await;

        assert!(a.accepted.elements.is_empty());
        let ids: Vec<_> = a.accepted.users.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);

        let sync = next(&mut a.inbox).await;
        assert_eq!(sync.kind(), "sync");
        assert_eq!(presence_ids(&sync), vec!["a"]);
    }

    #[tokio::test]
    async fn test_second_join_updates_everyone() {
        let registry = SessionRegistry::default();
        let mut a = join(&registry, "board-1", "a").await;
        let mut b = join(&registry, "board-1", "b").await;

        assert!(b.accepted.elements.is_empty());

        let joined = next_of(&mut a.inbox, "user-joined").await;
        assert_eq!(joined.actor(), Some("b"));
        let a_view = next_of(&mut a.inbox, "presence-update").await;
        assert_eq!(presence_ids(&a_view), vec!["a", "b"]);

        let b_view = next_of(&mut b.inbox, "presence-update").await;
        assert_eq!(presence_ids(&b_view), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_mutation_reaches_others_but_not_sender() {
        let registry = SessionRegistry::default();
        let mut a = join(&registry, "board-1", "a").await;
        let mut b = join(&registry, "board-1", "b").await;
        settle(&registry, "board-1").await;
        drain(&mut a.inbox);
        drain(&mut b.inbox);

        registry.mutate_element("board-1", "a", rect("r1")).await;

        match &*next_of(&mut b.inbox, "element-update").await {
            ServerMessage::ElementUpdate {
                user_id, element, ..
            } => {
                assert_eq!(user_id, "a");
                assert_eq!(element, &rect("r1"));
            }
            other => panic!("unexpected {}", other.kind()),
        }

        settle(&registry, "board-1").await;
        assert!(drain(&mut a.inbox).is_empty());
    }

    #[tokio::test]
    async fn test_delete_reaches_others_and_clears_snapshot() {
        let registry = SessionRegistry::default();
        let mut a = join(&registry, "board-1", "a").await;
        let _b = join(&registry, "board-1", "b").await;

        registry.mutate_element("board-1", "a", rect("r1")).await;
        registry.delete_element("board-1", "b", "r1").await;

        match &*next_of(&mut a.inbox, "element-delete").await {
            ServerMessage::ElementDelete {
                user_id,
                element_id,
                ..
            } => {
                assert_eq!(user_id, "b");
                assert_eq!(element_id, "r1");
            }
            other => panic!("unexpected {}", other.kind()),
        }
        assert_eq!(settle(&registry, "board-1").await.unwrap().element_count, 0);
    }

    #[tokio::test]
    async fn test_disconnect_then_late_joiner() {
        let registry = SessionRegistry::default();
        let a = join(&registry, "board-1", "a").await;
        let mut b = join(&registry, "board-1", "b").await;

        registry.mutate_element("board-1", "a", rect("r1")).await;
        registry.delete_element("board-1", "b", "r1").await;
        registry
            .disconnect("board-1", &a.user_id, a.connection_id)
            .await;
        settle(&registry, "board-1").await;

        let updates: Vec<_> = drain(&mut b.inbox)
            .into_iter()
            .filter(|m| m.kind() == "presence-update")
            .collect();
        assert_eq!(presence_ids(updates.last().unwrap()), vec!["b"]);

        let c = join(&registry, "board-1", "c").await;
        assert!(c.accepted.elements.iter().all(|e| e.id != "r1"));
        let ids: Vec<_> = c.accepted.users.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    // ── Properties ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_presence_matches_connected_set() {
        let registry = SessionRegistry::default();
        let mut watcher = join(&registry, "r", "w").await;
        let x = join(&registry, "r", "x").await;
        let _y = join(&registry, "r", "y").await;
        registry.leave("r", &x.user_id).await;
        let _z = join(&registry, "r", "z").await;
        settle(&registry, "r").await;

        let last = drain(&mut watcher.inbox)
            .into_iter()
            .filter(|m| m.kind() == "presence-update")
            .last()
            .unwrap();
        assert_eq!(presence_ids(&last), vec!["w", "y", "z"]);
        assert_eq!(
            settle(&registry, "r").await.unwrap().members,
            vec!["w", "y", "z"]
        );
    }

    #[tokio::test]
    async fn test_last_writer_wins_and_late_joiner_sees_it() {
        let registry = SessionRegistry::default();
        let _a = join(&registry, "r", "a").await;
        let _b = join(&registry, "r", "b").await;

        let mut first = rect("r1");
        first.x = 1.0;
        let mut last = rect("r1");
        last.x = 99.0;
        registry.mutate_element("r", "a", first).await;
        registry.mutate_element("r", "b", last.clone()).await;
        registry.mutate_element("r", "b", last.clone()).await;

        let c = join(&registry, "r", "c").await;
        assert_eq!(c.accepted.elements, vec![last]);
    }

    #[tokio::test]
    async fn test_delete_then_update_recreates() {
        let registry = SessionRegistry::default();
        let _a = join(&registry, "r", "a").await;
        registry.mutate_element("r", "a", rect("r1")).await;
        registry.delete_element("r", "a", "r1").await;
        registry.mutate_element("r", "a", rect("r1")).await;

        assert_eq!(settle(&registry, "r").await.unwrap().element_count, 1);
    }

    #[tokio::test]
    async fn test_cursor_not_in_snapshot_and_not_echoed() {
        let registry = SessionRegistry::default();
        let mut a = join(&registry, "r", "a").await;
        let mut b = join(&registry, "r", "b").await;
        settle(&registry, "r").await;
        drain(&mut a.inbox);

        registry
            .move_cursor("r", "a", CursorPosition::new(4.0, 2.0).with_selection("r1"))
            .await;

        match &*next_of(&mut b.inbox, "cursor-update").await {
            ServerMessage::CursorUpdate { user, .. } => {
                assert_eq!(user.user_id, "a");
                assert_eq!((user.cursor_x, user.cursor_y), (4.0, 2.0));
                assert_eq!(user.selected_element_id.as_deref(), Some("r1"));
            }
            other => panic!("unexpected {}", other.kind()),
        }
        let info = settle(&registry, "r").await.unwrap();
        assert_eq!(info.element_count, 0);
        assert!(drain(&mut a.inbox).is_empty());
    }

    // ── Errors and lifecycle ─────────────────────────────────────

    #[tokio::test]
    async fn test_reconnect_replaces_connection() {
        let registry = SessionRegistry::default();
        let old = join(&registry, "r", "a").await;
        let _b = join(&registry, "r", "b").await;
        let new = join(&registry, "r", "a").await;

        let info = settle(&registry, "r").await.unwrap();
        assert_eq!(info.members, vec!["a", "b"]);
        assert_eq!(info.stats.active_peers, 2);

        // the stale socket going away must not evict the new one
        registry.disconnect("r", "a", old.connection_id).await;
        assert_eq!(settle(&registry, "r").await.unwrap().members, vec!["a", "b"]);

        registry.disconnect("r", "a", new.connection_id).await;
        assert_eq!(settle(&registry, "r").await.unwrap().members, vec!["b"]);
    }

    #[tokio::test]
    async fn test_replaced_connection_cannot_write_or_leave() {
        let registry = SessionRegistry::default();
        let old = join(&registry, "r", "a").await;
        let new = join(&registry, "r", "a").await;
        let mut b = join(&registry, "r", "b").await;
        settle(&registry, "r").await;
        drain(&mut b.inbox);

        registry
            .mutate_element_from("r", "a", old.connection_id, rect("ghost"))
            .await;
        registry
            .delete_element_from("r", "a", old.connection_id, "ghost")
            .await;
        registry
            .move_cursor_from("r", "a", old.connection_id, CursorPosition::new(1.0, 1.0))
            .await;
        registry.disconnect("r", "a", old.connection_id).await;

        let info = settle(&registry, "r").await.unwrap();
        assert_eq!(info.element_count, 0);
        assert_eq!(info.members, vec!["a", "b"]);
        assert!(drain(&mut b.inbox).is_empty());

        registry
            .mutate_element_from("r", "a", new.connection_id, rect("real"))
            .await;
        let update = next_of(&mut b.inbox, "element-update").await;
        assert_eq!(update.actor(), Some("a"));
        assert_eq!(settle(&registry, "r").await.unwrap().element_count, 1);
    }

    #[tokio::test]
    async fn test_cursor_burst_delivers_final_position() {
        let registry = SessionRegistry::new(HubConfig {
            command_capacity: 1,
            ..HubConfig::default()
        });
        let _a = join(&registry, "r", "a").await;
        let mut b = join(&registry, "r", "b").await;
        settle(&registry, "r").await;
        drain(&mut b.inbox);

        for i in 0..100 {
            registry
                .move_cursor("r", "a", CursorPosition::new(i as f32, 0.0))
                .await;
        }
        settle(&registry, "r").await;

        let cursors: Vec<_> = drain(&mut b.inbox)
            .into_iter()
            .filter_map(|m| match &*m {
                ServerMessage::CursorUpdate { user, .. } => Some(user.cursor_x),
                _ => None,
            })
            .collect();
        assert_eq!(cursors.len(), 100);
        assert_eq!(cursors.last(), Some(&99.0));
    }

    #[tokio::test]
    async fn test_unauthorized_join_exposes_nothing() {
        let authorizer = |req: &JoinRequest| match req.token.as_deref() {
            Some("letmein") => Ok(()),
            _ => Err(JoinError::Unauthorized("missing token".into())),
        };
        let registry = SessionRegistry::default().with_authorizer(Arc::new(authorizer));
        let (tx, mut inbox) = registry.outbound_channel();

        let result = registry
            .join(
                JoinRequest::new("r", UserProfile::new("m", "Mallory", "#000")),
                registry.next_connection_id(),
                tx,
            )
            .await;

        assert!(matches!(result, Err(JoinError::Unauthorized(_))));
        assert_eq!(registry.room_count().await, 0);
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_room_full_refuses_new_users_only() {
        let registry = SessionRegistry::new(HubConfig {
            max_peers_per_room: 1,
            ..HubConfig::default()
        });
        let _a = join(&registry, "r", "a").await;

        let (tx, _inbox) = registry.outbound_channel();
        let refused = registry
            .join(
                JoinRequest::new("r", UserProfile::new("b", "B", "#000")),
                registry.next_connection_id(),
                tx,
            )
            .await;
        assert_eq!(refused, Err(JoinError::RoomFull));

        // a reconnect of the present user still succeeds
        let again = join(&registry, "r", "a").await;
        assert_eq!(again.accepted.users.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_mutation_is_dropped() {
        let registry = SessionRegistry::default();
        let _a = join(&registry, "r", "a").await;
        let mut b = join(&registry, "r", "b").await;
        settle(&registry, "r").await;
        drain(&mut b.inbox);

        let mut broken = rect("r1");
        broken.width = f32::NAN;
        registry.mutate_element("r", "a", broken).await;
        let mismatched = rect("r2").with_data(ElementData::Text {
            text: "x".into(),
            font_size: 10.0,
            color: None,
        });
        registry.mutate_element("r", "a", mismatched).await;

        assert_eq!(settle(&registry, "r").await.unwrap().element_count, 0);
        assert!(drain(&mut b.inbox).is_empty());
    }

    #[tokio::test]
    async fn test_non_member_mutation_is_dropped() {
        let registry = SessionRegistry::default();
        let mut a = join(&registry, "r", "a").await;
        settle(&registry, "r").await;
        drain(&mut a.inbox);

        registry.mutate_element("r", "intruder", rect("r1")).await;
        registry.mutate_element("elsewhere", "a", rect("r1")).await;

        assert_eq!(settle(&registry, "r").await.unwrap().element_count, 0);
        assert!(drain(&mut a.inbox).is_empty());
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let registry = SessionRegistry::default();
        let _a = join(&registry, "one", "a").await;
        let mut b = join(&registry, "two", "b").await;
        settle(&registry, "two").await;
        drain(&mut b.inbox);

        registry.mutate_element("one", "a", rect("r1")).await;

        assert_eq!(settle(&registry, "one").await.unwrap().element_count, 1);
        assert_eq!(settle(&registry, "two").await.unwrap().element_count, 0);
        assert!(drain(&mut b.inbox).is_empty());
        assert_eq!(registry.active_rooms().await, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_empty_room_is_disposed_and_recreated() {
        let registry = SessionRegistry::default();
        let a = join(&registry, "r", "a").await;
        registry.mutate_element("r", "a", rect("r1")).await;
        registry.leave("r", &a.user_id).await;

        wait_for_room_count(&registry, 0).await;
        assert!(registry.room_info("r").await.is_none());

        // in-memory only: the new incarnation starts empty
        let b = join(&registry, "r", "b").await;
        assert!(b.accepted.elements.is_empty());
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_are_counted() {
        let registry = SessionRegistry::new(HubConfig {
            outbound_capacity: 4,
            ..HubConfig::default()
        });
        let _a = join(&registry, "r", "a").await;
        // b never reads its queue
        let _b = join(&registry, "r", "b").await;

        for i in 0..20 {
            registry.mutate_element("r", "a", rect(&format!("e{i}"))).await;
        }

        let info = settle(&registry, "r").await.unwrap();
        assert_eq!(info.element_count, 20);
        assert!(info.stats.messages_dropped > 0);
    }

    // ── Persistence ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_write_through_hydrates_next_incarnation() {
        let store = Arc::new(MemoryElementStore::new());
        let registry = SessionRegistry::new(HubConfig {
            persistence: PersistenceMode::WriteThrough,
            ..HubConfig::default()
        })
        .with_store(store.clone());

        let a = join(&registry, "r", "a").await;
        registry
            .mutate_element("r", "a", rect("low").with_z_index(1))
            .await;
        registry
            .mutate_element("r", "a", rect("high").with_z_index(5))
            .await;
        settle(&registry, "r").await;
        assert_eq!(store.element_count("r"), 2);

        registry.leave("r", &a.user_id).await;
        wait_for_room_count(&registry, 0).await;

        let b = join(&registry, "r", "b").await;
        let ids: Vec<_> = b.accepted.elements.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["low", "high"]);
    }

    struct FailingStore;

    impl ElementStore for FailingStore {
        fn load(&self, _room_id: &str) -> Result<Vec<CanvasElement>, StoreError> {
            Ok(Vec::new())
        }

        fn upsert(&self, _room_id: &str, _element: &CanvasElement) -> Result<(), StoreError> {
            Err(StoreError::Write("disk full".into()))
        }

        fn delete(&self, _room_id: &str, _element_id: &str) -> Result<(), StoreError> {
            Err(StoreError::Write("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_write_through_failure_rejects_mutation() {
        let registry = SessionRegistry::new(HubConfig {
            persistence: PersistenceMode::WriteThrough,
            ..HubConfig::default()
        })
        .with_store(Arc::new(FailingStore));
        let _a = join(&registry, "r", "a").await;
        let mut b = join(&registry, "r", "b").await;
        settle(&registry, "r").await;
        drain(&mut b.inbox);

        registry.mutate_element("r", "a", rect("r1")).await;

        assert_eq!(settle(&registry, "r").await.unwrap().element_count, 0);
        assert!(drain(&mut b.inbox).is_empty());
    }

    #[tokio::test]
    async fn test_write_behind_failure_still_broadcasts() {
        let registry = SessionRegistry::new(HubConfig {
            persistence: PersistenceMode::WriteBehind,
            ..HubConfig::default()
        })
        .with_store(Arc::new(FailingStore));
        let _a = join(&registry, "r", "a").await;
        let mut b = join(&registry, "r", "b").await;

        registry.mutate_element("r", "a", rect("r1")).await;

        let update = next_of(&mut b.inbox, "element-update").await;
        assert_eq!(update.actor(), Some("a"));
        assert_eq!(settle(&registry, "r").await.unwrap().element_count, 1);
    }

    #[tokio::test]
    async fn test_write_behind_reaches_store() {
        let store = Arc::new(MemoryElementStore::new());
        let registry = SessionRegistry::new(HubConfig {
            persistence: PersistenceMode::WriteBehind,
            ..HubConfig::default()
        })
        .with_store(store.clone());
        let _a = join(&registry, "r", "a").await;

        registry.mutate_element("r", "a", rect("r1")).await;
        registry.mutate_element("r", "a", rect("r2")).await;
        registry.delete_element("r", "a", "r1").await;

        timeout(Duration::from_secs(2), async {
            while !matches!(store.load("r").as_deref(), Ok([only]) if only.id == "r2") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("write-behind never caught up");
    }
}
