//! Client-side view model of one room.
//!
//! Local edits land here first (optimistic) and produce the intent to
//! send; remote events are merged by element id. A `sync` from the server
//! replaces everything, pending local state included.

use crate::presence::RemotePresence;
use crate::protocol::{
    CanvasElement, ClientMessage, CursorPosition, ElementId, ElementKind, PresenceRecord, RoomId,
    ServerMessage, UserId,
};
use crate::snapshot::CanvasSnapshot;

/// What a remote event did to the view.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    /// Snapshot and presence replaced wholesale.
    Synced,
    ElementChanged(ElementId),
    ElementRemoved(ElementId),
    PresenceChanged,
    CursorMoved(UserId),
    Rejected(String),
}

/// Fresh, collision-free element id.
pub fn new_element_id() -> ElementId {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone)]
pub struct LocalCanvas {
    room_id: RoomId,
    user_id: UserId,
    elements: CanvasSnapshot,
    presence: RemotePresence,
}

impl LocalCanvas {
    pub fn new(room_id: impl Into<RoomId>, user_id: impl Into<UserId>) -> Self {
        let user_id = user_id.into();
        Self {
            room_id: room_id.into(),
            presence: RemotePresence::new(user_id.clone()),
            user_id,
            elements: CanvasSnapshot::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    // ── Local edits ──────────────────────────────────────────────

    /// A new element above everything currently in view.
    pub fn new_element(&self, kind: ElementKind, x: f32, y: f32, width: f32, height: f32) -> CanvasElement {
        CanvasElement::new(new_element_id(), kind, x, y, width, height).with_z_index(self.next_z_index())
    }

    pub fn apply_local_update(&mut self, element: CanvasElement) -> ClientMessage {
        self.elements.upsert(element.clone());
        ClientMessage::ElementUpdate {
            room_id: self.room_id.clone(),
            element,
        }
    }

    pub fn apply_local_delete(&mut self, element_id: &str) -> ClientMessage {
        self.elements.remove(element_id);
        ClientMessage::ElementDelete {
            room_id: self.room_id.clone(),
            element_id: element_id.to_string(),
        }
    }

    /// Raise an element above all others. `None` if it is not in view or
    /// already strictly on top.
    pub fn bring_to_front(&mut self, element_id: &str) -> Option<ClientMessage> {
        let current = self.elements.get(element_id)?;
        let on_top = self
            .elements
            .iter()
            .all(|e| e.id == element_id || e.z_index < current.z_index);
        if on_top {
            return None;
        }
        let raised = current.clone().with_z_index(self.next_z_index());
        Some(self.apply_local_update(raised))
    }

    /// Cursors are not part of local state; this only builds the intent.
    pub fn cursor_intent(&self, cursor: CursorPosition) -> ClientMessage {
        ClientMessage::CursorUpdate {
            room_id: self.room_id.clone(),
            cursor,
        }
    }

    fn next_z_index(&self) -> i64 {
        self.elements.max_z_index().map_or(0, |z| z + 1)
    }

    // ── Remote events ────────────────────────────────────────────

    /// Merge one server event. Echoes of our own edits and events for
    /// other rooms are ignored.
    pub fn apply_remote(&mut self, message: &ServerMessage) -> Option<RemoteChange> {
        if message.room_id() != self.room_id {
            return None;
        }

        match message {
            ServerMessage::Sync {
                elements, users, ..
            } => {
                self.replace_with_snapshot(elements.clone(), users);
                Some(RemoteChange::Synced)
            }
            ServerMessage::ElementUpdate {
                user_id, element, ..
            } => {
                if *user_id == self.user_id {
                    return None;
                }
                self.elements.upsert(element.clone());
                Some(RemoteChange::ElementChanged(element.id.clone()))
            }
            ServerMessage::ElementDelete {
                user_id,
                element_id,
                ..
            } => {
                if *user_id == self.user_id {
                    return None;
                }
                self.elements
                    .remove(element_id)
                    .map(|_| RemoteChange::ElementRemoved(element_id.clone()))
            }
            ServerMessage::CursorUpdate { user, .. } => self
                .presence
                .apply(message)
                .then(|| RemoteChange::CursorMoved(user.user_id.clone())),
            ServerMessage::PresenceUpdate { .. }
            | ServerMessage::UserJoined { .. }
            | ServerMessage::UserLeft { .. } => self
                .presence
                .apply(message)
                .then_some(RemoteChange::PresenceChanged),
            ServerMessage::JoinRejected { reason, .. } => Some(RemoteChange::Rejected(reason.clone())),
        }
    }

    /// Overwrite local state with the authoritative snapshot; no merge.
    pub fn replace_with_snapshot(&mut self, elements: Vec<CanvasElement>, users: &[PresenceRecord]) {
        self.elements = CanvasSnapshot::from_elements(elements);
        self.presence.reseed(users);
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn element(&self, element_id: &str) -> Option<&CanvasElement> {
        self.elements.get(element_id)
    }

    /// Elements in paint order.
    pub fn elements(&self) -> Vec<CanvasElement> {
        self.elements.ordered()
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn presence(&self) -> &RemotePresence {
        &self.presence
    }

    /// Other members of the room, in server order.
    pub fn peers(&self) -> Vec<PresenceRecord> {
        self.presence.peers().into_iter().cloned().collect()
    }
}
