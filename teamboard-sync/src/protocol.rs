//! Wire protocol shared by the sync server and its clients.
//!
//! One persistent socket per participant, multiplexed by room (canvas) id.
//! Every frame is a single bincode-encoded message:
//!
//! ```text
//! client ──► server            server ──► client
//! ─────────────────            ─────────────────
//! join                         sync            (full snapshot + presence)
//! leave                        presence-update (full member list)
//! element-update               user-joined / user-left
//! element-delete               element-update / element-delete
//! cursor-update                cursor-update
//!                              join-rejected
//! ```
//!
//! Element and cursor events always carry the acting `user_id` so that a
//! client can recognise (and skip) echoes of its own optimistic edits.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Canvas id. All presence and mutation traffic is partitioned by it.
pub type RoomId = String;
/// Identity supplied by the upstream access-control layer.
pub type UserId = String;
/// Element id, unique within a room.
pub type ElementId = String;
/// Server-assigned identity of one joined socket in one room.
pub type ConnectionId = u64;

// ───────────────────────────────────────────────────────────────────
// Canvas data
// ───────────────────────────────────────────────────────────────────

/// Shape family of a canvas element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Rectangle,
    Ellipse,
    Path,
    Text,
    Note,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Rectangle => "rectangle",
            ElementKind::Ellipse => "ellipse",
            ElementKind::Path => "path",
            ElementKind::Text => "text",
            ElementKind::Note => "note",
        }
    }
}

/// Per-type payload of an element.
///
/// The engine never interprets it beyond checking that it matches the
/// element kind; rendering code owns its meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum ElementData {
    #[default]
    Empty,
    /// Fill/stroke for rectangles and ellipses.
    Shape {
        fill: String,
        stroke: Option<String>,
    },
    /// Freehand stroke points, relative to the element origin.
    Path {
        points: Vec<[f32; 2]>,
        stroke: String,
        stroke_width: f32,
    },
    /// Text body for text and sticky-note elements.
    Text {
        text: String,
        font_size: f32,
        color: Option<String>,
    },
}

impl ElementData {
    /// Whether this payload is valid for an element of `kind`.
    pub fn fits(&self, kind: ElementKind) -> bool {
        match (self, kind) {
            (ElementData::Empty, _) => true,
            (ElementData::Shape { .. }, ElementKind::Rectangle | ElementKind::Ellipse) => true,
            (ElementData::Path { .. }, ElementKind::Path) => true,
            (ElementData::Text { .. }, ElementKind::Text | ElementKind::Note) => true,
            _ => false,
        }
    }
}

/// A single whiteboard element as held in a room snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasElement {
    pub id: ElementId,
    pub kind: ElementKind,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub z_index: i64,
    pub data: ElementData,
}

impl CanvasElement {
    pub fn new(
        id: impl Into<ElementId>,
        kind: ElementKind,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            x,
            y,
            width,
            height,
            z_index: 0,
            data: ElementData::Empty,
        }
    }

    pub fn with_z_index(mut self, z_index: i64) -> Self {
        self.z_index = z_index;
        self
    }

    pub fn with_data(mut self, data: ElementData) -> Self {
        self.data = data;
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Participants
// ───────────────────────────────────────────────────────────────────

/// Display identity of a participant, trusted once authorization passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub user_name: String,
    /// CSS-style color string used for the cursor and selection outline.
    pub color: String,
}

impl UserProfile {
    pub fn new(
        user_id: impl Into<UserId>,
        user_name: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            color: color.into(),
        }
    }
}

/// Live pointer payload of a `cursor-update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CursorPosition {
    pub x: f32,
    pub y: f32,
    pub selected_element_id: Option<ElementId>,
}

impl CursorPosition {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            selected_element_id: None,
        }
    }

    pub fn with_selection(mut self, element_id: impl Into<ElementId>) -> Self {
        self.selected_element_id = Some(element_id.into());
        self
    }
}

/// Ephemeral presence entry; derived from the connection, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub user_name: String,
    pub color: String,
    pub cursor_x: f32,
    pub cursor_y: f32,
    pub selected_element_id: Option<ElementId>,
}

impl PresenceRecord {
    pub fn from_profile(profile: &UserProfile) -> Self {
        Self {
            user_id: profile.user_id.clone(),
            user_name: profile.user_name.clone(),
            color: profile.color.clone(),
            cursor_x: 0.0,
            cursor_y: 0.0,
            selected_element_id: None,
        }
    }

    pub fn apply_cursor(&mut self, cursor: &CursorPosition) {
        self.cursor_x = cursor.x;
        self.cursor_y = cursor.y;
        self.selected_element_id = cursor.selected_element_id.clone();
    }
}

/// Everything the access-control collaborator needs to admit a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub room_id: RoomId,
    pub user: UserProfile,
    /// Opaque session credential checked by the configured `Authorizer`.
    pub token: Option<String>,
}

impl JoinRequest {
    pub fn new(room_id: impl Into<RoomId>, user: UserProfile) -> Self {
        Self {
            room_id: room_id.into(),
            user,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Messages
// ───────────────────────────────────────────────────────────────────

/// Intents sent by a client. None of them is acknowledged except `Join`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Join(JoinRequest),
    Leave {
        room_id: RoomId,
    },
    ElementUpdate {
        room_id: RoomId,
        element: CanvasElement,
    },
    ElementDelete {
        room_id: RoomId,
        element_id: ElementId,
    },
    CursorUpdate {
        room_id: RoomId,
        cursor: CursorPosition,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::Leave { .. } => "leave",
            ClientMessage::ElementUpdate { .. } => "element-update",
            ClientMessage::ElementDelete { .. } => "element-delete",
            ClientMessage::CursorUpdate { .. } => "cursor-update",
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            ClientMessage::Join(request) => &request.room_id,
            ClientMessage::Leave { room_id }
            | ClientMessage::ElementUpdate { room_id, .. }
            | ClientMessage::ElementDelete { room_id, .. }
            | ClientMessage::CursorUpdate { room_id, .. } => room_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

/// Events pushed by the server to the members of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Join response: authoritative snapshot and current presence.
    Sync {
        room_id: RoomId,
        elements: Vec<CanvasElement>,
        users: Vec<PresenceRecord>,
    },
    /// Full member list, sent to every member after a join or leave.
    PresenceUpdate {
        room_id: RoomId,
        users: Vec<PresenceRecord>,
    },
    UserJoined {
        room_id: RoomId,
        user: PresenceRecord,
    },
    UserLeft {
        room_id: RoomId,
        user_id: UserId,
    },
    ElementUpdate {
        room_id: RoomId,
        user_id: UserId,
        element: CanvasElement,
        timestamp: u64,
    },
    ElementDelete {
        room_id: RoomId,
        user_id: UserId,
        element_id: ElementId,
        timestamp: u64,
    },
    /// Incremental presence change of a single member.
    CursorUpdate {
        room_id: RoomId,
        user: PresenceRecord,
    },
    JoinRejected {
        room_id: RoomId,
        reason: String,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Sync { .. } => "sync",
            ServerMessage::PresenceUpdate { .. } => "presence-update",
            ServerMessage::UserJoined { .. } => "user-joined",
            ServerMessage::UserLeft { .. } => "user-left",
            ServerMessage::ElementUpdate { .. } => "element-update",
            ServerMessage::ElementDelete { .. } => "element-delete",
            ServerMessage::CursorUpdate { .. } => "cursor-update",
            ServerMessage::JoinRejected { .. } => "join-rejected",
        }
    }

    pub fn room_id(&self) -> &str {
        match self {
            ServerMessage::Sync { room_id, .. }
            | ServerMessage::PresenceUpdate { room_id, .. }
            | ServerMessage::UserJoined { room_id, .. }
            | ServerMessage::UserLeft { room_id, .. }
            | ServerMessage::ElementUpdate { room_id, .. }
            | ServerMessage::ElementDelete { room_id, .. }
            | ServerMessage::CursorUpdate { room_id, .. }
            | ServerMessage::JoinRejected { room_id, .. } => room_id,
        }
    }

    /// The user whose action produced this event, if any.
    pub fn actor(&self) -> Option<&str> {
        match self {
            ServerMessage::ElementUpdate { user_id, .. }
            | ServerMessage::ElementDelete { user_id, .. }
            | ServerMessage::UserLeft { user_id, .. } => Some(user_id),
            ServerMessage::UserJoined { user, .. } | ServerMessage::CursorUpdate { user, .. } => {
                Some(&user.user_id)
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::Deserialization(format!(
            "{} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(value)
}

/// Wall-clock milliseconds stamped on broadcast mutation events.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
