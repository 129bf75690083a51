//! # teamboard-sync: real-time synchronization for shared whiteboards
//!
//! Several users edit one canvas at once, see each other's cursors, and
//! converge on the state held by the server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer       │
//! │ (per user)  │   bincode frames   │                  │
//! └──────┬──────┘                    └────────┬─────────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                    ┌──────────────────┐
//! │ LocalCanvas │                    │ SessionRegistry  │
//! │ (optimistic)│                    └────────┬─────────┘
//! └─────────────┘                             │ one actor per room
//!                                    ┌────────┴─────────┐
//!                                    │ room: snapshot,  │
//!                                    │ presence, fan-out│
//!                                    └──────────────────┘
//! ```
//!
//! Within a room every join, leave and mutation is handled in order by a
//! single task; the last processed update of an element id wins.
//!
//! ## Modules
//!
//! - [`protocol`]: message and element types, binary codec
//! - [`snapshot`]: ordered element snapshot keyed by id
//! - [`presence`]: who is in a room and where their cursor is
//! - [`storage`]: optional durable element store
//! - [`auth`]: join admission
//! - [`hub`]: per-room actor, validation, fan-out
//! - [`registry`]: room lifecycle and intent routing
//! - [`server`]: WebSocket server
//! - [`replica`]: client-side view model
//! - [`client`]: connection state machine with reconnection

pub mod auth;
pub mod client;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod server;
pub mod snapshot;
pub mod storage;

// Re-exports for convenience
pub use auth::{AllowAll, Authorizer, JoinError};
pub use client::{
    ClientConfig, ClientError, ConnectionSignal, ReconnectPolicy, SyncClient, SyncEvent, SyncState,
};
pub use hub::{
    validate_element, BroadcastStats, HubConfig, JoinAccepted, MutationError, Outbound, RoomInfo,
};
pub use presence::{default_color, CursorThrottle, PresenceTracker, RemotePresence};
pub use protocol::{
    CanvasElement, ClientMessage, ConnectionId, CursorPosition, ElementData, ElementId,
    ElementKind, JoinRequest, PresenceRecord, ProtocolError, RoomId, ServerMessage, UserId,
    UserProfile,
};
pub use registry::SessionRegistry;
pub use replica::{LocalCanvas, RemoteChange};
pub use server::{ServerConfig, ServerHandle, ServerStats, SyncServer};
pub use snapshot::CanvasSnapshot;
pub use storage::{ElementStore, MemoryElementStore, PersistenceMode, StoreError};
