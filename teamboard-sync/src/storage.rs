//! Durable persistence collaborator.
//!
//! The live engine never depends on a store; when one is configured the
//! hub hydrates new rooms from it and mirrors accepted mutations into it
//! according to [`PersistenceMode`].

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::protocol::{CanvasElement, ElementId, RoomId};

/// How accepted mutations reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceMode {
    /// Snapshot lives in memory only.
    #[default]
    Disabled,
    /// Persist before applying; a failed write rejects the mutation.
    WriteThrough,
    /// Apply and broadcast first, persist from a background task.
    WriteBehind,
}

impl PersistenceMode {
    /// Parse the `TEAMBOARD_PERSISTENCE` spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Some(PersistenceMode::Disabled),
            "write-through" | "writethrough" => Some(PersistenceMode::WriteThrough),
            "write-behind" | "writebehind" => Some(PersistenceMode::WriteBehind),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PersistenceMode::Disabled => "disabled",
            PersistenceMode::WriteThrough => "write-through",
            PersistenceMode::WriteBehind => "write-behind",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write failed: {0}")]
    Write(String),
}

/// Element records per room, ordered by z-index.
pub trait ElementStore: Send + Sync {
    /// All elements of `room_id` in ascending z-index order.
    fn load(&self, room_id: &str) -> Result<Vec<CanvasElement>, StoreError>;

    fn upsert(&self, room_id: &str, element: &CanvasElement) -> Result<(), StoreError>;

    /// Deleting a missing element is not an error.
    fn delete(&self, room_id: &str, element_id: &str) -> Result<(), StoreError>;
}

/// Process-local store, for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryElementStore {
    rooms: RwLock<HashMap<RoomId, HashMap<ElementId, CanvasElement>>>,
}

impl MemoryElementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored elements in `room_id`.
    pub fn element_count(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .map(|rooms| rooms.get(room_id).map_or(0, HashMap::len))
            .unwrap_or(0)
    }
}

impl ElementStore for MemoryElementStore {
    fn load(&self, room_id: &str) -> Result<Vec<CanvasElement>, StoreError> {
        let rooms = self
            .rooms
            .read()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut elements: Vec<CanvasElement> = rooms
            .get(room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default();
        // id as tie-breaker so equal z-indices load deterministically
        elements.sort_by(|a, b| a.z_index.cmp(&b.z_index).then_with(|| a.id.cmp(&b.id)));
        Ok(elements)
    }

    fn upsert(&self, room_id: &str, element: &CanvasElement) -> Result<(), StoreError> {
        let mut rooms = self
            .rooms
            .write()
            .map_err(|e| StoreError::Write(e.to_string()))?;
        rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(element.id.clone(), element.clone());
        Ok(())
    }

    fn delete(&self, room_id: &str, element_id: &str) -> Result<(), StoreError> {
        let mut rooms = self
            .rooms
            .write()
            .map_err(|e| StoreError::Write(e.to_string()))?;
        if let Some(room) = rooms.get_mut(room_id) {
            room.remove(element_id);
            if room.is_empty() {
                rooms.remove(room_id);
            }
        }
        Ok(())
    }
}
