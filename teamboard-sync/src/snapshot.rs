//! Authoritative in-memory element snapshot of one room.
//!
//! Upsert keyed by element id, last writer wins: a processed update fully
//! replaces the previous entry, no field-level merge and no history. A
//! delete leaves no tombstone, so a later update with the same id simply
//! recreates the element.

use std::collections::HashMap;

use crate::protocol::{CanvasElement, ElementId};

#[derive(Debug, Clone, Default)]
pub struct CanvasSnapshot {
    /// Elements in first-insertion order.
    elements: Vec<CanvasElement>,
    /// id → position in `elements`
    index: HashMap<ElementId, usize>,
}

impl CanvasSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from persisted records; later duplicates win.
    pub fn from_elements(elements: impl IntoIterator<Item = CanvasElement>) -> Self {
        let mut snapshot = Self::new();
        for element in elements {
            snapshot.upsert(element);
        }
        snapshot
    }

    /// Insert or overwrite by id. Returns the replaced element, if any.
    pub fn upsert(&mut self, element: CanvasElement) -> Option<CanvasElement> {
        match self.index.get(&element.id) {
            Some(&pos) => Some(std::mem::replace(&mut self.elements[pos], element)),
            None => {
                self.index.insert(element.id.clone(), self.elements.len());
                self.elements.push(element);
                None
            }
        }
    }

    pub fn remove(&mut self, element_id: &str) -> Option<CanvasElement> {
        let pos = self.index.remove(element_id)?;
        let removed = self.elements.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    pub fn get(&self, element_id: &str) -> Option<&CanvasElement> {
        self.index.get(element_id).map(|&pos| &self.elements[pos])
    }

    pub fn contains(&self, element_id: &str) -> bool {
        self.index.contains_key(element_id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Highest z-index in the snapshot, `None` when empty.
    pub fn max_z_index(&self) -> Option<i64> {
        self.elements.iter().map(|e| e.z_index).max()
    }

    /// Elements in paint order: ascending z-index, ties by insertion.
    pub fn ordered(&self) -> Vec<CanvasElement> {
        let mut ordered = self.elements.clone();
        // stable sort keeps insertion order among equal z-indices
        ordered.sort_by_key(|e| e.z_index);
        ordered
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanvasElement> {
        self.elements.iter()
    }

    pub fn clear(&mut self) {
        self.elements.clear();
        self.index.clear();
    }
}
