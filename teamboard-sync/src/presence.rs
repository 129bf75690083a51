//! Presence: who is in a room and where their pointer is.
//!
//! ```text
//!  cursor-update (client)
//!        │
//!        ▼
//!  PresenceTracker::move_cursor()      server, one per room, owned by the hub
//!        │
//!        ▼   cursor-update (server, to the other members)
//!  RemotePresence::apply()             client, inside the local replica
//! ```
//!
//! Presence is ephemeral: entries vanish the moment a member leaves or
//! disconnects, and a newly joined client is reseeded with the full list.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{CursorPosition, PresenceRecord, ServerMessage, UserId, UserProfile};

// ───────────────────────────────────────────────────────────────────
// Server side
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct TrackedUser {
    /// Join sequence number; fixes the listing order.
    seq: u64,
    record: PresenceRecord,
}

/// Per-room map from user id to last known cursor and selection.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    users: HashMap<UserId, TrackedUser>,
    next_seq: u64,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `profile`. A user that is already present keeps its place
    /// in the listing but gets a fresh record (last join wins).
    pub fn join(&mut self, profile: &UserProfile) -> PresenceRecord {
        let record = PresenceRecord::from_profile(profile);
        let seq = match self.users.get(&profile.user_id) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.users.insert(
            profile.user_id.clone(),
            TrackedUser {
                seq,
                record: record.clone(),
            },
        );
        record
    }

    pub fn leave(&mut self, user_id: &str) -> Option<PresenceRecord> {
        self.users.remove(user_id).map(|u| u.record)
    }

    /// Update the pointer of a present user; unknown users are ignored.
    pub fn move_cursor(&mut self, user_id: &str, cursor: &CursorPosition) -> Option<PresenceRecord> {
        let user = self.users.get_mut(user_id)?;
        user.record.apply_cursor(cursor);
        Some(user.record.clone())
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.users.get(user_id).map(|u| &u.record)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    /// All records in join order.
    pub fn records(&self) -> Vec<PresenceRecord> {
        let mut users: Vec<&TrackedUser> = self.users.values().collect();
        users.sort_by_key(|u| u.seq);
        users.into_iter().map(|u| u.record.clone()).collect()
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        self.records().into_iter().map(|r| r.user_id).collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Client side
// ───────────────────────────────────────────────────────────────────

/// The local client's view of the other members of its room.
///
/// Our own record is never stored; events about ourselves are skipped.
#[derive(Debug, Clone)]
pub struct RemotePresence {
    local_user_id: UserId,
    peers: HashMap<UserId, PresenceRecord>,
    /// Member order as last reported by the server.
    order: Vec<UserId>,
}

impl RemotePresence {
    pub fn new(local_user_id: impl Into<UserId>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            peers: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Replace everything with a full member list (`sync`/`presence-update`).
    pub fn reseed(&mut self, users: &[PresenceRecord]) {
        self.peers.clear();
        self.order.clear();
        for user in users {
            if user.user_id == self.local_user_id {
                continue;
            }
            self.order.push(user.user_id.clone());
            self.peers.insert(user.user_id.clone(), user.clone());
        }
    }

    /// Apply one presence-bearing server event. Returns whether anything
    /// visible changed.
    pub fn apply(&mut self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::Sync { users, .. } | ServerMessage::PresenceUpdate { users, .. } => {
                self.reseed(users);
                true
            }
            ServerMessage::UserJoined { user, .. } | ServerMessage::CursorUpdate { user, .. } => {
                self.upsert(user.clone())
            }
            ServerMessage::UserLeft { user_id, .. } => self.remove(user_id),
            _ => false,
        }
    }

    fn upsert(&mut self, record: PresenceRecord) -> bool {
        if record.user_id == self.local_user_id {
            return false;
        }
        if !self.peers.contains_key(&record.user_id) {
            self.order.push(record.user_id.clone());
        }
        self.peers.insert(record.user_id.clone(), record);
        true
    }

    fn remove(&mut self, user_id: &str) -> bool {
        if self.peers.remove(user_id).is_none() {
            return false;
        }
        self.order.retain(|id| id != user_id);
        true
    }

    pub fn peer(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.peers.get(user_id)
    }

    /// Remote members in server order.
    pub fn peers(&self) -> Vec<&PresenceRecord> {
        self.order.iter().filter_map(|id| self.peers.get(id)).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.order.clear();
    }
}

/// Minimum-interval gate for outgoing cursor intents.
///
/// The protocol does not require throttling; this is for callers that
/// produce pointer events at display rate.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl CursorThrottle {
    /// 33 ms, roughly 30 updates per second.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(33);

    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Returns `true` (and arms the gate) if a cursor update may go out now.
    pub fn ready(&mut self) -> bool {
        self.ready_at(Instant::now())
    }

    fn ready_at(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

// ───────────────────────────────────────────────────────────────────
// Colors
// ───────────────────────────────────────────────────────────────────

/// Stable, vivid `#rrggbb` color for a user that did not pick one.
///
/// Hue comes from an FNV-1a hash of the id, so the same user always gets
/// the same color on every client.
pub fn default_color(user_id: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in user_id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
