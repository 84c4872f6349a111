//! Presence tracking for remote cursor visibility.
//!
//! Presence is ephemeral and lossy by design: it is broadcast on its own
//! channel, never persisted, never retried, and entries simply age out when a
//! peer goes silent. Nothing here touches the document.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::RoomId;

/// Entries not refreshed within this window are purged by the sweep, which
/// covers silent disconnects as well as lost leave events.
pub const STALE_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum spacing between outgoing move broadcasts (~20/s).
pub const MOVE_MIN_INTERVAL: Duration = Duration::from_millis(50);

/// Unique identifier for a participating user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cursor position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Display identity announced on join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub name: String,
    pub color: String,
}

/// Presence message types for the network protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PresenceMessage {
    /// User joined the room.
    Join {
        room: RoomId,
        user: UserId,
        name: String,
        color: String,
    },
    /// Pointer moved.
    Move { user: UserId, x: f64, y: f64 },
    /// User leaving gracefully.
    Leave { user: UserId },
    /// Request all peers to announce themselves (on connect).
    RequestAll,
}

/// One remote user's live cursor state.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub user: UserId,
    pub name: String,
    pub color: String,
    pub position: Position,
    pub last_update: Instant,
}

/// Owned table of remote presence entries with explicit lifecycle:
/// join / refresh / sweep / leave.
#[derive(Debug)]
pub struct PresenceTracker {
    local_user: UserId,
    entries: HashMap<UserId, PresenceEntry>,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(local_user: UserId) -> Self {
        Self::with_timeout(local_user, STALE_TIMEOUT)
    }

    pub fn with_timeout(local_user: UserId, timeout: Duration) -> Self {
        Self {
            local_user,
            entries: HashMap::new(),
            timeout,
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    /// Apply one incoming presence message. Our own echoes are ignored.
    pub fn apply(&mut self, msg: &PresenceMessage, now: Instant) {
        match msg {
            PresenceMessage::Join {
                user, name, color, ..
            } => {
                if *user == self.local_user {
                    return;
                }
                self.entries.insert(
                    *user,
                    PresenceEntry {
                        user: *user,
                        name: name.clone(),
                        color: color.clone(),
                        position: Position::new(0.0, 0.0),
                        last_update: now,
                    },
                );
            }
            PresenceMessage::Move { user, x, y } => {
                if *user == self.local_user {
                    return;
                }
                // A move may arrive before the join; show the cursor anyway
                // and fill in identity when the join lands.
                let entry = self.entries.entry(*user).or_insert_with(|| PresenceEntry {
                    user: *user,
                    name: String::new(),
                    color: String::new(),
                    position: Position::new(*x, *y),
                    last_update: now,
                });
                entry.position = Position::new(*x, *y);
                entry.last_update = now;
            }
            PresenceMessage::Leave { user } => {
                self.entries.remove(user);
            }
            PresenceMessage::RequestAll => {}
        }
    }

    /// Purge entries not refreshed within the timeout window. Returns the
    /// users that were evicted.
    pub fn sweep(&mut self, now: Instant) -> Vec<UserId> {
        let timeout = self.timeout;
        let evicted: Vec<UserId> = self
            .entries
            .values()
            .filter(|e| now.duration_since(e.last_update) > timeout)
            .map(|e| e.user)
            .collect();
        for user in &evicted {
            self.entries.remove(user);
        }
        evicted
    }

    /// All live remote cursors, for rendering.
    pub fn active(&self) -> impl Iterator<Item = &PresenceEntry> {
        self.entries.values()
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.entries.contains_key(&user)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

/// Client-side rate limiter for outgoing move broadcasts. Blocked moves are
/// dropped, never queued: presence is best-effort.
#[derive(Debug)]
pub struct MoveThrottle {
    min_interval: Duration,
    last_sent: Option<Instant>,
}

impl MoveThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: None,
        }
    }

    /// Whether a move may be sent now; records the send if allowed.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

impl Default for MoveThrottle {
    fn default() -> Self {
        Self::new(MOVE_MIN_INTERVAL)
    }
}
