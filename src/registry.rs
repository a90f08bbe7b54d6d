//! In-memory registry of live rooms.
//!
//! A room is materialized on the first successful admission for its name
//! and lives for the rest of the process (no eviction — the durable record
//! outlives us, the live handle is cheap, and keeping it avoids rebinding
//! races; a known limitation carried over deliberately).
//!
//! Creation is the one place concurrent callers race: two simultaneous
//! first connections for the same unseen name must not produce two
//! diverging document handles. Creation and hydration therefore run inside
//! a single critical section, held only for that brief window; steady-state
//! lookups take a read lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use yrs::{Doc, Subscription};

use crate::broadcast::BroadcastGroup;
use crate::persistence::{PersistError, PersistenceBinder};

/// A live room: one shared document plus its fan-out group.
pub struct Room {
    name: String,
    /// Authoritative Yrs document, owned by the room while active
    doc: Doc,
    /// Fan-out group for this room's connections
    broadcast: Arc<BroadcastGroup>,
    /// Open connections currently synced to this room
    connections: AtomicUsize,
    /// Keeps the persistence subscription alive for the room's lifetime
    _update_sub: Subscription,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

impl Room {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    /// Record a connection entering sync; returns the new count.
    pub fn connection_opened(&self) -> usize {
        self.connections.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record a connection closing; returns the remaining count.
    pub fn connection_closed(&self) -> usize {
        self.connections.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Counts a connection into a room and counts it out again on drop.
///
/// Connection tasks have several exit paths (clean close, socket error,
/// failed send, shutdown); tying the decrement to drop means none of them
/// can leak a slot in the room's connection count.
pub struct ConnectionGuard {
    room: Arc<Room>,
    peer: SocketAddr,
}

impl ConnectionGuard {
    /// Count `peer` into the room; returns the guard and the new count.
    pub fn open(room: &Arc<Room>, peer: SocketAddr) -> (ConnectionGuard, usize) {
        let open = room.connection_opened();
        (
            ConnectionGuard {
                room: room.clone(),
                peer,
            },
            open,
        )
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.room.connection_closed();
        log::info!(
            "Peer {} left room {} ({remaining} connections remain)",
            self.peer,
            self.room.name()
        );
    }
}

/// Registry mapping room names to live rooms.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Serializes room creation + hydration (held only for that window)
    creation: Mutex<()>,
    binder: Arc<PersistenceBinder>,
    broadcast_capacity: usize,
}

impl RoomRegistry {
    pub fn new(binder: Arc<PersistenceBinder>, broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
            binder,
            broadcast_capacity,
        }
    }

    /// Look up a live room without creating it.
    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Get the live room for `name`, creating and hydrating it if this is
    /// the first activation in this process.
    ///
    /// Idempotent under concurrent first-touch: hydration from durable
    /// storage runs at most once per name per process lifetime, and every
    /// caller gets the same `Arc<Room>`.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Room>, PersistError> {
        // Fast path
        if let Some(room) = self.get(name).await {
            return Ok(room);
        }

        let _guard = self.creation.lock().await;

        // Double-check: another caller may have created it while we waited
        if let Some(room) = self.get(name).await {
            return Ok(room);
        }

        let doc = Doc::new();
        let update_sub = self.binder.bind(name, &doc)?;

        let room = Arc::new(Room {
            name: name.to_string(),
            doc,
            broadcast: Arc::new(BroadcastGroup::new(self.broadcast_capacity)),
            connections: AtomicUsize::new(0),
            _update_sub: update_sub,
        });

        self.rooms
            .write()
            .await
            .insert(name.to_string(), room.clone());
        log::info!("Room {name} created and bound to storage");

        Ok(room)
    }

    /// Snapshot of all live rooms.
    pub async fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    /// Number of live rooms.
    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}
