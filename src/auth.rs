//! Connection admission: set-once room passwords.
//!
//! The durable password record is the source of truth. It is re-read from
//! the store on every attempt — never trusted from an in-memory copy —
//! because it may have been written by an earlier connection or by another
//! process sharing the storage directory.
//!
//! Policy decisions:
//! - The first admission attempt for a never-claimed name fixes the room's
//!   password to whatever was supplied, including the empty string.
//! - A stored password (even empty) never changes. Empty matches empty.
//! - A store fault fails **closed**: an unreachable store rejects the
//!   connection rather than degrading to "no password".
//!
//! `authorize` is idempotent and is called twice per connection — before
//! the upgrade handshake and again right after it completes. The second
//! call is defense-in-depth against the narrow window in which the room's
//! durable state could change between check and handshake, not a separate
//! algorithm.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::registry::{Room, RoomRegistry};
use crate::storage::RoomStore;

/// Admission errors.
#[derive(Debug)]
pub enum AuthError {
    /// Supplied password does not match the room's. An expected outcome,
    /// not a fault; reported to the caller as 401 / close-4000.
    InvalidPassword { room: String },
    /// Durable store unreachable while authorizing. Fails closed.
    StoreUnavailable { room: String, source: String },
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidPassword { room } => {
                write!(f, "Invalid password for room {room}")
            }
            AuthError::StoreUnavailable { room, source } => {
                write!(f, "Store unavailable while authorizing room {room}: {source}")
            }
        }
    }
}

impl std::error::Error for AuthError {}

/// Decides admission and triggers room creation/hydration.
pub struct Authorizer {
    store: Arc<RoomStore>,
    registry: Arc<RoomRegistry>,
    /// Serializes first-touch password claims so N racing first
    /// connections produce exactly one durable password write.
    first_touch: Mutex<()>,
}

impl Authorizer {
    pub fn new(store: Arc<RoomStore>, registry: Arc<RoomRegistry>) -> Self {
        Self {
            store,
            registry,
            first_touch: Mutex::new(()),
        }
    }

    /// Authorize a caller into a room.
    ///
    /// On success the room is live in the registry (hydrated from storage
    /// if this was its first activation) and returned. On
    /// `InvalidPassword` the attempt is logged for audit; on
    /// `StoreUnavailable` the connection is rejected (fail closed).
    pub async fn authorize(
        &self,
        room_name: &str,
        supplied: &str,
        caller: SocketAddr,
    ) -> Result<Arc<Room>, AuthError> {
        let stored = self.store.password(room_name).map_err(|e| {
            log::error!("Password lookup failed for room {room_name} (caller {caller}): {e}");
            AuthError::StoreUnavailable {
                room: room_name.to_string(),
                source: e.to_string(),
            }
        })?;

        match stored {
            Some(expected) => self.check(room_name, supplied, &expected, caller)?,
            None => {
                // First touch: claim the password under the critical
                // section, re-checking in case another caller won the race.
                let _guard = self.first_touch.lock().await;
                let stored = self
                    .store
                    .set_password_if_absent(room_name, supplied)
                    .map_err(|e| {
                        log::error!(
                            "Password claim failed for room {room_name} (caller {caller}): {e}"
                        );
                        AuthError::StoreUnavailable {
                            room: room_name.to_string(),
                            source: e.to_string(),
                        }
                    })?;
                self.check(room_name, supplied, &stored, caller)?;
            }
        }

        log::info!("Valid password for room {room_name} by user {caller}");

        self.registry.get_or_create(room_name).await.map_err(|e| {
            log::error!("Hydration failed for room {room_name} (caller {caller}): {e}");
            AuthError::StoreUnavailable {
                room: room_name.to_string(),
                source: e.to_string(),
            }
        })
    }

    /// Exact comparison; empty matches empty.
    fn check(
        &self,
        room_name: &str,
        supplied: &str,
        expected: &str,
        caller: SocketAddr,
    ) -> Result<(), AuthError> {
        if supplied == expected {
            return Ok(());
        }
        // Audit line for the rejected attempt; not a fault
        log::info!("Invalid password for room {room_name} by user {caller}");
        Err(AuthError::InvalidPassword {
            room: room_name.to_string(),
        })
    }
}
