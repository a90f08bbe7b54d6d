//! # roomsync — password-gated room gateway for CRDT collaboration
//!
//! Admits WebSocket clients into named, password-protected rooms, each
//! backing one shared Yrs document, and durably persists document state
//! across restarts and reconnects.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  upgrade + password   ┌─────────────┐
//! │ Client   │ ────────────────────► │ RelayServer │
//! └──────────┘                       └──────┬──────┘
//!                                           │ authorize
//!                                    ┌──────▼──────┐     ┌──────────────┐
//!                                    │ Authorizer  │ ──► │ RoomRegistry │
//!                                    └──────┬──────┘     └──────┬───────┘
//!                                           │ durable password  │ hydrate
//!                                    ┌──────▼───────────────────▼───────┐
//!                                    │ RoomStore (RocksDB)              │
//!                                    │ snapshots · updates · auth · meta│
//!                                    └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`] — environment-driven server configuration
//! - [`protocol`] — bincode wire framing for sync messages
//! - [`broadcast`] — per-room fan-out with backpressure
//! - [`registry`] — live room map with single-flight creation
//! - [`auth`] — set-once password admission (fail-closed on store faults)
//! - [`persistence`] — snapshot hydration + append-on-update binding
//! - [`server`] — health endpoint, upgrade handshake, sync relay
//! - [`shutdown`] — cooperative process-wide shutdown signal
//! - [`storage`] — RocksDB-backed durable store

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthError, Authorizer};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use config::{ConfigError, ServerConfig};
pub use persistence::{AppendWriter, PersistError, PersistenceBinder};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use registry::{ConnectionGuard, Room, RoomRegistry};
pub use server::RelayServer;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use storage::{RoomMetadata, RoomStore, StoreConfig, StoreError};
