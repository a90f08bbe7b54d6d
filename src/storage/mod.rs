//! Durable storage for room documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐    updates      ┌──────────────┐
//! │ RelayServer │ ──────────────► │ RoomStore    │
//! │ (in-memory) │                 │ (RocksDB)    │
//! └──────┬──────┘                 └──────┬───────┘
//!        │                               │
//!        │ on first touch                │ column families
//!        ▼                               ▼
//! ┌─────────────┐     ┌──────────────────────────────────┐
//! │ Yrs Doc     │     │ CF "snapshots" — full doc states  │
//! │ (hydrated)  │     │ CF "updates"   — append-only log  │
//! └─────────────┘     │ CF "auth"      — room passwords   │
//!                     │ CF "meta"      — room metadata    │
//!                     └──────────────────────────────────┘
//! ```
//!
//! All keys are derived from the room name, so the recovery path is stable
//! across process restarts.

pub mod rocks;

pub use rocks::{RoomMetadata, RoomStore, StoreConfig, StoreError};
