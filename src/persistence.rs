//! Binds a room's live document to durable storage.
//!
//! On first activation of a room in this process, `bind`:
//! 1. replays the stored snapshot and logged updates into the live doc
//!    (Yrs merges are commutative and idempotent, so replay order and
//!    duplicates are harmless),
//! 2. writes the merged state back as a fresh snapshot and compacts the
//!    updates it covers,
//! 3. subscribes to the doc's update stream so every future mutation is
//!    queued for append before the originating transaction commits.
//!
//! Appends are drained by a single writer task, so per-room append order
//! matches apply order. A failed append is retried with backoff and never
//! tears down the room or a connection; backlog growth is logged so
//! persistence lag is observable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::shutdown::ShutdownSignal;
use crate::storage::{RoomStore, StoreError};

/// Append attempts before an update is abandoned (with an error log).
const APPEND_ATTEMPTS: u32 = 3;

/// Base backoff between append attempts.
const APPEND_BACKOFF: Duration = Duration::from_millis(50);

/// One queued durable append.
struct AppendJob {
    room: String,
    update: Vec<u8>,
}

/// Errors from binding a room to storage.
#[derive(Debug)]
pub enum PersistError {
    /// Durable store failed during hydration or write-back
    Store(StoreError),
    /// Could not subscribe to the document's update stream
    Subscribe(String),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Store(e) => write!(f, "Store error: {e}"),
            PersistError::Subscribe(e) => write!(f, "Subscribe error: {e}"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<StoreError> for PersistError {
    fn from(e: StoreError) -> Self {
        PersistError::Store(e)
    }
}

/// Per-room persistence binding.
///
/// Shared by the room registry; owns the sending side of the append queue.
pub struct PersistenceBinder {
    store: Arc<RoomStore>,
    tx: mpsc::UnboundedSender<AppendJob>,
    queue_depth: Arc<AtomicU64>,
    warn_depth: u64,
}

impl PersistenceBinder {
    /// Create a binder and its writer task half.
    ///
    /// The caller spawns `AppendWriter::run`; the binder is useless without it.
    pub fn new(store: Arc<RoomStore>, warn_depth: u64) -> (Arc<Self>, AppendWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue_depth = Arc::new(AtomicU64::new(0));

        let binder = Arc::new(Self {
            store: store.clone(),
            tx,
            queue_depth: queue_depth.clone(),
            warn_depth,
        });
        let writer = AppendWriter {
            store,
            rx,
            queue_depth,
        };

        (binder, writer)
    }

    /// Hydrate `doc` from durable state and wire its update stream to the
    /// append queue. Called exactly once per room per process activation,
    /// from the registry's creation critical section.
    ///
    /// After this returns, durable state and live state agree, and every
    /// future update on `doc` is queued for append synchronously from the
    /// update callback.
    pub fn bind(&self, name: &str, doc: &Doc) -> Result<Subscription, PersistError> {
        // 1. Replay snapshot + logged updates into the live doc.
        match self.store.load_snapshot(name) {
            Ok(snapshot) => {
                apply_encoded(doc, name, &snapshot);
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let updates = self.store.load_updates(name)?;
        for (seq, update) in &updates {
            log::trace!("Replaying update seq {seq} into room {name}");
            apply_encoded(doc, name, update);
        }

        // 2. Write the merged state back, then drop the updates it covers.
        // This also captures any in-memory state the store never saw.
        let state = {
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        let meta = self.store.save_snapshot(name, &state)?;
        if let Some((last_seq, _)) = updates.last() {
            let removed = self.store.compact_updates(name, *last_seq)?;
            log::debug!("Compacted {removed} replayed updates for room {name}");
        }
        log::info!(
            "Bound room {name} to storage ({} bytes state, {} updates replayed)",
            meta.snapshot_size,
            updates.len()
        );

        // 3. Forward every future update to the writer task.
        let tx = self.tx.clone();
        let queue_depth = self.queue_depth.clone();
        let warn_depth = self.warn_depth;
        let room = name.to_string();

        doc.observe_update_v1(move |_txn, event| {
            let job = AppendJob {
                room: room.clone(),
                update: event.update.clone(),
            };
            if tx.send(job).is_err() {
                // Writer already stopped (shutdown); the update reached the
                // live doc but will not reach storage. Say so.
                log::warn!("Append queue closed; update for room {room} not persisted");
                return;
            }
            let depth = queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
            if depth >= warn_depth && depth % warn_depth == 0 {
                log::warn!("Persistence lagging: {depth} updates queued for append");
            }
        })
        .map_err(|e| PersistError::Subscribe(e.to_string()))
    }

    /// Current append-queue depth (queued, not yet written).
    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }
}

/// Single consumer of the append queue.
///
/// Runs until its stop signal fires, then drains whatever is queued
/// before exiting so no acknowledged update is silently dropped. The
/// signal must be a dedicated one, fired only after every producer has
/// quiesced: connection tasks apply updates until the moment they are
/// joined, and an append queued by a final frame has to land in the
/// drain, not race it.
pub struct AppendWriter {
    store: Arc<RoomStore>,
    rx: mpsc::UnboundedReceiver<AppendJob>,
    queue_depth: Arc<AtomicU64>,
}

impl AppendWriter {
    /// Consume the append queue until the stop signal, then drain and exit.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                job = self.rx.recv() => match job {
                    Some(job) => self.append(job).await,
                    None => break,
                },
                _ = shutdown.recv() => {
                    self.rx.close();
                    let mut drained = 0u64;
                    while let Ok(job) = self.rx.try_recv() {
                        self.append(job).await;
                        drained += 1;
                    }
                    if drained > 0 {
                        log::info!("Drained {drained} queued appends during shutdown");
                    }
                    break;
                }
            }
        }
        log::info!("Append writer stopped");
    }

    /// Write one update, with bounded retry.
    async fn append(&self, job: AppendJob) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);

        for attempt in 1..=APPEND_ATTEMPTS {
            match self.store.append_update(&job.room, &job.update) {
                Ok(seq) => {
                    log::trace!(
                        "Appended update seq {seq} for room {} ({} bytes)",
                        job.room,
                        job.update.len()
                    );
                    return;
                }
                Err(e) => {
                    log::error!(
                        "Append failed for room {} (attempt {attempt}/{APPEND_ATTEMPTS}): {e}",
                        job.room
                    );
                    if attempt < APPEND_ATTEMPTS {
                        tokio::time::sleep(APPEND_BACKOFF * attempt).await;
                    }
                }
            }
        }

        log::error!(
            "Abandoning update for room {} after {APPEND_ATTEMPTS} attempts ({} bytes lost from the log)",
            job.room,
            job.update.len()
        );
    }
}

/// Apply a v1-encoded update to a doc, logging and skipping undecodable data.
fn apply_encoded(doc: &Doc, name: &str, encoded: &[u8]) {
    match Update::decode_v1(encoded) {
        Ok(update) => {
            let mut txn = doc.transact_mut();
            if let Err(e) = txn.apply_update(update) {
                log::warn!("Failed to apply stored update for room {name}: {e}");
            }
        }
        Err(e) => {
            log::warn!("Skipping undecodable stored update for room {name}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use crate::storage::StoreConfig;
    use tempfile::tempdir;
    use yrs::{GetString, Text, WriteTxn};

    fn open_store(dir: &tempfile::TempDir) -> Arc<RoomStore> {
        Arc::new(RoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap())
    }

    fn doc_with_text(content: &str) -> (Doc, Vec<u8>) {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, content);
        }
        let state = {
            let txn = doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        (doc, state)
    }

    fn text_of(doc: &Doc) -> String {
        let txn = doc.transact();
        txn.get_text("content")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_bind_fresh_room_writes_initial_snapshot() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let (binder, _writer) = PersistenceBinder::new(store.clone(), 64);

        let doc = Doc::new();
        let _sub = binder.bind("alpha", &doc).unwrap();

        // A snapshot exists even for an empty fresh room
        assert!(store.load_snapshot("alpha").is_ok());
    }

    #[tokio::test]
    async fn test_bind_replays_snapshot_and_updates() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        // Seed durable state: snapshot "hello" plus an appended update " world"
        let (seed, state) = doc_with_text("hello");
        store.save_snapshot("alpha", &state).unwrap();

        let sv = {
            let txn = seed.transact();
            txn.state_vector()
        };
        {
            let mut txn = seed.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 5, " world");
        }
        let delta = {
            let txn = seed.transact();
            txn.encode_diff_v1(&sv)
        };
        store.append_update("alpha", &delta).unwrap();

        let (binder, _writer) = PersistenceBinder::new(store.clone(), 64);
        let doc = Doc::new();
        let _sub = binder.bind("alpha", &doc).unwrap();

        assert_eq!(text_of(&doc), "hello world");
        // Replayed updates were compacted into the fresh snapshot
        assert!(store.load_updates("alpha").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_updates_after_bind_reach_the_store() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let (binder, writer) = PersistenceBinder::new(store.clone(), 64);

        let (_shutdown, signal) = Shutdown::new();
        let writer_task = tokio::spawn(writer.run(signal));

        let doc = Doc::new();
        let _sub = binder.bind("alpha", &doc).unwrap();

        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, "persist me");
        }

        // Wait for the writer to pick the job up
        let mut appended = Vec::new();
        for _ in 0..100 {
            appended = store.load_updates("alpha").unwrap();
            if !appended.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(appended.len(), 1);
        assert_eq!(binder.queue_depth(), 0);

        // The appended update reproduces the edit on a fresh doc
        let replay = Doc::new();
        apply_encoded(&replay, "alpha", &appended[0].1);
        assert_eq!(text_of(&replay), "persist me");

        writer_task.abort();
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_appends() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let (binder, writer) = PersistenceBinder::new(store.clone(), 64);

        let doc = Doc::new();
        let _sub = binder.bind("alpha", &doc).unwrap();

        // Queue an update before the writer ever runs
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, "queued before shutdown");
        }
        assert_eq!(binder.queue_depth(), 1);

        // Trigger shutdown first, then run the writer: it must still drain
        let (shutdown, signal) = Shutdown::new();
        shutdown.trigger();
        writer.run(signal).await;

        let appended = store.load_updates("alpha").unwrap();
        assert_eq!(appended.len(), 1);
    }

    #[tokio::test]
    async fn test_writer_outlives_connection_level_shutdown() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        let (binder, writer) = PersistenceBinder::new(store.clone(), 64);

        let doc = Doc::new();
        let _sub = binder.bind("alpha", &doc).unwrap();

        // The process-wide signal that stops accepting and closes
        // connections fires first; the writer runs on its own signal and
        // must keep its queue open through the teardown window.
        let (process_shutdown, _process_signal) = Shutdown::new();
        let (writer_shutdown, writer_signal) = Shutdown::new();
        let writer_task = tokio::spawn(writer.run(writer_signal));

        process_shutdown.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // An update applied while connections wind down still gets queued
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, "last frame");
        }

        writer_shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), writer_task)
            .await
            .unwrap()
            .unwrap();

        let appended = store.load_updates("alpha").unwrap();
        assert_eq!(appended.len(), 1);
        let replay = Doc::new();
        apply_encoded(&replay, "alpha", &appended[0].1);
        assert_eq!(text_of(&replay), "last frame");
    }

    #[tokio::test]
    async fn test_hydration_skips_garbage_updates() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        let (_, state) = doc_with_text("intact");
        store.save_snapshot("alpha", &state).unwrap();
        store.append_update("alpha", &[0xFF, 0xFE, 0xFD]).unwrap();

        let (binder, _writer) = PersistenceBinder::new(store.clone(), 64);
        let doc = Doc::new();
        // Garbage in the log must not fail the bind
        let _sub = binder.bind("alpha", &doc).unwrap();
        assert_eq!(text_of(&doc), "intact");
    }
}
