//! roomsync server binary.
//!
//! Startup is staged — config, storage, transport — and each stage
//! returns its own result so a fault exits with a non-zero status instead
//! of limping along half-initialized. Shutdown runs in strict order: stop
//! accepting, close connections, drain the append queue, flush storage.

use std::process::ExitCode;
use std::sync::Arc;

use roomsync::{
    Authorizer, PersistenceBinder, RelayServer, RoomRegistry, RoomStore, ServerConfig, Shutdown,
    StoreConfig,
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    // Stage 1: configuration
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Stage 2: durable store
    let store_config = StoreConfig {
        path: config.storage_path.clone(),
        ..StoreConfig::default()
    };
    let store = match RoomStore::open(store_config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            log::error!("Failed to open store at {:?}: {e}", config.storage_path);
            return ExitCode::FAILURE;
        }
    };

    let (binder, writer) = PersistenceBinder::new(store.clone(), config.append_queue_warn_depth);
    let registry = Arc::new(RoomRegistry::new(binder, config.broadcast_capacity));
    let authorizer = Arc::new(Authorizer::new(store.clone(), registry.clone()));

    // Stage 3: transport
    let server = match RelayServer::bind(config.clone(), authorizer).await {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to bind {}: {e}", config.bind_addr());
            return ExitCode::FAILURE;
        }
    };
    let addr = match server.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            log::error!("Failed to read bound address: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("WebSocket server running at http://{addr}");

    // Stage 4: shutdown wiring
    let (shutdown, signal) = Shutdown::new();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Failed to listen for ctrl-c: {e}");
            return;
        }
        log::info!("Shutdown signal received");
        shutdown.trigger();
    });

    // The writer gets its own signal, fired only after every connection
    // task has ended: a task servicing one last frame can still queue an
    // append, and the drain must not start while that is possible.
    let (writer_shutdown, writer_signal) = Shutdown::new();
    let writer_task = tokio::spawn(writer.run(writer_signal));

    // Serve until shutdown; run() returns only after the accept loop has
    // stopped and every connection task has closed.
    server.run(signal).await;

    // No producer is left; drain pending appends, then flush the store.
    writer_shutdown.trigger();
    if let Err(e) = writer_task.await {
        log::warn!("Append writer ended abnormally: {e}");
    }
    if let Err(e) = store.sync() {
        log::warn!("Storage flush failed during shutdown: {e}");
    }

    log::info!("Shutdown complete");
    ExitCode::SUCCESS
}
