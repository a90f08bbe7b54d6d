//! Admission integration tests.
//!
//! Runs the real server on an ephemeral port and verifies:
//! - Health check on plain HTTP
//! - First admission fixes a room's password (including the empty one)
//! - Wrong passwords are rejected with 401 before the handshake
//! - Admitted clients share document state through the room
//! - Repeated admission is idempotent (same room identity)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use roomsync::{
    Authorizer, MessageType, PersistenceBinder, RelayServer, RoomRegistry, RoomStore, ServerConfig,
    Shutdown, StoreConfig, SyncMessage,
};

// ─── Harness ─────────────────────────────────────────────────────────────────

struct Gateway {
    addr: SocketAddr,
    shutdown: Shutdown,
    writer_shutdown: Shutdown,
    server_task: tokio::task::JoinHandle<()>,
    writer_task: tokio::task::JoinHandle<()>,
    store: Arc<RoomStore>,
}

impl Gateway {
    async fn start(dir: &tempfile::TempDir) -> Gateway {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            storage_path: dir.path().join("db"),
            ..ServerConfig::default()
        };

        let store = Arc::new(
            RoomStore::open(StoreConfig::for_testing(config.storage_path.clone())).unwrap(),
        );
        let (binder, writer) = PersistenceBinder::new(store.clone(), 1024);
        let registry = Arc::new(RoomRegistry::new(binder, config.broadcast_capacity));
        let authorizer = Arc::new(Authorizer::new(store.clone(), registry));

        let server = RelayServer::bind(config, authorizer).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (shutdown, signal) = Shutdown::new();
        let (writer_shutdown, writer_signal) = Shutdown::new();
        let writer_task = tokio::spawn(writer.run(writer_signal));
        let server_task = tokio::spawn(server.run(signal));

        Gateway {
            addr,
            shutdown,
            writer_shutdown,
            server_task,
            writer_task,
            store,
        }
    }

    /// Mirror the binary's teardown order: close connections first, then
    /// stop the writer so it drains everything they queued.
    async fn stop(self) -> Arc<RoomStore> {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.server_task).await;
        self.writer_shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.writer_task).await;
        self.store
    }

    fn url(&self, room: &str, password: &str) -> String {
        if password.is_empty() {
            format!("ws://{}/{room}", self.addr)
        } else {
            format!("ws://{}/{room}?password={password}", self.addr)
        }
    }
}

async fn connect(
    url: &str,
) -> Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>, WsError>
{
    tokio_tungstenite::connect_async(url).await.map(|(ws, _)| ws)
}

fn encoded_insert(doc: &Doc, text: &str) -> Vec<u8> {
    {
        let mut txn = doc.transact_mut();
        let t = txn.get_or_insert_text("content");
        let len = t.get_string(&txn).len() as u32;
        t.insert(&mut txn, len, text);
    }
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

// ─── Health check ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_check_plain_http() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::start(&dir).await;

    let mut stream = TcpStream::connect(gateway.addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("text/plain"));
    assert!(response.ends_with("okay"));

    gateway.stop().await;
}

// ─── Password scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_room_alpha_password_scenario() {
    // Client A creates alpha with p1; B is rejected with p2; C shares with p1.
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::start(&dir).await;

    let client_a = connect(&gateway.url("alpha", "p1")).await.unwrap();

    let err = connect(&gateway.url("alpha", "p2")).await.unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }

    let client_c = connect(&gateway.url("alpha", "p1")).await.unwrap();

    drop(client_a);
    drop(client_c);
    let store = gateway.stop().await;
    assert_eq!(store.password("alpha").unwrap(), Some("p1".to_string()));
}

#[tokio::test]
async fn test_room_beta_empty_password_stays_open() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::start(&dir).await;

    // Created with no password; another credential-less client gets in
    let a = connect(&gateway.url("beta", "")).await.unwrap();
    let b = connect(&gateway.url("beta", "")).await.unwrap();

    // But a password-bearing client does not match the empty password
    let err = connect(&gateway.url("beta", "sneaky")).await.unwrap_err();
    assert!(matches!(err, WsError::Http(r) if r.status() == 401));

    drop(a);
    drop(b);
    gateway.stop().await;
}

#[tokio::test]
async fn test_wrong_password_never_reaches_sync() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::start(&dir).await;

    connect(&gateway.url("alpha", "right"))
        .await
        .unwrap();

    // The rejected handshake yields an HTTP error, not a socket that could
    // observe sync traffic.
    let err = connect(&gateway.url("alpha", "wrong")).await.unwrap_err();
    assert!(matches!(err, WsError::Http(_)));

    gateway.stop().await;
}

#[tokio::test]
async fn test_default_room_when_path_empty() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::start(&dir).await;

    let ws = connect(&format!("ws://{}/", gateway.addr)).await.unwrap();
    drop(ws);

    let store = gateway.stop().await;
    // The admission claimed the literal default room with an empty password
    assert_eq!(store.password("default").unwrap(), Some(String::new()));
}

#[tokio::test]
async fn test_encoded_and_plus_passwords_match() {
    // The password is compared decoded, so the client that claimed the
    // room with %20 and the one retrying with + present the same secret.
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::start(&dir).await;

    let first = connect(&gateway.url("alpha", "a%20b")).await.unwrap();
    let second = connect(&gateway.url("alpha", "a+b")).await.unwrap();

    let err = connect(&gateway.url("alpha", "ab")).await.unwrap_err();
    assert!(matches!(err, WsError::Http(r) if r.status() == 401));

    drop(first);
    drop(second);
    let store = gateway.stop().await;
    assert_eq!(store.password("alpha").unwrap(), Some("a b".to_string()));
}

// ─── Shared state through a room ─────────────────────────────────────────────

#[tokio::test]
async fn test_admitted_clients_share_document_state() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::start(&dir).await;

    let peer_a = Uuid::new_v4();
    let mut client_a = connect(&gateway.url("alpha", "p1")).await.unwrap();

    // A pushes an update, then pings; the pong proves the update was applied
    // (the server handles one connection's frames in order).
    let doc_a = Doc::new();
    let update = encoded_insert(&doc_a, "hello from A");
    client_a
        .send(Message::Binary(
            SyncMessage::update(peer_a, "alpha", update).encode().unwrap().into(),
        ))
        .await
        .unwrap();
    client_a
        .send(Message::Binary(
            SyncMessage::ping(peer_a, "alpha").encode().unwrap().into(),
        ))
        .await
        .unwrap();
    loop {
        let frame = client_a.next().await.unwrap().unwrap();
        if let Message::Binary(data) = frame {
            let msg = SyncMessage::decode(&data).unwrap();
            if msg.msg_type == MessageType::Pong {
                break;
            }
        }
    }

    // C joins and requests the state it is missing
    let peer_c = Uuid::new_v4();
    let mut client_c = connect(&gateway.url("alpha", "p1")).await.unwrap();
    let sv = StateVector::default().encode_v1();
    client_c
        .send(Message::Binary(
            SyncMessage::sync_step1(peer_c, "alpha", sv).encode().unwrap().into(),
        ))
        .await
        .unwrap();

    let doc_c = Doc::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client_c.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Binary(data) = frame {
            let msg = SyncMessage::decode(&data).unwrap();
            if msg.msg_type == MessageType::SyncStep2 {
                let mut txn = doc_c.transact_mut();
                txn.apply_update(Update::decode_v1(&msg.payload).unwrap())
                    .unwrap();
                break;
            }
        }
    }

    {
        let txn = doc_c.transact();
        let text = txn.get_text("content").unwrap();
        assert_eq!(text.get_string(&txn), "hello from A");
    }

    drop(client_a);
    drop(client_c);
    gateway.stop().await;
}

#[tokio::test]
async fn test_update_fans_out_to_other_peer() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::start(&dir).await;

    let peer_a = Uuid::new_v4();
    let peer_b = Uuid::new_v4();
    let mut client_a = connect(&gateway.url("alpha", "pw")).await.unwrap();
    let mut client_b = connect(&gateway.url("alpha", "pw")).await.unwrap();

    // B identifies itself so the relay can filter its own echoes
    client_b
        .send(Message::Binary(
            SyncMessage::ping(peer_b, "alpha").encode().unwrap().into(),
        ))
        .await
        .unwrap();
    let _pong = client_b.next().await.unwrap().unwrap();

    let doc_a = Doc::new();
    let update = encoded_insert(&doc_a, "broadcast me");
    client_a
        .send(Message::Binary(
            SyncMessage::update(peer_a, "alpha", update.clone())
                .encode()
                .unwrap()
                .into(),
        ))
        .await
        .unwrap();

    // B receives A's update
    let forwarded = loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client_b.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Binary(data) = frame {
            let msg = SyncMessage::decode(&data).unwrap();
            if msg.msg_type == MessageType::Update {
                break msg;
            }
        }
    };
    assert_eq!(forwarded.peer_id, peer_a);
    assert_eq!(forwarded.payload, update);

    drop(client_a);
    drop(client_b);
    gateway.stop().await;
}

#[tokio::test]
async fn test_update_applied_at_shutdown_is_durable() {
    // A frame the server applied right before shutdown must survive: the
    // writer drains only after the connection tasks are gone.
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::start(&dir).await;

    let peer = Uuid::new_v4();
    let mut ws = connect(&gateway.url("alpha", "pw")).await.unwrap();
    let doc = Doc::new();
    let update = encoded_insert(&doc, "parting words");
    ws.send(Message::Binary(
        SyncMessage::update(peer, "alpha", update).encode().unwrap().into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Binary(
        SyncMessage::ping(peer, "alpha").encode().unwrap().into(),
    ))
    .await
    .unwrap();
    // The pong confirms the update was applied server-side
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Binary(data) = frame {
            if SyncMessage::decode(&data).unwrap().msg_type == MessageType::Pong {
                break;
            }
        }
    }

    // Shut down immediately, without waiting for the writer to catch up
    let store = gateway.stop().await;

    let updates = store.load_updates("alpha").unwrap();
    assert!(!updates.is_empty());
    let replay = Doc::new();
    {
        let mut txn = replay.transact_mut();
        txn.apply_update(Update::decode_v1(&updates[0].1).unwrap())
            .unwrap();
    }
    let txn = replay.transact();
    let text = txn.get_text("content").unwrap();
    assert_eq!(text.get_string(&txn), "parting words");
}

// ─── Idempotence ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reconnect_lands_in_same_room() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::start(&dir).await;

    let peer = Uuid::new_v4();

    // First visit writes state
    let mut ws = connect(&gateway.url("alpha", "pw")).await.unwrap();
    let doc = Doc::new();
    let update = encoded_insert(&doc, "sticky");
    ws.send(Message::Binary(
        SyncMessage::update(peer, "alpha", update).encode().unwrap().into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Binary(
        SyncMessage::ping(peer, "alpha").encode().unwrap().into(),
    ))
    .await
    .unwrap();
    let _ = ws.next().await;
    drop(ws);

    // Second visit still sees it — same logical room, not a fresh doc
    let mut ws = connect(&gateway.url("alpha", "pw")).await.unwrap();
    ws.send(Message::Binary(
        SyncMessage::sync_step1(peer, "alpha", StateVector::default().encode_v1())
            .encode()
            .unwrap()
            .into(),
    ))
    .await
    .unwrap();

    let doc2 = Doc::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Binary(data) = frame {
            let msg = SyncMessage::decode(&data).unwrap();
            if msg.msg_type == MessageType::SyncStep2 {
                let mut txn = doc2.transact_mut();
                txn.apply_update(Update::decode_v1(&msg.payload).unwrap())
                    .unwrap();
                break;
            }
        }
    }
    {
        let txn = doc2.transact();
        let text = txn.get_text("content").unwrap();
        assert_eq!(text.get_string(&txn), "sticky");
    }

    drop(ws);
    gateway.stop().await;
}
