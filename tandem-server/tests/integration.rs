//! End-to-end tests over real WebSocket connections.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tandem_collab::{
    AccessLevel, Anarchy, Authenticator, BinderConfig, Curator, CuratorConfig, Document,
    MemoryStore, Store, TokenTable,
};
use tandem_server::{Server, ServerConfig, ServerResponse};
use tandem_text::Transform;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const TIMEOUT: Duration = Duration::from_secs(3);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    curator: Arc<Curator>,
}

async fn start_server(auth: Arc<dyn Authenticator>) -> TestServer {
    start_server_with(auth, ServerConfig::default()).await
}

async fn start_server_with(auth: Arc<dyn Authenticator>, config: ServerConfig) -> TestServer {
    let store = Arc::new(MemoryStore::new());
    let curator_config = CuratorConfig {
        binder: BinderConfig {
            flush_period_ms: 20,
            ..Default::default()
        },
    };
    let curator = Arc::new(Curator::new(curator_config, auth, store.clone()));
    let server = Server::with_curator(config, curator.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestServer {
        addr,
        store,
        curator,
    }
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, request: Value) {
    ws.send(WsMessage::Text(request.to_string().into()))
        .await
        .unwrap();
}

async fn recv(ws: &mut Ws) -> ServerResponse {
    loop {
        let frame = timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Open `document_id` for editing and return the connection and base version.
async fn join(addr: SocketAddr, user_id: &str, document_id: &str) -> (Ws, i64) {
    let mut ws = connect(addr).await;
    send(
        &mut ws,
        json!({"command": "edit", "user_id": user_id, "document_id": document_id}),
    )
    .await;
    match recv(&mut ws).await {
        ServerResponse::Document { document, version } => {
            assert_eq!(document.id, document_id);
            (ws, version)
        }
        other => panic!("expected document, got {other:?}"),
    }
}

fn seed(store: &MemoryStore, content: &str) -> String {
    let doc = Document::new(content);
    store.create(&doc).unwrap();
    doc.id
}

#[tokio::test]
async fn test_ping_before_and_after_opening() {
    let server = start_server(Arc::new(Anarchy { allow_create: true })).await;
    let id = seed(&server.store, "hello");

    let mut ws = connect(server.addr).await;
    send(&mut ws, json!({"command": "ping"})).await;
    assert_eq!(recv(&mut ws).await, ServerResponse::Pong);

    send(&mut ws, json!({"command": "edit", "user_id": "alice", "document_id": id})).await;
    assert!(matches!(recv(&mut ws).await, ServerResponse::Document { .. }));

    send(&mut ws, json!({"command": "ping"})).await;
    assert_eq!(recv(&mut ws).await, ServerResponse::Pong);
}

#[tokio::test]
async fn test_create_then_collaborate() {
    let server = start_server(Arc::new(Anarchy { allow_create: true })).await;

    let mut alice = connect(server.addr).await;
    send(
        &mut alice,
        json!({"command": "create", "user_id": "alice", "document": {"content": "hello world"}}),
    )
    .await;
    let (doc, version) = match recv(&mut alice).await {
        ServerResponse::Document { document, version } => (document, version),
        other => panic!("expected document, got {other:?}"),
    };
    assert_eq!(doc.content, "hello world");
    assert_eq!(version, 1);

    let (mut bob, bob_version) = join(server.addr, "bob", &doc.id).await;
    assert_eq!(bob_version, 1);

    send(
        &mut alice,
        json!({"command": "submit", "transform": {"position": 6, "num_delete": 5, "insert": "there", "version": 2}}),
    )
    .await;
    assert_eq!(recv(&mut alice).await, ServerResponse::Correction { version: 2 });

    match recv(&mut bob).await {
        ServerResponse::Transforms { transforms } => {
            assert_eq!(transforms.len(), 1);
            assert_eq!(transforms[0].position, 6);
            assert_eq!(transforms[0].delete, 5);
            assert_eq!(transforms[0].insert, "there");
            assert_eq!(transforms[0].version, 2);
        }
        other => panic!("expected transforms, got {other:?}"),
    }

    server.curator.close().await;
    assert_eq!(server.store.read(&doc.id).unwrap().content, "hello there");
}

#[tokio::test]
async fn test_invalid_transform_is_reported() {
    let server = start_server(Arc::new(Anarchy { allow_create: true })).await;
    let id = seed(&server.store, "abc");
    let (mut alice, _) = join(server.addr, "alice", &id).await;

    send(
        &mut alice,
        json!({"command": "submit", "transform": {"position": 2, "num_delete": 5, "version": 2}}),
    )
    .await;
    assert!(matches!(recv(&mut alice).await, ServerResponse::Error { .. }));

    // The session survives a rejected transform.
    send(
        &mut alice,
        json!({"command": "submit", "transform": {"position": 3, "insert": "d", "version": 2}}),
    )
    .await;
    assert_eq!(recv(&mut alice).await, ServerResponse::Correction { version: 2 });
}

#[tokio::test]
async fn test_read_only_session() {
    let server = start_server(Arc::new(Anarchy { allow_create: true })).await;
    let id = seed(&server.store, "hello");

    let mut reader = connect(server.addr).await;
    send(&mut reader, json!({"command": "read", "user_id": "rita", "document_id": id})).await;
    assert!(matches!(recv(&mut reader).await, ServerResponse::Document { .. }));

    send(
        &mut reader,
        json!({"command": "submit", "transform": {"position": 0, "insert": "x", "version": 2}}),
    )
    .await;
    assert_eq!(
        recv(&mut reader).await,
        ServerResponse::error("attempted to send transforms through a read only portal")
    );

    let (mut writer, _) = join(server.addr, "walt", &id).await;
    send(
        &mut writer,
        json!({"command": "submit", "transform": {"position": 5, "insert": "!", "version": 2}}),
    )
    .await;
    assert_eq!(recv(&mut writer).await, ServerResponse::Correction { version: 2 });

    match recv(&mut reader).await {
        ServerResponse::Transforms { transforms } => {
            assert_eq!(transforms.len(), 1);
            // The binder stamps `received`; compare the edit itself.
            let expected = Transform {
                received: transforms[0].received,
                ..Transform::new(5, 0, "!", 2)
            };
            assert_eq!(transforms[0], expected);
            assert!(transforms[0].received > 0);
        }
        other => panic!("expected transforms, got {other:?}"),
    }
}

#[tokio::test]
async fn test_presence_updates_and_departure() {
    let server = start_server(Arc::new(Anarchy { allow_create: true })).await;
    let id = seed(&server.store, "hello");
    let (mut alice, _) = join(server.addr, "alice", &id).await;
    let (mut bob, _) = join(server.addr, "bob", &id).await;

    send(&mut alice, json!({"command": "update", "position": 3})).await;
    match recv(&mut bob).await {
        ServerResponse::Update { user_updates } => {
            assert_eq!(user_updates[0].client.user_id, "alice");
            assert_eq!(user_updates[0].message.position, Some(3));
            assert!(user_updates[0].message.active);
        }
        other => panic!("expected update, got {other:?}"),
    }

    alice.close(None).await.unwrap();
    match recv(&mut bob).await {
        ServerResponse::Update { user_updates } => {
            assert_eq!(user_updates[0].client.user_id, "alice");
            assert!(!user_updates[0].message.active);
        }
        other => panic!("expected update, got {other:?}"),
    }

    let users = timeout(TIMEOUT, async {
        loop {
            let users = server.curator.get_users(TIMEOUT).await.unwrap();
            if users[&id].len() == 1 {
                return users;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(users[&id], vec!["bob".to_string()]);
}

#[tokio::test]
async fn test_unauthorized_and_unknown_documents() {
    let mut tokens = TokenTable::default();
    tokens.insert("editor", AccessLevel::Edit);
    let server = start_server(Arc::new(tokens)).await;
    let id = seed(&server.store, "private");

    let mut eve = connect(server.addr).await;
    send(
        &mut eve,
        json!({"command": "edit", "token": "forged", "user_id": "eve", "document_id": id}),
    )
    .await;
    assert_eq!(recv(&mut eve).await, ServerResponse::error("unauthorized"));

    let mut ed = connect(server.addr).await;
    send(
        &mut ed,
        json!({"command": "create", "token": "editor", "document": {"content": "x"}}),
    )
    .await;
    assert_eq!(recv(&mut ed).await, ServerResponse::error("unauthorized"));

    let mut ed = connect(server.addr).await;
    send(
        &mut ed,
        json!({"command": "edit", "token": "editor", "document_id": "missing"}),
    )
    .await;
    assert!(matches!(recv(&mut ed).await, ServerResponse::Error { .. }));
}

#[tokio::test]
async fn test_requests_out_of_order() {
    let server = start_server(Arc::new(Anarchy { allow_create: true })).await;
    let id = seed(&server.store, "hello");

    let mut ws = connect(server.addr).await;
    send(&mut ws, json!({"command": "update", "position": 1})).await;
    assert_eq!(recv(&mut ws).await, ServerResponse::error("no document is open"));

    send(&mut ws, json!({"command": "edit", "document_id": id})).await;
    assert!(matches!(recv(&mut ws).await, ServerResponse::Document { .. }));

    send(&mut ws, json!({"command": "edit", "document_id": id})).await;
    assert_eq!(
        recv(&mut ws).await,
        ServerResponse::error("a document is already open")
    );

    send(&mut ws, json!({"command": "dance"})).await;
    assert!(matches!(recv(&mut ws).await, ServerResponse::Error { .. }));
}

#[tokio::test]
async fn test_admin_commands() {
    let config = ServerConfig {
        admin_token: "root".into(),
        ..Default::default()
    };
    let server = start_server_with(Arc::new(Anarchy { allow_create: true }), config).await;
    let id = seed(&server.store, "hello");
    let (mut alice, _) = join(server.addr, "alice", &id).await;
    let (mut mallory, _) = join(server.addr, "mallory", &id).await;

    let mut admin = connect(server.addr).await;
    send(&mut admin, json!({"command": "get_users", "admin_token": "wrong"})).await;
    assert_eq!(recv(&mut admin).await, ServerResponse::error("unauthorized"));

    send(&mut admin, json!({"command": "get_users", "admin_token": "root"})).await;
    match recv(&mut admin).await {
        ServerResponse::Users { mut users } => {
            users.get_mut(&id).unwrap().sort();
            assert_eq!(users.len(), 1);
            assert_eq!(users[&id], vec!["alice".to_string(), "mallory".to_string()]);
        }
        other => panic!("expected users, got {other:?}"),
    }

    send(
        &mut admin,
        json!({"command": "kick_user", "admin_token": "root", "document_id": id, "user_id": "mallory"}),
    )
    .await;
    assert_eq!(
        recv(&mut admin).await,
        ServerResponse::Kicked {
            document_id: id.clone(),
            user_id: "mallory".into(),
        }
    );
    assert_eq!(
        recv(&mut mallory).await,
        ServerResponse::error("binder is closed")
    );

    send(
        &mut admin,
        json!({"command": "kick_user", "admin_token": "root", "document_id": "missing", "user_id": "x"}),
    )
    .await;
    assert!(matches!(recv(&mut admin).await, ServerResponse::Error { .. }));

    // Operator commands also work from a session. Mallory's departure may
    // arrive first.
    send(&mut alice, json!({"command": "get_users", "admin_token": "root"})).await;
    loop {
        match recv(&mut alice).await {
            ServerResponse::Update { .. } => continue,
            ServerResponse::Users { users } => {
                assert_eq!(users[&id], vec!["alice".to_string()]);
                break;
            }
            other => panic!("expected users, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_admin_commands_disabled_without_token() {
    let server = start_server(Arc::new(Anarchy { allow_create: true })).await;

    let mut ws = connect(server.addr).await;
    send(&mut ws, json!({"command": "get_users"})).await;
    assert_eq!(recv(&mut ws).await, ServerResponse::error("unauthorized"));
}
