//! Integration tests for the WebSocket chat core: handshake refusals,
//! private/broadcast routing, persistence, backlog replay, and session
//! lifecycle.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use chatline_server::chat::store;
use chatline_server::db::DbPool;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    base_url: String,
    addr: SocketAddr,
    db: DbPool,
    jwt_secret: Vec<u8>,
}

/// Start the server on a random port with a throwaway data dir.
async fn start_test_server() -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = chatline_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = chatline_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");

    let state = chatline_server::state::AppState {
        db: db.clone(),
        jwt_secret: jwt_secret.clone(),
        sessions: Arc::new(chatline_server::chat::registry::SessionRegistry::new()),
        history_limit: 20,
    };

    let app = chatline_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        db,
        jwt_secret,
    }
}

/// Register a user and return an access token for it.
async fn register_and_login(base_url: &str, username: &str) -> String {
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/auth/register", base_url))
        .json(&json!({ "username": username, "password": "password123" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201, "Registration failed for {}", username);

    let resp = client
        .post(format!("{}/api/auth/login", base_url))
        .json(&json!({ "username": username, "password": "password123" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200, "Login failed for {}", username);

    let body: serde_json::Value = resp.json().await.unwrap();
    body["access_token"].as_str().unwrap().to_string()
}

async fn connect(addr: SocketAddr, token: &str) -> WsStream {
    let ws_url = format!("ws://{}/ws?token={}", addr, token);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream
}

/// Read the next text frame, skipping control frames.
async fn next_text(ws: &mut WsStream) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for a text frame")
            .expect("Stream ended while waiting for a text frame")
            .expect("WebSocket error while waiting for a text frame");
        match msg {
            Message::Text(text) => return text.to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected text frame, got: {:?}", other),
        }
    }
}

/// Assert that no text frame arrives within the given window.
async fn expect_silence(ws: &mut WsStream, window: Duration) {
    match tokio::time::timeout(window, ws.next()).await {
        Err(_) => {}
        Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
        Ok(other) => panic!("Expected no frame, got: {:?}", other),
    }
}

/// Read until a close frame arrives and assert its code.
async fn expect_close_code(ws: &mut WsStream, code: u16) {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for close frame");
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(frame.code, CloseCode::from(code), "Unexpected close code");
                return;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("Expected close frame with code {}, got: {:?}", code, other),
        }
    }
}

fn stored_messages_for(db: &DbPool, username: &str) -> Vec<store::StoredMessage> {
    store::last_messages_for_user(db, username, 50).unwrap()
}

// --- Handshake ---

#[tokio::test]
async fn test_missing_token_refused_with_policy_violation() {
    let server = start_test_server().await;

    let ws_url = format!("ws://{}/ws", server.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Upgrade should succeed even without a token");

    expect_close_code(&mut ws, 1008).await;
}

#[tokio::test]
async fn test_invalid_token_refused() {
    let server = start_test_server().await;
    let mut ws = connect(server.addr, "not-a-jwt").await;
    expect_close_code(&mut ws, 4002).await;
}

#[tokio::test]
async fn test_expired_token_refused() {
    let server = start_test_server().await;
    let _token = register_and_login(&server.base_url, "alice").await;

    // Craft a token whose expiry is well past the 60-second validation leeway
    let now = chrono::Utc::now().timestamp();
    let claims = chatline_server::auth::jwt::Claims {
        sub: "whatever".to_string(),
        username: "alice".to_string(),
        iat: now - 10_000,
        exp: now - 7_200,
    };
    let expired = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(&server.jwt_secret),
    )
    .unwrap();

    let mut ws = connect(server.addr, &expired).await;
    expect_close_code(&mut ws, 4001).await;
}

#[tokio::test]
async fn test_token_for_deleted_user_refused() {
    let server = start_test_server().await;
    let token = register_and_login(&server.base_url, "ghost").await;

    {
        let conn = server.db.lock().unwrap();
        conn.execute("DELETE FROM users WHERE username = 'ghost'", [])
            .unwrap();
    }

    let mut ws = connect(server.addr, &token).await;
    expect_close_code(&mut ws, 4004).await;
}

// --- Private messages ---

#[tokio::test]
async fn test_pm_between_online_users() {
    let server = start_test_server().await;
    let alice_token = register_and_login(&server.base_url, "alice").await;
    let bob_token = register_and_login(&server.base_url, "bob").await;

    let mut alice = connect(server.addr, &alice_token).await;
    let mut bob = connect(server.addr, &bob_token).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.send(Message::text("/pm bob hi")).await.unwrap();

    let delivered = next_text(&mut bob).await;
    assert!(
        delivered.ends_with("] alice для bob: hi") && delivered.starts_with('['),
        "Unexpected delivery line: {}",
        delivered
    );

    // The sender gets an echo confirmation in the same format
    let echo = next_text(&mut alice).await;
    assert!(
        echo.ends_with("] alice для bob: hi"),
        "Unexpected echo line: {}",
        echo
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = stored_messages_for(&server.db, "bob");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sender_username, "alice");
    assert_eq!(stored[0].receiver_username, "bob");
    assert_eq!(stored[0].text, "hi");
}

#[tokio::test]
async fn test_pm_to_offline_user_notifies_sender_and_persists() {
    let server = start_test_server().await;
    let alice_token = register_and_login(&server.base_url, "alice").await;
    // bob exists but never connects
    let _bob_token = register_and_login(&server.base_url, "bob").await;

    let mut alice = connect(server.addr, &alice_token).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.send(Message::text("/pm bob hello")).await.unwrap();

    let notice = next_text(&mut alice).await;
    assert!(
        notice.contains("'bob'") && notice.contains("не в сети"),
        "Expected offline notice naming bob, got: {}",
        notice
    );
    let echo = next_text(&mut alice).await;
    assert!(echo.ends_with("] alice для bob: hello"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = stored_messages_for(&server.db, "bob");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sender_username, "alice");
    assert_eq!(stored[0].text, "hello");
}

#[tokio::test]
async fn test_pm_to_self_rejected_and_not_persisted() {
    let server = start_test_server().await;
    let alice_token = register_and_login(&server.base_url, "alice").await;

    let mut alice = connect(server.addr, &alice_token).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.send(Message::text("/pm alice hi")).await.unwrap();

    let notice = next_text(&mut alice).await;
    assert_eq!(notice, "Вы не можете отправлять личные сообщения себе.");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stored_messages_for(&server.db, "alice").is_empty());
}

#[tokio::test]
async fn test_pm_to_unknown_user_degrades_to_notice() {
    let server = start_test_server().await;
    let alice_token = register_and_login(&server.base_url, "alice").await;

    let mut alice = connect(server.addr, &alice_token).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.send(Message::text("/pm nobody hi")).await.unwrap();

    let notice = next_text(&mut alice).await;
    assert!(
        notice.contains("'nobody'") && notice.contains("не найден"),
        "Expected unknown-user notice, got: {}",
        notice
    );

    // The connection survives and nothing was stored
    alice.send(Message::text("still here")).await.unwrap();
    let line = next_text(&mut alice).await;
    assert!(line.ends_with("] alice: still here"));
    assert!(stored_messages_for(&server.db, "alice").is_empty());
}

#[tokio::test]
async fn test_malformed_pm_reports_inline_and_keeps_connection() {
    let server = start_test_server().await;
    let alice_token = register_and_login(&server.base_url, "alice").await;

    let mut alice = connect(server.addr, &alice_token).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.send(Message::text("/pm bob")).await.unwrap();
    let notice = next_text(&mut alice).await;
    assert!(
        notice.contains("Неверный формат"),
        "Expected usage notice, got: {}",
        notice
    );

    // Loop continues: a broadcast still works on the same connection
    alice.send(Message::text("alive")).await.unwrap();
    let line = next_text(&mut alice).await;
    assert!(line.ends_with("] alice: alive"));
}

// --- Broadcast ---

#[tokio::test]
async fn test_broadcast_reaches_everyone_and_is_not_persisted() {
    let server = start_test_server().await;
    let alice_token = register_and_login(&server.base_url, "alice").await;
    let bob_token = register_and_login(&server.base_url, "bob").await;
    let carol_token = register_and_login(&server.base_url, "carol").await;

    let mut alice = connect(server.addr, &alice_token).await;
    let mut bob = connect(server.addr, &bob_token).await;
    let mut carol = connect(server.addr, &carol_token).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice
        .send(Message::text("hello everyone"))
        .await
        .unwrap();

    for ws in [&mut alice, &mut bob, &mut carol] {
        let line = next_text(ws).await;
        assert!(
            line.ends_with("] alice: hello everyone") && line.starts_with('['),
            "Unexpected broadcast line: {}",
            line
        );
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stored_messages_for(&server.db, "alice").is_empty());
}

// --- Backlog replay ---

#[tokio::test]
async fn test_backlog_replayed_oldest_first_on_connect() {
    let server = start_test_server().await;
    let _alice_token = register_and_login(&server.base_url, "alice").await;
    let bob_token = register_and_login(&server.base_url, "bob").await;

    store::create_message(&server.db, "alice", "bob", "first").unwrap();
    store::create_message(&server.db, "bob", "alice", "second").unwrap();
    store::create_message(&server.db, "alice", "bob", "third").unwrap();

    let mut bob = connect(server.addr, &bob_token).await;

    let line1 = next_text(&mut bob).await;
    let line2 = next_text(&mut bob).await;
    let line3 = next_text(&mut bob).await;
    assert!(line1.ends_with("] alice для bob: first"), "got: {}", line1);
    assert!(line2.ends_with("] bob для alice: second"), "got: {}", line2);
    assert!(line3.ends_with("] alice для bob: third"), "got: {}", line3);

    expect_silence(&mut bob, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_backlog_capped_at_limit_keeps_newest() {
    let server = start_test_server().await;
    let _alice_token = register_and_login(&server.base_url, "alice").await;
    let bob_token = register_and_login(&server.base_url, "bob").await;

    for i in 1..=25 {
        store::create_message(&server.db, "alice", "bob", &format!("msg-{:02}", i)).unwrap();
    }

    let mut bob = connect(server.addr, &bob_token).await;

    let mut lines = Vec::new();
    for _ in 0..20 {
        lines.push(next_text(&mut bob).await);
    }
    // The newest 20 of 25, oldest first
    assert!(lines[0].ends_with(": msg-06"), "got: {}", lines[0]);
    assert!(lines[19].ends_with(": msg-25"), "got: {}", lines[19]);

    expect_silence(&mut bob, Duration::from_millis(300)).await;
}

// --- Session lifecycle ---

#[tokio::test]
async fn test_reconnect_replaces_session_and_closes_old_transport() {
    let server = start_test_server().await;
    let alice_token = register_and_login(&server.base_url, "alice").await;
    let bob_token = register_and_login(&server.base_url, "bob").await;

    let mut alice_old = connect(server.addr, &alice_token).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut alice_new = connect(server.addr, &alice_token).await;

    // The replaced transport is force-closed with the session-replaced code
    expect_close_code(&mut alice_old, 4000).await;

    // Exactly one live session: bob's PM lands on the new transport
    let mut bob = connect(server.addr, &bob_token).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.send(Message::text("/pm alice ping")).await.unwrap();

    let line = next_text(&mut alice_new).await;
    assert!(line.ends_with("] bob для alice: ping"), "got: {}", line);
}

#[tokio::test]
async fn test_disconnect_unregisters_session() {
    let server = start_test_server().await;
    let alice_token = register_and_login(&server.base_url, "alice").await;
    let bob_token = register_and_login(&server.base_url, "bob").await;

    let mut alice = connect(server.addr, &alice_token).await;
    let mut bob = connect(server.addr, &bob_token).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.send(Message::Close(None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Alice is gone from the registry: a PM to her is a silent no-op plus an
    // offline notice to the sender, not an error
    bob.send(Message::text("/pm alice anyone?")).await.unwrap();
    let notice = next_text(&mut bob).await;
    assert!(
        notice.contains("'alice'") && notice.contains("не в сети"),
        "Expected offline notice, got: {}",
        notice
    );
}

#[tokio::test]
async fn test_client_ping_gets_pong() {
    let server = start_test_server().await;
    let alice_token = register_and_login(&server.base_url, "alice").await;

    let mut alice = connect(server.addr, &alice_token).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice
        .send(Message::Ping(vec![42, 43, 44].into()))
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), alice.next())
        .await
        .expect("Expected pong within timeout");
    match msg {
        Some(Ok(Message::Pong(data))) => {
            assert_eq!(data.as_ref(), &[42, 43, 44], "Pong data should match ping");
        }
        other => panic!("Expected Pong message, got: {:?}", other),
    }
}
