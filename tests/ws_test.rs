//! WebSocket integration tests: live room channels, fan-out exclusion of the
//! originating connection, private-channel request notifications, and auth
//! close codes.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_test_server() -> (String, SocketAddr) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = codeshare_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = codeshare_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");

    let state = codeshare_server::state::AppState {
        db,
        jwt_secret,
        connections: codeshare_server::ws::new_connection_registry(),
        rooms_live: codeshare_server::ws::new_room_registry(),
    };

    let app = codeshare_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
        let _keep = tmp_dir;
    });

    let base_url = format!("http://{}", addr);
    (base_url, addr)
}

async fn register_user(base_url: &str, username: &str) -> (String, String) {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/auth/register", base_url))
        .json(&json!({ "username": username, "password": "hunter2hunter2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    (
        body["access_token"].as_str().unwrap().to_string(),
        body["user_id"].as_str().unwrap().to_string(),
    )
}

async fn create_room(base_url: &str, token: &str, name: &str, room_type: &str) -> String {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/rooms", base_url))
        .header("Authorization", format!("Bearer {}", token))
        .json(&json!({ "name": name, "room_type": room_type }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    body["id"].as_str().unwrap().to_string()
}

async fn connect_ws(addr: SocketAddr, token: &str) -> WsStream {
    let url = format!("ws://{}/ws?token={}", addr, token);
    let (ws, _) = connect_async(&url).await.expect("WebSocket connect failed");
    ws
}

async fn send_json(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("WebSocket send failed");
}

/// Read the next JSON frame, skipping protocol-level ping/pong.
async fn recv_json(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timed out waiting for WebSocket message")
            .expect("WebSocket closed unexpectedly")
            .expect("WebSocket read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected WebSocket frame: {:?}", other),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_invalid_token_closed_with_policy_code() {
    let (_base_url, addr) = start_test_server().await;
    let url = format!("ws://{}/ws?token=not-a-jwt", addr);
    let (mut ws, _) = connect_async(&url).await.expect("Upgrade should succeed");

    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("Timed out waiting for close")
        .expect("Stream ended without close frame")
        .expect("WebSocket read error");

    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4002);
        }
        other => panic!("Expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_join_room_returns_snapshot() {
    let (base_url, addr) = start_test_server().await;
    let (owner_token, owner_id) = register_user(&base_url, "owner").await;
    let room_id = create_room(&base_url, &owner_token, "live", "public").await;

    let mut ws = connect_ws(addr, &owner_token).await;
    send_json(&mut ws, json!({ "type": "join-room", "room_id": room_id })).await;

    let msg = recv_json(&mut ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "room-data");
    assert_eq!(msg["room"]["room_id"].as_str().unwrap(), room_id);
    assert_eq!(msg["room"]["owner_id"].as_str().unwrap(), owner_id);
    assert!(msg["room"]["participants"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p["user_id"].as_str().unwrap() == owner_id));
}

#[tokio::test]
async fn test_room_events_exclude_origin_connection() {
    let (base_url, addr) = start_test_server().await;
    let (alice_token, _alice_id) = register_user(&base_url, "alice").await;
    let (bob_token, bob_id) = register_user(&base_url, "bob").await;
    let room_id = create_room(&base_url, &alice_token, "pair", "public").await;

    let mut alice = connect_ws(addr, &alice_token).await;
    send_json(&mut alice, json!({ "type": "join-room", "room_id": room_id })).await;
    let msg = recv_json(&mut alice).await;
    assert_eq!(msg["type"].as_str().unwrap(), "room-data");

    let mut bob = connect_ws(addr, &bob_token).await;
    send_json(&mut bob, json!({ "type": "join-room", "room_id": room_id })).await;
    let msg = recv_json(&mut bob).await;
    assert_eq!(msg["type"].as_str().unwrap(), "room-data");

    // Alice hears bob arrive; bob (the origin) got only the snapshot.
    let msg = recv_json(&mut alice).await;
    assert_eq!(msg["type"].as_str().unwrap(), "user-joined");
    assert_eq!(msg["user_id"].as_str().unwrap(), bob_id);

    // Alice edits: bob receives the update...
    send_json(
        &mut alice,
        json!({ "type": "code-change", "code": "let x = 1;" }),
    )
    .await;
    let msg = recv_json(&mut bob).await;
    assert_eq!(msg["type"].as_str().unwrap(), "code-updated");
    assert_eq!(msg["code"].as_str().unwrap(), "let x = 1;");
    assert_eq!(msg["updated_by"].as_str().unwrap(), "alice");

    // ...and alice does not get her own edit echoed back: the next frame she
    // sees is bob's cursor, not a code-updated.
    send_json(
        &mut bob,
        json!({ "type": "cursor-move", "line": 4, "ch": 2, "color": "#22cc88" }),
    )
    .await;
    let msg = recv_json(&mut alice).await;
    assert_eq!(msg["type"].as_str().unwrap(), "cursor-updated");
    assert_eq!(msg["cursor"]["user_id"].as_str().unwrap(), bob_id);
    assert_eq!(msg["cursor"]["line"].as_i64().unwrap(), 4);
    assert_eq!(msg["cursor"]["ch"].as_i64().unwrap(), 2);
}

#[tokio::test]
async fn test_private_room_join_denied_over_ws() {
    let (base_url, addr) = start_test_server().await;
    let (owner_token, _) = register_user(&base_url, "owner").await;
    let (visitor_token, _) = register_user(&base_url, "visitor").await;
    let room_id = create_room(&base_url, &owner_token, "vault", "private").await;

    let mut ws = connect_ws(addr, &visitor_token).await;
    send_json(&mut ws, json!({ "type": "join-room", "room_id": room_id })).await;

    let msg = recv_json(&mut ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "join-denied");
    assert_eq!(msg["reason"].as_str().unwrap(), "room is closed");
}

#[tokio::test]
async fn test_join_by_code_over_ws() {
    let (base_url, addr) = start_test_server().await;
    let (owner_token, _) = register_user(&base_url, "owner").await;
    let (visitor_token, visitor_id) = register_user(&base_url, "visitor").await;
    let room_id = create_room(&base_url, &owner_token, "vault", "private").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/rooms/{}/join-code", base_url, room_id))
        .header("Authorization", format!("Bearer {}", owner_token))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    let code = body["join_code"].as_str().unwrap().to_string();

    let mut ws = connect_ws(addr, &visitor_token).await;
    send_json(&mut ws, json!({ "type": "join-room", "code": code })).await;

    let msg = recv_json(&mut ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "room-data");
    assert_eq!(msg["room"]["room_id"].as_str().unwrap(), room_id);
    assert!(msg["room"]["participants"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p["user_id"].as_str().unwrap() == visitor_id));
}

#[tokio::test]
async fn test_request_approve_flow_over_private_channels() {
    let (base_url, addr) = start_test_server().await;
    let (owner_token, _owner_id) = register_user(&base_url, "owner").await;
    let (req_token, req_id) = register_user(&base_url, "requester").await;
    let room_id = create_room(&base_url, &owner_token, "gated", "request_to_join").await;

    let mut owner_ws = connect_ws(addr, &owner_token).await;
    send_json(
        &mut owner_ws,
        json!({ "type": "join-room", "room_id": room_id }),
    )
    .await;
    let msg = recv_json(&mut owner_ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "room-data");

    let mut req_ws = connect_ws(addr, &req_token).await;
    send_json(
        &mut req_ws,
        json!({ "type": "request-join", "room_id": room_id }),
    )
    .await;

    // Requester is told to wait; the owner's private channel gets the request.
    let msg = recv_json(&mut req_ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "awaiting-approval");
    let msg = recv_json(&mut owner_ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "join-request-received");
    assert_eq!(msg["user_id"].as_str().unwrap(), req_id);
    assert_eq!(msg["username"].as_str().unwrap(), "requester");

    // Owner approves over the socket.
    send_json(
        &mut owner_ws,
        json!({ "type": "approve-request", "room_id": room_id, "user_id": req_id }),
    )
    .await;

    let msg = recv_json(&mut req_ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "join-request-approved");
    assert_eq!(msg["room_id"].as_str().unwrap(), room_id);
    assert!(msg["room"]["participants"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p["user_id"].as_str().unwrap() == req_id));

    let msg = recv_json(&mut owner_ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "join-request-processed");
    assert_eq!(msg["action"].as_str().unwrap(), "approved");

    // The approved user can now bind to the room.
    send_json(
        &mut req_ws,
        json!({ "type": "join-room", "room_id": room_id }),
    )
    .await;
    let msg = recv_json(&mut req_ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "room-data");
}

#[tokio::test]
async fn test_reject_flow_over_private_channels() {
    let (base_url, addr) = start_test_server().await;
    let (owner_token, _) = register_user(&base_url, "owner").await;
    let (req_token, req_id) = register_user(&base_url, "requester").await;
    let room_id = create_room(&base_url, &owner_token, "gated", "request_to_join").await;

    let mut owner_ws = connect_ws(addr, &owner_token).await;
    let mut req_ws = connect_ws(addr, &req_token).await;

    send_json(
        &mut req_ws,
        json!({ "type": "request-join", "room_id": room_id }),
    )
    .await;
    let msg = recv_json(&mut req_ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "awaiting-approval");
    let msg = recv_json(&mut owner_ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "join-request-received");

    send_json(
        &mut owner_ws,
        json!({ "type": "reject-request", "room_id": room_id, "user_id": req_id }),
    )
    .await;

    let msg = recv_json(&mut req_ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "join-request-rejected");
    assert_eq!(msg["room_id"].as_str().unwrap(), room_id);

    // Rejection leaves no membership behind.
    send_json(
        &mut req_ws,
        json!({ "type": "join-room", "room_id": room_id }),
    )
    .await;
    let msg = recv_json(&mut req_ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "awaiting-approval");
}

#[tokio::test]
async fn test_disconnect_broadcasts_user_left() {
    let (base_url, addr) = start_test_server().await;
    let (alice_token, _) = register_user(&base_url, "alice").await;
    let (bob_token, bob_id) = register_user(&base_url, "bob").await;
    let room_id = create_room(&base_url, &alice_token, "pair", "public").await;

    let mut alice = connect_ws(addr, &alice_token).await;
    send_json(&mut alice, json!({ "type": "join-room", "room_id": room_id })).await;
    recv_json(&mut alice).await; // room-data

    let mut bob = connect_ws(addr, &bob_token).await;
    send_json(&mut bob, json!({ "type": "join-room", "room_id": room_id })).await;
    recv_json(&mut bob).await; // room-data
    let msg = recv_json(&mut alice).await;
    assert_eq!(msg["type"].as_str().unwrap(), "user-joined");

    // Bob drops the socket without a leave-room message.
    drop(bob);

    let msg = recv_json(&mut alice).await;
    assert_eq!(msg["type"].as_str().unwrap(), "user-left");
    assert_eq!(msg["user_id"].as_str().unwrap(), bob_id);
}

#[tokio::test]
async fn test_disconnect_removes_connection_registry_entry() {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = codeshare_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = codeshare_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");

    // Keep a handle on the registry so cleanup is observable.
    let connections = codeshare_server::ws::new_connection_registry();
    let state = codeshare_server::state::AppState {
        db,
        jwt_secret,
        connections: connections.clone(),
        rooms_live: codeshare_server::ws::new_room_registry(),
    };

    let app = codeshare_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
        let _keep = tmp_dir;
    });

    let base_url = format!("http://{}", addr);
    let (token, user_id) = register_user(&base_url, "ghost").await;

    let ws = connect_ws(addr, &token).await;
    wait_until(|| connections.contains_key(&user_id)).await;

    drop(ws);
    // The actor must sweep its own sender out on the way down, not leave a
    // stale entry behind until the user's next connect.
    wait_until(|| !connections.contains_key(&user_id)).await;
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("Condition not met within 5s");
}

#[tokio::test]
async fn test_code_change_without_room_is_an_error() {
    let (base_url, addr) = start_test_server().await;
    let (token, _) = register_user(&base_url, "loner").await;

    let mut ws = connect_ws(addr, &token).await;
    send_json(&mut ws, json!({ "type": "code-change", "code": "x" })).await;

    let msg = recv_json(&mut ws).await;
    assert_eq!(msg["type"].as_str().unwrap(), "error");
    assert_eq!(msg["message"].as_str().unwrap(), "not in a room");
}
