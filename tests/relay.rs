//! End-to-end relay tests
//!
//! Spin up a real server on an ephemeral port and talk to it with
//! tokio-tungstenite clients, covering identifier assignment, signal routing,
//! broadcast exclusion, departure announcements, and fault tolerance.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use signal_relay::server::{RelayServer, ServerConfig};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_WINDOW: Duration = Duration::from_millis(300);

/// Start a relay on an ephemeral port; returns the server and its ws:// URL
async fn start_server() -> (Arc<RelayServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = ServerConfig::new("127.0.0.1".to_string(), addr.port());
    let server = Arc::new(RelayServer::new(config));

    let serve_handle = Arc::clone(&server);
    tokio::spawn(async move {
        serve_handle.serve(listener).await.unwrap();
    });

    (server, format!("ws://{}", addr))
}

/// Connect a client and consume its id envelope
async fn connect(url: &str) -> (Client, String) {
    let (mut client, _) = connect_async(url).await.unwrap();
    let frame = recv_frame(&mut client).await;
    assert_eq!(frame["type"], "id");
    let id = frame["userId"].as_str().unwrap().to_string();
    (client, id)
}

/// Receive the next text frame as JSON, failing on timeout
async fn recv_frame(client: &mut Client) -> Value {
    let msg = timeout(RECV_TIMEOUT, client.next())
        .await
        .expect("timed out waiting for frame")
        .expect("connection closed")
        .expect("websocket error");
    match msg {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected message: {:?}", other),
    }
}

/// Assert that no text frame arrives within the silence window
async fn assert_silent(client: &mut Client) {
    let result = timeout(SILENCE_WINDOW, client.next()).await;
    assert!(result.is_err(), "expected silence, got {:?}", result);
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .unwrap();
}

#[tokio::test]
async fn three_peer_scenario() {
    let (_server, url) = start_server().await;

    let (mut a, a_id) = connect(&url).await;
    let (mut b, b_id) = connect(&url).await;
    let (mut c, c_id) = connect(&url).await;

    // A broadcasts; B and C each get exactly one copy, A gets none.
    send_json(&mut a, json!({"type": "text-message", "text": "hi"})).await;
    for client in [&mut b, &mut c] {
        let frame = recv_frame(client).await;
        assert_eq!(frame["type"], "text-message");
        assert_eq!(frame["userId"], a_id.as_str());
        assert_eq!(frame["text"], "hi");
    }
    assert_silent(&mut a).await;

    // B signals A; A gets the payload unchanged with B as source, C nothing.
    let payload = json!({"sdp": "v=0\r\no=- 46117 2 IN IP4 127.0.0.1"});
    send_json(
        &mut b,
        json!({"type": "signal", "target": a_id, "payload": payload}),
    )
    .await;
    let frame = recv_frame(&mut a).await;
    assert_eq!(frame["type"], "signal");
    assert_eq!(frame["source"], b_id.as_str());
    assert_eq!(frame["payload"], payload);
    assert_silent(&mut c).await;

    // C leaves; A and B each get exactly one departure notice.
    c.close(None).await.unwrap();
    for client in [&mut a, &mut b] {
        let frame = recv_frame(client).await;
        assert_eq!(frame["type"], "user-disconnected");
        assert_eq!(frame["userId"], c_id.as_str());
    }
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn signal_to_offline_target_reports_error_to_sender_only() {
    let (_server, url) = start_server().await;

    let (mut a, _a_id) = connect(&url).await;
    let (mut b, _b_id) = connect(&url).await;

    send_json(
        &mut a,
        json!({"type": "signal", "target": "no-such-peer", "payload": {"sdp": "x"}}),
    )
    .await;

    let frame = recv_frame(&mut a).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["message"], "Target user is not online.");
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn malformed_frame_does_not_close_the_connection() {
    let (_server, url) = start_server().await;

    let (mut a, a_id) = connect(&url).await;
    let (mut b, _b_id) = connect(&url).await;

    a.send(Message::Text("this is not json".to_string()))
        .await
        .unwrap();
    a.send(Message::Text(r#"{"type": "signal", "payload": {}}"#.to_string()))
        .await
        .unwrap();

    // A is still live and routable after both bad frames
    send_json(&mut a, json!({"type": "text-message", "text": "survived"})).await;
    let frame = recv_frame(&mut b).await;
    assert_eq!(frame["type"], "text-message");
    assert_eq!(frame["userId"], a_id.as_str());
    assert_eq!(frame["text"], "survived");
}

#[tokio::test]
async fn unrecognized_type_is_ignored() {
    let (_server, url) = start_server().await;

    let (mut a, _a_id) = connect(&url).await;
    let (mut b, _b_id) = connect(&url).await;

    send_json(&mut a, json!({"type": "presence-ping", "seq": 1})).await;
    assert_silent(&mut b).await;

    send_json(&mut a, json!({"type": "text-message", "text": "after"})).await;
    let frame = recv_frame(&mut b).await;
    assert_eq!(frame["text"], "after");
}

#[tokio::test]
async fn identifiers_are_unique_across_connections() {
    let (_server, url) = start_server().await;

    let mut clients = Vec::new();
    let mut ids = HashSet::new();
    for _ in 0..10 {
        let (client, id) = connect(&url).await;
        assert!(ids.insert(id), "duplicate identifier assigned");
        clients.push(client);
    }
}

#[tokio::test]
async fn departed_peer_is_no_longer_routable() {
    let (_server, url) = start_server().await;

    let (mut a, _a_id) = connect(&url).await;
    let (mut b, b_id) = connect(&url).await;

    b.close(None).await.unwrap();
    let frame = recv_frame(&mut a).await;
    assert_eq!(frame["type"], "user-disconnected");

    send_json(
        &mut a,
        json!({"type": "signal", "target": b_id, "payload": {}}),
    )
    .await;
    let frame = recv_frame(&mut a).await;
    assert_eq!(frame["type"], "error");
}

#[tokio::test]
async fn shutdown_waits_for_sessions_to_settle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = ServerConfig::new("127.0.0.1".to_string(), addr.port());
    let server = Arc::new(RelayServer::new(config));
    let serve_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    let url = format!("ws://{}", addr);
    let (mut a, _a_id) = connect(&url).await;
    let (mut b, _b_id) = connect(&url).await;

    server.shutdown();

    // serve() must not return until every session has run its cleanup
    timeout(RECV_TIMEOUT, serve_task)
        .await
        .expect("serve did not finish after shutdown")
        .unwrap()
        .unwrap();
    assert!(server.router().registry().is_empty().await);

    // Both clients saw an orderly close, not an abandoned socket. Whichever
    // session cleaned up first announced its departure to the other, so a
    // user-disconnected frame may arrive ahead of the close.
    for client in [&mut a, &mut b] {
        loop {
            let result = timeout(RECV_TIMEOUT, client.next()).await.unwrap();
            match result {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    assert_eq!(frame["type"], "user-disconnected");
                }
                None | Some(Ok(Message::Close(_))) => break,
                other => panic!("expected close, got {:?}", other),
            }
        }
    }
}

#[tokio::test]
async fn shutdown_closes_connected_clients() {
    let (server, url) = start_server().await;

    let (mut a, _a_id) = connect(&url).await;
    server.shutdown();

    // The client sees an orderly close rather than an abrupt reset
    let result = timeout(RECV_TIMEOUT, a.next()).await.unwrap();
    match result {
        None | Some(Ok(Message::Close(_))) => {}
        other => panic!("expected close, got {:?}", other),
    }
}
