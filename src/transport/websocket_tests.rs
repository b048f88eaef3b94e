use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::broker::Broker;
use crate::config::BrokerSettings;
use crate::transport::connection::ConnectionManager;
use crate::transport::websocket::serve;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(2);

async fn setup_server() -> (String, Arc<ConnectionManager>) {
    let broker = Arc::new(Broker::new(BrokerSettings::default()));
    broker.create_topic("orders");
    let manager = ConnectionManager::new(broker);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, manager.clone(), 64));

    (format!("ws://{addr}"), manager)
}

/// Connects and consumes the greeting.
async fn connect(url: &str) -> (Client, String) {
    let (mut ws, _) = connect_async(url).await.expect("WebSocket handshake failed");
    let hello = recv_json(&mut ws).await;
    assert_eq!(hello["type"], "info");
    assert_eq!(hello["msg"], "connected");
    let connection_id = hello["connection_id"].as_str().unwrap().to_string();
    (ws, connection_id)
}

async fn send_json(ws: &mut Client, frame: Value) {
    ws.send(WsMessage::Text(frame.to_string().into()))
        .await
        .expect("send failed");
}

async fn recv_json(ws: &mut Client) -> Value {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Skips text frames until the server's close frame and returns its code.
async fn recv_close_code(ws: &mut Client) -> u16 {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended")
            .expect("read error");
        if let WsMessage::Close(frame) = msg {
            return frame.map(|f| u16::from(f.code)).unwrap_or(0);
        }
    }
}

async fn wait_for_connections(manager: &ConnectionManager, expected: usize) {
    timeout(WAIT, async {
        while manager.connection_count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count never settled");
}

#[tokio::test]
async fn test_publish_subscribe_over_websocket() {
    let (url, _manager) = setup_server().await;
    let (mut a, _) = connect(&url).await;
    let (mut p, _) = connect(&url).await;

    send_json(&mut a, json!({"type": "subscribe", "topic": "orders", "client_id": "A", "request_id": 1})).await;
    let ack = recv_json(&mut a).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["status"], "subscribed");
    assert_eq!(ack["request_id"], 1);

    for (i, id) in ["m1", "m2"].iter().enumerate() {
        send_json(
            &mut p,
            json!({"type": "publish", "topic": "orders", "client_id": "P",
                   "message": {"id": id, "payload": {"x": i + 1}}}),
        )
        .await;
        let ack = recv_json(&mut p).await;
        assert_eq!(ack["status"], "published");
        assert_eq!(ack["subscribers"], 1);
    }

    let first = recv_json(&mut a).await;
    let second = recv_json(&mut a).await;
    assert_eq!(first["type"], "event");
    assert_eq!(first["topic"], "orders");
    assert_eq!(first["message"]["id"], "m1");
    assert_eq!(first["message"]["payload"]["x"], 1);
    assert_eq!(second["message"]["id"], "m2");

    // late joiner asks for the last message
    let (mut b, _) = connect(&url).await;
    send_json(&mut b, json!({"type": "subscribe", "topic": "orders", "client_id": "B", "last_n": 1})).await;
    let replayed = recv_json(&mut b).await;
    assert_eq!(replayed["type"], "event");
    assert_eq!(replayed["message"]["id"], "m2");
    assert_eq!(replayed["replay"], true);
    assert_eq!(recv_json(&mut b).await["type"], "ack");

    send_json(
        &mut p,
        json!({"type": "publish", "topic": "orders", "client_id": "P",
               "message": {"id": "m3", "payload": {"x": 3}}}),
    )
    .await;
    assert_eq!(recv_json(&mut p).await["subscribers"], 2);
    assert_eq!(recv_json(&mut a).await["message"]["id"], "m3");
    let live = recv_json(&mut b).await;
    assert_eq!(live["message"]["id"], "m3");
    assert!(live.get("replay").is_none());
}

#[tokio::test]
async fn test_bad_frames_get_errors_and_ping_still_works() {
    let (url, _manager) = setup_server().await;
    let (mut ws, _) = connect(&url).await;

    ws.send(WsMessage::Text("definitely not json".into()))
        .await
        .unwrap();
    let err = recv_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "BAD_REQUEST");

    send_json(&mut ws, json!({"type": "subscribe", "client_id": "A"})).await;
    assert_eq!(recv_json(&mut ws).await["error"], "BAD_REQUEST");

    send_json(&mut ws, json!({"type": "ping", "request_id": "p-1"})).await;
    let pong = recv_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["request_id"], "p-1");
}

#[tokio::test]
async fn test_client_disconnect_cleans_up_subscriptions() {
    let (url, manager) = setup_server().await;
    let (mut ws, connection_id) = connect(&url).await;

    send_json(&mut ws, json!({"type": "subscribe", "topic": "orders", "client_id": "A"})).await;
    recv_json(&mut ws).await;
    assert!(connection_id.starts_with("conn-"));
    assert_eq!(manager.broker().client_topics("A"), vec!["orders"]);

    ws.close(None).await.unwrap();
    wait_for_connections(&manager, 0).await;
    assert!(manager.broker().client_topics("A").is_empty());
    assert_eq!(manager.broker().get_topic("orders").unwrap().subscribers, 0);
}

#[tokio::test]
async fn test_topic_deletion_closes_subscriber() {
    let (url, manager) = setup_server().await;
    let (mut ws, _) = connect(&url).await;

    send_json(&mut ws, json!({"type": "subscribe", "topic": "orders", "client_id": "A"})).await;
    recv_json(&mut ws).await;

    let deletion = manager.broker().delete_topic("orders").unwrap();
    assert_eq!(deletion.subscribers_disconnected, 1);

    assert_eq!(recv_close_code(&mut ws).await, 4001);
    wait_for_connections(&manager, 0).await;
}

#[tokio::test]
async fn test_shutdown_closes_every_client() {
    let (url, manager) = setup_server().await;
    let (mut a, _) = connect(&url).await;
    let (mut b, _) = connect(&url).await;
    send_json(&mut a, json!({"type": "subscribe", "topic": "orders", "client_id": "A"})).await;
    recv_json(&mut a).await;
    wait_for_connections(&manager, 2).await;

    manager.shutdown();
    // the socket tasks have flushed their close frames once this returns
    assert!(manager.wait_for_connection_tasks(WAIT).await);

    assert_eq!(recv_close_code(&mut a).await, 1001);
    assert_eq!(recv_close_code(&mut b).await, 1001);
    assert_eq!(manager.connection_count(), 0);
    assert_eq!(manager.broker().get_stats().topics, 0);
}

#[tokio::test]
async fn test_second_socket_cannot_claim_bound_identity() {
    let (url, manager) = setup_server().await;
    let (mut first, _) = connect(&url).await;
    let (mut second, _) = connect(&url).await;

    send_json(&mut first, json!({"type": "subscribe", "topic": "orders", "client_id": "alice"})).await;
    assert_eq!(recv_json(&mut first).await["status"], "subscribed");

    send_json(&mut second, json!({"type": "subscribe", "topic": "orders", "client_id": "alice"})).await;
    let err = recv_json(&mut second).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["error"], "BAD_REQUEST");
    assert_eq!(manager.broker().get_topic("orders").unwrap().subscribers, 1);
}
