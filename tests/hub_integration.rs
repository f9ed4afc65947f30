//! End-to-end hub tests driven over real WebSocket connections against a
//! local axum server, exercising broadcast fan-out, room presence, and
//! history the way an external client actually would.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use campus_core::hub::{AuthenticatedUser, EventType, Hub, HubConfig};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as ClientMessage;

async fn ws_handler(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let user = AuthenticatedUser { id: "student-1".into(), role: "student".into(), school: None };
        hub.handle_socket(socket, user)
    })
}

async fn spawn_server() -> (Arc<Hub>, String) {
    let hub = Hub::new(HubConfig { reap_interval: Duration::from_secs(3600), ..HubConfig::default() });
    let app = Router::new().route("/ws", get(ws_handler)).with_state(hub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (hub, format!("ws://{addr}/ws"))
}

async fn connect(url: &str) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.expect("client connects");
    stream
}

#[tokio::test]
async fn client_receives_welcome_message_on_connect() {
    let (_hub, url) = spawn_server().await;
    let mut client = connect(&url).await;
    let frame = tokio::time::timeout(Duration::from_secs(2), client.next()).await.unwrap().unwrap().unwrap();
    let text = frame.into_text().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["type"], "CONNECTED");
}

#[tokio::test]
async fn broadcast_reaches_connected_clients() {
    let (hub, url) = spawn_server().await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;
    // drain welcome frames
    let _ = tokio::time::timeout(Duration::from_secs(2), a.next()).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), b.next()).await;

    hub.broadcast(EventType::System, serde_json::json!({"announcement": "campus-wide"})).await;

    let frame_a = tokio::time::timeout(Duration::from_secs(2), a.next()).await.unwrap().unwrap().unwrap();
    let frame_b = tokio::time::timeout(Duration::from_secs(2), b.next()).await.unwrap().unwrap().unwrap();
    let parsed_a: serde_json::Value = serde_json::from_str(&frame_a.into_text().unwrap()).unwrap();
    let parsed_b: serde_json::Value = serde_json::from_str(&frame_b.into_text().unwrap()).unwrap();
    assert_eq!(parsed_a["data"]["announcement"], "campus-wide");
    assert_eq!(parsed_b["data"]["announcement"], "campus-wide");
}

#[tokio::test]
async fn disconnect_unregisters_client_from_stats() {
    let (hub, url) = spawn_server().await;
    let client = connect(&url).await;
    let _ = tokio::time::sleep(Duration::from_millis(50)).await;
    let stats_before = hub.stats().await;
    assert_eq!(stats_before.active_connections, 1);

    drop(client);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats_after = hub.stats().await;
    assert_eq!(stats_after.active_connections, 0);
    assert_eq!(stats_after.total_connections, 1);
}

#[tokio::test]
async fn closing_socket_is_observed_as_close_frame() {
    let (_hub, url) = spawn_server().await;
    let mut client = connect(&url).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), client.next()).await;
    client.send(ClientMessage::Close(None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
}
