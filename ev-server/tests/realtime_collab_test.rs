//! Realtime collab hub: every connection gets a `ready` frame on connect,
//! and a lyric upsert only reaches subscribers whose `projectId` filter
//! matches the updated track.

mod helpers;

use std::time::Duration;

use ev_server::api::create_router;
use futures::{SinkExt, StreamExt};
use helpers::{spawn_test_server, test_state};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_text(socket: &mut Socket) -> String {
    loop {
        match socket.next().await.expect("stream closed unexpectedly").expect("websocket error") {
            Message::Text(text) => return text.to_string(),
            Message::Ping(payload) => {
                socket.send(Message::Pong(payload)).await.expect("pong failed");
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn lyrics_update_only_reaches_the_matching_project_subscriber() {
    let router = create_router(test_state());
    let server = spawn_test_server(router).await;

    let (mut socket_p1, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/v1/ws?projectId=p1", server.addr))
        .await
        .expect("connect p1");
    let (mut socket_p2, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/v1/ws?projectId=p2", server.addr))
        .await
        .expect("connect p2");

    let ready_p1 = next_text(&mut socket_p1).await;
    assert!(ready_p1.contains("\"type\":\"ready\""));
    let ready_p2 = next_text(&mut socket_p2).await;
    assert!(ready_p2.contains("\"type\":\"ready\""));

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/v1/collab/lyrics", server.addr))
        .json(&serde_json::json!({
            "externalTrackId": "track-1",
            "projectId": "p1",
            "title": "Song",
            "lyrics": "la la la",
        }))
        .send()
        .await
        .expect("post lyrics failed");
    assert!(response.status().is_success());

    let update_p1 = tokio::time::timeout(Duration::from_secs(2), next_text(&mut socket_p1))
        .await
        .expect("p1 subscriber should receive the p1-scoped update");
    assert!(update_p1.contains("collab_lyrics_updated"));
    assert!(update_p1.contains("track-1"));

    let p2_saw_nothing = tokio::time::timeout(Duration::from_millis(300), next_text(&mut socket_p2)).await;
    assert!(p2_saw_nothing.is_err(), "p2 subscriber should not receive a p1-scoped update");
}
