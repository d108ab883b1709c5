//! Realtime fan-out for collab lyric draft updates.
//!
//! One `tokio` task per connection: a forwarding loop drains an `mpsc`
//! channel into the socket sink, while the main loop multiplexes inbound
//! frames and a 30-second heartbeat with `tokio::select!`. The connection
//! registry is a `DashMap`, mutated on connect/close and iterated on
//! publish — iteration only holds per-shard locks, safe under concurrent
//! mutation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use dashmap::DashMap;
use ev_common::collab::{CollabLyricDraft, CollabSubscription};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadyFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    channel: &'static str,
    filters: CollabSubscription,
    server_time: chrono::DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishedItem<'a> {
    external_track_id: &'a str,
    title: &'a str,
    project_id: &'a Option<String>,
    source: &'a str,
    artist: &'a Option<String>,
    bpm: Option<f64>,
    updated_at: chrono::DateTime<Utc>,
    collaborators: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    sent_at: chrono::DateTime<Utc>,
    item: PublishedItem<'a>,
}

/// The realtime collab hub: a registry of connections and their
/// subscription filters, published to on every successful upsert.
#[derive(Default)]
pub struct CollabHub {
    connections: DashMap<Uuid, mpsc::Sender<Message>>,
    subscriptions: DashMap<Uuid, CollabSubscription>,
}

impl CollabHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, id: Uuid, tx: mpsc::Sender<Message>, subscription: CollabSubscription) {
        self.connections.insert(id, tx);
        self.subscriptions.insert(id, subscription);
    }

    fn unregister(&self, id: Uuid) {
        self.connections.remove(&id);
        self.subscriptions.remove(&id);
    }

    /// Fan out an update to every subscriber whose filter matches.
    pub async fn publish(&self, draft: &CollabLyricDraft) {
        let frame = PublishFrame {
            kind: "collab_lyrics_updated",
            sent_at: Utc::now(),
            item: PublishedItem {
                external_track_id: &draft.external_track_id,
                title: &draft.title,
                project_id: &draft.project_id,
                source: &draft.source,
                artist: &draft.artist,
                bpm: draft.bpm,
                updated_at: draft.updated_at,
                collaborators: &draft.collaborators,
            },
        };
        let Ok(text) = serde_json::to_string(&frame) else {
            return;
        };

        for entry in self.connections.iter() {
            let id = *entry.key();
            let Some(subscription) = self.subscriptions.get(&id) else {
                continue;
            };
            if subscription.matches(draft) {
                let _ = entry.value().send(Message::Text(text.clone())).await;
            }
        }
    }

    /// Close every connection and drop the registry. Called on server
    /// shutdown; the upgrade handler itself is unregistered by dropping
    /// the router.
    pub async fn shutdown(&self) {
        for entry in self.connections.iter() {
            let _ = entry.value().send(Message::Close(None)).await;
        }
        self.connections.clear();
        self.subscriptions.clear();
    }

    /// Drive one accepted connection until it closes.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, subscription: CollabSubscription) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(32);
        let id = Uuid::new_v4();

        self.register(id, tx.clone(), subscription.clone());

        let ready = ReadyFrame {
            kind: "ready",
            channel: "collab_lyrics",
            filters: subscription,
            server_time: Utc::now(),
        };
        if let Ok(text) = serde_json::to_string(&ready) {
            let _ = tx.send(Message::Text(text)).await;
        }

        let forward_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let alive = AtomicBool::new(true);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if !alive.swap(false, Ordering::SeqCst) {
                        break;
                    }
                    if tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Pong(_))) => alive.store(true, Ordering::SeqCst),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }
            }
        }

        forward_handle.abort();
        self.unregister(id);
    }
}
