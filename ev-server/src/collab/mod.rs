//! Collaborative lyric draft storage and realtime fan-out.
//!
//! REST upsert/get/list over [`store::CollabStorage`], plus the `/ws`
//! upgrade handler that hands accepted sockets to [`hub::CollabHub`].

pub mod hub;
pub mod store;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ev_common::collab::{CollabLyricDraft, CollabLyricFilter, CollabLyricUpsert, CollabSubscription};
use serde::{Deserialize, Serialize};

use crate::api::{check_api_key, ApiKeyQuery, AppState};
use crate::error::{AppError, AppResult};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResponse {
    pub ok: bool,
    pub storage: &'static str,
    pub item: CollabLyricDraft,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub ok: bool,
    pub storage: &'static str,
    pub count: usize,
    pub items: Vec<CollabLyricDraft>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub project_id: Option<String>,
    pub source: Option<String>,
}

pub async fn post_lyrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(key): Query<ApiKeyQuery>,
    Json(upsert): Json<CollabLyricUpsert>,
) -> AppResult<Json<UpsertResponse>> {
    check_api_key(state.config.external_api_key.as_deref(), &headers, key.as_key())?;
    if upsert.external_track_id.trim().is_empty() {
        return Err(AppError::Validation("externalTrackId is required".to_string()));
    }
    if upsert.title.trim().is_empty() {
        return Err(AppError::Validation("title is required".to_string()));
    }

    let item = state.collab_storage.upsert(upsert).await;
    state.collab_hub.publish(&item).await;

    Ok(Json(UpsertResponse {
        ok: true,
        storage: state.collab_storage.label(),
        item,
    }))
}

pub async fn get_lyrics_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
    Query(key): Query<ApiKeyQuery>,
) -> AppResult<Json<ListResponse>> {
    check_api_key(state.config.external_api_key.as_deref(), &headers, key.as_key())?;
    let filter = CollabLyricFilter {
        project_id: query.project_id,
        source: query.source,
    };
    let items = state.collab_storage.list(&filter).await;
    Ok(Json(ListResponse {
        ok: true,
        storage: state.collab_storage.label(),
        count: items.len(),
        items,
    }))
}

pub async fn get_lyrics_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(key): Query<ApiKeyQuery>,
    Path(external_track_id): Path<String>,
) -> AppResult<Json<UpsertResponse>> {
    check_api_key(state.config.external_api_key.as_deref(), &headers, key.as_key())?;
    let item = state.collab_storage.get(&external_track_id).await.ok_or(AppError::NotFound)?;
    Ok(Json(UpsertResponse {
        ok: true,
        storage: state.collab_storage.label(),
        item,
    }))
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub source: Option<String>,
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
    #[serde(rename = "externalTrackId")]
    pub external_track_id: Option<String>,
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    pub token: Option<String>,
}

fn query_key(query: &WsQuery) -> Option<&str> {
    query.api_key.as_deref().or(query.token.as_deref())
}

fn origin_allowed(headers: &HeaderMap, config: &crate::config::Config) -> bool {
    let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    if config.cors_allow_all {
        return true;
    }
    if config.cors_allow_origins.iter().any(|o| o == origin) {
        return true;
    }
    origin.contains("://localhost") || origin.contains("://127.0.0.1") || origin.contains("://[::1]")
}

/// Upgrade handler for `GET /api/v1/ws`. Gates on API key and `Origin`
/// before accepting; unlike the REST routes this reads the key from the
/// query string too, since browsers cannot set headers on a WS handshake.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(expected) = &state.config.external_api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .or_else(|| query_key(&query));
        if provided != Some(expected.as_str()) {
            return AppError::Auth.into_response();
        }
    }

    if !origin_allowed(&headers, &state.config) {
        return (axum::http::StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let subscription = CollabSubscription {
        source: query.source,
        project_id: query.project_id,
        external_track_id: query.external_track_id,
    };

    ws.on_upgrade(move |socket: WebSocket| async move {
        state.collab_hub.clone().handle_socket(socket, subscription).await;
    })
}
