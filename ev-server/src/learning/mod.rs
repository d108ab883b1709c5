//! Adaptive-learning ingestion engine: feature derivation, per-user
//! profiles, and the global word-difficulty / tip-effectiveness model.

pub mod store;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use dashmap::DashMap;
use ev_common::learning::{
    self, Recommendations, SessionLearningEvent, TipEffectiveness, TipRequest, UserLearningProfile,
    WordDifficulty,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;
use validator::Validate;

use crate::api::{check_api_key, ApiKeyQuery, AppState};
use crate::error::{AppError, AppResult};
use store::LearningStorage;

/// Lazily-created per-user ingestion lock, so same-user ingests serialize
/// while cross-user ingests proceed fully in parallel.
#[derive(Clone, Default)]
pub struct IngestLocks(Arc<DashMap<String, Arc<Mutex<()>>>>);

impl IngestLocks {
    fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.0.entry(user_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

/// Resolve the acting user id per §6: body field, then header, then query,
/// then an anonymous identity derived from the client IP.
pub fn resolve_user_id(
    body_user_id: Option<&str>,
    headers: &HeaderMap,
    query_user_id: Option<&str>,
    client_ip: &str,
) -> String {
    if let Some(id) = body_user_id.filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    if let Some(id) = headers
        .get("x-easeverse-user-id")
        .or_else(|| headers.get("x-user-id"))
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        return id.to_string();
    }
    if let Some(id) = query_user_id.filter(|s| !s.is_empty()) {
        return id.to_string();
    }
    let anon = format!("anon:{client_ip}");
    anon.chars().take(120).collect()
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SessionIngestRequest {
    pub user_id: Option<String>,
    pub session_id: String,
    pub song_id: Option<String>,
    pub genre: Option<String>,
    pub title: Option<String>,
    #[validate(range(min = 0.0))]
    pub duration_seconds: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub text_accuracy: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    pub pronunciation_clarity: f64,
    pub timing_consistency: learning::TimingConsistency,
    pub lyrics: String,
    pub transcript: Option<String>,
    #[serde(default)]
    pub top_to_fix: Vec<TipRequest>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EasePocketIngestRequest {
    pub user_id: Option<String>,
    pub event_id: String,
    pub mode: learning::EasePocketMode,
    #[validate(range(min = 40.0, max = 300.0))]
    pub bpm: f64,
    pub grid: ev_common::grid::GridKind,
    pub beats_per_bar: u8,
    #[validate(range(min = 0.0, max = 100.0))]
    pub on_time_pct: f64,
    #[validate(range(min = 0.0))]
    pub mean_abs_ms: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub ok: bool,
    pub user_id: String,
    pub deduplicated: bool,
    pub profile: UserLearningProfile,
    pub recommendations: Recommendations,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub ok: bool,
    pub user_id: String,
    pub profile: UserLearningProfile,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationsResponse {
    pub ok: bool,
    pub user_id: String,
    pub recommendations: Recommendations,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalModelResponse {
    pub ok: bool,
    pub words: Vec<WordDifficulty>,
    pub tips: Vec<TipEffectiveness>,
}

async fn load_global_maps(storage: &LearningStorage) -> (HashMap<String, WordDifficulty>, HashMap<String, TipEffectiveness>) {
    let words = storage
        .load_all_word_difficulty()
        .await
        .into_iter()
        .map(|w| (w.word.clone(), w))
        .collect();
    let tips = storage
        .load_all_tip_effectiveness()
        .await
        .into_iter()
        .map(|t| (t.tip_key.clone(), t))
        .collect();
    (words, tips)
}

/// Ingest a session event, returning the rebuilt profile and recommendations.
/// Deduplicates on `(user_id, session_id)`.
pub async fn ingest_session(
    storage: &LearningStorage,
    locks: &IngestLocks,
    user_id: &str,
    req: SessionIngestRequest,
) -> AppResult<IngestResponse> {
    let lock = locks.lock_for(user_id);
    let _guard = lock.lock().await;

    if storage.session_event_exists(user_id, &req.session_id).await {
        let profile = load_or_build_empty_profile(storage, user_id).await;
        let (words, tips) = load_global_maps(storage).await;
        let recommendations = learning::build_recommendations(
            &profile,
            &words.into_values().collect::<Vec<_>>(),
            &tips.into_values().collect::<Vec<_>>(),
        );
        return Ok(IngestResponse {
            ok: true,
            user_id: user_id.to_string(),
            deduplicated: true,
            profile,
            recommendations,
        });
    }

    let history = storage.load_history(user_id).await;
    let previous_session = history.sessions.iter().max_by_key(|s| s.created_at).cloned();

    let features = learning::derive_features(
        &req.lyrics,
        req.transcript.as_deref().unwrap_or(""),
        req.transcript.as_deref(),
        &req.top_to_fix,
    );

    let event = SessionLearningEvent {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        session_id: req.session_id,
        song_id: req.song_id,
        genre: req.genre,
        title: req.title,
        created_at: Utc::now(),
        duration_seconds: req.duration_seconds,
        text_accuracy: req.text_accuracy,
        pronunciation_clarity: req.pronunciation_clarity,
        timing_consistency: req.timing_consistency,
        transcript: req.transcript,
        expected_words: features.expected_words,
        spoken_words: features.spoken_words,
        matched_words: features.matched_words,
        weak_words: features.weak_words,
        strong_words: features.strong_words,
        weak_sounds: features.weak_sounds,
        tips: features.tips,
    };

    let (mut words, mut tips) = load_global_maps(storage).await;
    learning::apply_word_counters(&mut words, &event.expected_words, &event.weak_words, &event.strong_words);

    let mut touched_words: HashMap<String, WordDifficulty> = HashMap::new();
    for word in &event.expected_words {
        if let Some(counter) = words.get(word) {
            touched_words.insert(word.clone(), counter.clone());
        }
    }

    let mut touched_tips: HashMap<String, TipEffectiveness> = HashMap::new();
    if let Some(previous) = &previous_session {
        learning::apply_tip_effectiveness(&mut tips, &previous.tips, &event.weak_words);
        for tip in &previous.tips {
            if let Some(counter) = tips.get(&tip.tip_key) {
                touched_tips.insert(tip.tip_key.clone(), counter.clone());
            }
        }
    }

    storage.save_word_counters(&touched_words).await;
    storage.save_tip_effectiveness(&touched_tips).await;
    storage.append_session_event(user_id, event).await;

    let history = storage.load_history(user_id).await;
    let profile = learning::build_profile(user_id, &history.sessions, &history.easepocket, &tips, Utc::now());
    storage.save_profile(user_id, &profile).await;

    let (words, tips) = load_global_maps(storage).await;
    let recommendations = learning::build_recommendations(
        &profile,
        &words.into_values().collect::<Vec<_>>(),
        &tips.into_values().collect::<Vec<_>>(),
    );

    Ok(IngestResponse {
        ok: true,
        user_id: user_id.to_string(),
        deduplicated: false,
        profile,
        recommendations,
    })
}

/// Ingest an EasePocket timing-drill event. Same dedup/profile-rebuild
/// shape as [`ingest_session`], minus word/tip counters (EasePocket events
/// carry no lyric text).
pub async fn ingest_easepocket(
    storage: &LearningStorage,
    locks: &IngestLocks,
    user_id: &str,
    req: EasePocketIngestRequest,
) -> AppResult<IngestResponse> {
    let lock = locks.lock_for(user_id);
    let _guard = lock.lock().await;

    if storage.easepocket_event_exists(user_id, &req.event_id).await {
        let profile = load_or_build_empty_profile(storage, user_id).await;
        let (words, tips) = load_global_maps(storage).await;
        let recommendations = learning::build_recommendations(
            &profile,
            &words.into_values().collect::<Vec<_>>(),
            &tips.into_values().collect::<Vec<_>>(),
        );
        return Ok(IngestResponse {
            ok: true,
            user_id: user_id.to_string(),
            deduplicated: true,
            profile,
            recommendations,
        });
    }

    let event = ev_common::learning::EasePocketLearningEvent {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        event_id: req.event_id,
        mode: req.mode,
        bpm: req.bpm,
        grid: req.grid,
        beats_per_bar: req.beats_per_bar,
        on_time_pct: req.on_time_pct,
        mean_abs_ms: req.mean_abs_ms,
        created_at: Utc::now(),
    };

    storage.append_easepocket_event(user_id, event).await;

    let history = storage.load_history(user_id).await;
    let (_, tips) = load_global_maps(storage).await;
    let profile = learning::build_profile(user_id, &history.sessions, &history.easepocket, &tips, Utc::now());
    storage.save_profile(user_id, &profile).await;

    let (words, tips) = load_global_maps(storage).await;
    let recommendations = learning::build_recommendations(
        &profile,
        &words.into_values().collect::<Vec<_>>(),
        &tips.into_values().collect::<Vec<_>>(),
    );

    Ok(IngestResponse {
        ok: true,
        user_id: user_id.to_string(),
        deduplicated: false,
        profile,
        recommendations,
    })
}

async fn load_or_build_empty_profile(storage: &LearningStorage, user_id: &str) -> UserLearningProfile {
    if let Some(profile) = storage.load_profile(user_id).await {
        return profile;
    }
    learning::build_profile(user_id, &[], &[], &HashMap::new(), Utc::now())
}

/// Derive a fallback client identity: an `x-forwarded-for` entry if a
/// reverse proxy set one, otherwise the directly-connected peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdQuery {
    pub user_id: Option<String>,
}

pub async fn post_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(key): Query<ApiKeyQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<SessionIngestRequest>,
) -> AppResult<Json<IngestResponse>> {
    check_api_key(state.config.external_api_key.as_deref(), &headers, key.as_key())?;
    req.validate().map_err(|e| AppError::Validation(e.to_string()))?;
    let user_id = resolve_user_id(req.user_id.as_deref(), &headers, None, &client_ip(&headers, peer));
    let response = ingest_session(&state.learning_storage, &state.learning_locks, &user_id, req).await?;
    Ok(Json(response))
}

pub async fn post_easepocket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(key): Query<ApiKeyQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<EasePocketIngestRequest>,
) -> AppResult<Json<IngestResponse>> {
    check_api_key(state.config.external_api_key.as_deref(), &headers, key.as_key())?;
    req.validate().map_err(|e| AppError::Validation(e.to_string()))?;
    let user_id = resolve_user_id(req.user_id.as_deref(), &headers, None, &client_ip(&headers, peer));
    let response = ingest_easepocket(&state.learning_storage, &state.learning_locks, &user_id, req).await?;
    Ok(Json(response))
}

pub async fn get_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UserIdQuery>,
    Query(key): Query<ApiKeyQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> AppResult<Json<ProfileResponse>> {
    check_api_key(state.config.external_api_key.as_deref(), &headers, key.as_key())?;
    let user_id = resolve_user_id(None, &headers, query.user_id.as_deref(), &client_ip(&headers, peer));
    let profile = state.learning_storage.load_profile(&user_id).await.ok_or(AppError::NotFound)?;
    Ok(Json(ProfileResponse { ok: true, user_id, profile }))
}

pub async fn get_recommendations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UserIdQuery>,
    Query(key): Query<ApiKeyQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> AppResult<Json<RecommendationsResponse>> {
    check_api_key(state.config.external_api_key.as_deref(), &headers, key.as_key())?;
    let user_id = resolve_user_id(None, &headers, query.user_id.as_deref(), &client_ip(&headers, peer));
    let profile = state.learning_storage.load_profile(&user_id).await.ok_or(AppError::NotFound)?;
    let (words, tips) = load_global_maps(&state.learning_storage).await;
    let recommendations = learning::build_recommendations(
        &profile,
        &words.into_values().collect::<Vec<_>>(),
        &tips.into_values().collect::<Vec<_>>(),
    );
    Ok(Json(RecommendationsResponse { ok: true, user_id, recommendations }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalModelQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub min_attempts: Option<u32>,
}

fn default_limit() -> usize {
    100
}

pub async fn get_global_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<GlobalModelQuery>,
    Query(key): Query<ApiKeyQuery>,
) -> AppResult<Json<GlobalModelResponse>> {
    check_api_key(state.config.external_api_key.as_deref(), &headers, key.as_key())?;
    let limit = query.limit.clamp(1, 100);
    let mut words = state.learning_storage.load_all_word_difficulty().await;
    if let Some(min_attempts) = query.min_attempts {
        words.retain(|w| w.attempts >= min_attempts);
    }
    words.sort_by(|a, b| b.failure_rate().partial_cmp(&a.failure_rate()).unwrap_or(std::cmp::Ordering::Equal));
    words.truncate(limit);

    let mut tips = state.learning_storage.load_all_tip_effectiveness().await;
    tips.sort_by(|a, b| b.success_score().partial_cmp(&a.success_score()).unwrap_or(std::cmp::Ordering::Equal));
    tips.truncate(limit);

    Ok(Json(GlobalModelResponse { ok: true, words, tips }))
}
