//! API router and shared application state.
//!
//! Central routing, the API-key gate, and the catalog/health endpoints.
//! Scoring, learning, and collab handlers live in their own modules and are
//! merged in here.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, HeaderMap, HeaderName, Method};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::collab::store::CollabStorage;
use crate::collab::{self, hub::CollabHub};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::external::{Providers, SpeakRequest, TranscribeRequest};
use crate::learning::{self, store::LearningStorage, IngestLocks};
use crate::ratelimit::{rate_limit_by_ip, with_category, RateLimitCategory, RateLimiter};
use crate::scoring::{ScoreInputs, WorkerPool};

/// 50 MiB: generous enough for a base64-encoded 20-second WAV at 48 kHz/16-bit stereo.
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub learning_storage: LearningStorage,
    pub learning_locks: IngestLocks,
    pub collab_storage: CollabStorage,
    pub collab_hub: Arc<CollabHub>,
    pub rate_limiter: Arc<RateLimiter>,
    pub worker_pool: Arc<WorkerPool>,
    pub providers: Providers,
}

/// Configuration for creating a new [`AppState`].
pub struct AppStateConfig {
    pub config: Config,
    pub learning_storage: LearningStorage,
    pub collab_storage: CollabStorage,
    pub worker_pool: WorkerPool,
    pub providers: Providers,
}

impl AppState {
    #[must_use]
    pub fn new(cfg: AppStateConfig) -> Self {
        Self {
            config: Arc::new(cfg.config),
            learning_storage: cfg.learning_storage,
            learning_locks: IngestLocks::default(),
            collab_storage: cfg.collab_storage,
            collab_hub: CollabHub::new(),
            rate_limiter: Arc::new(RateLimiter::new()),
            worker_pool: Arc::new(cfg.worker_pool),
            providers: cfg.providers,
        }
    }
}

/// Check the API key precedence (`x-api-key` header, then `Authorization:
/// Bearer`, then an `apiKey`/`token` query param) against `secret`. Absence
/// of `secret` disables the gate entirely.
pub(crate) fn check_api_key(secret: Option<&str>, headers: &HeaderMap, query_key: Option<&str>) -> AppResult<()> {
    let Some(expected) = secret else {
        return Ok(());
    };
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .or(query_key);
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(AppError::Auth)
    }
}

/// Query params carrying an out-of-band API key, for routes where a header
/// may not be convenient for the caller (mirrors the WebSocket handshake).
#[derive(Debug, Deserialize, Default)]
pub struct ApiKeyQuery {
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    pub token: Option<String>,
}

impl ApiKeyQuery {
    pub(crate) fn as_key(&self) -> Option<&str> {
        self.api_key.as_deref().or(self.token.as_deref())
    }
}

/// Create the full application router.
pub fn create_router(state: AppState) -> Router {
    let cors = if state.config.cors_allow_all {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<_> = state
            .config
            .cors_allow_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        if origins.is_empty() {
            tracing::warn!("CORS_ALLOW_ORIGINS is empty and CORS_ALLOW_ALL is false; all cross-origin requests will fail");
        }
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, HeaderName::from_static("x-api-key")])
    };

    let pronounce_routes = Router::new()
        .route("/pronounce", post(post_pronounce))
        .layer(from_fn_with_state(state.clone(), rate_limit_by_ip))
        .layer(from_fn(with_category(RateLimitCategory::Pronounce)));

    let session_score_routes = Router::new()
        .route("/session-score", post(post_session_score))
        .layer(from_fn_with_state(state.clone(), rate_limit_by_ip))
        .layer(from_fn(with_category(RateLimitCategory::SessionScore)));

    let easepocket_routes = Router::new()
        .route("/easepocket/consonant-score", post(post_consonant_score))
        .layer(from_fn_with_state(state.clone(), rate_limit_by_ip))
        .layer(from_fn(with_category(RateLimitCategory::EasepocketScore)));

    let learning_routes = Router::new()
        .route("/learning/session", post(learning::post_session))
        .route("/learning/easepocket", post(learning::post_easepocket))
        .route("/learning/profile", get(learning::get_profile))
        .route("/learning/recommendations", get(learning::get_recommendations))
        .route("/learning/global-model", get(learning::get_global_model))
        .layer(from_fn_with_state(state.clone(), rate_limit_by_ip))
        .layer(from_fn(with_category(RateLimitCategory::Learning)));

    let collab_routes = Router::new()
        .route("/collab/lyrics", get(collab::get_lyrics_list).post(collab::post_lyrics))
        .route("/collab/lyrics/{external_track_id}", get(collab::get_lyrics_one));

    let v1 = Router::new()
        .route("/", get(catalog))
        .route("/health", get(health))
        .route("/openapi.json", get(openapi_json))
        .route("/tts", post(post_tts))
        .route("/ws", get(collab::ws_upgrade))
        .merge(pronounce_routes)
        .merge(session_score_routes)
        .merge(easepocket_routes)
        .merge(learning_routes)
        .merge(collab_routes);

    Router::new()
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct CatalogEntry {
    method: &'static str,
    path: &'static str,
}

#[derive(Debug, Serialize)]
struct CatalogResponse {
    name: &'static str,
    version: &'static str,
    routes: Vec<CatalogEntry>,
}

async fn catalog(headers: HeaderMap, State(state): State<AppState>) -> AppResult<Json<CatalogResponse>> {
    check_api_key(state.config.external_api_key.as_deref(), &headers, None)?;
    Ok(Json(CatalogResponse {
        name: "easeverse-server",
        version: env!("CARGO_PKG_VERSION"),
        routes: vec![
            CatalogEntry { method: "GET", path: "/api/v1/health" },
            CatalogEntry { method: "GET", path: "/api/v1/openapi.json" },
            CatalogEntry { method: "POST", path: "/api/v1/tts" },
            CatalogEntry { method: "POST", path: "/api/v1/pronounce" },
            CatalogEntry { method: "POST", path: "/api/v1/session-score" },
            CatalogEntry { method: "POST", path: "/api/v1/easepocket/consonant-score" },
            CatalogEntry { method: "GET", path: "/api/v1/collab/lyrics" },
            CatalogEntry { method: "POST", path: "/api/v1/collab/lyrics" },
            CatalogEntry { method: "GET", path: "/api/v1/collab/lyrics/:externalTrackId" },
            CatalogEntry { method: "POST", path: "/api/v1/learning/session" },
            CatalogEntry { method: "POST", path: "/api/v1/learning/easepocket" },
            CatalogEntry { method: "GET", path: "/api/v1/learning/profile" },
            CatalogEntry { method: "GET", path: "/api/v1/learning/recommendations" },
            CatalogEntry { method: "GET", path: "/api/v1/learning/global-model" },
            CatalogEntry { method: "GET", path: "/api/v1/ws" },
        ],
    }))
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
struct WorkerStatus {
    count: usize,
    queue_limit: usize,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HealthResponse {
    ok: bool,
    version: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    storage: &'static str,
    workers: WorkerStatus,
}

/// Liveness and capacity check.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "catalog",
    responses(
        (status = 200, description = "Service is reachable", body = HealthResponse),
    ),
)]
pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now(),
        storage: state.collab_storage.label(),
        workers: WorkerStatus {
            count: state.config.worker_count,
            queue_limit: state.config.worker_queue_limit,
        },
    })
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    use utoipa::OpenApi as _;
    Json(crate::openapi::ApiDoc::openapi())
}

#[derive(Debug, Deserialize)]
struct TtsRequest {
    text: String,
    voice: Option<String>,
}

async fn post_tts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(key): Query<ApiKeyQuery>,
    Json(req): Json<TtsRequest>,
) -> AppResult<impl IntoResponse> {
    check_api_key(state.config.external_api_key.as_deref(), &headers, key.as_key())?;
    if req.text.is_empty() || req.text.chars().count() > 500 {
        return Err(AppError::Validation("text must be 1-500 characters".to_string()));
    }
    let speaker = state
        .providers
        .speaker
        .as_ref()
        .ok_or_else(|| AppError::NotConfigured("text-to-speech provider".to_string()))?;
    let _ = req.voice;
    let bytes = speaker.synthesize_bytes(&req.text).await?;
    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], bytes))
}

#[derive(Debug, Deserialize)]
struct PronounceRequest {
    word: String,
    context: Option<String>,
    language: Option<String>,
    #[serde(rename = "accentGoal")]
    accent_goal: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PronounceResponse {
    word: String,
    phonetic: String,
    tip: String,
    slow: bool,
    audio_base64: String,
}

/// A coarse phonetic respelling: not a true IPA transcription (no G2P model
/// is in scope), but enough to give a learner a syllable-shaped hint.
fn naive_phonetic(word: &str) -> String {
    let lower = word.to_lowercase();
    let vowels = ['a', 'e', 'i', 'o', 'u', 'y'];
    let mut out = String::new();
    for (i, c) in lower.chars().enumerate() {
        if i > 0 && vowels.contains(&c) && !vowels.contains(&lower.chars().nth(i - 1).unwrap_or(' ')) {
            out.push('-');
        }
        out.push(c);
    }
    out
}

fn pronunciation_tip(word: &str) -> String {
    let lower = word.to_lowercase();
    if lower.chars().rev().take(2).collect::<Vec<_>>().iter().any(|c| "bdgptk".contains(*c)) {
        "Land firmly on the final consonant instead of swallowing it.".to_string()
    } else if lower.ends_with("ing") {
        "Keep the back-of-tongue 'ng' closure through the whole syllable.".to_string()
    } else if lower.chars().filter(|c| "aeiou".contains(*c)).count() >= 3 {
        "Give each vowel its own clear shape rather than blending through them.".to_string()
    } else {
        "Slow the word down and exaggerate each syllable boundary.".to_string()
    }
}

async fn post_pronounce(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(key): Query<ApiKeyQuery>,
    Json(req): Json<PronounceRequest>,
) -> AppResult<Json<PronounceResponse>> {
    check_api_key(state.config.pronounce_api_key.as_deref(), &headers, key.as_key())?;
    if req.word.is_empty() || req.word.chars().count() > 60 {
        return Err(AppError::Validation("word must be 1-60 characters".to_string()));
    }

    let speaker = state
        .providers
        .speaker
        .as_ref()
        .ok_or_else(|| AppError::NotConfigured("text-to-speech provider".to_string()))?;

    let _ = (req.context, req.language.clone());
    let spoken = speaker
        .speak(SpeakRequest {
            text: req.word.clone(),
            voice: None,
            language: req.language,
            accent_goal: req.accent_goal,
            slow: true,
        })
        .await?;

    Ok(Json(PronounceResponse {
        phonetic: naive_phonetic(&req.word),
        tip: pronunciation_tip(&req.word),
        word: req.word,
        slow: true,
        audio_base64: spoken.audio_base64,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionScoreRequest {
    lyrics: String,
    audio_base64: String,
    duration_seconds: Option<f64>,
    language: Option<String>,
    #[serde(rename = "accentGoal")]
    accent_goal: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionScoreResponse {
    ok: bool,
    transcript: String,
    duration_seconds: Option<f64>,
    text_accuracy: f64,
    pronunciation_clarity: f64,
    timing_consistency: ev_common::learning::TimingConsistency,
    expected_words: Vec<String>,
    spoken_words: Vec<String>,
    matched_words: Vec<String>,
    weak_words: Vec<String>,
    strong_words: Vec<String>,
    weak_sounds: std::collections::HashMap<String, u32>,
}

async fn post_session_score(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(key): Query<ApiKeyQuery>,
    Json(req): Json<SessionScoreRequest>,
) -> AppResult<Json<SessionScoreResponse>> {
    check_api_key(state.config.session_scoring_api_key.as_deref(), &headers, key.as_key())?;
    if req.lyrics.trim().is_empty() {
        return Err(AppError::Validation("lyrics must not be empty".to_string()));
    }
    base64::engine::general_purpose::STANDARD
        .decode(&req.audio_base64)
        .map_err(|e| AppError::Validation(format!("invalid base64 audio: {e}")))?;

    let transcriber = state
        .providers
        .transcriber
        .as_ref()
        .ok_or_else(|| AppError::NotConfigured("speech-to-text provider".to_string()))?;

    let _ = req.accent_goal;
    let transcribed = transcriber
        .transcribe(TranscribeRequest {
            audio_base64: req.audio_base64,
            language: req.language,
        })
        .await?;

    let features = ev_common::learning::derive_features(&req.lyrics, &transcribed.transcript, Some(&transcribed.transcript), &[]);

    let expected = features.expected_words.len().max(1) as f64;
    let text_accuracy = (features.matched_words.len() as f64 / expected * 100.0).min(100.0);
    let pronunciation_clarity = if features.expected_words.is_empty() {
        0.0
    } else {
        ((features.expected_words.len() - features.weak_words.len().min(features.expected_words.len())) as f64 / expected
            * 100.0)
            .clamp(0.0, 100.0)
    };
    let weak_rate = features.weak_words.len() as f64 / expected;
    let timing_consistency = if weak_rate < 0.2 {
        ev_common::learning::TimingConsistency::High
    } else if weak_rate < 0.5 {
        ev_common::learning::TimingConsistency::Medium
    } else {
        ev_common::learning::TimingConsistency::Low
    };

    Ok(Json(SessionScoreResponse {
        ok: true,
        transcript: transcribed.transcript,
        duration_seconds: req.duration_seconds,
        text_accuracy,
        pronunciation_clarity,
        timing_consistency,
        expected_words: features.expected_words,
        spoken_words: features.spoken_words,
        matched_words: features.matched_words,
        weak_words: features.weak_words,
        strong_words: features.strong_words,
        weak_sounds: features.weak_sounds,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsonantScoreRequest {
    audio_base64: String,
    bpm: f64,
    grid: Option<ev_common::grid::GridKind>,
    tolerance_ms: Option<f64>,
    max_events: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsonantScoreResponse {
    ok: bool,
    duration_seconds: f64,
    #[serde(flatten)]
    score: ev_common::grid::TimingScore,
}

async fn post_consonant_score(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(key): Query<ApiKeyQuery>,
    Json(req): Json<ConsonantScoreRequest>,
) -> AppResult<Json<ConsonantScoreResponse>> {
    check_api_key(state.config.external_api_key.as_deref(), &headers, key.as_key())?;
    if !(40.0..=300.0).contains(&req.bpm) {
        return Err(AppError::Validation("bpm must be between 40 and 300".to_string()));
    }
    let tolerance_ms = req.tolerance_ms.unwrap_or(15.0);
    if !(5.0..=60.0).contains(&tolerance_ms) {
        return Err(AppError::Validation("toleranceMs must be between 5 and 60".to_string()));
    }
    let max_events = req.max_events.unwrap_or(180);
    if !(20..=300).contains(&max_events) {
        return Err(AppError::Validation("maxEvents must be between 20 and 300".to_string()));
    }

    let inputs = ScoreInputs {
        audio_base64: req.audio_base64,
        bpm: req.bpm,
        grid: req.grid.unwrap_or(ev_common::grid::GridKind::Sixteenth),
        tolerance_ms,
        max_events,
    };
    let outcome = state.worker_pool.submit(inputs).await?;

    Ok(Json(ConsonantScoreResponse {
        ok: true,
        duration_seconds: outcome.duration_seconds,
        score: outcome.score,
    }))
}
