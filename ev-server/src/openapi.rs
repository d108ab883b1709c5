//! Aggregated `OpenAPI` document, served raw as JSON at `/api/v1/openapi.json`.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "EaseVerse Server",
        description = "Vocal-coaching HTTP gateway: timing scoring, adaptive learning, and the collaborative lyrics realtime hub.",
        version = env!("CARGO_PKG_VERSION"),
    ),
    paths(
        crate::api::health,
    ),
    components(schemas(crate::api::HealthResponse)),
    tags(
        (name = "catalog", description = "Route catalog and health"),
        (name = "audio", description = "Pronunciation, text-to-speech, and session scoring"),
        (name = "easepocket", description = "Rhythmic timing scoring"),
        (name = "collab", description = "Collaborative lyric drafts"),
        (name = "learning", description = "Adaptive learning ingestion and profiles"),
    ),
)]
pub struct ApiDoc;
