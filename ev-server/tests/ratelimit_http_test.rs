//! HTTP-level rate limiting: the session-score category allows 12 requests
//! per minute per client and rejects the 13th with 429, regardless of what
//! the handler itself would have done with the request.

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine as _;
use helpers::{send, test_router};

#[tokio::test]
async fn thirteenth_rapid_session_score_request_is_rejected() {
    let router = test_router();
    let payload = serde_json::json!({
        "lyrics": "a quick warmup phrase",
        "audioBase64": base64::engine::general_purpose::STANDARD.encode(b"not-real-audio-bytes"),
    });

    let mut last_status = StatusCode::OK;
    for _ in 0..13 {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/session-score")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap();
        last_status = send(&router, request).await.status();
    }

    assert_eq!(last_status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn distinct_categories_are_rate_limited_independently() {
    let router = test_router();

    for _ in 0..12 {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/session-score")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"lyrics": "x", "audioBase64": "eA=="}).to_string(),
            ))
            .unwrap();
        assert_ne!(send(&router, request).await.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    let easepocket_request = Request::builder()
        .method("POST")
        .uri("/api/v1/easepocket/consonant-score")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({"audioBase64": "eA==", "bpm": 120.0}).to_string(),
        ))
        .unwrap();
    assert_ne!(send(&router, easepocket_request).await.status(), StatusCode::TOO_MANY_REQUESTS);
}
