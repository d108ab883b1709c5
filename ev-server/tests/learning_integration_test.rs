//! Learning-engine integration tests driven through the full router:
//! session dedupe and tip-effectiveness tracking across two ingests.

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use helpers::{body_to_json, send, test_router};
use serde_json::{json, Value};

async fn post_session(router: &Router, body: &Value) -> Value {
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/learning/session")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = send(router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    body_to_json(response).await
}

async fn get_global_model(router: &Router) -> Value {
    let request = Request::builder()
        .method("GET")
        .uri("/api/v1/learning/global-model")
        .body(Body::empty())
        .unwrap();
    let response = send(router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    body_to_json(response).await
}

fn word_entry<'a>(model: &'a Value, word: &str) -> &'a Value {
    model["words"]
        .as_array()
        .expect("words array")
        .iter()
        .find(|w| w["word"] == word)
        .unwrap_or_else(|| panic!("word {word} missing from global model"))
}

fn tip_entry<'a>(model: &'a Value, tip_key: &str) -> &'a Value {
    model["tips"]
        .as_array()
        .expect("tips array")
        .iter()
        .find(|t| t["tipKey"] == tip_key)
        .unwrap_or_else(|| panic!("tip {tip_key} missing from global model"))
}

/// Re-posting the same `(userId, sessionId)` is a no-op the second time:
/// the response reports `deduplicated: true` and the global word counters
/// don't move.
#[tokio::test]
async fn repeated_session_id_is_deduplicated() {
    let router = test_router();
    let body = json!({
        "userId": "dedupe-user",
        "sessionId": "session-1",
        "durationSeconds": 12.0,
        "textAccuracy": 80.0,
        "pronunciationClarity": 75.0,
        "timingConsistency": "medium",
        "lyrics": "rhythm and rhyme carry the song",
        "topToFix": [],
    });

    let first = post_session(&router, &body).await;
    assert_eq!(first["deduplicated"], false);

    let second = post_session(&router, &body).await;
    assert_eq!(second["deduplicated"], true);

    let model = get_global_model(&router).await;
    assert_eq!(word_entry(&model, "rhythm")["attempts"], 1);
}

/// A tip shown in one session counts as effective if the flagged word is no
/// longer weak in the user's very next session.
#[tokio::test]
async fn tip_shown_then_word_no_longer_weak_counts_as_improved() {
    let router = test_router();

    let session_a = json!({
        "userId": "tip-user",
        "sessionId": "a1",
        "durationSeconds": 10.0,
        "textAccuracy": 70.0,
        "pronunciationClarity": 65.0,
        "timingConsistency": "low",
        "lyrics": "the rhythm never stops",
        "topToFix": [{"word": "rhythm", "reason": "Breath Support"}],
    });
    post_session(&router, &session_a).await;

    let session_b = json!({
        "userId": "tip-user",
        "sessionId": "b1",
        "durationSeconds": 10.0,
        "textAccuracy": 95.0,
        "pronunciationClarity": 90.0,
        "timingConsistency": "high",
        "lyrics": "the rhythm keeps going",
        "topToFix": [],
    });
    post_session(&router, &session_b).await;

    let model = get_global_model(&router).await;
    let tip = tip_entry(&model, "breath-support:medium");
    assert_eq!(tip["shownCount"], 1);
    assert_eq!(tip["improvedCount"], 1);
}
