//! Reusable test helpers for HTTP/WebSocket integration tests.

use std::net::{Ipv4Addr, SocketAddr};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response};
use axum::Router;
use ev_server::api::{create_router, AppState, AppStateConfig};
use ev_server::collab::store::CollabStorage;
use ev_server::config::Config;
use ev_server::external::Providers;
use ev_server::learning::store::LearningStorage;
use ev_server::scoring::WorkerPool;
use http_body_util::BodyExt;
use tower::ServiceExt;

/// Stand-in peer address for `oneshot` requests, which never go through a
/// real socket and so never pick up a `ConnectInfo` extension on their own.
const TEST_PEER: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 51_000);

/// Build an `AppState` with in-memory storage, no external providers, and
/// an inline (non-pooled) scoring pipeline — network-free, per
/// `Config::default_for_test`.
#[must_use]
pub fn test_state() -> AppState {
    let config = Config::default_for_test();
    let worker_pool = WorkerPool::new(
        config.worker_count,
        config.worker_queue_limit,
        config.worker_task_timeout_ms,
        config.worker_disabled,
    );
    let providers = Providers::from_config(&config);
    AppState::new(AppStateConfig {
        config,
        learning_storage: LearningStorage::memory(),
        collab_storage: CollabStorage::memory(),
        worker_pool,
        providers,
    })
}

#[must_use]
pub fn test_router() -> Router {
    create_router(test_state())
}

/// Send a request through `router` via `oneshot`, attaching a fake
/// `ConnectInfo` so the IP-keyed rate-limit middleware has a peer address
/// to key its buckets on.
pub async fn send(router: &Router, mut request: Request<Body>) -> Response<Body> {
    request.extensions_mut().insert(ConnectInfo(TEST_PEER));
    router.clone().oneshot(request).await.expect("oneshot request failed")
}

pub async fn body_to_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.expect("collect response body").to_bytes();
    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        let preview = String::from_utf8_lossy(&bytes);
        panic!("failed to parse response as JSON: {e}\nbody: {preview}")
    })
}

/// A real server bound to an ephemeral localhost port, for tests that need
/// a genuine TCP connection — a WebSocket upgrade cannot be driven through
/// `oneshot`.
pub struct TestServer {
    pub addr: SocketAddr,
}

pub async fn spawn_test_server(router: Router) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("read local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await;
    });
    TestServer { addr }
}
