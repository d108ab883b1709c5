//! EaseVerse Server - Main Entry Point
//!
//! Vocal-coaching HTTP gateway backend.

use std::net::SocketAddr;

use anyhow::Result;
use tracing::info;

use ev_server::api::{self, AppState, AppStateConfig};
use ev_server::collab::store::CollabStorage;
use ev_server::config::Config;
use ev_server::db;
use ev_server::external::Providers;
use ev_server::learning::store::LearningStorage;
use ev_server::ratelimit;
use ev_server::scoring::WorkerPool;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ev_server=info,tower_http=info".into()),
        )
        .json()
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting EaseVerse server");

    let (learning_storage, collab_storage) = if let Some(database_url) = &config.database_url {
        let pool = db::create_pool(database_url).await?;
        db::ensure_schema(&pool).await?;
        info!("connected to postgres storage");
        (LearningStorage::postgres(pool.clone()), CollabStorage::postgres(pool))
    } else {
        info!("DATABASE_URL not set, using in-memory storage");
        (LearningStorage::memory(), CollabStorage::memory())
    };

    let providers = Providers::from_config(&config);
    if providers.transcriber.is_none() {
        tracing::warn!("TRANSCRIBER_BASE_URL not set, /session-score will return 503");
    }
    if providers.speaker.is_none() {
        tracing::warn!("SPEAKER_BASE_URL not set, /tts and /pronounce will return 503");
    }

    let worker_pool = WorkerPool::new(
        config.worker_count,
        config.worker_queue_limit,
        config.worker_task_timeout_ms,
        config.worker_disabled,
    );

    let bind_address = config.bind_address.clone();
    let state = AppState::new(AppStateConfig {
        config,
        learning_storage,
        collab_storage,
        worker_pool,
        providers,
    });

    let cleanup_handle = ratelimit::spawn_cleanup_task(state.rate_limiter.clone());
    let collab_hub = state.collab_hub.clone();

    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, "server listening");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c signal handler");
        info!("received shutdown signal, cleaning up");
    };

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    collab_hub.shutdown().await;
    cleanup_handle.abort();

    info!("server shutdown complete");

    Ok(())
}
