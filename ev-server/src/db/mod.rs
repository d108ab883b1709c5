//! Postgres connection pool and lazy idempotent schema creation.
//!
//! No `sqlx::migrate!` here — the teacher ships migration files, but this
//! codebase follows §4.G's "creates the required tables and indices lazily
//! and idempotently on first use" requirement directly: every table is
//! `CREATE TABLE IF NOT EXISTS`, run once at pool construction.

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

/// Create the Postgres connection pool, capped per §5's resource model.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .idle_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;

    info!("Connected to PostgreSQL");
    Ok(pool)
}

/// Idempotently create every table and index this server owns.
/// Sum types (`timingConsistency`, `grid.kind`, easepocket `mode`) persist
/// as `TEXT` with an application-level `FromStr`/`Display` round trip rather
/// than native Postgres enums, so this stays a single idempotent pass with
/// no `CREATE TYPE` handling.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS collab_lyrics_drafts (
            external_track_id TEXT PRIMARY KEY,
            project_id TEXT,
            title TEXT NOT NULL,
            artist TEXT,
            bpm DOUBLE PRECISION,
            lyrics TEXT NOT NULL,
            collaborators JSONB NOT NULL DEFAULT '[]',
            source TEXT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            received_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_collab_project_id ON collab_lyrics_drafts(project_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_collab_source ON collab_lyrics_drafts(source)")
        .execute(pool)
        .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS learning_session_events (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            song_id TEXT,
            genre TEXT,
            title TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            duration_seconds DOUBLE PRECISION NOT NULL,
            text_accuracy DOUBLE PRECISION NOT NULL,
            pronunciation_clarity DOUBLE PRECISION NOT NULL,
            timing_consistency TEXT NOT NULL,
            transcript TEXT,
            expected_words JSONB NOT NULL,
            spoken_words JSONB NOT NULL,
            matched_words JSONB NOT NULL,
            weak_words JSONB NOT NULL,
            strong_words JSONB NOT NULL,
            weak_sounds JSONB NOT NULL,
            tips JSONB NOT NULL,
            UNIQUE(user_id, session_id)
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_session_events_user_created \
         ON learning_session_events(user_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS learning_easepocket_events (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            mode TEXT NOT NULL,
            bpm DOUBLE PRECISION NOT NULL,
            grid TEXT NOT NULL,
            beats_per_bar SMALLINT NOT NULL,
            on_time_pct DOUBLE PRECISION NOT NULL,
            mean_abs_ms DOUBLE PRECISION NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE(user_id, event_id)
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_easepocket_events_user_created \
         ON learning_easepocket_events(user_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS learning_word_difficulty (
            word TEXT PRIMARY KEY,
            attempts INTEGER NOT NULL DEFAULT 0,
            failures INTEGER NOT NULL DEFAULT 0,
            successes INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS learning_tip_effectiveness (
            tip_key TEXT PRIMARY KEY,
            shown_count INTEGER NOT NULL DEFAULT 0,
            improved_count INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS learning_user_profiles (
            user_id TEXT PRIMARY KEY,
            profile JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    info!("schema ensured");
    Ok(())
}
