//! Dual storage for collaborative lyric drafts: Postgres-backed when
//! `DATABASE_URL` is configured, an in-memory map otherwise. A Postgres
//! write failure falls back to memory with an error-level log — the
//! record is still retained and the response still succeeds.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use ev_common::collab::{CollabLyricDraft, CollabLyricFilter, CollabLyricUpsert};
use sqlx::PgPool;

#[derive(Clone, Default)]
pub struct MemoryCollabStore {
    drafts: Arc<DashMap<String, CollabLyricDraft>>,
}

#[derive(Clone)]
pub struct PostgresCollabStore {
    pool: PgPool,
    /// Shadow copy used only when a Postgres call fails, so the record is
    /// still retained in-process per §4.G's fallback policy.
    fallback: Arc<DashMap<String, CollabLyricDraft>>,
}

impl PostgresCollabStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            fallback: Arc::new(DashMap::new()),
        }
    }
}

#[derive(Clone)]
pub enum CollabStorage {
    Postgres(PostgresCollabStore),
    Memory(MemoryCollabStore),
}

impl CollabStorage {
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(MemoryCollabStore::default())
    }

    #[must_use]
    pub fn postgres(pool: PgPool) -> Self {
        Self::Postgres(PostgresCollabStore::new(pool))
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    pub async fn get(&self, external_track_id: &str) -> Option<CollabLyricDraft> {
        match self {
            Self::Memory(store) => store.drafts.get(external_track_id).map(|r| r.clone()),
            Self::Postgres(store) => match fetch_one_pg(&store.pool, external_track_id).await {
                Ok(draft) => draft,
                Err(err) => {
                    tracing::error!(error = %err, "postgres get failed, checking memory fallback");
                    store.fallback.get(external_track_id).map(|r| r.clone())
                }
            },
        }
    }

    pub async fn list(&self, filter: &CollabLyricFilter) -> Vec<CollabLyricDraft> {
        let mut drafts = match self {
            Self::Memory(store) => store.drafts.iter().map(|r| r.clone()).collect::<Vec<_>>(),
            Self::Postgres(store) => match fetch_all_pg(&store.pool).await {
                Ok(drafts) => drafts,
                Err(err) => {
                    tracing::error!(error = %err, "postgres list failed, falling back to memory");
                    store.fallback.iter().map(|r| r.clone()).collect()
                }
            },
        };
        drafts.retain(|d| filter.matches(d));
        drafts.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        drafts
    }

    /// Merge-upsert a draft, returning the stored record.
    pub async fn upsert(&self, upsert: CollabLyricUpsert) -> CollabLyricDraft {
        let now = Utc::now();
        match self {
            Self::Memory(store) => {
                let existing = store.drafts.get(&upsert.external_track_id).map(|r| r.clone());
                let merged = CollabLyricDraft::merge(existing.as_ref(), upsert, now);
                store.drafts.insert(merged.external_track_id.clone(), merged.clone());
                merged
            }
            Self::Postgres(store) => {
                let existing = match fetch_one_pg(&store.pool, &upsert.external_track_id).await {
                    Ok(draft) => draft,
                    Err(err) => {
                        tracing::error!(error = %err, "postgres fetch-before-merge failed, using memory fallback");
                        store.fallback.get(&upsert.external_track_id).map(|r| r.clone())
                    }
                };
                let merged = CollabLyricDraft::merge(existing.as_ref(), upsert, now);
                if let Err(err) = upsert_pg(&store.pool, &merged).await {
                    tracing::error!(error = %err, "postgres upsert failed, keeping memory fallback");
                }
                store.fallback.insert(merged.external_track_id.clone(), merged.clone());
                merged
            }
        }
    }
}

#[derive(sqlx::FromRow)]
struct DraftRow {
    external_track_id: String,
    project_id: Option<String>,
    title: String,
    artist: Option<String>,
    bpm: Option<f64>,
    lyrics: String,
    collaborators: serde_json::Value,
    source: String,
    updated_at: chrono::DateTime<Utc>,
    received_at: chrono::DateTime<Utc>,
}

impl DraftRow {
    fn into_domain(self) -> Option<CollabLyricDraft> {
        Some(CollabLyricDraft {
            external_track_id: self.external_track_id,
            project_id: self.project_id,
            title: self.title,
            artist: self.artist,
            bpm: self.bpm,
            lyrics: self.lyrics,
            collaborators: serde_json::from_value(self.collaborators).ok()?,
            source: self.source,
            updated_at: self.updated_at,
            received_at: self.received_at,
        })
    }
}

async fn fetch_one_pg(pool: &PgPool, external_track_id: &str) -> sqlx::Result<Option<CollabLyricDraft>> {
    let row = sqlx::query_as::<_, DraftRow>(
        "SELECT external_track_id, project_id, title, artist, bpm, lyrics, collaborators, source, \
         updated_at, received_at FROM collab_lyrics_drafts WHERE external_track_id = $1",
    )
    .bind(external_track_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.and_then(DraftRow::into_domain))
}

async fn fetch_all_pg(pool: &PgPool) -> sqlx::Result<Vec<CollabLyricDraft>> {
    let rows = sqlx::query_as::<_, DraftRow>(
        "SELECT external_track_id, project_id, title, artist, bpm, lyrics, collaborators, source, \
         updated_at, received_at FROM collab_lyrics_drafts",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().filter_map(DraftRow::into_domain).collect())
}

async fn upsert_pg(pool: &PgPool, draft: &CollabLyricDraft) -> sqlx::Result<()> {
    sqlx::query(
        r"
        INSERT INTO collab_lyrics_drafts
            (external_track_id, project_id, title, artist, bpm, lyrics, collaborators, source, updated_at, received_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
        ON CONFLICT (external_track_id) DO UPDATE SET
            project_id = $2, title = $3, artist = $4, bpm = $5, lyrics = $6,
            collaborators = $7, source = $8, updated_at = $9
        ",
    )
    .bind(&draft.external_track_id)
    .bind(&draft.project_id)
    .bind(&draft.title)
    .bind(&draft.artist)
    .bind(draft.bpm)
    .bind(&draft.lyrics)
    .bind(serde_json::to_value(&draft.collaborators).unwrap_or_default())
    .bind(&draft.source)
    .bind(draft.updated_at)
    .bind(draft.received_at)
    .execute(pool)
    .await?;
    Ok(())
}
