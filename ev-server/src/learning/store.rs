//! Dual storage for the learning engine: Postgres-backed when `DATABASE_URL`
//! is configured, an in-memory map otherwise. A Postgres write failure falls
//! back to memory with an error-level log rather than failing the request,
//! mirroring the collab store's fallback policy.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use ev_common::learning::{
    EasePocketLearningEvent, SessionLearningEvent, TipEffectiveness, UserLearningProfile,
    WordDifficulty,
};
use sqlx::PgPool;
use tokio::sync::RwLock;

/// Everything the ingestion/query path needs from a user's event history,
/// loaded in one shot to keep a single critical section per ingest.
#[derive(Default, Clone)]
pub struct UserHistory {
    pub sessions: Vec<SessionLearningEvent>,
    pub easepocket: Vec<EasePocketLearningEvent>,
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, Vec<SessionLearningEvent>>,
    easepocket: HashMap<String, Vec<EasePocketLearningEvent>>,
    words: HashMap<String, WordDifficulty>,
    tips: HashMap<String, TipEffectiveness>,
    profiles: HashMap<String, UserLearningProfile>,
}

/// In-memory learning store. Single `RwLock` guards all maps, matching
/// §5's "short critical section around the event list and counters" per
/// ingest; cross-user ingests may still race on the lock but never corrupt
/// state.
#[derive(Clone, Default)]
pub struct MemoryLearningStore {
    state: Arc<RwLock<MemoryState>>,
}

/// Postgres-backed learning store.
#[derive(Clone)]
pub struct PostgresLearningStore {
    pool: PgPool,
}

impl PostgresLearningStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Dispatches to whichever backing store is configured.
#[derive(Clone)]
pub enum LearningStorage {
    Postgres(PostgresLearningStore),
    Memory(MemoryLearningStore),
}

impl LearningStorage {
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(MemoryLearningStore::default())
    }

    #[must_use]
    pub const fn postgres(pool: PgPool) -> Self {
        Self::Postgres(PostgresLearningStore::new(pool))
    }

    pub async fn session_event_exists(&self, user_id: &str, session_id: &str) -> bool {
        match self {
            Self::Memory(store) => {
                let state = store.state.read().await;
                state
                    .sessions
                    .get(user_id)
                    .is_some_and(|events| events.iter().any(|e| e.session_id == session_id))
            }
            Self::Postgres(store) => {
                match sqlx::query_scalar::<_, i64>(
                    "SELECT count(*) FROM learning_session_events WHERE user_id = $1 AND session_id = $2",
                )
                .bind(user_id)
                .bind(session_id)
                .fetch_one(&store.pool)
                .await
                {
                    Ok(count) => count > 0,
                    Err(err) => {
                        tracing::error!(error = %err, "postgres session_event_exists failed, falling back to false");
                        false
                    }
                }
            }
        }
    }

    pub async fn easepocket_event_exists(&self, user_id: &str, event_id: &str) -> bool {
        match self {
            Self::Memory(store) => {
                let state = store.state.read().await;
                state
                    .easepocket
                    .get(user_id)
                    .is_some_and(|events| events.iter().any(|e| e.event_id == event_id))
            }
            Self::Postgres(store) => {
                match sqlx::query_scalar::<_, i64>(
                    "SELECT count(*) FROM learning_easepocket_events WHERE user_id = $1 AND event_id = $2",
                )
                .bind(user_id)
                .bind(event_id)
                .fetch_one(&store.pool)
                .await
                {
                    Ok(count) => count > 0,
                    Err(err) => {
                        tracing::error!(error = %err, "postgres easepocket_event_exists failed, falling back to false");
                        false
                    }
                }
            }
        }
    }

    pub async fn load_history(&self, user_id: &str) -> UserHistory {
        match self {
            Self::Memory(store) => {
                let state = store.state.read().await;
                UserHistory {
                    sessions: state.sessions.get(user_id).cloned().unwrap_or_default(),
                    easepocket: state.easepocket.get(user_id).cloned().unwrap_or_default(),
                }
            }
            Self::Postgres(store) => match load_history_pg(&store.pool, user_id).await {
                Ok(history) => history,
                Err(err) => {
                    tracing::error!(error = %err, "postgres load_history failed, returning empty history");
                    UserHistory::default()
                }
            },
        }
    }

    pub async fn append_session_event(&self, user_id: &str, event: SessionLearningEvent) {
        match self {
            Self::Memory(store) => {
                let mut state = store.state.write().await;
                state.sessions.entry(user_id.to_string()).or_default().push(event);
            }
            Self::Postgres(store) => {
                if let Err(err) = insert_session_event_pg(&store.pool, &event).await {
                    tracing::error!(error = %err, "postgres append_session_event failed, falling back to memory");
                    // Fall back silently: the caller still sees success, matching §7's
                    // "storage layer swallows Postgres failures into the in-memory
                    // fallback" policy. We keep a process-local shadow copy so the
                    // in-process profile/read path stays consistent for this run.
                    FALLBACK.session_store(user_id, event).await;
                }
            }
        }
    }

    pub async fn append_easepocket_event(&self, user_id: &str, event: EasePocketLearningEvent) {
        match self {
            Self::Memory(store) => {
                let mut state = store.state.write().await;
                state.easepocket.entry(user_id.to_string()).or_default().push(event);
            }
            Self::Postgres(store) => {
                if let Err(err) = insert_easepocket_event_pg(&store.pool, &event).await {
                    tracing::error!(error = %err, "postgres append_easepocket_event failed, falling back to memory");
                    FALLBACK.easepocket_store(user_id, event).await;
                }
            }
        }
    }

    pub async fn load_all_word_difficulty(&self) -> Vec<WordDifficulty> {
        match self {
            Self::Memory(store) => store.state.read().await.words.values().cloned().collect(),
            Self::Postgres(store) => match sqlx::query_as::<_, WordDifficultyRow>(
                "SELECT word, attempts, failures, successes FROM learning_word_difficulty",
            )
            .fetch_all(&store.pool)
            .await
            {
                Ok(rows) => rows.into_iter().map(WordDifficultyRow::into_domain).collect(),
                Err(err) => {
                    tracing::error!(error = %err, "postgres load_all_word_difficulty failed");
                    Vec::new()
                }
            },
        }
    }

    pub async fn load_all_tip_effectiveness(&self) -> Vec<TipEffectiveness> {
        match self {
            Self::Memory(store) => store.state.read().await.tips.values().cloned().collect(),
            Self::Postgres(store) => match sqlx::query_as::<_, TipEffectivenessRow>(
                "SELECT tip_key, shown_count, improved_count FROM learning_tip_effectiveness",
            )
            .fetch_all(&store.pool)
            .await
            {
                Ok(rows) => rows.into_iter().map(TipEffectivenessRow::into_domain).collect(),
                Err(err) => {
                    tracing::error!(error = %err, "postgres load_all_tip_effectiveness failed");
                    Vec::new()
                }
            },
        }
    }

    pub async fn save_word_counters(&self, words: &HashMap<String, WordDifficulty>) {
        match self {
            Self::Memory(store) => {
                let mut state = store.state.write().await;
                for (word, counter) in words {
                    state.words.insert(word.clone(), counter.clone());
                }
            }
            Self::Postgres(store) => {
                for counter in words.values() {
                    if let Err(err) = upsert_word_counter_pg(&store.pool, counter).await {
                        tracing::error!(error = %err, word = %counter.word, "postgres save_word_counters failed");
                    }
                }
            }
        }
    }

    pub async fn save_tip_effectiveness(&self, tips: &HashMap<String, TipEffectiveness>) {
        match self {
            Self::Memory(store) => {
                let mut state = store.state.write().await;
                for (key, counter) in tips {
                    state.tips.insert(key.clone(), counter.clone());
                }
            }
            Self::Postgres(store) => {
                for counter in tips.values() {
                    if let Err(err) = upsert_tip_effectiveness_pg(&store.pool, counter).await {
                        tracing::error!(error = %err, tip_key = %counter.tip_key, "postgres save_tip_effectiveness failed");
                    }
                }
            }
        }
    }

    pub async fn save_profile(&self, user_id: &str, profile: &UserLearningProfile) {
        match self {
            Self::Memory(store) => {
                let mut state = store.state.write().await;
                state.profiles.insert(user_id.to_string(), profile.clone());
            }
            Self::Postgres(store) => {
                if let Err(err) = upsert_profile_pg(&store.pool, user_id, profile).await {
                    tracing::error!(error = %err, user_id, "postgres save_profile failed, keeping memory copy");
                }
                let mut state = FALLBACK.0.write().await;
                state.profiles.insert(user_id.to_string(), profile.clone());
            }
        }
    }

    pub async fn load_profile(&self, user_id: &str) -> Option<UserLearningProfile> {
        match self {
            Self::Memory(store) => store.state.read().await.profiles.get(user_id).cloned(),
            Self::Postgres(store) => {
                match sqlx::query_scalar::<_, serde_json::Value>(
                    "SELECT profile FROM learning_user_profiles WHERE user_id = $1",
                )
                .bind(user_id)
                .fetch_optional(&store.pool)
                .await
                {
                    Ok(Some(json)) => serde_json::from_value(json).ok(),
                    Ok(None) => FALLBACK.0.read().await.profiles.get(user_id).cloned(),
                    Err(err) => {
                        tracing::error!(error = %err, "postgres load_profile failed, checking memory fallback");
                        FALLBACK.0.read().await.profiles.get(user_id).cloned()
                    }
                }
            }
        }
    }
}

/// Process-wide shadow store used only on the Postgres-failure fallback
/// path, so a write that failed against Postgres is still visible to reads
/// within this process's lifetime.
struct Fallback(Arc<RwLock<MemoryState>>);

impl Fallback {
    async fn session_store(&self, user_id: &str, event: SessionLearningEvent) {
        let mut state = self.0.write().await;
        state.sessions.entry(user_id.to_string()).or_default().push(event);
    }

    async fn easepocket_store(&self, user_id: &str, event: EasePocketLearningEvent) {
        let mut state = self.0.write().await;
        state.easepocket.entry(user_id.to_string()).or_default().push(event);
    }
}

static FALLBACK: std::sync::LazyLock<Fallback> =
    std::sync::LazyLock::new(|| Fallback(Arc::new(RwLock::new(MemoryState::default()))));

#[derive(sqlx::FromRow)]
struct WordDifficultyRow {
    word: String,
    attempts: i32,
    failures: i32,
    successes: i32,
}

impl WordDifficultyRow {
    fn into_domain(self) -> WordDifficulty {
        WordDifficulty {
            word: self.word,
            attempts: self.attempts.max(0) as u32,
            failures: self.failures.max(0) as u32,
            successes: self.successes.max(0) as u32,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TipEffectivenessRow {
    tip_key: String,
    shown_count: i32,
    improved_count: i32,
}

impl TipEffectivenessRow {
    fn into_domain(self) -> TipEffectiveness {
        TipEffectiveness {
            tip_key: self.tip_key,
            shown_count: self.shown_count.max(0) as u32,
            improved_count: self.improved_count.max(0) as u32,
        }
    }
}

async fn load_history_pg(pool: &PgPool, user_id: &str) -> sqlx::Result<UserHistory> {
    let session_rows = sqlx::query_as::<_, SessionEventRow>(
        "SELECT id, user_id, session_id, song_id, genre, title, created_at, duration_seconds, \
         text_accuracy, pronunciation_clarity, timing_consistency, transcript, expected_words, \
         spoken_words, matched_words, weak_words, strong_words, weak_sounds, tips \
         FROM learning_session_events WHERE user_id = $1 ORDER BY created_at ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let easepocket_rows = sqlx::query_as::<_, EasePocketEventRow>(
        "SELECT id, user_id, event_id, mode, bpm, grid, beats_per_bar, on_time_pct, mean_abs_ms, created_at \
         FROM learning_easepocket_events WHERE user_id = $1 ORDER BY created_at ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(UserHistory {
        sessions: session_rows.into_iter().filter_map(SessionEventRow::into_domain).collect(),
        easepocket: easepocket_rows
            .into_iter()
            .filter_map(EasePocketEventRow::into_domain)
            .collect(),
    })
}

#[derive(sqlx::FromRow)]
struct SessionEventRow {
    id: String,
    user_id: String,
    session_id: String,
    song_id: Option<String>,
    genre: Option<String>,
    title: Option<String>,
    created_at: chrono::DateTime<Utc>,
    duration_seconds: f64,
    text_accuracy: f64,
    pronunciation_clarity: f64,
    timing_consistency: String,
    transcript: Option<String>,
    expected_words: serde_json::Value,
    spoken_words: serde_json::Value,
    matched_words: serde_json::Value,
    weak_words: serde_json::Value,
    strong_words: serde_json::Value,
    weak_sounds: serde_json::Value,
    tips: serde_json::Value,
}

impl SessionEventRow {
    fn into_domain(self) -> Option<SessionLearningEvent> {
        Some(SessionLearningEvent {
            id: self.id,
            user_id: self.user_id,
            session_id: self.session_id,
            song_id: self.song_id,
            genre: self.genre,
            title: self.title,
            created_at: self.created_at,
            duration_seconds: self.duration_seconds,
            text_accuracy: self.text_accuracy,
            pronunciation_clarity: self.pronunciation_clarity,
            timing_consistency: self.timing_consistency.parse().ok()?,
            transcript: self.transcript,
            expected_words: serde_json::from_value(self.expected_words).ok()?,
            spoken_words: serde_json::from_value(self.spoken_words).ok()?,
            matched_words: serde_json::from_value(self.matched_words).ok()?,
            weak_words: serde_json::from_value(self.weak_words).ok()?,
            strong_words: serde_json::from_value(self.strong_words).ok()?,
            weak_sounds: serde_json::from_value(self.weak_sounds).ok()?,
            tips: serde_json::from_value(self.tips).ok()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EasePocketEventRow {
    id: String,
    user_id: String,
    event_id: String,
    mode: String,
    bpm: f64,
    grid: String,
    beats_per_bar: i16,
    on_time_pct: f64,
    mean_abs_ms: f64,
    created_at: chrono::DateTime<Utc>,
}

impl EasePocketEventRow {
    fn into_domain(self) -> Option<EasePocketLearningEvent> {
        Some(EasePocketLearningEvent {
            id: self.id,
            user_id: self.user_id,
            event_id: self.event_id,
            mode: self.mode.parse().ok()?,
            bpm: self.bpm,
            grid: self.grid.parse().ok()?,
            beats_per_bar: self.beats_per_bar.max(0) as u8,
            on_time_pct: self.on_time_pct,
            mean_abs_ms: self.mean_abs_ms,
            created_at: self.created_at,
        })
    }
}

async fn insert_session_event_pg(pool: &PgPool, event: &SessionLearningEvent) -> sqlx::Result<()> {
    sqlx::query(
        r"
        INSERT INTO learning_session_events
            (id, user_id, session_id, song_id, genre, title, created_at, duration_seconds,
             text_accuracy, pronunciation_clarity, timing_consistency, transcript,
             expected_words, spoken_words, matched_words, weak_words, strong_words, weak_sounds, tips)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)
        ON CONFLICT (user_id, session_id) DO NOTHING
        ",
    )
    .bind(&event.id)
    .bind(&event.user_id)
    .bind(&event.session_id)
    .bind(&event.song_id)
    .bind(&event.genre)
    .bind(&event.title)
    .bind(event.created_at)
    .bind(event.duration_seconds)
    .bind(event.text_accuracy)
    .bind(event.pronunciation_clarity)
    .bind(event.timing_consistency.to_string())
    .bind(&event.transcript)
    .bind(serde_json::to_value(&event.expected_words).unwrap_or_default())
    .bind(serde_json::to_value(&event.spoken_words).unwrap_or_default())
    .bind(serde_json::to_value(&event.matched_words).unwrap_or_default())
    .bind(serde_json::to_value(&event.weak_words).unwrap_or_default())
    .bind(serde_json::to_value(&event.strong_words).unwrap_or_default())
    .bind(serde_json::to_value(&event.weak_sounds).unwrap_or_default())
    .bind(serde_json::to_value(&event.tips).unwrap_or_default())
    .execute(pool)
    .await?;
    Ok(())
}

async fn insert_easepocket_event_pg(pool: &PgPool, event: &EasePocketLearningEvent) -> sqlx::Result<()> {
    sqlx::query(
        r"
        INSERT INTO learning_easepocket_events
            (id, user_id, event_id, mode, bpm, grid, beats_per_bar, on_time_pct, mean_abs_ms, created_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
        ON CONFLICT (user_id, event_id) DO NOTHING
        ",
    )
    .bind(&event.id)
    .bind(&event.user_id)
    .bind(&event.event_id)
    .bind(event.mode.to_string())
    .bind(event.bpm)
    .bind(event.grid.to_string())
    .bind(i16::from(event.beats_per_bar))
    .bind(event.on_time_pct)
    .bind(event.mean_abs_ms)
    .bind(event.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

async fn upsert_word_counter_pg(pool: &PgPool, counter: &WordDifficulty) -> sqlx::Result<()> {
    sqlx::query(
        r"
        INSERT INTO learning_word_difficulty (word, attempts, failures, successes)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (word) DO UPDATE SET attempts = $2, failures = $3, successes = $4
        ",
    )
    .bind(&counter.word)
    .bind(counter.attempts as i32)
    .bind(counter.failures as i32)
    .bind(counter.successes as i32)
    .execute(pool)
    .await?;
    Ok(())
}

async fn upsert_tip_effectiveness_pg(pool: &PgPool, counter: &TipEffectiveness) -> sqlx::Result<()> {
    sqlx::query(
        r"
        INSERT INTO learning_tip_effectiveness (tip_key, shown_count, improved_count)
        VALUES ($1, $2, $3)
        ON CONFLICT (tip_key) DO UPDATE SET shown_count = $2, improved_count = $3
        ",
    )
    .bind(&counter.tip_key)
    .bind(counter.shown_count as i32)
    .bind(counter.improved_count as i32)
    .execute(pool)
    .await?;
    Ok(())
}

async fn upsert_profile_pg(pool: &PgPool, user_id: &str, profile: &UserLearningProfile) -> sqlx::Result<()> {
    sqlx::query(
        r"
        INSERT INTO learning_user_profiles (user_id, profile, updated_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id) DO UPDATE SET profile = $2, updated_at = $3
        ",
    )
    .bind(user_id)
    .bind(serde_json::to_value(profile).unwrap_or_default())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}
