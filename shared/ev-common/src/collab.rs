//! Collaborative lyric draft domain type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A collaboratively-edited lyric draft, keyed by the external track it
/// belongs to. Upsert semantics live in the storage layer; this type only
/// carries the field-preservation merge rule as a method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollabLyricDraft {
    pub external_track_id: String,
    pub project_id: Option<String>,
    pub title: String,
    pub artist: Option<String>,
    pub bpm: Option<f64>,
    pub lyrics: String,
    pub collaborators: Vec<String>,
    pub source: String,
    pub updated_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Fields accepted from an upsert request body; `None` means "not supplied",
/// distinct from an explicit empty value.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollabLyricUpsert {
    pub external_track_id: String,
    pub project_id: Option<String>,
    pub title: String,
    pub artist: Option<String>,
    pub bpm: Option<f64>,
    pub lyrics: String,
    pub collaborators: Option<Vec<String>>,
    pub source: Option<String>,
}

impl CollabLyricDraft {
    /// Merge an upsert body onto an existing record, preserving
    /// `collaborators`, `source`, and `bpm` when the request omits them.
    #[must_use]
    pub fn merge(existing: Option<&Self>, upsert: CollabLyricUpsert, now: DateTime<Utc>) -> Self {
        let collaborators = upsert
            .collaborators
            .or_else(|| existing.map(|e| e.collaborators.clone()))
            .unwrap_or_default();
        let source = upsert
            .source
            .or_else(|| existing.map(|e| e.source.clone()))
            .unwrap_or_else(|| "unknown".to_string());
        let bpm = upsert.bpm.or_else(|| existing.and_then(|e| e.bpm));
        let received_at = existing.map_or(now, |e| e.received_at);

        Self {
            external_track_id: upsert.external_track_id,
            project_id: upsert.project_id,
            title: upsert.title,
            artist: upsert.artist,
            bpm,
            lyrics: upsert.lyrics,
            collaborators,
            source,
            updated_at: now,
            received_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollabLyricFilter {
    pub project_id: Option<String>,
    pub source: Option<String>,
}

impl CollabLyricFilter {
    #[must_use]
    pub fn matches(&self, draft: &CollabLyricDraft) -> bool {
        self.project_id
            .as_ref()
            .is_none_or(|p| draft.project_id.as_deref() == Some(p.as_str()))
            && self
                .source
                .as_ref()
                .is_none_or(|s| draft.source == *s)
    }
}

/// A realtime subscriber's filter; empty fields match all payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollabSubscription {
    pub source: Option<String>,
    pub project_id: Option<String>,
    pub external_track_id: Option<String>,
}

impl CollabSubscription {
    #[must_use]
    pub fn matches(&self, draft: &CollabLyricDraft) -> bool {
        self.source.as_ref().is_none_or(|s| draft.source == *s)
            && self
                .project_id
                .as_ref()
                .is_none_or(|p| draft.project_id.as_deref() == Some(p.as_str()))
            && self
                .external_track_id
                .as_ref()
                .is_none_or(|id| draft.external_track_id == *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(now: DateTime<Utc>) -> CollabLyricDraft {
        CollabLyricDraft {
            external_track_id: "t1".to_string(),
            project_id: Some("p1".to_string()),
            title: "Song".to_string(),
            artist: Some("Artist".to_string()),
            bpm: Some(120.0),
            lyrics: "la la la".to_string(),
            collaborators: vec!["alice".to_string()],
            source: "spotify".to_string(),
            updated_at: now,
            received_at: now,
        }
    }

    #[test]
    fn merge_preserves_collaborators_source_and_bpm_when_omitted() {
        let now = Utc::now();
        let existing = draft(now);
        let upsert = CollabLyricUpsert {
            external_track_id: "t1".to_string(),
            project_id: Some("p1".to_string()),
            title: "Song v2".to_string(),
            artist: None,
            bpm: None,
            lyrics: "la la la la".to_string(),
            collaborators: None,
            source: None,
        };
        let merged = CollabLyricDraft::merge(Some(&existing), upsert, now);
        assert_eq!(merged.collaborators, vec!["alice".to_string()]);
        assert_eq!(merged.source, "spotify");
        assert_eq!(merged.bpm, Some(120.0));
        assert_eq!(merged.received_at, existing.received_at);
        assert_eq!(merged.title, "Song v2");
    }

    #[test]
    fn subscription_with_empty_filters_matches_everything() {
        let sub = CollabSubscription::default();
        assert!(sub.matches(&draft(Utc::now())));
    }

    #[test]
    fn subscription_filters_on_non_empty_fields_only() {
        let mut sub = CollabSubscription::default();
        sub.project_id = Some("p2".to_string());
        assert!(!sub.matches(&draft(Utc::now())));
    }
}
