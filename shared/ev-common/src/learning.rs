//! Adaptive-learning feature derivation, profile aggregation, and
//! recommendation rules. Storage (Postgres/memory) lives in `ev-server`;
//! everything here is pure and deterministic given its inputs.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingConsistency {
    Low,
    Medium,
    High,
}

impl std::str::FromStr for TimingConsistency {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown timing consistency {other}")),
        }
    }
}

impl std::fmt::Display for TimingConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EasePocketMode {
    Subdivision,
    Silent,
    Consonant,
    Pocket,
    Slow,
}

impl std::str::FromStr for EasePocketMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subdivision" => Ok(Self::Subdivision),
            "silent" => Ok(Self::Silent),
            "consonant" => Ok(Self::Consonant),
            "pocket" => Ok(Self::Pocket),
            "slow" => Ok(Self::Slow),
            other => Err(format!("unknown easepocket mode {other}")),
        }
    }
}

impl std::fmt::Display for EasePocketMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Subdivision => "subdivision",
            Self::Silent => "silent",
            Self::Consonant => "consonant",
            Self::Pocket => "pocket",
            Self::Slow => "slow",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipEntry {
    pub word: String,
    pub reason: String,
    pub tip_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipRequest {
    pub word: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLearningEvent {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub song_id: Option<String>,
    pub genre: Option<String>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub text_accuracy: f64,
    pub pronunciation_clarity: f64,
    pub timing_consistency: TimingConsistency,
    pub transcript: Option<String>,
    pub expected_words: Vec<String>,
    pub spoken_words: Vec<String>,
    pub matched_words: Vec<String>,
    pub weak_words: Vec<String>,
    pub strong_words: Vec<String>,
    pub weak_sounds: HashMap<String, u32>,
    pub tips: Vec<TipEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EasePocketLearningEvent {
    pub id: String,
    pub user_id: String,
    pub event_id: String,
    pub mode: EasePocketMode,
    pub bpm: f64,
    pub grid: crate::grid::GridKind,
    pub beats_per_bar: u8,
    pub on_time_pct: f64,
    pub mean_abs_ms: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordDifficulty {
    pub word: String,
    pub attempts: u32,
    pub failures: u32,
    pub successes: u32,
}

impl WordDifficulty {
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            f64::from(self.failures) / f64::from(self.attempts)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipEffectiveness {
    pub tip_key: String,
    pub shown_count: u32,
    pub improved_count: u32,
}

impl TipEffectiveness {
    #[must_use]
    pub fn success_score(&self) -> f64 {
        if self.shown_count == 0 {
            0.0
        } else {
            f64::from(self.improved_count) / f64::from(self.shown_count)
        }
    }
}

/// Derived feature set from §4.F step 1-6.
#[derive(Debug, Clone)]
pub struct DerivedFeatures {
    pub expected_words: Vec<String>,
    pub spoken_words: Vec<String>,
    pub matched_words: Vec<String>,
    pub weak_words: Vec<String>,
    pub strong_words: Vec<String>,
    pub weak_sounds: HashMap<String, u32>,
    pub tips: Vec<TipEntry>,
}

fn token_regex() -> Regex {
    Regex::new(r"[a-z0-9']+").expect("static tokenizer pattern")
}

/// Lowercase and split on `[a-z0-9']+`.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let re = token_regex();
    let lower = text.to_lowercase();
    re.find_iter(&lower).map(|m| m.as_str().to_string()).collect()
}

/// LCS DP between `expected` and `spoken`, tie-break `dp[i-1][j] >= dp[i][j-1] -> advance i`.
/// Returns the set of expected-word indices that participate in the match.
#[must_use]
pub fn matched_expected_indices(expected: &[String], spoken: &[String]) -> HashSet<usize> {
    let n = expected.len();
    let m = spoken.len();
    if n == 0 || m == 0 {
        return HashSet::new();
    }

    let mut dp = vec![vec![0u32; m + 1]; n + 1];
    for i in 1..=n {
        for j in 1..=m {
            dp[i][j] = if expected[i - 1] == spoken[j - 1] {
                dp[i - 1][j - 1] + 1
            } else {
                dp[i - 1][j].max(dp[i][j - 1])
            };
        }
    }

    let mut matched = HashSet::new();
    let (mut i, mut j) = (n, m);
    while i > 0 && j > 0 {
        if expected[i - 1] == spoken[j - 1] {
            matched.insert(i - 1);
            i -= 1;
            j -= 1;
        } else if dp[i - 1][j] >= dp[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    matched
}

const PLOSIVES: &[char] = &['p', 'b', 't', 'd', 'k', 'g'];
const FRICATIVES: &[char] = &['f', 'v', 's', 'z', 'x', 'h', 'j'];
const LIQUIDS: &[char] = &['l', 'r'];
const VOWELS: &[char] = &['a', 'e', 'i', 'o', 'u'];

fn has_any(word: &str, set: &[char]) -> bool {
    word.chars().any(|c| set.contains(&c))
}

fn has_vowel_transition(word: &str) -> bool {
    let chars: Vec<char> = word.chars().collect();
    chars.windows(2).any(|w| VOWELS.contains(&w[0]) && VOWELS.contains(&w[1]))
}

fn ends_in_consonant(word: &str) -> bool {
    word.chars().last().is_some_and(|c| c.is_alphabetic() && !VOWELS.contains(&c))
}

/// Count weak-sound category hits across `weak_words` per §4.F step 5.
#[must_use]
pub fn categorize_weak_sounds(weak_words: &[String]) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for word in weak_words {
        if has_any(word, PLOSIVES) {
            *counts.entry("plosive_attack".to_string()).or_insert(0) += 1;
        }
        if has_any(word, FRICATIVES) {
            *counts.entry("fricative_clarity".to_string()).or_insert(0) += 1;
        }
        if has_any(word, LIQUIDS) {
            *counts.entry("liquid_control".to_string()).or_insert(0) += 1;
        }
        if has_any(word, &['m', 'n']) || word.contains("ng") {
            *counts.entry("nasal_balance".to_string()).or_insert(0) += 1;
        }
        if has_vowel_transition(word) {
            *counts.entry("vowel_transition".to_string()).or_insert(0) += 1;
        }
        if ends_in_consonant(word) {
            *counts.entry("final_consonant".to_string()).or_insert(0) += 1;
        }
    }
    counts
}

fn slugify(s: &str) -> String {
    let mut out = String::new();
    let mut last_was_dash = false;
    for c in s.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash && !out.is_empty() {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

fn length_bucket(word: &str) -> &'static str {
    let len = word.chars().count();
    if len <= 3 {
        "short"
    } else if len >= 8 {
        "long"
    } else {
        "medium"
    }
}

/// Build the stable `"<reason-slug>:<length-bucket>"` tip key.
#[must_use]
pub fn build_tip_key(word: &str, reason: &str) -> String {
    format!("{}:{}", slugify(reason), length_bucket(word))
}

/// Derive weak/strong words, weak sounds, and tips from an incoming session.
#[must_use]
pub fn derive_features(
    expected_text: &str,
    spoken_text: &str,
    transcript: Option<&str>,
    top_to_fix: &[TipRequest],
) -> DerivedFeatures {
    let expected_words = tokenize(expected_text);
    let spoken_words = tokenize(spoken_text);

    let matched_indices = matched_expected_indices(&expected_words, &spoken_words);

    let matched_words: Vec<String> = matched_indices
        .iter()
        .map(|&i| expected_words[i].clone())
        .collect();

    let mut weak_from_tips: Vec<String> = top_to_fix
        .iter()
        .map(|t| t.word.to_lowercase().trim().to_string())
        .filter(|w| !w.is_empty())
        .collect();

    let mut weak_words: Vec<String> = Vec::new();
    weak_words.append(&mut weak_from_tips);

    if transcript.is_some_and(|t| !t.trim().is_empty()) {
        for (i, word) in expected_words.iter().enumerate() {
            if !matched_indices.contains(&i) && !weak_words.contains(word) {
                weak_words.push(word.clone());
            }
        }
    }

    let strong_words: Vec<String> = matched_words
        .iter()
        .filter(|w| !weak_words.contains(w))
        .cloned()
        .collect();

    let weak_sounds = categorize_weak_sounds(&weak_words);

    let tips: Vec<TipEntry> = top_to_fix
        .iter()
        .map(|t| TipEntry {
            word: t.word.clone(),
            reason: t.reason.clone(),
            tip_key: build_tip_key(&t.word, &t.reason),
        })
        .collect();

    DerivedFeatures {
        expected_words,
        spoken_words,
        matched_words,
        weak_words,
        strong_words,
        weak_sounds,
        tips,
    }
}

/// Apply per-word attempt/failure/success counters for one ingested session.
pub fn apply_word_counters(
    difficulty: &mut HashMap<String, WordDifficulty>,
    expected_words: &[String],
    weak_words: &[String],
    strong_words: &[String],
) {
    let mut seen = HashSet::new();
    for word in expected_words {
        if !seen.insert(word.clone()) {
            continue;
        }
        let entry = difficulty.entry(word.clone()).or_insert_with(|| WordDifficulty {
            word: word.clone(),
            ..Default::default()
        });
        entry.attempts += 1;
        if weak_words.contains(word) {
            entry.failures += 1;
        }
        if strong_words.contains(word) {
            entry.successes += 1;
        }
    }
}

/// Apply tip-effectiveness counters for tips shown in the **previous** session
/// of the same user, checked against the current session's weak words.
pub fn apply_tip_effectiveness(
    tip_effectiveness: &mut HashMap<String, TipEffectiveness>,
    previous_session_tips: &[TipEntry],
    current_weak_words: &[String],
) {
    for tip in previous_session_tips {
        let entry = tip_effectiveness
            .entry(tip.tip_key.clone())
            .or_insert_with(|| TipEffectiveness {
                tip_key: tip.tip_key.clone(),
                ..Default::default()
            });
        entry.shown_count += 1;
        if !current_weak_words.contains(&tip.word) {
            entry.improved_count += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeakWordSummary {
    pub word: String,
    pub count: u32,
    pub weak_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrongWordSummary {
    pub word: String,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeakSoundSummary {
    pub category: String,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenreSummary {
    pub genre: String,
    pub avg_accuracy: f64,
    pub count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSummary {
    pub recent_avg_accuracy: f64,
    pub baseline_avg_accuracy: f64,
    pub delta_accuracy: f64,
    pub recent_avg_clarity: f64,
    pub timing_high_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipSummary {
    pub tip_key: String,
    pub shown_count: u32,
    pub success_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EasePocketModeSummary {
    pub mode: EasePocketMode,
    pub mean_on_time_pct: f64,
    pub mean_abs_ms: f64,
    pub drill_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingSummary {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    pub easepocket_modes: Vec<EasePocketModeSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLearningProfile {
    pub user_id: String,
    pub weak_words: Vec<WeakWordSummary>,
    pub strong_words: Vec<StrongWordSummary>,
    pub weak_sounds: Vec<WeakSoundSummary>,
    pub genre_summary: Vec<GenreSummary>,
    pub trend_summary: TrendSummary,
    pub tip_summary: Vec<TipSummary>,
    pub timing_summary: TimingSummary,
    pub updated_at: DateTime<Utc>,
}

/// Rebuild a user's profile from their full event history. `now` is supplied
/// by the caller rather than sampled here, keeping this function pure.
#[must_use]
pub fn build_profile(
    user_id: &str,
    sessions: &[SessionLearningEvent],
    easepocket: &[EasePocketLearningEvent],
    tip_effectiveness: &HashMap<String, TipEffectiveness>,
    now: DateTime<Utc>,
) -> UserLearningProfile {
    let mut ordered: Vec<&SessionLearningEvent> = sessions.iter().collect();
    ordered.sort_by_key(|s| s.created_at);

    let session_count = ordered.len().max(1) as f64;

    let mut weak_counts: HashMap<String, u32> = HashMap::new();
    let mut strong_counts: HashMap<String, u32> = HashMap::new();
    let mut sound_counts: HashMap<String, u32> = HashMap::new();
    let mut genre_totals: HashMap<String, (f64, u32)> = HashMap::new();
    let mut timing = TimingSummary::default();
    let mut session_tip_keys: HashMap<String, u32> = HashMap::new();

    for s in &ordered {
        for w in &s.weak_words {
            *weak_counts.entry(w.clone()).or_insert(0) += 1;
        }
        for w in &s.strong_words {
            *strong_counts.entry(w.clone()).or_insert(0) += 1;
        }
        for (cat, n) in &s.weak_sounds {
            *sound_counts.entry(cat.clone()).or_insert(0) += n;
        }
        if let Some(genre) = &s.genre {
            let entry = genre_totals.entry(genre.clone()).or_insert((0.0, 0));
            entry.0 += s.text_accuracy;
            entry.1 += 1;
        }
        match s.timing_consistency {
            TimingConsistency::Low => timing.low += 1,
            TimingConsistency::Medium => timing.medium += 1,
            TimingConsistency::High => timing.high += 1,
        }
        for tip in &s.tips {
            *session_tip_keys.entry(tip.tip_key.clone()).or_insert(0) += 1;
        }
    }

    let mut weak_words: Vec<WeakWordSummary> = weak_counts
        .into_iter()
        .map(|(word, count)| WeakWordSummary {
            word,
            count,
            weak_rate: f64::from(count) / session_count,
        })
        .collect();
    weak_words.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
    weak_words.truncate(12);

    let mut strong_words: Vec<StrongWordSummary> = strong_counts
        .into_iter()
        .map(|(word, count)| StrongWordSummary { word, count })
        .collect();
    strong_words.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
    strong_words.truncate(12);

    let mut weak_sounds: Vec<WeakSoundSummary> = sound_counts
        .into_iter()
        .map(|(category, count)| WeakSoundSummary { category, count })
        .collect();
    weak_sounds.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.category.cmp(&b.category)));
    weak_sounds.truncate(10);

    let mut genre_summary: Vec<GenreSummary> = genre_totals
        .into_iter()
        .map(|(genre, (sum, count))| GenreSummary {
            genre,
            avg_accuracy: (sum / f64::from(count)).round(),
            count,
        })
        .collect();
    genre_summary.sort_by(|a, b| a.genre.cmp(&b.genre));

    let recent: Vec<&&SessionLearningEvent> = ordered.iter().rev().take(6).collect();
    let baseline: Vec<&&SessionLearningEvent> = ordered.iter().rev().skip(6).take(6).collect();

    let avg = |xs: &[&&SessionLearningEvent], f: fn(&SessionLearningEvent) -> f64| -> f64 {
        if xs.is_empty() {
            0.0
        } else {
            xs.iter().map(|s| f(s)).sum::<f64>() / xs.len() as f64
        }
    };

    let recent_avg_accuracy = avg(&recent, |s| s.text_accuracy);
    let baseline_avg_accuracy = avg(&baseline, |s| s.text_accuracy);
    let recent_avg_clarity = avg(&recent, |s| s.pronunciation_clarity);
    let timing_total = timing.low + timing.medium + timing.high;
    let timing_high_rate = if timing_total == 0 {
        0.0
    } else {
        f64::from(timing.high) / f64::from(timing_total)
    };

    let trend_summary = TrendSummary {
        recent_avg_accuracy,
        baseline_avg_accuracy,
        delta_accuracy: recent_avg_accuracy - baseline_avg_accuracy,
        recent_avg_clarity,
        timing_high_rate,
    };

    let mut tip_summary: Vec<TipSummary> = session_tip_keys
        .keys()
        .filter_map(|key| {
            tip_effectiveness.get(key).map(|eff| TipSummary {
                tip_key: key.clone(),
                shown_count: eff.shown_count,
                success_score: eff.success_score(),
            })
        })
        .collect();
    tip_summary.sort_by(|a, b| {
        b.success_score
            .partial_cmp(&a.success_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.shown_count.cmp(&a.shown_count))
    });
    tip_summary.truncate(12);

    let mut mode_totals: HashMap<EasePocketMode, (f64, f64, u32)> = HashMap::new();
    for ev in easepocket {
        let entry = mode_totals.entry(ev.mode).or_insert((0.0, 0.0, 0));
        entry.0 += ev.on_time_pct;
        entry.1 += ev.mean_abs_ms;
        entry.2 += 1;
    }
    let mut easepocket_modes: Vec<EasePocketModeSummary> = mode_totals
        .into_iter()
        .map(|(mode, (pct_sum, abs_sum, count))| EasePocketModeSummary {
            mode,
            mean_on_time_pct: pct_sum / f64::from(count),
            mean_abs_ms: abs_sum / f64::from(count),
            drill_count: count,
        })
        .collect();
    easepocket_modes.sort_by(|a, b| {
        b.drill_count
            .cmp(&a.drill_count)
            .then_with(|| a.mode.to_string().cmp(&b.mode.to_string()))
    });
    timing.easepocket_modes = easepocket_modes;

    UserLearningProfile {
        user_id: user_id.to_string(),
        weak_words,
        strong_words,
        weak_sounds,
        genre_summary,
        trend_summary,
        tip_summary,
        timing_summary: timing,
        updated_at: now,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Lyrics,
    Silent,
    Pocket,
    Consonant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PracticePlanItem {
    pub kind: PlanKind,
    pub title: String,
    pub words: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipSuggestion {
    pub word: String,
    pub tip_key: String,
    pub success_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendations {
    pub focus_words: Vec<String>,
    pub global_challenge_words: Vec<String>,
    pub tip_suggestions: Vec<TipSuggestion>,
    pub practice_plan: Vec<PracticePlanItem>,
}

const PRACTICE_PLAN_CAP: usize = 5;

/// Build recommendations per §4.F's rules from a profile and global counters.
#[must_use]
pub fn build_recommendations(
    profile: &UserLearningProfile,
    global_words: &[WordDifficulty],
    global_tips: &[TipEffectiveness],
) -> Recommendations {
    let focus_words: Vec<String> = profile.weak_words.iter().take(5).map(|w| w.word.clone()).collect();

    let mut challengers: Vec<&WordDifficulty> = global_words.iter().filter(|w| w.attempts >= 4).collect();
    challengers.sort_by(|a, b| {
        b.failure_rate()
            .partial_cmp(&a.failure_rate())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.attempts.cmp(&a.attempts))
    });
    let global_challenge_words: Vec<String> = challengers.into_iter().take(5).map(|w| w.word.clone()).collect();

    let mut tip_suggestions = Vec::new();
    for word in &focus_words {
        let bucket = length_bucket(word);
        let best = global_tips
            .iter()
            .filter(|t| t.shown_count >= 3 && t.tip_key.ends_with(&format!(":{bucket}")))
            .max_by(|a, b| {
                a.success_score()
                    .partial_cmp(&b.success_score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        if let Some(tip) = best {
            tip_suggestions.push(TipSuggestion {
                word: word.clone(),
                tip_key: tip.tip_key.clone(),
                success_score: tip.success_score(),
            });
        }
    }

    let mut practice_plan = Vec::new();

    if !focus_words.is_empty() {
        practice_plan.push(PracticePlanItem {
            kind: PlanKind::Lyrics,
            title: "Word Repair Drill".to_string(),
            words: focus_words.iter().take(3).cloned().collect(),
        });
    }

    let mean_easepocket_on_time = {
        let modes = &profile.timing_summary.easepocket_modes;
        if modes.is_empty() {
            None
        } else {
            Some(modes.iter().map(|m| m.mean_on_time_pct).sum::<f64>() / modes.len() as f64)
        }
    };

    let timing_needs_work = profile.trend_summary.timing_high_rate < 0.45
        || mean_easepocket_on_time.is_some_and(|p| p < 70.0);
    if timing_needs_work {
        practice_plan.push(PracticePlanItem {
            kind: PlanKind::Silent,
            title: "Silent Click Timing".to_string(),
            words: Vec::new(),
        });
        practice_plan.push(PracticePlanItem {
            kind: PlanKind::Pocket,
            title: "Pocket Groove Drill".to_string(),
            words: Vec::new(),
        });
    }

    let weak_sound_count = |cat: &str| -> u32 {
        profile
            .weak_sounds
            .iter()
            .find(|s| s.category == cat)
            .map_or(0, |s| s.count)
    };
    if weak_sound_count("plosive_attack") >= 3 || weak_sound_count("fricative_clarity") >= 3 {
        practice_plan.push(PracticePlanItem {
            kind: PlanKind::Consonant,
            title: "Consonant Attack Drill".to_string(),
            words: Vec::new(),
        });
    }

    practice_plan.truncate(PRACTICE_PLAN_CAP);

    Recommendations {
        focus_words,
        global_challenge_words,
        tip_suggestions,
        practice_plan,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_lowercasing_and_splitting() {
        let words = tokenize("Hello, World! It's a Test-123.");
        assert_eq!(words, vec!["hello", "world", "it's", "a", "test", "123"]);
    }

    #[test]
    fn lcs_alignment_law_exact_retokenization_matches_all() {
        let expected = tokenize("the quick brown fox jumps");
        let spoken = expected.clone();
        let matched = matched_expected_indices(&expected, &spoken);
        assert_eq!(matched.len(), expected.len());
        for i in 0..expected.len() {
            assert!(matched.contains(&i));
        }
    }

    #[test]
    fn tip_key_buckets_by_length() {
        assert_eq!(build_tip_key("cat", "Breath Support"), "breath-support:short");
        assert_eq!(build_tip_key("wonderful", "Breath Support"), "breath-support:long");
        assert_eq!(build_tip_key("rhythm", "Breath Support"), "breath-support:medium");
    }

    #[test]
    fn categorizes_weak_sounds() {
        let counts = categorize_weak_sounds(&["string".to_string()]);
        assert_eq!(counts.get("fricative_clarity"), Some(&1));
        assert_eq!(counts.get("final_consonant"), None);
    }

    #[test]
    fn word_counters_increment_once_per_distinct_expected_word() {
        let mut diff = HashMap::new();
        apply_word_counters(
            &mut diff,
            &["cat".to_string(), "cat".to_string(), "dog".to_string()],
            &["dog".to_string()],
            &["cat".to_string()],
        );
        assert_eq!(diff["cat"].attempts, 1);
        assert_eq!(diff["cat"].successes, 1);
        assert_eq!(diff["dog"].attempts, 1);
        assert_eq!(diff["dog"].failures, 1);
    }

    #[test]
    fn tip_effectiveness_scores_improvement_against_next_session() {
        let mut eff = HashMap::new();
        let previous_tips = vec![TipEntry {
            word: "cat".to_string(),
            reason: "plosive attack".to_string(),
            tip_key: "plosive-attack:short".to_string(),
        }];
        apply_tip_effectiveness(&mut eff, &previous_tips, &["dog".to_string()]);
        let entry = &eff["plosive-attack:short"];
        assert_eq!(entry.shown_count, 1);
        assert_eq!(entry.improved_count, 1);
        assert!((entry.success_score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn practice_plan_caps_at_five() {
        let profile = UserLearningProfile {
            user_id: "u1".to_string(),
            weak_words: (0..5)
                .map(|i| WeakWordSummary {
                    word: format!("w{i}"),
                    count: 5,
                    weak_rate: 1.0,
                })
                .collect(),
            strong_words: Vec::new(),
            weak_sounds: vec![
                WeakSoundSummary { category: "plosive_attack".to_string(), count: 5 },
                WeakSoundSummary { category: "fricative_clarity".to_string(), count: 5 },
            ],
            genre_summary: Vec::new(),
            trend_summary: TrendSummary {
                timing_high_rate: 0.1,
                ..Default::default()
            },
            tip_summary: Vec::new(),
            timing_summary: TimingSummary::default(),
            updated_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().into(),
        };
        let recs = build_recommendations(&profile, &[], &[]);
        assert!(recs.practice_plan.len() <= 5);
        assert_eq!(recs.practice_plan[0].kind, PlanKind::Lyrics);
    }
}
