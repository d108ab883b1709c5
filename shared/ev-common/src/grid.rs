//! BPM/subdivision grid phase-fit and onset classification.

use serde::{Deserialize, Serialize};

use crate::onset::Onset;

/// Grid subdivision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridKind {
    Beat,
    #[serde(rename = "8th")]
    Eighth,
    #[serde(rename = "16th")]
    Sixteenth,
}

impl GridKind {
    /// Subdivision divisor: beat=1, 8th=2, 16th=4.
    #[must_use]
    pub const fn divisor(self) -> f64 {
        match self {
            Self::Beat => 1.0,
            Self::Eighth => 2.0,
            Self::Sixteenth => 4.0,
        }
    }
}

impl std::str::FromStr for GridKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beat" => Ok(Self::Beat),
            "8th" => Ok(Self::Eighth),
            "16th" => Ok(Self::Sixteenth),
            other => Err(format!("unknown grid kind {other}")),
        }
    }
}

impl std::fmt::Display for GridKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Beat => "beat",
            Self::Eighth => "8th",
            Self::Sixteenth => "16th",
        })
    }
}

/// A resolved scoring grid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grid {
    pub kind: GridKind,
    pub step_ms: f64,
    pub phase_ms: f64,
    pub tolerance_ms: f64,
}

impl Grid {
    /// Build a grid from BPM and subdivision; `stepMs = 60000 / bpm / divisor`.
    #[must_use]
    pub fn from_bpm(bpm: f64, kind: GridKind, tolerance_ms: f64) -> Self {
        let step_ms = 60_000.0 / bpm / kind.divisor();
        Self {
            kind,
            step_ms,
            phase_ms: 0.0,
            tolerance_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingClass {
    Early,
    On,
    Late,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingEvent {
    pub t_ms: f64,
    pub expected_ms: f64,
    pub deviation_ms: f64,
    pub class: TimingClass,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimingStats {
    pub event_count: usize,
    pub on_time_pct: f64,
    pub mean_abs_ms: f64,
    pub std_dev_ms: f64,
    pub avg_offset_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingScore {
    pub step_ms: f64,
    pub phase_ms: f64,
    pub tolerance_ms: f64,
    pub events: Vec<TimingEvent>,
    pub stats: TimingStats,
}

/// Sweep candidate phases in `[0, stepMs)` at `resolutionMs` granularity and
/// return the phase minimizing mean absolute deviation.
#[must_use]
pub fn fit_phase(times_ms: &[f64], step_ms: f64, resolution_ms: f64) -> f64 {
    if times_ms.is_empty() || step_ms <= 0.0 {
        return 0.0;
    }

    let steps = (step_ms / resolution_ms).floor().max(1.0) as usize;
    let mut best_phase = 0.0;
    let mut best_mean_abs = f64::MAX;

    for i in 0..steps {
        let phase = i as f64 * resolution_ms;
        let mean_abs = mean_abs_deviation(times_ms, phase, step_ms);
        if mean_abs < best_mean_abs {
            best_mean_abs = mean_abs;
            best_phase = phase;
        }
    }
    best_phase
}

fn mean_abs_deviation(times_ms: &[f64], phase: f64, step_ms: f64) -> f64 {
    let sum: f64 = times_ms
        .iter()
        .map(|&t| {
            let k = ((t - phase) / step_ms).round();
            let expected = phase + k * step_ms;
            (t - expected).abs()
        })
        .sum();
    sum / times_ms.len() as f64
}

/// Classify onsets against a grid and compute aggregate timing stats.
#[must_use]
pub fn score(onsets: &[Onset], grid: &Grid, max_events: usize) -> TimingScore {
    let mut events: Vec<TimingEvent> = onsets
        .iter()
        .take(max_events)
        .map(|onset| classify(onset, grid))
        .collect();
    events.truncate(max_events);

    let stats = compute_stats(&events, grid.tolerance_ms);

    TimingScore {
        step_ms: grid.step_ms,
        phase_ms: grid.phase_ms,
        tolerance_ms: grid.tolerance_ms,
        events,
        stats,
    }
}

fn classify(onset: &Onset, grid: &Grid) -> TimingEvent {
    let k = ((onset.t_ms - grid.phase_ms) / grid.step_ms).round();
    let expected_ms = grid.phase_ms + k * grid.step_ms;
    let deviation_ms = onset.t_ms - expected_ms;

    let class = if deviation_ms.abs() <= grid.tolerance_ms {
        TimingClass::On
    } else if deviation_ms < 0.0 {
        TimingClass::Early
    } else {
        TimingClass::Late
    };

    let proximity = 1.0 - (deviation_ms.abs() / (grid.step_ms / 2.0)).clamp(0.0, 1.0);
    let confidence = onset.confidence * (0.55 + 0.45 * proximity as f32);

    TimingEvent {
        t_ms: onset.t_ms,
        expected_ms,
        deviation_ms,
        class,
        confidence,
    }
}

fn compute_stats(events: &[TimingEvent], tolerance_ms: f64) -> TimingStats {
    let event_count = events.len();
    if event_count == 0 {
        return TimingStats::default();
    }

    let on_time = events
        .iter()
        .filter(|e| e.deviation_ms.abs() <= tolerance_ms)
        .count();
    let on_time_pct = on_time as f64 / event_count as f64 * 100.0;

    let deviations: Vec<f64> = events.iter().map(|e| e.deviation_ms).collect();
    let avg_offset_ms = deviations.iter().sum::<f64>() / event_count as f64;
    let mean_abs_ms = deviations.iter().map(|d| d.abs()).sum::<f64>() / event_count as f64;
    let variance = deviations
        .iter()
        .map(|d| (d - avg_offset_ms).powi(2))
        .sum::<f64>()
        / event_count as f64;
    let std_dev_ms = variance.sqrt();

    TimingStats {
        event_count,
        on_time_pct,
        mean_abs_ms,
        std_dev_ms,
        avg_offset_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn onset(t_ms: f64) -> Onset {
        Onset {
            t_ms,
            strength: 1.0,
            confidence: 0.9,
        }
    }

    #[test]
    fn classifies_on_grid_onsets_as_on() {
        let grid = Grid {
            kind: GridKind::Sixteenth,
            step_ms: 125.0,
            phase_ms: 500.0,
            tolerance_ms: 15.0,
        };
        let onsets: Vec<Onset> = (0..8).map(|n| onset(500.0 + f64::from(n) * 125.0)).collect();
        let result = score(&onsets, &grid, 180);
        assert!(result.stats.on_time_pct > 90.0);
        for ev in &result.events {
            assert_eq!(ev.class == TimingClass::On, ev.deviation_ms.abs() <= 15.0);
        }
    }

    #[test]
    fn expected_ms_matches_formula_exactly() {
        let grid = Grid {
            kind: GridKind::Beat,
            step_ms: 500.0,
            phase_ms: 50.0,
            tolerance_ms: 20.0,
        };
        let onsets = vec![onset(560.0)];
        let result = score(&onsets, &grid, 10);
        let ev = result.events[0];
        let k = ((560.0 - 50.0) / 500.0f64).round();
        assert!((ev.expected_ms - (50.0 + k * 500.0)).abs() < 1e-9);
    }

    #[test]
    fn wobble_inflates_mean_abs_without_phase_fit_cancelling_it() {
        let step_ms = 150.0;
        let phase = 400.0;
        let times: Vec<f64> = (0..10)
            .map(|n| {
                let base = phase + f64::from(n) * step_ms;
                if n % 2 == 0 {
                    base - 25.0
                } else {
                    base + 25.0
                }
            })
            .collect();
        let fitted_phase = fit_phase(&times, step_ms, 1.0);
        let onsets: Vec<Onset> = times.iter().map(|&t| onset(t)).collect();
        let grid = Grid {
            kind: GridKind::Beat,
            step_ms,
            phase_ms: fitted_phase,
            tolerance_ms: 15.0,
        };
        let result = score(&onsets, &grid, 180);
        assert!(result.stats.mean_abs_ms > 12.0);
        assert!(result.stats.on_time_pct < 80.0);
    }

    #[test]
    fn stats_bounds_hold() {
        let grid = Grid {
            kind: GridKind::Beat,
            step_ms: 500.0,
            phase_ms: 0.0,
            tolerance_ms: 30.0,
        };
        let onsets: Vec<Onset> = (0..20).map(|n| onset(f64::from(n) * 137.0)).collect();
        let result = score(&onsets, &grid, 180);
        assert!(result.stats.on_time_pct >= 0.0 && result.stats.on_time_pct <= 100.0);
        assert!(result.stats.mean_abs_ms >= 0.0);
        assert!(result.stats.std_dev_ms >= 0.0);
    }
}
