//! Consonant-onset detector.
//!
//! STFT-based spectral-flux + energy-rise picker with MAD-adaptive
//! thresholds and a time-domain refinement pass.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// A detected consonant onset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Onset {
    /// Onset time in milliseconds from the start of the buffer.
    pub t_ms: f64,
    /// Raw detector strength (the spectral-flux value that triggered it).
    pub strength: f32,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

/// Tunable onset detector parameters. Defaults match the documented
/// analysis contract; callers rarely need to override them.
#[derive(Debug, Clone, Copy)]
pub struct OnsetConfig {
    pub frame_size: usize,
    pub hop_size: usize,
    pub min_spacing_ms: u32,
    pub max_onsets: usize,
    pub refine_window_ms: u32,
    pub flux_low_hz: f32,
    pub flux_high_hz: f32,
    pub hpf_cutoff_hz: f32,
    pub pre_emphasis: f32,
}

impl Default for OnsetConfig {
    fn default() -> Self {
        Self {
            frame_size: 256,
            hop_size: 64,
            min_spacing_ms: 60,
            max_onsets: 120,
            refine_window_ms: 20,
            flux_low_hz: 2_000.0,
            flux_high_hz: 8_000.0,
            hpf_cutoff_hz: 80.0,
            pre_emphasis: 0.97,
        }
    }
}

/// Detect consonant onsets in a mono sample buffer.
pub fn detect(samples: &[f32], sample_rate: u32, cfg: &OnsetConfig) -> Vec<Onset> {
    if samples.len() < cfg.frame_size {
        return Vec::new();
    }

    let processed = preprocess(samples, sample_rate, cfg);
    let (flux, delta_energy) = analyze_frames(&processed, sample_rate, cfg);

    if flux.len() < 3 {
        return Vec::new();
    }

    let flux_threshold = adaptive_threshold(&flux, 6.0);
    let energy_threshold = adaptive_threshold(&delta_energy, 4.0);

    let hop_ms = f64::from(cfg.hop_size as u32) / f64::from(sample_rate) * 1000.0;
    let min_spacing_frames = (f64::from(cfg.min_spacing_ms) / hop_ms).ceil() as i64;
    let candidates = pick_peaks(&flux, &delta_energy, flux_threshold, energy_threshold, min_spacing_frames);
    let capped = cap_by_strength(candidates, cfg.max_onsets);

    let refined: Vec<Onset> = capped
        .into_iter()
        .map(|(frame_idx, strength, confidence)| {
            let t_ms = refine_time(&processed, sample_rate, frame_idx, cfg);
            Onset {
                t_ms,
                strength,
                confidence,
            }
        })
        .filter(|o| o.t_ms >= 30.0)
        .collect();

    dedup_by_spacing(refined, cfg.min_spacing_ms)
}

/// DC-block, high-pass, and pre-emphasize the input in sequence.
fn preprocess(samples: &[f32], sample_rate: u32, cfg: &OnsetConfig) -> Vec<f32> {
    let dc_removed = remove_dc(samples);
    let hpf = one_pole_highpass(&dc_removed, sample_rate, cfg.hpf_cutoff_hz);
    pre_emphasize(&hpf, cfg.pre_emphasis)
}

fn remove_dc(samples: &[f32]) -> Vec<f32> {
    let mean = samples.iter().sum::<f32>() / samples.len() as f32;
    samples.iter().map(|&s| s - mean).collect()
}

fn one_pole_highpass(samples: &[f32], sample_rate: u32, cutoff_hz: f32) -> Vec<f32> {
    let dt = 1.0 / sample_rate as f32;
    let rc = 1.0 / (2.0 * PI * cutoff_hz);
    let alpha = rc / (rc + dt);

    let mut out = vec![0.0f32; samples.len()];
    if samples.is_empty() {
        return out;
    }
    out[0] = samples[0];
    for n in 1..samples.len() {
        out[n] = alpha * (out[n - 1] + samples[n] - samples[n - 1]);
    }
    out
}

fn pre_emphasize(samples: &[f32], coeff: f32) -> Vec<f32> {
    let mut out = vec![0.0f32; samples.len()];
    if samples.is_empty() {
        return out;
    }
    out[0] = samples[0];
    for n in 1..samples.len() {
        out[n] = samples[n] - coeff * samples[n - 1];
    }
    out
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f32 / (size as f32 - 1.0)).cos())
        .collect()
}

fn f_bin(freq_hz: f32, frame_size: usize, sample_rate: u32) -> usize {
    let bin = (freq_hz * frame_size as f32 / sample_rate as f32).round();
    let max_bin = frame_size / 2;
    (bin.max(0.0) as usize).min(max_bin)
}

/// Returns per-frame spectral flux and per-frame energy-rise series.
#[allow(clippy::too_many_lines)]
fn analyze_frames(
    samples: &[f32],
    sample_rate: u32,
    cfg: &OnsetConfig,
) -> (Vec<f32>, Vec<f32>) {
    let window = hann_window(cfg.frame_size);
    let mut planner = FftPlanner::<f32>::new();
    let fft: Arc<dyn Fft<f32>> = planner.plan_fft_forward(cfg.frame_size);

    let bin_lo = f_bin(cfg.flux_low_hz, cfg.frame_size, sample_rate);
    let bin_hi = f_bin(cfg.flux_high_hz, cfg.frame_size, sample_rate);

    let num_frames = if samples.len() >= cfg.frame_size {
        (samples.len() - cfg.frame_size) / cfg.hop_size + 1
    } else {
        0
    };

    let mut prev_mag: Option<Vec<f32>> = None;
    let mut prev_energy = 0.0f32;
    let mut flux = Vec::with_capacity(num_frames);
    let mut delta_energy = Vec::with_capacity(num_frames);

    for i in 0..num_frames {
        let start = i * cfg.hop_size;
        let frame = &samples[start..start + cfg.frame_size];

        let mut energy = 0.0f32;
        let mut buf: Vec<Complex<f32>> = Vec::with_capacity(cfg.frame_size);
        for (n, &s) in frame.iter().enumerate() {
            let windowed = s * window[n];
            energy += windowed * windowed;
            buf.push(Complex::new(windowed, 0.0));
        }
        fft.process(&mut buf);

        let mag: Vec<f32> = buf[..=cfg.frame_size / 2]
            .iter()
            .map(Complex::norm)
            .collect();

        let frame_flux = match &prev_mag {
            Some(prev) => (bin_lo..=bin_hi)
                .map(|k| (mag[k] - prev[k]).max(0.0))
                .sum(),
            None => 0.0,
        };
        flux.push(frame_flux);

        let de = if i == 0 {
            0.0
        } else {
            (energy - prev_energy).max(0.0)
        };
        delta_energy.push(de);

        prev_mag = Some(mag);
        prev_energy = energy;
    }

    (flux, delta_energy)
}

/// `median + k * MAD`, falling back to `median * 1.5` when the series is
/// degenerate (MAD of zero — e.g. near-silent audio).
fn adaptive_threshold(series: &[f32], k: f32) -> f32 {
    let med = median(series);
    let deviations: Vec<f32> = series.iter().map(|&v| (v - med).abs()).collect();
    let mad = median(&deviations);
    if mad > 0.0 {
        med + k * mad
    } else {
        med * 1.5
    }
}

fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn pick_peaks(
    flux: &[f32],
    delta_energy: &[f32],
    flux_threshold: f32,
    energy_threshold: f32,
    min_spacing_frames: i64,
) -> Vec<(usize, f32, f32)> {
    let mut accepted = Vec::new();
    let mut last_accepted: i64 = i64::MIN / 2;

    for i in 1..flux.len().saturating_sub(1) {
        if flux[i] > flux_threshold
            && flux[i] > flux[i - 1]
            && flux[i] >= flux[i + 1]
            && delta_energy[i] >= energy_threshold
            && (i as i64 - last_accepted) >= min_spacing_frames
        {
            let confidence = ((flux[i] - flux_threshold) / (2.0 * flux_threshold)).clamp(0.0, 1.0);
            accepted.push((i, flux[i], confidence));
            last_accepted = i as i64;
        }
    }
    accepted
}

fn cap_by_strength(mut candidates: Vec<(usize, f32, f32)>, max_onsets: usize) -> Vec<(usize, f32, f32)> {
    if candidates.len() <= max_onsets {
        return candidates;
    }
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    candidates.truncate(max_onsets);
    candidates.sort_by_key(|c| c.0);
    candidates
}

fn refine_time(samples: &[f32], sample_rate: u32, frame_idx: usize, cfg: &OnsetConfig) -> f64 {
    let center_sample = frame_idx * cfg.hop_size + cfg.frame_size / 2;
    let window_samples = (f64::from(cfg.refine_window_ms) / 1000.0 * f64::from(sample_rate)) as usize;
    let lo = center_sample.saturating_sub(window_samples);
    let hi = (center_sample + window_samples).min(samples.len().saturating_sub(1));

    let mut best_idx = center_sample.min(samples.len().saturating_sub(1));
    let mut best_val = -1.0f32;
    for n in lo.max(1)..=hi.max(1) {
        if n >= samples.len() {
            break;
        }
        let d = (samples[n] - samples[n - 1]).abs();
        if d > best_val {
            best_val = d;
            best_idx = n;
        }
    }

    best_idx as f64 / f64::from(sample_rate) * 1000.0
}

fn dedup_by_spacing(mut onsets: Vec<Onset>, min_spacing_ms: u32) -> Vec<Onset> {
    onsets.sort_by(|a, b| a.t_ms.partial_cmp(&b.t_ms).unwrap());

    let mut collapsed: Vec<Onset> = Vec::with_capacity(onsets.len());
    for onset in onsets {
        if let Some(last) = collapsed.last_mut() {
            if onset.t_ms - last.t_ms < f64::from(min_spacing_ms) {
                if onset.strength > last.strength {
                    *last = onset;
                }
                continue;
            }
        }
        collapsed.push(onset);
    }
    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth_burst_track(sample_rate: u32, onset_times_ms: &[f64], duration_ms: f64) -> Vec<f32> {
        let len = (duration_ms / 1000.0 * f64::from(sample_rate)) as usize;
        let mut out = vec![0.0f32; len];
        for &t in onset_times_ms {
            let start = (t / 1000.0 * f64::from(sample_rate)) as usize;
            let burst_len = (0.010 * f64::from(sample_rate)) as usize; // 10ms
            for i in 0..burst_len {
                if start + i >= out.len() {
                    break;
                }
                let phase = 2.0 * PI * 4000.0 * i as f32 / sample_rate as f32;
                out[start + i] += phase.cos() * 0.9;
            }
        }
        out
    }

    #[test]
    fn detects_onsets_on_synthetic_bursts() {
        let sample_rate = 16_000;
        let times: Vec<f64> = (0..10).map(|n| 500.0 + f64::from(n) * 125.0).collect();
        let track = synth_burst_track(sample_rate, &times, 2200.0);
        let cfg = OnsetConfig::default();
        let onsets = detect(&track, sample_rate, &cfg);
        assert!(onsets.len() >= 6, "expected at least 6 onsets, got {}", onsets.len());
    }

    #[test]
    fn silence_yields_no_onsets() {
        let sample_rate = 16_000;
        let track = vec![0.0f32; sample_rate as usize];
        let cfg = OnsetConfig::default();
        let onsets = detect(&track, sample_rate, &cfg);
        assert!(onsets.is_empty());
    }

    #[test]
    fn dedup_collapses_close_onsets_keeping_strongest() {
        let onsets = vec![
            Onset { t_ms: 100.0, strength: 1.0, confidence: 0.5 },
            Onset { t_ms: 120.0, strength: 2.0, confidence: 0.5 },
            Onset { t_ms: 300.0, strength: 1.5, confidence: 0.5 },
        ];
        let out = dedup_by_spacing(onsets, 60);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].strength, 2.0);
    }
}
