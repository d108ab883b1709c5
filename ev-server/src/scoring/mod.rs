//! Bounded scoring worker pool: decode → onset detect → grid score,
//! offloaded from the gateway with a queue cap, per-task timeout, and
//! crash/timeout recovery.
//!
//! Workers are plain `tokio` tasks reading from a shared bounded channel —
//! "goroutines loading the same binary," per the redesign note this
//! replaces inline script-eval workers with. A supervisor watches each
//! worker's `JoinHandle` and respawns it if the worker loop itself panics;
//! independently, each worker wraps its own in-flight pipeline call in an
//! inner `tokio::spawn` + `timeout`, aborting and moving on when a single
//! task overruns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use ev_common::grid::{self, Grid, GridKind, TimingScore};
use ev_common::onset::{self, OnsetConfig};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{AppError, AppResult, WorkerErrorCode};

const MIN_DURATION_SECONDS: f64 = 0.3;
const MAX_DURATION_SECONDS: f64 = 20.0;
const PHASE_RESOLUTION_MS: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct ScoreInputs {
    pub audio_base64: String,
    pub bpm: f64,
    pub grid: GridKind,
    pub tolerance_ms: f64,
    pub max_events: usize,
}

#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    pub duration_seconds: f64,
    pub score: TimingScore,
}

/// Decode, gate on duration, detect onsets, and grid-score. Pure aside from
/// the base64/WAV decode; safe to call inline when the worker pool is
/// disabled.
pub fn run_pipeline(inputs: &ScoreInputs) -> Result<ScoreOutcome, AppError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&inputs.audio_base64)
        .map_err(|e| AppError::Worker(WorkerErrorCode::InvalidAudio, format!("invalid base64: {e}")))?;

    let buffer = ev_common::wav::decode(&bytes)
        .map_err(|e| AppError::Worker(WorkerErrorCode::InvalidAudio, e.to_string()))?;

    let duration_seconds = buffer.duration_seconds();
    if duration_seconds < MIN_DURATION_SECONDS {
        return Err(AppError::Worker(WorkerErrorCode::TooShort, "audio too short".into()));
    }
    if duration_seconds > MAX_DURATION_SECONDS {
        return Err(AppError::Worker(WorkerErrorCode::TooLong, "audio too long".into()));
    }

    let onsets = onset::detect(&buffer.samples, buffer.sample_rate, &OnsetConfig::default());

    let step_ms = 60_000.0 / inputs.bpm / inputs.grid.divisor();
    let times_ms: Vec<f64> = onsets.iter().map(|o| o.t_ms).collect();
    let phase_ms = grid::fit_phase(&times_ms, step_ms, PHASE_RESOLUTION_MS);

    let resolved_grid = Grid {
        kind: inputs.grid,
        step_ms,
        phase_ms,
        tolerance_ms: inputs.tolerance_ms,
    };

    let score = grid::score(&onsets, &resolved_grid, inputs.max_events);

    Ok(ScoreOutcome {
        duration_seconds,
        score,
    })
}

struct Task {
    inputs: ScoreInputs,
    respond_to: oneshot::Sender<AppResult<ScoreOutcome>>,
}

/// Bounded scoring worker pool.
pub struct WorkerPool {
    sender: Option<mpsc::Sender<Task>>,
    pending: Arc<AtomicUsize>,
    queue_limit: usize,
    disabled: bool,
    supervisor: Option<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Build the pool. When `disabled`, `submit` runs the pipeline inline
    /// in the caller and no background tasks are spawned.
    #[must_use]
    pub fn new(worker_count: usize, queue_limit: usize, task_timeout_ms: u64, disabled: bool) -> Self {
        if disabled {
            return Self {
                sender: None,
                pending: Arc::new(AtomicUsize::new(0)),
                queue_limit,
                disabled: true,
                supervisor: None,
            };
        }

        let (tx, rx) = mpsc::channel::<Task>(queue_limit);
        let rx = Arc::new(Mutex::new(rx));
        let pending = Arc::new(AtomicUsize::new(0));
        let timeout = Duration::from_millis(task_timeout_ms);

        let supervisor = tokio::spawn(supervise(rx, worker_count, timeout));

        Self {
            sender: Some(tx),
            pending,
            queue_limit,
            disabled: false,
            supervisor: Some(supervisor),
        }
    }

    /// Submit a scoring task. Rejects immediately with "queue busy" when
    /// `pending (queued + in-flight) >= queue_limit`.
    pub async fn submit(&self, inputs: ScoreInputs) -> AppResult<ScoreOutcome> {
        if self.disabled {
            return run_pipeline(&inputs);
        }

        if self.pending.load(Ordering::SeqCst) >= self.queue_limit {
            return Err(AppError::Worker(WorkerErrorCode::Internal, "queue busy".into()));
        }
        self.pending.fetch_add(1, Ordering::SeqCst);

        let (resp_tx, resp_rx) = oneshot::channel();
        let sender = self.sender.as_ref().expect("pool not disabled");
        if sender.send(Task { inputs, respond_to: resp_tx }).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::Worker(WorkerErrorCode::Internal, "please retry".into()));
        }

        let pending = self.pending.clone();
        let result = resp_rx.await;
        pending.fetch_sub(1, Ordering::SeqCst);

        result.unwrap_or_else(|_| Err(AppError::Worker(WorkerErrorCode::Internal, "please retry".into())))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

async fn supervise(rx: Arc<Mutex<mpsc::Receiver<Task>>>, worker_count: usize, timeout: Duration) {
    let mut handles: Vec<tokio::task::JoinHandle<()>> =
        (0..worker_count).map(|_| spawn_worker(rx.clone(), timeout)).collect();

    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        for handle in &mut handles {
            if handle.is_finished() {
                tracing::warn!("scoring worker exited, respawning");
                *handle = spawn_worker(rx.clone(), timeout);
            }
        }
    }
}

fn spawn_worker(rx: Arc<Mutex<mpsc::Receiver<Task>>>, timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let task = {
                let mut guard = rx.lock().await;
                guard.recv().await
            };
            let Some(task) = task else {
                return;
            };

            let Task { inputs, respond_to } = task;
            let inner = tokio::task::spawn_blocking(move || run_pipeline(&inputs));

            match tokio::time::timeout(timeout, inner).await {
                Ok(Ok(result)) => {
                    let _ = respond_to.send(result);
                }
                Ok(Err(_join_panic)) => {
                    tracing::error!("scoring task panicked");
                    let _ = respond_to.send(Err(AppError::Worker(WorkerErrorCode::Internal, "please retry".into())));
                }
                Err(_elapsed) => {
                    tracing::warn!("scoring task timed out, slot restarting");
                    let _ = respond_to.send(Err(AppError::Worker(WorkerErrorCode::Internal, "please retry".into())));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn burst_wav_base64(n_onsets: usize, bpm: f64, step_ms: f64, phase_ms: f64) -> String {
        let sample_rate = 16_000u32;
        let duration_s = 2.2;
        let total_samples = (sample_rate as f64 * duration_s) as usize;
        let mut samples = vec![0i16; total_samples];

        for n in 0..n_onsets {
            let t_ms = phase_ms + n as f64 * step_ms;
            let start = (t_ms / 1000.0 * f64::from(sample_rate)) as usize;
            for i in 0..(sample_rate as usize / 100) {
                let idx = start + i;
                if idx < samples.len() {
                    let t = i as f64 / f64::from(sample_rate);
                    let v = (2.0 * std::f64::consts::PI * 4000.0 * t).cos() * 20000.0;
                    samples[idx] = v as i16;
                }
            }
        }

        let mut data = Vec::new();
        for s in &samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        let byte_rate = sample_rate * 2;
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&((36 + data.len()) as u32).to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&sample_rate.to_le_bytes());
        wav.extend_from_slice(&byte_rate.to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&(data.len() as u32).to_le_bytes());
        wav.extend_from_slice(&data);

        let _ = bpm;
        base64::engine::general_purpose::STANDARD.encode(&wav)
    }

    /// Same burst generator, but each onset alternates `±jitter_ms` off its
    /// grid slot instead of landing exactly on it.
    fn wobble_wav_base64(n_onsets: usize, step_ms: f64, phase_ms: f64, jitter_ms: f64) -> String {
        let sample_rate = 16_000u32;
        let duration_s = 2.2;
        let total_samples = (sample_rate as f64 * duration_s) as usize;
        let mut samples = vec![0i16; total_samples];

        for n in 0..n_onsets {
            let offset = if n % 2 == 0 { jitter_ms } else { -jitter_ms };
            let t_ms = phase_ms + n as f64 * step_ms + offset;
            let start = (t_ms / 1000.0 * f64::from(sample_rate)) as usize;
            for i in 0..(sample_rate as usize / 100) {
                let idx = start + i;
                if idx < samples.len() {
                    let t = i as f64 / f64::from(sample_rate);
                    let v = (2.0 * std::f64::consts::PI * 4000.0 * t).cos() * 20000.0;
                    samples[idx] = v as i16;
                }
            }
        }

        let mut data = Vec::new();
        for s in &samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        let byte_rate = sample_rate * 2;
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&((36 + data.len()) as u32).to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&sample_rate.to_le_bytes());
        wav.extend_from_slice(&byte_rate.to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&(data.len() as u32).to_le_bytes());
        wav.extend_from_slice(&data);

        base64::engine::general_purpose::STANDARD.encode(&wav)
    }

    #[test]
    fn wobble_scenario() {
        let step_ms = 60_000.0 / 100.0 / 4.0;
        let audio_base64 = wobble_wav_base64(10, step_ms, 400.0, 25.0);
        let inputs = ScoreInputs {
            audio_base64,
            bpm: 100.0,
            grid: GridKind::Sixteenth,
            tolerance_ms: 15.0,
            max_events: 180,
        };
        let outcome = run_pipeline(&inputs).unwrap();
        assert!(outcome.score.stats.mean_abs_ms > 12.0);
        assert!(outcome.score.stats.on_time_pct < 80.0);
    }

    #[test]
    fn bursts_on_grid_scenario() {
        let step_ms = 60_000.0 / 120.0 / 4.0;
        let audio_base64 = burst_wav_base64(10, 120.0, step_ms, 500.0);
        let inputs = ScoreInputs {
            audio_base64,
            bpm: 120.0,
            grid: GridKind::Sixteenth,
            tolerance_ms: 15.0,
            max_events: 180,
        };
        let outcome = run_pipeline(&inputs).unwrap();
        assert!(outcome.score.stats.event_count >= 6);
        assert!(outcome.score.stats.mean_abs_ms < 15.0);
        assert!(outcome.score.stats.on_time_pct > 60.0);
    }

    #[test]
    fn too_short_audio_is_rejected() {
        let inputs = ScoreInputs {
            audio_base64: burst_wav_base64(0, 120.0, 1.0, 0.0)[..200].to_string(),
            bpm: 120.0,
            grid: GridKind::Beat,
            tolerance_ms: 15.0,
            max_events: 180,
        };
        assert!(run_pipeline(&inputs).is_err());
    }

    #[tokio::test]
    async fn disabled_pool_runs_inline() {
        let pool = WorkerPool::new(2, 32, 15_000, true);
        let step_ms = 60_000.0 / 120.0 / 4.0;
        let inputs = ScoreInputs {
            audio_base64: burst_wav_base64(10, 120.0, step_ms, 500.0),
            bpm: 120.0,
            grid: GridKind::Sixteenth,
            tolerance_ms: 15.0,
            max_events: 180,
        };
        let outcome = pool.submit(inputs).await.unwrap();
        assert!(outcome.score.stats.event_count >= 6);
    }
}
