//! Decoded audio buffer.

/// Mono PCM samples normalized to `[-1.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    /// Mono samples, one per frame.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count in the source file (pre-downmix).
    pub source_channels: u16,
}

impl AudioBuffer {
    /// Duration of the buffer in seconds.
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}
