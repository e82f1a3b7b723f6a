//! Audio front-end: a thin `AudioBuffer` carrier plus the mel spectrogram
//! kernel. The engine never resamples or decodes containers itself —
//! callers (the CLI, the server) are responsible for handing it mono f32
//! PCM already at 16 kHz, per spec.md section 4.4's "caller contract".

pub mod mel;

use crate::error::{QwenAsrError, Result};

/// Mono PCM samples at a declared sample rate.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Validates the caller contract (16 kHz mono) before the buffer is
    /// handed to `mel::mel_spectrogram`.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate != mel::SAMPLE_RATE {
            return Err(QwenAsrError::InvalidArgument(format!(
                "expected {} Hz input, got {} Hz",
                mel::SAMPLE_RATE,
                self.sample_rate
            )));
        }
        Ok(())
    }

    /// Scales samples so the peak magnitude is `target` (no-op on silence).
    pub fn peak_normalize(&mut self, target: f32) {
        let peak = self
            .samples
            .iter()
            .fold(0.0f32, |acc, &v| acc.max(v.abs()));
        if peak > 0.0 {
            let gain = target / peak;
            for s in self.samples.iter_mut() {
                *s *= gain;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_sample_rate() {
        let buf = AudioBuffer::new(vec![0.0; 100], 44_100);
        assert!(buf.validate().is_err());
    }

    #[test]
    fn peak_normalize_scales_to_target() {
        let mut buf = AudioBuffer::new(vec![0.1, -0.2, 0.05], 16_000);
        buf.peak_normalize(1.0);
        assert!((buf.samples[1].abs() - 1.0).abs() < 1e-6);
    }
}
