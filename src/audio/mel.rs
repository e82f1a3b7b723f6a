//! Log-mel spectrogram front-end.
//!
//! Frames the signal with a 400-sample Hann window, 160-sample hop, zero-
//! pads the tail to a full frame, computes the power spectrum of each
//! frame via real FFT, projects through a fixed 128-bin mel filterbank
//! (slaney-normalized triangular filters over 0–8000 Hz) and takes a
//! floored log. Output is laid out `mel[bin * n_frames + frame]`
//! (column-major over frames), matching spec.md section 4.4.

use realfft::RealFftPlanner;
use std::f32::consts::PI;
use std::sync::OnceLock;

use crate::error::{QwenAsrError, Result};

pub const SAMPLE_RATE: u32 = 16_000;
pub const WINDOW_LENGTH: usize = 400;
pub const HOP_LENGTH: usize = 160;
pub const N_MELS: usize = 128;
pub const N_FFT: usize = 512;
const F_MIN: f32 = 0.0;
const F_MAX: f32 = 8_000.0;
const LOG_FLOOR: f32 = 1e-10;

fn hann_window() -> &'static [f32; WINDOW_LENGTH] {
    static WINDOW: OnceLock<[f32; WINDOW_LENGTH]> = OnceLock::new();
    WINDOW.get_or_init(|| {
        let mut w = [0.0f32; WINDOW_LENGTH];
        for (i, v) in w.iter_mut().enumerate() {
            *v = 0.5 - 0.5 * (2.0 * PI * i as f32 / (WINDOW_LENGTH as f32 - 1.0)).cos();
        }
        w
    })
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank, `[N_MELS][N_FFT/2 + 1]`, slaney-normalized
/// (each filter scaled by `2 / (f_right - f_left)` so equal-energy input
/// produces roughly equal-magnitude mel output).
fn mel_filterbank() -> &'static Vec<Vec<f32>> {
    static FB: OnceLock<Vec<Vec<f32>>> = OnceLock::new();
    FB.get_or_init(|| {
        let n_bins = N_FFT / 2 + 1;
        let mel_min = hz_to_mel(F_MIN);
        let mel_max = hz_to_mel(F_MAX);
        let mel_points: Vec<f32> = (0..N_MELS + 2)
            .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (N_MELS as f32 + 1.0))
            .collect();
        let hz_points: Vec<f32> = mel_points.iter().map(|&m| mel_to_hz(m)).collect();
        let bin_freqs: Vec<f32> = (0..n_bins)
            .map(|k| k as f32 * SAMPLE_RATE as f32 / N_FFT as f32)
            .collect();

        (0..N_MELS)
            .map(|m| {
                let f_left = hz_points[m];
                let f_center = hz_points[m + 1];
                let f_right = hz_points[m + 2];
                let norm = 2.0 / (f_right - f_left).max(1e-10);
                bin_freqs
                    .iter()
                    .map(|&f| {
                        let left_slope = (f - f_left) / (f_center - f_left).max(1e-10);
                        let right_slope = (f_right - f) / (f_right - f_center).max(1e-10);
                        left_slope.min(right_slope).max(0.0) * norm
                    })
                    .collect()
            })
            .collect()
    })
}

/// Computes the log-mel spectrogram of `samples` (mono f32 at 16 kHz).
/// Returns `(mel, n_frames)` with `mel.len() == N_MELS * n_frames` and
/// `n_frames == ceil(n_samples / HOP_LENGTH)` for any `n_samples`,
/// including zero.
pub fn mel_spectrogram(samples: &[f32]) -> Result<(Vec<f32>, usize)> {
    let n_samples = samples.len();
    let n_frames = n_samples.div_ceil(HOP_LENGTH);

    let window = hann_window();
    let filterbank = mel_filterbank();

    let mut planner = RealFftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(N_FFT);
    let mut spectrum = fft.make_output_vec();
    let mut scratch = fft.make_scratch_vec();

    let mut power = vec![0.0f32; n_frames * (N_FFT / 2 + 1)];

    for (t, power_frame) in power.chunks_mut(N_FFT / 2 + 1).enumerate() {
        let start = t * HOP_LENGTH;
        let mut windowed = vec![0.0f32; N_FFT];
        for i in 0..WINDOW_LENGTH {
            let idx = start + i;
            let sample = if idx < n_samples { samples[idx] } else { 0.0 };
            windowed[i] = sample * window[i];
        }

        fft.process_with_scratch(&mut windowed, &mut spectrum, &mut scratch)
            .map_err(|e| QwenAsrError::InvalidArgument(format!("fft failed: {e}")))?;

        for (p, c) in power_frame.iter_mut().zip(spectrum.iter()) {
            *p = c.re * c.re + c.im * c.im;
        }
    }

    let mut mel = vec![0.0f32; N_MELS * n_frames];
    for (bin, filt) in filterbank.iter().enumerate() {
        for t in 0..n_frames {
            let power_frame = &power[t * (N_FFT / 2 + 1)..(t + 1) * (N_FFT / 2 + 1)];
            let energy: f32 = filt.iter().zip(power_frame).map(|(f, p)| f * p).sum();
            mel[bin * n_frames + t] = energy.max(LOG_FLOOR).ln();
        }
    }

    // Normalize relative to the clip's own peak, then clamp to the
    // [-1, 1]-ish range the model's input layer expects, matching the
    // "subtract global offset and clamp" step in spec.md section 4.4.
    let max_val = mel.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max_val.is_finite() {
        for v in mel.iter_mut() {
            *v = ((*v - max_val + 8.0) / 4.0).clamp(-4.0, 4.0);
        }
    }

    Ok((mel, n_frames))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_matches_ceil_formula() {
        for n in [0usize, 1, 159, 160, 161, 16_000, 16_001] {
            let samples = vec![0.0f32; n];
            let (mel, n_frames) = mel_spectrogram(&samples).unwrap();
            let expected = n.div_ceil(HOP_LENGTH);
            assert_eq!(n_frames, expected, "n_samples={n}");
            assert_eq!(mel.len(), N_MELS * n_frames);
        }
    }

    #[test]
    fn output_is_always_finite() {
        let samples: Vec<f32> = (0..16_000).map(|i| (i as f32 * 0.01).sin()).collect();
        let (mel, _) = mel_spectrogram(&samples).unwrap();
        assert!(mel.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn silence_is_finite_and_flat() {
        let samples = vec![0.0f32; 16_000];
        let (mel, n_frames) = mel_spectrogram(&samples).unwrap();
        assert!(mel.iter().all(|v| v.is_finite()));
        assert_eq!(mel.len(), N_MELS * n_frames);
        // Every bin hits the same log floor for pure silence, so after
        // peak-normalizing they all land on the same value.
        for v in &mel {
            approx::assert_abs_diff_eq!(*v, 2.0, epsilon = 1e-4);
        }
    }
}
