//! Top-level engine handle: owns the loaded weights, tokenizer, KV cache,
//! and per-call performance counters, and exposes the transcription
//! pipeline as a single `transcribe` call. Mirrors the lazy-load,
//! single-owner-struct shape of a typical inference engine wrapper, with
//! a typed `Result` at every boundary instead of a generic error string.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::audio::mel;
use crate::config::ModelConfig;
use crate::error::{QwenAsrError, Result};
use crate::kernels::{self, BackendKind, KernelBackend};
use crate::model::{Decoder, Encoder, KvCache};
use crate::safetensors_loader;
use crate::tensor::WeightArena;
use crate::threadpool;
use crate::tokenizer::Vocabulary;

/// Per-call timing and token counters, reset at the start of every
/// `transcribe` invocation.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PerfCounters {
    pub audio_ms: f64,
    pub encode_ms: f64,
    pub decode_ms: f64,
    pub total_ms: f64,
    pub text_tokens: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TranscriptResult {
    pub text: String,
    pub language: Option<String>,
    pub perf: PerfCounters,
}

const DEFAULT_SYSTEM_PROMPT: &str = "Transcribe the audio.";

pub struct Context {
    config: ModelConfig,
    arena: WeightArena,
    vocab: Vocabulary,
    backend: Arc<dyn KernelBackend>,
    backend_kind: BackendKind,
    encoder: Encoder,
    decoder: Decoder,
    kv_cache: KvCache,
    force_language: Option<String>,
    prompt: Option<String>,
    perf: PerfCounters,
}

impl Context {
    /// Loads `config.json`, `model.safetensors`, and `vocab.json` from
    /// `model_dir`, probes the CPU for the best kernel backend, and
    /// allocates the KV cache up front so `transcribe` never allocates a
    /// buffer sized by the checkpoint's own dimensions mid-call.
    pub fn load(model_dir: &Path) -> Result<Self> {
        let start = Instant::now();

        let config = ModelConfig::load(&model_dir.join("config.json"))?;
        info!(
            encoder_layers = config.encoder.num_hidden_layers,
            decoder_layers = config.decoder.num_hidden_layers,
            "loaded model config"
        );

        let arena = safetensors_loader::load(&model_dir.join("model.safetensors"))?;
        info!(tensors = arena.len(), "loaded weight arena");

        let vocab = Vocabulary::load(&model_dir.join("vocab.json"))?;
        info!(vocab_size = vocab.vocab_size(), "loaded tokenizer");

        let (backend, backend_kind) = kernels::select_backend();
        debug!(?backend_kind, "selected kernel backend");

        let encoder = Encoder::new(config.encoder.clone(), backend.clone());
        let decoder = Decoder::new(config.decoder.clone(), backend.clone());
        let kv_cache = decoder.new_kv_cache();

        info!(elapsed_ms = start.elapsed().as_millis() as u64, "context ready");

        Ok(Self {
            config,
            arena,
            vocab,
            backend,
            backend_kind,
            encoder,
            decoder,
            kv_cache,
            force_language: None,
            prompt: None,
            perf: PerfCounters::default(),
        })
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    pub fn set_threads(&self, n: usize) {
        threadpool::set_threads(n);
    }

    pub fn supported_languages_csv(&self) -> String {
        self.vocab.supported_languages_csv()
    }

    /// Pins generation to a single language tag, or clears the pin with
    /// `None`. Rejects tags the tokenizer doesn't know about up front
    /// rather than failing deep inside generation.
    pub fn set_force_language(&mut self, language: Option<&str>) -> Result<()> {
        match language {
            Some(lang) => {
                if self.vocab.language_token(lang).is_none() {
                    return Err(QwenAsrError::UnsupportedLanguage(lang.to_string()));
                }
                self.force_language = Some(lang.to_string());
            }
            None => self.force_language = None,
        }
        Ok(())
    }

    /// Overrides the system prompt prepended to every transcription
    /// request. `None` restores the built-in default.
    pub fn set_prompt(&mut self, prompt: Option<&str>) {
        self.prompt = prompt.map(str::to_string);
    }

    pub fn perf(&self) -> &PerfCounters {
        &self.perf
    }

    /// Computes the log-mel spectrogram of `samples`, exposed standalone
    /// so callers can inspect the front-end independently of the model.
    pub fn mel_spectrogram(&self, samples: &[f32]) -> Result<(Vec<f32>, usize)> {
        mel::mel_spectrogram(samples)
    }

    /// Runs just the audio encoder, exposed standalone for callers that
    /// want encoder hidden states without paying for decoding.
    pub fn encoder_forward(&self, mel_values: &[f32], n_frames: usize) -> Result<Vec<f32>> {
        self.encoder.forward(&self.arena, mel_values, n_frames)
    }

    /// Runs the full encode → prefill → autoregressive-decode pipeline
    /// over `samples` (mono f32 PCM at 16 kHz) and returns the detokenized
    /// transcript plus this call's performance counters.
    pub fn transcribe(&mut self, samples: &[f32]) -> Result<TranscriptResult> {
        let total_start = Instant::now();
        self.perf = PerfCounters::default();
        self.kv_cache.reset();

        self.perf.audio_ms = samples.len() as f64 / self.config.sample_rate as f64 * 1000.0;

        let encode_start = Instant::now();
        let (mel_values, n_frames) = mel::mel_spectrogram(samples)?;
        if n_frames > self.config.encoder.max_source_positions * self.config.encoder.conv_stride {
            return Err(QwenAsrError::AudioTooLong {
                n_frames,
                max_frames: self.config.encoder.max_source_positions * self.config.encoder.conv_stride,
            });
        }
        let encoder_hidden = self.encoder.forward(&self.arena, &mel_values, n_frames)?;
        let t_enc = encoder_hidden.len() / self.config.encoder.hidden_size;
        self.perf.encode_ms = encode_start.elapsed().as_secs_f64() * 1000.0;

        let decode_start = Instant::now();
        let cross = self.decoder.precompute_cross(&self.arena, &encoder_hidden, t_enc)?;

        let prompt_tokens = self.build_prompt()?;
        if prompt_tokens.len() >= self.config.max_context_length {
            return Err(QwenAsrError::InvalidArgument(
                "prompt already fills the context window".to_string(),
            ));
        }

        let hidden = self
            .decoder
            .forward_chunk(&self.arena, &prompt_tokens, 0, &mut self.kv_cache, &cross)?;
        let hidden_dim = self.config.decoder.hidden_size;
        let mut last_hidden = hidden[hidden.len() - hidden_dim..].to_vec();

        let mut generated = Vec::new();
        let max_steps = self
            .config
            .max_new_tokens
            .min(self.config.max_context_length.saturating_sub(prompt_tokens.len()));

        for _ in 0..max_steps {
            let logits = self.decoder.lm_head(&self.arena, &last_hidden)?;
            let next_id = self.decoder.argmax(&logits) as u32;
            if next_id == self.vocab.special.eos {
                break;
            }
            generated.push(next_id);

            let pos = prompt_tokens.len() + generated.len() - 1;
            let hidden = self
                .decoder
                .forward_chunk(&self.arena, &[next_id], pos, &mut self.kv_cache, &cross)?;
            last_hidden = hidden;
        }
        self.perf.decode_ms = decode_start.elapsed().as_secs_f64() * 1000.0;
        self.perf.total_ms = total_start.elapsed().as_secs_f64() * 1000.0;

        let text_tokens: Vec<u32> = generated.iter().copied().filter(|&id| !self.vocab.is_special(id)).collect();
        self.perf.text_tokens = text_tokens.len();
        let text = self.vocab.decode(&text_tokens);

        info!(
            text_tokens = self.perf.text_tokens,
            total_ms = self.perf.total_ms,
            "transcription complete"
        );
        if crate::verbose() {
            let rt_factor = if self.perf.audio_ms > 0.0 { self.perf.total_ms / self.perf.audio_ms } else { 0.0 };
            eprintln!(
                "encode_ms={:.2} decode_ms={:.2} total_ms={:.2} rt_factor={:.3}",
                self.perf.encode_ms, self.perf.decode_ms, self.perf.total_ms, rt_factor
            );
        }

        Ok(TranscriptResult {
            text,
            language: self.force_language.clone(),
            perf: self.perf.clone(),
        })
    }

    fn build_prompt(&self) -> Result<Vec<u32>> {
        let mut ids = vec![self.vocab.special.bos, self.vocab.special.system];
        let system_text = self.prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
        ids.extend(self.vocab.encode(system_text));
        ids.push(self.vocab.special.assistant);
        if let Some(lang) = &self.force_language {
            if let Some(tok) = self.vocab.language_token(lang) {
                ids.push(tok);
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perf_counters_default_to_zero() {
        let perf = PerfCounters::default();
        assert_eq!(perf.text_tokens, 0);
        assert_eq!(perf.total_ms, 0.0);
    }
}
