//! Model configuration, loaded from `config.json` in the model directory.
//!
//! Mirrors the nested `audio_config` / `text_config` shape used by
//! Qwen3-ASR-family checkpoints. Every field is read from the checkpoint's
//! JSON rather than hardcoded (per spec.md's Open Questions), with
//! conservative defaults so a config file that predates a field still
//! loads.

use serde_json::Value;

use crate::error::{QwenAsrError, Result};

/// Audio front-end + encoder configuration.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub num_mel_bins: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub conv_stride: usize,
    pub max_source_positions: usize,
    pub rope_theta: f32,
    pub rms_norm_eps: f32,
    pub use_rotary: bool,
}

/// Decoder configuration (grouped-query causal transformer).
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    pub max_position_embeddings: usize,
}

impl DecoderConfig {
    pub fn groups(&self) -> usize {
        self.num_key_value_heads
    }

    pub fn queries_per_group(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }
}

/// Top-level immutable model configuration.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub sample_rate: u32,
    pub hop_length: usize,
    pub window_length: usize,
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
    pub max_context_length: usize,
    /// Hard cap on generated steps per call, independent of `T_max`.
    pub max_new_tokens: usize,
}

fn get_usize(v: &Value, key: &str, default: usize) -> usize {
    v.get(key)
        .and_then(Value::as_u64)
        .and_then(|x| usize::try_from(x).ok())
        .unwrap_or(default)
}

fn get_f32(v: &Value, key: &str, default: f32) -> f32 {
    v.get(key)
        .and_then(Value::as_f64)
        .map(|x| x as f32)
        .unwrap_or(default)
}

fn get_bool(v: &Value, key: &str, default: bool) -> bool {
    v.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn parse_encoder_config(json: &Value) -> Result<EncoderConfig> {
    let audio = json.get("audio_config").ok_or_else(|| {
        QwenAsrError::InvalidArgument("config.json missing `audio_config`".into())
    })?;

    Ok(EncoderConfig {
        num_mel_bins: get_usize(audio, "num_mel_bins", 128),
        hidden_size: get_usize(audio, "hidden_size", 1280),
        num_attention_heads: get_usize(audio, "num_attention_heads", 20),
        num_hidden_layers: get_usize(audio, "num_hidden_layers", 32),
        intermediate_size: get_usize(audio, "intermediate_size", 5120),
        conv_stride: get_usize(audio, "conv_stride", 2),
        max_source_positions: get_usize(audio, "max_source_positions", 1500),
        rope_theta: get_f32(audio, "rope_theta", 10_000.0),
        rms_norm_eps: get_f32(audio, "rms_norm_eps", 1e-5),
        use_rotary: get_bool(audio, "use_rotary", true),
    })
}

fn parse_decoder_config(json: &Value) -> Result<DecoderConfig> {
    let text = json.get("text_config").ok_or_else(|| {
        QwenAsrError::InvalidArgument("config.json missing `text_config`".into())
    })?;

    let num_attention_heads = get_usize(text, "num_attention_heads", 32);
    let hidden_size = get_usize(text, "hidden_size", 3072);
    let head_dim = get_usize(text, "head_dim", hidden_size / num_attention_heads.max(1));

    Ok(DecoderConfig {
        vocab_size: get_usize(text, "vocab_size", 151936),
        hidden_size,
        intermediate_size: get_usize(text, "intermediate_size", 8192),
        num_hidden_layers: get_usize(text, "num_hidden_layers", 30),
        num_attention_heads,
        num_key_value_heads: get_usize(text, "num_key_value_heads", 8),
        head_dim,
        rms_norm_eps: get_f32(text, "rms_norm_eps", 1e-5),
        rope_theta: get_f32(text, "rope_theta", 1_000_000.0),
        max_position_embeddings: get_usize(text, "max_position_embeddings", 32768),
    })
}

impl ModelConfig {
    pub fn from_json(json: &Value) -> Result<Self> {
        let encoder = parse_encoder_config(json)?;
        let decoder = parse_decoder_config(json)?;
        let max_context_length = decoder.max_position_embeddings;
        let max_new_tokens = get_usize(json, "max_new_tokens", max_context_length);

        Ok(ModelConfig {
            sample_rate: 16_000,
            hop_length: 160,
            window_length: 400,
            encoder,
            decoder,
            max_context_length,
            max_new_tokens,
        })
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| QwenAsrError::FileNotFound(path.display().to_string()))?;
        let json: Value = serde_json::from_str(&text)
            .map_err(|e| QwenAsrError::HeaderParseError(format!("config.json: {e}")))?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let json: Value = serde_json::json!({
            "audio_config": {},
            "text_config": {},
        });
        let cfg = ModelConfig::from_json(&json).unwrap();
        assert_eq!(cfg.encoder.num_mel_bins, 128);
        assert_eq!(cfg.decoder.num_key_value_heads, 8);
        assert_eq!(cfg.decoder.groups(), 8);
        assert_eq!(cfg.decoder.queries_per_group(), 4);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let json: Value = serde_json::json!({
            "audio_config": {"num_mel_bins": 80, "hidden_size": 512},
            "text_config": {"num_attention_heads": 16, "num_key_value_heads": 4, "hidden_size": 1024},
        });
        let cfg = ModelConfig::from_json(&json).unwrap();
        assert_eq!(cfg.encoder.num_mel_bins, 80);
        assert_eq!(cfg.decoder.head_dim, 1024 / 16);
        assert_eq!(cfg.decoder.queries_per_group(), 4);
    }
}
