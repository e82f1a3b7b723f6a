//! Cross-cutting integration tests. The end-to-end scenario is gated on
//! `QWEN_ASR_TEST_MODEL` pointing at a real checkpoint directory (config.json
//! + model.safetensors + vocab.json) since this crate carries no model
//! weights of its own.

use std::path::PathBuf;

use qwen_asr::Context;

fn test_model_dir() -> Option<PathBuf> {
    std::env::var_os("QWEN_ASR_TEST_MODEL").map(PathBuf::from)
}

#[test]
#[ignore = "requires a real checkpoint directory set in QWEN_ASR_TEST_MODEL"]
fn zero_samples_transcribe_without_panicking() {
    let Some(dir) = test_model_dir() else {
        return;
    };
    let mut ctx = Context::load(&dir).expect("model should load");
    let samples = vec![0.0f32; 16_000 * 5];
    let result = ctx.transcribe(&samples).expect("transcribe should succeed on silence");
    assert!(result.perf.total_ms > 0.0);
}

#[test]
#[ignore = "requires a real checkpoint directory set in QWEN_ASR_TEST_MODEL"]
fn kv_reset_is_deterministic_across_calls() {
    let Some(dir) = test_model_dir() else {
        return;
    };
    let mut ctx = Context::load(&dir).expect("model should load");
    let samples: Vec<f32> = (0..16_000).map(|i| (i as f32 * 0.001).sin() * 0.1).collect();

    let first = ctx.transcribe(&samples).unwrap();
    let second = ctx.transcribe(&samples).unwrap();
    assert_eq!(first.text, second.text);
}

#[test]
#[ignore = "requires a real checkpoint directory set in QWEN_ASR_TEST_MODEL"]
fn unsupported_language_leaves_prior_setting_unchanged() {
    let Some(dir) = test_model_dir() else {
        return;
    };
    let mut ctx = Context::load(&dir).expect("model should load");
    ctx.set_force_language(Some("English")).expect("English should be supported");
    let err = ctx.set_force_language(Some("Klingon"));
    assert!(err.is_err());
}

#[test]
fn missing_model_dir_is_file_not_found() {
    let err = Context::load(&PathBuf::from("/nonexistent/qwen-asr-model")).unwrap_err();
    assert!(matches!(err, qwen_asr::QwenAsrError::FileNotFound(_)));
}
