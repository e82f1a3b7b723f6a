use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use qwen_asr::Context;

#[derive(Parser)]
#[command(name = "qwen-asr-server")]
#[command(about = "HTTP transcription server backed by a Qwen3-ASR checkpoint")]
struct Cli {
    /// Directory containing config.json, model.safetensors, and vocab.json.
    #[arg(long)]
    model: PathBuf,

    /// Address to bind the HTTP listener to.
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: String,

    /// Worker thread count for kernel parallelism (0 = number of CPUs).
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Write a one-line perf summary to stderr for every request.
    #[arg(long)]
    verbose: bool,
}

#[derive(serde::Deserialize, Default)]
struct TranscribeParams {
    language: Option<String>,
    prompt: Option<String>,
}

struct AppState {
    ctx: Mutex<Context>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: String,
    languages: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ctx = state.ctx.lock().await;
    Json(HealthResponse {
        status: "ok",
        backend: format!("{:?}", ctx.backend_kind()),
        languages: ctx.supported_languages_csv(),
    })
}

/// Accepts a single `audio` field containing mono 16 kHz WAV bytes and
/// returns the transcript as JSON. One request at a time per process: the
/// KV cache and scratch buffers are shared, exclusive state behind the
/// mutex, not a request-scoped allocation.
async fn transcribe(State(state): State<Arc<AppState>>, Query(params): Query<TranscribeParams>, mut multipart: Multipart) -> impl IntoResponse {
    let mut wav_bytes: Option<Vec<u8>> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("audio") {
            wav_bytes = field.bytes().await.ok().map(|b| b.to_vec());
        }
    }

    let Some(bytes) = wav_bytes else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "missing `audio` multipart field".to_string(),
            }),
        )
            .into_response();
    };

    let samples = match decode_wav(&bytes) {
        Ok(s) => s,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: e.to_string() })).into_response();
        }
    };

    let mut ctx = state.ctx.lock().await;
    if let Some(lang) = &params.language {
        if let Err(e) = ctx.set_force_language(Some(lang)) {
            return (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: e.to_string() })).into_response();
        }
    }
    ctx.set_prompt(params.prompt.as_deref());

    match ctx.transcribe(&samples) {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            error!(error = %e, "transcription failed");
            (StatusCode::UNPROCESSABLE_ENTITY, Json(ErrorResponse { error: e.to_string() })).into_response()
        }
    }
}

fn decode_wav(bytes: &[u8]) -> anyhow::Result<Vec<f32>> {
    let cursor = std::io::Cursor::new(bytes);
    let mut reader = hound::WavReader::new(cursor).context("invalid WAV data")?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != 16_000 {
        anyhow::bail!(
            "expected mono 16 kHz WAV, got {} channel(s) at {} Hz",
            spec.channels,
            spec.sample_rate
        );
    }
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<Result<_, _>>()?,
    };
    Ok(samples)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    qwen_asr::init(qwen_asr::InitOptions {
        threads: cli.threads,
        verbose: cli.verbose,
    });

    let ctx = Context::load(&cli.model).context("failed to load model")?;
    let state = Arc::new(AppState { ctx: Mutex::new(ctx) });

    let app = Router::new()
        .route("/health", get(health))
        .route("/transcribe", post(transcribe))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    info!(addr = %cli.bind, "qwen-asr-server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
