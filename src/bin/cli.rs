use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::info;

use qwen_asr::Context;

#[derive(Parser)]
#[command(name = "qwen-asr-cli")]
#[command(about = "Offline CPU transcription of a WAV file with a Qwen3-ASR checkpoint")]
struct Cli {
    /// Directory containing config.json, model.safetensors, and vocab.json.
    #[arg(long)]
    model: PathBuf,

    /// Path to a mono 16 kHz WAV file to transcribe.
    #[arg(long)]
    wav: PathBuf,

    /// Force a specific output language (must be one of `--list-languages`).
    #[arg(long)]
    language: Option<String>,

    /// Override the system prompt prepended to the transcription request.
    #[arg(long)]
    prompt: Option<String>,

    /// Worker thread count for kernel parallelism (0 = number of CPUs).
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Print the comma-separated list of supported languages and exit.
    #[arg(long)]
    list_languages: bool,

    /// Enable debug-level logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cli.verbose { "debug".into() } else { "info".into() }
        }))
        .init();

    qwen_asr::init(qwen_asr::InitOptions {
        threads: cli.threads,
        verbose: cli.verbose,
    });

    let mut ctx = Context::load(&cli.model).context("failed to load model")?;
    info!(backend = ?ctx.backend_kind(), "engine ready");

    if cli.list_languages {
        println!("{}", ctx.supported_languages_csv());
        return Ok(());
    }

    if let Some(lang) = &cli.language {
        ctx.set_force_language(Some(lang))
            .context("unrecognized --language")?;
    }
    ctx.set_prompt(cli.prompt.as_deref());

    let mut reader = hound::WavReader::open(&cli.wav).context("failed to open --wav")?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != 16_000 {
        anyhow::bail!(
            "expected mono 16 kHz WAV, got {} channel(s) at {} Hz",
            spec.channels,
            spec.sample_rate
        );
    }
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<Result<_, _>>()?,
    };

    let result = ctx.transcribe(&samples).context("transcription failed")?;
    println!("{}", result.text);
    info!(
        audio_ms = result.perf.audio_ms,
        encode_ms = result.perf.encode_ms,
        decode_ms = result.perf.decode_ms,
        total_ms = result.perf.total_ms,
        text_tokens = result.perf.text_tokens,
        "done"
    );

    Ok(())
}
