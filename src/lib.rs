//! From-scratch CPU inference engine for Qwen3-ASR-family encoder-decoder
//! speech models: safetensors weight loading, a byte-level BPE tokenizer,
//! a log-mel audio front-end, and hand-written transformer encoder/decoder
//! kernels with a runtime-selected scalar/SIMD/BLAS backend. No GPU and no
//! external deep-learning runtime anywhere in the call graph.

pub mod audio;
pub mod config;
pub mod context;
pub mod error;
pub mod kernels;
pub mod model;
pub mod safetensors_loader;
pub mod tensor;
pub mod threadpool;
pub mod tokenizer;

pub use context::{Context, PerfCounters, TranscriptResult};
pub use error::{QwenAsrError, Result};

use std::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Process-wide init options: thread pool size and verbosity, both of
/// which are process, not context, properties (spec's Design Notes on
/// global state). Call once before the first `Context::load`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Worker thread count for kernel parallelism (0 = number of CPUs).
    pub threads: usize,
    /// When set, every `Context::transcribe` call writes a one-line perf
    /// summary to stderr independent of the `tracing` subscriber.
    pub verbose: bool,
}

/// Configures the process-wide thread pool and verbosity. Only the first
/// call takes effect for the thread pool (rayon's global pool can't be
/// rebuilt); later calls still update verbosity.
pub fn init(opts: InitOptions) {
    threadpool::set_threads(opts.threads);
    VERBOSE.store(opts.verbose, Ordering::Relaxed);
}

pub(crate) fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}
