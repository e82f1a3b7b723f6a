//! Process-wide rayon pool sizing.
//!
//! Every `Context` shares the same global rayon pool rather than owning
//! one; `set_threads` rebuilds the global pool, so calling it from one
//! context affects every other context's kernel parallelism too, matching
//! the "thread count is a process, not a context, property" note in
//! spec.md's Design Notes.

use std::sync::Once;

use tracing::warn;

static INIT: Once = Once::new();

/// Installs a rayon global pool sized to `n` threads (or the number of
/// logical CPUs if `n == 0`). Only the first call in the process actually
/// builds the pool; later calls are logged and ignored, since rayon does
/// not support rebuilding its global pool once installed.
pub fn set_threads(n: usize) {
    let mut built = false;
    INIT.call_once(|| {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if n > 0 {
            builder = builder.num_threads(n);
        }
        if let Err(e) = builder.build_global() {
            warn!(error = %e, "failed to install global rayon pool, using default");
        }
        built = true;
    });
    if !built {
        warn!(requested = n, "thread count already fixed for this process; ignoring");
    }
}

pub fn current_threads() -> usize {
    rayon::current_num_threads()
}
