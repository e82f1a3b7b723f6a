//! Numerical primitives over flat `f32` buffers, plus runtime backend
//! selection.
//!
//! Kernels are pure: no global mutation beyond the process-wide thread
//! pool they partition work across. The backend (scalar, SIMD, or BLAS) is
//! chosen once at context init by CPU-feature probing and never changes
//! for the lifetime of that context, per spec.md's Design Notes — this
//! replaces the original's preprocessor-gated translation units with a
//! capability trait object picked once.

mod blas;
mod scalar;
mod simd;

use std::sync::Arc;

/// Capability interface every backend implements. All methods operate on
/// caller-owned buffers; none allocate internally beyond what's documented.
pub trait KernelBackend: Send + Sync {
    /// `C[m,n] = alpha * A[m,k] @ B[k,n] + beta * C[m,n]`, row-major.
    fn gemm(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize, alpha: f32, beta: f32);

    /// `C[m,n] = alpha * A[m,k] @ B[n,k]^T + beta * C[m,n]`. Both operands
    /// are row-major with the contracted dimension `k` trailing, so no
    /// transpose is ever materialized: used for `Q @ K^T` (`Q:[t,d]`,
    /// `K` cache `:[pos,d]`) and for linear layers (activations `:[t,in]`,
    /// weight `:[out,in]`).
    fn gemm_at(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize, alpha: f32, beta: f32);

    /// In-place RMSNorm: `x[i] <- x[i] / sqrt(mean(x^2) + eps) * gain[i]`,
    /// applied independently per row of length `gain.len()`.
    fn rmsnorm(&self, x: &mut [f32], gain: &[f32], eps: f32);

    /// In-place LayerNorm with mean/variance, affine `gain`/`bias`.
    fn layernorm(&self, x: &mut [f32], gain: &[f32], bias: &[f32], eps: f32);

    /// Numerically stable (subtract-max) softmax, one row at a time.
    /// `mask`, if present, is added to each row before the max-subtract
    /// (use `f32::NEG_INFINITY` for masked-out positions).
    fn softmax_rowwise(&self, x: &mut [f32], n_rows: usize, n_cols: usize, mask: Option<&[f32]>);

    fn silu(&self, x: &mut [f32]);
    fn gelu(&self, x: &mut [f32]);

    /// Applies rotary position embedding in place to `head_dim`-wide rows
    /// of `q`/`k`, one row per entry in `positions`, rotating each `row[i]`
    /// against `row[i + head_dim/2]` ("rotate-half") by
    /// `theta_i = base^(-2i/head_dim)`.
    fn rope_apply(&self, q: &mut [f32], k: &mut [f32], positions: &[usize], head_dim: usize, base: f32);

    fn embed_lookup(&self, table: &[f32], dim: usize, ids: &[u32], out: &mut [f32]);

    fn argmax_row(&self, x: &[f32]) -> usize;

    fn add_inplace(&self, x: &mut [f32], y: &[f32]);
}

/// Runtime-detected ISA family, probed once at process init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Scalar,
    Simd,
    Blas,
}

/// Picks the best backend available at runtime: BLAS if the `blas` Cargo
/// feature was compiled in, otherwise a SIMD backend if the running CPU
/// has the matching ISA extension, otherwise the scalar fallback.
pub fn select_backend() -> (Arc<dyn KernelBackend>, BackendKind) {
    if blas::available() {
        return (Arc::new(blas::BlasBackend::new()), BackendKind::Blas);
    }
    if simd::available() {
        return (Arc::new(simd::SimdBackend::new()), BackendKind::Simd);
    }
    (Arc::new(scalar::ScalarBackend), BackendKind::Scalar)
}

/// Dequantizes a block of integer-quantized values into `out`, using a
/// single scale and optional zero-point (the one quantized layout spec.md
/// names explicitly). Used by the safetensors loader before any `Context`
/// — and thus any selected backend — exists, so it's a plain function
/// rather than a trait method.
pub fn dequantize(block: &[i32], scale: f32, zero_point: f32, out: &mut [f32]) {
    debug_assert_eq!(block.len(), out.len());
    for (o, &q) in out.iter_mut().zip(block) {
        *o = (q as f32 - zero_point) * scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequantize_applies_scale_and_zero_point() {
        let block = [0, 1, 2, 3];
        let mut out = [0.0f32; 4];
        dequantize(&block, 0.5, 1.0, &mut out);
        assert_eq!(out, [-0.5, 0.0, 0.5, 1.0]);
    }
}
