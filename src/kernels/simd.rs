//! Hand-vectorized GEMM inner loop, one variant per ISA family (AVX2+FMA
//! on x86_64, NEON on aarch64). Every other kernel delegates to the scalar
//! backend: LLVM already auto-vectorizes those straight-line loops well,
//! and the dot product inside GEMM is the one place a hand-written
//! intrinsic loop meaningfully beats it.

use super::scalar::ScalarBackend;
use super::KernelBackend;

pub struct SimdBackend {
    scalar: ScalarBackend,
}

impl SimdBackend {
    pub fn new() -> Self {
        Self {
            scalar: ScalarBackend,
        }
    }
}

pub fn available() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return true;
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        return true; // NEON is baseline on aarch64.
    }
    #[allow(unreachable_code)]
    false
}

fn dot_contig(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { dot_contig_avx2(a, b) };
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { dot_contig_neon(a, b) };
    }
    #[allow(unreachable_code)]
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_contig_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let k = a.len();
    let mut acc = _mm256_setzero_ps();
    let mut p = 0usize;
    while p + 8 <= k {
        let av = _mm256_loadu_ps(a[p..].as_ptr());
        let bv = _mm256_loadu_ps(b[p..].as_ptr());
        acc = _mm256_fmadd_ps(av, bv, acc);
        p += 8;
    }
    let mut buf = [0.0f32; 8];
    _mm256_storeu_ps(buf.as_mut_ptr(), acc);
    let mut total: f32 = buf.iter().sum();
    while p < k {
        total += a[p] * b[p];
        p += 1;
    }
    total
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn dot_contig_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let k = a.len();
    let mut acc = vdupq_n_f32(0.0);
    let mut p = 0usize;
    while p + 4 <= k {
        let av = vld1q_f32(a[p..].as_ptr());
        let bv = vld1q_f32(b[p..].as_ptr());
        acc = vfmaq_f32(acc, av, bv);
        p += 4;
    }
    let mut buf = [0.0f32; 4];
    vst1q_f32(buf.as_mut_ptr(), acc);
    let mut total: f32 = buf.iter().sum();
    while p < k {
        total += a[p] * b[p];
        p += 1;
    }
    total
}

fn dot(a: &[f32], b_col: &[f32], n: usize, k: usize) -> f32 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { dot_avx2(a, b_col, n, k) };
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { dot_neon(a, b_col, n, k) };
    }
    #[allow(unreachable_code)]
    {
        let mut acc = 0.0f32;
        for p in 0..k {
            acc += a[p] * b_col[p * n];
        }
        acc
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_avx2(a: &[f32], b_col: &[f32], n: usize, k: usize) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_ps();
    let mut p = 0usize;
    while p + 8 <= k {
        let av = _mm256_loadu_ps(a[p..].as_ptr());
        // b is row-major [k, n]; column `n`-stride gather for 8 lanes.
        let mut tmp = [0.0f32; 8];
        for i in 0..8 {
            tmp[i] = b_col[(p + i) * n];
        }
        let bv = _mm256_loadu_ps(tmp.as_ptr());
        acc = _mm256_fmadd_ps(av, bv, acc);
        p += 8;
    }
    let mut buf = [0.0f32; 8];
    _mm256_storeu_ps(buf.as_mut_ptr(), acc);
    let mut total: f32 = buf.iter().sum();
    while p < k {
        total += a[p] * b_col[p * n];
        p += 1;
    }
    total
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn dot_neon(a: &[f32], b_col: &[f32], n: usize, k: usize) -> f32 {
    use std::arch::aarch64::*;

    let mut acc = vdupq_n_f32(0.0);
    let mut p = 0usize;
    while p + 4 <= k {
        let av = vld1q_f32(a[p..].as_ptr());
        let mut tmp = [0.0f32; 4];
        for i in 0..4 {
            tmp[i] = b_col[(p + i) * n];
        }
        let bv = vld1q_f32(tmp.as_ptr());
        acc = vfmaq_f32(acc, av, bv);
        p += 4;
    }
    let mut buf = [0.0f32; 4];
    vst1q_f32(buf.as_mut_ptr(), acc);
    let mut total: f32 = buf.iter().sum();
    while p < k {
        total += a[p] * b_col[p * n];
        p += 1;
    }
    total
}

impl KernelBackend for SimdBackend {
    fn gemm(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize, alpha: f32, beta: f32) {
        use rayon::prelude::*;
        c.par_chunks_mut(n).enumerate().take(m).for_each(|(i, c_row)| {
            let a_row = &a[i * k..(i + 1) * k];
            for j in 0..n {
                let acc = dot(a_row, &b[j..], n, k);
                c_row[j] = alpha * acc + beta * c_row[j];
            }
        });
    }

    fn gemm_at(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize, alpha: f32, beta: f32) {
        // a row i and b row j are both contiguous length-k slices.
        use rayon::prelude::*;
        c.par_chunks_mut(n).enumerate().take(m).for_each(|(i, c_row)| {
            let a_row = &a[i * k..(i + 1) * k];
            for j in 0..n {
                let b_row = &b[j * k..(j + 1) * k];
                let acc = dot_contig(a_row, b_row);
                c_row[j] = alpha * acc + beta * c_row[j];
            }
        });
    }

    fn rmsnorm(&self, x: &mut [f32], gain: &[f32], eps: f32) {
        self.scalar.rmsnorm(x, gain, eps);
    }

    fn layernorm(&self, x: &mut [f32], gain: &[f32], bias: &[f32], eps: f32) {
        self.scalar.layernorm(x, gain, bias, eps);
    }

    fn softmax_rowwise(&self, x: &mut [f32], n_rows: usize, n_cols: usize, mask: Option<&[f32]>) {
        self.scalar.softmax_rowwise(x, n_rows, n_cols, mask);
    }

    fn silu(&self, x: &mut [f32]) {
        self.scalar.silu(x);
    }

    fn gelu(&self, x: &mut [f32]) {
        self.scalar.gelu(x);
    }

    fn rope_apply(&self, q: &mut [f32], k: &mut [f32], positions: &[usize], head_dim: usize, base: f32) {
        self.scalar.rope_apply(q, k, positions, head_dim, base);
    }

    fn embed_lookup(&self, table: &[f32], dim: usize, ids: &[u32], out: &mut [f32]) {
        self.scalar.embed_lookup(table, dim, ids, out);
    }

    fn argmax_row(&self, x: &[f32]) -> usize {
        self.scalar.argmax_row(x)
    }

    fn add_inplace(&self, x: &mut [f32], y: &[f32]) {
        self.scalar.add_inplace(x, y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simd_gemm_agrees_with_scalar() {
        if !available() {
            return;
        }
        let simd = SimdBackend::new();
        let scalar = ScalarBackend;

        let m = 5;
        let n = 7;
        let k = 11;
        let a: Vec<f32> = (0..m * k).map(|i| (i % 7) as f32 * 0.1).collect();
        let b: Vec<f32> = (0..k * n).map(|i| (i % 5) as f32 * 0.2 - 0.3).collect();

        let mut c_simd = vec![0.0; m * n];
        let mut c_scalar = vec![0.0; m * n];
        simd.gemm(&a, &b, &mut c_simd, m, n, k, 1.0, 0.0);
        scalar.gemm(&a, &b, &mut c_scalar, m, n, k, 1.0, 0.0);

        for (&x, &y) in c_simd.iter().zip(c_scalar.iter()) {
            approx::assert_abs_diff_eq!(x, y, epsilon = 1e-4 * x.abs().max(1.0));
        }
    }

    #[test]
    fn simd_gemm_at_agrees_with_scalar() {
        if !available() {
            return;
        }
        let simd = SimdBackend::new();
        let scalar = ScalarBackend;

        let m = 5;
        let n = 7;
        let k = 11;
        let a: Vec<f32> = (0..m * k).map(|i| (i % 7) as f32 * 0.1).collect();
        let b: Vec<f32> = (0..n * k).map(|i| (i % 5) as f32 * 0.2 - 0.3).collect();

        let mut c_simd = vec![0.0; m * n];
        let mut c_scalar = vec![0.0; m * n];
        simd.gemm_at(&a, &b, &mut c_simd, m, n, k, 1.0, 0.0);
        scalar.gemm_at(&a, &b, &mut c_scalar, m, n, k, 1.0, 0.0);

        for (&x, &y) in c_simd.iter().zip(c_scalar.iter()) {
            approx::assert_abs_diff_eq!(x, y, epsilon = 1e-4 * x.abs().max(1.0));
        }
    }
}
