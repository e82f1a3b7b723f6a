//! BLAS-accelerated GEMM, compiled in only behind the `blas` Cargo
//! feature (with `accelerate` selecting Apple's Accelerate framework on
//! Darwin and `openblas` selecting OpenBLAS elsewhere, per spec.md's
//! "Accelerate on Darwin, OpenBLAS elsewhere"). Every other kernel
//! delegates to the scalar backend — BLAS only ever covers GEMM.

use super::scalar::ScalarBackend;
use super::KernelBackend;

pub struct BlasBackend {
    scalar: ScalarBackend,
}

pub fn available() -> bool {
    cfg!(feature = "blas")
}

#[cfg(feature = "blas")]
mod ffi {
    use cblas_sys::{cblas_sgemm, CBLAS_LAYOUT, CBLAS_TRANSPOSE};

    pub fn sgemm(
        a: &[f32],
        b: &[f32],
        c: &mut [f32],
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        beta: f32,
        trans_b: bool,
    ) {
        // a is always [m,k] row-major, no transpose. b is [k,n] row-major
        // when not transposed, or [n,k] row-major (gemm_at's case) when
        // transposed — ldb is the number of columns as actually stored.
        let (ldb, transb) = if trans_b {
            (k as i32, CBLAS_TRANSPOSE::CblasTrans)
        } else {
            (n as i32, CBLAS_TRANSPOSE::CblasNoTrans)
        };
        unsafe {
            cblas_sgemm(
                CBLAS_LAYOUT::CblasRowMajor,
                CBLAS_TRANSPOSE::CblasNoTrans,
                transb,
                m as i32,
                n as i32,
                k as i32,
                alpha,
                a.as_ptr(),
                k as i32,
                b.as_ptr(),
                ldb,
                beta,
                c.as_mut_ptr(),
                n as i32,
            );
        }
    }
}

impl BlasBackend {
    pub fn new() -> Self {
        Self {
            scalar: ScalarBackend,
        }
    }
}

impl KernelBackend for BlasBackend {
    fn gemm(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize, alpha: f32, beta: f32) {
        #[cfg(feature = "blas")]
        {
            ffi::sgemm(a, b, c, m, n, k, alpha, beta, false);
            return;
        }
        #[cfg(not(feature = "blas"))]
        self.scalar.gemm(a, b, c, m, n, k, alpha, beta);
    }

    fn gemm_at(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize, alpha: f32, beta: f32) {
        // b is stored as [n, k]; ask BLAS to transpose it rather than
        // materializing the transpose ourselves.
        #[cfg(feature = "blas")]
        {
            ffi::sgemm(a, b, c, m, n, k, alpha, beta, true);
            return;
        }
        #[cfg(not(feature = "blas"))]
        self.scalar.gemm_at(a, b, c, m, n, k, alpha, beta);
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
