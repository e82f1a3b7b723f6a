//! Generic scalar fallback, available on every target. Used directly when
//! no SIMD ISA is detected and no BLAS was compiled in, and as the
//! reference implementation the SIMD/BLAS backends are checked against in
//! tests (spec.md's "GEMM backend equivalence" property).

use rayon::prelude::*;

use super::KernelBackend;

pub struct ScalarBackend;

fn gemm_row(a_row: &[f32], b: &[f32], c_row: &mut [f32], n: usize, k: usize, alpha: f32, beta: f32) {
    for j in 0..n {
        let mut acc = 0.0f32;
        for p in 0..k {
            acc += a_row[p] * b[p * n + j];
        }
        c_row[j] = alpha * acc + beta * c_row[j];
    }
}

impl KernelBackend for ScalarBackend {
    fn gemm(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize, alpha: f32, beta: f32) {
        c.par_chunks_mut(n)
            .enumerate()
            .take(m)
            .for_each(|(i, c_row)| {
                let a_row = &a[i * k..(i + 1) * k];
                gemm_row(a_row, b, c_row, n, k, alpha, beta);
            });
    }

    fn gemm_at(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize, alpha: f32, beta: f32) {
        // a row i is a[i*k..(i+1)*k]; b row j is b[j*k..(j+1)*k]; both
        // contiguous, so this is a plain row-against-row dot product.
        c.par_chunks_mut(n)
            .enumerate()
            .take(m)
            .for_each(|(i, c_row)| {
                let a_row = &a[i * k..(i + 1) * k];
                for j in 0..n {
                    let b_row = &b[j * k..(j + 1) * k];
                    let acc: f32 = a_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
                    c_row[j] = alpha * acc + beta * c_row[j];
                }
            });
    }

    fn rmsnorm(&self, x: &mut [f32], gain: &[f32], eps: f32) {
        let dim = gain.len();
        for row in x.chunks_mut(dim) {
            let ms: f32 = row.iter().map(|v| v * v).sum::<f32>() / dim as f32;
            let scale = 1.0 / (ms + eps).sqrt();
            for (v, g) in row.iter_mut().zip(gain) {
                *v = *v * scale * g;
            }
        }
    }

    fn layernorm(&self, x: &mut [f32], gain: &[f32], bias: &[f32], eps: f32) {
        let dim = gain.len();
        for row in x.chunks_mut(dim) {
            let mean: f32 = row.iter().sum::<f32>() / dim as f32;
            let var: f32 = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
            let inv_std = 1.0 / (var + eps).sqrt();
            for ((v, g), b) in row.iter_mut().zip(gain).zip(bias) {
                *v = (*v - mean) * inv_std * g + b;
            }
        }
    }

    fn softmax_rowwise(&self, x: &mut [f32], n_rows: usize, n_cols: usize, mask: Option<&[f32]>) {
        x.par_chunks_mut(n_cols).take(n_rows).enumerate().for_each(|(r, row)| {
            if let Some(m) = mask {
                let mrow = &m[r * n_cols..(r + 1) * n_cols];
                for (v, mv) in row.iter_mut().zip(mrow) {
                    *v += *mv;
                }
            }
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            if sum > 0.0 {
                for v in row.iter_mut() {
                    *v /= sum;
                }
            }
        });
    }

    fn silu(&self, x: &mut [f32]) {
        for v in x.iter_mut() {
            *v *= 1.0 / (1.0 + (-*v).exp());
        }
    }

    fn gelu(&self, x: &mut [f32]) {
        const C: f32 = 0.797_884_6; // sqrt(2/pi)
        for v in x.iter_mut() {
            let t = *v;
            *v = 0.5 * t * (1.0 + (C * (t + 0.044715 * t * t * t)).tanh());
        }
    }

    fn rope_apply(&self, q: &mut [f32], k: &mut [f32], positions: &[usize], head_dim: usize, base: f32) {
        let half = head_dim / 2;
        for (row_idx, &pos) in positions.iter().enumerate() {
            let q_row = &mut q[row_idx * head_dim..(row_idx + 1) * head_dim];
            rotate_row(q_row, pos, half, base);
            let k_row = &mut k[row_idx * head_dim..(row_idx + 1) * head_dim];
            rotate_row(k_row, pos, half, base);
        }
    }

    fn embed_lookup(&self, table: &[f32], dim: usize, ids: &[u32], out: &mut [f32]) {
        for (i, &id) in ids.iter().enumerate() {
            let src = &table[id as usize * dim..(id as usize + 1) * dim];
            out[i * dim..(i + 1) * dim].copy_from_slice(src);
        }
    }

    fn argmax_row(&self, x: &[f32]) -> usize {
        let mut best_i = 0usize;
        let mut best_v = f32::NEG_INFINITY;
        for (i, &v) in x.iter().enumerate() {
            if v > best_v {
                best_v = v;
                best_i = i;
            }
        }
        best_i
    }

    fn add_inplace(&self, x: &mut [f32], y: &[f32]) {
        for (a, b) in x.iter_mut().zip(y) {
            *a += b;
        }
    }
}

fn rotate_row(row: &mut [f32], pos: usize, half: usize, base: f32) {
    for i in 0..half {
        let theta = (pos as f32) * base.powf(-2.0 * (i as f32) / (2.0 * half as f32));
        let (sin, cos) = theta.sin_cos();
        let x0 = row[i];
        let x1 = row[i + half];
        row[i] = x0 * cos - x1 * sin;
        row[i + half] = x0 * sin + x1 * cos;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemm_identity() {
        let backend = ScalarBackend;
        let a = [1.0, 2.0, 3.0, 4.0]; // 2x2
        let b = [1.0, 0.0, 0.0, 1.0]; // identity
        let mut c = [0.0; 4];
        backend.gemm(&a, &b, &mut c, 2, 2, 2, 1.0, 0.0);
        assert_eq!(c, a);
    }

    #[test]
    fn gemm_at_matches_row_dot_products() {
        let backend = ScalarBackend;
        // a: 2x3, b: 2x3 (both rows are the contracted dim), c: 2x2 = a @ b^T.
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let mut c = [0.0; 4];
        backend.gemm_at(&a, &b, &mut c, 2, 2, 3, 1.0, 0.0);
        assert_eq!(c, [1.0, 2.0, 4.0, 5.0]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let backend = ScalarBackend;
        let mut x = vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0];
        backend.softmax_rowwise(&mut x, 2, 3, None);
        for row in x.chunks(3) {
            let sum: f32 = row.iter().sum();
            approx::assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn softmax_is_shift_invariant() {
        let backend = ScalarBackend;
        let base = vec![1.0f32, 2.0, 3.0, 4.0];
        let shifted: Vec<f32> = base.iter().map(|v| v + 1000.0).collect();

        let mut a = base.clone();
        backend.softmax_rowwise(&mut a, 1, 4, None);
        let mut b = shifted;
        backend.softmax_rowwise(&mut b, 1, 4, None);

        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn rmsnorm_unit_gain_matches_formula() {
        let backend = ScalarBackend;
        let mut x = vec![3.0f32, 4.0];
        let gain = [1.0, 1.0];
        backend.rmsnorm(&mut x, &gain, 0.0);
        let ms = (9.0f32 + 16.0) / 2.0;
        let scale = 1.0 / ms.sqrt();
        approx::assert_abs_diff_eq!(x[0], 3.0 * scale, epsilon = 1e-5);
        approx::assert_abs_diff_eq!(x[1], 4.0 * scale, epsilon = 1e-5);
    }

    #[test]
    fn rope_is_an_involution_at_negated_position() {
        let backend = ScalarBackend;
        let head_dim = 4;
        let original = vec![1.0f32, 2.0, 3.0, 4.0];

        let mut q = original.clone();
        let mut k = vec![0.0f32; head_dim];
        backend.rope_apply(&mut q, &mut k, &[5], head_dim, 10000.0);

        // Rotating back by the same angle in the opposite direction
        // (equivalent to applying rope at position -5) restores the input.
        let half = head_dim / 2;
        for i in 0..half {
            let theta = 5.0f32 * 10000f32.powf(-2.0 * (i as f32) / (head_dim as f32));
            let (sin, cos) = theta.sin_cos();
            let x0 = q[i];
            let x1 = q[i + half];
            let restored0 = x0 * cos + x1 * sin;
            let restored1 = -x0 * sin + x1 * cos;
            approx::assert_abs_diff_eq!(restored0, original[i], epsilon = 1e-4);
            approx::assert_abs_diff_eq!(restored1, original[i + half], epsilon = 1e-4);
        }
    }

    #[test]
    fn argmax_picks_largest() {
        let backend = ScalarBackend;
        assert_eq!(backend.argmax_row(&[0.1, 5.0, -2.0, 3.9]), 1);
    }
}
