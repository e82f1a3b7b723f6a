//! Audio encoder: a two-layer strided convolutional stem that downsamples
//! the mel spectrogram by the configured `conv_stride`, followed by a
//! stack of pre-norm transformer blocks with full (non-causal)
//! self-attention and a SwiGLU-gated MLP. Runs once per utterance; its
//! output feeds every decoder cross-attention layer.

use std::cell::RefCell;
use std::sync::Arc;

use crate::config::EncoderConfig;
use crate::error::Result;
use crate::kernels::KernelBackend;
use crate::model::{gather_head_into, linear_into, scatter_head};
use crate::tensor::{ScratchBuffer, WeightArena};

/// 1D convolution over the time axis. `x` is channel-major `[in_ch,
/// in_len]`, `w` is `[out_ch, in_ch, kernel]`, padding is symmetric and
/// implicit zero. Returns channel-major `[out_ch, out_len]`.
fn conv1d(x: &[f32], in_ch: usize, in_len: usize, w: &[f32], b: &[f32], out_ch: usize, kernel: usize, stride: usize, pad: usize) -> (Vec<f32>, usize) {
    let out_len = (in_len + 2 * pad - kernel) / stride + 1;
    let mut y = vec![0.0f32; out_ch * out_len];
    for oc in 0..out_ch {
        for (t, slot) in y[oc * out_len..(oc + 1) * out_len].iter_mut().enumerate() {
            let mut acc = b[oc];
            let start = (t * stride) as isize - pad as isize;
            for ic in 0..in_ch {
                let x_row = &x[ic * in_len..(ic + 1) * in_len];
                let w_row = &w[(oc * in_ch + ic) * kernel..(oc * in_ch + ic + 1) * kernel];
                for (kk, &wk) in w_row.iter().enumerate() {
                    let idx = start + kk as isize;
                    if idx >= 0 && (idx as usize) < in_len {
                        acc += wk * x_row[idx as usize];
                    }
                }
            }
            *slot = acc;
        }
    }
    (y, out_len)
}

fn gelu(x: &mut [f32]) {
    const C: f32 = 0.797_884_6;
    for v in x.iter_mut() {
        let t = *v;
        *v = 0.5 * t * (1.0 + (C * (t + 0.044715 * t * t * t)).tanh());
    }
}

/// Per-layer temporaries, sized lazily and reused across layers and
/// across `forward` calls rather than reallocated every time. Held behind
/// `RefCell` so `forward` can stay `&self`, matching `Context`'s read-only
/// view of the encoder.
struct EncoderScratch {
    normed: RefCell<ScratchBuffer>,
    q: RefCell<ScratchBuffer>,
    k: RefCell<ScratchBuffer>,
    v: RefCell<ScratchBuffer>,
    attn_concat: RefCell<ScratchBuffer>,
    proj: RefCell<ScratchBuffer>,
    gate: RefCell<ScratchBuffer>,
    up: RefCell<ScratchBuffer>,
    scores: RefCell<ScratchBuffer>,
    q_head: RefCell<ScratchBuffer>,
    k_head: RefCell<ScratchBuffer>,
    v_head: RefCell<ScratchBuffer>,
    head_out: RefCell<ScratchBuffer>,
}

impl EncoderScratch {
    fn new() -> Self {
        Self {
            normed: RefCell::new(ScratchBuffer::with_capacity(0)),
            q: RefCell::new(ScratchBuffer::with_capacity(0)),
            k: RefCell::new(ScratchBuffer::with_capacity(0)),
            v: RefCell::new(ScratchBuffer::with_capacity(0)),
            attn_concat: RefCell::new(ScratchBuffer::with_capacity(0)),
            proj: RefCell::new(ScratchBuffer::with_capacity(0)),
            gate: RefCell::new(ScratchBuffer::with_capacity(0)),
            up: RefCell::new(ScratchBuffer::with_capacity(0)),
            scores: RefCell::new(ScratchBuffer::with_capacity(0)),
            q_head: RefCell::new(ScratchBuffer::with_capacity(0)),
            k_head: RefCell::new(ScratchBuffer::with_capacity(0)),
            v_head: RefCell::new(ScratchBuffer::with_capacity(0)),
            head_out: RefCell::new(ScratchBuffer::with_capacity(0)),
        }
    }
}

pub struct Encoder {
    cfg: EncoderConfig,
    backend: Arc<dyn KernelBackend>,
    scratch: EncoderScratch,
}

impl Encoder {
    pub fn new(cfg: EncoderConfig, backend: Arc<dyn KernelBackend>) -> Self {
        Self {
            cfg,
            backend,
            scratch: EncoderScratch::new(),
        }
    }

    /// Runs the conv stem + transformer stack over a log-mel spectrogram
    /// `mel[bin * n_frames + frame]`. Returns time-major hidden states
    /// `[n_out_frames, hidden_size]`.
    pub fn forward(&self, arena: &WeightArena, mel: &[f32], n_frames: usize) -> Result<Vec<f32>> {
        let c = &self.cfg;

        let conv1_w = arena.get("encoder.conv1.weight")?;
        let conv1_b = arena.get("encoder.conv1.bias")?;
        let (h1, len1) = conv1d(mel, c.num_mel_bins, n_frames, conv1_w.data, conv1_b.data, c.hidden_size, 3, 1, 1);
        let mut h1 = h1;
        gelu(&mut h1);

        let conv2_w = arena.get("encoder.conv2.weight")?;
        let conv2_b = arena.get("encoder.conv2.bias")?;
        let (h2, len2) = conv1d(&h1, c.hidden_size, len1, conv2_w.data, conv2_b.data, c.hidden_size, 3, c.conv_stride, 1);
        let mut h2 = h2;
        gelu(&mut h2);

        // Transpose channel-major [hidden, len2] to time-major [len2, hidden].
        let mut hidden = vec![0.0f32; len2 * c.hidden_size];
        for ch in 0..c.hidden_size {
            for t in 0..len2 {
                hidden[t * c.hidden_size + ch] = h2[ch * len2 + t];
            }
        }

        if !c.use_rotary {
            if let Ok(pos_emb) = arena.get("encoder.embed_positions.weight") {
                for t in 0..len2.min(pos_emb.shape[0]) {
                    let row = pos_emb.row(t);
                    for d in 0..c.hidden_size {
                        hidden[t * c.hidden_size + d] += row[d];
                    }
                }
            }
        }

        let head_dim = c.hidden_size / c.num_attention_heads;
        let positions: Vec<usize> = (0..len2).collect();

        for layer in 0..c.num_hidden_layers {
            let prefix = format!("encoder.layers.{layer}");

            let ln1 = arena.get(&format!("{prefix}.input_layernorm.weight"))?;
            {
                let mut normed_buf = self.scratch.normed.borrow_mut();
                let normed = normed_buf.get_mut(len2 * c.hidden_size);
                normed.copy_from_slice(&hidden);
                self.backend.rmsnorm(normed, ln1.data, c.rms_norm_eps);

                let qw = arena.get(&format!("{prefix}.self_attn.q_proj.weight"))?;
                let kw = arena.get(&format!("{prefix}.self_attn.k_proj.weight"))?;
                let vw = arena.get(&format!("{prefix}.self_attn.v_proj.weight"))?;
                let ow = arena.get(&format!("{prefix}.self_attn.o_proj.weight"))?;

                let mut q_buf = self.scratch.q.borrow_mut();
                let q = q_buf.get_mut(len2 * c.hidden_size);
                linear_into(&*self.backend, qw.data, None, normed, q, len2, c.hidden_size, c.hidden_size);
                let mut k_buf = self.scratch.k.borrow_mut();
                let k = k_buf.get_mut(len2 * c.hidden_size);
                linear_into(&*self.backend, kw.data, None, normed, k, len2, c.hidden_size, c.hidden_size);
                let mut v_buf = self.scratch.v.borrow_mut();
                let v = v_buf.get_mut(len2 * c.hidden_size);
                linear_into(&*self.backend, vw.data, None, normed, v, len2, c.hidden_size, c.hidden_size);

                if c.use_rotary {
                    let mut q_head_buf = self.scratch.q_head.borrow_mut();
                    let mut k_head_buf = self.scratch.k_head.borrow_mut();
                    for h in 0..c.num_attention_heads {
                        let q_head = q_head_buf.get_mut(len2 * head_dim);
                        gather_head_into(q, len2, c.hidden_size, h, head_dim, q_head);
                        let k_head = k_head_buf.get_mut(len2 * head_dim);
                        gather_head_into(k, len2, c.hidden_size, h, head_dim, k_head);
                        self.backend.rope_apply(q_head, k_head, &positions, head_dim, c.rope_theta);
                        scatter_head(q, q_head, len2, c.hidden_size, h, head_dim);
                        scatter_head(k, k_head, len2, c.hidden_size, h, head_dim);
                    }
                }

                let mut attn_buf = self.scratch.attn_concat.borrow_mut();
                let attn_out = attn_buf.get_mut(len2 * c.hidden_size);
                self.self_attention(q, k, v, len2, c.num_attention_heads, head_dim, attn_out);

                let mut proj_buf = self.scratch.proj.borrow_mut();
                let proj = proj_buf.get_mut(len2 * c.hidden_size);
                linear_into(&*self.backend, ow.data, None, attn_out, proj, len2, c.hidden_size, c.hidden_size);
                self.backend.add_inplace(proj, &hidden);
                hidden.copy_from_slice(proj);
            }

            let ln2 = arena.get(&format!("{prefix}.post_attention_layernorm.weight"))?;
            {
                let mut normed_buf = self.scratch.normed.borrow_mut();
                let normed2 = normed_buf.get_mut(len2 * c.hidden_size);
                normed2.copy_from_slice(&hidden);
                self.backend.rmsnorm(normed2, ln2.data, c.rms_norm_eps);

                let gate_w = arena.get(&format!("{prefix}.mlp.gate_proj.weight"))?;
                let up_w = arena.get(&format!("{prefix}.mlp.up_proj.weight"))?;
                let down_w = arena.get(&format!("{prefix}.mlp.down_proj.weight"))?;

                let mut gate_buf = self.scratch.gate.borrow_mut();
                let gate = gate_buf.get_mut(len2 * c.intermediate_size);
                linear_into(&*self.backend, gate_w.data, None, normed2, gate, len2, c.hidden_size, c.intermediate_size);
                let mut up_buf = self.scratch.up.borrow_mut();
                let up = up_buf.get_mut(len2 * c.intermediate_size);
                linear_into(&*self.backend, up_w.data, None, normed2, up, len2, c.hidden_size, c.intermediate_size);
                self.backend.silu(gate);
                for (g, u) in gate.iter_mut().zip(up.iter()) {
                    *g *= u;
                }

                let mut mlp_buf = self.scratch.proj.borrow_mut();
                let mlp_out = mlp_buf.get_mut(len2 * c.hidden_size);
                linear_into(&*self.backend, down_w.data, None, gate, mlp_out, len2, c.intermediate_size, c.hidden_size);
                self.backend.add_inplace(mlp_out, &hidden);
                hidden.copy_from_slice(mlp_out);
            }
        }

        let final_norm = arena.get("encoder.norm.weight")?;
        self.backend.rmsnorm(&mut hidden, final_norm.data, c.rms_norm_eps);

        Ok(hidden)
    }

    /// Full (non-causal) multi-head scaled dot-product attention. Writes
    /// the concatenated per-head output into `out`.
    #[allow(clippy::too_many_arguments)]
    fn self_attention(&self, q: &[f32], k: &[f32], v: &[f32], t: usize, n_heads: usize, head_dim: usize, out: &mut [f32]) {
        let scale = 1.0 / (head_dim as f32).sqrt();
        let hidden = n_heads * head_dim;

        let mut q_head_buf = self.scratch.q_head.borrow_mut();
        let mut k_head_buf = self.scratch.k_head.borrow_mut();
        let mut v_head_buf = self.scratch.v_head.borrow_mut();
        let mut scores_buf = self.scratch.scores.borrow_mut();
        let mut head_out_buf = self.scratch.head_out.borrow_mut();

        for h in 0..n_heads {
            let q_head = q_head_buf.get_mut(t * head_dim);
            gather_head_into(q, t, hidden, h, head_dim, q_head);
            let k_head = k_head_buf.get_mut(t * head_dim);
            gather_head_into(k, t, hidden, h, head_dim, k_head);
            let v_head = v_head_buf.get_mut(t * head_dim);
            gather_head_into(v, t, hidden, h, head_dim, v_head);

            let scores = scores_buf.get_mut(t * t);
            self.backend.gemm_at(q_head, k_head, scores, t, t, head_dim, scale, 0.0);
            self.backend.softmax_rowwise(scores, t, t, None);

            let head_out = head_out_buf.get_mut(t * head_dim);
            self.backend.gemm(scores, v_head, head_out, t, head_dim, t, 1.0, 0.0);
            scatter_head(out, head_out, t, hidden, h, head_dim);
        }
    }
}
