//! Causal grouped-query-attention decoder with cross-attention over the
//! encoder's output and an incrementally-extended KV cache.
//!
//! `forward_chunk` processes one or more new tokens uniformly: prefill
//! calls it with the whole initial prompt, autoregressive steps call it
//! with exactly one token. Each call appends its new keys/values into the
//! shared cache at `start_pos` and attends causally back through whatever
//! the cache already holds, so the two cases share one code path.

use std::cell::RefCell;
use std::sync::Arc;

use crate::config::DecoderConfig;
use crate::error::Result;
use crate::kernels::KernelBackend;
use crate::model::{gather_head_into, linear_into, scatter_head};
use crate::tensor::{ScratchBuffer, WeightArena};

struct LayerKv {
    k: Vec<f32>,
    v: Vec<f32>,
}

/// Self-attention KV cache, one entry per decoder layer. `len` is shared
/// across layers by construction: every `forward_chunk` call advances it
/// by the same amount for every layer in the same pass.
pub struct KvCache {
    layers: Vec<LayerKv>,
    kv_dim: usize,
    pub max_len: usize,
    pub len: usize,
}

impl KvCache {
    pub fn new(num_layers: usize, max_len: usize, kv_dim: usize) -> Self {
        Self {
            layers: (0..num_layers)
                .map(|_| LayerKv {
                    k: vec![0.0; max_len * kv_dim],
                    v: vec![0.0; max_len * kv_dim],
                })
                .collect(),
            kv_dim,
            max_len,
            len: 0,
        }
    }

    /// Resets occupancy to zero without freeing the backing allocation.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    fn write(&mut self, layer: usize, start_pos: usize, new_k: &[f32], new_v: &[f32]) {
        let l = &mut self.layers[layer];
        let off = start_pos * self.kv_dim;
        l.k[off..off + new_k.len()].copy_from_slice(new_k);
        l.v[off..off + new_v.len()].copy_from_slice(new_v);
    }

    fn view(&self, layer: usize, up_to: usize) -> (&[f32], &[f32]) {
        let l = &self.layers[layer];
        (&l.k[..up_to * self.kv_dim], &l.v[..up_to * self.kv_dim])
    }
}

/// Precomputed cross-attention keys/values, one pair per layer, derived
/// once from the encoder's output and reused for every decode step in the
/// same utterance (the encoder side never changes mid-generation).
pub struct CrossKv {
    per_layer: Vec<(Vec<f32>, Vec<f32>)>,
    t_enc: usize,
}

/// Per-layer temporaries, sized lazily and reused across layers, decode
/// steps, and utterances rather than reallocated every call. Held behind
/// `RefCell` so `forward_chunk` can stay `&self`.
struct DecoderScratch {
    normed: RefCell<ScratchBuffer>,
    q: RefCell<ScratchBuffer>,
    k_new: RefCell<ScratchBuffer>,
    v_new: RefCell<ScratchBuffer>,
    attn_concat: RefCell<ScratchBuffer>,
    proj: RefCell<ScratchBuffer>,
    gate: RefCell<ScratchBuffer>,
    up: RefCell<ScratchBuffer>,
    q_head: RefCell<ScratchBuffer>,
    k_head: RefCell<ScratchBuffer>,
    v_head: RefCell<ScratchBuffer>,
    rope_dummy: RefCell<ScratchBuffer>,
    scores: RefCell<ScratchBuffer>,
    head_out: RefCell<ScratchBuffer>,
}

impl DecoderScratch {
    fn new() -> Self {
        Self {
            normed: RefCell::new(ScratchBuffer::with_capacity(0)),
            q: RefCell::new(ScratchBuffer::with_capacity(0)),
            k_new: RefCell::new(ScratchBuffer::with_capacity(0)),
            v_new: RefCell::new(ScratchBuffer::with_capacity(0)),
            attn_concat: RefCell::new(ScratchBuffer::with_capacity(0)),
            proj: RefCell::new(ScratchBuffer::with_capacity(0)),
            gate: RefCell::new(ScratchBuffer::with_capacity(0)),
            up: RefCell::new(ScratchBuffer::with_capacity(0)),
            q_head: RefCell::new(ScratchBuffer::with_capacity(0)),
            k_head: RefCell::new(ScratchBuffer::with_capacity(0)),
            v_head: RefCell::new(ScratchBuffer::with_capacity(0)),
            rope_dummy: RefCell::new(ScratchBuffer::with_capacity(0)),
            scores: RefCell::new(ScratchBuffer::with_capacity(0)),
            head_out: RefCell::new(ScratchBuffer::with_capacity(0)),
        }
    }
}

pub struct Decoder {
    cfg: DecoderConfig,
    backend: Arc<dyn KernelBackend>,
    scratch: DecoderScratch,
}

impl Decoder {
    pub fn new(cfg: DecoderConfig, backend: Arc<dyn KernelBackend>) -> Self {
        Self {
            cfg,
            backend,
            scratch: DecoderScratch::new(),
        }
    }

    pub fn new_kv_cache(&self) -> KvCache {
        KvCache::new(self.cfg.num_hidden_layers, self.cfg.max_position_embeddings, self.cfg.num_key_value_heads * self.cfg.head_dim)
    }

    pub fn precompute_cross(&self, arena: &WeightArena, encoder_hidden: &[f32], t_enc: usize) -> Result<CrossKv> {
        let c = &self.cfg;
        let kv_dim = c.num_attention_heads * c.head_dim;
        let mut per_layer = Vec::with_capacity(c.num_hidden_layers);
        for layer in 0..c.num_hidden_layers {
            let prefix = format!("decoder.layers.{layer}");
            let kw = arena.get(&format!("{prefix}.cross_attn.k_proj.weight"))?;
            let vw = arena.get(&format!("{prefix}.cross_attn.v_proj.weight"))?;
            let mut k = vec![0.0f32; t_enc * kv_dim];
            linear_into(&*self.backend, kw.data, None, encoder_hidden, &mut k, t_enc, c.hidden_size, kv_dim);
            let mut v = vec![0.0f32; t_enc * kv_dim];
            linear_into(&*self.backend, vw.data, None, encoder_hidden, &mut v, t_enc, c.hidden_size, kv_dim);
            per_layer.push((k, v));
        }
        Ok(CrossKv { per_layer, t_enc })
    }

    /// Processes `tokens` starting at absolute position `start_pos`,
    /// returning time-major hidden states `[tokens.len(), hidden_size]`.
    /// Advances `kv.len` by `tokens.len()` on return.
    pub fn forward_chunk(&self, arena: &WeightArena, tokens: &[u32], start_pos: usize, kv: &mut KvCache, cross: &CrossKv) -> Result<Vec<f32>> {
        let c = &self.cfg;
        let n_new = tokens.len();
        let hidden_dim = c.num_attention_heads * c.head_dim;
        let kv_dim = c.num_key_value_heads * c.head_dim;

        let embed = arena.get("decoder.embed_tokens.weight")?;
        let mut hidden = vec![0.0f32; n_new * c.hidden_size];
        self.backend.embed_lookup(embed.data, c.hidden_size, tokens, &mut hidden);

        let positions: Vec<usize> = (0..n_new).map(|i| start_pos + i).collect();

        for layer in 0..c.num_hidden_layers {
            let prefix = format!("decoder.layers.{layer}");

            // --- causal self-attention with GQA ---
            let ln1 = arena.get(&format!("{prefix}.input_layernorm.weight"))?;
            {
                let mut normed_buf = self.scratch.normed.borrow_mut();
                let normed = normed_buf.get_mut(n_new * c.hidden_size);
                normed.copy_from_slice(&hidden);
                self.backend.rmsnorm(normed, ln1.data, c.rms_norm_eps);

                let qw = arena.get(&format!("{prefix}.self_attn.q_proj.weight"))?;
                let kw = arena.get(&format!("{prefix}.self_attn.k_proj.weight"))?;
                let vw = arena.get(&format!("{prefix}.self_attn.v_proj.weight"))?;
                let ow = arena.get(&format!("{prefix}.self_attn.o_proj.weight"))?;

                let mut q_buf = self.scratch.q.borrow_mut();
                let q = q_buf.get_mut(n_new * hidden_dim);
                linear_into(&*self.backend, qw.data, None, normed, q, n_new, c.hidden_size, hidden_dim);
                let mut k_new_buf = self.scratch.k_new.borrow_mut();
                let k_new = k_new_buf.get_mut(n_new * kv_dim);
                linear_into(&*self.backend, kw.data, None, normed, k_new, n_new, c.hidden_size, kv_dim);
                let mut v_new_buf = self.scratch.v_new.borrow_mut();
                let v_new = v_new_buf.get_mut(n_new * kv_dim);
                linear_into(&*self.backend, vw.data, None, normed, v_new, n_new, c.hidden_size, kv_dim);

                {
                    let mut q_head_buf = self.scratch.q_head.borrow_mut();
                    let mut dummy_buf = self.scratch.rope_dummy.borrow_mut();
                    for h in 0..c.num_attention_heads {
                        let q_head = q_head_buf.get_mut(n_new * c.head_dim);
                        gather_head_into(q, n_new, hidden_dim, h, c.head_dim, q_head);
                        let dummy = dummy_buf.get_mut(n_new * c.head_dim);
                        self.backend.rope_apply(q_head, dummy, &positions, c.head_dim, c.rope_theta);
                        scatter_head(q, q_head, n_new, hidden_dim, h, c.head_dim);
                    }
                }
                {
                    let mut k_head_buf = self.scratch.k_head.borrow_mut();
                    let mut dummy_buf = self.scratch.rope_dummy.borrow_mut();
                    for h in 0..c.num_key_value_heads {
                        let k_head = k_head_buf.get_mut(n_new * c.head_dim);
                        gather_head_into(k_new, n_new, kv_dim, h, c.head_dim, k_head);
                        let dummy = dummy_buf.get_mut(n_new * c.head_dim);
                        self.backend.rope_apply(dummy, k_head, &positions, c.head_dim, c.rope_theta);
                        scatter_head(k_new, k_head, n_new, kv_dim, h, c.head_dim);
                    }
                }

                kv.write(layer, start_pos, k_new, v_new);
                let (k_all, v_all) = kv.view(layer, start_pos + n_new);

                let mut attn_buf = self.scratch.attn_concat.borrow_mut();
                let attn_out = attn_buf.get_mut(n_new * hidden_dim);
                self.causal_gqa_attention(q, k_all, v_all, n_new, start_pos, c.num_attention_heads, c.num_key_value_heads, c.head_dim, attn_out);

                let mut proj_buf = self.scratch.proj.borrow_mut();
                let proj = proj_buf.get_mut(n_new * c.hidden_size);
                linear_into(&*self.backend, ow.data, None, attn_out, proj, n_new, hidden_dim, c.hidden_size);
                self.backend.add_inplace(proj, &hidden);
                hidden.copy_from_slice(proj);
            }

            // --- cross-attention over encoder output ---
            let ln_cross = arena.get(&format!("{prefix}.cross_attn_layernorm.weight"))?;
            {
                let mut normed_buf = self.scratch.normed.borrow_mut();
                let normed_cross = normed_buf.get_mut(n_new * c.hidden_size);
                normed_cross.copy_from_slice(&hidden);
                self.backend.rmsnorm(normed_cross, ln_cross.data, c.rms_norm_eps);

                let cqw = arena.get(&format!("{prefix}.cross_attn.q_proj.weight"))?;
                let cow = arena.get(&format!("{prefix}.cross_attn.o_proj.weight"))?;

                let mut q_cross_buf = self.scratch.q.borrow_mut();
                let q_cross = q_cross_buf.get_mut(n_new * hidden_dim);
                linear_into(&*self.backend, cqw.data, None, normed_cross, q_cross, n_new, c.hidden_size, hidden_dim);
                let (k_cross, v_cross) = &cross.per_layer[layer];

                let mut cross_buf = self.scratch.attn_concat.borrow_mut();
                let cross_out = cross_buf.get_mut(n_new * hidden_dim);
                self.full_attention(q_cross, k_cross, v_cross, n_new, cross.t_enc, c.num_attention_heads, c.head_dim, cross_out);

                let mut cross_proj_buf = self.scratch.proj.borrow_mut();
                let cross_proj = cross_proj_buf.get_mut(n_new * c.hidden_size);
                linear_into(&*self.backend, cow.data, None, cross_out, cross_proj, n_new, hidden_dim, c.hidden_size);
                self.backend.add_inplace(cross_proj, &hidden);
                hidden.copy_from_slice(cross_proj);
            }

            // --- SwiGLU MLP ---
            let ln2 = arena.get(&format!("{prefix}.post_attention_layernorm.weight"))?;
            {
                let mut normed_buf = self.scratch.normed.borrow_mut();
                let normed2 = normed_buf.get_mut(n_new * c.hidden_size);
                normed2.copy_from_slice(&hidden);
                self.backend.rmsnorm(normed2, ln2.data, c.rms_norm_eps);

                let gate_w = arena.get(&format!("{prefix}.mlp.gate_proj.weight"))?;
                let up_w = arena.get(&format!("{prefix}.mlp.up_proj.weight"))?;
                let down_w = arena.get(&format!("{prefix}.mlp.down_proj.weight"))?;

                let mut gate_buf = self.scratch.gate.borrow_mut();
                let gate = gate_buf.get_mut(n_new * c.intermediate_size);
                linear_into(&*self.backend, gate_w.data, None, normed2, gate, n_new, c.hidden_size, c.intermediate_size);
                let mut up_buf = self.scratch.up.borrow_mut();
                let up = up_buf.get_mut(n_new * c.intermediate_size);
                linear_into(&*self.backend, up_w.data, None, normed2, up, n_new, c.hidden_size, c.intermediate_size);
                self.backend.silu(gate);
                for (g, u) in gate.iter_mut().zip(up.iter()) {
                    *g *= u;
                }

                let mut mlp_buf = self.scratch.proj.borrow_mut();
                let mlp_out = mlp_buf.get_mut(n_new * c.hidden_size);
                linear_into(&*self.backend, down_w.data, None, gate, mlp_out, n_new, c.intermediate_size, c.hidden_size);
                self.backend.add_inplace(mlp_out, &hidden);
                hidden.copy_from_slice(mlp_out);
            }
        }

        kv.len = start_pos + n_new;
        Ok(hidden)
    }

    /// Projects the decoder's final-layer hidden state for one position
    /// onto vocabulary logits.
    pub fn lm_head(&self, arena: &WeightArena, hidden_last: &[f32]) -> Result<Vec<f32>> {
        let final_norm = arena.get("decoder.norm.weight")?;
        let mut normed = hidden_last.to_vec();
        self.backend.rmsnorm(&mut normed, final_norm.data, self.cfg.rms_norm_eps);
        let head = arena.get("decoder.lm_head.weight")?;
        let mut logits = vec![0.0f32; self.cfg.vocab_size];
        linear_into(&*self.backend, head.data, None, &normed, &mut logits, 1, self.cfg.hidden_size, self.cfg.vocab_size);
        Ok(logits)
    }

    pub fn argmax(&self, logits: &[f32]) -> usize {
        self.backend.argmax_row(logits)
    }

    /// Causal multi-head attention where `queries_per_group` query heads
    /// share one cached key/value head (grouped-query attention). Writes
    /// the concatenated per-head output into `out`.
    #[allow(clippy::too_many_arguments)]
    fn causal_gqa_attention(&self, q: &[f32], k_cache: &[f32], v_cache: &[f32], n_new: usize, start_pos: usize, n_heads: usize, n_kv_heads: usize, head_dim: usize, out: &mut [f32]) {
        let scale = 1.0 / (head_dim as f32).sqrt();
        let hidden_dim = n_heads * head_dim;
        let kv_dim = n_kv_heads * head_dim;
        let queries_per_group = n_heads / n_kv_heads;
        let total_kv = start_pos + n_new;

        let mut q_head_buf = self.scratch.q_head.borrow_mut();
        let mut k_head_buf = self.scratch.k_head.borrow_mut();
        let mut v_head_buf = self.scratch.v_head.borrow_mut();
        let mut scores_buf = self.scratch.scores.borrow_mut();
        let mut head_out_buf = self.scratch.head_out.borrow_mut();

        for h in 0..n_heads {
            let kv_h = h / queries_per_group;

            let q_head = q_head_buf.get_mut(n_new * head_dim);
            gather_head_into(q, n_new, hidden_dim, h, head_dim, q_head);
            let k_head = k_head_buf.get_mut(total_kv * head_dim);
            gather_head_into(k_cache, total_kv, kv_dim, kv_h, head_dim, k_head);
            let v_head = v_head_buf.get_mut(total_kv * head_dim);
            gather_head_into(v_cache, total_kv, kv_dim, kv_h, head_dim, v_head);

            let scores = scores_buf.get_mut(n_new * total_kv);
            self.backend.gemm_at(q_head, k_head, scores, n_new, total_kv, head_dim, scale, 0.0);
            for row in 0..n_new {
                let causal_len = start_pos + row + 1;
                for col in causal_len..total_kv {
                    scores[row * total_kv + col] = f32::NEG_INFINITY;
                }
            }
            self.backend.softmax_rowwise(scores, n_new, total_kv, None);

            let head_out = head_out_buf.get_mut(n_new * head_dim);
            self.backend.gemm(scores, v_head, head_out, n_new, head_dim, total_kv, 1.0, 0.0);
            scatter_head(out, head_out, n_new, hidden_dim, h, head_dim);
        }
    }

    /// Full (non-causal) attention against a fixed key/value set, used by
    /// cross-attention over the encoder's output. Writes the concatenated
    /// per-head output into `out`.
    #[allow(clippy::too_many_arguments)]
    fn full_attention(&self, q: &[f32], k: &[f32], v: &[f32], n_q: usize, n_kv: usize, n_heads: usize, head_dim: usize, out: &mut [f32]) {
        let scale = 1.0 / (head_dim as f32).sqrt();
        let hidden_dim = n_heads * head_dim;

        let mut q_head_buf = self.scratch.q_head.borrow_mut();
        let mut k_head_buf = self.scratch.k_head.borrow_mut();
        let mut v_head_buf = self.scratch.v_head.borrow_mut();
        let mut scores_buf = self.scratch.scores.borrow_mut();
        let mut head_out_buf = self.scratch.head_out.borrow_mut();

        for h in 0..n_heads {
            let q_head = q_head_buf.get_mut(n_q * head_dim);
            gather_head_into(q, n_q, hidden_dim, h, head_dim, q_head);
            let k_head = k_head_buf.get_mut(n_kv * head_dim);
            gather_head_into(k, n_kv, hidden_dim, h, head_dim, k_head);
            let v_head = v_head_buf.get_mut(n_kv * head_dim);
            gather_head_into(v, n_kv, hidden_dim, h, head_dim, v_head);

            let scores = scores_buf.get_mut(n_q * n_kv);
            self.backend.gemm_at(q_head, k_head, scores, n_q, n_kv, head_dim, scale, 0.0);
            self.backend.softmax_rowwise(scores, n_q, n_kv, None);

            let head_out = head_out_buf.get_mut(n_q * head_dim);
            self.backend.gemm(scores, v_head, head_out, n_q, head_dim, n_kv, 1.0, 0.0);
            scatter_head(out, head_out, n_q, hidden_dim, h, head_dim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_cache_reset_does_not_shrink_allocation() {
        let mut kv = KvCache::new(2, 16, 8);
        kv.write(0, 0, &[1.0; 8], &[2.0; 8]);
        kv.len = 1;
        let cap_before = kv.layers[0].k.len();
        kv.reset();
        assert_eq!(kv.len, 0);
        assert_eq!(kv.layers[0].k.len(), cap_before);
    }
}
