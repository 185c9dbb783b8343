/// Boundary router: per-position chunk-boundary probability from the cosine
/// similarity of adjacent positions.
///
/// Forward (per batch element, valid positions only):
///   q_t = x_t @ W_q^T,  k_t = x_t @ W_k^T
///   cos_t = dot(q_t, k_{t-1}) / (||q_t|| * ||k_{t-1}|| + eps)
///   p_t = 0.5 * (1 - cos_t),  p_0 = 1 (forced)
///   decision_t = Boundary iff p_t >= 0.5
///
/// Padding positions get p = 0 and `Continuation`, so they never open a chunk.
/// Decisions are discrete and carry no gradient; `router_backward` maps d_p
/// to projection and input gradients.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::model::RouterParams;
use crate::tensor::{dot_f32, matmul_acc_f32, matmul_f32, transpose_f32, vec_norm_f32, SeqLayout};

/// Stabilizer in the cosine denominator. Zero-norm projections give cos = 0.
pub const COSINE_EPS: f32 = 1e-8;

/// `p >= BOUNDARY_THRESHOLD` opens a new chunk.
pub const BOUNDARY_THRESHOLD: f32 = 0.5;

/// The discrete routing decision at one position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkDecision {
    /// This position starts a new chunk.
    Boundary,
    /// This position extends the current chunk.
    Continuation,
}

impl ChunkDecision {
    /// Threshold decision: Boundary iff `p >= 0.5`.
    #[inline]
    pub fn from_prob(p: f32) -> Self {
        if p >= BOUNDARY_THRESHOLD {
            ChunkDecision::Boundary
        } else {
            ChunkDecision::Continuation
        }
    }

    #[inline]
    pub fn is_boundary(self) -> bool {
        matches!(self, ChunkDecision::Boundary)
    }

    /// 1 for Boundary, 0 for Continuation.
    #[inline]
    pub fn indicator(self) -> usize {
        self.is_boundary() as usize
    }

    /// Probability mass assigned to the decision actually taken:
    /// `p` for Boundary, `1 - p` for Continuation.
    #[inline]
    pub fn confidence(self, p: f32) -> f32 {
        match self {
            ChunkDecision::Boundary => p,
            ChunkDecision::Continuation => 1.0 - p,
        }
    }

    /// d(confidence)/dp.
    #[inline]
    pub fn confidence_slope(self) -> f32 {
        match self {
            ChunkDecision::Boundary => 1.0,
            ChunkDecision::Continuation => -1.0,
        }
    }
}

/// Router result for one batch: both buffers are `[batch, seq_len]`.
#[derive(Clone, Debug)]
pub struct RouterOutput {
    pub p: Vec<f32>,
    pub decisions: Vec<ChunkDecision>,
}

impl RouterOutput {
    /// Number of boundaries in batch element `b`.
    pub fn boundary_count(&self, layout: &SeqLayout, b: usize) -> usize {
        let row = &self.decisions[b * layout.seq_len..(b + 1) * layout.seq_len];
        row.iter().map(|d| d.indicator()).sum()
    }
}

/// Intermediates saved for `router_backward`.
#[derive(Clone, Debug)]
pub struct RouterCache {
    /// Query projections: [batch, seq_len, d]
    pub q: Vec<f32>,
    /// Key projections: [batch, seq_len, d]
    pub k: Vec<f32>,
    /// dot(q_t, k_{t-1}) per position: [batch, seq_len] (0 where not computed)
    pub dot: Vec<f32>,
    /// ||q_t||: [batch, seq_len]
    pub q_norm: Vec<f32>,
    /// ||k_{t-1}||: [batch, seq_len]
    pub k_prev_norm: Vec<f32>,
}

/// Router forward over a padded batch.
///
/// `x`: [batch, seq_len, d] encoder output. Returns (p, decisions) and the cache.
pub fn router_forward(
    params: &RouterParams,
    x: &[f32],
    layout: &SeqLayout,
) -> (RouterOutput, RouterCache) {
    let d = layout.d;
    let rows = layout.rows();
    let s = layout.seq_len;
    debug_assert_eq!(x.len(), rows * d);
    debug_assert_eq!(params.d, d);

    // Q = X @ W_q^T, K = X @ W_k^T
    let mut w_q_t = vec![0.0f32; d * d];
    let mut w_k_t = vec![0.0f32; d * d];
    transpose_f32(&params.w_q, &mut w_q_t, d, d);
    transpose_f32(&params.w_k, &mut w_k_t, d, d);
    let mut q = vec![0.0f32; rows * d];
    let mut k = vec![0.0f32; rows * d];
    matmul_f32(x, &w_q_t, &mut q, rows, d, d);
    matmul_f32(x, &w_k_t, &mut k, rows, d, d);

    let mut p = vec![0.0f32; rows];
    let mut decisions = vec![ChunkDecision::Continuation; rows];
    let mut dot = vec![0.0f32; rows];
    let mut q_norm = vec![0.0f32; rows];
    let mut k_prev_norm = vec![0.0f32; rows];

    for b in 0..layout.batch {
        let valid = layout.valid_len[b];
        if valid == 0 {
            continue;
        }
        // Position 0 compares against itself; its probability is forced.
        p[b * s] = 1.0;
        decisions[b * s] = ChunkDecision::Boundary;

        for t in 1..valid {
            let i = b * s + t;
            let q_t = &q[i * d..(i + 1) * d];
            let k_prev = &k[(i - 1) * d..i * d];
            let n = dot_f32(q_t, k_prev);
            let nq = vec_norm_f32(q_t);
            let nk = vec_norm_f32(k_prev);
            let cos = n / (nq * nk + COSINE_EPS);

            dot[i] = n;
            q_norm[i] = nq;
            k_prev_norm[i] = nk;
            p[i] = (0.5 * (1.0 - cos)).clamp(0.0, 1.0);
            decisions[i] = ChunkDecision::from_prob(p[i]);
        }
    }

    trace!(batch = layout.batch, seq_len = s, d, "router forward");

    (
        RouterOutput { p, decisions },
        RouterCache { q, k, dot, q_norm, k_prev_norm },
    )
}

/// Router backward: gradient of the loss w.r.t. `p` → gradients for W_q, W_k and x.
///
/// `d_p` at position 0 and at padding positions is ignored (those probabilities
/// are constants).
pub fn router_backward(
    params: &RouterParams,
    x: &[f32],
    cache: &RouterCache,
    d_p: &[f32],
    layout: &SeqLayout,
) -> (RouterParams, Vec<f32>) {
    let d = layout.d;
    let rows = layout.rows();
    let s = layout.seq_len;
    debug_assert_eq!(x.len(), rows * d);
    debug_assert_eq!(d_p.len(), rows);

    let mut d_q = vec![0.0f32; rows * d];
    let mut d_k = vec![0.0f32; rows * d];

    for b in 0..layout.batch {
        for t in 1..layout.valid_len[b] {
            let i = b * s + t;
            let g = d_p[i];
            if g == 0.0 {
                continue;
            }
            // p = 0.5 * (1 - n / den), den = nq * nk + eps
            let d_cos = -0.5 * g;
            let n = cache.dot[i];
            let nq = cache.q_norm[i];
            let nk = cache.k_prev_norm[i];
            let den = nq * nk + COSINE_EPS;
            let d_n = d_cos / den;
            let d_den = -d_cos * n / (den * den);

            let q_t = &cache.q[i * d..(i + 1) * d];
            let k_prev = &cache.k[(i - 1) * d..i * d];
            let q_scale = if nq > 0.0 { d_den * nk / nq } else { 0.0 };
            let k_scale = if nk > 0.0 { d_den * nq / nk } else { 0.0 };
            for j in 0..d {
                d_q[i * d + j] += d_n * k_prev[j] + q_scale * q_t[j];
                d_k[(i - 1) * d + j] += d_n * q_t[j] + k_scale * k_prev[j];
            }
        }
    }

    // dW = dY^T @ X for Y = X @ W^T
    let mut grads = RouterParams::zeros(d);
    let mut d_q_t = vec![0.0f32; d * rows];
    let mut d_k_t = vec![0.0f32; d * rows];
    transpose_f32(&d_q, &mut d_q_t, rows, d);
    transpose_f32(&d_k, &mut d_k_t, rows, d);
    matmul_f32(&d_q_t, x, &mut grads.w_q, d, rows, d);
    matmul_f32(&d_k_t, x, &mut grads.w_k, d, rows, d);

    // dX = dQ @ W_q + dK @ W_k
    let mut d_x = vec![0.0f32; rows * d];
    matmul_acc_f32(&d_q, &params.w_q, &mut d_x, rows, d, d);
    matmul_acc_f32(&d_k, &params.w_k, &mut d_x, rows, d, d);

    (grads, d_x)
}

/// Summary of one stage's routing decisions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingStats {
    /// Real positions routed.
    pub positions: usize,
    /// Boundaries selected (= chunks produced).
    pub chunks: usize,
    /// positions / chunks.
    pub compression_ratio: f32,
    /// Mean boundary probability over real positions.
    pub mean_prob: f32,
}

/// Aggregate statistics over the valid positions of a routed batch.
pub fn routing_stats(out: &RouterOutput, layout: &SeqLayout) -> RoutingStats {
    let s = layout.seq_len;
    let mut positions = 0usize;
    let mut chunks = 0usize;
    let mut prob_sum = 0.0f32;
    for b in 0..layout.batch {
        for t in 0..layout.valid_len[b] {
            let i = b * s + t;
            positions += 1;
            chunks += out.decisions[i].indicator();
            prob_sum += out.p[i];
        }
    }
    RoutingStats {
        positions,
        chunks,
        compression_ratio: if chunks > 0 { positions as f32 / chunks as f32 } else { 0.0 },
        mean_prob: if positions > 0 { prob_sum / positions as f32 } else { 0.0 },
    }
}
