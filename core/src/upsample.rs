/// Upsampler: expand smoothed chunk latents back to original resolution.
///
/// Chunk assignment is the inclusive prefix sum of boundary indicators minus
/// one, so idx(0) = 0 and idx never decreases. Every assignment is checked
/// against the element's chunk count before any read. Each original row is
/// then the latent of its chunk, scaled by the confidence of the decision taken
/// at that position through the straight-through operator.

use tracing::warn;

use crate::error::{ChunkError, ChunkResult};
use crate::routing::ChunkDecision;
use crate::straight_through::{ste_scale_backward, ste_scale_forward};
use crate::tensor::SeqLayout;

/// Chunk index of every position of a padded batch: [batch, seq_len].
/// `None` marks padding positions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkAssignment {
    pub idx: Vec<Option<usize>>,
    pub seq_len: usize,
}

impl ChunkAssignment {
    pub fn get(&self, b: usize, t: usize) -> Option<usize> {
        self.idx[b * self.seq_len + t]
    }

    /// Assignment row of batch element `b`, valid positions only.
    pub fn row(&self, b: usize) -> Vec<usize> {
        self.idx[b * self.seq_len..(b + 1) * self.seq_len]
            .iter()
            .map_while(|i| *i)
            .collect()
    }
}

/// Compute idx(t) = (sum of indicators over 0..=t) - 1 for every valid position,
/// checking it against `chunk_counts[b]`.
pub fn chunk_assignment(
    decisions: &[ChunkDecision],
    layout: &SeqLayout,
    chunk_counts: &[usize],
    stage: usize,
) -> ChunkResult<ChunkAssignment> {
    let s = layout.seq_len;
    if chunk_counts.len() != layout.batch {
        return Err(ChunkError::ShapeMismatch {
            component: format!("stage {stage} chunk counts"),
            expected: vec![layout.batch],
            actual: vec![chunk_counts.len()],
        });
    }
    debug_assert_eq!(decisions.len(), layout.rows());

    let mut idx = vec![None; layout.rows()];
    for b in 0..layout.batch {
        let mut prefix = 0usize;
        for t in 0..layout.valid_len[b] {
            prefix += decisions[b * s + t].indicator();
            let Some(chunk) = prefix.checked_sub(1) else {
                warn!(stage, batch = b, position = t, "position precedes first boundary");
                return Err(ChunkError::UnanchoredPosition { stage, batch: b, position: t });
            };
            if chunk >= chunk_counts[b] {
                warn!(stage, batch = b, position = t, chunk, valid_len = chunk_counts[b],
                      "chunk index overrun");
                return Err(ChunkError::ChunkIndexOverrun {
                    stage,
                    batch: b,
                    position: t,
                    chunk_index: chunk,
                    valid_len: chunk_counts[b],
                });
            }
            idx[b * s + t] = Some(chunk);
        }
    }
    Ok(ChunkAssignment { idx, seq_len: s })
}

/// Intermediates saved for `upsample_backward`.
#[derive(Clone, Debug)]
pub struct UpsampleCache {
    pub assignment: ChunkAssignment,
    /// Raw expansion z_t = z̄[idx(t)]: [batch, seq_len, d]
    pub expanded: Vec<f32>,
    /// Confidence c_t of the decision taken: [batch, seq_len], 0 at padding.
    pub confidence: Vec<f32>,
    pub decisions: Vec<ChunkDecision>,
}

/// Upsampler forward.
///
/// `z_bar`: [batch, chunks, d] laid out by `chunks`; `p`/`decisions`: [batch, seq_len]
/// routed at original resolution; `layout`: target original-resolution layout.
/// Returns [batch, seq_len, d].
pub fn upsample_forward(
    z_bar: &[f32],
    chunks: &SeqLayout,
    p: &[f32],
    decisions: &[ChunkDecision],
    layout: &SeqLayout,
    stage: usize,
) -> ChunkResult<(Vec<f32>, UpsampleCache)> {
    let d = layout.d;
    let s = layout.seq_len;
    if chunks.batch != layout.batch || chunks.d != d || z_bar.len() != chunks.numel() {
        return Err(ChunkError::ShapeMismatch {
            component: format!("stage {stage} upsampler input"),
            expected: vec![layout.batch, chunks.seq_len, d],
            actual: vec![chunks.batch, chunks.seq_len, chunks.d, z_bar.len()],
        });
    }
    debug_assert_eq!(p.len(), layout.rows());

    let assignment = chunk_assignment(decisions, layout, &chunks.valid_len, stage)?;

    let mut expanded = vec![0.0f32; layout.numel()];
    let mut confidence = vec![0.0f32; layout.rows()];
    for b in 0..layout.batch {
        for t in 0..layout.valid_len[b] {
            let i = b * s + t;
            // Checked in chunk_assignment: every valid position has an in-range chunk.
            let Some(chunk) = assignment.idx[i] else { continue };
            let src = chunks.offset(b, chunk);
            let dst = layout.offset(b, t);
            expanded[dst..dst + d].copy_from_slice(&z_bar[src..src + d]);
            confidence[i] = decisions[i].confidence(p[i]);
        }
    }

    let out = ste_scale_forward(&expanded, &confidence, d);
    Ok((out, UpsampleCache { assignment, expanded, confidence, decisions: decisions.to_vec() }))
}

/// Upsampler backward. Returns (d_z_bar laid out by `chunks`, d_p [batch, seq_len]).
///
/// Each chunk latent collects the unattenuated gradient of every position
/// assigned to it; p receives the confidence gradient, signed by the decision.
pub fn upsample_backward(
    cache: &UpsampleCache,
    d_out: &[f32],
    chunks: &SeqLayout,
    layout: &SeqLayout,
) -> (Vec<f32>, Vec<f32>) {
    let d = layout.d;
    let s = layout.seq_len;
    debug_assert_eq!(d_out.len(), layout.numel());

    let (d_expanded, d_conf) = ste_scale_backward(&cache.expanded, d_out, d);

    let mut d_z_bar = vec![0.0f32; chunks.numel()];
    let mut d_p = vec![0.0f32; layout.rows()];
    for b in 0..layout.batch {
        for t in 0..layout.valid_len[b] {
            let i = b * s + t;
            let Some(chunk) = cache.assignment.idx[i] else { continue };
            let src = layout.offset(b, t);
            let dst = chunks.offset(b, chunk);
            for c in 0..d {
                d_z_bar[dst + c] += d_expanded[src + c];
            }
            d_p[i] = cache.decisions[i].confidence_slope() * d_conf[i];
        }
    }
    (d_z_bar, d_p)
}
