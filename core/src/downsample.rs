/// Downsampler: keep only boundary positions.
///
/// For each batch element independently, the rows (and probabilities) at
/// Boundary positions are gathered in original order, then every element is
/// right-padded with zeros to the batch-wide maximum chunk count. The chunk
/// count of each element travels with the result as its valid length.
///
/// Backward is the matching scatter: gradients of kept rows go back to their
/// source positions, everything else gets zero.

use tracing::{trace, warn};

use crate::error::{ChunkError, ChunkResult};
use crate::routing::ChunkDecision;
use crate::tensor::SeqLayout;

/// Padded compressed sequence with explicit per-element chunk counts.
#[derive(Clone, Debug)]
pub struct Compressed {
    /// Chunk latents: [batch, max_chunks, d], zero beyond each valid length.
    pub values: Vec<f32>,
    /// Boundary probability of each kept position: [batch, max_chunks].
    pub probs: Vec<f32>,
    /// `seq_len` = max_chunks, `valid_len[b]` = chunk count of element b.
    pub layout: SeqLayout,
}

impl Compressed {
    pub fn valid_len(&self) -> &[usize] {
        &self.layout.valid_len
    }
}

/// Which source positions were kept, per batch element.
#[derive(Clone, Debug)]
pub struct DownsampleCache {
    pub positions: Vec<Vec<usize>>,
    /// Layout of the uncompressed input.
    pub source: SeqLayout,
}

/// Gather boundary rows of `x` ([batch, seq_len, d]) and their probabilities.
///
/// Fails with `EmptyChunk` for any element that selects nothing.
pub fn downsample_forward(
    x: &[f32],
    p: &[f32],
    decisions: &[ChunkDecision],
    layout: &SeqLayout,
    stage: usize,
) -> ChunkResult<(Compressed, DownsampleCache)> {
    let d = layout.d;
    let s = layout.seq_len;
    debug_assert_eq!(x.len(), layout.numel());
    debug_assert_eq!(p.len(), layout.rows());
    debug_assert_eq!(decisions.len(), layout.rows());

    let mut positions = Vec::with_capacity(layout.batch);
    for b in 0..layout.batch {
        let kept: Vec<usize> = (0..layout.valid_len[b])
            .filter(|&t| decisions[b * s + t].is_boundary())
            .collect();
        if kept.is_empty() {
            warn!(stage, batch = b, "downsampler selected no boundary positions");
            return Err(ChunkError::EmptyChunk { stage, batch: b });
        }
        positions.push(kept);
    }

    let valid_len: Vec<usize> = positions.iter().map(Vec::len).collect();
    let max_chunks = valid_len.iter().copied().max().unwrap_or(0);
    let out_layout = SeqLayout::ragged(max_chunks, d, valid_len);

    let mut values = vec![0.0f32; out_layout.numel()];
    let mut probs = vec![0.0f32; out_layout.rows()];
    for (b, kept) in positions.iter().enumerate() {
        for (j, &t) in kept.iter().enumerate() {
            let src = layout.offset(b, t);
            let dst = out_layout.offset(b, j);
            values[dst..dst + d].copy_from_slice(&x[src..src + d]);
            probs[b * max_chunks + j] = p[b * s + t];
        }
    }

    trace!(stage, max_chunks, chunks = ?out_layout.valid_len, "downsampled");

    Ok((
        Compressed { values, probs, layout: out_layout },
        DownsampleCache { positions, source: layout.clone() },
    ))
}

/// Scatter compressed gradients back to source positions.
///
/// `d_values`: [batch, max_chunks, d], `d_probs`: [batch, max_chunks].
/// Returns (d_x [batch, seq_len, d], d_p [batch, seq_len]). Padding slots of the
/// compressed gradients are ignored.
pub fn downsample_backward(
    d_values: &[f32],
    d_probs: &[f32],
    cache: &DownsampleCache,
) -> (Vec<f32>, Vec<f32>) {
    let src = &cache.source;
    let d = src.d;
    let max_chunks = cache.positions.iter().map(Vec::len).max().unwrap_or(0);
    debug_assert_eq!(d_values.len(), src.batch * max_chunks * d);
    debug_assert_eq!(d_probs.len(), src.batch * max_chunks);

    let mut d_x = vec![0.0f32; src.numel()];
    let mut d_p = vec![0.0f32; src.rows()];
    for (b, kept) in cache.positions.iter().enumerate() {
        for (j, &t) in kept.iter().enumerate() {
            let from = (b * max_chunks + j) * d;
            let to = src.offset(b, t);
            for c in 0..d {
                d_x[to + c] += d_values[from + c];
            }
            d_p[b * src.seq_len + t] += d_probs[b * max_chunks + j];
        }
    }
    (d_x, d_p)
}
