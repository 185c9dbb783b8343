/// Compression-ratio auxiliary loss.
///
/// Over the valid positions of one stage:
///   F = fraction of positions routed as Boundary   (no gradient)
///   G = mean boundary probability                  (differentiable)
///   L = N / (N - 1) * ((N - 1) * F * G + (1 - F) * (1 - G))
///
/// L reaches its minimum of 1 when F = G = 1/N. The loss nudges the router
/// towards the target ratio N; it does not enforce it.

use crate::routing::ChunkDecision;
use crate::tensor::SeqLayout;

/// Forward quantities of the ratio loss for one stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RatioLoss {
    pub loss: f32,
    pub boundary_fraction: f32,
    pub mean_prob: f32,
    /// Number of valid positions the means were taken over.
    pub count: usize,
}

pub fn ratio_loss_forward(
    p: &[f32],
    decisions: &[ChunkDecision],
    layout: &SeqLayout,
    target_ratio: f32,
) -> RatioLoss {
    debug_assert!(target_ratio > 1.0);
    let s = layout.seq_len;
    let mut count = 0usize;
    let mut boundaries = 0usize;
    let mut prob_sum = 0.0f32;
    for b in 0..layout.batch {
        for t in 0..layout.valid_len[b] {
            let i = b * s + t;
            count += 1;
            boundaries += decisions[i].indicator();
            prob_sum += p[i];
        }
    }
    if count == 0 {
        return RatioLoss { loss: 0.0, boundary_fraction: 0.0, mean_prob: 0.0, count };
    }
    let n = target_ratio;
    let f = boundaries as f32 / count as f32;
    let g = prob_sum / count as f32;
    let loss = n / (n - 1.0) * ((n - 1.0) * f * g + (1.0 - f) * (1.0 - g));
    RatioLoss { loss, boundary_fraction: f, mean_prob: g, count }
}

/// d(weight * L)/dp, [batch, seq_len]. Zero at padding positions.
pub fn ratio_loss_backward(
    forward: &RatioLoss,
    layout: &SeqLayout,
    target_ratio: f32,
    weight: f32,
) -> Vec<f32> {
    let mut d_p = vec![0.0f32; layout.rows()];
    if forward.count == 0 || weight == 0.0 {
        return d_p;
    }
    let n = target_ratio;
    let f = forward.boundary_fraction;
    let d_g = n / (n - 1.0) * ((n - 1.0) * f - (1.0 - f));
    let per_position = weight * d_g / forward.count as f32;
    for b in 0..layout.batch {
        for t in 0..layout.valid_len[b] {
            d_p[b * layout.seq_len + t] = per_position;
        }
    }
    d_p
}
