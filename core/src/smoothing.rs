/// Chunk-probability-gated EMA over compressed latents.
///
/// Per batch element, over valid chunks only:
///   z̄_0 = ẑ_0
///   z̄_t = P_t * ẑ_t + (1 - P_t) * z̄_{t-1}
///
/// The mixing weight is the router's own boundary probability, so the loss
/// reaches the routing decision through P. Padding chunks produce zero rows
/// and receive zero gradient.
///
/// Backward: reverse chunk loop with a carried adjoint
///   g_t      = d_z̄_t + (1 - P_{t+1}) * g_{t+1}
///   d_ẑ_t    = P_t * g_t           (t > 0),   d_ẑ_0 = g_0
///   d_P_t    = <g_t, ẑ_t - z̄_{t-1}> (t > 0), d_P_0 = 0

use crate::tensor::SeqLayout;

/// EMA forward. `z`: [batch, chunks, d], `probs`: [batch, chunks].
/// Returns z̄ with the same shape; rows past each valid length are zero.
pub fn smooth_forward(z: &[f32], probs: &[f32], layout: &SeqLayout) -> Vec<f32> {
    let d = layout.d;
    let s = layout.seq_len;
    debug_assert_eq!(z.len(), layout.numel());
    debug_assert_eq!(probs.len(), layout.rows());

    let mut z_bar = vec![0.0f32; layout.numel()];
    for b in 0..layout.batch {
        let valid = layout.valid_len[b];
        if valid == 0 {
            continue;
        }
        let first = layout.offset(b, 0);
        z_bar[first..first + d].copy_from_slice(&z[first..first + d]);
        for t in 1..valid {
            let cur = layout.offset(b, t);
            let prev = cur - d;
            let p_t = probs[b * s + t];
            for c in 0..d {
                z_bar[cur + c] = p_t * z[cur + c] + (1.0 - p_t) * z_bar[prev + c];
            }
        }
    }
    z_bar
}

/// EMA backward. Returns (d_z [batch, chunks, d], d_probs [batch, chunks]).
pub fn smooth_backward(
    z: &[f32],
    probs: &[f32],
    z_bar: &[f32],
    d_z_bar: &[f32],
    layout: &SeqLayout,
) -> (Vec<f32>, Vec<f32>) {
    let d = layout.d;
    let s = layout.seq_len;
    debug_assert_eq!(z_bar.len(), layout.numel());
    debug_assert_eq!(d_z_bar.len(), layout.numel());

    let mut d_z = vec![0.0f32; layout.numel()];
    let mut d_probs = vec![0.0f32; layout.rows()];
    let mut carry = vec![0.0f32; d];
    let mut g = vec![0.0f32; d];

    for b in 0..layout.batch {
        carry.fill(0.0);
        for t in (0..layout.valid_len[b]).rev() {
            let cur = layout.offset(b, t);
            for c in 0..d {
                g[c] = d_z_bar[cur + c] + carry[c];
            }
            if t == 0 {
                d_z[cur..cur + d].copy_from_slice(&g);
                break;
            }
            let prev = cur - d;
            let p_t = probs[b * s + t];
            let mut dp = 0.0f32;
            for c in 0..d {
                d_z[cur + c] = p_t * g[c];
                dp += g[c] * (z[cur + c] - z_bar[prev + c]);
                carry[c] = (1.0 - p_t) * g[c];
            }
            d_probs[b * s + t] = dp;
        }
    }
    (d_z, d_probs)
}
