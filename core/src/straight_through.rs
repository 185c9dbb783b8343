/// Straight-through confidence scaling.
///
/// Forward:  y_r = c_r * z_r            (one scalar c per row r, z_r is a d-vector)
/// Backward: d_z_r = d_y_r              (the multiplier is treated as exactly 1)
///           d_c_r = <d_y_r, z_r>       (the confidence still sees its forward role)
///
/// The latent path is unattenuated by the confidence, while the confidence
/// (and through it the boundary probability) receives the gradient a plain
/// product would give it. This is not the gradient of the forward function;
/// it is the rule, and it lives here so the rule can be tested on its own.

/// Scale each `d`-wide row of `z` by its confidence `c[row]`.
pub fn ste_scale_forward(z: &[f32], c: &[f32], d: usize) -> Vec<f32> {
    debug_assert_eq!(z.len(), c.len() * d);
    let mut out = vec![0.0f32; z.len()];
    for (r, &cr) in c.iter().enumerate() {
        for j in 0..d {
            out[r * d + j] = cr * z[r * d + j];
        }
    }
    out
}

/// Straight-through backward. Returns (d_z, d_c).
pub fn ste_scale_backward(z: &[f32], d_out: &[f32], d: usize) -> (Vec<f32>, Vec<f32>) {
    debug_assert_eq!(z.len(), d_out.len());
    let rows = if d == 0 { 0 } else { z.len() / d };
    let d_z = d_out.to_vec();
    let mut d_c = vec![0.0f32; rows];
    for r in 0..rows {
        let mut acc = 0.0f32;
        for j in 0..d {
            acc += d_out[r * d + j] * z[r * d + j];
        }
        d_c[r] = acc;
    }
    (d_z, d_c)
}
