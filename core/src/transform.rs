/// Shape-preserving sequence transforms: the single capability the chunking
/// core requires of encoders, decoders, skip projections, and the inner model.
///
/// Contract: `[batch, seq_len, d] → [batch, seq_len, d]`, differentiable with
/// respect to the input. The core assumes nothing else. Implementations see the
/// full `SeqLayout`, including per-element valid lengths, so position-mixing
/// implementations can mask padding themselves. The core zeroes padding rows
/// of whatever comes back, in both directions.

use tracing::warn;

use crate::error::{ChunkError, ChunkResult};
use crate::tensor::{matmul_f32, transpose_f32, zero_padding_rows, SeqLayout, SimpleRng};

pub trait SequenceTransform {
    /// Human-readable name used in fault reports.
    fn name(&self) -> &str;

    /// Forward over a padded batch. Must return `layout.numel()` values.
    ///
    /// A transform that cannot handle `layout` (wrong width, wrong input
    /// length) returns a buffer of any other length. `apply_forward` and
    /// `apply_backward` turn that into `ChunkError::ShapeMismatch` naming the
    /// transform and its role.
    fn forward(&self, x: &[f32], layout: &SeqLayout) -> Vec<f32>;

    /// Input gradient given the forward input and the output gradient.
    /// Must return `layout.numel()` values.
    fn backward(&self, x: &[f32], d_y: &[f32], layout: &SeqLayout) -> Vec<f32>;
}

fn checked(
    transform: &dyn SequenceTransform,
    role: &str,
    direction: &str,
    mut out: Vec<f32>,
    layout: &SeqLayout,
) -> ChunkResult<Vec<f32>> {
    if out.len() != layout.numel() {
        warn!(role, transform = transform.name(), direction, expected = layout.numel(),
              actual = out.len(), "transform broke the shape contract");
        return Err(ChunkError::ShapeMismatch {
            component: format!("{role} `{}` {direction}", transform.name()),
            expected: layout.shape().to_vec(),
            actual: vec![out.len()],
        });
    }
    zero_padding_rows(&mut out, layout);
    Ok(out)
}

/// Run `transform.forward`, rejecting shape violations and zeroing padding rows.
pub fn apply_forward(
    transform: &dyn SequenceTransform,
    role: &str,
    x: &[f32],
    layout: &SeqLayout,
) -> ChunkResult<Vec<f32>> {
    let out = transform.forward(x, layout);
    checked(transform, role, "forward", out, layout)
}

/// Run `transform.backward`, rejecting shape violations and zeroing padding rows.
pub fn apply_backward(
    transform: &dyn SequenceTransform,
    role: &str,
    x: &[f32],
    d_y: &[f32],
    layout: &SeqLayout,
) -> ChunkResult<Vec<f32>> {
    let d_x = transform.backward(x, d_y, layout);
    checked(transform, role, "backward", d_x, layout)
}

/// y = x.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl SequenceTransform for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn forward(&self, x: &[f32], _layout: &SeqLayout) -> Vec<f32> {
        x.to_vec()
    }

    fn backward(&self, _x: &[f32], d_y: &[f32], _layout: &SeqLayout) -> Vec<f32> {
        d_y.to_vec()
    }
}

/// Per-position linear map y_t = x_t @ W^T, W: [d, d]. No cross-position mixing.
#[derive(Clone, Debug)]
pub struct Linear {
    pub d: usize,
    pub w: Vec<f32>,
}

impl Linear {
    pub fn new(d: usize, seed: u64) -> Self {
        let mut rng = SimpleRng::new(seed);
        let mut w = vec![0.0f32; d * d];
        rng.fill_uniform(&mut w, (3.0 / d as f32).sqrt());
        Linear { d, w }
    }

    /// W = scale * I.
    pub fn scaled_identity(d: usize, scale: f32) -> Self {
        let mut w = vec![0.0f32; d * d];
        for i in 0..d {
            w[i * d + i] = scale;
        }
        Linear { d, w }
    }
}

impl SequenceTransform for Linear {
    fn name(&self) -> &str {
        "linear"
    }

    fn forward(&self, x: &[f32], layout: &SeqLayout) -> Vec<f32> {
        let d = self.d;
        if layout.d != d || x.len() != layout.numel() {
            // Unsupported layout: empty output, rejected by apply_forward.
            return Vec::new();
        }
        let mut w_t = vec![0.0f32; d * d];
        transpose_f32(&self.w, &mut w_t, d, d);
        let mut y = vec![0.0f32; layout.numel()];
        matmul_f32(x, &w_t, &mut y, layout.rows(), d, d);
        y
    }

    fn backward(&self, _x: &[f32], d_y: &[f32], layout: &SeqLayout) -> Vec<f32> {
        let d = self.d;
        if layout.d != d || d_y.len() != layout.numel() {
            // Unsupported layout: empty output, rejected by apply_backward.
            return Vec::new();
        }
        // dX = dY @ W
        let mut d_x = vec![0.0f32; layout.numel()];
        matmul_f32(d_y, &self.w, &mut d_x, layout.rows(), d, d);
        d_x
    }
}
