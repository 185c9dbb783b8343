/// Gradient orchestration and verification.
///
/// Provides:
/// - `probe_loss`: scalar loss of one forward pass against a fixed probe
/// - `compute_gradients`: forward + backward for that loss
/// - `central_difference` / `check_gradient`: finite-difference verification
///
/// Routing decisions are discrete, so a perturbation that flips one makes the
/// loss jump. Loss closures return `None` for such perturbations and the
/// checker skips them instead of reporting a bogus mismatch.

use crate::compositor::{ChunkingGrads, ChunkingTrace, StageCompositor};
use crate::error::{check_len, ChunkResult};
use crate::model::ChunkingParams;
use crate::tensor::{dot_f32, SeqLayout};

/// Gradients where both analytical and numerical magnitudes are below this are
/// under FD resolution at f32 precision and pass automatically.
pub const ABS_THRESHOLD: f32 = 5e-4;

/// loss = <output, probe> + ratio_loss_weight * Σ_s ratio_loss_s
///
/// Returns the loss and the trace it was computed from.
pub fn probe_loss(
    compositor: &StageCompositor,
    params: &ChunkingParams,
    x: &[f32],
    layout: &SeqLayout,
    probe: &[f32],
) -> ChunkResult<(f32, ChunkingTrace)> {
    check_len("probe", probe, &layout.shape())?;
    let trace = compositor.forward(params, x, layout)?;
    let loss = dot_f32(trace.output(), probe)
        + compositor.config().ratio_loss_weight * trace.ratio_loss();
    Ok((loss, trace))
}

/// Loss and gradients of `probe_loss`. This is the training entry point.
pub fn compute_gradients(
    compositor: &StageCompositor,
    params: &ChunkingParams,
    x: &[f32],
    layout: &SeqLayout,
    probe: &[f32],
) -> ChunkResult<(f32, ChunkingGrads)> {
    let (loss, trace) = probe_loss(compositor, params, x, layout, probe)?;
    let grads = compositor.backward(params, trace, probe)?;
    Ok((loss, grads))
}

/// (f(x + eps e_idx) - f(x - eps e_idx)) / (2 eps), or `None` if either side
/// is unavailable.
pub fn central_difference(
    f: impl Fn(&[f32]) -> Option<f32>,
    x: &[f32],
    idx: usize,
    eps: f32,
) -> Option<f32> {
    let mut probe = x.to_vec();
    let orig = probe[idx];
    probe[idx] = orig + eps;
    let plus = f(&probe)?;
    probe[idx] = orig - eps;
    let minus = f(&probe)?;
    Some((plus - minus) / (2.0 * eps))
}

/// Outcome of checking one gradient buffer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GradCheck {
    pub checked: usize,
    pub passed: usize,
    /// Perturbations that flipped a discrete decision.
    pub skipped: usize,
    pub max_rel_err: f32,
}

impl GradCheck {
    pub fn all_passed(&self) -> bool {
        self.passed == self.checked
    }
}

/// Compare `analytical` against central differences of `f` at up to
/// `num_samples` evenly strided indices of `x`.
///
/// Uses relative error with denominator max(|a|, |b|); pairs below
/// `ABS_THRESHOLD` pass.
pub fn check_gradient(
    name: &str,
    f: impl Fn(&[f32]) -> Option<f32>,
    x: &[f32],
    analytical: &[f32],
    num_samples: usize,
    eps: f32,
    tol: f32,
) -> GradCheck {
    debug_assert_eq!(x.len(), analytical.len());
    let n = x.len();
    let step = if n > num_samples { n / num_samples } else { 1 };
    let mut result = GradCheck::default();

    for idx in (0..n).step_by(step.max(1)).take(num_samples) {
        let Some(numerical) = central_difference(&f, x, idx, eps) else {
            result.skipped += 1;
            continue;
        };
        let a = analytical[idx];
        let denom = a.abs().max(numerical.abs());
        result.checked += 1;
        if denom < ABS_THRESHOLD {
            result.passed += 1;
            continue;
        }
        let rel_err = (a - numerical).abs() / denom;
        result.max_rel_err = result.max_rel_err.max(rel_err);
        if rel_err < tol {
            result.passed += 1;
        } else {
            eprintln!(
                "  FAIL {name}[{idx}]: analytical={a:.6e}, numerical={numerical:.6e}, \
                 rel_err={rel_err:.4e}"
            );
        }
    }
    result
}
