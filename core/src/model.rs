/// Chunking configuration and learnable parameters.
///
/// All weight matrices are flat Vec<f32> in row-major layout, stored as
/// [d_out, d_in] and applied as Y = X @ W^T.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChunkError, ChunkResult};
use crate::tensor::SimpleRng;

/// Stage configuration, immutable after construction.
///
/// `stage_dims` has one entry per stage plus one for the inner model:
/// `stage_dims[s]` is the working width of stage `s`, `stage_dims[N]` is the
/// width the inner model runs at. Widths never shrink with depth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub stage_dims: Vec<usize>,
    /// Target compression ratio per stage, used by the ratio loss. Each > 1.
    pub target_ratios: Vec<f32>,
    /// Weight of the ratio loss gradient in the backward pass. 0 disables it.
    pub ratio_loss_weight: f32,
}

impl ChunkingConfig {
    /// Single stage at a fixed width, no width growth.
    pub fn single_stage(d: usize, target_ratio: f32) -> Self {
        ChunkingConfig {
            stage_dims: vec![d, d],
            target_ratios: vec![target_ratio],
            ratio_loss_weight: 0.0,
        }
    }

    /// Tiny two-stage configuration for tests.
    pub fn test_config() -> Self {
        ChunkingConfig {
            stage_dims: vec![4, 6, 8],
            target_ratios: vec![2.0, 2.0],
            ratio_loss_weight: 0.03,
        }
    }

    /// Number of chunking stages N (the inner model sits below stage N-1).
    pub fn num_stages(&self) -> usize {
        self.stage_dims.len().saturating_sub(1)
    }

    /// Width of the sequence arriving at `level` (0..=N, N = inner model).
    pub fn entry_dim(&self, level: usize) -> usize {
        if level == 0 {
            self.stage_dims[0]
        } else {
            self.stage_dims[level - 1]
        }
    }

    /// Width of the learned pad appended on entry to `level`.
    pub fn pad_width(&self, level: usize) -> usize {
        self.stage_dims[level] - self.entry_dim(level)
    }

    pub fn validate(&self) -> ChunkResult<()> {
        if self.stage_dims.len() < 2 {
            return Err(ChunkError::config(
                "stage_dims needs at least one stage width and the inner model width",
            ));
        }
        if let Some(i) = self.stage_dims.iter().position(|&d| d == 0) {
            return Err(ChunkError::config(format!("stage_dims[{i}] must be non-zero")));
        }
        for (i, w) in self.stage_dims.windows(2).enumerate() {
            if w[1] < w[0] {
                return Err(ChunkError::config(format!(
                    "stage_dims must be non-decreasing: stage_dims[{}]={} < stage_dims[{i}]={}",
                    i + 1, w[1], w[0]
                )));
            }
        }
        if self.target_ratios.len() != self.num_stages() {
            return Err(ChunkError::config(format!(
                "target_ratios has {} entries, expected one per stage ({})",
                self.target_ratios.len(),
                self.num_stages()
            )));
        }
        for (i, &r) in self.target_ratios.iter().enumerate() {
            if !(r.is_finite() && r > 1.0) {
                return Err(ChunkError::config(format!("target_ratios[{i}]={r} must be > 1")));
            }
        }
        if !(self.ratio_loss_weight.is_finite() && self.ratio_loss_weight >= 0.0) {
            return Err(ChunkError::config(format!(
                "ratio_loss_weight={} must be finite and non-negative",
                self.ratio_loss_weight
            )));
        }
        Ok(())
    }
}

/// Router projections for one stage.
///
/// Layout (row-major):
///   w_q: [d, d]
///   w_k: [d, d]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouterParams {
    pub d: usize,
    pub w_q: Vec<f32>,
    pub w_k: Vec<f32>,
}

impl RouterParams {
    /// Both projections the identity: the router compares raw adjacent rows.
    pub fn identity(d: usize) -> Self {
        let mut eye = vec![0.0f32; d * d];
        for i in 0..d {
            eye[i * d + i] = 1.0;
        }
        RouterParams { d, w_q: eye.clone(), w_k: eye }
    }

    /// Xavier-uniform initialization.
    pub fn init(d: usize, seed: u64) -> Self {
        let mut rng = SimpleRng::new(seed);
        let scale = (6.0 / (d + d) as f32).sqrt();
        let mut w_q = vec![0.0f32; d * d];
        let mut w_k = vec![0.0f32; d * d];
        rng.fill_uniform(&mut w_q, scale);
        rng.fill_uniform(&mut w_k, scale);
        RouterParams { d, w_q, w_k }
    }

    /// Zero-initialized shadow for gradient accumulation.
    pub fn zeros(d: usize) -> Self {
        RouterParams { d, w_q: vec![0.0f32; d * d], w_k: vec![0.0f32; d * d] }
    }

    pub fn num_params(&self) -> usize {
        self.w_q.len() + self.w_k.len()
    }

    /// param -= lr * grad.
    pub fn apply_gradients(&mut self, grads: &RouterParams, lr: f32) {
        for (w, g) in self.w_q.iter_mut().zip(grads.w_q.iter()) {
            *w -= lr * g;
        }
        for (w, g) in self.w_k.iter_mut().zip(grads.w_k.iter()) {
            *w -= lr * g;
        }
    }
}

/// Learnable parameters owned by one stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageParams {
    pub router: RouterParams,
    /// Appended to every valid row on entry to this stage: [pad_width(s)]
    pub pad: Vec<f32>,
}

/// All learnable parameters of the chunking core (external transforms excluded).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkingParams {
    pub stages: Vec<StageParams>,
    /// Appended on entry to the inner model: [pad_width(N)]
    pub inner_pad: Vec<f32>,
}

impl ChunkingParams {
    /// Identity routers and zero pads.
    pub fn init(cfg: &ChunkingConfig) -> Self {
        let stages = (0..cfg.num_stages())
            .map(|s| StageParams {
                router: RouterParams::identity(cfg.stage_dims[s]),
                pad: vec![0.0f32; cfg.pad_width(s)],
            })
            .collect();
        ChunkingParams { stages, inner_pad: vec![0.0f32; cfg.pad_width(cfg.num_stages())] }
    }

    /// Random routers and small random pads, for exercising every gradient path.
    pub fn init_random(cfg: &ChunkingConfig, seed: u64) -> Self {
        let mut rng = SimpleRng::new(seed);
        let stages = (0..cfg.num_stages())
            .map(|s| {
                let mut pad = vec![0.0f32; cfg.pad_width(s)];
                rng.fill_uniform(&mut pad, 0.1);
                StageParams {
                    router: RouterParams::init(cfg.stage_dims[s], rng.next_u64()),
                    pad,
                }
            })
            .collect();
        let mut inner_pad = vec![0.0f32; cfg.pad_width(cfg.num_stages())];
        rng.fill_uniform(&mut inner_pad, 0.1);
        ChunkingParams { stages, inner_pad }
    }

    /// Zero-initialized shadow for gradient accumulation.
    pub fn zeros_like(cfg: &ChunkingConfig) -> Self {
        let stages = (0..cfg.num_stages())
            .map(|s| StageParams {
                router: RouterParams::zeros(cfg.stage_dims[s]),
                pad: vec![0.0f32; cfg.pad_width(s)],
            })
            .collect();
        ChunkingParams { stages, inner_pad: vec![0.0f32; cfg.pad_width(cfg.num_stages())] }
    }

    /// Pad vector appended on entry to `level` (N = inner model).
    pub fn pad_for(&self, level: usize) -> &[f32] {
        if level < self.stages.len() {
            &self.stages[level].pad
        } else {
            &self.inner_pad
        }
    }

    pub fn num_params(&self) -> usize {
        self.stages.iter().map(|s| s.router.num_params() + s.pad.len()).sum::<usize>()
            + self.inner_pad.len()
    }

    /// param -= lr * grad for every router and pad.
    pub fn apply_gradients(&mut self, grads: &ChunkingParams, lr: f32) {
        for (p, g) in self.stages.iter_mut().zip(grads.stages.iter()) {
            p.router.apply_gradients(&g.router, lr);
            for (w, dw) in p.pad.iter_mut().zip(g.pad.iter()) {
                *w -= lr * dw;
            }
        }
        for (w, dw) in self.inner_pad.iter_mut().zip(grads.inner_pad.iter()) {
            *w -= lr * dw;
        }
    }

    /// Verify every buffer matches the widths `cfg` implies.
    pub fn check_against(&self, cfg: &ChunkingConfig) -> ChunkResult<()> {
        let n = cfg.num_stages();
        if self.stages.len() != n {
            return Err(ChunkError::config(format!(
                "params hold {} stages, config expects {n}",
                self.stages.len()
            )));
        }
        for (s, st) in self.stages.iter().enumerate() {
            let d = cfg.stage_dims[s];
            if st.router.d != d || st.router.w_q.len() != d * d || st.router.w_k.len() != d * d {
                return Err(ChunkError::config(format!(
                    "stage {s} router does not match width {d}"
                )));
            }
            if st.pad.len() != cfg.pad_width(s) {
                return Err(ChunkError::config(format!(
                    "stage {s} pad has {} entries, expected {}",
                    st.pad.len(),
                    cfg.pad_width(s)
                )));
            }
        }
        if self.inner_pad.len() != cfg.pad_width(n) {
            return Err(ChunkError::config(format!(
                "inner pad has {} entries, expected {}",
                self.inner_pad.len(),
                cfg.pad_width(n)
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct ParamCheckpoint {
    config: ChunkingConfig,
    params: ChunkingParams,
}

/// Write config + params as JSON.
pub fn save_checkpoint(path: &Path, params: &ChunkingParams, config: &ChunkingConfig) -> ChunkResult<()> {
    let checkpoint = ParamCheckpoint { config: config.clone(), params: params.clone() };
    let json = serde_json::to_string(&checkpoint)?;
    std::fs::write(path, json)?;
    debug!(path = %path.display(), params = params.num_params(), "saved chunking checkpoint");
    Ok(())
}

/// Read a checkpoint written by `save_checkpoint`, validating it on the way in.
pub fn load_checkpoint(path: &Path) -> ChunkResult<(ChunkingParams, ChunkingConfig)> {
    let json = std::fs::read_to_string(path)?;
    let checkpoint: ParamCheckpoint = serde_json::from_str(&json)?;
    checkpoint.config.validate()?;
    checkpoint.params.check_against(&checkpoint.config)?;
    Ok((checkpoint.params, checkpoint.config))
}
