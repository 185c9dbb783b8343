/// Multi-stage composition of the chunking pipeline.
///
/// Compression runs stage 0 → N-1: widen with the stage pad, encode, route,
/// downsample. The inner model runs on the most compressed sequence. Then
/// decompression runs stage N-1 → 0: smooth, upsample, add the skip
/// projection of the encoder output, decode, narrow back to the entry width.
///
/// Every per-stage intermediate lives in an explicit `Vec<StageRecord>` built
/// during compression and consumed in reverse. Nothing is shared between
/// calls: a `ChunkingTrace` belongs to the forward call that produced it and is
/// consumed by the matching `backward`.

use tracing::{debug, info, warn};

use crate::downsample::{downsample_backward, downsample_forward, DownsampleCache};
use crate::error::{check_len, ChunkError, ChunkResult};
use crate::model::{ChunkingConfig, ChunkingParams};
use crate::ratio_loss::{ratio_loss_backward, ratio_loss_forward, RatioLoss};
use crate::routing::{
    router_backward, router_forward, routing_stats, ChunkDecision, RouterCache, RouterOutput,
    RoutingStats,
};
use crate::smoothing::{smooth_backward, smooth_forward};
use crate::tensor::{
    add_assign_f32, extend_features, extend_features_backward, truncate_features,
    truncate_features_backward, zero_padding_rows, SeqLayout,
};
use crate::transform::{apply_backward, apply_forward, Identity, SequenceTransform};
use crate::upsample::{upsample_backward, upsample_forward, UpsampleCache};

/// The three external transforms one stage is built from.
pub struct Stage {
    pub encoder: Box<dyn SequenceTransform>,
    pub skip: Box<dyn SequenceTransform>,
    pub decoder: Box<dyn SequenceTransform>,
}

impl Stage {
    pub fn new(
        encoder: Box<dyn SequenceTransform>,
        skip: Box<dyn SequenceTransform>,
        decoder: Box<dyn SequenceTransform>,
    ) -> Self {
        Stage { encoder, skip, decoder }
    }

    /// Identity encoder, skip and decoder.
    pub fn passthrough() -> Self {
        Stage::new(Box::new(Identity), Box::new(Identity), Box::new(Identity))
    }
}

/// Compression-phase record of one stage.
#[derive(Debug)]
pub struct StageRecord {
    pub stage: usize,
    /// Layout of the sequence arriving at this stage, at its entry width.
    pub entry: SeqLayout,
    /// Same positions at the stage's working width.
    pub layout: SeqLayout,
    /// Encoder input (entry sequence with the stage pad appended).
    pub x_in: Vec<f32>,
    /// Encoder output.
    pub x_hat: Vec<f32>,
    pub routing: RouterOutput,
    router_cache: RouterCache,
    downsample: DownsampleCache,
    /// Boundary probabilities of the selected chunks: [batch, max_chunks].
    pub chunk_probs: Vec<f32>,
    /// Layout of the compressed sequence handed to the next level.
    pub chunks: SeqLayout,
    pub ratio: RatioLoss,
    pub stats: RoutingStats,
}

impl StageRecord {
    pub fn p(&self) -> &[f32] {
        &self.routing.p
    }

    pub fn decisions(&self) -> &[ChunkDecision] {
        &self.routing.decisions
    }

    /// Per-element chunk counts.
    pub fn valid_len(&self) -> &[usize] {
        &self.chunks.valid_len
    }

    /// Padded length of the sequence this stage compressed.
    pub fn original_len(&self) -> usize {
        self.entry.seq_len
    }

    /// Feature width of the sequence this stage received.
    pub fn original_dim(&self) -> usize {
        self.entry.d
    }
}

/// Decompression-phase intermediates of one stage.
#[derive(Debug)]
struct DecompressionRecord {
    /// Output of the level below (ẑ), laid out by the stage's `chunks`.
    z_hat: Vec<f32>,
    /// Smoothed chunk latents z̄.
    z_bar: Vec<f32>,
    upsample: UpsampleCache,
    /// Decoder input: upsampled latents plus skip projection.
    decoder_in: Vec<f32>,
}

/// Inner-model hand-off.
#[derive(Debug)]
struct InnerRecord {
    /// Compressed layout at the width the last stage produced.
    entry: SeqLayout,
    /// Same positions at the inner width.
    layout: SeqLayout,
    input: Vec<f32>,
}

/// Everything one forward pass produced, in stage order.
#[derive(Debug)]
pub struct ChunkingTrace {
    input: SeqLayout,
    output: Vec<f32>,
    records: Vec<StageRecord>,
    decompression: Vec<DecompressionRecord>,
    inner: InnerRecord,
}

impl ChunkingTrace {
    /// Final output, [batch, seq_len, stage_dims[0]], padding rows zero.
    pub fn output(&self) -> &[f32] {
        &self.output
    }

    pub fn into_output(self) -> Vec<f32> {
        self.output
    }

    pub fn layout(&self) -> &SeqLayout {
        &self.input
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    /// Layout of the sequence the inner model saw.
    pub fn inner_layout(&self) -> &SeqLayout {
        &self.inner.layout
    }

    /// Sum of the per-stage ratio losses (unweighted).
    pub fn ratio_loss(&self) -> f32 {
        self.records.iter().map(|r| r.ratio.loss).sum()
    }

    pub fn stats(&self) -> Vec<RoutingStats> {
        self.records.iter().map(|r| r.stats.clone()).collect()
    }
}

/// Gradients of one backward pass.
#[derive(Debug)]
pub struct ChunkingGrads {
    /// Same structure as `ChunkingParams`: router projections and pads.
    pub params: ChunkingParams,
    /// Gradient w.r.t. the pipeline input, padding rows zero.
    pub d_x: Vec<f32>,
}

/// The N-stage chunking pipeline wrapped around an inner model.
pub struct StageCompositor {
    config: ChunkingConfig,
    stages: Vec<Stage>,
    inner: Box<dyn SequenceTransform>,
}

impl StageCompositor {
    pub fn new(
        config: ChunkingConfig,
        stages: Vec<Stage>,
        inner: Box<dyn SequenceTransform>,
    ) -> ChunkResult<Self> {
        config.validate()?;
        if stages.len() != config.num_stages() {
            return Err(ChunkError::config(format!(
                "{} stages supplied for a {}-stage configuration",
                stages.len(),
                config.num_stages()
            )));
        }
        Ok(StageCompositor { config, stages, inner })
    }

    /// Every stage and the inner model are identity transforms.
    pub fn passthrough(config: ChunkingConfig) -> ChunkResult<Self> {
        let stages = (0..config.num_stages()).map(|_| Stage::passthrough()).collect();
        StageCompositor::new(config, stages, Box::new(Identity))
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Run the full pipeline and keep every intermediate for `backward`.
    ///
    /// `x`: [batch, seq_len, stage_dims[0]] described by `layout`. Content of
    /// padding rows is ignored.
    pub fn forward(
        &self,
        params: &ChunkingParams,
        x: &[f32],
        layout: &SeqLayout,
    ) -> ChunkResult<ChunkingTrace> {
        params.check_against(&self.config)?;
        let d0 = self.config.stage_dims[0];
        if layout.d != d0
            || layout.valid_len.len() != layout.batch
            || layout.valid_len.iter().any(|&v| v > layout.seq_len)
        {
            warn!(expected_d = d0, d = layout.d, seq_len = layout.seq_len,
                  valid_len = ?layout.valid_len, "pipeline input layout rejected");
            return Err(ChunkError::ShapeMismatch {
                component: "pipeline input".into(),
                expected: vec![layout.batch, layout.seq_len, d0],
                actual: layout.shape().to_vec(),
            });
        }
        check_len("pipeline input", x, &layout.shape())?;

        let n = self.num_stages();
        let mut records: Vec<StageRecord> = Vec::with_capacity(n);
        let mut cur = x.to_vec();
        let mut cur_layout = layout.clone();

        for (s, stage) in self.stages.iter().enumerate() {
            let d_s = self.config.stage_dims[s];
            let entry = cur_layout;
            let stage_layout = entry.with_dim(d_s);

            let x_in = extend_features(&cur, &entry, params.pad_for(s));
            let x_hat = apply_forward(
                stage.encoder.as_ref(),
                &format!("stage {s} encoder"),
                &x_in,
                &stage_layout,
            )?;

            let (routing, router_cache) =
                router_forward(&params.stages[s].router, &x_hat, &stage_layout);
            let stats = routing_stats(&routing, &stage_layout);
            let ratio = ratio_loss_forward(
                &routing.p,
                &routing.decisions,
                &stage_layout,
                self.config.target_ratios[s],
            );
            debug!(
                stage = s,
                positions = stats.positions,
                chunks = stats.chunks,
                compression_ratio = stats.compression_ratio,
                mean_prob = stats.mean_prob,
                ratio_loss = ratio.loss,
                "stage routed"
            );

            let (compressed, downsample) =
                downsample_forward(&x_hat, &routing.p, &routing.decisions, &stage_layout, s)?;

            cur = compressed.values;
            cur_layout = compressed.layout.clone();
            records.push(StageRecord {
                stage: s,
                entry,
                layout: stage_layout,
                x_in,
                x_hat,
                routing,
                router_cache,
                downsample,
                chunk_probs: compressed.probs,
                chunks: compressed.layout,
                ratio,
                stats,
            });
        }

        // Inner model at the deepest width.
        let d_inner = self.config.stage_dims[n];
        let inner_entry = cur_layout;
        let inner_layout = inner_entry.with_dim(d_inner);
        let inner_in = extend_features(&cur, &inner_entry, params.pad_for(n));
        let inner_out = apply_forward(self.inner.as_ref(), "inner model", &inner_in, &inner_layout)?;
        let mut y = truncate_features(&inner_out, inner_layout.rows(), d_inner, inner_entry.d);

        let mut decompression: Vec<DecompressionRecord> = Vec::with_capacity(n);
        for (s, stage) in self.stages.iter().enumerate().rev() {
            let rec = &records[s];
            let z_hat = y;
            let z_bar = smooth_forward(&z_hat, &rec.chunk_probs, &rec.chunks);
            let (mut decoder_in, upsample) = upsample_forward(
                &z_bar,
                &rec.chunks,
                &rec.routing.p,
                &rec.routing.decisions,
                &rec.layout,
                s,
            )?;
            let skip_out = apply_forward(
                stage.skip.as_ref(),
                &format!("stage {s} skip"),
                &rec.x_hat,
                &rec.layout,
            )?;
            add_assign_f32(&mut decoder_in, &skip_out);

            let dec_out = apply_forward(
                stage.decoder.as_ref(),
                &format!("stage {s} decoder"),
                &decoder_in,
                &rec.layout,
            )?;
            y = truncate_features(&dec_out, rec.layout.rows(), rec.layout.d, rec.entry.d);
            decompression.push(DecompressionRecord { z_hat, z_bar, upsample, decoder_in });
        }
        decompression.reverse();

        zero_padding_rows(&mut y, layout);
        info!(
            stages = n,
            batch = layout.batch,
            seq_len = layout.seq_len,
            inner_len = inner_layout.seq_len,
            "chunking forward complete"
        );

        Ok(ChunkingTrace {
            input: layout.clone(),
            output: y,
            records,
            decompression,
            inner: InnerRecord { entry: inner_entry, layout: inner_layout, input: inner_in },
        })
    }

    /// Forward without keeping intermediates.
    pub fn run(&self, params: &ChunkingParams, x: &[f32], layout: &SeqLayout) -> ChunkResult<Vec<f32>> {
        Ok(self.forward(params, x, layout)?.into_output())
    }

    /// Backward through the whole pipeline given d(loss)/d(output).
    ///
    /// Adds the weighted ratio-loss gradient at every stage when
    /// `ratio_loss_weight > 0`. Consumes the trace.
    pub fn backward(
        &self,
        params: &ChunkingParams,
        trace: ChunkingTrace,
        d_out: &[f32],
    ) -> ChunkResult<ChunkingGrads> {
        check_len("output gradient", d_out, &trace.input.shape())?;
        let n = self.num_stages();
        let mut grads = ChunkingParams::zeros_like(&self.config);

        let mut g = d_out.to_vec();
        zero_padding_rows(&mut g, &trace.input);

        // Decompression adjoint, outermost stage first.
        let mut d_x_hat: Vec<Vec<f32>> = Vec::with_capacity(n);
        let mut d_p: Vec<Vec<f32>> = Vec::with_capacity(n);
        let mut d_chunk_probs: Vec<Vec<f32>> = Vec::with_capacity(n);
        for (s, stage) in self.stages.iter().enumerate() {
            let rec = &trace.records[s];
            let dec = &trace.decompression[s];
            let rows = rec.layout.rows();

            let d_dec_out = truncate_features_backward(&g, rows, rec.layout.d, rec.entry.d);
            let d_h = apply_backward(
                stage.decoder.as_ref(),
                &format!("stage {s} decoder"),
                &dec.decoder_in,
                &d_dec_out,
                &rec.layout,
            )?;
            let d_skip_in = apply_backward(
                stage.skip.as_ref(),
                &format!("stage {s} skip"),
                &rec.x_hat,
                &d_h,
                &rec.layout,
            )?;
            let (d_z_bar, d_p_up) = upsample_backward(&dec.upsample, &d_h, &rec.chunks, &rec.layout);
            let (d_z_hat, d_probs) =
                smooth_backward(&dec.z_hat, &rec.chunk_probs, &dec.z_bar, &d_z_bar, &rec.chunks);

            d_x_hat.push(d_skip_in);
            d_p.push(d_p_up);
            d_chunk_probs.push(d_probs);
            g = d_z_hat;
        }

        // Inner model.
        let inner = &trace.inner;
        let d_inner_out =
            truncate_features_backward(&g, inner.layout.rows(), inner.layout.d, inner.entry.d);
        let d_inner_in = apply_backward(
            self.inner.as_ref(),
            "inner model",
            &inner.input,
            &d_inner_out,
            &inner.layout,
        )?;
        let (d_compressed, d_pad) =
            extend_features_backward(&d_inner_in, &inner.entry, self.config.pad_width(n));
        grads.inner_pad = d_pad;
        g = d_compressed;

        // Compression adjoint, innermost stage first.
        for (s, stage) in self.stages.iter().enumerate().rev() {
            let rec = &trace.records[s];
            let (d_x_down, d_p_down) = downsample_backward(&g, &d_chunk_probs[s], &rec.downsample);
            add_assign_f32(&mut d_x_hat[s], &d_x_down);
            add_assign_f32(&mut d_p[s], &d_p_down);
            if self.config.ratio_loss_weight > 0.0 {
                let d_p_ratio = ratio_loss_backward(
                    &rec.ratio,
                    &rec.layout,
                    self.config.target_ratios[s],
                    self.config.ratio_loss_weight,
                );
                add_assign_f32(&mut d_p[s], &d_p_ratio);
            }

            let (router_grads, d_x_router) = router_backward(
                &params.stages[s].router,
                &rec.x_hat,
                &rec.router_cache,
                &d_p[s],
                &rec.layout,
            );
            add_assign_f32(&mut d_x_hat[s], &d_x_router);
            grads.stages[s].router = router_grads;

            let d_x_in = apply_backward(
                stage.encoder.as_ref(),
                &format!("stage {s} encoder"),
                &rec.x_in,
                &d_x_hat[s],
                &rec.layout,
            )?;
            let (d_entry, d_pad) = extend_features_backward(&d_x_in, &rec.entry, self.config.pad_width(s));
            grads.stages[s].pad = d_pad;
            g = d_entry;
        }

        zero_padding_rows(&mut g, &trace.input);
        debug!(stages = n, "chunking backward complete");
        Ok(ChunkingGrads { params: grads, d_x: g })
    }
}
