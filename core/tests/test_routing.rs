/// Router behaviour across a batch and the ratio loss that steers it.

use dyn_chunk_core::model::RouterParams;
use dyn_chunk_core::ratio_loss::{ratio_loss_backward, ratio_loss_forward};
use dyn_chunk_core::routing::{router_forward, routing_stats, ChunkDecision};
use dyn_chunk_core::tensor::SeqLayout;

/// Two topics per element: rows point along +e0 then flip to +e1.
fn two_topic_batch(seq_len: usize, switch_at: &[usize]) -> (Vec<f32>, SeqLayout) {
    let layout = SeqLayout::dense(switch_at.len(), seq_len, 2);
    let mut x = vec![0.0f32; layout.numel()];
    for (b, &k) in switch_at.iter().enumerate() {
        for t in 0..seq_len {
            let off = layout.offset(b, t);
            let scale = 1.0 + t as f32;
            if t < k {
                x[off] = scale;
            } else {
                x[off + 1] = scale;
            }
        }
    }
    (x, layout)
}

#[test]
fn test_boundaries_at_topic_switches() {
    let (x, layout) = two_topic_batch(6, &[3, 5]);
    let (out, _) = router_forward(&RouterParams::identity(2), &x, &layout);

    for (b, &k) in [3usize, 5].iter().enumerate() {
        for t in 0..6 {
            let expected = t == 0 || t == k;
            assert_eq!(
                out.decisions[b * 6 + t].is_boundary(),
                expected,
                "element {b} position {t}: p={}",
                out.p[b * 6 + t]
            );
        }
        assert_eq!(out.boundary_count(&layout, b), 2);
    }

    let stats = routing_stats(&out, &layout);
    assert_eq!(stats.positions, 12);
    assert_eq!(stats.chunks, 4);
    assert!((stats.compression_ratio - 3.0).abs() < 1e-6);
}

#[test]
fn test_router_scale_invariant() {
    let (x, layout) = two_topic_batch(5, &[2]);
    let scaled: Vec<f32> = x.iter().map(|v| v * 10.0).collect();
    let params = RouterParams::init(2, 5);
    let (a, _) = router_forward(&params, &x, &layout);
    let (b, _) = router_forward(&params, &scaled, &layout);
    for (pa, pb) in a.p.iter().zip(b.p.iter()) {
        assert!((pa - pb).abs() < 1e-5, "{pa} vs {pb}");
    }
}

#[test]
fn test_ratio_loss_prefers_target_compression() {
    // Same probabilities, two routings: one at the target ratio, one far from it.
    let layout = SeqLayout::dense(1, 6, 1);
    let p = [1.0, 0.1, 0.1, 0.9, 0.1, 0.1f32];
    let on_target = [
        ChunkDecision::Boundary,
        ChunkDecision::Continuation,
        ChunkDecision::Continuation,
        ChunkDecision::Boundary,
        ChunkDecision::Continuation,
        ChunkDecision::Continuation,
    ];
    let all = [ChunkDecision::Boundary; 6];
    let at = ratio_loss_forward(&p, &on_target, &layout, 3.0);
    let over = ratio_loss_forward(&p, &all, &layout, 3.0);
    assert!(at.loss < over.loss, "{} vs {}", at.loss, over.loss);

    // F = 1 > 1/N: descending the gradient lowers every probability
    let d_p = ratio_loss_backward(&over, &layout, 3.0, 0.5);
    assert!(d_p.iter().all(|&g| g > 0.0));
}
