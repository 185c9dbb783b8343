/// Flat tensor utilities for the chunking pipeline.
///
/// Every sequence buffer is a row-major `[batch, seq_len, d]` f32 slice. The
/// shape travels beside the buffer as a `SeqLayout`, which also carries the
/// per-batch-element valid length so ragged sequences padded to a common
/// `seq_len` are never confused with real data.

use serde::{Deserialize, Serialize};

/// Shape of a padded batch of sequences plus the real length of each element.
///
/// Rows `t >= valid_len[b]` of batch element `b` are padding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqLayout {
    pub batch: usize,
    pub seq_len: usize,
    pub d: usize,
    pub valid_len: Vec<usize>,
}

impl SeqLayout {
    /// Unpadded layout: every batch element uses all `seq_len` positions.
    pub fn dense(batch: usize, seq_len: usize, d: usize) -> Self {
        SeqLayout { batch, seq_len, d, valid_len: vec![seq_len; batch] }
    }

    /// Padded layout with explicit per-element lengths.
    pub fn ragged(seq_len: usize, d: usize, valid_len: Vec<usize>) -> Self {
        debug_assert!(valid_len.iter().all(|&n| n <= seq_len));
        SeqLayout { batch: valid_len.len(), seq_len, d, valid_len }
    }

    /// Same positions, different feature width.
    pub fn with_dim(&self, d: usize) -> Self {
        SeqLayout { d, ..self.clone() }
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.batch, self.seq_len, self.d]
    }

    /// Number of rows (batch * seq_len), padding included.
    pub fn rows(&self) -> usize {
        self.batch * self.seq_len
    }

    pub fn numel(&self) -> usize {
        self.batch * self.seq_len * self.d
    }

    /// Flat offset of row (b, t).
    #[inline]
    pub fn offset(&self, b: usize, t: usize) -> usize {
        (b * self.seq_len + t) * self.d
    }

    #[inline]
    pub fn is_valid(&self, b: usize, t: usize) -> bool {
        t < self.valid_len[b]
    }

    /// Total number of real (non-padding) rows.
    pub fn valid_rows(&self) -> usize {
        self.valid_len.iter().sum()
    }
}

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

/// Matrix multiply with accumulation: C[M,N] += A[M,K] @ B[K,N].
pub fn matmul_acc_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] += sum;
        }
    }
}

/// Transpose A[M,K] → out[K,M].
pub fn transpose_f32(a: &[f32], out: &mut [f32], m: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(out.len(), k * m);

    for i in 0..m {
        for j in 0..k {
            out[j * m + i] = a[i * k + j];
        }
    }
}

/// Dot product of two equal-length vectors.
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm of a vector: sqrt(sum(a[i]^2)).
pub fn vec_norm_f32(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Element-wise accumulate: acc[i] += a[i].
pub fn add_assign_f32(acc: &mut [f32], a: &[f32]) {
    debug_assert_eq!(acc.len(), a.len());
    for (x, y) in acc.iter_mut().zip(a.iter()) {
        *x += y;
    }
}

/// Zero every padding row of `buf` in place.
pub fn zero_padding_rows(buf: &mut [f32], layout: &SeqLayout) {
    debug_assert_eq!(buf.len(), layout.numel());
    let d = layout.d;
    for b in 0..layout.batch {
        for t in layout.valid_len[b]..layout.seq_len {
            let off = layout.offset(b, t);
            buf[off..off + d].fill(0.0);
        }
    }
}

/// Widen every valid row from `layout.d` to `layout.d + pad.len()` by appending
/// `pad`. Padding rows stay all-zero.
///
/// Returns the widened buffer `[batch, seq_len, layout.d + pad.len()]`.
pub fn extend_features(x: &[f32], layout: &SeqLayout, pad: &[f32]) -> Vec<f32> {
    debug_assert_eq!(x.len(), layout.numel());
    let d_in = layout.d;
    let d_out = d_in + pad.len();
    let mut out = vec![0.0f32; layout.rows() * d_out];
    for b in 0..layout.batch {
        for t in 0..layout.valid_len[b] {
            let src = layout.offset(b, t);
            let dst = (b * layout.seq_len + t) * d_out;
            out[dst..dst + d_in].copy_from_slice(&x[src..src + d_in]);
            out[dst + d_in..dst + d_out].copy_from_slice(pad);
        }
    }
    out
}

/// Keep the first `d_out` features of each row: [rows, d_in] → [rows, d_out].
pub fn truncate_features(x: &[f32], rows: usize, d_in: usize, d_out: usize) -> Vec<f32> {
    debug_assert_eq!(x.len(), rows * d_in);
    debug_assert!(d_out <= d_in);
    let mut out = vec![0.0f32; rows * d_out];
    for r in 0..rows {
        out[r * d_out..(r + 1) * d_out].copy_from_slice(&x[r * d_in..r * d_in + d_out]);
    }
    out
}

/// Backward of `extend_features`: split the widened gradient into the part for
/// the original features and the pad gradient summed over valid rows.
///
/// `layout` is the narrow (pre-extension) layout.
pub fn extend_features_backward(
    d_out: &[f32],
    layout: &SeqLayout,
    pad_len: usize,
) -> (Vec<f32>, Vec<f32>) {
    let d_in = layout.d;
    let d_out_w = d_in + pad_len;
    debug_assert_eq!(d_out.len(), layout.rows() * d_out_w);
    let mut d_x = vec![0.0f32; layout.numel()];
    let mut d_pad = vec![0.0f32; pad_len];
    for b in 0..layout.batch {
        for t in 0..layout.valid_len[b] {
            let src = (b * layout.seq_len + t) * d_out_w;
            let dst = layout.offset(b, t);
            d_x[dst..dst + d_in].copy_from_slice(&d_out[src..src + d_in]);
            add_assign_f32(&mut d_pad, &d_out[src + d_in..src + d_out_w]);
        }
    }
    (d_x, d_pad)
}

/// Backward of `truncate_features`: zero-extend [rows, d_out] → [rows, d_in].
pub fn truncate_features_backward(d_y: &[f32], rows: usize, d_in: usize, d_out: usize) -> Vec<f32> {
    debug_assert_eq!(d_y.len(), rows * d_out);
    let mut d_x = vec![0.0f32; rows * d_in];
    for r in 0..rows {
        d_x[r * d_in..r * d_in + d_out].copy_from_slice(&d_y[r * d_out..(r + 1) * d_out]);
    }
    d_x
}

/// Simple xorshift64 PRNG for deterministic weight init. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }
}
