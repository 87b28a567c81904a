//! Rotary position embedding (RoPE).
//!
//! Angles are computed once per backbone call from the sequence length and
//! shared by every attention layer. Queries and keys are rotated in the
//! "rotate half" layout: `x * cos + rotate_half(x) * sin`.

use candle_core::{DType, Device, Tensor, D};

use crate::Result;

/// Rotary embedding with a fixed head width and base frequency.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    head_dim: usize,
    theta: f64,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, theta: f64) -> Self {
        Self { head_dim, theta }
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Rotation angles for positions `0..seq_len`, shape `[seq_len, head_dim]`.
    ///
    /// The `head_dim / 2` frequencies are duplicated so the table lines up
    /// with both halves of a head.
    pub fn angles(&self, seq_len: usize, device: &Device) -> Result<Tensor> {
        let half_dim = self.head_dim / 2;

        // inv_freq = 1 / (theta ^ (2i / head_dim))
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| (1.0 / self.theta.powf(2.0 * i as f64 / self.head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..seq_len).map(|i| i as f32).collect();
        let positions = Tensor::from_vec(positions, (seq_len, 1), device)?;

        // outer(positions, inv_freq) → [seq_len, half_dim]
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Tensor::cat(&[&freqs, &freqs], 1)?)
    }

    /// Precomputed `(cos, sin)` tables in `dtype`, each `[seq_len, head_dim]`.
    pub fn compute_freqs(
        &self,
        seq_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let angles = self.angles(seq_len, device)?;
        Ok((angles.cos()?.to_dtype(dtype)?, angles.sin()?.to_dtype(dtype)?))
    }

    /// Rotate `x` of shape `[B, H, S, D]` by tables of shape `[S, D]`.
    pub fn apply(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let half = x.dim(D::Minus1)? / 2;
        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

        let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
        let sin = sin.unsqueeze(0)?.unsqueeze(0)?;
        Ok((x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?)?)
    }
}
