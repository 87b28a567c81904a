//! Multi-head self-attention.
//!
//! Two layers:
//! - [`Attend`] — the attention kernel: softmax(Q·Kᵀ/√d)·V with an optional
//!   key-padding mask, computed either in one shot or in query blocks
//! - [`Attention`] — pre-norm projection block around [`Attend`], with rotary
//!   embeddings applied to queries and keys

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::layers::RmsNorm;
use super::rope::RotaryEmbedding;
use crate::config::AttendStrategy;
use crate::{Error, Result};

/// Scaled dot-product attention kernel.
///
/// Both strategies compute the same values; `Chunked` only bounds the size of
/// the score matrix held at once.
#[derive(Debug, Clone, Copy)]
pub struct Attend {
    strategy: AttendStrategy,
}

impl Attend {
    pub fn new(strategy: AttendStrategy) -> Self {
        Self { strategy }
    }

    /// Attend `q` over `k`/`v`.
    ///
    /// - `q`: `[B, H, N, D]`, `k`/`v`: `[B, H, M, D]`
    /// - `mask`: optional `[B, M]` key mask (1 = attend, 0 = ignore)
    ///
    /// Returns `[B, H, N, D]`.
    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, _, _, dim_head) = q.dims4()?;
        let (_, _, keys, _) = k.dims4()?;
        if let Some(mask) = mask {
            crate::mask::ensure_integer_mask(mask)?;
            if mask.dims() != [batch, keys] {
                return Err(Error::shape(format!(
                    "attention mask {:?} does not match [batch={batch}, keys={keys}]",
                    mask.dims()
                )));
            }
        }
        let scale = (dim_head as f64).powf(-0.5);

        match self.strategy {
            AttendStrategy::Full => attend_block(q, k, v, mask, scale),
            AttendStrategy::Chunked { chunk_size } => {
                let queries = q.dim(2)?;
                let mut blocks = Vec::with_capacity(queries.div_ceil(chunk_size));
                let mut start = 0;
                while start < queries {
                    let len = chunk_size.min(queries - start);
                    let q_block = q.narrow(2, start, len)?.contiguous()?;
                    blocks.push(attend_block(&q_block, k, v, mask, scale)?);
                    start += len;
                }
                Ok(Tensor::cat(&blocks, 2)?)
            }
        }
    }
}

fn attend_block(q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>, scale: f64) -> Result<Tensor> {
    let scores = (q.matmul(&k.t()?)? * scale)?;

    let scores = match mask {
        Some(mask) => {
            // [B, M] → [B, 1, 1, M]; masked keys get the most negative finite value.
            let (batch, keys) = mask.dims2()?;
            let keep = mask
                .reshape((batch, 1, 1, keys))?
                .broadcast_as(scores.shape())?;
            let floor = Tensor::full(f32::MIN, scores.shape(), scores.device())?.to_dtype(scores.dtype())?;
            keep.where_cond(&scores, &floor)?
        }
        None => scores,
    };

    let weights = candle_nn::ops::softmax_last_dim(&scores)?;
    Ok(weights.matmul(v)?)
}

/// Pre-norm multi-head self-attention with rotary queries and keys.
#[derive(Debug, Clone)]
pub struct Attention {
    norm: RmsNorm,
    to_qkv: candle_nn::Linear,
    to_out: candle_nn::Linear,
    attend: Attend,
    heads: usize,
    dim_head: usize,
}

impl Attention {
    pub fn new(
        dim: usize,
        dim_head: usize,
        heads: usize,
        strategy: AttendStrategy,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner_dim = dim_head * heads;
        Ok(Self {
            norm: RmsNorm::new(dim, vb.pp("norm"))?,
            to_qkv: candle_nn::linear_no_bias(dim, inner_dim * 3, vb.pp("to_qkv"))?,
            to_out: candle_nn::linear_no_bias(inner_dim, dim, vb.pp("to_out"))?,
            attend: Attend::new(strategy),
            heads,
            dim_head,
        })
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, N, dim]`
    /// - `mask`: optional `[B, N]` key mask
    /// - `rotary`: optional `(cos, sin)` tables, each `[N, dim_head]`
    ///
    /// Returns `[B, N, dim]` (the residual is added by the caller).
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>, rotary: Option<&(Tensor, Tensor)>) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        let x = self.norm.forward(x)?;
        let qkv = self.to_qkv.forward(&x)?.chunk(3, 2)?;

        // [B, N, H*D] → [B, H, N, D]
        let split_heads = |t: &Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, self.heads, self.dim_head))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split_heads(&qkv[0])?;
        let k = split_heads(&qkv[1])?;
        let v = split_heads(&qkv[2])?;

        let (q, k) = match rotary {
            Some((cos, sin)) => (
                RotaryEmbedding::apply(&q, cos, sin)?.contiguous()?,
                RotaryEmbedding::apply(&k, cos, sin)?.contiguous()?,
            ),
            None => (q, k),
        };

        let out = self.attend.forward(&q, &k, &v, mask)?;

        // [B, H, N, D] → [B, N, H*D]
        let out = out
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.heads * self.dim_head))?;
        Ok(self.to_out.forward(&out)?)
    }
}
