//! Building blocks of the backbone.
//!
//! - [`RmsNorm`] — L2-normalize, rescale by `√dim`, learned per-channel gain
//! - [`FeedForward`] — pre-norm GELU MLP
//! - [`TransformerLayer`] — optional skip combiner + attention + feed-forward,
//!   both with residuals

use candle_core::{Module, Tensor, D};
use candle_nn::VarBuilder;

use super::attention::Attention;
use crate::config::TransformerConfig;
use crate::Result;

/// RMS normalization: `x / max(‖x‖₂, ε) · √dim · γ`.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    gamma: Tensor,
    scale: f64,
}

impl RmsNorm {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let gamma = vb.get_with_hints(dim, "gamma", candle_nn::Init::Const(1.0))?;
        Ok(Self {
            gamma,
            scale: (dim as f64).sqrt(),
        })
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
        (x.broadcast_div(&norm)? * self.scale)?.broadcast_mul(&self.gamma)
    }
}

/// Pre-norm feed-forward: `RmsNorm → Linear(dim, dim·mult) → GELU → Linear(dim·mult, dim)`.
#[derive(Debug, Clone)]
pub struct FeedForward {
    norm: RmsNorm,
    proj_in: candle_nn::Linear,
    proj_out: candle_nn::Linear,
}

impl FeedForward {
    pub fn new(dim: usize, mult: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = dim * mult;
        Ok(Self {
            norm: RmsNorm::new(dim, vb.pp("norm"))?,
            proj_in: candle_nn::linear(dim, hidden, vb.pp("proj_in"))?,
            proj_out: candle_nn::linear(hidden, dim, vb.pp("proj_out"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        x.apply(&self.norm)?
            .apply(&self.proj_in)?
            .gelu_erf()?
            .apply(&self.proj_out)
    }
}

/// One backbone layer.
///
/// Layers past the depth midpoint own a skip combiner `Linear(2·dim, dim)`
/// that fuses the current state with the matching pre-midpoint input.
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    skip_combiner: Option<candle_nn::Linear>,
    attn: Attention,
    ff: FeedForward,
}

impl TransformerLayer {
    pub fn new(cfg: &TransformerConfig, has_skip: bool, vb: VarBuilder) -> Result<Self> {
        let skip_combiner = if has_skip {
            Some(candle_nn::linear(cfg.dim * 2, cfg.dim, vb.pp("skip_combiner"))?)
        } else {
            None
        };
        Ok(Self {
            skip_combiner,
            attn: Attention::new(cfg.dim, cfg.dim_head, cfg.heads, cfg.attend, vb.pp("attn"))?,
            ff: FeedForward::new(cfg.dim, cfg.ff_mult, vb.pp("ff"))?,
        })
    }

    pub fn has_skip(&self) -> bool {
        self.skip_combiner.is_some()
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, N, dim]`
    /// - `skip`: the paired encoder-side input, required iff [`Self::has_skip`]
    /// - `rotary`: shared `(cos, sin)` tables
    pub fn forward(
        &self,
        x: &Tensor,
        skip: Option<&Tensor>,
        mask: Option<&Tensor>,
        rotary: &(Tensor, Tensor),
    ) -> Result<Tensor> {
        let x = match (&self.skip_combiner, skip) {
            (Some(combiner), Some(skip)) => Tensor::cat(&[x, skip], D::Minus1)?.apply(combiner)?,
            (None, None) => x.clone(),
            (Some(_), None) => {
                return Err(crate::Error::shape("decoder layer called without its skip input"))
            }
            (None, Some(_)) => {
                return Err(crate::Error::shape("encoder layer does not take a skip input"))
            }
        };

        let x = (self.attn.forward(&x, mask, Some(rotary))? + &x)?;
        Ok((self.ff.forward(&x)? + &x)?)
    }
}
