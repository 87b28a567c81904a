//! Convolutional position signal.
//!
//! A grouped (by default depthwise) 1D convolution with "same" padding
//! followed by GELU, added residually to the embedded sequence:
//! ```text
//! x [B, N, dim]
//!   → transpose → [B, dim, N]
//!   → Conv1d(dim, dim, k, groups, padding = k / 2)
//!   → GELU
//!   → transpose → [B, N, dim]
//! ```

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use crate::{Error, Result};

/// Depthwise convolutional positional embedding.
#[derive(Debug, Clone)]
pub struct ConvPositionEmbed {
    dw_conv: candle_nn::Conv1d,
}

impl ConvPositionEmbed {
    /// `groups = None` gives a fully depthwise convolution.
    pub fn new(dim: usize, kernel_size: usize, groups: Option<usize>, vb: VarBuilder) -> Result<Self> {
        if kernel_size % 2 == 0 {
            return Err(Error::config(format!("kernel_size must be odd, got {kernel_size}")));
        }
        let groups = groups.unwrap_or(dim);
        if groups == 0 || dim % groups != 0 {
            return Err(Error::config(format!("groups ({groups}) must divide dim ({dim})")));
        }

        let cfg = candle_nn::Conv1dConfig {
            padding: kernel_size / 2,
            stride: 1,
            dilation: 1,
            groups,
            ..Default::default()
        };
        let dw_conv = candle_nn::conv1d(dim, dim, kernel_size, cfg, vb.pp("dw_conv1d"))?;
        Ok(Self { dw_conv })
    }

    /// `[B, N, dim]` → `[B, N, dim]` (without the residual).
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.transpose(1, 2)?.contiguous()?;
        let x = self.dw_conv.forward(&x)?.gelu_erf()?;
        Ok(x.transpose(1, 2)?.contiguous()?)
    }
}
