//! U-Net style transformer backbone.
//!
//! A stack of `depth` pre-norm attention + feed-forward layers. The first
//! `depth / 2` layers record their inputs; each later layer concatenates
//! the record of its mirror layer onto its own input and projects back to
//! `dim` before attending:
//!
//! ```text
//! layer:   0    1    2  |  3    4    5
//! skip:    ·    ·    ·  |  2    1    0
//! ```
//!
//! Rotary angles are computed once per call and shared by all layers; the
//! output passes through a final RMS norm and keeps the input shape.

pub mod attention;
pub mod conv_pos;
pub mod layers;
pub mod rope;
pub mod timestep;

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use crate::config::TransformerConfig;
use crate::{Error, Result};
use layers::{RmsNorm, TransformerLayer};
use rope::RotaryEmbedding;

/// Rotary base frequency.
const ROPE_THETA: f64 = 10_000.0;

/// The shared sequence backbone of the duration and velocity predictors.
#[derive(Debug, Clone)]
pub struct Transformer {
    layers: Vec<TransformerLayer>,
    /// `skip_sources[i] = Some(j)`: layer `i` consumes the input recorded at layer `j`.
    skip_sources: Vec<Option<usize>>,
    rotary_emb: RotaryEmbedding,
    final_norm: RmsNorm,
    dim: usize,
}

/// Static skip pairing for a backbone of the given (even) depth.
pub fn skip_sources(depth: usize) -> Vec<Option<usize>> {
    let half = depth / 2;
    (0..depth)
        .map(|i| (i >= half).then(|| depth - 1 - i))
        .collect()
}

impl Transformer {
    pub fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;

        let skip_sources = skip_sources(cfg.depth);
        let layers = skip_sources
            .iter()
            .enumerate()
            .map(|(i, source)| TransformerLayer::new(cfg, source.is_some(), vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layers,
            skip_sources,
            rotary_emb: RotaryEmbedding::new(cfg.dim_head, ROPE_THETA),
            final_norm: RmsNorm::new(cfg.dim, vb.pp("final_norm"))?,
            dim: cfg.dim,
        })
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Which earlier layer each layer takes its skip input from.
    pub fn skip_pairs(&self) -> &[Option<usize>] {
        &self.skip_sources
    }

    /// Forward pass: `[B, N, dim]` → `[B, N, dim]`.
    ///
    /// `mask` is an optional `[B, N]` key mask forwarded to every attention layer.
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (_, seq_len, dim) = x.dims3()?;
        if dim != self.dim {
            return Err(Error::shape(format!(
                "backbone expects {} channels, got {dim}",
                self.dim
            )));
        }

        let rotary = self.rotary_emb.compute_freqs(seq_len, x.dtype(), x.device())?;

        let mut recorded: Vec<Tensor> = Vec::with_capacity(self.layers.len() / 2);
        let mut x = x.clone();
        for (layer, source) in self.layers.iter().zip(&self.skip_sources) {
            let skip = match source {
                None => {
                    recorded.push(x.clone());
                    None
                }
                Some(j) => Some(&recorded[*j]),
            };
            x = layer.forward(&x, skip, mask, &rotary)?;
        }

        Ok(self.final_norm.forward(&x)?)
    }
}
