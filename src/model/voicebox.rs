//! VoiceBox velocity-field predictor.
//!
//! Predicts the flow velocity at time `t` for a noisy acoustic state:
//!
//! ```text
//! FrameEmbed(x, cond, phoneme_ids)       [B, N, dim]
//! time token = sinusoidal(t)             [B, 1, dim]
//! cat([time, frames], seq) → Transformer [B, N + 1, dim]
//! drop time token → Linear(dim, dim)     [B, N, dim]
//! ```
//!
//! With an [`Objective`] the call returns an MSE loss instead.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use rand::Rng;

use super::embed::FrameEmbed;
use super::transformer::timestep::LearnedSinusoidalPosEmb;
use super::transformer::Transformer;
use super::{loss, Objective, PredictorOutput};
use crate::config::VoiceBoxConfig;
use crate::mask::MaskPolicy;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct VoiceBox {
    embed: FrameEmbed,
    sinu_pos_emb: LearnedSinusoidalPosEmb,
    transformer: Transformer,
    to_pred: Linear,
    mask_policy: MaskPolicy,
    cond_drop_prob: f64,
    dim: usize,
}

/// Expand `times` to one value per batch item.
///
/// Accepts a scalar, a single-element vector, or a `[batch]` vector.
pub fn broadcast_times(times: &Tensor, batch: usize) -> Result<Tensor> {
    match times.dims() {
        [] => Ok(times.reshape(1)?.broadcast_as(batch)?.contiguous()?),
        [1] => Ok(times.broadcast_as(batch)?.contiguous()?),
        [n] if *n == batch => Ok(times.clone()),
        dims => Err(Error::shape(format!(
            "times must be a scalar or a [batch={batch}] vector, got {dims:?}"
        ))),
    }
}

impl VoiceBox {
    pub fn new(cfg: &VoiceBoxConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let embed = FrameEmbed::new(
            cfg.num_phoneme_tokens,
            cfg.dim_phoneme_emb,
            cfg.dim,
            cfg.conv_pos_embed_kernel_size,
            cfg.conv_pos_embed_groups,
            vb.clone(),
        )?;
        let sinu_pos_emb = LearnedSinusoidalPosEmb::new(cfg.dim, vb.pp("sinu_pos_emb"))?;
        let transformer = Transformer::new(&cfg.transformer(), vb.pp("transformer"))?;
        let to_pred = candle_nn::linear_no_bias(cfg.dim, cfg.dim, vb.pp("to_pred"))?;
        tracing::debug!(dim = cfg.dim, depth = cfg.depth, heads = cfg.heads, "voicebox ready");
        Ok(Self {
            embed,
            sinu_pos_emb,
            transformer,
            to_pred,
            mask_policy: cfg.mask_policy(),
            cond_drop_prob: cfg.cond_drop_prob,
            dim: cfg.dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Default guidance dropout probability.
    pub fn cond_drop_prob(&self) -> f64 {
        self.cond_drop_prob
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, N, dim]` flow state at `times`
    /// - `phoneme_ids`: `[B, N]`
    /// - `cond`: `[B, N, dim]`
    /// - `times`: scalar or `[B]`
    /// - `cond_drop_prob`: `None` uses the configured default
    /// - `objective`: `target` is `[B, N, dim]`
    #[allow(clippy::too_many_arguments)]
    pub fn forward<R: Rng + ?Sized>(
        &self,
        x: &Tensor,
        phoneme_ids: &Tensor,
        cond: &Tensor,
        times: &Tensor,
        cond_drop_prob: Option<f64>,
        objective: Option<&Objective>,
        rng: &mut R,
    ) -> Result<PredictorOutput> {
        let cond_drop_prob = cond_drop_prob.unwrap_or(self.cond_drop_prob);
        let h = self.embed.forward(x, phoneme_ids, cond, cond_drop_prob, rng)?;
        let (batch, seq_len, _) = h.dims3()?;

        let times = broadcast_times(times, batch)?;
        let time_token = self.sinu_pos_emb.forward(&times)?.to_dtype(h.dtype())?.unsqueeze(1)?;
        let h = Tensor::cat(&[&time_token, &h], 1)?;
        let h = self.transformer.forward(&h, None)?;
        let pred = self.to_pred.forward(&h.narrow(1, 1, seq_len)?)?;

        let Some(objective) = objective else {
            return Ok(PredictorOutput::Prediction(pred));
        };
        let mask = objective
            .mask
            .resolve(&self.mask_policy, batch, seq_len, rng, pred.device())?;
        let target = objective.target.to_dtype(pred.dtype())?;
        Ok(PredictorOutput::Loss(loss::mse(&pred, &target, mask.as_ref())?))
    }

    /// Classifier-free guided forward.
    ///
    /// `cond_scale == 1` returns the conditional pass alone.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_with_cond_scale<R: Rng + ?Sized>(
        &self,
        x: &Tensor,
        phoneme_ids: &Tensor,
        cond: &Tensor,
        times: &Tensor,
        cond_scale: f64,
        objective: Option<&Objective>,
        rng: &mut R,
    ) -> Result<PredictorOutput> {
        let logits = self.forward(x, phoneme_ids, cond, times, Some(0.0), objective, rng)?;
        if cond_scale == 1.0 {
            return Ok(logits);
        }
        let null_logits = self.forward(x, phoneme_ids, cond, times, Some(1.0), objective, rng)?;
        PredictorOutput::guided(logits, null_logits, cond_scale)
    }
}
