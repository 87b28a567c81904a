//! Phoneme duration predictor.
//!
//! Regresses one scalar (log-duration) per position from a noisy duration
//! sequence, the phoneme ids and the acoustic conditioning:
//!
//! ```text
//! FrameEmbed → Transformer → Linear(dim, 1) → squeeze → [B, N]
//! ```
//!
//! With an [`Objective`] the call returns an L1 loss instead.

use candle_core::{Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use rand::Rng;

use super::embed::FrameEmbed;
use super::transformer::Transformer;
use super::{loss, Objective, PredictorOutput};
use crate::config::DurationPredictorConfig;
use crate::mask::MaskPolicy;
use crate::Result;

#[derive(Debug, Clone)]
pub struct DurationPredictor {
    embed: FrameEmbed,
    transformer: Transformer,
    to_pred: Linear,
    mask_policy: MaskPolicy,
}

impl DurationPredictor {
    pub fn new(cfg: &DurationPredictorConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let embed = FrameEmbed::new(
            cfg.num_phoneme_tokens,
            cfg.dim_phoneme_emb,
            cfg.dim,
            cfg.conv_pos_embed_kernel_size,
            cfg.conv_pos_embed_groups,
            vb.clone(),
        )?;
        let transformer = Transformer::new(&cfg.transformer(), vb.pp("transformer"))?;
        let to_pred = candle_nn::linear(cfg.dim, 1, vb.pp("to_pred"))?;
        tracing::debug!(dim = cfg.dim, depth = cfg.depth, "duration predictor ready");
        Ok(Self {
            embed,
            transformer,
            to_pred,
            mask_policy: cfg.mask_policy(),
        })
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, N, dim]` noisy durations
    /// - `phoneme_ids`: `[B, N]`
    /// - `cond`: `[B, N, dim]`
    /// - `objective`: `target` is `[B, N]`
    pub fn forward<R: Rng + ?Sized>(
        &self,
        x: &Tensor,
        phoneme_ids: &Tensor,
        cond: &Tensor,
        cond_drop_prob: f64,
        objective: Option<&Objective>,
        rng: &mut R,
    ) -> Result<PredictorOutput> {
        let h = self.embed.forward(x, phoneme_ids, cond, cond_drop_prob, rng)?;
        let h = self.transformer.forward(&h, None)?;
        let pred = self.to_pred.forward(&h)?.squeeze(D::Minus1)?;

        let Some(objective) = objective else {
            return Ok(PredictorOutput::Prediction(pred));
        };
        let (batch, seq_len) = pred.dims2()?;
        let mask = objective
            .mask
            .resolve(&self.mask_policy, batch, seq_len, rng, pred.device())?;
        let target = objective.target.to_dtype(pred.dtype())?;
        Ok(PredictorOutput::Loss(loss::l1(&pred, &target, mask.as_ref())?))
    }

    /// Classifier-free guided forward.
    ///
    /// `cond_scale == 1` returns the conditional pass alone.
    pub fn forward_with_cond_scale<R: Rng + ?Sized>(
        &self,
        x: &Tensor,
        phoneme_ids: &Tensor,
        cond: &Tensor,
        cond_scale: f64,
        objective: Option<&Objective>,
        rng: &mut R,
    ) -> Result<PredictorOutput> {
        let logits = self.forward(x, phoneme_ids, cond, 0.0, objective, rng)?;
        if cond_scale == 1.0 {
            return Ok(logits);
        }
        let null_logits = self.forward(x, phoneme_ids, cond, 1.0, objective, rng)?;
        PredictorOutput::guided(logits, null_logits, cond_scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LossMask;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_cfg() -> DurationPredictorConfig {
        DurationPredictorConfig {
            dim_phoneme_emb: 16,
            dim: 32,
            depth: 2,
            dim_head: 16,
            heads: 2,
            ff_mult: 2,
            conv_pos_embed_kernel_size: 5,
            ..DurationPredictorConfig::new(50)
        }
    }

    fn inputs(dev: &Device) -> (Tensor, Tensor, Tensor) {
        let x = Tensor::randn(0f32, 1.0, (2, 12, 32), dev).unwrap();
        let ids = Tensor::arange(0u32, 24, dev).unwrap().reshape((2, 12)).unwrap();
        let cond = Tensor::randn(0f32, 1.0, (2, 12, 32), dev).unwrap();
        (x, ids, cond)
    }

    #[test]
    fn predicts_one_value_per_position() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = DurationPredictor::new(&small_cfg(), vb).unwrap();
        let (x, ids, cond) = inputs(&dev);
        let mut rng = crate::rng::seeded(0);
        let out = model.forward(&x, &ids, &cond, 0.0, None, &mut rng).unwrap();
        let pred = out.into_prediction().unwrap();
        assert_eq!(pred.dims(), &[2, 12]);
    }

    #[test]
    fn training_returns_scalar_loss() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = DurationPredictor::new(&small_cfg(), vb).unwrap();
        let (x, ids, cond) = inputs(&dev);
        let target = Tensor::randn(0f32, 1.0, (2, 12), &dev).unwrap();
        let mut rng = crate::rng::seeded(3);
        for mask in [LossMask::Random, LossMask::Full] {
            let objective = Objective::new(target.clone(), mask);
            let loss = model
                .forward(&x, &ids, &cond, 0.2, Some(&objective), &mut rng)
                .unwrap()
                .into_loss()
                .unwrap();
            assert_eq!(loss.rank(), 0);
            let v: f32 = loss.to_scalar().unwrap();
            assert!(v.is_finite() && v >= 0.0);
        }
    }

    #[test]
    fn explicit_mask_averages_clear_positions_over_set_count() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = DurationPredictor::new(&small_cfg(), vb).unwrap();
        let (x, ids, cond) = inputs(&dev);
        let mut rng = crate::rng::seeded(0);
        let pred: Vec<Vec<f32>> = model
            .forward(&x, &ids, &cond, 0.0, None, &mut rng)
            .unwrap()
            .into_prediction()
            .unwrap()
            .to_vec2()
            .unwrap();

        let target: Vec<f32> = (0..24).map(|i| i as f32 * 0.1).collect();
        let target = Tensor::from_vec(target, (2, 12), &dev).unwrap();
        // Row 0 sets the first 3 positions, row 1 the last 4.
        let mask_rows: Vec<Vec<u8>> = vec![
            (0..12).map(|j| u8::from(j < 3)).collect(),
            (0..12).map(|j| u8::from(j >= 8)).collect(),
        ];
        let mask = Tensor::new(mask_rows.concat().as_slice(), &dev)
            .unwrap()
            .reshape((2, 12))
            .unwrap();

        let targets: Vec<Vec<f32>> = target.to_vec2().unwrap();
        let expected = (0..2)
            .map(|b| {
                let set = mask_rows[b].iter().filter(|&&m| m == 1).count() as f32;
                let clear_sum: f32 = (0..12)
                    .filter(|&j| mask_rows[b][j] == 0)
                    .map(|j| (pred[b][j] - targets[b][j]).abs())
                    .sum();
                clear_sum / set
            })
            .sum::<f32>()
            / 2.0;

        let objective = Objective::new(target, LossMask::Explicit(mask));
        let loss: f32 = model
            .forward(&x, &ids, &cond, 0.0, Some(&objective), &mut rng)
            .unwrap()
            .into_loss()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - expected).abs() < 1e-4, "loss = {loss}, expected = {expected}");
    }

    #[test]
    fn guidance_at_scale_one_is_conditional() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = DurationPredictor::new(&small_cfg(), vb).unwrap();
        let (x, ids, cond) = inputs(&dev);
        let mut rng = crate::rng::seeded(0);
        let guided = model
            .forward_with_cond_scale(&x, &ids, &cond, 1.0, None, &mut rng)
            .unwrap();
        let plain = model.forward(&x, &ids, &cond, 0.0, None, &mut rng).unwrap();
        let diff: f32 = (guided.tensor() - plain.tensor())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn guidance_at_scale_zero_is_unconditional() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = DurationPredictor::new(&small_cfg(), vb).unwrap();
        let (x, ids, cond) = inputs(&dev);
        let mut rng = crate::rng::seeded(0);
        let guided = model
            .forward_with_cond_scale(&x, &ids, &cond, 0.0, None, &mut rng)
            .unwrap();
        let null = model.forward(&x, &ids, &cond, 1.0, None, &mut rng).unwrap();
        let diff: f32 = (guided.tensor() - null.tensor())
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4);
    }

    #[test]
    fn mismatched_cond_width_rejected() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let model = DurationPredictor::new(&small_cfg(), vb).unwrap();
        let x = Tensor::zeros((1, 4, 32), DType::F32, &dev).unwrap();
        let cond = Tensor::zeros((1, 4, 16), DType::F32, &dev).unwrap();
        let ids = Tensor::zeros((1, 4), DType::U32, &dev).unwrap();
        let mut rng = crate::rng::seeded(0);
        let err = model.forward(&x, &ids, &cond, 0.0, None, &mut rng).unwrap_err();
        assert!(matches!(err, crate::Error::Shape(_)));
    }
}
