//! Conditional flow matching around the [`VoiceBox`] velocity field.
//!
//! ## Training
//!
//! For data `x1`, noise `x0 ~ N(0, I)` and a per-item time `t ~ U(0, 1)`:
//!
//! ```text
//! w    = (1 - (1 - σ) t) · x0 + t · x1
//! flow = x1 - (1 - σ) · x0
//! ```
//!
//! and the loss is the predictor's (masked) MSE between its output at
//! `(w, t)` and `flow`.
//!
//! ## Sampling
//!
//! Starting from `y0 ~ N(0, I)` shaped like `cond`, the guided field is
//! integrated from `t = 0` to `t = 1` over `steps` evenly spaced times with
//! the configured [`OdeSolver`]; the state at `t = 1` is the sample.

use candle_core::{DType, Tensor};
use rand::Rng;

use crate::config::FlowMatcherConfig;
use crate::model::voicebox::VoiceBox;
use crate::model::{LossMask, Objective};
use crate::ode::{linspace, Integrator, OdeSolver, Trajectory};
use crate::{Error, Result};

/// Training and sampling wrapper.
#[derive(Debug, Clone)]
pub struct ConditionalFlowMatcher {
    voicebox: VoiceBox,
    config: FlowMatcherConfig,
    solver: OdeSolver,
}

impl ConditionalFlowMatcher {
    pub fn new(voicebox: VoiceBox, config: FlowMatcherConfig) -> Result<Self> {
        config.validate()?;
        let solver = OdeSolver::from_config(&config.ode)?;
        Ok(Self {
            voicebox,
            config,
            solver,
        })
    }

    pub fn voicebox(&self) -> &VoiceBox {
        &self.voicebox
    }

    pub fn config(&self) -> &FlowMatcherConfig {
        &self.config
    }

    /// Noisy interpolant and target velocity at per-item times `t` (`[B]`).
    pub fn probability_path(&self, x0: &Tensor, x1: &Tensor, t: &Tensor) -> Result<(Tensor, Tensor)> {
        if x0.dims() != x1.dims() {
            return Err(Error::shape(format!(
                "noise {:?} and data {:?} must have the same shape",
                x0.dims(),
                x1.dims()
            )));
        }
        let batch = x1.dim(0)?;
        if t.dims() != [batch] {
            return Err(Error::shape(format!(
                "times must be a [batch={batch}] vector, got {:?}",
                t.dims()
            )));
        }
        let one_minus_sigma = 1.0 - self.config.sigma;

        let mut t_shape = vec![1; x1.rank()];
        t_shape[0] = batch;
        let t = t.to_dtype(x1.dtype())?.reshape(t_shape)?;

        // 1 - (1 - σ) t
        let noise_weight = ((&t * -one_minus_sigma)? + 1.0)?;
        let w = (x0.broadcast_mul(&noise_weight)? + x1.broadcast_mul(&t)?)?;
        let flow = (x1 - (x0 * one_minus_sigma)?)?;
        Ok((w, flow))
    }

    /// Training loss for data `x1` (`[B, N, dim]`).
    ///
    /// `mask = None` draws a random loss mask for this call.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        x1: &Tensor,
        phoneme_ids: &Tensor,
        cond: &Tensor,
        mask: Option<&Tensor>,
        rng: &mut R,
    ) -> Result<Tensor> {
        let batch = x1.dim(0)?;
        let x0 = crate::rng::randn_like(rng, x1)?;
        let times = crate::rng::uniform(rng, batch, 0.0, 1.0);
        let times = Tensor::from_vec(times, batch, x1.device())?.to_dtype(x1.dtype())?;
        let (w, flow) = self.probability_path(&x0, x1, &times)?;

        let objective = Objective::new(flow, LossMask::from(mask.cloned()));
        self.voicebox
            .forward(
                &w,
                phoneme_ids,
                cond,
                &times,
                Some(self.config.cond_drop_prob),
                Some(&objective),
                rng,
            )?
            .into_loss()
            .ok_or_else(|| Error::shape("velocity field returned predictions for a training call"))
    }

    /// Draw one sample shaped like `cond`.
    ///
    /// `mask` is shape-checked only; inference always uses the full guided field.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        phoneme_ids: &Tensor,
        cond: &Tensor,
        mask: Option<&Tensor>,
        steps: usize,
        cond_scale: f64,
        rng: &mut R,
    ) -> Result<Tensor> {
        let trajectory = self.sample_trajectory(phoneme_ids, cond, mask, steps, cond_scale, rng)?;
        Ok(trajectory.last()?.clone())
    }

    /// Like [`Self::sample`], returning every state on the time grid and the solver statistics.
    pub fn sample_trajectory<R: Rng + ?Sized>(
        &self,
        phoneme_ids: &Tensor,
        cond: &Tensor,
        mask: Option<&Tensor>,
        steps: usize,
        cond_scale: f64,
        rng: &mut R,
    ) -> Result<Trajectory> {
        if steps < 2 {
            return Err(Error::config(format!("sampling needs at least 2 time steps, got {steps}")));
        }
        let (batch, seq_len, _) = cond.dims3()?;
        if let Some(mask) = mask {
            crate::mask::ensure_integer_mask(mask)?;
            if mask.dims() != [batch, seq_len] {
                return Err(Error::shape(format!(
                    "mask {:?} does not match [batch={batch}, seq_len={seq_len}]",
                    mask.dims()
                )));
            }
        }

        tracing::info!(
            batch,
            seq_len,
            steps,
            cond_scale,
            solver = ?self.config.ode.backend,
            "sampling"
        );

        let y0 = crate::rng::randn_like(rng, cond)?;
        let times = linspace(0.0, 1.0, steps);
        let voicebox = &self.voicebox;
        let mut field = |t: &Tensor, x: &Tensor| -> Result<Tensor> {
            voicebox
                .forward_with_cond_scale(x, phoneme_ids, cond, t, cond_scale, None, &mut *rng)?
                .into_prediction()
                .ok_or_else(|| Error::shape("velocity field returned a loss for an inference call"))
        };
        let trajectory = self.solver.integrate(&mut field, &y0, &times)?;

        let stats = trajectory.stats;
        tracing::info!(
            nfe = stats.nfe,
            accepted = stats.accepted,
            rejected = stats.rejected,
            "sampling done"
        );
        Ok(trajectory)
    }
}

/// Whether every element of `x` is finite.
pub fn all_finite(x: &Tensor) -> Result<bool> {
    let values = x.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Ok(values.iter().all(|v| v.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OdeBackend, OdeConfig, ScalarMethod, VoiceBoxConfig};
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn small_voicebox(varmap: &VarMap, dev: &Device) -> VoiceBox {
        let cfg = VoiceBoxConfig {
            dim_phoneme_emb: 16,
            dim: 32,
            depth: 2,
            dim_head: 16,
            heads: 2,
            ff_mult: 2,
            conv_pos_embed_kernel_size: 5,
            ..VoiceBoxConfig::new(50)
        };
        let vb = VarBuilder::from_varmap(varmap, DType::F32, dev);
        VoiceBox::new(&cfg, vb).unwrap()
    }

    fn matcher(config: FlowMatcherConfig) -> ConditionalFlowMatcher {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        ConditionalFlowMatcher::new(small_voicebox(&varmap, &dev), config).unwrap()
    }

    fn phoneme_ids(dev: &Device) -> Tensor {
        let ids: Vec<u32> = (0..32).map(|i| (i * 3) % 50).collect();
        Tensor::from_vec(ids, (2, 16), dev).unwrap()
    }

    fn max_abs(x: Tensor) -> f32 {
        x.abs().unwrap().flatten_all().unwrap().max(0).unwrap().to_scalar().unwrap()
    }

    #[test]
    fn path_endpoints_without_noise_floor() {
        let dev = Device::Cpu;
        let cfm = matcher(FlowMatcherConfig::default());
        let x0 = Tensor::randn(0f32, 1.0, (2, 4, 32), &dev).unwrap();
        let x1 = Tensor::randn(0f32, 1.0, (2, 4, 32), &dev).unwrap();
        let t = Tensor::new(&[0f32, 1.0], &dev).unwrap();
        let (w, flow) = cfm.probability_path(&x0, &x1, &t).unwrap();

        // item 0 sits at t = 0, item 1 at t = 1
        let w0 = w.narrow(0, 0, 1).unwrap();
        let w1 = w.narrow(0, 1, 1).unwrap();
        assert!(max_abs((w0 - x0.narrow(0, 0, 1).unwrap()).unwrap()) < 1e-6);
        assert!(max_abs((w1 - x1.narrow(0, 1, 1).unwrap()).unwrap()) < 1e-6);
        assert!(max_abs((flow - (&x1 - &x0).unwrap()).unwrap()) < 1e-6);
    }

    #[test]
    fn path_with_noise_floor_keeps_sigma_of_noise_at_one() {
        let dev = Device::Cpu;
        let cfm = matcher(FlowMatcherConfig {
            sigma: 0.1,
            ..Default::default()
        });
        let x0 = Tensor::randn(0f32, 1.0, (1, 3, 32), &dev).unwrap();
        let x1 = Tensor::randn(0f32, 1.0, (1, 3, 32), &dev).unwrap();
        let t = Tensor::new(&[1f32], &dev).unwrap();
        let (w, flow) = cfm.probability_path(&x0, &x1, &t).unwrap();
        let expected_w = ((&x0 * 0.1).unwrap() + &x1).unwrap();
        assert!(max_abs((w - expected_w).unwrap()) < 1e-5);
        let expected_flow = (&x1 - (&x0 * 0.9).unwrap()).unwrap();
        assert!(max_abs((flow - expected_flow).unwrap()) < 1e-5);
    }

    #[test]
    fn training_loss_is_finite_and_non_negative() {
        let dev = Device::Cpu;
        let cfm = matcher(FlowMatcherConfig {
            cond_drop_prob: 0.2,
            ..Default::default()
        });
        let mut rng = crate::rng::seeded(5);
        let x1 = crate::rng::randn(&mut rng, (2, 16, 32), DType::F32, &dev).unwrap();
        let cond = crate::rng::randn(&mut rng, (2, 16, 32), DType::F32, &dev).unwrap();
        let loss = cfm.forward(&x1, &phoneme_ids(&dev), &cond, None, &mut rng).unwrap();
        assert_eq!(loss.rank(), 0);
        let v: f32 = loss.to_scalar().unwrap();
        assert!(v.is_finite() && v >= 0.0, "loss = {v}");
    }

    #[test]
    fn all_set_explicit_mask_gives_zero_loss() {
        let dev = Device::Cpu;
        let cfm = matcher(FlowMatcherConfig::default());
        let mut rng = crate::rng::seeded(1);
        let x1 = crate::rng::randn(&mut rng, (2, 16, 32), DType::F32, &dev).unwrap();
        let cond = crate::rng::randn(&mut rng, (2, 16, 32), DType::F32, &dev).unwrap();
        let mask = Tensor::ones((2, 16), DType::U8, &dev).unwrap();
        let loss: f32 = cfm
            .forward(&x1, &phoneme_ids(&dev), &cond, Some(&mask), &mut rng)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn same_seed_same_loss() {
        let dev = Device::Cpu;
        let cfm = matcher(FlowMatcherConfig::default());
        let x1 = Tensor::randn(0f32, 1.0, (2, 16, 32), &dev).unwrap();
        let cond = Tensor::randn(0f32, 1.0, (2, 16, 32), &dev).unwrap();
        let ids = phoneme_ids(&dev);
        let a: f32 = cfm
            .forward(&x1, &ids, &cond, None, &mut crate::rng::seeded(9))
            .unwrap()
            .to_scalar()
            .unwrap();
        let b: f32 = cfm
            .forward(&x1, &ids, &cond, None, &mut crate::rng::seeded(9))
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sample_has_cond_shape_on_both_backends() {
        let dev = Device::Cpu;
        for (backend, method) in [
            (OdeBackend::ScalarTime, ScalarMethod::Midpoint),
            (OdeBackend::ScalarTime, ScalarMethod::Euler),
            (OdeBackend::BatchedAdaptive, ScalarMethod::Midpoint),
        ] {
            let cfm = matcher(FlowMatcherConfig {
                ode: OdeConfig {
                    backend,
                    method,
                    atol: 1e-3,
                    rtol: 1e-3,
                    ..Default::default()
                },
                ..Default::default()
            });
            let mut rng = crate::rng::seeded(2);
            let cond = crate::rng::randn(&mut rng, (2, 16, 32), DType::F32, &dev).unwrap();
            let trajectory = cfm
                .sample_trajectory(&phoneme_ids(&dev), &cond, None, 3, 1.0, &mut rng)
                .unwrap();
            assert_eq!(trajectory.states.len(), 3);
            let sample = trajectory.last().unwrap();
            assert_eq!(sample.dims(), cond.dims());
            assert!(all_finite(sample).unwrap(), "{backend:?}");
        }
    }

    #[test]
    fn guided_sampling_runs() {
        let dev = Device::Cpu;
        let cfm = matcher(FlowMatcherConfig {
            ode: OdeConfig {
                method: ScalarMethod::Euler,
                step_size: None,
                ..Default::default()
            },
            ..Default::default()
        });
        let mut rng = crate::rng::seeded(4);
        let cond = crate::rng::randn(&mut rng, (2, 16, 32), DType::F32, &dev).unwrap();
        let mask = Tensor::zeros((2, 16), DType::U8, &dev).unwrap();
        let trajectory = cfm
            .sample_trajectory(&phoneme_ids(&dev), &cond, Some(&mask), 4, 2.0, &mut rng)
            .unwrap();
        // Three Euler steps; each field call runs both guidance passes.
        assert_eq!(trajectory.stats.nfe, 3);
        assert_eq!(trajectory.last().unwrap().dims(), &[2, 16, 32]);
    }

    #[test]
    fn too_few_steps_rejected() {
        let dev = Device::Cpu;
        let cfm = matcher(FlowMatcherConfig::default());
        let cond = Tensor::zeros((2, 16, 32), DType::F32, &dev).unwrap();
        let mut rng = crate::rng::seeded(0);
        let err = cfm
            .sample(&phoneme_ids(&dev), &cond, None, 1, 1.0, &mut rng)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn invalid_noise_floor_rejected() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let err = ConditionalFlowMatcher::new(
            small_voicebox(&varmap, &dev),
            FlowMatcherConfig {
                sigma: 1.5,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
