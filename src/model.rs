//! Model components.
//!
//! ## Components
//!
//! - [`transformer`] — U-Net style backbone with rotary attention
//! - [`duration`] — per-phoneme log-duration regressor
//! - [`voicebox`] — velocity-field predictor used by the flow matcher
//! - [`embed`] — shared phoneme + conditioning input stage
//! - [`guidance`] — classifier-free guidance dropout and input contracts
//! - [`loss`] — masked loss reductions
//!
//! Both predictors return a [`PredictorOutput`]: raw predictions when called
//! without an [`Objective`], a scalar loss when called with one.

pub mod duration;
pub mod embed;
pub mod guidance;
pub mod loss;
pub mod transformer;
pub mod voicebox;

use candle_core::{Device, Tensor};
use rand::Rng;

use crate::mask::MaskPolicy;
use crate::{Error, Result};

/// Which positions the training loss is reduced over.
#[derive(Debug, Clone)]
pub enum LossMask {
    /// Draw a fresh mask from the predictor's [`MaskPolicy`].
    Random,
    /// Use the caller's `[B, N]` integer mask.
    Explicit(Tensor),
    /// Plain mean over every position and channel.
    Full,
}

impl LossMask {
    /// Turn the selector into a concrete `[batch, seq_len]` mask, or `None` for [`LossMask::Full`].
    pub fn resolve<R: Rng + ?Sized>(
        &self,
        policy: &MaskPolicy,
        batch: usize,
        seq_len: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<Option<Tensor>> {
        match self {
            LossMask::Random => Ok(Some(policy.sample(batch, seq_len, rng, device)?)),
            LossMask::Explicit(mask) => {
                crate::mask::ensure_integer_mask(mask)?;
                if mask.dims() != [batch, seq_len] {
                    return Err(Error::shape(format!(
                        "loss mask {:?} does not match [batch={batch}, seq_len={seq_len}]",
                        mask.dims()
                    )));
                }
                Ok(Some(mask.clone()))
            }
            LossMask::Full => Ok(None),
        }
    }
}

impl From<Option<Tensor>> for LossMask {
    /// A supplied mask is used as-is; a missing one is drawn at random.
    fn from(mask: Option<Tensor>) -> Self {
        match mask {
            Some(mask) => LossMask::Explicit(mask),
            None => LossMask::Random,
        }
    }
}

/// Training target plus the loss mask selector.
#[derive(Debug, Clone)]
pub struct Objective {
    pub target: Tensor,
    pub mask: LossMask,
}

impl Objective {
    pub fn new(target: Tensor, mask: LossMask) -> Self {
        Self { target, mask }
    }
}

/// Result of a predictor call.
#[derive(Debug, Clone)]
pub enum PredictorOutput {
    /// Raw per-position predictions (inference path).
    Prediction(Tensor),
    /// Scalar training loss.
    Loss(Tensor),
}

impl PredictorOutput {
    pub fn tensor(&self) -> &Tensor {
        match self {
            PredictorOutput::Prediction(t) | PredictorOutput::Loss(t) => t,
        }
    }

    pub fn into_prediction(self) -> Option<Tensor> {
        match self {
            PredictorOutput::Prediction(t) => Some(t),
            PredictorOutput::Loss(_) => None,
        }
    }

    pub fn into_loss(self) -> Option<Tensor> {
        match self {
            PredictorOutput::Loss(t) => Some(t),
            PredictorOutput::Prediction(_) => None,
        }
    }

    /// Classifier-free guidance: `null + (cond - null) * scale`.
    pub fn guided(cond: Self, null: Self, scale: f64) -> Result<Self> {
        match (cond, null) {
            (PredictorOutput::Prediction(c), PredictorOutput::Prediction(n)) => {
                Ok(PredictorOutput::Prediction(guidance::interpolate(&c, &n, scale)?))
            }
            (PredictorOutput::Loss(c), PredictorOutput::Loss(n)) => {
                Ok(PredictorOutput::Loss(guidance::interpolate(&c, &n, scale)?))
            }
            _ => Err(Error::shape("guidance needs two outputs of the same kind")),
        }
    }
}
