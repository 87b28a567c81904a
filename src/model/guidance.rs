//! Classifier-free guidance plumbing shared by both predictors.
//!
//! During training a per-item coin (probability `cond_drop_prob`) replaces
//! that item's acoustic conditioning with the learned null vector and its
//! phoneme ids with the reserved null id. One decision masks both inputs.

use candle_core::{DType, Tensor};
use rand::Rng;

use crate::mask::prob_mask_like;
use crate::{Error, Result};

/// Validated predictor inputs.
#[derive(Debug, Clone)]
pub struct Conditioning {
    /// `[B, N]` phoneme ids as `u32`.
    pub phoneme_ids: Tensor,
    /// `[B, N, dim]` acoustic conditioning.
    pub cond: Tensor,
}

/// Check the `(x, phoneme_ids, cond)` contract and return `(batch, seq_len)`.
///
/// `x` and `cond` must be `[B, N, dim]` with the same shape, and
/// `phoneme_ids` must be an integer `[B, N]` tensor.
pub fn check_inputs(x: &Tensor, phoneme_ids: &Tensor, cond: &Tensor, dim: usize) -> Result<(usize, usize)> {
    let (batch, seq_len, cond_dim) = cond.dims3()?;
    if x.dims() != cond.dims() {
        return Err(Error::shape(format!(
            "state {:?} and conditioning {:?} must have the same shape",
            x.dims(),
            cond.dims()
        )));
    }
    if cond_dim != dim {
        return Err(Error::shape(format!(
            "conditioning has {cond_dim} channels, model expects {dim}"
        )));
    }
    if phoneme_ids.dims() != [batch, seq_len] {
        return Err(Error::shape(format!(
            "phoneme ids {:?} do not match [batch={batch}, seq_len={seq_len}]",
            phoneme_ids.dims()
        )));
    }
    if phoneme_ids.dtype().is_float() {
        return Err(Error::shape("phoneme ids must be an integer tensor"));
    }
    Ok((batch, seq_len))
}

/// Replace conditioning and phoneme ids of randomly dropped items.
///
/// `prob == 0` leaves the inputs untouched and `prob == 1` drops every item;
/// neither consumes randomness.
pub fn drop_conditioning<R: Rng + ?Sized>(
    phoneme_ids: &Tensor,
    cond: &Tensor,
    null_cond: &Tensor,
    null_phoneme_id: u32,
    prob: f64,
    rng: &mut R,
) -> Result<Conditioning> {
    let phoneme_ids = phoneme_ids.to_dtype(DType::U32)?;
    if prob <= 0.0 {
        return Ok(Conditioning {
            phoneme_ids,
            cond: cond.clone(),
        });
    }

    let (batch, seq_len, dim) = cond.dims3()?;
    let device = cond.device();
    let dropped = prob_mask_like(&[batch], prob, rng, device)?;
    tracing::debug!(
        dropped = dropped.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()?,
        batch,
        "guidance dropout"
    );

    let null_cond = null_cond
        .to_dtype(cond.dtype())?
        .reshape((1, 1, dim))?
        .broadcast_as(cond.shape())?;
    let cond = dropped
        .reshape((batch, 1, 1))?
        .broadcast_as(cond.shape())?
        .where_cond(&null_cond, cond)?;

    let null_ids = Tensor::full(null_phoneme_id, (batch, seq_len), device)?;
    let phoneme_ids = dropped
        .reshape((batch, 1))?
        .broadcast_as((batch, seq_len))?
        .where_cond(&null_ids, &phoneme_ids)?;

    Ok(Conditioning { phoneme_ids, cond })
}

/// `null + (cond - null) * scale`.
pub fn interpolate(cond: &Tensor, null: &Tensor, scale: f64) -> Result<Tensor> {
    Ok(((cond - null)? * scale)?.add(null)?)
}
