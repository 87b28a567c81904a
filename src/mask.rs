//! Boolean sequence masks for partial supervision.
//!
//! Masks are `u8` tensors (1 = masked position) of shape `[..., seq_len]`.
//! They are built either from explicit half-open `[start, end)` index ranges
//! or from random span fractions, and [`MaskPolicy`] mixes the span policy
//! with an i.i.d. Bernoulli policy the way infilling training expects.

use candle_core::{DType, Device, Tensor};
use rand::Rng;

use crate::{Error, Result};

/// Mark positions `p` with `start <= p < end`, per element of `start`/`end`.
///
/// `start` and `end` must have identical shapes; the result has shape
/// `start.shape + [seq_len]`. Fractional indices truncate toward zero.
pub fn mask_from_start_end_indices(seq_len: usize, start: &Tensor, end: &Tensor) -> Result<Tensor> {
    if start.dims() != end.dims() {
        return Err(Error::shape(format!(
            "start {:?} and end {:?} must have the same shape",
            start.dims(),
            end.dims()
        )));
    }
    let device = start.device();
    let rank = start.rank();

    // [seq_len] broadcast against [..., 1]
    let seq = Tensor::arange(0i64, seq_len as i64, device)?;
    let start = start.to_dtype(DType::I64)?.unsqueeze(rank)?;
    let end = end.to_dtype(DType::I64)?.unsqueeze(rank)?;

    let after_start = seq.broadcast_ge(&start)?;
    let before_end = seq.broadcast_lt(&end)?;
    Ok((after_start * before_end)?)
}

/// One contiguous masked span per batch item.
///
/// For item `i` the span length is `round(frac_lengths[i] * seq_len)` and
/// the start offset is uniform in `[0, seq_len - length]`. A zero length
/// gives an empty row.
pub fn mask_from_frac_lengths<R: Rng + ?Sized>(
    seq_len: usize,
    frac_lengths: &Tensor,
    rng: &mut R,
) -> Result<Tensor> {
    if frac_lengths.rank() != 1 {
        return Err(Error::shape(format!(
            "frac_lengths must be a [batch] vector, got {:?}",
            frac_lengths.dims()
        )));
    }
    let fracs = frac_lengths.to_dtype(DType::F64)?.to_vec1::<f64>()?;

    let mut starts = Vec::with_capacity(fracs.len());
    let mut ends = Vec::with_capacity(fracs.len());
    for frac in fracs {
        if !(0.0..=1.0).contains(&frac) {
            return Err(Error::shape(format!("frac_lengths must lie in [0, 1], got {frac}")));
        }
        let length = ((frac * seq_len as f64).round() as usize).min(seq_len);
        let start = rng.random_range(0..=seq_len - length);
        starts.push(start as i64);
        ends.push((start + length) as i64);
    }

    let device = frac_lengths.device();
    let batch = starts.len();
    let start = Tensor::from_vec(starts, batch, device)?;
    let end = Tensor::from_vec(ends, batch, device)?;
    mask_from_start_end_indices(seq_len, &start, &end)
}

/// Bernoulli mask: each entry is 1 with probability `prob`.
///
/// `prob == 0` and `prob == 1` are exact and consume no randomness.
pub fn prob_mask_like<R: Rng + ?Sized>(
    shape: &[usize],
    prob: f64,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    let values: Vec<u8> = if prob >= 1.0 {
        vec![1; n]
    } else if prob <= 0.0 {
        vec![0; n]
    } else {
        (0..n).map(|_| u8::from(rng.random::<f64>() < prob)).collect()
    };
    Ok(Tensor::from_vec(values, shape, device)?)
}

/// Masks select with `where_cond`, which needs an integer dtype.
pub(crate) fn ensure_integer_mask(mask: &Tensor) -> Result<()> {
    match mask.dtype() {
        DType::U8 | DType::U32 | DType::I64 => Ok(()),
        other => Err(Error::shape(format!("masks must be integer tensors, got {other:?}"))),
    }
}

/// Randomized loss-mask policy used when training without an explicit mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskPolicy {
    /// Per-position probability of the Bernoulli branch.
    pub p_drop_prob: f64,
    /// `(lo, hi)` range of the span fraction in the contiguous branch.
    pub frac_lengths: (f64, f64),
}

impl MaskPolicy {
    pub fn validate(&self) -> Result<()> {
        crate::config::validate_probability("p_drop_prob", self.p_drop_prob)?;
        let (lo, hi) = self.frac_lengths;
        if !(0.0 <= lo && lo <= hi && hi <= 1.0) {
            return Err(Error::config(format!(
                "frac_lengths_mask must satisfy 0 <= lo <= hi <= 1, got ({lo}, {hi})"
            )));
        }
        Ok(())
    }

    /// Draw a `[batch, seq_len]` mask: a fair coin picks a random contiguous
    /// span per item, otherwise an i.i.d. Bernoulli mask.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        batch: usize,
        seq_len: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<Tensor> {
        if rng.random_bool(0.5) {
            let (lo, hi) = self.frac_lengths;
            let fracs = crate::rng::uniform(rng, batch, lo, hi);
            tracing::debug!(?fracs, "loss mask: contiguous spans");
            let fracs = Tensor::from_vec(fracs, batch, device)?;
            mask_from_frac_lengths(seq_len, &fracs, rng)
        } else {
            tracing::debug!(p = self.p_drop_prob, "loss mask: bernoulli");
            prob_mask_like(&[batch, seq_len], self.p_drop_prob, rng, device)
        }
    }
}
