//! Loss reductions shared by the predictors.
//!
//! The masked reduction zeroes the per-position loss wherever the mask is
//! set, sums each row, and divides by the number of set positions (floored
//! at `1e-5`) before averaging over the batch. An all-set mask therefore
//! yields zero, and an all-clear mask yields `row_sum / 1e-5`.

use candle_core::Tensor;

use crate::{Error, Result};

/// Smallest denominator of the masked reduction.
pub const MASK_COUNT_FLOOR: f64 = 1e-5;

/// Reduce a `[B, N]` per-position loss with a `[B, N]` integer mask to a scalar.
///
/// Set positions are zeroed and the remainder is divided by the number of
/// set positions (floored at [`MASK_COUNT_FLOOR`]), then averaged over the
/// batch. The numerator and denominator count opposite positions, so an
/// all-set mask yields 0 and an all-clear mask yields `sum / 1e-5`.
pub fn masked_mean(loss: &Tensor, mask: &Tensor) -> Result<Tensor> {
    if loss.dims() != mask.dims() || loss.rank() != 2 {
        return Err(Error::shape(format!(
            "loss {:?} and mask {:?} must both be [batch, seq_len]",
            loss.dims(),
            mask.dims()
        )));
    }
    let zeros = loss.zeros_like()?;
    let kept = mask.where_cond(&zeros, loss)?;
    let num = kept.sum(1)?;
    let den = mask
        .to_dtype(loss.dtype())?
        .sum(1)?
        .maximum(MASK_COUNT_FLOOR)?;
    Ok((num / den)?.mean_all()?)
}

/// L1 loss: plain mean when `mask` is `None`, masked reduction otherwise.
///
/// - `pred`, `target`: `[B, N]`
pub fn l1(pred: &Tensor, target: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    check_target(pred, target)?;
    let err = (pred - target)?.abs()?;
    match mask {
        None => Ok(err.mean_all()?),
        Some(mask) => masked_mean(&err, mask),
    }
}

/// MSE loss: plain mean when `mask` is `None`; otherwise the squared error is
/// averaged over channels first and then reduced with the mask.
///
/// - `pred`, `target`: `[B, N, D]`
pub fn mse(pred: &Tensor, target: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    check_target(pred, target)?;
    let err = (pred - target)?.sqr()?;
    match mask {
        None => Ok(err.mean_all()?),
        Some(mask) => masked_mean(&err.mean(candle_core::D::Minus1)?, mask),
    }
}

fn check_target(pred: &Tensor, target: &Tensor) -> Result<()> {
    if pred.dims() != target.dims() {
        return Err(Error::shape(format!(
            "target {:?} does not match prediction {:?}",
            target.dims(),
            pred.dims()
        )));
    }
    Ok(())
}
