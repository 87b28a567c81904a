//! Embedded Runge-Kutta integration with per-row step control.
//!
//! The state is a `[rows, n]` matrix; every row carries its own time and
//! step size. One solver iteration evaluates all stages for all rows at
//! once, then accepts or rejects each row independently:
//!
//! ```text
//! err_i    = rms( h_i · Σ b_err·k / (atol + rtol · max(|y_i|, |y_i'|)) )
//! accept   = err_i <= 1
//! factor_i = clamp(0.9 · err_i^(-1/(q+1)), 0.2, 10)
//! h_i     ← h_i · factor_i
//! ```
//!
//! Rows that already reached the current output time take a zero step and
//! keep their state. Steps are clipped so every row lands exactly on each
//! output time.

use candle_core::{DType, Tensor};

use super::tableau::ButcherTableau;
use super::SolverStats;
use crate::{Error, Result};

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

/// Field over packed rows: `f(t_per_row, y[rows, n]) -> [rows, n]`.
pub type RowField<'a> = dyn FnMut(&[f64], &Tensor) -> Result<Tensor> + 'a;

/// Step controller settings.
#[derive(Debug, Clone, Copy)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

/// Adaptive integrator over packed `[rows, n]` states.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveRk {
    pub tableau: &'static ButcherTableau,
    pub tol: Tolerance,
    pub max_steps: usize,
}

impl AdaptiveRk {
    /// Integrate from `times[0]` and return the packed state at every entry of `times`.
    pub fn solve(
        &self,
        field: &mut RowField<'_>,
        y0: &Tensor,
        times: &[f64],
        stats: &mut SolverStats,
    ) -> Result<Vec<Tensor>> {
        let (rows, _) = y0.dims2()?;
        let t0 = times[0];
        let t_end = times[times.len() - 1];

        let mut states = Vec::with_capacity(times.len());
        states.push(y0.clone());
        if times.len() == 1 {
            return Ok(states);
        }

        let mut t = vec![t0; rows];
        let mut y = y0.clone();
        let mut dt = self.initial_step(field, &t, &y, t_end - t0, stats)?;
        let mut iterations = 0usize;

        for &target in &times[1..] {
            loop {
                let active: Vec<bool> = t.iter().map(|&ti| ti < target).collect();
                if !active.iter().any(|&a| a) {
                    break;
                }
                if iterations >= self.max_steps {
                    return Err(Error::Solver(format!(
                        "{}: step budget of {} exhausted at t = {:?} (target {target})",
                        self.tableau.name, self.max_steps, t
                    )));
                }
                iterations += 1;

                // Clip to the output time; finished rows take a zero step.
                let h: Vec<f64> = (0..rows)
                    .map(|i| if active[i] { dt[i].min(target - t[i]) } else { 0.0 })
                    .collect();
                let (y_new, err) = self.step(field, &t, &h, &y, stats)?;
                let err_norm = self.error_norm(&err, &y, &y_new)?;

                let mut accept = vec![0u8; rows];
                for i in (0..rows).filter(|&i| active[i]) {
                    let e = err_norm[i];
                    if !e.is_finite() {
                        return Err(Error::Solver(format!(
                            "{}: non-finite error estimate for row {i} at t = {}",
                            self.tableau.name, t[i]
                        )));
                    }
                    if e <= 1.0 {
                        accept[i] = 1;
                        t[i] = if h[i] >= target - t[i] { target } else { t[i] + h[i] };
                        stats.accepted += 1;
                    } else {
                        stats.rejected += 1;
                    }
                    dt[i] = h[i] * self.step_factor(e);
                }

                let accept = Tensor::from_vec(accept, (rows, 1), y.device())?.broadcast_as(y.shape())?;
                y = accept.where_cond(&y_new, &y)?;
            }
            states.push(y.clone());
        }

        if stats.rejected > stats.accepted {
            tracing::warn!(
                solver = self.tableau.name,
                accepted = stats.accepted,
                rejected = stats.rejected,
                "adaptive solver rejected most of its steps"
            );
        }
        Ok(states)
    }

    fn step_factor(&self, err_norm: f64) -> f64 {
        if err_norm == 0.0 {
            return MAX_FACTOR;
        }
        let exponent = -1.0 / (self.tableau.error_order + 1) as f64;
        (SAFETY * err_norm.powf(exponent)).clamp(MIN_FACTOR, MAX_FACTOR)
    }

    /// One embedded step for all rows: returns `(y_new, err)`.
    fn step(
        &self,
        field: &mut RowField<'_>,
        t: &[f64],
        h: &[f64],
        y: &Tensor,
        stats: &mut SolverStats,
    ) -> Result<(Tensor, Tensor)> {
        let tableau = self.tableau;
        let h_col = column(h, y)?;

        let mut ks: Vec<Tensor> = Vec::with_capacity(tableau.stages());
        for (c, a_row) in tableau.c.iter().zip(tableau.a) {
            let y_stage = if a_row.is_empty() {
                y.clone()
            } else {
                (y + h_col.broadcast_mul(&weighted_sum(&ks, a_row, y)?)?)?
            };
            let t_stage: Vec<f64> = t.iter().zip(h).map(|(ti, hi)| ti + c * hi).collect();
            ks.push(field(&t_stage, &y_stage)?);
            stats.nfe += 1;
        }

        let y_new = (y + h_col.broadcast_mul(&weighted_sum(&ks, tableau.b, y)?)?)?;
        let err = h_col.broadcast_mul(&weighted_sum(&ks, tableau.b_err, y)?)?;
        Ok((y_new, err))
    }

    /// Per-row RMS of the error relative to the mixed tolerance.
    fn error_norm(&self, err: &Tensor, y: &Tensor, y_new: &Tensor) -> Result<Vec<f64>> {
        let scale = ((y.abs()?.maximum(&y_new.abs()?)? * self.tol.rtol)? + self.tol.atol)?;
        row_rms(&(err / scale)?)
    }

    /// Hairer's starting step heuristic, per row.
    fn initial_step(
        &self,
        field: &mut RowField<'_>,
        t0: &[f64],
        y0: &Tensor,
        span: f64,
        stats: &mut SolverStats,
    ) -> Result<Vec<f64>> {
        let scale = ((y0.abs()? * self.tol.rtol)? + self.tol.atol)?;
        let f0 = field(t0, y0)?;
        stats.nfe += 1;
        let d0 = row_rms(&(y0 / &scale)?)?;
        let d1 = row_rms(&(&f0 / &scale)?)?;

        let h0: Vec<f64> = d0
            .iter()
            .zip(&d1)
            .map(|(&d0, &d1)| if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 })
            .collect();

        let h0_col = column(&h0, y0)?;
        let y1 = (y0 + h0_col.broadcast_mul(&f0)?)?;
        let t1: Vec<f64> = t0.iter().zip(&h0).map(|(t, h)| t + h).collect();
        let f1 = field(&t1, &y1)?;
        stats.nfe += 1;
        let d2 = row_rms(&((&f1 - &f0)? / &scale)?)?;

        let exponent = 1.0 / (self.tableau.error_order + 1) as f64;
        let steps = (0..h0.len())
            .map(|i| {
                let d2 = d2[i] / h0[i];
                let dmax = d1[i].max(d2);
                let h1 = if dmax <= 1e-15 {
                    (h0[i] * 1e-3).max(1e-6)
                } else {
                    (0.01 / dmax).powf(exponent)
                };
                (100.0 * h0[i]).min(h1).min(span)
            })
            .collect();
        Ok(steps)
    }
}

/// `[rows]` host values as a `[rows, 1]` tensor matching `like`.
fn column(values: &[f64], like: &Tensor) -> Result<Tensor> {
    Ok(Tensor::from_slice(values, (values.len(), 1), like.device())?.to_dtype(like.dtype())?)
}

/// `Σ weights[j] · ks[j]`, skipping zero weights.
fn weighted_sum(ks: &[Tensor], weights: &[f64], like: &Tensor) -> Result<Tensor> {
    let mut acc = like.zeros_like()?;
    for (k, &w) in ks.iter().zip(weights) {
        if w != 0.0 {
            acc = (acc + (k * w)?)?;
        }
    }
    Ok(acc)
}

fn row_rms(x: &Tensor) -> Result<Vec<f64>> {
    Ok(x.to_dtype(DType::F64)?.sqr()?.mean(1)?.sqrt()?.to_vec1::<f64>()?)
}
