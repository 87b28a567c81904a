//! Scalar-time backend.
//!
//! The whole batch shares one time value, passed to the field as a 0-dim
//! tensor. Fixed-grid methods step on
//!
//! ```text
//! t0, t0 + h, t0 + 2h, ..., t_end        (h = step_size)
//! ```
//!
//! or exactly on the requested times when no step size is set, and read
//! the requested times off the grid by linear interpolation. `Dopri5`
//! treats the entire state as one vector under a single adaptive step.

use candle_core::Tensor;

use super::adaptive::{AdaptiveRk, Tolerance};
use super::tableau::DOPRI5;
use super::{check_times, Integrator, SolverStats, Trajectory, VectorField};
use crate::config::{OdeConfig, ScalarMethod};
use crate::Result;

/// Shared-time integrator.
#[derive(Debug, Clone)]
pub struct ScalarTimeSolver {
    method: ScalarMethod,
    step_size: Option<f64>,
    tol: Tolerance,
    max_steps: usize,
}

impl ScalarTimeSolver {
    pub fn new(cfg: &OdeConfig) -> Self {
        Self {
            method: cfg.method,
            step_size: cfg.step_size,
            tol: Tolerance {
                atol: cfg.atol,
                rtol: cfg.rtol,
            },
            max_steps: cfg.max_steps,
        }
    }

    pub fn method(&self) -> ScalarMethod {
        self.method
    }

    /// Grid the fixed-step methods walk over.
    fn grid(&self, times: &[f64]) -> Vec<f64> {
        let (start, end) = (times[0], times[times.len() - 1]);
        match self.step_size {
            Some(h) if end > start => {
                let n = ((end - start) / h + 1.0).ceil() as usize;
                let mut grid: Vec<f64> = (0..n).map(|i| start + h * i as f64).collect();
                grid.truncate(grid.partition_point(|&t| t < end));
                grid.push(end);
                grid
            }
            _ => times.to_vec(),
        }
    }

    /// Increment `y1 - y0` of one fixed step.
    fn step(
        &self,
        field: &mut VectorField<'_>,
        t0: f64,
        dt: f64,
        y0: &Tensor,
        stats: &mut SolverStats,
    ) -> Result<Tensor> {
        let mut f = |t: f64, y: &Tensor| -> Result<Tensor> {
            stats.nfe += 1;
            field(&scalar_time(t, y)?, y)
        };
        let dy = match self.method {
            ScalarMethod::Euler => (f(t0, y0)? * dt)?,
            ScalarMethod::Midpoint => {
                let k1 = f(t0, y0)?;
                let y_mid = (y0 + (k1 * (dt / 2.0))?)?;
                (f(t0 + dt / 2.0, &y_mid)? * dt)?
            }
            ScalarMethod::Rk4 | ScalarMethod::Dopri5 => {
                // Classic RK4; Dopri5 never takes fixed steps.
                let k1 = f(t0, y0)?;
                let k2 = f(t0 + dt / 2.0, &(y0 + (&k1 * (dt / 2.0))?)?)?;
                let k3 = f(t0 + dt / 2.0, &(y0 + (&k2 * (dt / 2.0))?)?)?;
                let k4 = f(t0 + dt, &(y0 + (&k3 * dt)?)?)?;
                let sum = ((k1 + (k2 * 2.0)?)? + ((k3 * 2.0)? + k4)?)?;
                (sum * (dt / 6.0))?
            }
        };
        Ok(dy)
    }

    fn integrate_fixed(
        &self,
        field: &mut VectorField<'_>,
        y0: &Tensor,
        times: &[f64],
    ) -> Result<Trajectory> {
        let grid = self.grid(times);
        let mut stats = SolverStats::default();
        let mut states = Vec::with_capacity(times.len());
        states.push(y0.clone());

        let mut next = 1;
        let mut y0 = y0.clone();
        for window in grid.windows(2) {
            let (t0, t1) = (window[0], window[1]);
            let y1 = (&y0 + self.step(field, t0, t1 - t0, &y0, &mut stats)?)?;
            stats.accepted += 1;
            while next < times.len() && times[next] <= t1 {
                states.push(interpolate(t0, t1, &y0, &y1, times[next])?);
                next += 1;
            }
            y0 = y1;
        }

        tracing::debug!(method = ?self.method, nfe = stats.nfe, steps = stats.accepted, "fixed-grid solve");
        Ok(Trajectory {
            times: times.to_vec(),
            states,
            stats,
        })
    }

    fn integrate_adaptive(
        &self,
        field: &mut VectorField<'_>,
        y0: &Tensor,
        times: &[f64],
    ) -> Result<Trajectory> {
        let shape = y0.shape().clone();
        let packed = y0.reshape((1, shape.elem_count()))?;
        let mut row_field = |t: &[f64], y: &Tensor| -> Result<Tensor> {
            let y = y.reshape(shape.dims())?;
            Ok(field(&scalar_time(t[0], &y)?, &y)?.reshape((1, shape.elem_count()))?)
        };

        let solver = AdaptiveRk {
            tableau: &DOPRI5,
            tol: self.tol,
            max_steps: self.max_steps,
        };
        let mut stats = SolverStats::default();
        let states = solver
            .solve(&mut row_field, &packed, times, &mut stats)?
            .into_iter()
            .map(|s| Ok(s.reshape(shape.dims())?))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            nfe = stats.nfe,
            accepted = stats.accepted,
            rejected = stats.rejected,
            "adaptive scalar-time solve"
        );
        Ok(Trajectory {
            times: times.to_vec(),
            states,
            stats,
        })
    }
}

impl Integrator for ScalarTimeSolver {
    fn integrate(&self, field: &mut VectorField<'_>, y0: &Tensor, times: &[f64]) -> Result<Trajectory> {
        check_times(times)?;
        if self.method.is_adaptive() {
            self.integrate_adaptive(field, y0, times)
        } else {
            self.integrate_fixed(field, y0, times)
        }
    }
}

/// 0-dim time tensor in the dtype of the state.
fn scalar_time(t: f64, like: &Tensor) -> Result<Tensor> {
    Ok(Tensor::new(t, like.device())?.to_dtype(like.dtype())?)
}

/// Linear interpolation between grid points; exact at both ends.
fn interpolate(t0: f64, t1: f64, y0: &Tensor, y1: &Tensor, t: f64) -> Result<Tensor> {
    if t == t0 {
        return Ok(y0.clone());
    }
    if t == t1 {
        return Ok(y1.clone());
    }
    let w = (t - t0) / (t1 - t0);
    Ok((y0 + ((y1 - y0)? * w)?)?)
}
