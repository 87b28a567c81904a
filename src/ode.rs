//! ODE integrators for flow-matching sampling.
//!
//! Two interchangeable backends behind the [`Integrator`] trait:
//!
//! - [`scalar_time`] — one shared time for the whole batch. Fixed-grid
//!   Euler, midpoint and RK4, or adaptive Dormand-Prince 5(4).
//! - [`batched`] — each batch item is flattened to a vector and integrated
//!   with its own time and step size (Tsit5 or Dormand-Prince 5(4)).
//!
//! ## Vector field
//!
//! The field is called as `f(t, x)` with `x` in the caller's shape. The
//! scalar-time backend passes `t` as a 0-dim tensor, the batched backend as
//! a `[B]` vector; both broadcast the same way in the predictors.
//!
//! Both backends return the state at every requested time.

pub mod adaptive;
pub mod batched;
pub mod scalar_time;
pub mod tableau;

use candle_core::Tensor;

use crate::config::{OdeBackend, OdeConfig};
use crate::{Error, Result};
use batched::BatchedAdaptiveSolver;
use scalar_time::ScalarTimeSolver;

/// `dx/dt = f(t, x)`.
pub type VectorField<'a> = dyn FnMut(&Tensor, &Tensor) -> Result<Tensor> + 'a;

/// Work counters of one integration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolverStats {
    /// Vector field evaluations.
    pub nfe: usize,
    /// Accepted steps (every step of a fixed-grid method).
    pub accepted: usize,
    /// Rejected steps of adaptive methods.
    pub rejected: usize,
}

/// States at the requested times, in order.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub times: Vec<f64>,
    pub states: Vec<Tensor>,
    pub stats: SolverStats,
}

impl Trajectory {
    /// State at the last requested time.
    pub fn last(&self) -> Result<&Tensor> {
        self.states
            .last()
            .ok_or_else(|| Error::Solver("empty trajectory".into()))
    }
}

/// Common interface for all integrators.
pub trait Integrator {
    /// Integrate `field` from `y0` at `times[0]` through every later entry of `times`.
    fn integrate(&self, field: &mut VectorField<'_>, y0: &Tensor, times: &[f64]) -> Result<Trajectory>;
}

/// Integrator selected by an [`OdeConfig`].
#[derive(Debug, Clone)]
pub enum OdeSolver {
    ScalarTime(ScalarTimeSolver),
    BatchedAdaptive(BatchedAdaptiveSolver),
}

impl OdeSolver {
    pub fn from_config(cfg: &OdeConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(match cfg.backend {
            OdeBackend::ScalarTime => OdeSolver::ScalarTime(ScalarTimeSolver::new(cfg)),
            OdeBackend::BatchedAdaptive => OdeSolver::BatchedAdaptive(BatchedAdaptiveSolver::new(cfg)),
        })
    }
}

impl Integrator for OdeSolver {
    fn integrate(&self, field: &mut VectorField<'_>, y0: &Tensor, times: &[f64]) -> Result<Trajectory> {
        match self {
            OdeSolver::ScalarTime(solver) => solver.integrate(field, y0, times),
            OdeSolver::BatchedAdaptive(solver) => solver.integrate(field, y0, times),
        }
    }
}

/// `steps` evenly spaced points from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let delta = (end - start) / (steps - 1) as f64;
            let mut grid: Vec<f64> = (0..steps).map(|i| start + delta * i as f64).collect();
            grid[steps - 1] = end;
            grid
        }
    }
}

/// Requested times must be finite and strictly increasing.
pub(crate) fn check_times(times: &[f64]) -> Result<()> {
    if times.is_empty() {
        return Err(Error::shape("time grid is empty"));
    }
    if times.iter().any(|t| !t.is_finite()) {
        return Err(Error::shape(format!("time grid must be finite, got {times:?}")));
    }
    if times.windows(2).any(|w| w[1] <= w[0]) {
        return Err(Error::shape(format!("time grid must be strictly increasing, got {times:?}")));
    }
    Ok(())
}
