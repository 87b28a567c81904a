//! Batched-adaptive backend.
//!
//! Packs a `[B, ...]` state into `[B, n]`, integrates every item with its
//! own time and step size, and unpacks each saved state back to `[B, ...]`.
//! The field receives a `[B]` time vector.

use candle_core::Tensor;

use super::adaptive::{AdaptiveRk, Tolerance};
use super::tableau::{ButcherTableau, DOPRI5, TSIT5};
use super::{check_times, Integrator, SolverStats, Trajectory, VectorField};
use crate::config::{AdaptiveMethod, OdeConfig};
use crate::{Error, Result};

/// Per-item adaptive integrator.
#[derive(Debug, Clone)]
pub struct BatchedAdaptiveSolver {
    method: AdaptiveMethod,
    tol: Tolerance,
    max_steps: usize,
}

impl BatchedAdaptiveSolver {
    pub fn new(cfg: &OdeConfig) -> Self {
        Self {
            method: cfg.adaptive_method,
            tol: Tolerance {
                atol: cfg.atol,
                rtol: cfg.rtol,
            },
            max_steps: cfg.max_steps,
        }
    }

    fn tableau(&self) -> &'static ButcherTableau {
        match self.method {
            AdaptiveMethod::Tsit5 => &TSIT5,
            AdaptiveMethod::Dopri5 => &DOPRI5,
        }
    }
}

/// `[B, ...]` → `[B, n]`.
pub fn pack(x: &Tensor) -> Result<Tensor> {
    match x.rank() {
        0 => Err(Error::shape("cannot pack a 0-dim state")),
        1 => Ok(x.unsqueeze(1)?),
        _ => Ok(x.flatten_from(1)?),
    }
}

/// `[B, n]` → `shape`.
pub fn unpack(x: &Tensor, shape: &[usize]) -> Result<Tensor> {
    Ok(x.reshape(shape)?)
}

impl Integrator for BatchedAdaptiveSolver {
    fn integrate(&self, field: &mut VectorField<'_>, y0: &Tensor, times: &[f64]) -> Result<Trajectory> {
        check_times(times)?;
        let shape = y0.dims().to_vec();
        let packed = pack(y0)?;

        let mut row_field = |t: &[f64], y: &Tensor| -> Result<Tensor> {
            let t = Tensor::from_slice(t, t.len(), y.device())?.to_dtype(y.dtype())?;
            pack(&field(&t, &unpack(y, &shape)?)?)
        };

        let solver = AdaptiveRk {
            tableau: self.tableau(),
            tol: self.tol,
            max_steps: self.max_steps,
        };
        let mut stats = SolverStats::default();
        let states = solver
            .solve(&mut row_field, &packed, times, &mut stats)?
            .iter()
            .map(|s| unpack(s, &shape))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            method = ?self.method,
            batch = shape[0],
            nfe = stats.nfe,
            accepted = stats.accepted,
            rejected = stats.rejected,
            "batched adaptive solve"
        );
        Ok(Trajectory {
            times: times.to_vec(),
            states,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn pack_unpack_restores_shape() {
        let x = Tensor::randn(0f32, 1.0, (2, 5, 3), &Device::Cpu).unwrap();
        let packed = pack(&x).unwrap();
        assert_eq!(packed.dims(), &[2, 15]);
        let back = unpack(&packed, x.dims()).unwrap();
        let diff: f32 = (back - &x).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn field_sees_per_item_times() {
        let dev = Device::Cpu;
        let y0 = Tensor::zeros((3, 2, 2), DType::F32, &dev).unwrap();
        let mut field = |t: &Tensor, y: &Tensor| -> Result<Tensor> {
            assert_eq!(t.dims(), &[3]);
            Ok(y.ones_like()?)
        };
        let solver = BatchedAdaptiveSolver::new(&OdeConfig::default());
        let traj = solver.integrate(&mut field, &y0, &[0.0, 0.5, 1.0]).unwrap();
        assert_eq!(traj.states.len(), 3);
        assert_eq!(traj.states[2].dims(), &[3, 2, 2]);
        let last: Vec<f32> = traj.states[2].flatten_all().unwrap().to_vec1().unwrap();
        assert!(last.iter().all(|v| (v - 1.0).abs() < 1e-5));
    }
}
