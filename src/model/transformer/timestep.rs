//! Learned sinusoidal embedding of the flow time.
//!
//! Maps a `[B]` vector of times in `[0, 1]` to `[B, dim]`:
//! ```text
//! freqs = t · w · 2π          w: [dim / 2], learned, initialised N(0, 1)
//! emb   = [sin(freqs), cos(freqs)]
//! ```

use candle_core::{Tensor, D};
use candle_nn::VarBuilder;

use crate::{Error, Result};

/// Random-Fourier time embedding with learned frequencies.
#[derive(Debug, Clone)]
pub struct LearnedSinusoidalPosEmb {
    weights: Tensor,
    dim: usize,
}

impl LearnedSinusoidalPosEmb {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        if dim % 2 != 0 {
            return Err(Error::config(format!("sinusoidal embedding dim must be even, got {dim}")));
        }
        let weights = vb.get_with_hints(
            dim / 2,
            "weights",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Ok(Self { weights, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `times`: `[B]` → `[B, dim]`.
    pub fn forward(&self, times: &Tensor) -> Result<Tensor> {
        if times.rank() != 1 {
            return Err(Error::shape(format!(
                "time embedding expects a [batch] vector, got {:?}",
                times.dims()
            )));
        }
        let times = times.to_dtype(self.weights.dtype())?.unsqueeze(1)?;
        let freqs = (times.broadcast_mul(&self.weights.unsqueeze(0)?)? * (2.0 * std::f64::consts::PI))?;
        Ok(Tensor::cat(&[&freqs.sin()?, &freqs.cos()?], D::Minus1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn embedding_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let emb = LearnedSinusoidalPosEmb::new(32, vb).unwrap();
        let t = Tensor::new(&[0.1f32, 0.5, 0.9], &dev).unwrap();
        assert_eq!(emb.forward(&t).unwrap().dims(), &[3, 32]);
    }

    #[test]
    fn time_zero_is_all_sine_zero_cosine_one() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let emb = LearnedSinusoidalPosEmb::new(8, vb).unwrap();
        let out: Vec<Vec<f32>> = emb
            .forward(&Tensor::new(&[0f32], &dev).unwrap())
            .unwrap()
            .to_vec2()
            .unwrap();
        assert!(out[0][..4].iter().all(|v| v.abs() < 1e-6));
        assert!(out[0][4..].iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn varies_with_time() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let emb = LearnedSinusoidalPosEmb::new(64, vb).unwrap();
        let a = emb.forward(&Tensor::new(&[0.1f32], &dev).unwrap()).unwrap();
        let b = emb.forward(&Tensor::new(&[0.9f32], &dev).unwrap()).unwrap();
        let diff: f32 = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff > 0.1);
    }

    #[test]
    fn odd_dim_rejected() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        assert!(matches!(LearnedSinusoidalPosEmb::new(7, vb), Err(Error::Config(_))));
    }
}
