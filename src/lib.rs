//! VoiceBox-style conditional flow matching for speech features, on candle.
//!
//! A velocity-field predictor conditioned on phonemes and acoustic context
//! is trained with the optimal-transport conditional flow matching loss and
//! sampled by integrating the learned field from noise with an ODE solver.
//!
//! ## Architecture
//!
//! ```text
//! phoneme ids ─┐
//! cond ────────┼→ FrameEmbed → [time token | frames] → U-Net Transformer → velocity
//! x_t ─────────┘                    ↑
//!                          sinusoidal(t)
//!
//! training:  x1, x0 ~ N(0, I), t ~ U(0, 1) → masked MSE against x1 - (1 - σ) x0
//! sampling:  y0 ~ N(0, I) → ODE solve over t ∈ [0, 1] with guided field → y1
//! ```
//!
//! ## Modules
//!
//! - [`config`] — serde configurations with defaults and validation
//! - [`mask`] — span and Bernoulli sequence masks
//! - [`model`] — backbone, duration predictor and VoiceBox
//! - [`ode`] — scalar-time and batched-adaptive integrators
//! - [`cfm`] — training loss and sampling
//! - [`rng`] — seeded random tensor draws

pub mod cfm;
pub mod config;
pub mod mask;
pub mod model;
pub mod ode;
pub mod rng;

mod error;

pub use error::{Error, Result};
