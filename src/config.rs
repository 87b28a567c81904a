//! Configuration for the VoiceBox predictors and the flow-matching sampler.
//!
//! Defaults match the VoiceBox paper setup (24-layer, 1024-wide velocity
//! predictor; 10-layer, 512-wide duration predictor). Every struct can be
//! deserialized from JSON with unspecified fields falling back to defaults,
//! and every struct has a `validate()` that constructors run before any
//! parameter is allocated.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How the attention backend materializes the score matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendStrategy {
    /// One `[B, H, N, N]` score matrix per call.
    #[default]
    Full,
    /// Queries processed in blocks of `chunk_size`, bounding peak memory.
    Chunked { chunk_size: usize },
}

// ---------------------------------------------------------------------------
// Transformer backbone
// ---------------------------------------------------------------------------

/// Configuration for the U-Net style transformer backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Channel width of the residual stream.
    pub dim: usize,
    /// Number of layers. Must be even: half push skips, half pop them.
    pub depth: usize,
    /// Dimension per attention head (rotary embedding width).
    pub dim_head: usize,
    /// Number of attention heads.
    pub heads: usize,
    /// Feed-forward expansion factor.
    pub ff_mult: usize,
    /// Attention backend strategy.
    #[serde(default)]
    pub attend: AttendStrategy,
}

impl TransformerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(Error::config("transformer dim must be positive"));
        }
        if self.depth < 2 || self.depth % 2 != 0 {
            return Err(Error::config(format!(
                "transformer depth must be even and at least 2, got {}",
                self.depth
            )));
        }
        if self.heads == 0 || self.ff_mult == 0 {
            return Err(Error::config("heads and ff_mult must be positive"));
        }
        if self.dim_head == 0 || self.dim_head % 2 != 0 {
            return Err(Error::config(format!(
                "dim_head must be even for rotary embeddings, got {}",
                self.dim_head
            )));
        }
        if let AttendStrategy::Chunked { chunk_size: 0 } = self.attend {
            return Err(Error::config("attention chunk_size must be positive"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Duration predictor
// ---------------------------------------------------------------------------

/// Configuration for the phoneme duration predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationPredictorConfig {
    /// Phoneme vocabulary size. Id `num_phoneme_tokens` is reserved as the null id.
    pub num_phoneme_tokens: usize,

    #[serde(default = "default_duration_dim_phoneme_emb")]
    pub dim_phoneme_emb: usize,

    #[serde(default = "default_duration_dim")]
    pub dim: usize,

    #[serde(default = "default_duration_depth")]
    pub depth: usize,

    #[serde(default = "default_dim_head")]
    pub dim_head: usize,

    #[serde(default = "default_duration_heads")]
    pub heads: usize,

    #[serde(default = "default_ff_mult")]
    pub ff_mult: usize,

    /// Kernel size of the depthwise convolutional position signal. Must be odd.
    #[serde(default = "default_conv_kernel_size")]
    pub conv_pos_embed_kernel_size: usize,

    /// Groups of the positional convolution; `None` means fully depthwise.
    #[serde(default)]
    pub conv_pos_embed_groups: Option<usize>,

    #[serde(default)]
    pub attend: AttendStrategy,

    /// Per-position drop probability of the Bernoulli mask policy.
    #[serde(default = "default_duration_p_drop_prob")]
    pub p_drop_prob: f64,

    /// Range the span fraction is drawn from in the contiguous mask policy.
    #[serde(default = "default_duration_frac_lengths_mask")]
    pub frac_lengths_mask: (f64, f64),
}

impl DurationPredictorConfig {
    pub fn new(num_phoneme_tokens: usize) -> Self {
        Self {
            num_phoneme_tokens,
            dim_phoneme_emb: default_duration_dim_phoneme_emb(),
            dim: default_duration_dim(),
            depth: default_duration_depth(),
            dim_head: default_dim_head(),
            heads: default_duration_heads(),
            ff_mult: default_ff_mult(),
            conv_pos_embed_kernel_size: default_conv_kernel_size(),
            conv_pos_embed_groups: None,
            attend: AttendStrategy::Full,
            p_drop_prob: default_duration_p_drop_prob(),
            frac_lengths_mask: default_duration_frac_lengths_mask(),
        }
    }

    pub fn transformer(&self) -> TransformerConfig {
        TransformerConfig {
            dim: self.dim,
            depth: self.depth,
            dim_head: self.dim_head,
            heads: self.heads,
            ff_mult: self.ff_mult,
            attend: self.attend,
        }
    }

    pub fn mask_policy(&self) -> crate::mask::MaskPolicy {
        crate::mask::MaskPolicy {
            p_drop_prob: self.p_drop_prob,
            frac_lengths: self.frac_lengths_mask,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.transformer().validate()?;
        validate_embedding(
            self.num_phoneme_tokens,
            self.dim_phoneme_emb,
            self.dim,
            self.conv_pos_embed_kernel_size,
            self.conv_pos_embed_groups,
        )?;
        self.mask_policy().validate()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }
}

// ---------------------------------------------------------------------------
// VoiceBox velocity-field predictor
// ---------------------------------------------------------------------------

/// Configuration for the VoiceBox velocity-field predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceBoxConfig {
    /// Phoneme vocabulary size. Id `num_phoneme_tokens` is reserved as the null id.
    pub num_phoneme_tokens: usize,

    #[serde(default = "default_voicebox_dim_phoneme_emb")]
    pub dim_phoneme_emb: usize,

    /// Width of the state, the conditioning and the residual stream. Must be
    /// even (the time embedding is half sine, half cosine).
    #[serde(default = "default_voicebox_dim")]
    pub dim: usize,

    #[serde(default = "default_voicebox_depth")]
    pub depth: usize,

    #[serde(default = "default_dim_head")]
    pub dim_head: usize,

    #[serde(default = "default_voicebox_heads")]
    pub heads: usize,

    #[serde(default = "default_ff_mult")]
    pub ff_mult: usize,

    #[serde(default = "default_conv_kernel_size")]
    pub conv_pos_embed_kernel_size: usize,

    #[serde(default)]
    pub conv_pos_embed_groups: Option<usize>,

    #[serde(default)]
    pub attend: AttendStrategy,

    #[serde(default = "default_voicebox_p_drop_prob")]
    pub p_drop_prob: f64,

    #[serde(default = "default_voicebox_frac_lengths_mask")]
    pub frac_lengths_mask: (f64, f64),

    /// Guidance dropout probability used when a caller does not pick one.
    #[serde(default = "default_voicebox_cond_drop_prob")]
    pub cond_drop_prob: f64,
}

impl VoiceBoxConfig {
    pub fn new(num_phoneme_tokens: usize) -> Self {
        Self {
            num_phoneme_tokens,
            dim_phoneme_emb: default_voicebox_dim_phoneme_emb(),
            dim: default_voicebox_dim(),
            depth: default_voicebox_depth(),
            dim_head: default_dim_head(),
            heads: default_voicebox_heads(),
            ff_mult: default_ff_mult(),
            conv_pos_embed_kernel_size: default_conv_kernel_size(),
            conv_pos_embed_groups: None,
            attend: AttendStrategy::Full,
            p_drop_prob: default_voicebox_p_drop_prob(),
            frac_lengths_mask: default_voicebox_frac_lengths_mask(),
            cond_drop_prob: default_voicebox_cond_drop_prob(),
        }
    }

    pub fn transformer(&self) -> TransformerConfig {
        TransformerConfig {
            dim: self.dim,
            depth: self.depth,
            dim_head: self.dim_head,
            heads: self.heads,
            ff_mult: self.ff_mult,
            attend: self.attend,
        }
    }

    pub fn mask_policy(&self) -> crate::mask::MaskPolicy {
        crate::mask::MaskPolicy {
            p_drop_prob: self.p_drop_prob,
            frac_lengths: self.frac_lengths_mask,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.transformer().validate()?;
        if self.dim % 2 != 0 {
            return Err(Error::config(format!(
                "sinusoidal time embedding needs an even dim, got {}",
                self.dim
            )));
        }
        validate_embedding(
            self.num_phoneme_tokens,
            self.dim_phoneme_emb,
            self.dim,
            self.conv_pos_embed_kernel_size,
            self.conv_pos_embed_groups,
        )?;
        validate_probability("cond_drop_prob", self.cond_drop_prob)?;
        self.mask_policy().validate()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }
}

// ---------------------------------------------------------------------------
// Flow matching + ODE solver
// ---------------------------------------------------------------------------

/// Which integrator family drives sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OdeBackend {
    /// One shared scalar time for the whole batch.
    #[default]
    ScalarTime,
    /// Flat per-item state with per-item adaptive step sizes.
    BatchedAdaptive,
}

/// Stepping rule of the scalar-time backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarMethod {
    Euler,
    #[default]
    Midpoint,
    Rk4,
    /// Adaptive Dormand-Prince 5(4); ignores `step_size`.
    Dopri5,
}

impl ScalarMethod {
    pub fn is_adaptive(self) -> bool {
        matches!(self, ScalarMethod::Dopri5)
    }
}

/// Embedded Runge-Kutta pair of the batched-adaptive backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveMethod {
    #[default]
    Tsit5,
    Dopri5,
}

/// ODE solver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdeConfig {
    #[serde(default)]
    pub backend: OdeBackend,

    #[serde(default)]
    pub method: ScalarMethod,

    #[serde(default)]
    pub adaptive_method: AdaptiveMethod,

    /// Absolute tolerance of adaptive methods.
    #[serde(default = "default_tolerance")]
    pub atol: f64,

    /// Relative tolerance of adaptive methods.
    #[serde(default = "default_tolerance")]
    pub rtol: f64,

    /// Step size of fixed-grid methods. `None` steps exactly on the requested times.
    #[serde(default = "default_step_size")]
    pub step_size: Option<f64>,

    /// Upper bound on solver steps (accepted + rejected) before giving up.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for OdeConfig {
    fn default() -> Self {
        Self {
            backend: OdeBackend::default(),
            method: ScalarMethod::default(),
            adaptive_method: AdaptiveMethod::default(),
            atol: default_tolerance(),
            rtol: default_tolerance(),
            step_size: default_step_size(),
            max_steps: default_max_steps(),
        }
    }
}

impl OdeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.atol > 0.0 && self.rtol >= 0.0) {
            return Err(Error::config(format!(
                "tolerances must be positive, got atol={} rtol={}",
                self.atol, self.rtol
            )));
        }
        if let Some(step) = self.step_size {
            if !(step > 0.0 && step.is_finite()) {
                return Err(Error::config(format!("step_size must be positive, got {step}")));
            }
        }
        if self.max_steps == 0 {
            return Err(Error::config("max_steps must be positive"));
        }
        Ok(())
    }
}

/// Configuration for the conditional flow matching wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMatcherConfig {
    /// Noise floor of the probability path.
    #[serde(default)]
    pub sigma: f64,

    /// Guidance dropout applied to the predictor during training.
    #[serde(default)]
    pub cond_drop_prob: f64,

    #[serde(default)]
    pub ode: OdeConfig,
}

impl Default for FlowMatcherConfig {
    fn default() -> Self {
        Self {
            sigma: 0.0,
            cond_drop_prob: 0.0,
            ode: OdeConfig::default(),
        }
    }
}

impl FlowMatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.sigma) {
            return Err(Error::config(format!("sigma must lie in [0, 1), got {}", self.sigma)));
        }
        validate_probability("cond_drop_prob", self.cond_drop_prob)?;
        self.ode.validate()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }
}

// ---------------------------------------------------------------------------
// Shared validation
// ---------------------------------------------------------------------------

fn validate_embedding(
    num_phoneme_tokens: usize,
    dim_phoneme_emb: usize,
    dim: usize,
    kernel_size: usize,
    groups: Option<usize>,
) -> Result<()> {
    if num_phoneme_tokens == 0 || dim_phoneme_emb == 0 {
        return Err(Error::config("phoneme vocabulary and embedding dim must be positive"));
    }
    if kernel_size % 2 == 0 {
        return Err(Error::config(format!(
            "conv_pos_embed_kernel_size must be odd, got {kernel_size}"
        )));
    }
    let groups = groups.unwrap_or(dim);
    if groups == 0 || dim % groups != 0 {
        return Err(Error::config(format!(
            "conv_pos_embed_groups ({groups}) must divide dim ({dim})"
        )));
    }
    Ok(())
}

pub(crate) fn validate_probability(name: &str, p: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&p) {
        return Err(Error::config(format!("{name} must lie in [0, 1], got {p}")));
    }
    Ok(())
}

fn default_duration_dim_phoneme_emb() -> usize {
    512
}
fn default_duration_dim() -> usize {
    512
}
fn default_duration_depth() -> usize {
    10
}
fn default_duration_heads() -> usize {
    8
}
fn default_duration_p_drop_prob() -> f64 {
    0.2
}
fn default_duration_frac_lengths_mask() -> (f64, f64) {
    (0.1, 1.0)
}
fn default_voicebox_dim_phoneme_emb() -> usize {
    1024
}
fn default_voicebox_dim() -> usize {
    1024
}
fn default_voicebox_depth() -> usize {
    24
}
fn default_voicebox_heads() -> usize {
    16
}
fn default_voicebox_p_drop_prob() -> f64 {
    0.3
}
fn default_voicebox_frac_lengths_mask() -> (f64, f64) {
    (0.7, 1.0)
}
fn default_voicebox_cond_drop_prob() -> f64 {
    0.1
}
fn default_dim_head() -> usize {
    64
}
fn default_ff_mult() -> usize {
    4
}
fn default_conv_kernel_size() -> usize {
    31
}
fn default_tolerance() -> f64 {
    1e-5
}
fn default_step_size() -> Option<f64> {
    Some(0.0625)
}
fn default_max_steps() -> usize {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voicebox_defaults_match_paper() {
        let config = VoiceBoxConfig::new(50);
        assert_eq!(config.dim, 1024);
        assert_eq!(config.depth, 24);
        assert_eq!(config.heads, 16);
        assert_eq!(config.frac_lengths_mask, (0.7, 1.0));
        assert!((config.cond_drop_prob - 0.1).abs() < 1e-12);
        config.validate().unwrap();
    }

    #[test]
    fn duration_defaults_validate() {
        let config = DurationPredictorConfig::new(50);
        assert_eq!(config.depth, 10);
        assert_eq!(config.frac_lengths_mask, (0.1, 1.0));
        config.validate().unwrap();
    }

    #[test]
    fn odd_depth_rejected() {
        let config = VoiceBoxConfig {
            depth: 3,
            ..VoiceBoxConfig::new(10)
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn even_kernel_rejected() {
        let config = DurationPredictorConfig {
            conv_pos_embed_kernel_size: 4,
            ..DurationPredictorConfig::new(10)
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn odd_time_embedding_dim_rejected() {
        let config = VoiceBoxConfig {
            dim: 33,
            conv_pos_embed_groups: Some(1),
            ..VoiceBoxConfig::new(10)
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn deserialize_from_json() {
        let json = r#"{"num_phoneme_tokens": 50, "dim": 32, "depth": 2, "attend": {"chunked": {"chunk_size": 8}}}"#;
        let config = VoiceBoxConfig::from_json_str(json).unwrap();
        assert_eq!(config.dim, 32);
        assert_eq!(config.depth, 2);
        assert_eq!(config.attend, AttendStrategy::Chunked { chunk_size: 8 });
        // Unspecified fields should use defaults.
        assert_eq!(config.heads, 16);
        assert_eq!(config.conv_pos_embed_kernel_size, 31);
    }

    #[test]
    fn ode_config_from_json() {
        let json = r#"{"sigma": 0.01, "ode": {"backend": "batched_adaptive", "adaptive_method": "dopri5", "step_size": null}}"#;
        let config = FlowMatcherConfig::from_json_str(json).unwrap();
        assert_eq!(config.ode.backend, OdeBackend::BatchedAdaptive);
        assert_eq!(config.ode.adaptive_method, AdaptiveMethod::Dopri5);
        assert_eq!(config.ode.step_size, None);
        assert_eq!(config.ode.method, ScalarMethod::Midpoint);
        assert!((config.ode.atol - 1e-5).abs() < 1e-15);
    }

    #[test]
    fn flow_config_from_file() {
        let path = std::env::temp_dir().join(format!("voicebox-flow-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"cond_drop_prob": 0.2, "ode": {"method": "rk4"}}"#).unwrap();
        let config = FlowMatcherConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!((config.cond_drop_prob - 0.2).abs() < 1e-12);
        assert_eq!(config.ode.method, ScalarMethod::Rk4);
        assert_eq!(config.sigma, 0.0);

        assert!(matches!(
            FlowMatcherConfig::from_file(std::env::temp_dir().join("voicebox-missing.json")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn invalid_sigma_rejected() {
        let config = FlowMatcherConfig {
            sigma: 1.5,
            ..FlowMatcherConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
