//! VoiceBox demo: one training step's loss and one sample from a freshly
//! initialised model.
//!
//! No weights are loaded: parameters come from a random `VarMap`, so the
//! sample is noise-shaped. The point is to exercise the full training and
//! sampling path and report shapes and solver statistics.
//!
//! # Output
//!
//! Prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"loss":1.93,"sample_shape":[2,64,80],"nfe":16,"accepted":16,"rejected":0}
//! ```

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use voicebox_rs::{
    cfm::ConditionalFlowMatcher,
    config::{FlowMatcherConfig, OdeBackend, VoiceBoxConfig},
    model::voicebox::VoiceBox,
    rng,
};

#[derive(Parser, Debug)]
#[command(
    name = "voicebox-demo",
    about = "Run a VoiceBox training loss and a sample on random weights"
)]
struct Args {
    /// VoiceBox config JSON. Omit for a small built-in model.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Flow matcher / solver config JSON.
    #[arg(long)]
    flow_config: Option<std::path::PathBuf>,

    /// Use the batched adaptive solver instead of the scalar-time one.
    #[arg(long)]
    batched: bool,

    #[arg(long, default_value_t = 2)]
    batch: usize,

    #[arg(long, default_value_t = 64)]
    seq_len: usize,

    /// Sampling time steps (>= 2).
    #[arg(long, default_value_t = 8)]
    steps: usize,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 1.0)]
    cond_scale: f64,

    #[arg(long, short = 's', default_value_t = 0)]
    seed: u64,
}

fn demo_config() -> VoiceBoxConfig {
    VoiceBoxConfig {
        dim_phoneme_emb: 64,
        dim: 80,
        depth: 4,
        dim_head: 40,
        heads: 2,
        ..VoiceBoxConfig::new(74)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.batch == 0 || args.seq_len == 0 {
        anyhow::bail!("batch and seq_len must be positive");
    }

    let vb_config = match &args.config {
        Some(path) => VoiceBoxConfig::from_file(path)?,
        None => demo_config(),
    };
    let mut flow_config = match &args.flow_config {
        Some(path) => FlowMatcherConfig::from_file(path)?,
        None => FlowMatcherConfig::default(),
    };
    if args.batched {
        flow_config.ode.backend = OdeBackend::BatchedAdaptive;
    }

    let device = Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let voicebox = VoiceBox::new(&vb_config, vb)?;
    let cfm = ConditionalFlowMatcher::new(voicebox, flow_config)?;
    tracing::info!(
        dim = vb_config.dim,
        depth = vb_config.depth,
        params = varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
        "model initialised"
    );

    let mut rng = rng::seeded(args.seed);
    let shape = (args.batch, args.seq_len, vb_config.dim);
    let ids: Vec<u32> = (0..args.batch * args.seq_len)
        .map(|i| (i % vb_config.num_phoneme_tokens) as u32)
        .collect();
    let phoneme_ids = Tensor::from_vec(ids, (args.batch, args.seq_len), &device)?;
    let cond = rng::randn(&mut rng, shape, DType::F32, &device)?;
    let x1 = rng::randn(&mut rng, shape, DType::F32, &device)?;

    let loss = cfm
        .forward(&x1, &phoneme_ids, &cond, None, &mut rng)?
        .to_scalar::<f32>()?;
    tracing::info!(loss, "training loss");

    let trajectory =
        cfm.sample_trajectory(&phoneme_ids, &cond, None, args.steps, args.cond_scale, &mut rng)?;
    let sample = trajectory.last()?;
    let stats = trajectory.stats;

    let summary = serde_json::json!({
        "loss": loss,
        "sample_shape": sample.dims(),
        "nfe": stats.nfe,
        "accepted": stats.accepted,
        "rejected": stats.rejected,
    });
    println!("{summary}");
    Ok(())
}
