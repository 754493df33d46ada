//! burn-ldm CLI
//!
//! Inspect a denoising network configuration or run one forward pass on the
//! CPU backend.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::Distribution;
use burn_ndarray::NdArray;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use burn_ldm_convert::{
    load_diffusion_model, parameter_slots, DiffusionWeightLoader, SafeTensorFile, DEFAULT_PREFIX,
};
use burn_ldm_unet::{timestep_embedding, DiffusionConfig, DiffusionModel, HeadLayout, Topology};

type Backend = NdArray<f32>;

#[derive(Parser)]
#[command(name = "burn-ldm")]
#[command(about = "Latent diffusion U-Net in pure Rust")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ModelArgs {
    /// Built-in configuration
    #[arg(short, long, value_enum, default_value = "sd-v1")]
    preset: Preset,

    /// JSON configuration file (overrides --preset)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl ModelArgs {
    fn resolve(&self) -> Result<DiffusionConfig> {
        match &self.config {
            Some(path) => DiffusionConfig::from_file(path)
                .with_context(|| format!("Failed to read config {}", path.display())),
            None => Ok(match self.preset {
                Preset::SdV1 => DiffusionConfig::sd_v1(),
                Preset::SdV2 => DiffusionConfig::sd_v2(),
            }),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print resolved levels and the skip plan
    Inspect {
        #[command(flatten)]
        model: ModelArgs,

        /// List every parameter slot with its checkpoint name and shape
        /// (builds the network with zero weights)
        #[arg(long)]
        slots: bool,

        /// Name prefix for listed slots
        #[arg(long, default_value = DEFAULT_PREFIX)]
        prefix: String,
    },

    /// Run one denoising step on random inputs
    Run {
        #[command(flatten)]
        model: ModelArgs,

        /// Safetensors checkpoint (falls back to the config's weight source,
        /// then to random initialization)
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Tensor name prefix inside the checkpoint
        #[arg(long, default_value = DEFAULT_PREFIX)]
        prefix: String,

        /// Latent height
        #[arg(long, default_value = "32")]
        height: usize,

        /// Latent width
        #[arg(long, default_value = "32")]
        width: usize,

        /// Batch size
        #[arg(long, default_value = "1")]
        batch: usize,

        /// Diffusion timestep
        #[arg(long, default_value = "999")]
        timestep: f32,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    SdV1,
    SdV2,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { model, slots, prefix } => inspect(&model.resolve()?, slots, &prefix),
        Commands::Run {
            model,
            weights,
            prefix,
            height,
            width,
            batch,
            timestep,
        } => run(&model.resolve()?, weights, &prefix, [batch, height, width], timestep),
    }
}

fn inspect(config: &DiffusionConfig, list_slots: bool, prefix: &str) -> Result<()> {
    let topology = Topology::new(config).context("Invalid configuration")?;

    let heads = match config.heads {
        HeadLayout::Count(n) => format!("{} heads per level", n),
        HeadLayout::Dim(d) => format!("{}-wide heads", d),
    };
    println!("Configuration:");
    println!("  Context:     {} x {}", config.max_length, config.context_length);
    println!("  Heads:       {}", heads);
    println!(
        "  Projection:  {}",
        if config.dense_projection { "dense" } else { "1x1 conv" }
    );
    println!("  Res blocks:  {} per level", config.num_res_blocks);
    println!();

    println!("Levels:");
    for (level, spec) in topology.levels.iter().enumerate() {
        let attention = topology.down[level].steps.iter().any(|s| s.attention.is_some());
        println!(
            "  {}: {:>5} channels, {:>2} x {:<3} heads{}",
            level,
            spec.channels,
            spec.num_heads,
            spec.head_dim,
            if attention { "" } else { " (no attention)" }
        );
    }
    println!();

    println!("Decoder skips (coarsest first):");
    for plan in &topology.up {
        let widths: Vec<String> = plan
            .steps
            .iter()
            .map(|s| format!("{}", s.in_channels))
            .collect();
        println!("  level {}: concat -> [{}]", plan.level, widths.join(", "));
    }
    println!(
        "  {} pushes, {} pops, latent / {}",
        topology.skip_pushes(),
        topology.skip_pops(),
        topology.spatial_factor()
    );
    println!();

    if list_slots {
        let device = Default::default();
        let slots =
            parameter_slots::<Backend>(config, prefix, &device).context("Failed to enumerate parameters")?;
        for slot in &slots {
            println!("  {} {:?}", slot.name, slot.shape);
        }
        let total: usize = slots.iter().map(|s| s.shape.iter().product::<usize>()).sum();
        println!("Parameters: {} tensors, {} values", slots.len(), total);
    }

    Ok(())
}

fn run(
    config: &DiffusionConfig,
    weights: Option<PathBuf>,
    prefix: &str,
    [batch, height, width]: [usize; 3],
    timestep: f32,
) -> Result<()> {
    let device = Default::default();

    let start = Instant::now();
    let model: DiffusionModel<Backend> = match &weights {
        Some(path) => {
            let file = SafeTensorFile::open(path)
                .with_context(|| format!("Failed to open weights {}", path.display()))?;
            DiffusionWeightLoader::with_prefix(&file, prefix)
                .load(config, &device)
                .context("Failed to load weights")?
        }
        None if config.weights.is_some() => {
            load_diffusion_model(config, &device).context("Failed to load configured weights")?
        }
        None => DiffusionModel::new(config, &device).context("Invalid configuration")?,
    };
    tracing::info!(
        elapsed = ?start.elapsed(),
        pretrained = weights.is_some() || config.weights.is_some(),
        "model ready"
    );

    let latent = Tensor::<Backend, 4>::random(
        [batch, height, width, config.latent_channels],
        Distribution::Normal(0.0, 1.0),
        &device,
    );
    let context = Tensor::<Backend, 3>::random(
        [batch, config.max_length, config.context_length],
        Distribution::Normal(0.0, 1.0),
        &device,
    );
    let timesteps = Tensor::<Backend, 1>::full([batch], timestep, &device);
    let t_emb = timestep_embedding(timesteps, config.time_embed_input_dim, 10000.0, &device);

    let start = Instant::now();
    let noise = model
        .try_forward(latent, t_emb, context)
        .context("Forward pass rejected the inputs")?;
    let elapsed = start.elapsed();

    let dims = noise.dims();
    let values = noise.into_data().to_vec::<f32>().map_err(|e| anyhow::anyhow!("{:?}", e))?;
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32).sqrt();

    println!("Output:  {:?}", dims);
    println!("Mean:    {:.6}", mean);
    println!("Std:     {:.6}", std);
    println!("Elapsed: {:.2?}", elapsed);

    Ok(())
}
