//! rvq-codec CLI: residual vector quantization of latent frames.
//!
//! Tensors are exchanged as safetensors files:
//!
//! - `init` writes a freshly initialised checkpoint for a config
//! - `encode` reads `latents` `[batch, D, time]` and writes `codes`
//!   `[batch, N, time]` (u32)
//! - `decode` reads `codes` and writes the reconstructed `latents`
//!
//! # Output
//!
//! Prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"command":"encode","output":"/tmp/codes.safetensors","shape":[1,9,250]}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use rvq_codec::{Codec, QuantizerConfig};

#[derive(Parser, Debug)]
#[command(
    name = "rvq-codec",
    about = "Residual vector quantization of latent frames",
    long_about = "Encode continuous latent frames into discrete RVQ codes and back.\n\
                  Inputs and outputs are safetensors files; a JSON summary line is printed to stdout."
)]
struct Args {
    /// Quantizer config (JSON). Defaults are used when omitted.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a randomly initialised checkpoint.
    Init {
        /// Checkpoint path to write.
        #[arg(long, short = 'o')]
        output: PathBuf,

        /// Initialisation seed. Overrides the config seed.
        #[arg(long, short = 's')]
        seed: Option<u64>,
    },
    /// Quantize `latents` into `codes`.
    Encode {
        /// Checkpoint to load.
        #[arg(long, short = 'w')]
        weights: PathBuf,

        /// Safetensors file holding a `latents` tensor.
        #[arg(long, short = 'i')]
        input: PathBuf,

        #[arg(long, short = 'o')]
        output: PathBuf,

        /// Number of leading stages to use (1..=N). All stages when omitted.
        #[arg(long, short = 'n')]
        n_quantizers: Option<usize>,
    },
    /// Reconstruct `latents` from `codes`.
    Decode {
        #[arg(long, short = 'w')]
        weights: PathBuf,

        /// Safetensors file holding a `codes` tensor.
        #[arg(long, short = 'i')]
        input: PathBuf,

        #[arg(long, short = 'o')]
        output: PathBuf,
    },
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

    let config = match &args.config {
        Some(path) => QuantizerConfig::from_json_file(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => QuantizerConfig::default(),
    };

    match args.command {
        Command::Init { output, seed } => {
            let config = QuantizerConfig {
                seed: seed.or(config.seed),
                ..config
            };
            ensure_parent(&output)?;
            let codec = Codec::new(config)?;
            codec
                .save(&output)
                .map_err(|e| anyhow::anyhow!("failed to write checkpoint: {e}"))?;
            let cfg = codec.config();
            println!(
                r#"{{"command":"init","output":"{path}","n_codebooks":{n},"codebook_size":{k},"input_dim":{d}}}"#,
                path = output.display(),
                n = cfg.n_codebooks,
                k = cfg.codebook_size,
                d = cfg.input_dim,
            );
        }
        Command::Encode {
            weights,
            input,
            output,
            n_quantizers,
        } => {
            let codec = Codec::load(config, &weights)
                .map_err(|e| anyhow::anyhow!("failed to load checkpoint: {e}"))?;
            let latents = read_tensor(&input, "latents")?;
            let frames = rvq_codec::Frames::from_tensor(&latents)?;
            codec.check_input(&frames)?;

            tracing::info!(
                "Encoding {:?} latents with {} stages...",
                frames.dims(),
                n_quantizers.unwrap_or(codec.config().n_codebooks)
            );
            let out = codec.quantize(&frames, n_quantizers)?;
            let codes = out.codes.to_tensor(&Device::Cpu)?;
            let shape = codes.dims().to_vec();
            write_tensor(&output, "codes", codes)?;
            println!(
                r#"{{"command":"encode","output":"{path}","shape":{shape:?},"active_stages":{active}}}"#,
                path = output.display(),
                active = out.mean_active_stages() + 1.0,
            );
        }
        Command::Decode {
            weights,
            input,
            output,
        } => {
            let codec = Codec::load(config, &weights)
                .map_err(|e| anyhow::anyhow!("failed to load checkpoint: {e}"))?;
            let codes = read_tensor(&input, "codes")?;
            let latents = codec.decode_tensor(&codes)?;
            let shape = latents.dims().to_vec();
            write_tensor(&output, "latents", latents)?;
            println!(
                r#"{{"command":"decode","output":"{path}","shape":{shape:?}}}"#,
                path = output.display(),
            );
        }
    }

    Ok(())
}

fn read_tensor(path: &Path, name: &str) -> anyhow::Result<Tensor> {
    let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("failed to read {}", path.display()))?;
    tensors
        .remove(name)
        .with_context(|| format!("{} has no `{name}` tensor", path.display()))
}

fn write_tensor(path: &Path, name: &str, tensor: Tensor) -> anyhow::Result<()> {
    ensure_parent(path)?;
    let tensors = HashMap::from([(name.to_string(), tensor)]);
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
