use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use unmask::{generate, InitPolicy, Tokenizer};
use unmask_run::{checkpoint_file_name, init_checkpoint, restore_latest, RunConfig};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log every generation step
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Unmask a sequence with the newest checkpoint in OUT_DIR
    Generate(GenerateArgs),
    /// Write a randomly initialized checkpoint to OUT_DIR
    Init(InitArgs),
}

#[derive(Args)]
struct ModelFlags {
    /// Training config (json) describing the architecture
    config: PathBuf,

    /// Share embedding and decoder weights
    #[arg(long)]
    tie_weights: bool,

    /// Apply a final LayerNorm before the decoder
    #[arg(long)]
    final_norm: bool,
}

#[derive(Args)]
struct GenerateArgs {
    #[command(flatten)]
    model: ModelFlags,

    /// Directory holding checkpoint files
    #[arg(env = "PT_OUTPUT_DIR", default_value = "/tmp")]
    out_dir: PathBuf,

    /// Initial sequence: "mask" or "random"
    #[arg(long, default_value = "mask")]
    mask: String,

    /// Sequence length
    #[arg(long, default_value_t = 512)]
    length: usize,

    /// Seed for the reveal order and sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Ignored; generation never applies dropout
    #[arg(long, default_value_t = 0.0)]
    dropout: f32,
}

#[derive(Args)]
struct InitArgs {
    #[command(flatten)]
    model: ModelFlags,

    /// Directory to write the checkpoint into
    out_dir: PathBuf,

    /// Epoch number embedded in the file name
    #[arg(long, default_value_t = 0)]
    epoch: u64,

    /// Seed for the initial weights
    #[arg(long)]
    seed: Option<u64>,
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn run_generate(args: GenerateArgs, tokenizer: &Tokenizer) -> Result<()> {
    let policy: InitPolicy = args.mask.parse()?;
    if args.dropout != 0.0 {
        log::warn!("dropout {} ignored during generation", args.dropout);
    }

    let config = RunConfig::load(&args.model.config)
        .with_context(|| format!("reading config {}", args.model.config.display()))?;
    let model_args = config.model_args(tokenizer, args.model.tie_weights, args.model.final_norm)?;
    let (epoch, model) = restore_latest(model_args, &args.out_dir)
        .with_context(|| format!("restoring checkpoint from {}", args.out_dir.display()))?;
    println!("{epoch}");

    let mut rng = rng_from(args.seed);
    let generated = generate(args.length, policy, tokenizer, &model, &mut rng)?;
    println!("{}", generated.symbols);
    Ok(())
}

fn run_init(args: InitArgs, tokenizer: &Tokenizer) -> Result<()> {
    let config = RunConfig::load(&args.model.config)
        .with_context(|| format!("reading config {}", args.model.config.display()))?;
    let model_args = config.model_args(tokenizer, args.model.tie_weights, args.model.final_norm)?;

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating {}", args.out_dir.display()))?;
    let path = args.out_dir.join(checkpoint_file_name(args.epoch));
    init_checkpoint(model_args, &path, &mut rng_from(args.seed))
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Saved checkpoint to {:?}", path);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("unmask", level)
        .with_module_level("unmask_run", level)
        .init()
        .expect("start logger");

    let tokenizer = Tokenizer::protein();
    match cli.command {
        Command::Generate(args) => run_generate(args, &tokenizer),
        Command::Init(args) => run_init(args, &tokenizer),
    }
}
