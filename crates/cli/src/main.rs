use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use embedmem_common::{CtrDataset, EmbeddingConfig, FieldLayout};
use embedmem_core::lookup::{CompoHashNode, ModHashNode};
use embedmem_core::{compression_stats, ExecPath, LookupNode};
use embedmem_train::{LrDecay, PruneSchedule, Trainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "embedmem", about = "Compressed embedding tables for CTR models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print parameter and byte counts for an embedding config.
    Stats(StatsArgs),
    /// Hash ids through a lookup node on both execution paths.
    Hash(HashArgs),
    /// Train an embedding layer and a logistic head on CTR data.
    Train(TrainArgs),
}

// ── Stats ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct StatsArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

// ── Hash ───────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, ValueEnum)]
enum HashKind {
    Mod,
    Compo,
}

#[derive(Parser, Debug)]
struct HashArgs {
    #[arg(long, value_enum, default_value = "mod")]
    kind: HashKind,
    /// Rows per table.
    #[arg(long)]
    nembed: usize,
    /// Number of tables (compositional only).
    #[arg(long, default_value_t = 2)]
    ntable: usize,
    /// Ids to hash.
    #[arg(required = true, allow_negative_numbers = true)]
    ids: Vec<i64>,
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Tab-separated CTR file or directory; synthetic data when omitted.
    #[arg(long)]
    data: Option<PathBuf>,
    #[arg(long, default_value_t = 20_000)]
    synthetic_examples: usize,
    /// Comma-separated per-slot vocabulary sizes; uniform when omitted.
    #[arg(long, value_delimiter = ',')]
    field_sizes: Vec<usize>,
    #[arg(long, default_value_t = 0.1)]
    valid_fraction: f64,
    #[arg(long, default_value = "checkpoints")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 128)]
    batch_size: usize,
    #[arg(long, default_value_t = 2000)]
    max_steps: usize,
    #[arg(long, default_value_t = 1e-3)]
    lr: f64,
    #[arg(long, default_value_t = 1e-5)]
    lr_min: f64,
    #[arg(long, default_value_t = 0)]
    lr_warmup_steps: usize,
    #[arg(long, default_value = "constant", value_parser = ["cosine", "linear", "constant"])]
    lr_decay: String,
    #[arg(long, default_value_t = 0.0)]
    weight_decay: f64,
    #[arg(long, default_value_t = 0.0)]
    grad_clip_max_norm: f64,
    #[arg(long, default_value_t = 0)]
    prune_start: usize,
    #[arg(long, default_value_t = 1)]
    prune_every: usize,
    /// AutoDim: search steps before retraining with the chosen dimensions.
    #[arg(long, default_value_t = 500)]
    search_steps: usize,
    #[arg(long, default_value_t = 500)]
    eval_every: usize,
    #[arg(long, default_value_t = 100)]
    log_every: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Stats(args) => cmd_stats(args),
        Command::Hash(args) => cmd_hash(args),
        Command::Train(args) => cmd_train(args),
    }
}

/// Load `path`, or write the default config there and use it.
fn load_or_create(path: &Path) -> Result<EmbeddingConfig> {
    if path.exists() {
        return EmbeddingConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()));
    }
    let default = EmbeddingConfig::default();
    default.save(path)?;
    eprintln!("Created default config at {}", path.display());
    Ok(default)
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_stats(args: StatsArgs) -> Result<()> {
    let config = load_or_create(&args.config)?;
    config.validate()?;
    let s = compression_stats(&config);
    println!("scheme           {}", s.kind);
    println!("rows x dim       {} x {}", config.num_embeddings, config.embedding_dim);
    println!("train params     {}", s.train_params);
    println!("inference bytes  {}", s.inference_bytes);
    println!("full bytes       {}", s.full_bytes);
    println!("compression      {:.2}x", s.compression_ratio);
    Ok(())
}

fn cmd_hash(args: HashArgs) -> Result<()> {
    let node: Box<dyn LookupNode> = match args.kind {
        HashKind::Mod => Box::new(ModHashNode::new(args.nembed)?),
        HashKind::Compo => Box::new(CompoHashNode::new(args.ntable, args.nembed)?),
    };
    let n = args.ids.len();
    let ids = Tensor::from_vec(args.ids.clone(), n, &Device::Cpu)?;
    let host = node.forward(&[&ids], ExecPath::Host)?;
    let kernel = node.forward(&[&ids], ExecPath::Kernel)?;
    let host_v: Vec<i64> = host.flatten_all()?.to_vec1()?;
    let kernel_v: Vec<i64> = kernel.flatten_all()?.to_vec1()?;
    anyhow::ensure!(
        host_v == kernel_v,
        "{} host and kernel paths disagree",
        node.name()
    );

    let per_id = host_v.len() / n.max(1);
    for (id, rows) in args.ids.iter().zip(host_v.chunks(per_id.max(1))) {
        println!("{id}\t{rows:?}");
    }
    Ok(())
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let embed_config = load_or_create(&args.config)?;
    let layout = if args.field_sizes.is_empty() {
        FieldLayout::uniform(embed_config.num_embeddings, embed_config.num_slot)
    } else {
        FieldLayout::new(args.field_sizes.clone())
    };
    anyhow::ensure!(
        layout.num_slot() == embed_config.num_slot,
        "{} field sizes for {} slots",
        layout.num_slot(),
        embed_config.num_slot
    );

    let dataset = match &args.data {
        Some(path) => CtrDataset::load(path, embed_config.num_slot)
            .with_context(|| format!("loading CTR data from {}", path.display()))?,
        None => CtrDataset::synthetic(&layout, args.synthetic_examples, embed_config.seed),
    };
    anyhow::ensure!(
        dataset.max_id() <= embed_config.num_embeddings,
        "data uses id {} but the table has {} rows",
        dataset.max_id().saturating_sub(1),
        embed_config.num_embeddings
    );
    let (train_ds, valid_ds) = dataset.split(args.valid_fraction);
    eprintln!(
        "Loaded {} train / {} validation examples",
        train_ds.len(),
        valid_ds.len()
    );

    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        max_steps: args.max_steps,
        lr: args.lr,
        lr_min: args.lr_min,
        lr_warmup_steps: args.lr_warmup_steps,
        lr_decay: args.lr_decay.parse::<LrDecay>()?,
        weight_decay: args.weight_decay,
        grad_clip_max_norm: args.grad_clip_max_norm,
        prune: PruneSchedule {
            start: args.prune_start,
            every: args.prune_every,
        },
        output_dir: args.output_dir.clone(),
    };

    let device = Device::cuda_if_available(0)?;
    let mut trainer = Trainer::new(embed_config.clone(), trainer_config, device)?;
    trainer.set_frequencies(&train_ds.frequencies(embed_config.num_embeddings))?;

    let valid_batches: Vec<_> = valid_ds.batches(args.batch_size).collect();
    let search = trainer.behavior().arch_search;
    let pb = ProgressBar::new(args.max_steps as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} steps {msg}")?
            .progress_chars("=>-"),
    );

    'outer: loop {
        let mut valid_iter = valid_batches.iter().cycle();
        let mut stepped = false;
        for batch in train_ds.batches(args.batch_size) {
            if trainer.global_step >= args.max_steps {
                break 'outer;
            }
            let searching = search && trainer.behavior().arch_search;
            let m = match valid_iter.next() {
                Some(valid) if searching => trainer.arch_step(&batch, valid)?,
                _ => trainer.step(&batch)?,
            };
            stepped = true;
            pb.inc(1);

            if args.log_every > 0 && m.step % args.log_every == 0 {
                pb.set_message(format!("loss {:.4} lr {:.2e}", m.loss, m.lr));
                tracing::info!(step = m.step, loss = m.loss, grad_norm = m.grad_norm, "train");
            }
            if searching && trainer.global_step >= args.search_steps {
                let dims = trainer.retrain(layout.sizes())?;
                pb.println(format!("AutoDim search done; per-slot dims {dims:?}"));
            }
            if args.eval_every > 0 && trainer.global_step % args.eval_every == 0 {
                let e = trainer.evaluate(&valid_batches, false)?;
                pb.println(format!(
                    "[eval] step {} loss={:.4} acc={:.4} auc={:.4}",
                    trainer.global_step, e.loss, e.accuracy, e.auc
                ));
            }
        }
        if !stepped {
            anyhow::bail!("no full batch of size {} in the training data", args.batch_size);
        }
    }
    pb.finish_with_message("done");

    let e = trainer.evaluate(&valid_batches, false)?;
    eprintln!("Final: loss={:.4} acc={:.4} auc={:.4}", e.loss, e.accuracy, e.auc);
    if trainer.behavior().has_compressed_inference {
        let c = trainer.evaluate(&valid_batches, true)?;
        eprintln!("Compressed inference: loss={:.4} acc={:.4} auc={:.4}", c.loss, c.accuracy, c.auc);
    }
    if search && trainer.behavior().arch_search {
        eprintln!("AutoDim search did not finish within max_steps; saving searched weights");
    }

    let path = trainer.save(&args.output_dir)?;
    eprintln!("Training done. Saved to {}", path.display());
    Ok(())
}
