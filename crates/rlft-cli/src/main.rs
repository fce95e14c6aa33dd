//! rlft CLI
//!
//! Command-line tools for inspecting GRPO training artifacts and running a
//! small synthetic fine-tuning demo.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing_subscriber::EnvFilter;

use rlft::checkpoint::{
    elapsed_since_last_save, ArtifactStore, FsStore, SaveMode, TrainerState, TRAINER_STATE_FILE,
};
use rlft::config::DEFAULT_RESPONSE_DELIMITER;
use rlft::utils::format_duration;

#[derive(Parser)]
#[command(name = "rlft")]
#[command(version, about = "rlft - RL fine-tuning objective for causal LMs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report checkpoint freshness of an output directory
    Status {
        /// Training output directory
        #[arg(default_value = "grpo-output")]
        output_dir: PathBuf,

        /// Checkpoints are adapters written to <output_dir>/lora
        #[arg(long)]
        adapter: bool,

        /// Save interval in seconds
        #[arg(long, default_value = "3600")]
        interval: u64,
    },

    /// Prepare a JSON-lines batch and print its response mask (requires hf feature)
    Mask {
        /// JSON-lines file of {"completion": [...], "advantage": ...}
        data: PathBuf,

        /// tokenizer.json to use (byte-level tokenizer if omitted)
        #[arg(long)]
        tokenizer: Option<PathBuf>,

        /// tokenizer_config.json holding a chat_template (DeepSeek template if omitted)
        #[arg(long)]
        template: Option<PathBuf>,

        /// Text marking the start of the scored region
        #[arg(long, default_value = DEFAULT_RESPONSE_DELIMITER)]
        delimiter: String,

        /// Maximum formatted length in characters
        #[arg(long, default_value = "512")]
        max_length: usize,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Demo: short GRPO fine-tuning run on a toy model (requires --features torch)
    Demo {
        /// Number of optimizer steps
        #[arg(long, default_value = "50")]
        steps: usize,

        /// Learning rate
        #[arg(long, default_value = "0.01")]
        lr: f64,

        /// Where checkpoints are written
        #[arg(long, default_value = "grpo-demo")]
        output_dir: PathBuf,

        /// JSON config overriding the demo defaults
        #[arg(long)]
        config: Option<PathBuf>,

        /// Also append metrics to this JSON-lines file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status {
            output_dir,
            adapter,
            interval,
        } => {
            status(output_dir, adapter, interval)?;
        }
        Commands::Mask {
            data: _data,
            tokenizer: _tokenizer,
            template: _template,
            delimiter: _delimiter,
            max_length: _max_length,
            json: _json,
        } => {
            #[cfg(feature = "hf")]
            {
                mask(
                    &_data,
                    _tokenizer.as_deref(),
                    _template.as_deref(),
                    &_delimiter,
                    _max_length,
                    _json,
                )?;
            }
            #[cfg(not(feature = "hf"))]
            {
                tracing::error!("Mask inspection requires the 'hf' feature. Rebuild with:");
                tracing::error!("  cargo build --features hf");
            }
        }
        Commands::Demo {
            steps: _steps,
            lr: _lr,
            output_dir: _output_dir,
            config: _config,
            log_file: _log_file,
        } => {
            #[cfg(feature = "torch")]
            {
                demo::run(_steps, _lr, _output_dir, _config, _log_file)?;
            }
            #[cfg(not(feature = "torch"))]
            {
                tracing::error!("The demo requires the 'torch' feature. Rebuild with:");
                tracing::error!("  cargo build --features torch");
                tracing::error!("Note: libtorch must be installed.");
            }
        }
    }

    Ok(())
}

fn status(output_dir: PathBuf, adapter: bool, interval: u64) -> Result<()> {
    let mode = if adapter {
        SaveMode::Adapter
    } else {
        SaveMode::Full
    };
    let probe = mode.probe_path(&output_dir);
    let interval = Duration::from_secs(interval);

    println!("Output directory: {}", output_dir.display());
    println!("Probe artifact:   {}", probe.display());

    let store = FsStore;
    if store.exists(&probe)? {
        let elapsed = elapsed_since_last_save(&store, &probe, SystemTime::now())?;
        println!("Last save:        {} ago", format_duration(elapsed));
        println!("Save due:         {}", if elapsed > interval { "yes" } else { "no" });
    } else {
        println!("Last save:        never");
        println!("Save due:         yes");
    }

    if output_dir.join(TRAINER_STATE_FILE).exists() {
        let state = TrainerState::load(&output_dir)?;
        println!("Saves recorded:   {}", state.save_count);
        println!(
            "Training time:    {}",
            format_duration(Duration::from_secs_f64(state.elapsed_secs.max(0.0)))
        );
        println!("Written by:       rlft {}", state.version);
    }

    Ok(())
}

#[cfg(feature = "hf")]
fn mask(
    data: &std::path::Path,
    tokenizer: Option<&std::path::Path>,
    template: Option<&std::path::Path>,
    delimiter: &str,
    max_length: usize,
    json: bool,
) -> Result<()> {
    use rlft::data::read_jsonl;
    use rlft::hf::{HfTokenizer, TemplateFormatter};
    use rlft::prepare::{ByteTokenizer, SequencePreparer, Tokenizer};

    let file = std::fs::File::open(data)?;
    let examples = read_jsonl(std::io::BufReader::new(file))?;
    tracing::info!(path = %data.display(), examples = examples.len(), "Loaded batch");

    let tokenizer: Box<dyn Tokenizer> = match tokenizer {
        Some(path) => Box::new(HfTokenizer::from_file(path)?),
        None => Box::new(ByteTokenizer),
    };
    let formatter = match template {
        Some(path) => TemplateFormatter::from_tokenizer_config(path)?,
        None => TemplateFormatter::deepseek(),
    };

    let preparer = SequencePreparer::from_tokenizer(&*tokenizer, delimiter, max_length, 0)?;
    let prepared = preparer.prepare(&examples, &formatter, &*tokenizer)?;
    let counts = prepared.mask.counts();

    if json {
        let rows: Vec<_> = (0..prepared.mask.batch_size())
            .map(|i| {
                serde_json::json!({
                    "row": i,
                    "advantage": prepared.advantages[i],
                    "scored_tokens": counts[i],
                    "mask": prepared.mask.row(i),
                })
            })
            .collect();
        let report = serde_json::json!({
            "seq_len": prepared.tokens.seq_len(),
            "rows": rows,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} rows, {} tokens each after left padding",
            prepared.tokens.batch_size(),
            prepared.tokens.seq_len()
        );
        for i in 0..prepared.mask.batch_size() {
            let bar: String = prepared
                .mask
                .row(i)
                .iter()
                .map(|&m| if m { '#' } else { '.' })
                .collect();
            println!(
                "row {}: {} scored tokens, advantage {:+.3}  {}",
                i, counts[i], prepared.advantages[i], bar
            );
        }
    }

    Ok(())
}

#[cfg(feature = "torch")]
mod demo;
