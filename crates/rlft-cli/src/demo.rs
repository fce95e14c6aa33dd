//! Synthetic GRPO run: a toy byte-level model learns to prefer completions
//! with positive advantage.

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use tch::nn::OptimizerConfig;
use tch::{nn, Device};

use rlft::config::GrpoConfig;
use rlft::data::{Example, Message};
use rlft::log::{CompositeLogger, ConsoleLogger, JsonlLogger, MetricLogger};
use rlft::model::{HasVarStore, TinyLm, TinyLmConfig};
use rlft::prepare::{ByteTokenizer, ChatFormatter};
use rlft::trainer::GrpoTrainer;
use rlft::utils::{format_duration, set_seed};

/// Renders each turn as `<role>content`.
struct RoleTagFormatter;

impl ChatFormatter for RoleTagFormatter {
    fn format(&self, messages: &[Message]) -> rlft::Result<String> {
        Ok(messages
            .iter()
            .map(|m| format!("<{}>{}", m.role, m.content))
            .collect())
    }
}

fn batch() -> Vec<Example> {
    let prompt = "what is 2+2?";
    [("4", 1.0), ("four", 0.5), ("5", -1.0), ("22", -0.5)]
        .into_iter()
        .map(|(answer, advantage)| {
            Example::new(
                vec![Message::user(prompt), Message::assistant(answer)],
                advantage,
            )
        })
        .collect()
}

pub fn run(
    steps: usize,
    lr: f64,
    output_dir: PathBuf,
    config: Option<PathBuf>,
    log_file: Option<PathBuf>,
) -> Result<()> {
    let config = match config {
        Some(path) => GrpoConfig::from_json_file(path)?,
        None => GrpoConfig::new(output_dir)
            .with_adapter(true)
            .with_response_delimiter("<assistant>")
            .with_save_interval_secs(30),
    };

    let device = if tch::Cuda::is_available() {
        tracing::info!("Using CUDA");
        Device::Cuda(0)
    } else {
        tracing::info!("Using CPU");
        Device::Cpu
    };

    let mut model_config = TinyLmConfig::new(ByteTokenizer::VOCAB_SIZE, 64);
    if config.use_adapter {
        model_config = model_config.with_adapter(8, 16.0);
    }

    set_seed(config.seed);
    let mut policy = TinyLm::new(model_config.clone(), device)?;
    policy.set_precision(config.precision()?);

    tracing::info!(
        steps,
        lr,
        adapter = config.use_adapter,
        output_dir = %config.output_dir.display(),
        "Starting demo"
    );

    let builder = if config.use_adapter {
        GrpoTrainer::builder(config, policy, RoleTagFormatter, ByteTokenizer)
    } else {
        // Same seed, same initial weights: a frozen copy of the starting policy.
        set_seed(config.seed);
        let mut reference = TinyLm::new(model_config, device)?;
        reference.set_precision(config.precision()?);
        GrpoTrainer::builder(config, policy, RoleTagFormatter, ByteTokenizer)
            .reference(Box::new(reference))
    };
    let mut trainer = builder.build()?;

    let mut optimizer = nn::Adam::default().build(trainer.policy_mut().var_store_mut(), lr)?;

    let mut logger = CompositeLogger::default();
    logger.add(Box::new(ConsoleLogger::with_run_name("demo")));
    if let Some(path) = log_file {
        logger.add(Box::new(JsonlLogger::new(path)?));
    }

    let batch = batch();
    let start = std::time::Instant::now();
    let log_every = (steps / 10).max(1);

    for step in 1..=steps {
        let loss = trainer.compute_loss(&batch, false)?;
        optimizer.backward_step(&loss);

        if step % log_every == 0 || step == steps {
            let mut logs = HashMap::new();
            logs.insert("loss".to_string(), loss.double_value(&[]));
            trainer.log(logs, &logger, step as u64);
        }
    }

    trainer.save_now()?;
    logger.close();

    tracing::info!(
        elapsed = %format_duration(start.elapsed()),
        saves = trainer.scheduler().save_count(),
        "Demo complete"
    );
    Ok(())
}
