//! GRPO trainer: ties preparation, log-probabilities, loss, metrics and
//! checkpointing into one `compute_loss` call per step.

use crate::checkpoint::{ArtifactStore, CheckpointScheduler, Clock, FsStore, Persist, SystemClock};
use crate::config::GrpoConfig;
use crate::data::Example;
use crate::distributed::{Collective, SingleProcess};
use crate::log::MetricLogger;
use crate::logprobs::{per_token_logps, reference_logps, CausalLm};
use crate::loss::{GrpoLoss, LossOutput};
use crate::metrics::{MetricsAccumulator, COMPLETION_LENGTH, KL};
use crate::prepare::{ChatFormatter, SequencePreparer, Tokenizer};
use crate::{Result, RlftError};
use std::collections::HashMap;
use tch::Tensor;

/// Builder for [`GrpoTrainer`].
pub struct GrpoTrainerBuilder<M, T> {
    config: GrpoConfig,
    policy: M,
    formatter: Box<dyn ChatFormatter>,
    tokenizer: T,
    reference: Option<Box<dyn CausalLm>>,
    collective: Box<dyn Collective>,
    store: Box<dyn ArtifactStore>,
    clock: Box<dyn Clock>,
}

impl<M: CausalLm + Persist, T: Tokenizer> GrpoTrainerBuilder<M, T> {
    /// Separate frozen reference model. Without one the policy's adapter is
    /// bypassed for the reference pass.
    pub fn reference(mut self, model: Box<dyn CausalLm>) -> Self {
        self.reference = Some(model);
        self
    }

    pub fn collective(mut self, collective: Box<dyn Collective>) -> Self {
        self.collective = collective;
        self
    }

    pub fn store(mut self, store: Box<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    pub fn clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<GrpoTrainer<M, T>> {
        let config = self.config;
        config.validate()?;

        if self.reference.is_none() && !self.policy.has_adapter() {
            return Err(RlftError::Configuration(
                "no reference model given and the policy has no adapter to disable".into(),
            ));
        }
        if config.use_adapter != self.policy.has_adapter() {
            return Err(RlftError::Configuration(format!(
                "use_adapter is {} but the policy {} an adapter",
                config.use_adapter,
                if self.policy.has_adapter() { "has" } else { "has no" }
            )));
        }

        let preparer = SequencePreparer::from_tokenizer(
            &self.tokenizer,
            &config.response_delimiter,
            config.max_seq_length,
            config.pad_token_id,
        )?;
        let scheduler = CheckpointScheduler::from_config(&config);

        tracing::info!(
            output_dir = %config.output_dir.display(),
            beta = config.beta,
            adapter = config.use_adapter,
            separate_reference = self.reference.is_some(),
            world_size = self.collective.world_size(),
            rank = self.collective.rank(),
            "Initialized GRPO trainer"
        );

        Ok(GrpoTrainer {
            loss: GrpoLoss::new(config.beta),
            config,
            policy: self.policy,
            reference: self.reference,
            formatter: self.formatter,
            tokenizer: self.tokenizer,
            preparer,
            metrics: MetricsAccumulator::new(),
            scheduler,
            collective: self.collective,
            store: self.store,
            clock: self.clock,
        })
    }
}

/// GRPO trainer over a policy `M` and tokenizer `T`.
///
/// The surrounding loop owns the optimizer: it calls
/// [`GrpoTrainer::compute_loss`], backpropagates, steps, and periodically
/// calls [`GrpoTrainer::log`].
pub struct GrpoTrainer<M, T> {
    config: GrpoConfig,
    policy: M,
    reference: Option<Box<dyn CausalLm>>,
    formatter: Box<dyn ChatFormatter>,
    tokenizer: T,
    preparer: SequencePreparer,
    loss: GrpoLoss,
    metrics: MetricsAccumulator,
    scheduler: CheckpointScheduler,
    collective: Box<dyn Collective>,
    store: Box<dyn ArtifactStore>,
    clock: Box<dyn Clock>,
}

impl<M: CausalLm + Persist, T: Tokenizer> GrpoTrainer<M, T> {
    /// Start a builder with a single-process collective, the local
    /// filesystem and the system clock.
    pub fn builder(
        config: GrpoConfig,
        policy: M,
        formatter: impl ChatFormatter + 'static,
        tokenizer: T,
    ) -> GrpoTrainerBuilder<M, T> {
        GrpoTrainerBuilder {
            config,
            policy,
            formatter: Box::new(formatter),
            tokenizer,
            reference: None,
            collective: Box::new(SingleProcess),
            store: Box::new(FsStore),
            clock: Box::new(SystemClock),
        }
    }

    /// Scalar loss for `batch`, differentiable with respect to the policy.
    ///
    /// Records `completion_length` and `kl` (averaged across workers) and
    /// gives the checkpoint scheduler a chance to save. Returning model
    /// outputs is not supported.
    pub fn compute_loss(&mut self, batch: &[Example], return_outputs: bool) -> Result<Tensor> {
        if return_outputs {
            return Err(RlftError::Unsupported(
                "GrpoTrainer does not support returning outputs".into(),
            ));
        }
        let output = self.evaluate(batch)?;

        self.metrics
            .record_reduced(&*self.collective, COMPLETION_LENGTH, output.completion_length)?;
        self.metrics
            .record_reduced(&*self.collective, KL, output.mean_kl)?;

        self.scheduler.step(
            self.clock.now(),
            &*self.store,
            &self.policy,
            &self.tokenizer,
            self.collective.is_primary(),
        )?;

        Ok(output.loss)
    }

    /// Run preparation, both log-probability passes and the loss without
    /// touching metrics or checkpoints.
    pub fn evaluate(&self, batch: &[Example]) -> Result<LossOutput> {
        let prepared = self
            .preparer
            .prepare(batch, &*self.formatter, &self.tokenizer)?;

        let device = self.policy.device();
        let input_ids = prepared.tokens.to_tensor(device);
        let mask = prepared.mask.to_tensor(device);

        let policy_logps = per_token_logps(&self.policy, &input_ids)?;
        let ref_logps = reference_logps(self.reference.as_deref(), &self.policy, &input_ids)?;

        let output = self
            .loss
            .compute(&policy_logps, &ref_logps, &prepared.advantages, &mask)?;
        tracing::debug!(
            batch = batch.len(),
            seq_len = prepared.tokens.seq_len(),
            kl = output.mean_kl,
            completion_length = output.completion_length,
            "Computed GRPO loss"
        );
        Ok(output)
    }

    /// Averages of every metric since the last flush, then clear them.
    pub fn flush_metrics(&mut self) -> HashMap<String, f64> {
        self.metrics.flush()
    }

    /// Merge `logs` with the flushed metric averages and emit them.
    ///
    /// Metric averages win over entries of `logs` with the same name.
    pub fn log(&mut self, mut logs: HashMap<String, f64>, logger: &dyn MetricLogger, step: u64) {
        logs.extend(self.metrics.flush());
        logger.log_metrics(&logs, step);
    }

    /// Save immediately, regardless of the interval.
    pub fn save_now(&mut self) -> Result<()> {
        self.scheduler.save(
            self.clock.now(),
            &*self.store,
            &self.policy,
            &self.tokenizer,
            self.collective.is_primary(),
        )
    }

    pub fn config(&self) -> &GrpoConfig {
        &self.config
    }

    pub fn policy(&self) -> &M {
        &self.policy
    }

    /// Mutable policy access, e.g. to build an optimizer over its variables.
    pub fn policy_mut(&mut self) -> &mut M {
        &mut self.policy
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn metrics(&self) -> &MetricsAccumulator {
        &self.metrics
    }

    pub fn scheduler(&self) -> &CheckpointScheduler {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ManualClock, SaveState, TrainerState};
    use crate::data::Message;
    use crate::model::{TinyLm, TinyLmConfig};
    use crate::prepare::ByteTokenizer;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};
    use tch::Device;
    use tempfile::tempdir;

    struct PlainFormatter;

    impl ChatFormatter for PlainFormatter {
        fn format(&self, messages: &[Message]) -> Result<String> {
            Ok(messages
                .iter()
                .map(|m| format!("<{}>{}", m.role, m.content))
                .collect())
        }
    }

    #[derive(Default)]
    struct Capture(Mutex<Vec<(HashMap<String, f64>, u64)>>);

    impl MetricLogger for Capture {
        fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
            self.0.lock().unwrap().push((metrics.clone(), step));
        }
    }

    fn config(dir: &std::path::Path) -> GrpoConfig {
        GrpoConfig::new(dir)
            .with_adapter(true)
            .with_response_delimiter("<assistant>")
            .with_save_interval_secs(10)
    }

    fn adapter_model() -> TinyLm {
        TinyLm::new(
            TinyLmConfig::new(ByteTokenizer::VOCAB_SIZE, 16).with_adapter(4, 8.0),
            Device::Cpu,
        )
        .unwrap()
    }

    fn batch() -> Vec<Example> {
        vec![
            Example::new(vec![Message::user("2+2"), Message::assistant("4")], 1.0),
            Example::new(vec![Message::user("2+2"), Message::assistant("five")], -1.0),
        ]
    }

    fn trainer(dir: &std::path::Path, clock: ManualClock) -> GrpoTrainer<TinyLm, ByteTokenizer> {
        GrpoTrainer::builder(config(dir), adapter_model(), PlainFormatter, ByteTokenizer)
            .clock(Box::new(clock))
            .build()
            .unwrap()
    }

    #[test]
    fn test_compute_loss_records_metrics() {
        let dir = tempdir().unwrap();
        let mut trainer = trainer(dir.path(), ManualClock::new(SystemTime::now()));

        let loss = trainer.compute_loss(&batch(), false).unwrap();
        assert_eq!(loss.size(), Vec::<i64>::new());
        assert!(loss.requires_grad());
        assert!(loss.double_value(&[]).is_finite());

        // Scored regions: "<assistant>4" (12 tokens) and "<assistant>five" (15).
        assert_eq!(trainer.metrics().pending(COMPLETION_LENGTH), &[13.5]);
        // Adapter starts at zero, so the policy equals the reference.
        assert_eq!(trainer.metrics().pending(KL), &[0.0]);

        let flushed = trainer.flush_metrics();
        assert_eq!(flushed.len(), 2);
        assert!(trainer.flush_metrics().is_empty());
    }

    #[test]
    fn test_return_outputs_is_unsupported() {
        let dir = tempdir().unwrap();
        let mut trainer = trainer(dir.path(), ManualClock::new(SystemTime::now()));
        let err = trainer.compute_loss(&batch(), true).unwrap_err();
        assert!(matches!(err, RlftError::Unsupported(_)));
        assert!(trainer.metrics().is_empty());
    }

    #[test]
    fn test_missing_delimiter_names_row() {
        let dir = tempdir().unwrap();
        let mut trainer = trainer(dir.path(), ManualClock::new(SystemTime::now()));
        let mut examples = batch();
        examples.push(Example::new(vec![Message::user("no answer")], 0.0));
        match trainer.compute_loss(&examples, false) {
            Err(RlftError::DataContract { row, .. }) => assert_eq!(row, Some(2)),
            other => panic!("expected data contract error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_build_requires_reference_or_adapter() {
        let dir = tempdir().unwrap();
        let full = TinyLm::new(TinyLmConfig::new(ByteTokenizer::VOCAB_SIZE, 8), Device::Cpu).unwrap();
        let result = GrpoTrainer::builder(
            config(dir.path()).with_adapter(false),
            full,
            PlainFormatter,
            ByteTokenizer,
        )
        .build();
        assert!(matches!(result, Err(RlftError::Configuration(_))));
    }

    #[test]
    fn test_build_rejects_adapter_mismatch() {
        let dir = tempdir().unwrap();
        let result = GrpoTrainer::builder(
            config(dir.path()).with_adapter(false),
            adapter_model(),
            PlainFormatter,
            ByteTokenizer,
        )
        .build();
        assert!(matches!(result, Err(RlftError::Configuration(_))));
    }

    #[test]
    fn test_separate_reference_model() {
        let dir = tempdir().unwrap();
        let policy =
            TinyLm::new(TinyLmConfig::new(ByteTokenizer::VOCAB_SIZE, 8), Device::Cpu).unwrap();
        let reference =
            TinyLm::new(TinyLmConfig::new(ByteTokenizer::VOCAB_SIZE, 8), Device::Cpu).unwrap();
        let mut trainer = GrpoTrainer::builder(
            config(dir.path()).with_adapter(false),
            policy,
            PlainFormatter,
            ByteTokenizer,
        )
        .reference(Box::new(reference))
        .clock(Box::new(ManualClock::new(SystemTime::now())))
        .build()
        .unwrap();

        trainer.compute_loss(&batch(), false).unwrap();
        // Independently initialised models disagree.
        assert!(trainer.metrics().pending(KL)[0] > 0.0);
    }

    #[test]
    fn test_scheduler_saves_adapter_after_interval() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(SystemTime::now());
        let mut trainer = trainer(dir.path(), clock.clone());

        trainer.compute_loss(&batch(), false).unwrap();
        assert_eq!(trainer.scheduler().state(), SaveState::Idle);
        assert!(!dir.path().join("lora").exists());

        clock.advance(Duration::from_secs(11));
        trainer.compute_loss(&batch(), false).unwrap();

        assert_eq!(trainer.scheduler().state(), SaveState::Armed);
        assert!(dir.path().join("lora/adapter_config.json").exists());
        assert!(dir.path().join("lora/adapter_model.safetensors").exists());
        assert!(dir.path().join("tokenizer_config.json").exists());
        let state = TrainerState::load(dir.path()).unwrap();
        assert_eq!(state.save_count, 1);
        assert_eq!(state.elapsed_secs, 11.0);
    }

    #[test]
    fn test_save_now_writes_immediately() {
        let dir = tempdir().unwrap();
        let mut trainer = trainer(dir.path(), ManualClock::new(SystemTime::now()));
        trainer.save_now().unwrap();
        assert!(dir.path().join("lora/adapter_config.json").exists());
        assert_eq!(trainer.scheduler().save_count(), 1);
    }

    #[test]
    fn test_log_merges_and_clears() {
        let dir = tempdir().unwrap();
        let mut trainer = trainer(dir.path(), ManualClock::new(SystemTime::now()));
        trainer.compute_loss(&batch(), false).unwrap();
        trainer.compute_loss(&batch(), false).unwrap();

        let capture = Capture::default();
        let mut logs = HashMap::new();
        logs.insert("loss".to_string(), 0.5);
        logs.insert(KL.to_string(), 99.0);
        trainer.log(logs, &capture, 7);

        let emitted = capture.0.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        let (metrics, step) = &emitted[0];
        assert_eq!(*step, 7);
        assert_eq!(metrics["loss"], 0.5);
        assert_eq!(metrics[KL], 0.0);
        assert_eq!(metrics[COMPLETION_LENGTH], 13.5);
        assert!(trainer.metrics().is_empty());
    }
}
