//! Minimal causal language model with an optional LoRA adapter.
//!
//! Next-token logits come from the current token only:
//! `lm_head(tanh(embed(x)))`. With an adapter, `scale * (h A) B` is added to
//! the projection. `B` starts at zero so the adapted model initially equals
//! the base, and the base weights are frozen.

use crate::checkpoint::Persist;
use crate::config::Precision;
use crate::logprobs::CausalLm;
use crate::{Result, RlftError};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tch::nn::Module;
use tch::{nn, Device, Tensor};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// Trait for models that expose their trainable parameters.
pub trait HasVarStore {
    /// Get mutable reference to the trainable VarStore
    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    /// Get reference to the trainable VarStore
    fn var_store(&self) -> &nn::VarStore;
}

/// Configuration for [`TinyLm`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TinyLmConfig {
    pub vocab_size: i64,
    pub hidden_size: i64,
    /// Adapter rank. `None` trains every weight.
    pub lora_rank: Option<i64>,
    pub lora_alpha: f64,
}

impl Default for TinyLmConfig {
    fn default() -> Self {
        Self {
            vocab_size: 257,
            hidden_size: 32,
            lora_rank: None,
            lora_alpha: 16.0,
        }
    }
}

impl TinyLmConfig {
    pub fn new(vocab_size: i64, hidden_size: i64) -> Self {
        Self {
            vocab_size,
            hidden_size,
            ..Default::default()
        }
    }

    pub fn with_adapter(mut self, rank: i64, alpha: f64) -> Self {
        self.lora_rank = Some(rank);
        self.lora_alpha = alpha;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.vocab_size <= 0 || self.hidden_size <= 0 {
            return Err(RlftError::Configuration(format!(
                "vocab_size and hidden_size must be positive, got {} and {}",
                self.vocab_size, self.hidden_size
            )));
        }
        if let Some(rank) = self.lora_rank {
            if rank <= 0 {
                return Err(RlftError::Configuration(format!(
                    "lora_rank must be positive, got {}",
                    rank
                )));
            }
        }
        Ok(())
    }
}

struct LoraAdapter {
    vs: nn::VarStore,
    a: Tensor,
    b: Tensor,
    scale: f64,
}

impl LoraAdapter {
    fn new(config: &TinyLmConfig, rank: i64, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let (a, b) = {
            let root = vs.root();
            let path = &root / "lm_head";
            let std = 1.0 / (config.hidden_size as f64).sqrt();
            (
                path.randn("lora_a", &[config.hidden_size, rank], 0.0, std),
                path.zeros("lora_b", &[rank, config.vocab_size]),
            )
        };
        Self {
            vs,
            a,
            b,
            scale: config.lora_alpha / rank as f64,
        }
    }

    fn delta(&self, hidden: &Tensor) -> Tensor {
        hidden.matmul(&self.a).matmul(&self.b) * self.scale
    }
}

/// Toy causal LM used by tests and the demo command.
pub struct TinyLm {
    config: TinyLmConfig,
    base_vs: nn::VarStore,
    embed: nn::Embedding,
    lm_head: nn::Linear,
    adapter: Option<LoraAdapter>,
    device: Device,
}

impl TinyLm {
    pub fn new(config: TinyLmConfig, device: Device) -> Result<Self> {
        config.validate()?;

        let mut base_vs = nn::VarStore::new(device);
        let (embed, lm_head) = {
            let root = base_vs.root();
            (
                nn::embedding(
                    &root / "embed_tokens",
                    config.vocab_size,
                    config.hidden_size,
                    Default::default(),
                ),
                nn::linear(
                    &root / "lm_head",
                    config.hidden_size,
                    config.vocab_size,
                    Default::default(),
                ),
            )
        };

        let adapter = config
            .lora_rank
            .map(|rank| LoraAdapter::new(&config, rank, device));
        if adapter.is_some() {
            base_vs.freeze();
        }

        Ok(Self {
            config,
            base_vs,
            embed,
            lm_head,
            adapter,
            device,
        })
    }

    pub fn config(&self) -> &TinyLmConfig {
        &self.config
    }

    /// Cast every parameter to `precision`. [`Precision::Auto`] keeps them.
    pub fn set_precision(&mut self, precision: Precision) {
        if let Some(kind) = precision.kind() {
            self.base_vs.set_kind(kind);
            if let Some(adapter) = self.adapter.as_mut() {
                adapter.vs.set_kind(kind);
            }
            tracing::debug!(?kind, "Cast model parameters");
        }
    }

    /// Load weights previously written by [`Persist::persist`] into `dir`.
    ///
    /// With an adapter only the adapter weights are read.
    pub fn load_weights(&mut self, dir: &Path) -> Result<()> {
        match self.adapter.as_mut() {
            Some(adapter) => adapter.vs.load(dir.join(ADAPTER_WEIGHTS_FILE))?,
            None => self.base_vs.load(dir.join(WEIGHTS_FILE))?,
        }
        Ok(())
    }

    fn hidden(&self, input_ids: &Tensor) -> Tensor {
        self.embed.forward(input_ids).tanh()
    }
}

impl CausalLm for TinyLm {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let hidden = self.hidden(input_ids);
        let logits = self.lm_head.forward(&hidden);
        Ok(match &self.adapter {
            Some(adapter) => logits + adapter.delta(&hidden),
            None => logits,
        })
    }

    fn forward_base(&self, input_ids: &Tensor) -> Result<Tensor> {
        if self.adapter.is_none() {
            return Err(RlftError::Unsupported(
                "TinyLm was built without an adapter".into(),
            ));
        }
        Ok(self.lm_head.forward(&self.hidden(input_ids)))
    }

    fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    fn device(&self) -> Device {
        self.device
    }
}

impl HasVarStore for TinyLm {
    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        match self.adapter.as_mut() {
            Some(adapter) => &mut adapter.vs,
            None => &mut self.base_vs,
        }
    }

    fn var_store(&self) -> &nn::VarStore {
        match &self.adapter {
            Some(adapter) => &adapter.vs,
            None => &self.base_vs,
        }
    }
}

impl Persist for TinyLm {
    fn persist(&self, dir: &Path) -> io::Result<()> {
        match &self.adapter {
            Some(adapter) => {
                let config = serde_json::json!({
                    "peft_type": "LORA",
                    "r": self.config.lora_rank,
                    "lora_alpha": self.config.lora_alpha,
                    "target_modules": ["lm_head"],
                    "base_model": &self.config,
                });
                let file = std::fs::File::create(dir.join(ADAPTER_CONFIG_FILE))?;
                serde_json::to_writer_pretty(file, &config)?;
                adapter
                    .vs
                    .save(dir.join(ADAPTER_WEIGHTS_FILE))
                    .map_err(io::Error::other)
            }
            None => {
                let file = std::fs::File::create(dir.join(CONFIG_FILE))?;
                serde_json::to_writer_pretty(file, &self.config)?;
                self.base_vs
                    .save(dir.join(WEIGHTS_FILE))
                    .map_err(io::Error::other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;
    use tempfile::tempdir;

    fn ids() -> Tensor {
        Tensor::from_slice(&[1i64, 5, 9, 2, 0, 3]).view([2, 3])
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    #[test]
    fn test_forward_shape() {
        let model = TinyLm::new(TinyLmConfig::new(11, 8), Device::Cpu).unwrap();
        let logits = model.forward(&ids()).unwrap();
        assert_eq!(logits.size(), vec![2, 3, 11]);
        assert!(!model.has_adapter());
    }

    #[test]
    fn test_forward_base_requires_adapter() {
        let model = TinyLm::new(TinyLmConfig::new(11, 8), Device::Cpu).unwrap();
        assert!(matches!(
            model.forward_base(&ids()),
            Err(RlftError::Unsupported(_))
        ));
    }

    #[test]
    fn test_adapter_starts_equal_to_base() {
        let model = TinyLm::new(TinyLmConfig::new(11, 8).with_adapter(2, 4.0), Device::Cpu).unwrap();
        let adapted = model.forward(&ids()).unwrap();
        let base = model.forward_base(&ids()).unwrap();
        assert_eq!(max_diff(&adapted, &base), 0.0);
    }

    #[test]
    fn test_forward_base_bypasses_trained_adapter() {
        let model = TinyLm::new(TinyLmConfig::new(11, 8).with_adapter(2, 4.0), Device::Cpu).unwrap();
        let before = model.forward_base(&ids()).unwrap();

        let adapter = model.adapter.as_ref().unwrap();
        tch::no_grad(|| {
            let mut b = adapter.b.shallow_clone();
            let _ = b.fill_(0.5);
        });

        let base = model.forward_base(&ids()).unwrap();
        let adapted = model.forward(&ids()).unwrap();
        assert_eq!(max_diff(&before, &base), 0.0);
        assert!(max_diff(&adapted, &base) > 1e-3);
        // Adapter stays active for ordinary calls afterwards.
        assert_eq!(max_diff(&adapted, &model.forward(&ids()).unwrap()), 0.0);
    }

    #[test]
    fn test_only_adapter_is_trainable() {
        let model = TinyLm::new(TinyLmConfig::new(11, 8).with_adapter(2, 4.0), Device::Cpu).unwrap();
        assert_eq!(model.var_store().trainable_variables().len(), 2);
        assert!(model
            .base_vs
            .trainable_variables()
            .iter()
            .all(|t| !t.requires_grad()));

        let full = TinyLm::new(TinyLmConfig::new(11, 8), Device::Cpu).unwrap();
        // Embedding weight, projection weight and bias.
        assert_eq!(full.var_store().trainable_variables().len(), 3);
    }

    #[test]
    fn test_persist_adapter_round_trip() {
        let dir = tempdir().unwrap();
        let config = TinyLmConfig::new(11, 8).with_adapter(2, 4.0);
        let model = TinyLm::new(config.clone(), Device::Cpu).unwrap();
        tch::no_grad(|| {
            let mut b = model.adapter.as_ref().unwrap().b.shallow_clone();
            let _ = b.fill_(0.25);
        });
        model.persist(dir.path()).unwrap();

        assert!(dir.path().join(ADAPTER_CONFIG_FILE).exists());
        assert!(dir.path().join(ADAPTER_WEIGHTS_FILE).exists());
        assert!(!dir.path().join(CONFIG_FILE).exists());

        let written: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(ADAPTER_CONFIG_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(written["r"], 2);
        assert_eq!(written["peft_type"], "LORA");

        let mut other = TinyLm::new(config, Device::Cpu).unwrap();
        other.load_weights(dir.path()).unwrap();
        let theirs = other.adapter.as_ref().unwrap();
        let ours = model.adapter.as_ref().unwrap();
        assert_eq!(max_diff(&theirs.a, &ours.a), 0.0);
        assert_eq!(max_diff(&theirs.b, &ours.b), 0.0);
    }

    #[test]
    fn test_persist_full_model() {
        let dir = tempdir().unwrap();
        let model = TinyLm::new(TinyLmConfig::new(11, 8), Device::Cpu).unwrap();
        model.persist(dir.path()).unwrap();

        assert!(dir.path().join(WEIGHTS_FILE).exists());
        let config: TinyLmConfig = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(&config, model.config());
    }

    #[test]
    fn test_set_precision() {
        let mut model = TinyLm::new(TinyLmConfig::new(11, 8), Device::Cpu).unwrap();
        model.set_precision(Precision::Float64);
        let logits = model.forward(&ids()).unwrap();
        assert_eq!(logits.kind(), Kind::Double);
    }

    #[test]
    fn test_invalid_config() {
        assert!(TinyLm::new(TinyLmConfig::new(0, 8), Device::Cpu).is_err());
        assert!(TinyLm::new(TinyLmConfig::new(11, 8).with_adapter(0, 1.0), Device::Cpu).is_err());
    }
}
