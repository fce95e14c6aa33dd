//! # rlft
//!
//! Training objective for reinforcement-learning fine-tuning of causal
//! language models.
//!
//! ## Overview
//!
//! rlft provides:
//! - Sequence preparation: chat-formatted examples to left-padded token ids
//!   plus the response-region mask
//! - Per-token log-probability extraction for the policy and reference
//!   models - requires `torch` feature
//! - The KL-regularised policy-gradient loss with masked averaging -
//!   requires `torch` feature
//! - A metrics accumulator averaged across distributed workers
//! - A wall-clock checkpoint scheduler that reads save freshness from disk
//!
//! ## Features
//!
//! - `default` - `hf`
//! - `hf` - `tokenizers`-backed tokenizer and Jinja chat templates
//! - `torch` - Tensor-backed loss, trainer and toy model (requires libtorch)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rlft::prelude::*;
//!
//! let config = GrpoConfig::new("out").with_beta(0.04).with_save_interval_secs(600);
//! let mut trainer = GrpoTrainer::builder(config, policy, formatter, tokenizer).build()?;
//!
//! let loss = trainer.compute_loss(&batch, false)?;
//! loss.backward();
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod log;
pub mod metrics;
pub mod prepare;
pub mod utils;

#[cfg(feature = "hf")]
pub mod hf;

#[cfg(feature = "torch")]
pub mod logprobs;
#[cfg(feature = "torch")]
pub mod loss;
#[cfg(feature = "torch")]
pub mod model;
#[cfg(feature = "torch")]
pub mod trainer;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{
        ArtifactStore, CheckpointScheduler, Clock, FsStore, Persist, SaveMode, SaveState,
        SystemClock,
    };
    pub use crate::config::{GrpoConfig, Precision};
    pub use crate::data::{Example, Message};
    pub use crate::distributed::{Collective, SingleProcess};
    pub use crate::log::{CompositeLogger, ConsoleLogger, JsonlLogger, MetricLogger};
    pub use crate::metrics::MetricsAccumulator;
    pub use crate::prepare::{
        ChatFormatter, PreparedBatch, ResponseMask, SequencePreparer, TokenBatch, Tokenizer,
    };
    pub use crate::{Result, RlftError};

    #[cfg(feature = "hf")]
    pub use crate::hf::{HfTokenizer, TemplateFormatter};

    #[cfg(feature = "torch")]
    pub use crate::logprobs::{per_token_logps, reference_logps, CausalLm};
    #[cfg(feature = "torch")]
    pub use crate::loss::{GrpoLoss, LossOutput};
    #[cfg(feature = "torch")]
    pub use crate::model::{TinyLm, TinyLmConfig};
    #[cfg(feature = "torch")]
    pub use crate::trainer::GrpoTrainer;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::path::PathBuf;

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum RlftError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Data contract violation{}: {reason}", row_suffix(.row))]
    DataContract { row: Option<usize>, reason: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Failed to persist artifacts to {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Collective error: {0}")]
    Collective(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "hf")]
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[cfg(feature = "hf")]
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[cfg(feature = "torch")]
    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),
}

impl RlftError {
    /// Data contract violation attributed to one batch row.
    pub fn row(row: usize, reason: impl Into<String>) -> Self {
        Self::DataContract {
            row: Some(row),
            reason: reason.into(),
        }
    }

    /// Persistence failure for `path`.
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}

fn row_suffix(row: &Option<usize>) -> String {
    match row {
        Some(r) => format!(" in row {}", r),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, RlftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_contract_display_names_row() {
        let err = RlftError::row(3, "response delimiter not found");
        assert_eq!(
            err.to_string(),
            "Data contract violation in row 3: response delimiter not found"
        );

        let err = RlftError::DataContract {
            row: None,
            reason: "empty batch".into(),
        };
        assert_eq!(err.to_string(), "Data contract violation: empty batch");
    }

    #[test]
    fn test_persistence_display_names_path() {
        let err = RlftError::persistence(
            "/tmp/out",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/tmp/out"));
        assert!(err.to_string().contains("denied"));
    }
}
