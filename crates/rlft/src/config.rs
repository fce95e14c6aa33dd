//! Trainer configuration.

use crate::{Result, RlftError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Delimiter marking the start of the assistant turn in the default template.
pub const DEFAULT_RESPONSE_DELIMITER: &str = "<｜Assistant｜>";

/// Configuration for the GRPO objective and its checkpoint scheduler
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpoConfig {
    /// Root directory for persisted weights and tokenizer artifacts
    pub output_dir: PathBuf,

    /// Coefficient for the KL penalty against the reference model.
    pub beta: f64,

    /// Maximum length, in characters, of a formatted example before tokenizing.
    pub max_seq_length: usize,

    /// Minimum wall-clock seconds between two checkpoint saves.
    pub save_interval_secs: u64,

    /// Text marking the start of the scored completion region.
    pub response_delimiter: String,

    /// Train and persist an adapter (`lora/`) instead of full weights.
    pub use_adapter: bool,

    /// Requested parameter precision: "auto", "float32", "float16", "bfloat16" or "float64".
    pub torch_dtype: Option<String>,

    /// Padding id used when the tokenizer does not define one.
    pub pad_token_id: i64,

    /// Random seed
    pub seed: u64,
}

impl Default for GrpoConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("grpo-output"),
            beta: 0.04,
            max_seq_length: 512,
            save_interval_secs: 3600,
            response_delimiter: DEFAULT_RESPONSE_DELIMITER.to_string(),
            use_adapter: false,
            torch_dtype: None,
            pad_token_id: 0,
            seed: 42,
        }
    }
}

impl GrpoConfig {
    /// Create a new config writing into `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    pub fn with_max_seq_length(mut self, max_seq_length: usize) -> Self {
        self.max_seq_length = max_seq_length;
        self
    }

    pub fn with_save_interval_secs(mut self, secs: u64) -> Self {
        self.save_interval_secs = secs;
        self
    }

    pub fn with_response_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.response_delimiter = delimiter.into();
        self
    }

    pub fn with_adapter(mut self, enabled: bool) -> Self {
        self.use_adapter = enabled;
        self
    }

    pub fn with_torch_dtype(mut self, dtype: impl Into<String>) -> Self {
        self.torch_dtype = Some(dtype.into());
        self
    }

    pub fn with_pad_token_id(mut self, id: i64) -> Self {
        self.pad_token_id = id;
        self
    }

    /// Save interval as a [`Duration`].
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    /// Parsed precision request.
    pub fn precision(&self) -> Result<Precision> {
        match &self.torch_dtype {
            Some(s) => Precision::parse(s),
            None => Ok(Precision::Auto),
        }
    }

    /// Check every field, returning the first violation.
    pub fn validate(&self) -> Result<()> {
        if !self.beta.is_finite() || self.beta < 0.0 {
            return Err(RlftError::Configuration(format!(
                "beta must be a finite non-negative number, got {}",
                self.beta
            )));
        }
        if self.max_seq_length == 0 {
            return Err(RlftError::Configuration(
                "max_seq_length must be greater than zero".into(),
            ));
        }
        if self.save_interval_secs == 0 {
            return Err(RlftError::Configuration(
                "save_interval_secs must be greater than zero".into(),
            ));
        }
        if self.response_delimiter.is_empty() {
            return Err(RlftError::Configuration(
                "response_delimiter must not be empty".into(),
            ));
        }
        if self.pad_token_id < 0 {
            return Err(RlftError::Configuration(format!(
                "pad_token_id must be non-negative, got {}",
                self.pad_token_id
            )));
        }
        self.precision()?;
        Ok(())
    }
}

/// Parameter precision requested for the trained model
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    /// Keep whatever precision the weights were stored in
    Auto,
    Float32,
    Float16,
    BFloat16,
    Float64,
}

impl Precision {
    /// Parse a dtype name. Accepts an optional `torch.` prefix.
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        let bare = name.strip_prefix("torch.").unwrap_or(name);
        match bare {
            "auto" => Ok(Self::Auto),
            "float32" | "float" => Ok(Self::Float32),
            "float16" | "half" => Ok(Self::Float16),
            "bfloat16" => Ok(Self::BFloat16),
            "float64" | "double" => Ok(Self::Float64),
            _ => Err(RlftError::Configuration(format!(
                "invalid torch_dtype: expected 'auto' or a floating dtype name \
                 (e.g. 'float32'), got '{}'",
                name
            ))),
        }
    }

    /// Tensor kind for this precision, `None` for [`Precision::Auto`].
    #[cfg(feature = "torch")]
    pub fn kind(self) -> Option<tch::Kind> {
        match self {
            Self::Auto => None,
            Self::Float32 => Some(tch::Kind::Float),
            Self::Float16 => Some(tch::Kind::Half),
            Self::BFloat16 => Some(tch::Kind::BFloat16),
            Self::Float64 => Some(tch::Kind::Double),
        }
    }
}
