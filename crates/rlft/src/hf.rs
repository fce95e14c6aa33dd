//! HuggingFace tokenizer and Jinja chat-template collaborators.

use crate::checkpoint::Persist;
use crate::data::Message;
use crate::prepare::{ChatFormatter, Tokenizer};
use crate::{Result, RlftError};
use minijinja::{context, Environment};
use std::io;
use std::path::Path;

/// DeepSeek-style template whose assistant marker matches the default
/// response delimiter.
pub const DEFAULT_CHAT_TEMPLATE: &str = "{{ bos_token }}\
{%- for message in messages -%}\
{%- if message.role == 'system' -%}{{ message.content }}\
{%- elif message.role == 'user' -%}<｜User｜>{{ message.content }}\
{%- elif message.role == 'assistant' -%}<｜Assistant｜>{{ message.content }}{{ eos_token }}\
{%- endif -%}\
{%- endfor -%}";

/// Renders conversations with a Jinja chat template.
pub struct TemplateFormatter {
    env: Environment<'static>,
    template: String,
    bos_token: String,
    eos_token: String,
}

impl TemplateFormatter {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            env: Environment::new(),
            template: template.into(),
            bos_token: String::new(),
            eos_token: String::new(),
        }
    }

    /// Formatter with [`DEFAULT_CHAT_TEMPLATE`].
    pub fn deepseek() -> Self {
        Self::new(DEFAULT_CHAT_TEMPLATE)
            .with_bos_token("<｜begin▁of▁sentence｜>")
            .with_eos_token("<｜end▁of▁sentence｜>")
    }

    /// Read `chat_template`, `bos_token` and `eos_token` from a
    /// `tokenizer_config.json`.
    pub fn from_tokenizer_config(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: serde_json::Value = serde_json::from_reader(io::BufReader::new(file))?;
        let template = config
            .get("chat_template")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                RlftError::Configuration(format!(
                    "{} has no chat_template",
                    path.as_ref().display()
                ))
            })?;
        let token = |key: &str| {
            config
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        Ok(Self::new(template)
            .with_bos_token(token("bos_token"))
            .with_eos_token(token("eos_token")))
    }

    pub fn with_bos_token(mut self, token: impl Into<String>) -> Self {
        self.bos_token = token.into();
        self
    }

    pub fn with_eos_token(mut self, token: impl Into<String>) -> Self {
        self.eos_token = token.into();
        self
    }
}

impl ChatFormatter for TemplateFormatter {
    fn format(&self, messages: &[Message]) -> Result<String> {
        Ok(self.env.render_str(
            &self.template,
            context! {
                messages => messages,
                bos_token => &self.bos_token,
                eos_token => &self.eos_token,
                add_generation_prompt => false,
            },
        )?)
    }
}

/// [`Tokenizer`] backed by a `tokenizers` tokenizer.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    pad_id: Option<i64>,
}

impl HfTokenizer {
    pub fn new(inner: tokenizers::Tokenizer) -> Self {
        let pad_id = inner.get_padding().map(|p| i64::from(p.pad_id));
        Self { inner, pad_id }
    }

    /// Load a `tokenizer.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path.as_ref())
            .map_err(|e| RlftError::Tokenizer(e.to_string()))?;
        Ok(Self::new(inner))
    }

    /// Use `token` as padding. Fails if it is not in the vocabulary.
    pub fn with_pad_token(mut self, token: &str) -> Result<Self> {
        let id = self.inner.token_to_id(token).ok_or_else(|| {
            RlftError::Configuration(format!("pad token {:?} is not in the vocabulary", token))
        })?;
        self.pad_id = Some(i64::from(id));
        Ok(self)
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| RlftError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| i64::from(id)).collect())
    }

    fn pad_id(&self) -> Option<i64> {
        self.pad_id
    }
}

impl Persist for HfTokenizer {
    fn persist(&self, dir: &Path) -> io::Result<()> {
        self.inner
            .save(dir.join("tokenizer.json"), true)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}
