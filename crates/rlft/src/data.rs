//! Training examples consumed by one loss computation.

use crate::{Result, RlftError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;

/// One role/content turn of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// A scored conversation with its precomputed advantage.
///
/// Any extra fields (labels, ids) are kept in `extra` and never read here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Example {
    pub completion: Vec<Message>,
    pub advantage: f64,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Example {
    pub fn new(completion: Vec<Message>, advantage: f64) -> Self {
        Self {
            completion,
            advantage,
            extra: HashMap::new(),
        }
    }
}

/// Read one example per line, skipping blank lines.
pub fn read_jsonl(reader: impl BufRead) -> Result<Vec<Example>> {
    let mut examples = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let example: Example = serde_json::from_str(&line).map_err(|e| {
            RlftError::DataContract {
                row: Some(examples.len()),
                reason: format!("line {}: {}", lineno + 1, e),
            }
        })?;
        examples.push(example);
    }
    Ok(examples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_keeps_extra_fields() {
        let json = r#"{
            "completion": [
                {"role": "user", "content": "2+2?"},
                {"role": "assistant", "content": "4"}
            ],
            "advantage": 0.8,
            "label": "4"
        }"#;
        let example: Example = serde_json::from_str(json).unwrap();
        assert_eq!(example.completion.len(), 2);
        assert_eq!(example.completion[1], Message::assistant("4"));
        assert_eq!(example.advantage, 0.8);
        assert_eq!(example.extra["label"], serde_json::json!("4"));
    }

    #[test]
    fn test_read_jsonl() {
        let input = concat!(
            r#"{"completion": [{"role": "user", "content": "a"}], "advantage": 1.0}"#,
            "\n\n",
            r#"{"completion": [{"role": "user", "content": "b"}], "advantage": -1.0}"#,
            "\n"
        );
        let examples = read_jsonl(input.as_bytes()).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[1].advantage, -1.0);
    }

    #[test]
    fn test_read_jsonl_reports_bad_line() {
        let input = concat!(
            r#"{"completion": [], "advantage": 1.0}"#,
            "\n",
            r#"{"completion": "oops"}"#
        );
        let err = read_jsonl(input.as_bytes()).unwrap_err();
        match err {
            RlftError::DataContract { row, reason } => {
                assert_eq!(row, Some(1));
                assert!(reason.starts_with("line 2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
