//! Per-token log-probabilities of the tokens actually present in a sequence.

use crate::{Result, RlftError};
use tch::{Device, Kind, Tensor};

/// A causal language model producing next-token logits.
pub trait CausalLm {
    /// Logits `[batch, seq_len, vocab]` for `input_ids` `[batch, seq_len]`.
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Logits with adapter layers bypassed, for this call only.
    ///
    /// Must reproduce the base model exactly and must not change what any
    /// other call to [`CausalLm::forward`] observes.
    fn forward_base(&self, _input_ids: &Tensor) -> Result<Tensor> {
        Err(RlftError::Unsupported(
            "model has no adapter to disable".into(),
        ))
    }

    /// Whether [`CausalLm::forward_base`] is available.
    fn has_adapter(&self) -> bool {
        false
    }

    fn device(&self) -> Device;
}

/// Log-probability of each next token, computed one row at a time.
///
/// Drops the last logit position (nothing left to predict) and the first
/// token (nothing predicts it), so the result is `[batch, seq_len - 1]`.
/// Only one row's `[seq_len - 1, vocab]` log-softmax is alive at a time.
pub fn logps_from_logits(logits: &Tensor, input_ids: &Tensor) -> Result<Tensor> {
    let (batch, seq_len) = input_ids.size2()?;
    let dims = logits.size();
    if dims.len() != 3 || dims[0] != batch || dims[1] != seq_len {
        return Err(RlftError::DataContract {
            row: None,
            reason: format!(
                "logits shape {:?} does not match input ids [{}, {}]",
                dims, batch, seq_len
            ),
        });
    }
    if seq_len < 2 {
        return Err(RlftError::DataContract {
            row: None,
            reason: "sequences need at least two tokens".into(),
        });
    }

    let logits = logits.narrow(1, 0, seq_len - 1);
    let targets = input_ids.narrow(1, 1, seq_len - 1);

    let mut rows = Vec::with_capacity(batch as usize);
    for i in 0..batch {
        let log_probs = logits.get(i).log_softmax(-1, Kind::Float);
        let index = targets.get(i).unsqueeze(1);
        rows.push(log_probs.gather(1, &index, false).squeeze_dim(1));
    }
    Ok(Tensor::stack(&rows, 0))
}

/// Gradient-tracked per-token log-probabilities of `model`.
pub fn per_token_logps(model: &dyn CausalLm, input_ids: &Tensor) -> Result<Tensor> {
    let logits = model.forward(input_ids)?;
    logps_from_logits(&logits, input_ids)
}

/// Reference log-probabilities, computed without gradient tracking.
///
/// Uses `reference` when given, otherwise the policy with its adapter
/// bypassed.
pub fn reference_logps(
    reference: Option<&dyn CausalLm>,
    policy: &dyn CausalLm,
    input_ids: &Tensor,
) -> Result<Tensor> {
    tch::no_grad(|| match reference {
        Some(model) => per_token_logps(model, input_ids),
        None => {
            let logits = policy.forward_base(input_ids)?;
            logps_from_logits(&logits, input_ids)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Logits depend only on the current token: row `t` of a `[V, V]` table.
    struct BigramLm {
        table: Tensor,
    }

    impl BigramLm {
        fn new(vocab: i64) -> Self {
            let table = Tensor::arange(vocab * vocab, (Kind::Float, Device::Cpu))
                .view([vocab, vocab])
                .sin()
                .set_requires_grad(true);
            Self { table }
        }
    }

    impl CausalLm for BigramLm {
        fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
            let (b, l) = input_ids.size2()?;
            let v = self.table.size()[1];
            Ok(self
                .table
                .index_select(0, &input_ids.flatten(0, 1))
                .view([b, l, v]))
        }

        fn device(&self) -> Device {
            Device::Cpu
        }
    }

    fn ids() -> Tensor {
        Tensor::from_slice(&[0i64, 3, 1, 2, 4, 4, 0, 1]).view([2, 4])
    }

    #[test]
    fn test_matches_full_log_softmax_gather() {
        let model = BigramLm::new(5);
        let ids = ids();
        let logps = per_token_logps(&model, &ids).unwrap();
        assert_eq!(logps.size(), vec![2, 3]);

        let logits = model.forward(&ids).unwrap().narrow(1, 0, 3);
        let expected = logits
            .log_softmax(-1, Kind::Float)
            .gather(2, &ids.narrow(1, 1, 3).unsqueeze(2), false)
            .squeeze_dim(2);
        let diff = (&logps - &expected).abs().max().double_value(&[]);
        assert!(diff < 1e-6, "max diff {}", diff);
    }

    #[test]
    fn test_single_entry_by_hand() {
        let model = BigramLm::new(5);
        let ids = ids();
        let logps = per_token_logps(&model, &ids).unwrap();

        // Row 1, column 2: token 0 predicts token 1.
        let row: Vec<f64> = Vec::<f64>::try_from(&model.table.get(0).detach()).unwrap();
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let lse = max + row.iter().map(|x| (x - max).exp()).sum::<f64>().ln();
        let expected = row[1] - lse;
        assert!((logps.double_value(&[1, 2]) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_policy_logps_track_gradients() {
        let model = BigramLm::new(5);
        let logps = per_token_logps(&model, &ids()).unwrap();
        assert!(logps.requires_grad());
    }

    #[test]
    fn test_reference_logps_are_detached() {
        let reference = BigramLm::new(5);
        let policy = BigramLm::new(5);
        let logps = reference_logps(Some(&reference), &policy, &ids()).unwrap();
        assert!(!logps.requires_grad());
        assert_eq!(logps.size(), vec![2, 3]);
    }

    #[test]
    fn test_reference_without_adapter_is_unsupported() {
        let policy = BigramLm::new(5);
        let err = reference_logps(None, &policy, &ids()).unwrap_err();
        assert!(matches!(err, RlftError::Unsupported(_)));
    }

    #[test]
    fn test_rejects_short_or_mismatched_input() {
        let model = BigramLm::new(5);
        let one = Tensor::from_slice(&[1i64, 2]).view([2, 1]);
        assert!(per_token_logps(&model, &one).is_err());

        let logits = Tensor::zeros([2, 3, 5], (Kind::Float, Device::Cpu));
        assert!(logps_from_logits(&logits, &ids()).is_err());
    }
}
