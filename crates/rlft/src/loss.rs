//! KL-regularised policy-gradient objective over masked completion tokens.
//!
//! Per token: `-(ratio * advantage - beta * kl)`, where `ratio` equals one in
//! value but carries the policy gradient, and `kl` is the non-negative
//! estimator `exp(ref - policy) - (ref - policy) - 1`. Each row is averaged
//! over its response mask, then the rows are averaged.

use crate::{Result, RlftError};
use tch::{Kind, Tensor};

/// Policy log-probabilities in both tracked and detached form.
///
/// `ratio()` is `exp(tracked - detached)`: exactly one in the forward pass,
/// with gradient `d tracked` in the backward pass.
pub struct DualLogProbs {
    tracked: Tensor,
    detached: Tensor,
}

impl DualLogProbs {
    pub fn new(tracked: &Tensor) -> Self {
        Self {
            tracked: tracked.shallow_clone(),
            detached: tracked.detach(),
        }
    }

    pub fn tracked(&self) -> &Tensor {
        &self.tracked
    }

    pub fn detached(&self) -> &Tensor {
        &self.detached
    }

    pub fn ratio(&self) -> Tensor {
        (&self.tracked - &self.detached).exp()
    }
}

/// Per-token KL estimator `exp(r - p) - (r - p) - 1`. Zero iff `r == p`.
pub fn per_token_kl(policy_logps: &Tensor, ref_logps: &Tensor) -> Tensor {
    let diff = ref_logps - policy_logps;
    diff.exp() - &diff - 1.0
}

/// [`per_token_kl`] with unscored positions pinned to exactly zero.
///
/// The difference is cleared before the exponential, so a large gap on a
/// prompt or padding token cannot overflow into the loss or its gradient.
pub fn masked_per_token_kl(policy_logps: &Tensor, ref_logps: &Tensor, mask: &Tensor) -> Tensor {
    let unscored = mask.to_kind(Kind::Bool).logical_not();
    let diff = (ref_logps - policy_logps).masked_fill(&unscored, 0.0);
    diff.exp() - &diff - 1.0
}

/// Number of masked positions per row. Fails on the first empty row.
pub fn mask_counts(mask: &Tensor) -> Result<Tensor> {
    let counts = mask
        .to_kind(Kind::Float)
        .sum_dim_intlist(Some(&[1i64][..]), false, Kind::Float);
    let per_row = Vec::<f64>::try_from(&counts)?;
    if let Some(row) = per_row.iter().position(|&c| c <= 0.0) {
        return Err(RlftError::row(row, "response region is empty"));
    }
    Ok(counts)
}

/// Mean of `values` over masked positions, per row.
pub fn masked_row_mean(values: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let counts = mask_counts(mask)?;
    Ok(masked_row_mean_with_counts(values, mask, &counts))
}

fn masked_row_mean_with_counts(values: &Tensor, mask: &Tensor, counts: &Tensor) -> Tensor {
    let unscored = mask.to_kind(Kind::Bool).logical_not();
    values
        .masked_fill(&unscored, 0.0)
        .sum_dim_intlist(Some(&[1i64][..]), false, Kind::Float) / counts
}

/// Result of one loss evaluation.
pub struct LossOutput {
    /// Scalar loss, differentiable with respect to the policy.
    pub loss: Tensor,
    /// Per-token KL, `[batch, seq_len - 1]`, detached. Zero outside the mask.
    pub per_token_kl: Tensor,
    /// Mean over rows of the masked per-row mean KL.
    pub mean_kl: f64,
    /// Mean over rows of the number of masked tokens.
    pub completion_length: f64,
}

/// The GRPO loss with KL coefficient `beta`.
#[derive(Clone, Copy, Debug)]
pub struct GrpoLoss {
    pub beta: f64,
}

impl GrpoLoss {
    pub fn new(beta: f64) -> Self {
        Self { beta }
    }

    /// Evaluate the loss.
    ///
    /// `policy_logps`, `ref_logps` and `mask` share the shape
    /// `[batch, seq_len - 1]`; `advantages` has one entry per row and is
    /// treated as a constant. `ref_logps` is detached here regardless of how
    /// it was produced.
    pub fn compute(
        &self,
        policy_logps: &Tensor,
        ref_logps: &Tensor,
        advantages: &[f64],
        mask: &Tensor,
    ) -> Result<LossOutput> {
        let shape = policy_logps.size();
        if shape.len() != 2 || ref_logps.size() != shape || mask.size() != shape {
            return Err(RlftError::DataContract {
                row: None,
                reason: format!(
                    "shape mismatch: policy {:?}, reference {:?}, mask {:?}",
                    shape,
                    ref_logps.size(),
                    mask.size()
                ),
            });
        }
        if advantages.len() as i64 != shape[0] {
            return Err(RlftError::DataContract {
                row: None,
                reason: format!(
                    "{} advantages for a batch of {}",
                    advantages.len(),
                    shape[0]
                ),
            });
        }
        let counts = mask_counts(mask)?;

        let ref_logps = ref_logps.detach();
        let kl = masked_per_token_kl(policy_logps, &ref_logps, mask);

        let advantages = Tensor::from_slice(advantages)
            .to_kind(policy_logps.kind())
            .to_device(policy_logps.device())
            .unsqueeze(1);

        let dual = DualLogProbs::new(policy_logps);
        let per_token_loss = -(dual.ratio() * &advantages - &kl * self.beta);

        let loss = masked_row_mean_with_counts(&per_token_loss, mask, &counts).mean(Kind::Float);

        let kl = kl.detach();
        let mean_kl = tch::no_grad(|| {
            masked_row_mean_with_counts(&kl, mask, &counts)
                .mean(Kind::Float)
                .double_value(&[])
        });
        let completion_length = counts.mean(Kind::Float).double_value(&[]);

        Ok(LossOutput {
            loss,
            per_token_kl: kl,
            mean_kl,
            completion_length,
        })
    }
}
