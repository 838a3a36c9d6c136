//! The KTO objective.
//!
//! ```text
//! logratio_i = log π(y_i|x_i) - log π_ref(y_i|x_i)
//! kl         = max(0, mean_j( log π(y_kl_j|x_j) - log π_ref(y_kl_j|x_j) ))   (no grad)
//! desirable:   w_d · (1 - σ(β (logratio_i - kl)))
//! undesirable: w_u · (1 - σ(β (kl - logratio_i)))
//! loss       = mean_i
//! ```
//!
//! The KL estimate pairs every prompt with an unrelated completion, so the
//! reference point moves with the policy without being optimised directly.

use std::collections::BTreeMap;

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops;

use kto_common::KtoConfig;

// ── Log-probs ───────────────────────────────────────────────────────────────

/// Per-position log-probability of the label token, flattened to
/// `(batch * seq, 1)`.
pub fn token_logps(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let log_probs = ops::log_softmax(&logits.reshape((b * t, v))?.to_dtype(DType::F32)?, D::Minus1)?;
    log_probs.gather(&labels.reshape((b * t, 1))?, 1)
}

/// Sum token log-probs per example with a `(examples, batch * seq)` selector.
pub fn pool_logps(selector: &Tensor, token_logps: &Tensor) -> Result<Tensor> {
    selector.matmul(token_logps)?.squeeze(1)
}

/// Summed log-probs of each example's response and KL completion.
#[derive(Debug, Clone)]
pub struct SequenceLogps {
    /// `(examples,)`
    pub response: Tensor,
    /// `(examples,)`
    pub kl: Tensor,
}

impl SequenceLogps {
    pub fn from_logits(
        logits: &Tensor,
        labels: &Tensor,
        response_selector: &Tensor,
        kl_selector: &Tensor,
    ) -> Result<Self> {
        let tokens = token_logps(logits, labels)?;
        Ok(Self {
            response: pool_logps(response_selector, &tokens)?,
            kl: pool_logps(kl_selector, &tokens)?,
        })
    }

    pub fn detach(&self) -> Self {
        Self {
            response: self.response.detach(),
            kl: self.kl.detach(),
        }
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Running sums of the KTO statistics over one or more batches.
#[derive(Debug, Clone, Default)]
pub struct KtoMetrics {
    pub loss_sum: f64,
    pub kl_sum: f64,
    pub batches: usize,
    pub chosen_rewards: f64,
    pub rejected_rewards: f64,
    pub chosen_logps: f64,
    pub rejected_logps: f64,
    pub num_chosen: usize,
    pub num_rejected: usize,
}

impl KtoMetrics {
    pub fn merge(&mut self, other: &KtoMetrics) {
        self.loss_sum += other.loss_sum;
        self.kl_sum += other.kl_sum;
        self.batches += other.batches;
        self.chosen_rewards += other.chosen_rewards;
        self.rejected_rewards += other.rejected_rewards;
        self.chosen_logps += other.chosen_logps;
        self.rejected_logps += other.rejected_logps;
        self.num_chosen += other.num_chosen;
        self.num_rejected += other.num_rejected;
    }

    pub fn is_empty(&self) -> bool {
        self.batches == 0
    }

    pub fn mean_loss(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.loss_sum / self.batches as f64
        }
    }

    /// Averaged metrics keyed `{prefix}loss`, `{prefix}kl`,
    /// `{prefix}rewards/chosen`, ... Chosen/rejected entries are omitted when
    /// no example of that kind was seen.
    pub fn summary(&self, prefix: &str) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        if self.batches == 0 {
            return out;
        }
        let n = self.batches as f64;
        out.insert(format!("{prefix}loss"), self.loss_sum / n);
        out.insert(format!("{prefix}kl"), self.kl_sum / n);

        let chosen = (self.num_chosen > 0).then(|| {
            let k = self.num_chosen as f64;
            (self.chosen_rewards / k, self.chosen_logps / k)
        });
        let rejected = (self.num_rejected > 0).then(|| {
            let k = self.num_rejected as f64;
            (self.rejected_rewards / k, self.rejected_logps / k)
        });
        if let Some((reward, logps)) = chosen {
            out.insert(format!("{prefix}rewards/chosen"), reward);
            out.insert(format!("{prefix}logps/chosen"), logps);
        }
        if let Some((reward, logps)) = rejected {
            out.insert(format!("{prefix}rewards/rejected"), reward);
            out.insert(format!("{prefix}logps/rejected"), logps);
        }
        if let (Some((c, _)), Some((r, _))) = (chosen, rejected) {
            out.insert(format!("{prefix}rewards/margins"), c - r);
        }
        out
    }
}

// ── Loss ────────────────────────────────────────────────────────────────────

pub struct KtoOutput {
    /// Scalar loss carrying the policy graph.
    pub loss: Tensor,
    pub metrics: KtoMetrics,
}

/// KTO loss for one batch.
///
/// `reference = None` means reference-free: reference log-probs are zero.
pub fn kto_loss(
    policy: &SequenceLogps,
    reference: Option<&SequenceLogps>,
    desirable: &[bool],
    config: &KtoConfig,
) -> Result<KtoOutput> {
    let n = desirable.len();
    if n == 0 {
        candle_core::bail!("KTO loss over an empty batch");
    }
    let device = policy.response.device();

    let (logratio, kl_diff) = match reference {
        Some(r) => (
            (&policy.response - r.response.detach())?,
            (policy.kl.detach() - r.kl.detach())?,
        ),
        None => (policy.response.clone(), policy.kl.detach()),
    };
    let kl = kl_diff.mean_all()?.to_scalar::<f32>()?.max(0.0) as f64;

    let sign: Vec<f32> = desirable.iter().map(|&d| if d { 1.0 } else { -1.0 }).collect();
    let weight: Vec<f32> = desirable
        .iter()
        .map(|&d| {
            if d {
                config.desirable_weight as f32
            } else {
                config.undesirable_weight as f32
            }
        })
        .collect();
    let sign = Tensor::from_vec(sign, n, device)?;
    let weight = Tensor::from_vec(weight, n, device)?;

    let z = logratio.affine(1.0, -kl)?.mul(&sign)?.affine(config.beta, 0.0)?;
    let losses = ops::sigmoid(&z)?.affine(-1.0, 1.0)?.mul(&weight)?;
    let loss = losses.mean_all()?;

    let rewards = logratio.detach().affine(config.beta, 0.0)?.to_vec1::<f32>()?;
    let logps = policy.response.detach().to_vec1::<f32>()?;
    let mut metrics = KtoMetrics {
        loss_sum: loss.to_scalar::<f32>()? as f64,
        kl_sum: kl,
        batches: 1,
        ..Default::default()
    };
    for ((&d, &reward), &lp) in desirable.iter().zip(&rewards).zip(&logps) {
        if d {
            metrics.chosen_rewards += reward as f64;
            metrics.chosen_logps += lp as f64;
            metrics.num_chosen += 1;
        } else {
            metrics.rejected_rewards += reward as f64;
            metrics.rejected_logps += lp as f64;
            metrics.num_rejected += 1;
        }
    }
    Ok(KtoOutput { loss, metrics })
}

// ── Tests ───────────────────────────────────────────────────────────────────
