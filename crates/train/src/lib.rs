//! # kto-train: Objective and Training Loop
//!
//! * **[`KtoTrainer`]**: owns policy, reference and optimisers. One call to
//!   [`KtoTrainer::train`] runs every epoch: forward, KTO loss, backward,
//!   gradient clipping, AdamW (a second group for LoRA+), schedule advance,
//!   logging, evaluation and checkpointing.
//! * **[`kto`]**: per-example log-probs and the KTO loss with its metrics.
//! * **[`LrScheduler`]**: warmup → cosine / linear / constant.
//! * **[`checkpoint`]**: `checkpoint-<step>` discovery, rotation, trainer state.
//! * **[`metrics`]**: metric tables, `*_results.json`, effective-token accounting.

pub mod checkpoint;
pub mod kto;
pub mod metrics;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{get_last_checkpoint, TrainerState};
pub use kto::{kto_loss, KtoMetrics, SequenceLogps};
pub use metrics::{calculate_effective_tokens, log_metrics, save_metrics, Metrics};
pub use scheduler::{LrDecay, LrScheduler};
pub use trainer::{KtoTrainer, PolicyWeights, Reference, TrainOutput, TrainerConfig};
