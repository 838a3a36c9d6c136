//! `KtoTrainer`: the KTO training loop.
//!
//! Decouples the compute graph (policy + reference forward, KTO loss) from
//! the optimisation step (backward, gradient clipping, AdamW, schedule
//! advance). One call to [`KtoTrainer::train`] runs every epoch with
//! logging, evaluation and checkpointing.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use indicatif::{ProgressBar, ProgressStyle};

use kto_common::{
    collate, IntervalStrategy, KtoConfig, MaskLayout, PackedSequence, PreferenceBatch,
    TrainingArgs, ZeroPaddingDataset,
};
use kto_core::model::{load_into_varmap, load_tensors, safetensors_files};
use kto_core::{copy_varmap, save_pretrained, CausalLm, LoraModel};

use crate::checkpoint::{checkpoint_dir, rotate_checkpoints, TrainerState, TRAINER_STATE_NAME};
use crate::kto::{kto_loss, KtoMetrics, KtoOutput, SequenceLogps};
use crate::metrics::{speed_metrics, Metrics};
use crate::scheduler::LrScheduler;

pub const TOKENIZER_FILE_NAME: &str = "tokenizer.json";

// ── Config ──────────────────────────────────────────────────────────────────

/// Everything the trainer needs besides the models.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub args: TrainingArgs,
    pub kto: KtoConfig,
    pub mask_layout: MaskLayout,
    /// Every batch is padded to this length.
    pub max_seq_len: usize,
    pub pad_token_id: u32,
    /// Copied next to saved weights when set.
    pub tokenizer_file: Option<PathBuf>,
}

/// Trainable weights of the policy.
pub enum PolicyWeights {
    /// Full fine-tuning: every model weight.
    Full(VarMap),
    /// LoRA: adapters only, base weights frozen.
    Lora(LoraModel),
}

/// Where reference log-probs come from.
pub enum Reference {
    /// Reference log-probs are zero.
    Free,
    /// Frozen copy of the policy; its weights live in `varmap`.
    Model { model: CausalLm, varmap: VarMap },
    /// The policy with its LoRA adapters bypassed.
    AdapterBypass,
}

/// Result of [`KtoTrainer::train`].
#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub global_step: usize,
    pub training_loss: f64,
    pub metrics: Metrics,
}

struct ParamGroup {
    optimizer: AdamW,
    lr_scale: f64,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct KtoTrainer {
    policy: CausalLm,
    weights: PolicyWeights,
    reference: Reference,
    vars: Vec<Var>,
    groups: Vec<ParamGroup>,
    config: TrainerConfig,
    state: TrainerState,
    device: Device,
}

impl KtoTrainer {
    pub fn new(
        policy: CausalLm,
        weights: PolicyWeights,
        reference: Reference,
        config: TrainerConfig,
        device: Device,
    ) -> Result<Self> {
        let reference = if config.kto.reference_free {
            Reference::Free
        } else {
            reference
        };
        if matches!(
            (&weights, &reference),
            (PolicyWeights::Full(_), Reference::AdapterBypass)
        ) {
            bail!("adapter-bypass reference requires LoRA weights");
        }

        let args = &config.args;
        let params = |lr: f64| ParamsAdamW {
            lr,
            beta1: args.adam_beta1,
            beta2: args.adam_beta2,
            eps: args.adam_epsilon,
            weight_decay: args.weight_decay,
        };
        let mut groups = Vec::new();
        let vars = match &weights {
            PolicyWeights::Full(varmap) => {
                let vars = varmap.all_vars();
                groups.push(ParamGroup {
                    optimizer: AdamW::new(vars.clone(), params(args.learning_rate))?,
                    lr_scale: 1.0,
                });
                vars
            }
            PolicyWeights::Lora(lora) => {
                let (a, b) = lora.param_groups();
                let scale = lora.config().lora_plus_scale;
                if scale != 1.0 {
                    groups.push(ParamGroup {
                        optimizer: AdamW::new(a.clone(), params(args.learning_rate))?,
                        lr_scale: 1.0,
                    });
                    groups.push(ParamGroup {
                        optimizer: AdamW::new(b.clone(), params(args.learning_rate * scale))?,
                        lr_scale: scale,
                    });
                    a.into_iter().chain(b).collect()
                } else {
                    let all: Vec<Var> = a.into_iter().chain(b).collect();
                    groups.push(ParamGroup {
                        optimizer: AdamW::new(all.clone(), params(args.learning_rate))?,
                        lr_scale: 1.0,
                    });
                    all
                }
            }
        };
        if vars.is_empty() {
            bail!("policy has no trainable parameters");
        }

        Ok(Self {
            policy,
            weights,
            reference,
            vars,
            groups,
            config,
            state: TrainerState::default(),
            device,
        })
    }

    pub fn policy(&self) -> &CausalLm {
        &self.policy
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn num_trainable_parameters(&self) -> usize {
        self.vars.iter().map(|v| v.elem_count()).sum()
    }

    // ── Training loop ───────────────────────────────────────────────────────

    /// Train on `train_ds`, optionally resuming from a checkpoint directory.
    ///
    /// Evaluation during training (per `evaluation_strategy`) runs on
    /// `eval_ds` when one is given. A resume restores weights, step and log
    /// history only; AdamW moments restart from zero.
    pub fn train(
        &mut self,
        train_ds: &ZeroPaddingDataset,
        eval_ds: Option<&ZeroPaddingDataset>,
        resume_from_checkpoint: Option<&Path>,
    ) -> Result<TrainOutput> {
        if train_ds.is_empty() {
            bail!("train dataset is empty");
        }
        let args = self.config.args.clone();
        let batch_size = args.per_device_train_batch_size;
        let accum = args.gradient_accumulation_steps.max(1);
        let updates_per_epoch = train_ds.num_batches(batch_size).div_ceil(accum);
        let max_steps = if args.max_steps > 0 {
            args.max_steps as usize
        } else {
            (args.num_train_epochs * updates_per_epoch as f64).ceil() as usize
        };
        if max_steps == 0 {
            bail!("nothing to train: max_steps resolved to 0");
        }
        let num_epochs = max_steps.div_ceil(updates_per_epoch);
        let mut scheduler = LrScheduler::from_training_args(&args, max_steps);

        self.state = TrainerState {
            max_steps,
            num_train_epochs: num_epochs,
            train_batch_size: batch_size,
            logging_steps: args.logging_steps,
            eval_steps: args.eval_steps,
            save_steps: args.save_steps,
            ..Default::default()
        };
        if let Some(dir) = resume_from_checkpoint {
            self.load_checkpoint(dir)?;
        }
        let resumed = self.state.global_step;
        scheduler.set_step(resumed);

        tracing::info!("***** Running training *****");
        tracing::info!("  Num examples = {}", train_ds.num_examples());
        tracing::info!("  Num sequences = {}", train_ds.len());
        tracing::info!("  Num Epochs = {num_epochs}");
        tracing::info!("  Instantaneous batch size per device = {batch_size}");
        tracing::info!(
            "  Total train batch size (w. parallel, distributed & accumulation) = {}",
            args.total_train_batch_size()
        );
        tracing::info!("  Gradient Accumulation steps = {accum}");
        tracing::info!("  Total optimization steps = {max_steps}");
        tracing::info!(
            "  Number of trainable parameters = {}",
            self.num_trainable_parameters()
        );
        if resumed > 0 {
            tracing::info!("  Continuing training from global step {resumed}");
        }

        let pb = progress_bar(max_steps, resumed, args.disable_tqdm);
        let start = Instant::now();
        let mut window = KtoMetrics::default();
        let mut loss_total = 0.0f64;
        let mut steps_run = 0usize;
        let mut seen = 0usize;
        let mut done = false;

        for epoch in 0..num_epochs {
            let batches = train_ds.batch_indices(batch_size, args.dataloader_shuffle, args.seed + epoch as u64);
            let mut ran_in_epoch = false;
            for group in batches.chunks(accum) {
                seen += 1;
                if seen <= resumed {
                    continue;
                }
                ran_in_epoch = true;
                let lr = scheduler.current_lr();
                let (metrics, grad_norm) = self.training_step(train_ds, group, lr)?;
                scheduler.advance();

                self.state.global_step += 1;
                self.state.epoch = self.state.global_step as f64 / updates_per_epoch as f64;
                let step = self.state.global_step;
                let loss = metrics.mean_loss();
                loss_total += loss;
                steps_run += 1;
                window.merge(&metrics);
                self.maybe_sync_reference()?;

                pb.inc(1);
                pb.set_message(format!("loss {loss:.4} lr {lr:.2e}"));

                if args.logging_steps > 0 && step % args.logging_steps == 0 {
                    self.log_window(&mut window, lr, grad_norm);
                }
                if args.evaluation_strategy == IntervalStrategy::Steps
                    && args.eval_steps > 0
                    && step % args.eval_steps == 0
                {
                    self.evaluate_during_training(eval_ds)?;
                }
                if args.save_strategy == IntervalStrategy::Steps
                    && args.save_steps > 0
                    && step % args.save_steps == 0
                {
                    self.save_checkpoint()?;
                }
                if step >= max_steps {
                    done = true;
                    break;
                }
            }
            if ran_in_epoch {
                if args.evaluation_strategy == IntervalStrategy::Epoch {
                    self.evaluate_during_training(eval_ds)?;
                }
                if args.save_strategy == IntervalStrategy::Epoch {
                    self.save_checkpoint()?;
                }
            }
            if done {
                break;
            }
        }
        pb.finish_and_clear();
        tracing::info!("Training completed.");

        let training_loss = if steps_run > 0 {
            loss_total / steps_run as f64
        } else {
            0.0
        };
        let mut metrics = speed_metrics(
            "train",
            start,
            steps_run * args.total_train_batch_size(),
            steps_run,
        );
        metrics.insert("train_loss".into(), training_loss);
        metrics.insert("progress_or_epoch".into(), self.state.epoch);
        Ok(TrainOutput {
            global_step: self.state.global_step,
            training_loss,
            metrics,
        })
    }

    /// One optimiser update over accumulated micro-batches.
    fn training_step(
        &mut self,
        ds: &ZeroPaddingDataset,
        micro_batches: &[Vec<usize>],
        lr: f64,
    ) -> Result<(KtoMetrics, f64)> {
        let n = micro_batches.len();
        let mut total_loss: Option<Tensor> = None;
        let mut metrics = KtoMetrics::default();
        for indices in micro_batches {
            let batch = self.collate(ds, indices)?;
            let out = self.compute_loss(&self.policy, &batch)?;
            metrics.merge(&out.metrics);
            let scaled = out.loss.affine(1.0 / n as f64, 0.0)?;
            total_loss = Some(match total_loss {
                None => scaled,
                Some(prev) => (prev + scaled)?,
            });
        }
        let total_loss = total_loss.ok_or_else(|| anyhow!("empty accumulation group"))?;

        let mut grads = total_loss.backward()?;
        let norm = clip_grad_norm(&mut grads, &self.vars, self.config.args.max_grad_norm)?;
        for group in &mut self.groups {
            group.optimizer.set_learning_rate(lr * group.lr_scale);
            group.optimizer.step(&grads)?;
        }
        Ok((metrics, norm))
    }

    /// Policy and reference forward passes plus the KTO loss.
    ///
    /// `policy` is either the trained model or its [`CausalLm::detached`]
    /// view; the adapter-bypass reference runs on the same one.
    fn compute_loss(&self, policy: &CausalLm, batch: &PreferenceBatch) -> Result<KtoOutput> {
        let logits = policy.forward(&batch.input_ids, &batch.position_ids, &batch.mask, true)?;
        let logps = self.sequence_logps(&logits, batch)?;

        let reference = match &self.reference {
            Reference::Free => None,
            Reference::Model { model, .. } => {
                let logits = model
                    .forward(&batch.input_ids, &batch.position_ids, &batch.mask, true)?
                    .detach();
                Some(self.sequence_logps(&logits, batch)?.detach())
            }
            Reference::AdapterBypass => {
                let logits = policy
                    .forward(&batch.input_ids, &batch.position_ids, &batch.mask, false)?
                    .detach();
                Some(self.sequence_logps(&logits, batch)?.detach())
            }
        };
        Ok(kto_loss(
            &logps,
            reference.as_ref(),
            &batch.desirable,
            &self.config.kto,
        )?)
    }

    fn sequence_logps(&self, logits: &Tensor, batch: &PreferenceBatch) -> Result<SequenceLogps> {
        Ok(SequenceLogps::from_logits(
            logits,
            &batch.labels,
            &batch.response_selector,
            &batch.kl_selector,
        )?)
    }

    fn collate(&self, ds: &ZeroPaddingDataset, indices: &[usize]) -> Result<PreferenceBatch> {
        let seqs = indices
            .iter()
            .map(|&i| {
                ds.get(i)
                    .ok_or_else(|| anyhow!("sequence index {i} out of range ({})", ds.len()))
            })
            .collect::<Result<Vec<&PackedSequence>>>()?;
        Ok(collate(
            &seqs,
            self.config.max_seq_len,
            self.config.pad_token_id,
            self.config.mask_layout,
            &self.device,
        )?)
    }

    /// Copy policy weights into the reference every `ref_model_update_steps`.
    fn maybe_sync_reference(&self) -> Result<()> {
        let every = self.config.kto.ref_model_update_steps;
        if every <= 0 || self.state.global_step % every as usize != 0 {
            return Ok(());
        }
        if let (PolicyWeights::Full(policy), Reference::Model { varmap, .. }) =
            (&self.weights, &self.reference)
        {
            copy_varmap(policy, varmap)?;
            tracing::info!(step = self.state.global_step, "reference model synced from policy");
        }
        Ok(())
    }

    fn log_window(&mut self, window: &mut KtoMetrics, lr: f64, grad_norm: f64) {
        let mut entry = window.summary("");
        entry.insert("learning_rate".into(), lr);
        entry.insert("grad_norm".into(), grad_norm);
        let shown = entry
            .iter()
            .map(|(k, v)| format!("{k}: {v:.4e}"))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(
            step = self.state.global_step,
            epoch = self.state.epoch,
            "{shown}"
        );
        self.state.push_log(entry);
        *window = KtoMetrics::default();
    }

    fn evaluate_during_training(&mut self, eval_ds: Option<&ZeroPaddingDataset>) -> Result<()> {
        let Some(ds) = eval_ds else {
            return Ok(());
        };
        let metrics = self.evaluate(ds)?;
        crate::metrics::log_metrics("eval", &metrics);
        self.state.push_log(metrics);
        Ok(())
    }

    // ── Evaluation ──────────────────────────────────────────────────────────

    /// Loss and KTO statistics over `eval_ds`, keys prefixed `eval_`.
    pub fn evaluate(&self, eval_ds: &ZeroPaddingDataset) -> Result<Metrics> {
        if eval_ds.is_empty() {
            bail!("eval dataset is empty");
        }
        let start = Instant::now();
        let batches = eval_ds.batch_indices(self.config.args.per_device_eval_batch_size, false, 0);
        tracing::info!("***** Running Evaluation *****");
        tracing::info!("  Num examples = {}", eval_ds.num_examples());
        tracing::info!("  Batch size = {}", self.config.args.per_device_eval_batch_size);

        let policy = self.policy.detached();
        let mut metrics = KtoMetrics::default();
        for indices in &batches {
            let batch = self.collate(eval_ds, indices)?;
            metrics.merge(&self.compute_loss(&policy, &batch)?.metrics);
        }
        let mut out = metrics.summary("eval_");
        out.extend(speed_metrics("eval", start, eval_ds.len(), batches.len()));
        if self.state.global_step > 0 {
            out.insert("epoch".into(), self.state.epoch);
        }
        Ok(out)
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Trainable weights (full model or adapters) plus the tokenizer.
    pub fn save_model(&self, dir: Option<&Path>) -> Result<()> {
        let dir = dir.unwrap_or(self.config.args.output_dir.as_path());
        tracing::info!("Saving model checkpoint to {}", dir.display());
        match &self.weights {
            PolicyWeights::Full(varmap) => save_pretrained(varmap, self.policy.config(), dir)?,
            PolicyWeights::Lora(lora) => lora.save_pretrained(dir)?,
        }
        if let Some(src) = &self.config.tokenizer_file {
            let dst = dir.join(TOKENIZER_FILE_NAME);
            let same = match (src.canonicalize(), dst.canonicalize()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            };
            if !same {
                std::fs::copy(src, &dst)
                    .with_context(|| format!("copy tokenizer to {}", dst.display()))?;
            }
        }
        Ok(())
    }

    /// `output_dir/trainer_state.json`.
    pub fn save_state(&self) -> Result<()> {
        let dir = &self.config.args.output_dir;
        std::fs::create_dir_all(dir)?;
        self.state.save(&dir.join(TRAINER_STATE_NAME))
    }

    /// `output_dir/checkpoint-<step>/`, then rotate old checkpoints.
    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let dir = checkpoint_dir(&self.config.args.output_dir, self.state.global_step);
        self.save_model(Some(&dir))?;
        self.state.save(&dir.join(TRAINER_STATE_NAME))?;
        rotate_checkpoints(&self.config.args.output_dir, self.config.args.save_total_limit)?;
        Ok(dir)
    }

    /// Restore trainable weights and progress from a checkpoint directory.
    ///
    /// Optimiser moments are not checkpointed and restart from zero.
    fn load_checkpoint(&mut self, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            bail!("checkpoint {} does not exist", dir.display());
        }
        tracing::info!("Loading model from {}", dir.display());
        match &mut self.weights {
            PolicyWeights::Full(varmap) => {
                let tensors = load_tensors(&safetensors_files(dir)?, &self.device)?;
                load_into_varmap(varmap, &tensors)?;
            }
            PolicyWeights::Lora(lora) => lora.load_weights(dir)?,
        }
        let state_path = dir.join(TRAINER_STATE_NAME);
        if state_path.is_file() {
            let saved = TrainerState::load(&state_path)?;
            self.state.global_step = saved.global_step;
            self.state.epoch = saved.epoch;
            self.state.log_history = saved.log_history;
            tracing::warn!(
                "optimizer state is not checkpointed; AdamW moments restart from zero at step {}",
                saved.global_step
            );
        } else {
            tracing::warn!("no {TRAINER_STATE_NAME} in {}; restarting at step 0", dir.display());
        }
        Ok(())
    }
}

fn progress_bar(len: usize, position: usize, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40} {pos}/{len} steps {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_position(position as u64);
    pb
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// Clip gradients so their global L2 norm ≤ `max_norm`; returns the norm
/// before clipping. `max_norm <= 0` disables clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if max_norm <= 0.0 || norm <= max_norm {
        return Ok(norm);
    }
    let scale = max_norm / norm.max(1e-12);
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(norm)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use kto_common::{ModelConfig, TokenizedExample};
    use kto_core::{build_frozen, build_full, build_lora, LoraConfig, WeightInit};

    use crate::checkpoint::get_last_checkpoint;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 32,
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            max_position_embeddings: 64,
            ..Default::default()
        }
    }

    /// Examples of 8 tokens: prompt rows 0..1, response 1..4, KL 4..7.
    fn dataset(n: usize) -> ZeroPaddingDataset {
        let examples = (0..n)
            .map(|i| TokenizedExample {
                input_ids: (0..8).map(|k| ((i * 3 + k) % 30 + 1) as u32).collect(),
                position_ids: (0..8).collect(),
                attn_end_rows: vec![8; 8],
                response_span: 1..4,
                kl_span: 4..7,
                desirable: i % 2 == 0,
            })
            .collect();
        ZeroPaddingDataset::new(examples, 16, false)
    }

    fn config(output_dir: &Path, max_steps: i64) -> TrainerConfig {
        TrainerConfig {
            args: TrainingArgs {
                output_dir: output_dir.to_path_buf(),
                do_train: true,
                max_steps,
                learning_rate: 1e-2,
                logging_steps: 1,
                save_steps: 2,
                save_total_limit: 1,
                gradient_accumulation_steps: 2,
                disable_tqdm: true,
                device: "cpu".into(),
                ..Default::default()
            },
            kto: KtoConfig::default(),
            mask_layout: MaskLayout::EndRows,
            max_seq_len: 16,
            pad_token_id: 0,
            tokenizer_file: None,
        }
    }

    fn full_trainer(dir: &Path, max_steps: i64, kto: KtoConfig) -> (KtoTrainer, VarMap) {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        let (policy, policy_vm) = build_full(&cfg, &WeightInit::Random, DType::F32, &dev).unwrap();
        let (reference, ref_vm) = build_frozen(&cfg, DType::F32, &dev).unwrap();
        copy_varmap(&policy_vm, &ref_vm).unwrap();
        let mut tc = config(dir, max_steps);
        tc.kto = kto;
        let trainer = KtoTrainer::new(
            policy,
            PolicyWeights::Full(policy_vm),
            Reference::Model {
                model: reference,
                varmap: ref_vm.clone(),
            },
            tc,
            dev,
        )
        .unwrap();
        (trainer, ref_vm)
    }

    fn lora_trainer(dir: &Path, max_steps: i64) -> KtoTrainer {
        let dev = Device::Cpu;
        let lora = LoraModel::new(LoraConfig {
            r: 4,
            lora_alpha: 8.0,
            lora_plus_scale: 4.0,
            ..Default::default()
        });
        let policy =
            build_lora(&tiny_config(), &WeightInit::Random, DType::F32, &dev, &lora, None).unwrap();
        KtoTrainer::new(
            policy,
            PolicyWeights::Lora(lora),
            Reference::AdapterBypass,
            config(dir, max_steps),
            dev,
        )
        .unwrap()
    }

    #[test]
    fn full_finetune_runs_and_saves() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = dataset(8);
        let (mut trainer, _) = full_trainer(tmp.path(), 3, KtoConfig::default());

        let out = trainer.train(&ds, None, None).unwrap();
        assert_eq!(out.global_step, 3);
        assert!(out.training_loss.is_finite());
        assert!(out.metrics.contains_key("train_runtime"));
        assert!(out.metrics.contains_key("train_samples_per_second"));
        assert_eq!(trainer.state().log_history.len(), 3);

        // save_steps = 2 with a limit of one checkpoint.
        let last = get_last_checkpoint(tmp.path()).unwrap().unwrap();
        assert_eq!(last, checkpoint_dir(tmp.path(), 2));
        assert!(last.join(TRAINER_STATE_NAME).is_file());

        trainer.save_model(None).unwrap();
        trainer.save_state().unwrap();
        assert!(tmp.path().join("model.safetensors").is_file());
        assert!(tmp.path().join("config.json").is_file());
        assert!(tmp.path().join(TRAINER_STATE_NAME).is_file());

        let eval = trainer.evaluate(&ds).unwrap();
        assert!(eval["eval_loss"].is_finite());
        assert!(eval.contains_key("eval_rewards/chosen"));
        assert!(eval.contains_key("eval_rewards/rejected"));
        assert!(eval.contains_key("eval_runtime"));
    }

    #[test]
    fn evaluation_loss_carries_no_graph() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = dataset(4);
        let (trainer, _) = full_trainer(tmp.path(), 1, KtoConfig::default());
        let batch = trainer.collate(&ds, &ds.batch_indices(2, false, 0)[0]).unwrap();

        let tracked = trainer.compute_loss(&trainer.policy, &batch).unwrap().loss;
        let view = trainer.policy.detached();
        let plain = trainer.compute_loss(&view, &batch).unwrap().loss;
        assert_eq!(
            tracked.to_scalar::<f32>().unwrap(),
            plain.to_scalar::<f32>().unwrap()
        );

        let grads = tracked.backward().unwrap();
        assert!(trainer.vars.iter().any(|v| grads.get(v.as_tensor()).is_some()));
        let grads = plain.backward().unwrap();
        assert!(trainer.vars.iter().all(|v| grads.get(v.as_tensor()).is_none()));
    }

    #[test]
    fn untrained_policy_has_zero_rewards() {
        let tmp = tempfile::tempdir().unwrap();
        let trainer = lora_trainer(tmp.path(), 1);
        let eval = trainer.evaluate(&dataset(4)).unwrap();
        // B starts at zero, so policy and bypassed reference agree.
        assert!(eval["eval_rewards/chosen"].abs() < 1e-6);
        assert!(eval["eval_kl"].abs() < 1e-6);
        assert!((eval["eval_loss"] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn reference_sync_copies_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let kto = KtoConfig {
            ref_model_update_steps: 1,
            ..Default::default()
        };
        let (mut trainer, ref_vm) = full_trainer(tmp.path(), 1, kto);
        trainer.train(&dataset(4), None, None).unwrap();
        let PolicyWeights::Full(policy_vm) = &trainer.weights else {
            unreachable!()
        };
        let policy = policy_vm.data().lock().unwrap();
        let reference = ref_vm.data().lock().unwrap();
        for (name, var) in policy.iter() {
            let a = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let b = reference[name].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(a, b, "{name} out of sync");
        }
    }

    #[test]
    fn lora_resume_continues_step_count() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = dataset(8);
        let mut first = lora_trainer(tmp.path(), 2);
        first.train(&ds, None, None).unwrap();
        let ckpt = checkpoint_dir(tmp.path(), 2);
        assert!(ckpt.join(kto_core::lora::LORA_WEIGHTS_NAME).is_file());
        assert!(ckpt.join(kto_core::lora::LORA_CONFIG_NAME).is_file());

        let mut second = lora_trainer(tmp.path(), 4);
        let out = second.train(&ds, None, Some(&ckpt)).unwrap();
        assert_eq!(out.global_step, 4);
        // Two logged steps from the first run plus two new ones.
        assert_eq!(second.state().log_history.len(), 4);
    }

    #[test]
    fn bypass_reference_needs_adapters() {
        let dev = Device::Cpu;
        let (policy, vm) = build_full(&tiny_config(), &WeightInit::Random, DType::F32, &dev).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let result = KtoTrainer::new(
            policy,
            PolicyWeights::Full(vm),
            Reference::AdapterBypass,
            config(tmp.path(), 1),
            dev,
        );
        assert!(result.is_err());
    }
}
