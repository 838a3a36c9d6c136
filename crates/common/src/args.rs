//! Argument groups for a KTO run.
//!
//! A run is configured by four groups: [`ModelArgs`], [`DataArgs`],
//! [`TrainingArgs`] and [`KtoConfig`]. All of them deserialise from one JSON
//! map and take typed command-line overrides (see [`crate::argparse`]), so a
//! single JSON file can carry every knob. Every field has a default; a
//! minimal `{}` plus `model_name_or_path` is a valid configuration.

use std::path::PathBuf;

use anyhow::{bail, Result};
use candle_core::DType;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

// ── Model ───────────────────────────────────────────────────────────────────

/// Model construction and LoRA knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArgs {
    /// Directory holding `config.json`, safetensors weights and `tokenizer.json`.
    pub model_name_or_path: String,
    /// Directory or `tokenizer.json` path; falls back to `model_name_or_path`.
    pub tokenizer_name_or_path: Option<String>,
    pub use_flash_attention: bool,
    /// End-row ("flash mask") attention masking over zero-padded sequences.
    pub flash_mask: bool,
    /// `weight_only_int8` or `weight_only_int4`.
    pub weight_quantize_algo: Option<String>,
    /// Pre-trained LoRA adapter directory.
    pub lora_path: Option<String>,
    pub lora_rank: usize,
    /// `-1` resolves to `2 * lora_rank` (or 4 with rsLoRA).
    pub lora_alpha: f64,
    pub rslora: bool,
    pub rslora_plus: bool,
    pub lora_plus_scale: f64,
    pub use_quick_lora: bool,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            model_name_or_path: String::new(),
            tokenizer_name_or_path: None,
            use_flash_attention: false,
            flash_mask: false,
            weight_quantize_algo: None,
            lora_path: None,
            lora_rank: 8,
            lora_alpha: -1.0,
            rslora: false,
            rslora_plus: false,
            lora_plus_scale: 1.0,
            use_quick_lora: false,
        }
    }
}

impl ModelArgs {
    pub fn validate(&self) -> Result<()> {
        if self.model_name_or_path.trim().is_empty() {
            bail!("`model_name_or_path` is required");
        }
        if self.lora_rank == 0 {
            bail!("`lora_rank` must be positive");
        }
        if self.lora_plus_scale <= 0.0 {
            bail!("`lora_plus_scale` must be positive, got {}", self.lora_plus_scale);
        }
        if let Some(algo) = &self.weight_quantize_algo {
            if algo != "weight_only_int8" && algo != "weight_only_int4" {
                bail!("unsupported weight_quantize_algo `{algo}` (expected weight_only_int8 or weight_only_int4)");
            }
        }
        Ok(())
    }

    /// Resolve LoRA hyper-parameters for a fresh adapter.
    ///
    /// `rslora_plus` forces rsLoRA with `lora_plus_scale = 4` and `lora_alpha = 4`;
    /// an unset alpha (`-1`) becomes 4 under rsLoRA, `2 * lora_rank` otherwise.
    pub fn resolve_lora_hyperparams(&mut self) {
        if self.rslora_plus {
            self.rslora = true;
            self.lora_plus_scale = 4.0;
            self.lora_alpha = 4.0;
        }
        if self.weight_quantize_algo.is_some() && (self.rslora || self.lora_plus_scale != 1.0) {
            tracing::info!("Weight quantization is not supported in LoRA+ and RsLoRA.");
        }
        if self.lora_alpha == -1.0 {
            self.lora_alpha = if self.rslora {
                4.0
            } else {
                2.0 * self.lora_rank as f64
            };
        }
    }
}

// ── Data ────────────────────────────────────────────────────────────────────

/// Dataset locations and sequence budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataArgs {
    pub train_dataset_path: PathBuf,
    pub dev_dataset_path: PathBuf,
    pub max_seq_len: usize,
    pub max_prompt_len: usize,
    /// First-fit-decreasing packing for the train set (tighter, reorders examples).
    pub greedy_zero_padding: bool,
}

impl Default for DataArgs {
    fn default() -> Self {
        Self {
            train_dataset_path: PathBuf::from("./data/train.jsonl"),
            dev_dataset_path: PathBuf::from("./data/dev.jsonl"),
            max_seq_len: 4096,
            max_prompt_len: 2048,
            greedy_zero_padding: false,
        }
    }
}

impl DataArgs {
    pub fn validate(&self) -> Result<()> {
        if self.max_prompt_len >= self.max_seq_len {
            bail!(
                "max_prompt_len ({}) must be smaller than max_seq_len ({})",
                self.max_prompt_len,
                self.max_seq_len
            );
        }
        if self.max_prompt_len == 0 {
            bail!("max_prompt_len must be positive");
        }
        Ok(())
    }
}

// ── Training ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerType {
    Linear,
    Cosine,
    Constant,
}

/// When to evaluate or save during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IntervalStrategy {
    No,
    Steps,
    Epoch,
}

/// Trainer knobs, including the parallelism flags the run validates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArgs {
    pub output_dir: PathBuf,
    pub overwrite_output_dir: bool,
    pub do_train: bool,
    pub do_eval: bool,
    pub resume_from_checkpoint: Option<String>,

    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub num_train_epochs: f64,
    /// `-1` derives the step budget from `num_train_epochs`.
    pub max_steps: i64,

    pub learning_rate: f64,
    pub min_lr: f64,
    pub lr_scheduler_type: SchedulerType,
    pub warmup_steps: usize,
    pub warmup_ratio: f64,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub max_grad_norm: f64,

    pub logging_steps: usize,
    pub evaluation_strategy: IntervalStrategy,
    pub eval_steps: usize,
    pub save_strategy: IntervalStrategy,
    pub save_steps: usize,
    /// Number of `checkpoint-*` directories to keep; `0` keeps all.
    pub save_total_limit: usize,

    pub seed: u64,
    /// `cpu`, `gpu`, `gpu:<id>` or `cuda:<id>`.
    pub device: String,
    pub fp16: bool,
    pub bf16: bool,
    pub fp16_opt_level: String,

    pub tensor_parallel_degree: usize,
    pub pipeline_parallel_degree: usize,
    pub sharding_parallel_degree: usize,
    pub sequence_parallel: bool,
    pub pipeline_parallel_config: String,
    pub sharding_parallel_config: String,

    pub benchmark: bool,
    pub autotuner_benchmark: bool,
    pub dataloader_shuffle: bool,
    pub disable_tqdm: bool,

    #[serde(skip)]
    pub local_rank: i64,
    #[serde(skip)]
    pub world_size: usize,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./checkpoints/kto_ckpts"),
            overwrite_output_dir: false,
            do_train: false,
            do_eval: false,
            resume_from_checkpoint: None,
            per_device_train_batch_size: 1,
            per_device_eval_batch_size: 1,
            gradient_accumulation_steps: 1,
            num_train_epochs: 1.0,
            max_steps: -1,
            learning_rate: 5e-5,
            min_lr: 0.0,
            lr_scheduler_type: SchedulerType::Linear,
            warmup_steps: 0,
            warmup_ratio: 0.0,
            weight_decay: 0.0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            max_grad_norm: 1.0,
            logging_steps: 10,
            evaluation_strategy: IntervalStrategy::No,
            eval_steps: 500,
            save_strategy: IntervalStrategy::Steps,
            save_steps: 500,
            save_total_limit: 0,
            seed: 42,
            device: "gpu".to_string(),
            fp16: false,
            bf16: false,
            fp16_opt_level: "O1".to_string(),
            tensor_parallel_degree: 1,
            pipeline_parallel_degree: 1,
            sharding_parallel_degree: 1,
            sequence_parallel: false,
            pipeline_parallel_config: String::new(),
            sharding_parallel_config: String::new(),
            benchmark: false,
            autotuner_benchmark: false,
            dataloader_shuffle: true,
            disable_tqdm: false,
            local_rank: -1,
            world_size: 1,
        }
    }
}

/// True when `flag` appears in a space/comma separated option string.
fn config_has(config: &str, flag: &str) -> bool {
    config
        .split(|c: char| c.is_whitespace() || c == ',')
        .any(|item| item == flag)
}

impl TrainingArgs {
    /// Fill `local_rank` / `world_size` from `LOCAL_RANK` / `WORLD_SIZE`.
    pub fn read_environment(&mut self) {
        self.local_rank = std::env::var("LOCAL_RANK")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);
        self.world_size = std::env::var("WORLD_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
            .max(1);
    }

    pub fn validate(&self) -> Result<()> {
        if self.fp16 && self.bf16 {
            bail!("`fp16` and `bf16` are mutually exclusive");
        }
        if self.per_device_train_batch_size == 0 || self.per_device_eval_batch_size == 0 {
            bail!("batch sizes must be positive");
        }
        if self.gradient_accumulation_steps == 0 {
            bail!("`gradient_accumulation_steps` must be positive");
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            bail!("`warmup_ratio` must lie in [0, 1], got {}", self.warmup_ratio);
        }
        if self.tensor_parallel_degree == 0
            || self.pipeline_parallel_degree == 0
            || self.sharding_parallel_degree == 0
        {
            bail!("parallel degrees must be at least 1");
        }
        Ok(())
    }

    /// Enforce the required pipeline/sequence-parallel flag combinations.
    ///
    /// Sequence parallelism without tensor parallelism is switched off.
    pub fn check_parallel_flags(&mut self) -> Result<()> {
        if self.pipeline_parallel_degree > 1
            && !config_has(&self.pipeline_parallel_config, "enable_clear_every_step_cache")
        {
            bail!("Should set '--pipeline_parallel_config enable_clear_every_step_cache' in bash script for pp.");
        }
        if self.sequence_parallel {
            if self.pipeline_parallel_degree > 1
                && !config_has(&self.pipeline_parallel_config, "disable_partial_send_recv")
            {
                bail!("Should set '--pipeline_parallel_config disable_partial_send_recv' in bash script for pp with sp.");
            }
            if self.tensor_parallel_degree <= 1 {
                self.sequence_parallel = false;
                tracing::info!("Tensor_parallel_degree = 1. Set sequence_parallel to False.");
            }
        }
        Ok(())
    }

    /// LoRA cannot run with overlapped stage-1 sharding.
    pub fn check_lora_sharding(&self) -> Result<()> {
        if self.sharding_parallel_degree > 1
            && config_has(&self.sharding_parallel_config, "enable_stage1_overlap")
        {
            bail!("Currently not support enabling sharding_stage1_overlap in lora mode.");
        }
        Ok(())
    }

    /// Load dtype: f16/bf16 only under `fp16_opt_level == "O2"`.
    pub fn load_dtype(&self) -> DType {
        if self.fp16_opt_level == "O2" {
            if self.bf16 {
                return DType::BF16;
            }
            if self.fp16 {
                return DType::F16;
            }
        }
        DType::F32
    }

    pub fn is_distributed(&self) -> bool {
        self.local_rank != -1
    }

    pub fn data_parallel_degree(&self) -> usize {
        let model_parallel =
            self.tensor_parallel_degree * self.pipeline_parallel_degree * self.sharding_parallel_degree;
        (self.world_size / model_parallel.max(1)).max(1)
    }

    /// Sequences consumed per optimiser step across all replicas.
    pub fn total_train_batch_size(&self) -> usize {
        self.per_device_train_batch_size
            * self.gradient_accumulation_steps
            * self.data_parallel_degree()
            * self.sharding_parallel_degree
    }
}

// ── KTO ─────────────────────────────────────────────────────────────────────

/// KTO objective knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KtoConfig {
    /// Temperature on the policy/reference log-ratio.
    pub beta: f64,
    pub desirable_weight: f64,
    pub undesirable_weight: f64,
    /// Train LoRA adapters instead of the full model.
    pub lora: bool,
    /// Treat reference log-probs as zero.
    pub reference_free: bool,
    /// Re-sync the reference model from the policy every N steps (`-1` = never).
    pub ref_model_update_steps: i64,
}

impl Default for KtoConfig {
    fn default() -> Self {
        Self {
            beta: 0.1,
            desirable_weight: 1.0,
            undesirable_weight: 1.0,
            lora: false,
            reference_free: false,
            ref_model_update_steps: -1,
        }
    }
}

impl KtoConfig {
    pub fn validate(&self) -> Result<()> {
        if self.beta <= 0.0 {
            bail!("KTO beta must be positive, got {}", self.beta);
        }
        if self.desirable_weight < 0.0 || self.undesirable_weight < 0.0 {
            bail!("KTO desirable/undesirable weights must be non-negative");
        }
        Ok(())
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

/// Log every field of an argument group under a banner.
pub fn print_config<T: Serialize>(args: &T, name: &str) {
    let value = match serde_json::to_value(args) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("cannot display {name} arguments: {e}");
            return;
        }
    };
    tracing::info!("{:=^60}", format!(" {name} Configuration Arguments "));
    if let serde_json::Value::Object(map) = value {
        let mut keys: Vec<_> = map.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let shown = match &map[&key] {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            tracing::info!("{key:<30}: {shown}");
        }
    }
    tracing::info!("");
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_parallel_requires_cache_clearing() {
        let mut args = TrainingArgs {
            pipeline_parallel_degree: 2,
            ..Default::default()
        };
        assert!(args.check_parallel_flags().is_err());

        args.pipeline_parallel_config = "enable_clear_every_step_cache".into();
        assert!(args.check_parallel_flags().is_ok());
    }

    #[test]
    fn sequence_parallel_with_pipeline_requires_send_recv_flag() {
        let mut args = TrainingArgs {
            pipeline_parallel_degree: 2,
            tensor_parallel_degree: 2,
            sequence_parallel: true,
            pipeline_parallel_config: "enable_clear_every_step_cache".into(),
            ..Default::default()
        };
        assert!(args.check_parallel_flags().is_err());

        args.pipeline_parallel_config =
            "enable_clear_every_step_cache disable_partial_send_recv".into();
        args.check_parallel_flags().unwrap();
        assert!(args.sequence_parallel);
    }

    #[test]
    fn sequence_parallel_disabled_without_tensor_parallel() {
        let mut args = TrainingArgs {
            sequence_parallel: true,
            ..Default::default()
        };
        args.check_parallel_flags().unwrap();
        assert!(!args.sequence_parallel);
    }

    #[test]
    fn lora_rejects_stage1_overlap() {
        let mut args = TrainingArgs {
            sharding_parallel_degree: 2,
            sharding_parallel_config: "split_param,enable_stage1_overlap".into(),
            ..Default::default()
        };
        assert!(args.check_lora_sharding().is_err());
        args.sharding_parallel_degree = 1;
        assert!(args.check_lora_sharding().is_ok());
    }

    #[test]
    fn load_dtype_needs_o2() {
        let mut args = TrainingArgs {
            bf16: true,
            ..Default::default()
        };
        assert_eq!(args.load_dtype(), DType::F32);
        args.fp16_opt_level = "O2".into();
        assert_eq!(args.load_dtype(), DType::BF16);
        args.bf16 = false;
        args.fp16 = true;
        assert_eq!(args.load_dtype(), DType::F16);
    }

    #[test]
    fn lora_alpha_resolution() {
        let mut m = ModelArgs {
            lora_rank: 16,
            ..Default::default()
        };
        m.resolve_lora_hyperparams();
        assert_eq!(m.lora_alpha, 32.0);

        let mut m = ModelArgs {
            rslora: true,
            ..Default::default()
        };
        m.resolve_lora_hyperparams();
        assert_eq!(m.lora_alpha, 4.0);

        let mut m = ModelArgs {
            rslora_plus: true,
            lora_alpha: 64.0,
            ..Default::default()
        };
        m.resolve_lora_hyperparams();
        assert!(m.rslora);
        assert_eq!(m.lora_plus_scale, 4.0);
        assert_eq!(m.lora_alpha, 4.0);
    }

    #[test]
    fn kto_config_validation() {
        assert!(KtoConfig::default().validate().is_ok());
        let bad = KtoConfig {
            beta: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn data_args_prompt_budget() {
        let bad = DataArgs {
            max_seq_len: 128,
            max_prompt_len: 128,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(DataArgs::default().validate().is_ok());
    }

    #[test]
    fn total_batch_counts_replicas() {
        let args = TrainingArgs {
            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 4,
            world_size: 8,
            tensor_parallel_degree: 2,
            ..Default::default()
        };
        assert_eq!(args.data_parallel_degree(), 4);
        assert_eq!(args.total_train_batch_size(), 32);
    }
}
