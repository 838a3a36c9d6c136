//! Merge a JSON argument file with typed `--key value` overrides.
//!
//! Every argument group deserialises from one flat JSON map. The command
//! line mirrors each group as a `clap::Args` struct of `Option`s; the values
//! actually given on the command line are laid over the JSON-loaded groups.
//! Boolean keys accept a bare `--flag` as `true`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::builder::RangedU64ValueParser;
use clap::Args;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::args::{DataArgs, IntervalStrategy, KtoConfig, ModelArgs, SchedulerType, TrainingArgs};

/// All four argument groups of a run.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub model: ModelArgs,
    pub data: DataArgs,
    pub training: TrainingArgs,
    pub kto: KtoConfig,
}

impl RunArgs {
    /// Parse from an optional JSON file, then apply command-line overrides.
    pub fn parse(json_file: Option<&Path>, overrides: RunOverrides) -> Result<Self> {
        let map = match json_file {
            Some(path) => {
                let map = read_json_args(path)?;
                let schema = schema()?;
                if let Some(key) = map.keys().find(|k| !schema.contains_key(*k)) {
                    bail!("unknown argument `{key}` in {}", path.display());
                }
                map
            }
            None => Map::new(),
        };
        let mut run = Self::from_map(map)?;
        overrides.apply(&mut run);
        Ok(run)
    }

    /// Deserialise every group from one merged map.
    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        let value = Value::Object(map);
        let model: ModelArgs =
            serde_json::from_value(value.clone()).context("invalid model arguments")?;
        let data: DataArgs =
            serde_json::from_value(value.clone()).context("invalid data arguments")?;
        let training: TrainingArgs =
            serde_json::from_value(value.clone()).context("invalid training arguments")?;
        let kto: KtoConfig = serde_json::from_value(value).context("invalid KTO arguments")?;
        Ok(Self {
            model,
            data,
            training,
            kto,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.data.validate()?;
        self.training.validate()?;
        self.kto.validate()
    }
}

fn read_json_args(path: &Path) -> Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read argument file {}", path.display()))?;
    match serde_json::from_str::<Value>(&text)
        .with_context(|| format!("parse argument file {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        _ => bail!("argument file {} must hold a JSON object", path.display()),
    }
}

fn defaults_of<T: Serialize + Default>() -> Result<Map<String, Value>> {
    match serde_json::to_value(T::default())? {
        Value::Object(map) => Ok(map),
        _ => bail!("argument group does not serialise to an object"),
    }
}

/// Every key a JSON argument file may carry, with its default.
pub fn schema() -> Result<Map<String, Value>> {
    let mut schema = defaults_of::<ModelArgs>()?;
    schema.extend(defaults_of::<DataArgs>()?);
    schema.extend(defaults_of::<TrainingArgs>()?);
    schema.extend(defaults_of::<KtoConfig>()?);
    Ok(schema)
}

// ── Command-line overrides ──────────────────────────────────────────────────

/// `field = value` for every override that was given.
macro_rules! merge {
    ($src:expr => $dst:expr; optional $($field:ident),* $(,)?) => {
        $(if let Some(v) = $src.$field { $dst.$field = Some(v); })*
    };
    ($src:expr => $dst:expr; $($field:ident),* $(,)?) => {
        $(if let Some(v) = $src.$field { $dst.$field = v; })*
    };
}

fn positive() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::<usize>::new().range(1..)
}

/// Command-line overrides for all four groups.
#[derive(Args, Debug, Clone, Default)]
pub struct RunOverrides {
    #[command(flatten)]
    pub model: ModelOverrides,
    #[command(flatten)]
    pub data: DataOverrides,
    #[command(flatten)]
    pub training: TrainingOverrides,
    #[command(flatten)]
    pub kto: KtoOverrides,
}

impl RunOverrides {
    pub fn apply(self, run: &mut RunArgs) {
        self.model.apply(&mut run.model);
        self.data.apply(&mut run.data);
        self.training.apply(&mut run.training);
        self.kto.apply(&mut run.kto);
    }
}

#[derive(Args, Debug, Clone, Default)]
#[command(rename_all = "snake_case", next_help_heading = "Model")]
pub struct ModelOverrides {
    /// Directory holding `config.json`, safetensors weights and `tokenizer.json`.
    #[arg(long)]
    pub model_name_or_path: Option<String>,
    #[arg(long)]
    pub tokenizer_name_or_path: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub use_flash_attention: Option<bool>,
    /// End-row attention masking over zero-padded sequences.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub flash_mask: Option<bool>,
    #[arg(long, value_parser = ["weight_only_int8", "weight_only_int4"])]
    pub weight_quantize_algo: Option<String>,
    #[arg(long)]
    pub lora_path: Option<String>,
    #[arg(long, value_parser = positive())]
    pub lora_rank: Option<usize>,
    /// `-1` resolves from `lora_rank`.
    #[arg(long)]
    pub lora_alpha: Option<f64>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub rslora: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub rslora_plus: Option<bool>,
    #[arg(long)]
    pub lora_plus_scale: Option<f64>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub use_quick_lora: Option<bool>,
}

impl ModelOverrides {
    pub fn apply(self, args: &mut ModelArgs) {
        merge!(self => args;
            model_name_or_path, use_flash_attention, flash_mask, lora_rank, lora_alpha,
            rslora, rslora_plus, lora_plus_scale, use_quick_lora,
        );
        merge!(self => args; optional tokenizer_name_or_path, weight_quantize_algo, lora_path);
    }
}

#[derive(Args, Debug, Clone, Default)]
#[command(rename_all = "snake_case", next_help_heading = "Data")]
pub struct DataOverrides {
    #[arg(long)]
    pub train_dataset_path: Option<PathBuf>,
    #[arg(long)]
    pub dev_dataset_path: Option<PathBuf>,
    #[arg(long, value_parser = positive())]
    pub max_seq_len: Option<usize>,
    #[arg(long, value_parser = positive())]
    pub max_prompt_len: Option<usize>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub greedy_zero_padding: Option<bool>,
}

impl DataOverrides {
    pub fn apply(self, args: &mut DataArgs) {
        merge!(self => args;
            train_dataset_path, dev_dataset_path, max_seq_len, max_prompt_len,
            greedy_zero_padding,
        );
    }
}

#[derive(Args, Debug, Clone, Default)]
#[command(rename_all = "snake_case", next_help_heading = "Training")]
pub struct TrainingOverrides {
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub overwrite_output_dir: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub do_train: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub do_eval: Option<bool>,
    /// Checkpoint directory to continue from. Restores weights and the step
    /// counter; AdamW moments start again from zero.
    #[arg(long)]
    pub resume_from_checkpoint: Option<String>,

    #[arg(long, value_parser = positive())]
    pub per_device_train_batch_size: Option<usize>,
    #[arg(long, value_parser = positive())]
    pub per_device_eval_batch_size: Option<usize>,
    #[arg(long, value_parser = positive())]
    pub gradient_accumulation_steps: Option<usize>,
    #[arg(long)]
    pub num_train_epochs: Option<f64>,
    /// `-1` derives the step budget from `num_train_epochs`.
    #[arg(long)]
    pub max_steps: Option<i64>,

    #[arg(long)]
    pub learning_rate: Option<f64>,
    #[arg(long)]
    pub min_lr: Option<f64>,
    #[arg(long, value_enum)]
    pub lr_scheduler_type: Option<SchedulerType>,
    #[arg(long)]
    pub warmup_steps: Option<usize>,
    #[arg(long)]
    pub warmup_ratio: Option<f64>,
    #[arg(long)]
    pub weight_decay: Option<f64>,
    #[arg(long)]
    pub adam_beta1: Option<f64>,
    #[arg(long)]
    pub adam_beta2: Option<f64>,
    #[arg(long)]
    pub adam_epsilon: Option<f64>,
    #[arg(long)]
    pub max_grad_norm: Option<f64>,

    #[arg(long)]
    pub logging_steps: Option<usize>,
    #[arg(long, value_enum)]
    pub evaluation_strategy: Option<IntervalStrategy>,
    #[arg(long)]
    pub eval_steps: Option<usize>,
    #[arg(long, value_enum)]
    pub save_strategy: Option<IntervalStrategy>,
    #[arg(long)]
    pub save_steps: Option<usize>,
    /// Number of `checkpoint-*` directories to keep; `0` keeps all.
    #[arg(long)]
    pub save_total_limit: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,
    /// `cpu`, `gpu`, `gpu:<id>` or `cuda:<id>`.
    #[arg(long)]
    pub device: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub fp16: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub bf16: Option<bool>,
    #[arg(long, value_parser = ["O1", "O2"])]
    pub fp16_opt_level: Option<String>,

    #[arg(long, value_parser = positive())]
    pub tensor_parallel_degree: Option<usize>,
    #[arg(long, value_parser = positive())]
    pub pipeline_parallel_degree: Option<usize>,
    #[arg(long, value_parser = positive())]
    pub sharding_parallel_degree: Option<usize>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub sequence_parallel: Option<bool>,
    #[arg(long)]
    pub pipeline_parallel_config: Option<String>,
    #[arg(long)]
    pub sharding_parallel_config: Option<String>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub benchmark: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub autotuner_benchmark: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub dataloader_shuffle: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub disable_tqdm: Option<bool>,
}

impl TrainingOverrides {
    pub fn apply(self, args: &mut TrainingArgs) {
        merge!(self => args;
            output_dir, overwrite_output_dir, do_train, do_eval,
            per_device_train_batch_size, per_device_eval_batch_size,
            gradient_accumulation_steps, num_train_epochs, max_steps,
            learning_rate, min_lr, lr_scheduler_type, warmup_steps, warmup_ratio,
            weight_decay, adam_beta1, adam_beta2, adam_epsilon, max_grad_norm,
            logging_steps, evaluation_strategy, eval_steps, save_strategy, save_steps,
            save_total_limit, seed, device, fp16, bf16, fp16_opt_level,
            tensor_parallel_degree, pipeline_parallel_degree, sharding_parallel_degree,
            sequence_parallel, pipeline_parallel_config, sharding_parallel_config,
            benchmark, autotuner_benchmark, dataloader_shuffle, disable_tqdm,
        );
        merge!(self => args; optional resume_from_checkpoint);
    }
}

#[derive(Args, Debug, Clone, Default)]
#[command(rename_all = "snake_case", next_help_heading = "KTO")]
pub struct KtoOverrides {
    #[arg(long)]
    pub beta: Option<f64>,
    #[arg(long)]
    pub desirable_weight: Option<f64>,
    #[arg(long)]
    pub undesirable_weight: Option<f64>,
    /// Train LoRA adapters instead of the full model.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub lora: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub reference_free: Option<bool>,
    /// Re-sync the reference model every N steps; `-1` never does.
    #[arg(long)]
    pub ref_model_update_steps: Option<i64>,
}

impl KtoOverrides {
    pub fn apply(self, args: &mut KtoConfig) {
        merge!(self => args;
            beta, desirable_weight, undesirable_weight, lora, reference_free,
            ref_model_update_steps,
        );
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
