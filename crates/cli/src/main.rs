//! `run-kto`: KTO preference fine-tuning, full-parameter or LoRA.
//!
//! ```text
//! run-kto [config.json] [--key value | --key=value | --flag ...]
//! ```
//!
//! A leading `*.json` argument supplies every argument group at once; any
//! `--key` given on the command line overrides the file. `run-kto --help`
//! lists every key.
//!
//! Resuming (`--resume_from_checkpoint`, or a checkpoint found in
//! `--output_dir`) restores the trainable weights, the global step and the
//! log history. AdamW moments and its internal step count are not saved, so
//! the optimiser restarts cold and the loss curve after a resume differs from
//! an uninterrupted run.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::Parser;

use kto_common::{
    attach_kl_responses, load_preference_jsonl, preprocess_dataset, print_config, DataArgs,
    MaskLayout, ModelConfig, PreferenceTokenizer, RunArgs, RunOverrides, TextEncoder,
    ZeroPaddingDataset,
};
use kto_core::{
    build_frozen, build_full, build_lora, check_flash_mask, copy_varmap,
    print_trainable_parameters, LoraConfig, LoraModel, WeightInit, WeightQuantizeAlgo,
};
use kto_train::{
    calculate_effective_tokens, get_last_checkpoint, log_metrics, save_metrics, KtoTrainer,
    PolicyWeights, Reference, TrainerConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "run-kto",
    about = "KTO preference fine-tuning with optional LoRA",
    allow_negative_numbers = true,
    args_override_self = true
)]
struct Cli {
    /// `*.json` file holding any of the arguments below.
    config: Option<PathBuf>,
    #[command(flatten)]
    overrides: RunOverrides,
}

impl Cli {
    fn into_run_args(self) -> Result<RunArgs> {
        if let Some(path) = &self.config {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                bail!("argument file {} must end in .json", path.display());
            }
        }
        RunArgs::parse(self.config.as_deref(), self.overrides)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let run = Cli::parse().into_run_args()?;
    run_kto(run)
}

/// `cpu`, `gpu`, `gpu:<id>`, `cuda:<id>`; GPUs fall back to CPU when absent.
fn select_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().to_ascii_lowercase();
    let (kind, ordinal) = match spec.split_once(':') {
        Some((kind, id)) => (
            kind.to_string(),
            id.parse::<usize>()
                .with_context(|| format!("invalid device ordinal in `{spec}`"))?,
        ),
        None => (spec.clone(), 0),
    };
    match kind.as_str() {
        "cpu" => Ok(Device::Cpu),
        "gpu" | "cuda" => Ok(Device::cuda_if_available(ordinal)?),
        other => bail!("unsupported device `{other}` (expected cpu, gpu or cuda)"),
    }
}

fn run_kto(mut run: RunArgs) -> Result<()> {
    run.validate()?;
    run.training.read_environment();
    let RunArgs {
        model: mut model_args,
        data: data_args,
        training: mut training_args,
        kto: kto_config,
    } = run;

    let device = select_device(&training_args.device)?;
    if let Err(e) = device.set_seed(training_args.seed) {
        tracing::debug!("device RNG not seeded: {e}");
    }
    training_args.check_parallel_flags()?;
    print_config(&model_args, "Model");
    print_config(&data_args, "Data");
    print_config(&kto_config, "KTOConfig");
    print_config(&training_args, "Training");

    tracing::warn!(
        "Process rank: {}, device: {:?}, world_size: {}, distributed training: {}, 16-bits training: {}",
        training_args.local_rank,
        device,
        training_args.world_size,
        training_args.is_distributed(),
        training_args.fp16 || training_args.bf16
    );

    let mut last_checkpoint = None;
    if training_args.output_dir.is_dir()
        && training_args.do_train
        && !training_args.overwrite_output_dir
    {
        last_checkpoint = get_last_checkpoint(&training_args.output_dir)?;
        if let (Some(ckpt), None) = (&last_checkpoint, &training_args.resume_from_checkpoint) {
            tracing::info!(
                "Checkpoint detected, resuming training at {}. To avoid this behavior, change \
                 the `--output_dir` or add `--overwrite_output_dir` to train from scratch.",
                ckpt.display()
            );
        }
    }
    let resume = training_args
        .resume_from_checkpoint
        .as_ref()
        .map(PathBuf::from)
        .or(last_checkpoint);

    let dtype = training_args.load_dtype();

    // ── Model ───────────────────────────────────────────────────────────────
    tracing::info!("Start to load model & tokenizer.");
    let model_dir = PathBuf::from(&model_args.model_name_or_path);
    let model_config = ModelConfig::from_pretrained(&model_dir)?;
    if data_args.max_seq_len > model_config.max_position_embeddings {
        bail!(
            "max_seq_len ({}) exceeds max_position_embeddings ({})",
            data_args.max_seq_len,
            model_config.max_position_embeddings
        );
    }
    if model_args.flash_mask && !model_args.use_flash_attention {
        tracing::warn!("`flash_mask` must use with zero padding and flash attention.");
        model_args.use_flash_attention = true;
    }
    tracing::info!(
        use_flash_attention = model_args.use_flash_attention,
        tensor_parallel_degree = training_args.tensor_parallel_degree,
        sequence_parallel = training_args.sequence_parallel,
        "model runtime settings"
    );
    let kind = model_config.kind()?;

    let init = if !training_args.autotuner_benchmark || model_args.weight_quantize_algo.is_some() {
        WeightInit::Pretrained(model_dir.clone())
    } else {
        WeightInit::Random
    };
    let quantize = model_args
        .weight_quantize_algo
        .as_deref()
        .map(str::parse::<WeightQuantizeAlgo>)
        .transpose()?;
    if quantize.is_some() && !kto_config.lora {
        tracing::warn!("weight_quantize_algo only applies to frozen LoRA base weights; ignored");
    }

    let (policy, weights, reference) = if kto_config.lora {
        training_args.check_lora_sharding()?;
        let mut lora = match &model_args.lora_path {
            None => {
                model_args.resolve_lora_hyperparams();
                LoraModel::new(LoraConfig::from_model_args(
                    &model_args,
                    kind,
                    dtype,
                    training_args.tensor_parallel_degree,
                ))
            }
            Some(path) => LoraModel::from_pretrained(Path::new(path))?,
        };
        let policy = build_lora(&model_config, &init, dtype, &device, &lora, quantize)?;
        if let Some(path) = &model_args.lora_path {
            lora.load_weights(Path::new(path))?;
        }
        (policy, PolicyWeights::Lora(lora), Reference::AdapterBypass)
    } else {
        let (policy, policy_vars) = build_full(&model_config, &init, dtype, &device)?;
        let reference = if kto_config.reference_free {
            Reference::Free
        } else {
            let (model, varmap) = build_frozen(&model_config, dtype, &device)?;
            if matches!(init, WeightInit::Pretrained(_)) {
                copy_varmap(&policy_vars, &varmap)?;
            }
            Reference::Model { model, varmap }
        };
        (policy, PolicyWeights::Full(policy_vars), reference)
    };
    check_flash_mask(&policy, model_args.flash_mask)?;

    let tokenizer_path = model_args
        .tokenizer_name_or_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| model_dir.clone());
    let tokenizer = PreferenceTokenizer::from_pretrained(
        &tokenizer_path,
        model_config.eos_token_id,
        model_config.bos_token_id,
        model_config.pad_token_id,
    )?;
    if tokenizer.vocab_size() > model_config.vocab_size {
        tracing::warn!(
            tokenizer = tokenizer.vocab_size(),
            model = model_config.vocab_size,
            "tokenizer vocabulary is larger than the embedding table"
        );
    }
    tracing::info!("Loading model & tokenizer successfully !");

    if kto_config.lora {
        let count = policy.parameter_count();
        print_trainable_parameters(count.frozen, count.trainable);
    }

    // ── Data ────────────────────────────────────────────────────────────────
    tracing::info!("Start to create dataset");
    let train_ds = if training_args.do_train {
        Some(build_dataset(
            "train",
            &data_args.train_dataset_path,
            &tokenizer,
            &data_args,
            data_args.greedy_zero_padding,
        )?)
    } else {
        None
    };
    let eval_ds = if training_args.do_eval {
        Some(build_dataset(
            "dev",
            &data_args.dev_dataset_path,
            &tokenizer,
            &data_args,
            false,
        )?)
    } else {
        None
    };
    tracing::info!("Creating dataset successfully ...");

    // ── Train / evaluate ────────────────────────────────────────────────────
    let trainer_config = TrainerConfig {
        args: training_args.clone(),
        kto: kto_config.clone(),
        mask_layout: if model_args.flash_mask {
            MaskLayout::EndRows
        } else {
            MaskLayout::Dense
        },
        max_seq_len: data_args.max_seq_len,
        pad_token_id: tokenizer.pad_token_id(),
        tokenizer_file: Some(tokenizer.source().to_path_buf()),
    };
    let mut trainer = KtoTrainer::new(policy, weights, reference, trainer_config, device)?;

    if let Some(train_ds) = &train_ds {
        let result = trainer.train(train_ds, eval_ds.as_ref(), resume.as_deref())?;

        if !training_args.autotuner_benchmark && !training_args.benchmark {
            trainer.save_model(None)?;
            log_metrics("train", &result.metrics);
            save_metrics(&training_args.output_dir, "train", &result.metrics)?;
            trainer.save_state()?;
        }
        if training_args.benchmark {
            let (effective_tokens, total_tokens) = calculate_effective_tokens(
                &training_args,
                train_ds,
                trainer.state().max_steps,
                data_args.max_seq_len,
            );
            let runtime = result
                .metrics
                .get("train_runtime")
                .copied()
                .unwrap_or_default()
                .max(f64::EPSILON);
            let effective_ratio = if total_tokens > 0 {
                100.0 * effective_tokens as f64 / total_tokens as f64
            } else {
                0.0
            };
            let now = || chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            tracing::info!("[timelog] Effective ratio: {effective_ratio:.2} % ({}) ", now());
            tracing::info!(
                "[timelog] Effective tokens per second: {:.2} token/s ({}) ",
                effective_tokens as f64 / runtime,
                now()
            );
            tracing::info!(
                "[timelog] Tokens per second: {:.2} token/s ({}) ",
                total_tokens as f64 / runtime,
                now()
            );
        }
    }

    if let Some(eval_ds) = &eval_ds {
        let metrics = trainer.evaluate(eval_ds)?;
        log_metrics("eval", &metrics);
        save_metrics(&training_args.output_dir, "eval", &metrics)?;
    }
    Ok(())
}

/// JSONL → KL pairing → tokenisation → zero-padding packing.
fn build_dataset(
    split: &str,
    path: &Path,
    tokenizer: &dyn TextEncoder,
    data_args: &DataArgs,
    greedy: bool,
) -> Result<ZeroPaddingDataset> {
    let mut examples = load_preference_jsonl(path)?;
    attach_kl_responses(&mut examples);
    tracing::info!("Creating {split} Zero Padding Data Stream. This may take a few minutes.");
    let tokenized = preprocess_dataset(&examples, tokenizer, data_args)?;
    let dataset = ZeroPaddingDataset::new(tokenized, data_args.max_seq_len, greedy);
    if dataset.is_empty() {
        bail!("{split} dataset {} has no usable examples", path.display());
    }
    tracing::info!(
        examples = dataset.num_examples(),
        sequences = dataset.len(),
        tokens = dataset.num_tokens(),
        "{split} dataset packed"
    );
    Ok(dataset)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use kto_core::save_pretrained;

    const WORDS: &[&str] = &[
        "what", "is", "the", "sky", "grass", "color", "blue", "green", "red", "yes", "no", "maybe",
    ];

    /// Word-level `tokenizer.json` over [`WORDS`] plus special tokens.
    fn tokenizer_json() -> String {
        let mut vocab = serde_json::Map::new();
        for (i, tok) in ["<pad>", "<s>", "</s>", "<unk>"].iter().chain(WORDS).enumerate() {
            vocab.insert(tok.to_string(), serde_json::json!(i));
        }
        serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "WhitespaceSplit"},
            "post_processor": null,
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
        })
        .to_string()
    }

    fn write_jsonl(path: &Path, n: usize) {
        let lines: Vec<String> = (0..n)
            .map(|i| {
                serde_json::json!({
                    "src": format!("what is the {} color", WORDS[3 + i % 2]),
                    "tgt": [],
                    "response": [format!("{} yes", WORDS[6 + i % 3])],
                    "sort": [if i % 2 == 0 { 1 } else { 0 }],
                })
                .to_string()
            })
            .collect();
        std::fs::write(path, lines.join("\n")).unwrap();
    }

    /// Tiny random checkpoint plus tokenizer and data files.
    fn fixture(root: &Path) -> PathBuf {
        let model_dir = root.join("model");
        let config = ModelConfig {
            vocab_size: 16,
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 1,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            max_position_embeddings: 64,
            ..Default::default()
        };
        let (_, varmap) = build_full(&config, &WeightInit::Random, DType::F32, &Device::Cpu).unwrap();
        save_pretrained(&varmap, &config, &model_dir).unwrap();
        std::fs::write(model_dir.join("tokenizer.json"), tokenizer_json()).unwrap();
        write_jsonl(&root.join("train.jsonl"), 6);
        write_jsonl(&root.join("dev.jsonl"), 2);
        model_dir
    }

    fn overrides(root: &Path, model_dir: &Path, extra: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = [
            "--model_name_or_path",
            &model_dir.display().to_string(),
            "--train_dataset_path",
            &root.join("train.jsonl").display().to_string(),
            "--dev_dataset_path",
            &root.join("dev.jsonl").display().to_string(),
            "--output_dir",
            &root.join("out").display().to_string(),
            "--do_train",
            "--do_eval",
            "--max_steps",
            "2",
            "--max_seq_len",
            "32",
            "--max_prompt_len",
            "8",
            "--device",
            "cpu",
            "--disable_tqdm",
            "--logging_steps",
            "1",
            "--save_steps",
            "1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(extra.iter().map(|s| s.to_string()));
        args
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn parse_run(args: &[String]) -> RunArgs {
        Cli::try_parse_from(std::iter::once("run-kto".to_string()).chain(args.iter().cloned()))
            .unwrap()
            .into_run_args()
            .unwrap()
    }

    #[test]
    fn json_file_then_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.json");
        std::fs::write(&path, r#"{"model_name_or_path": "m", "beta": 0.5}"#).unwrap();
        let run = parse_run(&strings(&[&path.display().to_string(), "--beta", "0.2"]));
        assert_eq!(run.kto.beta, 0.2);
        assert_eq!(run.model.model_name_or_path, "m");

        let run = parse_run(&strings(&["--beta", "0.3", "--max_steps", "-1"]));
        assert_eq!(run.kto.beta, 0.3);
        assert_eq!(run.training.max_steps, -1);
    }

    #[test]
    fn non_json_config_and_bad_values_are_rejected() {
        let cli = Cli::try_parse_from(["run-kto", "run.yaml"]).unwrap();
        assert!(cli.into_run_args().is_err());
        assert!(Cli::try_parse_from(["run-kto", "--lr_scheduler_type", "bogus"]).is_err());
        assert!(Cli::try_parse_from(["run-kto", "--evaluation_strategy", "sometimes"]).is_err());
    }

    #[test]
    fn repeated_key_keeps_last_value() {
        let run = parse_run(&strings(&["--max_steps", "2", "--max_steps", "3"]));
        assert_eq!(run.training.max_steps, 3);
    }

    #[test]
    fn help_warns_that_resume_restarts_optimizer() {
        use clap::CommandFactory;
        let help = Cli::command().render_long_help().to_string();
        let line = help
            .lines()
            .skip_while(|l| !l.contains("--resume_from_checkpoint"))
            .take(4)
            .flat_map(str::split_whitespace)
            .collect::<Vec<_>>()
            .join(" ");
        assert!(line.contains("AdamW moments start again from zero"), "{line}");
    }

    #[test]
    fn device_specs() {
        assert!(matches!(select_device("cpu").unwrap(), Device::Cpu));
        assert!(select_device("tpu").is_err());
        assert!(select_device("gpu:x").is_err());
    }

    #[test]
    fn full_run_writes_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let model_dir = fixture(tmp.path());
        let run = parse_run(&overrides(tmp.path(), &model_dir, &["--flash_mask"]));
        run_kto(run).unwrap();

        let out = tmp.path().join("out");
        for file in [
            "model.safetensors",
            "config.json",
            "tokenizer.json",
            "train_results.json",
            "eval_results.json",
            "all_results.json",
            "trainer_state.json",
        ] {
            assert!(out.join(file).is_file(), "missing {file}");
        }
        assert!(out.join("checkpoint-2").is_dir());
    }

    #[test]
    fn lora_run_saves_adapters_and_resumes() {
        let tmp = tempfile::tempdir().unwrap();
        let model_dir = fixture(tmp.path());
        let args = overrides(tmp.path(), &model_dir, &["--lora", "--lora_rank", "2"]);
        run_kto(parse_run(&args)).unwrap();

        let out = tmp.path().join("out");
        assert!(out.join("lora_config.json").is_file());
        assert!(out.join("lora_model_state.safetensors").is_file());
        let saved = LoraConfig::from_pretrained(&out).unwrap();
        assert_eq!(saved.r, 2);
        assert_eq!(saved.lora_alpha, 4.0);

        // A second run with a larger budget picks up checkpoint-2.
        let mut args = args;
        args.extend(["--max_steps".to_string(), "3".to_string()]);
        run_kto(parse_run(&args)).unwrap();
        let state = kto_train::TrainerState::load(&out.join("trainer_state.json")).unwrap();
        assert_eq!(state.global_step, 3);
    }

    #[test]
    fn flash_mask_rejected_for_mistral() {
        let tmp = tempfile::tempdir().unwrap();
        let model_dir = fixture(tmp.path());
        let mut config = ModelConfig::from_pretrained(&model_dir).unwrap();
        config.model_type = "mistral".into();
        config.architectures = vec!["MistralForCausalLM".into()];
        config.save(&model_dir.join("config.json")).unwrap();
        let run = parse_run(&overrides(tmp.path(), &model_dir, &["--flash_mask"]));
        let err = run_kto(run).unwrap_err().to_string();
        assert!(err.contains("not support flash mask"), "{err}");
    }

    #[test]
    fn max_seq_len_beyond_positions_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let model_dir = fixture(tmp.path());
        let run = parse_run(&overrides(tmp.path(), &model_dir, &["--max_seq_len", "128"]));
        assert!(run_kto(run).is_err());
    }
}
