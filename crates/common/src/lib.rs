//! # kto-common: Arguments, Config and Data
//!
//! Everything a KTO run needs before a model exists:
//!
//! * **[`RunArgs`]**: the four argument groups, loaded from JSON with typed CLI overrides.
//! * **[`ModelConfig`]**: LLaMA / Qwen2 / Mistral hyper-parameters (`config.json`).
//! * **[`PreferenceExample`]** → **[`TokenizedExample`]**: JSONL loading, KL pairing, layout.
//! * **[`ZeroPaddingDataset`]**: packing several examples per sequence.
//! * **[`collate`]**: packed sequences → Candle tensors.

pub mod argparse;
pub mod args;
pub mod collate;
pub mod config;
pub mod data;
pub mod packing;

pub use argparse::{RunArgs, RunOverrides};
pub use args::{
    print_config, DataArgs, IntervalStrategy, KtoConfig, ModelArgs, SchedulerType, TrainingArgs,
};
pub use collate::{collate, BatchMask, MaskLayout, PreferenceBatch, MASKED_BIAS};
pub use config::{ModelConfig, ModelKind};
pub use data::{
    attach_kl_responses, load_preference_jsonl, preprocess_dataset, PreferenceExample,
    PreferenceTokenizer, TextEncoder, TokenizedExample,
};
pub use packing::{ExampleSpans, PackedSequence, ZeroPaddingDataset};
