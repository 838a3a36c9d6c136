//! Causal LM configuration, read from a model directory's `config.json`.
//!
//! Field names follow the Hugging Face LLaMA / Qwen2 / Mistral configs so
//! published checkpoints load as-is. Unknown fields are ignored; missing
//! optional fields fall back to their `#[serde(default)]` values.

use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Llama,
    Qwen2,
    Mistral,
}

impl ModelKind {
    /// Families whose attention accepts start-row ("flash mask") masking.
    pub fn supports_flash_mask(self) -> bool {
        matches!(self, Self::Llama | Self::Qwen2)
    }

    /// Class name used in logs and errors.
    pub fn class_name(self) -> &'static str {
        match self {
            Self::Llama => "LlamaForCausalLM",
            Self::Qwen2 => "Qwen2ForCausalLM",
            Self::Mistral => "MistralForCausalLM",
        }
    }

    /// Projections that receive LoRA adapters.
    pub fn lora_target_modules(self) -> &'static [&'static str] {
        &[
            "q_proj",
            "k_proj",
            "v_proj",
            "o_proj",
            "gate_proj",
            "up_proj",
            "down_proj",
        ]
    }
}

/// Decoder-only transformer hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_type: String,
    #[serde(default)]
    pub architectures: Vec<String>,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    /// Grouped-query attention; defaults to `num_attention_heads`.
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Bias on q/k/v projections (always on for Qwen2).
    #[serde(default)]
    pub attention_bias: bool,
    /// Mistral sliding attention window.
    #[serde(default)]
    pub sliding_window: Option<usize>,
    #[serde(default, deserialize_with = "first_token_id")]
    pub bos_token_id: Option<u32>,
    #[serde(default, deserialize_with = "first_token_id")]
    pub eos_token_id: Option<u32>,
    #[serde(default, deserialize_with = "first_token_id")]
    pub pad_token_id: Option<u32>,
}

fn default_max_position_embeddings() -> usize {
    4096
}
fn default_rms_norm_eps() -> f64 {
    1e-6
}
fn default_rope_theta() -> f64 {
    10_000.0
}

/// Token ids may be a single id, a list (first wins) or null.
fn first_token_id<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(u32),
        Many(Vec<u32>),
    }
    let value = Option::<OneOrMany>::deserialize(deserializer)?;
    Ok(match value {
        Some(OneOrMany::One(id)) => Some(id),
        Some(OneOrMany::Many(ids)) => ids.first().copied(),
        None => None,
    })
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: "llama".to_string(),
            architectures: vec!["LlamaForCausalLM".to_string()],
            vocab_size: 32000,
            hidden_size: 256,
            intermediate_size: 688,
            num_hidden_layers: 4,
            num_attention_heads: 8,
            num_key_value_heads: None,
            max_position_embeddings: 4096,
            rms_norm_eps: 1e-6,
            rope_theta: 10_000.0,
            tie_word_embeddings: false,
            attention_bias: false,
            sliding_window: None,
            bos_token_id: Some(1),
            eos_token_id: Some(2),
            pad_token_id: None,
        }
    }
}

impl ModelConfig {
    /// Load from a model directory (reads `config.json`) or a JSON file.
    pub fn from_pretrained(path: &Path) -> anyhow::Result<Self> {
        let file = if path.is_dir() {
            path.join("config.json")
        } else {
            path.to_path_buf()
        };
        let json = std::fs::read_to_string(&file)
            .with_context(|| format!("read model config {}", file.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("parse model config {}", file.display()))?;
        config.kind()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Resolve the model family from `model_type`, then `architectures`.
    pub fn kind(&self) -> anyhow::Result<ModelKind> {
        let by_type = match self.model_type.to_ascii_lowercase().as_str() {
            "llama" => Some(ModelKind::Llama),
            "qwen2" => Some(ModelKind::Qwen2),
            "mistral" => Some(ModelKind::Mistral),
            _ => None,
        };
        if let Some(kind) = by_type {
            return Ok(kind);
        }
        for arch in &self.architectures {
            match arch.as_str() {
                "LlamaForCausalLM" => return Ok(ModelKind::Llama),
                "Qwen2ForCausalLM" => return Ok(ModelKind::Qwen2),
                "MistralForCausalLM" => return Ok(ModelKind::Mistral),
                _ => {}
            }
        }
        bail!(
            "unsupported model (model_type `{}`, architectures {:?})",
            self.model_type,
            self.architectures
        )
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Head dimension (`hidden_size / num_attention_heads`).
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// q/k/v bias: Qwen2 always, others when `attention_bias` is set.
    pub fn qkv_bias(&self) -> bool {
        self.attention_bias || matches!(self.kind(), Ok(ModelKind::Qwen2))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            bail!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size,
                self.num_attention_heads
            );
        }
        let kv = self.num_kv_heads();
        if kv == 0 || self.num_attention_heads % kv != 0 {
            bail!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({kv})",
                self.num_attention_heads
            );
        }
        if self.head_dim() % 2 != 0 {
            bail!("head_dim ({}) must be even for rotary embeddings", self.head_dim());
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
