//! # kto-core: Causal LM and Adapters
//!
//! The model side of a KTO run:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`norm`] | `RmsNorm` |
//! | [`linear`] | `ProjLinear` with optional LoRA, `LayerBuilder` |
//! | [`attention`] | GQA self-attention, RoPE, dense / end-row masks |
//! | [`mlp`] | SwiGLU feed-forward |
//! | [`model`] | `CausalLm` (LLaMA / Qwen2 / Mistral), safetensors IO |
//! | [`lora`] | `LoraConfig`, `LoraModel`, adapter persistence |
//! | [`quantize`] | weight-only int8 / int4 quantise-dequantise |
//!
//! The same `CausalLm::forward` serves policy and reference: pass
//! `adapters = false` to run the frozen base under a LoRA policy.

pub mod attention;
pub mod linear;
pub mod lora;
pub mod mlp;
pub mod model;
pub mod norm;
pub mod quantize;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use linear::{LayerBuilder, ParamCount};
pub use lora::{print_trainable_parameters, LoraConfig, LoraModel};
pub use model::{
    build_frozen, build_full, build_lora, check_flash_mask, copy_varmap, save_pretrained,
    CausalLm, WeightInit,
};
pub use quantize::WeightQuantizeAlgo;
