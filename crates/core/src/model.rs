//! Decoder-only causal LM for the LLaMA family (LLaMA, Qwen2, Mistral).
//!
//! Parameter names follow the Hugging Face layout so published
//! `model.safetensors` checkpoints load directly:
//!
//! ```text
//! model.embed_tokens.weight
//! model.layers.{i}.self_attn.{q,k,v,o}_proj.{weight,bias}
//! model.layers.{i}.mlp.{gate,up,down}_proj.weight
//! model.layers.{i}.{input,post_attention}_layernorm.weight
//! model.norm.weight
//! lm_head.weight            (absent with tied embeddings)
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Embedding, VarBuilder, VarMap};
use serde::Deserialize;

use kto_common::{BatchMask, ModelConfig, ModelKind};

use crate::attention::{attention_bias, Attention, RotaryEmbedding};
use crate::linear::{matmul_last, LayerBuilder, ParamCount, ProjLinear};
use crate::lora::LoraModel;
use crate::mlp::Mlp;
use crate::norm::RmsNorm;
use crate::quantize::WeightQuantizeAlgo;

pub const MODEL_WEIGHTS_NAME: &str = "model.safetensors";
pub const MODEL_WEIGHTS_INDEX_NAME: &str = "model.safetensors.index.json";
pub const CONFIG_NAME: &str = "config.json";

// ── Decoder Layer ───────────────────────────────────────────────────────────

/// Pre-norm → attention → residual → pre-norm → MLP → residual.
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(config: &ModelConfig, lb: &LayerBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(config, &lb.pp("self_attn"))?,
            mlp: Mlp::new(config, &lb.pp("mlp"))?,
            input_layernorm: lb.rms_norm(config.hidden_size, config.rms_norm_eps, "input_layernorm")?,
            post_attention_layernorm: lb.rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                "post_attention_layernorm",
            )?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        bias: &Tensor,
        adapters: bool,
    ) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let h = self.self_attn.forward(&h, cos, sin, bias, adapters)?;
        let x = (residual + h)?;

        let residual = &x;
        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h, adapters)?;
        residual + h
    }

    fn detached(&self) -> Self {
        Self {
            self_attn: self.self_attn.detached(),
            mlp: self.mlp.detached(),
            input_layernorm: self.input_layernorm.frozen(),
            post_attention_layernorm: self.post_attention_layernorm.frozen(),
        }
    }

    fn count(&self, acc: &mut ParamCount, trainable: bool) {
        self.self_attn.count(acc);
        self.mlp.count(acc);
        acc.add(self.input_layernorm.weight(), trainable);
        acc.add(self.post_attention_layernorm.weight(), trainable);
    }
}

// ── CausalLm ────────────────────────────────────────────────────────────────

/// LLaMA-family decoder with an LM head.
pub struct CausalLm {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    /// `None` with tied embeddings: logits use `embed_tokens` transposed.
    lm_head: Option<ProjLinear>,
    rotary: RotaryEmbedding,
    sliding_window: Option<usize>,
    frozen: bool,
    kind: ModelKind,
    config: ModelConfig,
}

impl CausalLm {
    pub fn new(config: &ModelConfig, lb: &LayerBuilder) -> anyhow::Result<Self> {
        config.validate()?;
        let kind = config.kind()?;
        let model = lb.pp("model");
        let embed_tokens = model.embedding(config.vocab_size, config.hidden_size, "embed_tokens")?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderLayer::new(config, &model.pp("layers").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let norm = model.rms_norm(config.hidden_size, config.rms_norm_eps, "norm")?;
        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(lb.head(config.hidden_size, config.vocab_size, "lm_head")?)
        };
        let sliding_window = match kind {
            ModelKind::Mistral => config.sliding_window,
            _ => None,
        };
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary: RotaryEmbedding::new(config, lb.device())?,
            sliding_window,
            frozen: lb.is_frozen(),
            kind,
            config: config.clone(),
        })
    }

    /// Logits `(batch, seq, vocab)` in f32.
    ///
    /// `adapters = false` runs the base weights only (LoRA bypassed).
    pub fn forward(
        &self,
        input_ids: &Tensor,
        position_ids: &Tensor,
        mask: &BatchMask,
        adapters: bool,
    ) -> Result<Tensor> {
        let dtype = self.embed_tokens.embeddings().dtype();
        let (cos, sin) = self.rotary.gather(position_ids, dtype)?;
        let bias = attention_bias(mask, position_ids, self.sliding_window)?;

        let mut x = self.embed_tokens.forward(input_ids)?;
        for layer in &self.layers {
            x = layer.forward(&x, &cos, &sin, &bias, adapters)?;
        }
        let x = self.norm.forward(&x)?;
        let logits = match &self.lm_head {
            Some(head) => head.forward(&x, false)?,
            None => matmul_last(&x, &self.embed_tokens.embeddings().t()?)?,
        };
        logits.to_dtype(DType::F32)
    }

    /// A view of the same weights that records no autograd graph.
    ///
    /// Tensors share storage with `self`, so the view is cheap to build and
    /// follows later optimiser updates.
    pub fn detached(&self) -> Self {
        Self {
            embed_tokens: Embedding::new(
                self.embed_tokens.embeddings().detach(),
                self.config.hidden_size,
            ),
            layers: self.layers.iter().map(DecoderLayer::detached).collect(),
            norm: self.norm.frozen(),
            lm_head: self.lm_head.as_ref().map(ProjLinear::detached),
            rotary: self.rotary.clone(),
            sliding_window: self.sliding_window,
            frozen: true,
            kind: self.kind,
            config: self.config.clone(),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn max_positions(&self) -> usize {
        self.rotary.max_positions()
    }

    /// Frozen vs trainable element counts over every weight of the model.
    pub fn parameter_count(&self) -> ParamCount {
        let trainable = !self.frozen;
        let mut acc = ParamCount::default();
        acc.add(self.embed_tokens.embeddings(), trainable);
        for layer in &self.layers {
            layer.count(&mut acc, trainable);
        }
        acc.add(self.norm.weight(), trainable);
        if let Some(head) = &self.lm_head {
            head.count(&mut acc);
        }
        acc
    }
}

/// `flash_mask` is only implemented for LLaMA and Qwen2.
pub fn check_flash_mask(model: &CausalLm, flash_mask: bool) -> anyhow::Result<()> {
    if flash_mask && !model.kind().supports_flash_mask() {
        bail!("{} not support flash mask.", model.kind().class_name());
    }
    Ok(())
}

// ── Weight files ────────────────────────────────────────────────────────────

/// Where a model's base weights come from.
#[derive(Debug, Clone)]
pub enum WeightInit {
    /// Safetensors checkpoint in this directory.
    Pretrained(PathBuf),
    /// Random initialisation (benchmarking without a checkpoint).
    Random,
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// `model.safetensors`, or the shards listed in `model.safetensors.index.json`.
pub fn safetensors_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let single = dir.join(MODEL_WEIGHTS_NAME);
    if single.is_file() {
        return Ok(vec![single]);
    }
    let index = dir.join(MODEL_WEIGHTS_INDEX_NAME);
    if !index.is_file() {
        bail!(
            "no {MODEL_WEIGHTS_NAME} or {MODEL_WEIGHTS_INDEX_NAME} in {}",
            dir.display()
        );
    }
    let json = std::fs::read_to_string(&index)
        .with_context(|| format!("read {}", index.display()))?;
    let index: SafetensorsIndex =
        serde_json::from_str(&json).with_context(|| format!("parse {}", index.display()))?;
    let mut shards: Vec<&String> = index.weight_map.values().collect();
    shards.sort();
    shards.dedup();
    Ok(shards.into_iter().map(|s| dir.join(s)).collect())
}

/// Read every tensor of a checkpoint into memory.
pub fn load_tensors(files: &[PathBuf], device: &Device) -> anyhow::Result<HashMap<String, Tensor>> {
    let mut out = HashMap::new();
    for file in files {
        let tensors = candle_core::safetensors::load(file, device)
            .with_context(|| format!("load {}", file.display()))?;
        out.extend(tensors);
    }
    Ok(out)
}

/// Overwrite every variable of `varmap` with the tensor of the same name.
pub fn load_into_varmap(varmap: &VarMap, tensors: &HashMap<String, Tensor>) -> anyhow::Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    for (name, var) in data.iter() {
        let Some(src) = tensors.get(name) else {
            bail!("checkpoint is missing `{name}`");
        };
        if src.dims() != var.dims() {
            bail!(
                "shape mismatch for `{name}`: checkpoint {:?}, model {:?}",
                src.dims(),
                var.dims()
            );
        }
        var.set(&src.to_dtype(var.dtype())?.to_device(var.device())?)?;
    }
    let unused = tensors.len().saturating_sub(data.len());
    if unused > 0 {
        tracing::debug!(unused, "checkpoint tensors not used by the model");
    }
    Ok(())
}

/// Copy every variable of `src` into the same-named variable of `dst`.
pub fn copy_varmap(src: &VarMap, dst: &VarMap) -> anyhow::Result<()> {
    let src = src
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    let dst = dst
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    for (name, var) in dst.iter() {
        let Some(from) = src.get(name) else {
            bail!("source model has no `{name}`");
        };
        var.set(&from.as_tensor().detach())?;
    }
    Ok(())
}

/// Write `model.safetensors` and `config.json`.
pub fn save_pretrained(varmap: &VarMap, config: &ModelConfig, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    varmap
        .save(dir.join(MODEL_WEIGHTS_NAME))
        .with_context(|| format!("save weights to {}", dir.display()))?;
    config.save(&dir.join(CONFIG_NAME))
}

// ── Model construction ──────────────────────────────────────────────────────

/// Full-parameter model whose weights are variables in the returned map.
pub fn build_full(
    config: &ModelConfig,
    init: &WeightInit,
    dtype: DType,
    device: &Device,
) -> anyhow::Result<(CausalLm, VarMap)> {
    let varmap = VarMap::new();
    let model = CausalLm::new(
        config,
        &LayerBuilder::full(VarBuilder::from_varmap(&varmap, dtype, device)),
    )?;
    if let WeightInit::Pretrained(dir) = init {
        let tensors = load_tensors(&safetensors_files(dir)?, device)?;
        load_into_varmap(&varmap, &tensors)?;
        tracing::info!(path = %dir.display(), "loaded pretrained weights");
    }
    Ok((model, varmap))
}

/// Frozen model (reference policy). Its weights still live in the returned
/// map so they can be re-synced with [`copy_varmap`]; the model reads them
/// without recording gradients.
pub fn build_frozen(
    config: &ModelConfig,
    dtype: DType,
    device: &Device,
) -> anyhow::Result<(CausalLm, VarMap)> {
    let varmap = VarMap::new();
    let model = CausalLm::new(
        config,
        &LayerBuilder::frozen(VarBuilder::from_varmap(&varmap, dtype, device)),
    )?;
    Ok((model, varmap))
}

/// Frozen base model with LoRA adapters created in `lora`'s variable map.
pub fn build_lora(
    config: &ModelConfig,
    init: &WeightInit,
    dtype: DType,
    device: &Device,
    lora: &LoraModel,
    quantize: Option<WeightQuantizeAlgo>,
) -> anyhow::Result<CausalLm> {
    let scratch = VarMap::new();
    let base = match init {
        WeightInit::Pretrained(dir) => {
            let tensors = load_tensors(&safetensors_files(dir)?, device)?;
            tracing::info!(path = %dir.display(), "loaded pretrained weights");
            VarBuilder::from_tensors(tensors, dtype, device)
        }
        WeightInit::Random => VarBuilder::from_varmap(&scratch, dtype, device),
    };
    if let Some(algo) = quantize {
        tracing::info!(algo = algo.name(), "quantizing LoRA target weights");
    }
    let builder = LayerBuilder::lora(base, lora.var_builder(device), lora.config(), quantize);
    CausalLm::new(config, &builder)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kto_common::collate::{collate, MaskLayout};
    use kto_common::packing::{ExampleSpans, PackedSequence};

    pub(crate) fn tiny_config(model_type: &str) -> ModelConfig {
        ModelConfig {
            model_type: model_type.to_string(),
            architectures: vec![],
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

    /// Two examples packed into one sequence of 10 tokens.
    fn packed() -> PackedSequence {
        PackedSequence {
            input_ids: vec![1, 5, 6, 7, 5, 8, 1, 9, 10, 9],
            position_ids: vec![0, 1, 2, 3, 1, 2, 0, 1, 2, 1],
            attn_end_rows: vec![6, 4, 4, 4, 6, 6, 10, 9, 9, 10],
            examples: vec![
                ExampleSpans {
                    response: 1..3,
                    kl: 4..5,
                    desirable: true,
                },
                ExampleSpans {
                    response: 7..8,
                    kl: 9..9,
                    desirable: false,
                },
            ],
        }
    }

    #[test]
    fn dense_and_end_row_masks_give_same_logits() {
        let dev = Device::Cpu;
        let (model, _vm) = build_full(&tiny_config("llama"), &WeightInit::Random, DType::F32, &dev).unwrap();
        let seq = packed();
        let dense = collate(&[&seq], 12, 0, MaskLayout::Dense, &dev).unwrap();
        let rows = collate(&[&seq], 12, 0, MaskLayout::EndRows, &dev).unwrap();
        let a = model
            .forward(&dense.input_ids, &dense.position_ids, &dense.mask, true)
            .unwrap();
        let b = model
            .forward(&rows.input_ids, &rows.position_ids, &rows.mask, true)
            .unwrap();
        assert_eq!(a.dims(), &[1, 12, 32]);
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn packed_examples_do_not_see_each_other() {
        let dev = Device::Cpu;
        let (model, _vm) = build_full(&tiny_config("qwen2"), &WeightInit::Random, DType::F32, &dev).unwrap();
        let seq = packed();
        let batch = collate(&[&seq], 10, 0, MaskLayout::EndRows, &dev).unwrap();
        let logits = model
            .forward(&batch.input_ids, &batch.position_ids, &batch.mask, true)
            .unwrap();

        // Second example on its own.
        let alone = PackedSequence {
            input_ids: seq.input_ids[6..].to_vec(),
            position_ids: seq.position_ids[6..].to_vec(),
            attn_end_rows: seq.attn_end_rows[6..].iter().map(|e| e - 6).collect(),
            examples: vec![],
        };
        let single = collate(&[&alone], 4, 0, MaskLayout::EndRows, &dev).unwrap();
        let alone_logits = model
            .forward(&single.input_ids, &single.position_ids, &single.mask, true)
            .unwrap();
        let packed_tail = logits.narrow(1, 6, 4).unwrap();
        let diff = (packed_tail - alone_logits).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn lora_bypass_matches_base_until_trained() {
        let dev = Device::Cpu;
        let config = tiny_config("llama");
        let lora = LoraModel::new(crate::lora::LoraConfig {
            r: 2,
            lora_alpha: 4.0,
            ..Default::default()
        });
        let model = build_lora(&config, &WeightInit::Random, DType::F32, &dev, &lora, None).unwrap();
        // 2 layers × 7 targets × (A + B)
        assert_eq!(lora.varmap().all_vars().len(), 28);
        let count = model.parameter_count();
        assert_eq!(count.trainable, lora.num_parameters());
        assert!(count.frozen > count.trainable);

        let seq = packed();
        let batch = collate(&[&seq], 10, 0, MaskLayout::Dense, &dev).unwrap();
        let with = model
            .forward(&batch.input_ids, &batch.position_ids, &batch.mask, true)
            .unwrap();
        let without = model
            .forward(&batch.input_ids, &batch.position_ids, &batch.mask, false)
            .unwrap();
        let diff = (with - without).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn detached_view_matches_without_gradients() {
        let dev = Device::Cpu;
        let config = tiny_config("llama");
        let lora = LoraModel::new(crate::lora::LoraConfig {
            r: 2,
            lora_alpha: 4.0,
            ..Default::default()
        });
        let model = build_lora(&config, &WeightInit::Random, DType::F32, &dev, &lora, None).unwrap();
        let view = model.detached();

        let seq = packed();
        let batch = collate(&[&seq], 10, 0, MaskLayout::Dense, &dev).unwrap();
        let tracked = model
            .forward(&batch.input_ids, &batch.position_ids, &batch.mask, true)
            .unwrap();
        let plain = view
            .forward(&batch.input_ids, &batch.position_ids, &batch.mask, true)
            .unwrap();
        let diff = (&tracked - &plain).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);

        let a = &lora.varmap().all_vars()[0];
        let grads = tracked.sum_all().unwrap().backward().unwrap();
        assert!(grads.get(a.as_tensor()).is_some());
        let grads = plain.sum_all().unwrap().backward().unwrap();
        assert!(grads.get(a.as_tensor()).is_none());
    }

    #[test]
    fn mistral_rejects_flash_mask() {
        let dev = Device::Cpu;
        let mut config = tiny_config("mistral");
        config.sliding_window = Some(4);
        let (model, _vm) = build_full(&config, &WeightInit::Random, DType::F32, &dev).unwrap();
        let err = check_flash_mask(&model, true).unwrap_err();
        assert_eq!(err.to_string(), "MistralForCausalLM not support flash mask.");
        check_flash_mask(&model, false).unwrap();
    }

    #[test]
    fn save_then_load_pretrained() {
        let dir = tempfile::tempdir().unwrap();
        let dev = Device::Cpu;
        let mut config = tiny_config("llama");
        config.tie_word_embeddings = true;
        let (model, varmap) = build_full(&config, &WeightInit::Random, DType::F32, &dev).unwrap();
        save_pretrained(&varmap, &config, dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_NAME).is_file());

        let reloaded_config = ModelConfig::from_pretrained(dir.path()).unwrap();
        let (reloaded, _vm) = build_full(
            &reloaded_config,
            &WeightInit::Pretrained(dir.path().to_path_buf()),
            DType::F32,
            &dev,
        )
        .unwrap();
        let seq = packed();
        let batch = collate(&[&seq], 10, 0, MaskLayout::Dense, &dev).unwrap();
        let a = model
            .forward(&batch.input_ids, &batch.position_ids, &batch.mask, true)
            .unwrap();
        let b = reloaded
            .forward(&batch.input_ids, &batch.position_ids, &batch.mask, true)
            .unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn frozen_copy_tracks_source_after_sync() {
        let dev = Device::Cpu;
        let config = tiny_config("llama");
        let (policy, policy_vars) = build_full(&config, &WeightInit::Random, DType::F32, &dev).unwrap();
        let (reference, reference_vars) = build_frozen(&config, DType::F32, &dev).unwrap();
        copy_varmap(&policy_vars, &reference_vars).unwrap();
        let seq = packed();
        let batch = collate(&[&seq], 10, 0, MaskLayout::Dense, &dev).unwrap();
        let a = policy
            .forward(&batch.input_ids, &batch.position_ids, &batch.mask, true)
            .unwrap();
        let b = reference
            .forward(&batch.input_ids, &batch.position_ids, &batch.mask, true)
            .unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
        assert_eq!(reference.parameter_count().trainable, 0);
    }
}
