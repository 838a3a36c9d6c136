//! LoRA configuration, adapter storage and persistence.
//!
//! Adapter parameters live in their own [`VarMap`] so the optimiser only
//! ever sees them; the base model is loaded as plain (frozen) tensors.
//! A saved adapter directory holds:
//!
//! * `lora_config.json`: [`LoraConfig`]
//! * `lora_model_state.safetensors`: every `lora_A` / `lora_B` tensor

use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use kto_common::{ModelArgs, ModelKind};

pub const LORA_CONFIG_NAME: &str = "lora_config.json";
pub const LORA_WEIGHTS_NAME: &str = "lora_model_state.safetensors";

/// Serialised adapter hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub target_modules: Vec<String>,
    pub r: usize,
    pub lora_alpha: f64,
    pub rslora: bool,
    pub lora_plus_scale: f64,
    pub base_model_name_or_path: String,
    pub dtype: String,
    pub tensor_parallel_degree: usize,
    /// Recorded for compatibility; the fused kernel it selects does not exist here.
    pub use_quick_lora: bool,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            target_modules: ModelKind::Llama
                .lora_target_modules()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            r: 8,
            lora_alpha: 16.0,
            rslora: false,
            lora_plus_scale: 1.0,
            base_model_name_or_path: String::new(),
            dtype: "float32".to_string(),
            tensor_parallel_degree: 1,
            use_quick_lora: false,
        }
    }
}

/// Name used in `lora_config.json` for a load dtype.
pub fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F16 => "float16",
        DType::BF16 => "bfloat16",
        _ => "float32",
    }
}

impl LoraConfig {
    /// Build from resolved model arguments (see `ModelArgs::resolve_lora_hyperparams`).
    ///
    /// The adapter alpha is always `2 * lora_rank`, or 4 under rsLoRA; a
    /// user-set `lora_alpha` only affects the logged arguments.
    pub fn from_model_args(
        args: &ModelArgs,
        kind: ModelKind,
        dtype: DType,
        tensor_parallel_degree: usize,
    ) -> Self {
        Self {
            target_modules: kind
                .lora_target_modules()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            r: args.lora_rank,
            lora_alpha: if args.rslora {
                4.0
            } else {
                2.0 * args.lora_rank as f64
            },
            rslora: args.rslora,
            lora_plus_scale: args.lora_plus_scale,
            base_model_name_or_path: args.model_name_or_path.clone(),
            dtype: dtype_name(dtype).to_string(),
            tensor_parallel_degree,
            use_quick_lora: args.use_quick_lora,
        }
    }

    /// `alpha / r`, or `alpha / sqrt(r)` with rsLoRA.
    pub fn scaling(&self) -> f64 {
        if self.rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }

    pub fn is_target(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(LORA_CONFIG_NAME), json)?;
        Ok(())
    }

    pub fn from_pretrained(dir: &Path) -> Result<Self> {
        let path = dir.join(LORA_CONFIG_NAME);
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&json).with_context(|| format!("parse {}", path.display()))?;
        if config.r == 0 {
            bail!("{}: `r` must be positive", path.display());
        }
        Ok(config)
    }
}

// ── Adapter storage ─────────────────────────────────────────────────────────

/// Adapter parameters plus their configuration.
pub struct LoraModel {
    config: LoraConfig,
    varmap: VarMap,
}

impl LoraModel {
    pub fn new(config: LoraConfig) -> Self {
        Self {
            config,
            varmap: VarMap::new(),
        }
    }

    /// Config from `dir`; weights are loaded with [`LoraModel::load_weights`]
    /// once the model has created the variables.
    pub fn from_pretrained(dir: &Path) -> Result<Self> {
        Ok(Self::new(LoraConfig::from_pretrained(dir)?))
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Builder that creates (or returns) adapter variables, always f32.
    pub fn var_builder(&self, device: &Device) -> VarBuilder<'_> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, device)
    }

    pub fn load_weights(&mut self, dir: &Path) -> Result<()> {
        let path = dir.join(LORA_WEIGHTS_NAME);
        self.varmap
            .load(&path)
            .with_context(|| format!("load LoRA weights {}", path.display()))?;
        tracing::info!(path = %path.display(), tensors = self.varmap.all_vars().len(), "loaded LoRA weights");
        Ok(())
    }

    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.config.save(dir)?;
        self.varmap
            .save(dir.join(LORA_WEIGHTS_NAME))
            .context("save LoRA weights")?;
        Ok(())
    }

    /// `(A params, B params)`; LoRA+ gives the second group a larger learning rate.
    pub fn param_groups(&self) -> (Vec<Var>, Vec<Var>) {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        let mut a = Vec::new();
        let mut b = Vec::new();
        for name in names {
            let var = data[name].clone();
            if name.ends_with("lora_B") {
                b.push(var);
            } else {
                a.push(var);
            }
        }
        (a, b)
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }
}

/// Log frozen / trainable parameter counts.
pub fn print_trainable_parameters(frozen: usize, trainable: usize) {
    let total = frozen + trainable;
    let pct = if total == 0 {
        0.0
    } else {
        100.0 * trainable as f64 / total as f64
    };
    tracing::info!("Frozen parameters: {frozen:.2e} || Trainable parameters:{trainable:.2e} || Total parameters:{total:.2e}|| Trainable:{pct:.2}%");
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_plain_and_rslora() {
        let mut config = LoraConfig {
            r: 16,
            lora_alpha: 32.0,
            ..Default::default()
        };
        assert_eq!(config.scaling(), 2.0);
        config.rslora = true;
        assert_eq!(config.scaling(), 8.0);
    }

    #[test]
    fn resolved_args_flow_into_config() {
        let mut args = ModelArgs {
            model_name_or_path: "m".into(),
            lora_rank: 4,
            rslora_plus: true,
            ..Default::default()
        };
        args.resolve_lora_hyperparams();
        let config = LoraConfig::from_model_args(&args, ModelKind::Qwen2, DType::BF16, 1);
        assert!(config.rslora);
        assert_eq!(config.lora_alpha, 4.0);
        assert_eq!(config.lora_plus_scale, 4.0);
        assert_eq!(config.scaling(), 2.0);
        assert_eq!(config.dtype, "bfloat16");
        assert!(config.is_target("gate_proj"));
        assert!(!config.is_target("lm_head"));
    }

    #[test]
    fn adapter_alpha_follows_rank_not_user_alpha() {
        let mut args = ModelArgs {
            model_name_or_path: "m".into(),
            lora_rank: 8,
            lora_alpha: 64.0,
            ..Default::default()
        };
        args.resolve_lora_hyperparams();
        assert_eq!(args.lora_alpha, 64.0);
        let config = LoraConfig::from_model_args(&args, ModelKind::Llama, DType::F32, 1);
        assert_eq!(config.lora_alpha, 16.0);
        assert_eq!(config.scaling(), 2.0);

        args.rslora = true;
        let config = LoraConfig::from_model_args(&args, ModelKind::Llama, DType::F32, 1);
        assert_eq!(config.lora_alpha, 4.0);
    }

    #[test]
    fn save_and_reload_adapters() {
        let dir = tempfile::tempdir().unwrap();
        let dev = Device::Cpu;
        let config = LoraConfig {
            r: 2,
            ..Default::default()
        };
        let model = LoraModel::new(config.clone());
        let vb = model.var_builder(&dev);
        vb.pp("layer")
            .get_with_hints((2, 3), "lora_A", candle_nn::Init::Const(0.5))
            .unwrap();
        vb.pp("layer")
            .get_with_hints((3, 2), "lora_B", candle_nn::Init::Const(0.0))
            .unwrap();
        model.save_pretrained(dir.path()).unwrap();

        let mut reloaded = LoraModel::from_pretrained(dir.path()).unwrap();
        assert_eq!(reloaded.config(), &config);
        let vb = reloaded.var_builder(&dev);
        vb.pp("layer")
            .get_with_hints((2, 3), "lora_A", candle_nn::Init::Const(0.0))
            .unwrap();
        vb.pp("layer")
            .get_with_hints((3, 2), "lora_B", candle_nn::Init::Const(0.0))
            .unwrap();
        drop(vb);
        reloaded.load_weights(dir.path()).unwrap();
        let (a, b) = reloaded.param_groups();
        assert_eq!((a.len(), b.len()), (1, 1));
        let sum = a[0].as_tensor().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(sum, 3.0);
        assert_eq!(reloaded.num_parameters(), 12);
    }
}
