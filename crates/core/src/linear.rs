//! Projection layers with optional LoRA adapters.
//!
//! A [`ProjLinear`] holds a base weight `(out, in)` and, when it is a LoRA
//! target, a low-rank pair `A (r, in)`, `B (out, r)`:
//!
//! ```text
//! y = x Wᵀ + b + s · (x Aᵀ) Bᵀ
//! ```
//!
//! Passing `adapters = false` skips the low-rank term, which turns the same
//! module into the frozen base model. The trainer uses that to get reference
//! log-probs without a second copy of the weights.
//!
//! Layers are created through a [`LayerBuilder`], which walks the base and
//! adapter [`VarBuilder`]s in lockstep so adapter names mirror base names
//! (`model.layers.0.self_attn.q_proj.lora_A`).

use candle_core::{DType, Result, Tensor};
use candle_nn::{Embedding, Init, VarBuilder};

use crate::lora::LoraConfig;
use crate::norm::RmsNorm;
use crate::quantize::{fake_quantize, WeightQuantizeAlgo};

/// Initialiser for freshly created projection and embedding weights
/// (`initializer_range` of the published LLaMA configs).
const WEIGHT_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 0.02,
};

// ── Parameter accounting ────────────────────────────────────────────────────

/// Frozen vs trainable element counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamCount {
    pub frozen: usize,
    pub trainable: usize,
}

impl ParamCount {
    pub fn total(&self) -> usize {
        self.frozen + self.trainable
    }

    pub(crate) fn add(&mut self, t: &Tensor, trainable: bool) {
        if trainable {
            self.trainable += t.elem_count();
        } else {
            self.frozen += t.elem_count();
        }
    }
}

// ── LoRA adapter ────────────────────────────────────────────────────────────

/// Low-rank update of one projection. Parameters are kept in f32.
pub struct LoraAdapter {
    a: Tensor,
    b: Tensor,
    scaling: f64,
}

impl LoraAdapter {
    /// `A` uniform in `±1/sqrt(in)`, `B` zero, so a fresh adapter is a no-op.
    pub fn new(in_dim: usize, out_dim: usize, config: &LoraConfig, vb: VarBuilder) -> Result<Self> {
        let bound = 1.0 / (in_dim as f64).sqrt();
        let a = vb.get_with_hints(
            (config.r, in_dim),
            "lora_A",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let b = vb.get_with_hints((out_dim, config.r), "lora_B", Init::Const(0.))?;
        Ok(Self {
            a,
            b,
            scaling: config.scaling(),
        })
    }

    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    fn detached(&self) -> Self {
        Self {
            a: self.a.detach(),
            b: self.b.detach(),
            scaling: self.scaling,
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let h = matmul_last(x, &self.a.to_dtype(dtype)?.t()?)?;
        let h = matmul_last(&h, &self.b.to_dtype(dtype)?.t()?)?;
        h.affine(self.scaling, 0.0)
    }
}

// ── ProjLinear ──────────────────────────────────────────────────────────────

/// Linear projection (optional bias) with an optional LoRA adapter.
pub struct ProjLinear {
    weight: Tensor,
    bias: Option<Tensor>,
    lora: Option<LoraAdapter>,
    frozen: bool,
}

impl ProjLinear {
    pub fn forward(&self, x: &Tensor, adapters: bool) -> Result<Tensor> {
        let mut y = matmul_last(x, &self.weight.t()?)?;
        if let Some(bias) = &self.bias {
            y = y.broadcast_add(bias)?;
        }
        match &self.lora {
            Some(lora) if adapters => y + lora.forward(x)?,
            _ => Ok(y),
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Same projection with every weight, adapters included, off the graph.
    pub fn detached(&self) -> Self {
        Self {
            weight: self.weight.detach(),
            bias: self.bias.as_ref().map(Tensor::detach),
            lora: self.lora.as_ref().map(LoraAdapter::detached),
            frozen: true,
        }
    }

    pub fn lora(&self) -> Option<&LoraAdapter> {
        self.lora.as_ref()
    }

    pub(crate) fn count(&self, acc: &mut ParamCount) {
        acc.add(&self.weight, !self.frozen);
        if let Some(bias) = &self.bias {
            acc.add(bias, !self.frozen);
        }
        if let Some(lora) = &self.lora {
            acc.add(&lora.a, true);
            acc.add(&lora.b, true);
        }
    }
}

/// `x @ w_t` over the last dimension, for any number of leading dims.
pub fn matmul_last(x: &Tensor, w_t: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let last = dims[dims.len() - 1];
    let rows: usize = dims[..dims.len() - 1].iter().product();
    let y = x.reshape((rows, last))?.matmul(w_t)?;
    let mut out_shape = dims[..dims.len() - 1].to_vec();
    out_shape.push(w_t.dim(1)?);
    y.reshape(out_shape)
}

// ── LayerBuilder ────────────────────────────────────────────────────────────

/// Creates model layers from a base [`VarBuilder`] and, for LoRA runs, an
/// adapter [`VarBuilder`] scoped to the same path.
#[derive(Clone)]
pub struct LayerBuilder<'a> {
    base: VarBuilder<'a>,
    adapters: Option<(VarBuilder<'a>, &'a LoraConfig)>,
    quantize: Option<WeightQuantizeAlgo>,
    frozen: bool,
}

impl<'a> LayerBuilder<'a> {
    /// Trainable base weights, no adapters.
    pub fn full(base: VarBuilder<'a>) -> Self {
        Self {
            base,
            adapters: None,
            quantize: None,
            frozen: false,
        }
    }

    /// Base weights cut off from the graph (reference model).
    pub fn frozen(base: VarBuilder<'a>) -> Self {
        Self {
            frozen: true,
            ..Self::full(base)
        }
    }

    /// Frozen (optionally quantised) base weights plus LoRA adapters.
    pub fn lora(
        base: VarBuilder<'a>,
        adapters: VarBuilder<'a>,
        config: &'a LoraConfig,
        quantize: Option<WeightQuantizeAlgo>,
    ) -> Self {
        Self {
            base,
            adapters: Some((adapters, config)),
            quantize,
            frozen: true,
        }
    }

    pub fn pp<S: ToString>(&self, name: S) -> Self {
        let name = name.to_string();
        Self {
            base: self.base.pp(&name),
            adapters: self
                .adapters
                .as_ref()
                .map(|(vb, config)| (vb.pp(&name), *config)),
            quantize: self.quantize,
            frozen: self.frozen,
        }
    }

    pub fn dtype(&self) -> DType {
        self.base.dtype()
    }

    pub fn device(&self) -> &candle_core::Device {
        self.base.device()
    }

    fn get(&self, shape: impl Into<candle_core::Shape>, name: &str, init: Init) -> Result<Tensor> {
        let t = self.base.get_with_hints(shape, name, init)?;
        Ok(if self.frozen { t.detach() } else { t })
    }

    /// Projection `name` under the current prefix. Adapters are attached
    /// when `name` is one of the LoRA target modules.
    pub fn linear(&self, in_dim: usize, out_dim: usize, bias: bool, name: &str) -> Result<ProjLinear> {
        let scoped = self.pp(name);
        let mut weight = scoped.get((out_dim, in_dim), "weight", WEIGHT_INIT)?;
        let bias = if bias {
            Some(scoped.get(out_dim, "bias", Init::Const(0.))?)
        } else {
            None
        };
        let lora = match &scoped.adapters {
            Some((vb, config)) if config.is_target(name) => {
                if let Some(algo) = self.quantize {
                    weight = fake_quantize(&weight, algo)?;
                }
                Some(LoraAdapter::new(in_dim, out_dim, config, vb.clone())?)
            }
            _ => None,
        };
        Ok(ProjLinear {
            weight,
            bias,
            lora,
            frozen: self.frozen,
        })
    }

    /// Output head that is never adapted.
    pub fn head(&self, in_dim: usize, out_dim: usize, name: &str) -> Result<ProjLinear> {
        let weight = self.pp(name).get((out_dim, in_dim), "weight", WEIGHT_INIT)?;
        Ok(ProjLinear {
            weight,
            bias: None,
            lora: None,
            frozen: self.frozen,
        })
    }

    pub fn embedding(&self, vocab: usize, hidden: usize, name: &str) -> Result<Embedding> {
        let weight = self.pp(name).get((vocab, hidden), "weight", WEIGHT_INIT)?;
        Ok(Embedding::new(weight, hidden))
    }

    pub fn rms_norm(&self, size: usize, eps: f64, name: &str) -> Result<RmsNorm> {
        let norm = RmsNorm::new(size, eps, self.base.pp(name))?;
        Ok(if self.frozen { norm.frozen() } else { norm })
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn lora_config(r: usize, alpha: f64, rslora: bool) -> LoraConfig {
        LoraConfig {
            r,
            lora_alpha: alpha,
            rslora,
            ..Default::default()
        }
    }

    #[test]
    fn fresh_adapter_is_identity() {
        let dev = Device::Cpu;
        let base = VarMap::new();
        let adapters = VarMap::new();
        let config = lora_config(4, 8.0, false);
        let builder = LayerBuilder::lora(
            VarBuilder::from_varmap(&base, DType::F32, &dev),
            VarBuilder::from_varmap(&adapters, DType::F32, &dev),
            &config,
            None,
        );
        let proj = builder.linear(6, 5, false, "q_proj").unwrap();
        assert!(proj.lora().is_some());
        let x = Tensor::randn(0f32, 1., (2, 3, 6), &dev).unwrap();
        let with = proj.forward(&x, true).unwrap();
        let without = proj.forward(&x, false).unwrap();
        let diff = (with - without).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
        assert_eq!(adapters.all_vars().len(), 2);
    }

    #[test]
    fn adapter_contributes_once_b_is_set() {
        let dev = Device::Cpu;
        let base = VarMap::new();
        let adapters = VarMap::new();
        let config = lora_config(2, 4.0, false);
        let builder = LayerBuilder::lora(
            VarBuilder::from_varmap(&base, DType::F32, &dev),
            VarBuilder::from_varmap(&adapters, DType::F32, &dev),
            &config,
            None,
        );
        let proj = builder.pp("mlp").linear(3, 3, false, "up_proj").unwrap();
        for (name, var) in adapters.data().lock().unwrap().iter() {
            if name.ends_with("lora_B") {
                var.set(&Tensor::ones((3, 2), DType::F32, &dev).unwrap()).unwrap();
            }
            if name.ends_with("lora_A") {
                var.set(&Tensor::ones((2, 3), DType::F32, &dev).unwrap()).unwrap();
            }
        }
        let x = Tensor::ones((1, 3), DType::F32, &dev).unwrap();
        let delta = (proj.forward(&x, true).unwrap() - proj.forward(&x, false).unwrap()).unwrap();
        // (x Aᵀ) = [3, 3]; (· Bᵀ) = [6, 6, 6]; scaling = 4 / 2.
        assert_eq!(delta.to_vec2::<f32>().unwrap(), vec![vec![12.0, 12.0, 12.0]]);
        assert!(adapters.data().lock().unwrap().contains_key("mlp.up_proj.lora_A"));
    }

    #[test]
    fn non_targets_get_no_adapter() {
        let dev = Device::Cpu;
        let base = VarMap::new();
        let adapters = VarMap::new();
        let config = lora_config(2, 4.0, false);
        let builder = LayerBuilder::lora(
            VarBuilder::from_varmap(&base, DType::F32, &dev),
            VarBuilder::from_varmap(&adapters, DType::F32, &dev),
            &config,
            None,
        );
        let head = builder.head(4, 8, "lm_head").unwrap();
        assert!(head.lora().is_none());
        let mut count = ParamCount::default();
        head.count(&mut count);
        assert_eq!(count, ParamCount { frozen: 32, trainable: 0 });
    }

    #[test]
    fn matmul_last_keeps_leading_dims() {
        let dev = Device::Cpu;
        let x = Tensor::ones((2, 3, 4), DType::F32, &dev).unwrap();
        let w_t = Tensor::ones((4, 5), DType::F32, &dev).unwrap();
        let y = matmul_last(&x, &w_t).unwrap();
        assert_eq!(y.dims(), &[2, 3, 5]);
    }
}
