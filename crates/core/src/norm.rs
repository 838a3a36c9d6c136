//! RMSNorm for LLaMA-family decoders.
//!
//! Written out with primitive tensor ops so every step has a backward pass;
//! statistics are taken in f32 regardless of the load dtype.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// `x / sqrt(mean(x²) + eps) * weight`, no mean subtraction.
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    /// `vb` should be scoped to the layer prefix (e.g. `vb.pp("input_layernorm")`).
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Same layer with its weight cut off from the graph.
    pub fn frozen(&self) -> Self {
        Self {
            weight: self.weight.detach(),
            eps: self.eps,
        }
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x32 = x.to_dtype(DType::F32)?;
        let var = x32.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = x32.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight.to_dtype(dtype)?)
    }
}
