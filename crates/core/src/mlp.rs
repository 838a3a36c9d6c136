//! SwiGLU feed-forward block of LLaMA-family decoders.
//!
//! ```text
//! gate = SiLU( gate_proj(x) )
//! up   = up_proj(x)
//! out  = down_proj( gate ⊙ up )
//! ```

use candle_core::{Result, Tensor};

use kto_common::ModelConfig;

use crate::linear::{LayerBuilder, ParamCount, ProjLinear};

pub struct Mlp {
    gate_proj: ProjLinear,
    up_proj: ProjLinear,
    down_proj: ProjLinear,
}

impl Mlp {
    pub fn new(config: &ModelConfig, lb: &LayerBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let inter = config.intermediate_size;
        Ok(Self {
            gate_proj: lb.linear(h, inter, false, "gate_proj")?,
            up_proj: lb.linear(h, inter, false, "up_proj")?,
            down_proj: lb.linear(inter, h, false, "down_proj")?,
        })
    }

    pub fn forward(&self, x: &Tensor, adapters: bool) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x, adapters)?)?;
        let up = self.up_proj.forward(x, adapters)?;
        self.down_proj.forward(&(gate * up)?, adapters)
    }

    pub(crate) fn detached(&self) -> Self {
        Self {
            gate_proj: self.gate_proj.detached(),
            up_proj: self.up_proj.detached(),
            down_proj: self.down_proj.detached(),
        }
    }

    pub(crate) fn count(&self, acc: &mut ParamCount) {
        self.gate_proj.count(acc);
        self.up_proj.count(acc);
        self.down_proj.count(acc);
    }
}
