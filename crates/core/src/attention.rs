//! Grouped-query self-attention with rotary embeddings and packed masks.
//!
//! Features:
//! * **RoPE**: rotate-half rotary embeddings gathered per token from
//!   explicit position ids, so packed examples restart their positions.
//! * **GQA**: `num_key_value_heads` K/V heads shared across query heads.
//! * **Masks**: a dense additive bias, or per-column end rows expanded on
//!   device ("flash mask"). Both produce the same bias.
//! * **Sliding window**: Mistral's window, measured in position ids.

use candle_core::{DType, Device, Result, Tensor, D};

use kto_common::{BatchMask, ModelConfig, MASKED_BIAS};

use crate::linear::{LayerBuilder, ParamCount, ProjLinear};

// ── Rotary embeddings ───────────────────────────────────────────────────────

/// Cosine / sine tables of shape `(max_positions, head_dim / 2)`, f32.
#[derive(Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    /// θ_i = base^{-2i/d}.
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let head_dim = config.head_dim();
        let max_positions = config.max_position_embeddings;
        let d2 = head_dim / 2;
        let inv_freq: Vec<f32> = (0..d2)
            .map(|i| 1.0 / config.rope_theta.powf(2.0 * i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, d2), device)?;
        let positions = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;
        let freqs = positions.broadcast_mul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    pub fn max_positions(&self) -> usize {
        self.cos.dim(0).unwrap_or(0)
    }

    /// Gather `(cos, sin)` for `(batch, seq)` position ids, shaped
    /// `(batch, 1, seq, head_dim)` in `dtype`.
    pub fn gather(&self, position_ids: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let (b, t) = position_ids.dims2()?;
        let head_dim = self.cos.dim(1)? * 2;
        let flat = position_ids.flatten_all()?;
        let pick = |table: &Tensor| -> Result<Tensor> {
            let half = table.index_select(&flat, 0)?;
            Tensor::cat(&[&half, &half], D::Minus1)?
                .reshape((b, 1, t, head_dim))?
                .to_dtype(dtype)
        };
        Ok((pick(&self.cos)?, pick(&self.sin)?))
    }
}

/// `[-x2, x1]` for `x = [x1, x2]` split on the last dimension.
fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let d = x.dim(D::Minus1)?;
    let x1 = x.narrow(D::Minus1, 0, d / 2)?;
    let x2 = x.narrow(D::Minus1, d / 2, d - d / 2)?;
    Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
}

/// Apply rotary embeddings to `(batch, heads, seq, head_dim)`.
pub fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    x.broadcast_mul(cos)? + rotate_half(x)?.broadcast_mul(sin)?
}

// ── Masks ───────────────────────────────────────────────────────────────────

/// `(rows, cols)` index grids of shape `(1, t, 1)` and `(1, 1, t)`, f32.
fn index_grids(t: usize, device: &Device) -> Result<(Tensor, Tensor)> {
    let idx = Tensor::arange(0u32, t as u32, device)?.to_dtype(DType::F32)?;
    Ok((idx.reshape((1, t, 1))?, idx.reshape((1, 1, t))?))
}

/// `allowed ∈ {0, 1}` → `0` or [`MASKED_BIAS`].
fn to_bias(allowed: &Tensor) -> Result<Tensor> {
    allowed
        .to_dtype(DType::F32)?
        .affine(-(MASKED_BIAS as f64), MASKED_BIAS as f64)
}

/// Expand `(batch, seq)` end rows into a `(batch, 1, seq, seq)` bias:
/// query `r` sees key `c` iff `c <= r < end[c]`.
pub fn end_rows_to_bias(end_rows: &Tensor) -> Result<Tensor> {
    let (b, t) = end_rows.dims2()?;
    let (rows, cols) = index_grids(t, end_rows.device())?;
    let ends = end_rows.to_dtype(DType::F32)?.reshape((b, 1, t))?;
    let causal = cols.broadcast_le(&rows)?;
    let live = rows.broadcast_lt(&ends)?;
    let allowed = causal.broadcast_mul(&live)?;
    to_bias(&allowed)?.unsqueeze(1)
}

/// `(batch, 1, seq, seq)` bias hiding keys `window` or more positions back.
pub fn sliding_window_bias(position_ids: &Tensor, window: usize) -> Result<Tensor> {
    let (b, t) = position_ids.dims2()?;
    let pos = position_ids.to_dtype(DType::F32)?;
    let q = pos.reshape((b, t, 1))?;
    let k = pos.reshape((b, 1, t))?;
    let within = q.broadcast_sub(&k)?.lt(window as f64)?;
    to_bias(&within)?.unsqueeze(1)
}

/// Full f32 attention bias for a batch.
pub fn attention_bias(
    mask: &BatchMask,
    position_ids: &Tensor,
    sliding_window: Option<usize>,
) -> Result<Tensor> {
    let bias = match mask {
        BatchMask::EndRows(end_rows) => end_rows_to_bias(end_rows)?,
        BatchMask::Dense(bias) => bias.to_dtype(DType::F32)?,
    };
    match sliding_window {
        Some(window) => bias.broadcast_add(&sliding_window_bias(position_ids, window)?),
        None => Ok(bias),
    }
}

// ── Attention ───────────────────────────────────────────────────────────────

/// Repeat K/V heads `n_rep` times: `(b, kv, t, d)` → `(b, kv * n_rep, t, d)`.
fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, kv, t, d) = x.dims4()?;
    Tensor::cat(&vec![&x; n_rep], 2)?.reshape((b, kv * n_rep, t, d))
}

/// Multi-head self-attention (`self_attn.{q,k,v,o}_proj`).
pub struct Attention {
    q_proj: ProjLinear,
    k_proj: ProjLinear,
    v_proj: ProjLinear,
    o_proj: ProjLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    pub fn new(config: &ModelConfig, lb: &LayerBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();
        let bias = config.qkv_bias();
        Ok(Self {
            q_proj: lb.linear(hidden, num_heads * head_dim, bias, "q_proj")?,
            k_proj: lb.linear(hidden, num_kv_heads * head_dim, bias, "k_proj")?,
            v_proj: lb.linear(hidden, num_kv_heads * head_dim, bias, "v_proj")?,
            o_proj: lb.linear(num_heads * head_dim, hidden, false, "o_proj")?,
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// `x`: `(b, t, hidden)`; `cos`/`sin`: `(b, 1, t, head_dim)`;
    /// `bias`: `(b, 1, t, t)` f32.
    pub fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        bias: &Tensor,
        adapters: bool,
    ) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let heads = |proj: &ProjLinear, n: usize| -> Result<Tensor> {
            proj.forward(x, adapters)?
                .reshape((b, t, n, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = heads(&self.q_proj, self.num_heads)?;
        let k = heads(&self.k_proj, self.num_kv_heads)?;
        let v = heads(&self.v_proj, self.num_kv_heads)?;

        let q = apply_rotary(&q, cos, sin)?;
        let k = apply_rotary(&k, cos, sin)?;
        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?
            .to_dtype(DType::F32)?
            .broadcast_add(bias)?;
        let att = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(v.dtype())?;
        let y = att.contiguous()?.matmul(&v)?;
        let y = y.transpose(1, 2)?.reshape((b, t, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&y, adapters)
    }

    pub(crate) fn detached(&self) -> Self {
        Self {
            q_proj: self.q_proj.detached(),
            k_proj: self.k_proj.detached(),
            v_proj: self.v_proj.detached(),
            o_proj: self.o_proj.detached(),
            num_heads: self.num_heads,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
            scale: self.scale,
        }
    }

    pub(crate) fn count(&self, acc: &mut ParamCount) {
        for proj in [&self.q_proj, &self.k_proj, &self.v_proj, &self.o_proj] {
            proj.count(acc);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
