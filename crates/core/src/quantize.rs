//! Weight-only quantisation of frozen base projections.
//!
//! Symmetric per-output-channel absmax: each weight row `w` is mapped to
//! integers in `[-q, q]` with `scale = max|w| / q`, then dequantised back to
//! the load dtype. The base model trains nothing, so the round trip is done
//! once at load time and the LoRA adapters learn on top of the rounded
//! weights.

use std::str::FromStr;

use candle_core::{DType, Result, Tensor, D};

/// Supported weight-only schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightQuantizeAlgo {
    Int8,
    Int4,
}

impl WeightQuantizeAlgo {
    /// Largest representable magnitude.
    pub fn qmax(self) -> f64 {
        match self {
            Self::Int8 => 127.0,
            Self::Int4 => 7.0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Int8 => "weight_only_int8",
            Self::Int4 => "weight_only_int4",
        }
    }
}

impl FromStr for WeightQuantizeAlgo {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "weight_only_int8" => Ok(Self::Int8),
            "weight_only_int4" => Ok(Self::Int4),
            other => anyhow::bail!("unsupported weight_quantize_algo `{other}`"),
        }
    }
}

/// Quantise a 2-D `(out, in)` weight to integers; returns `(q, scale)`
/// with `q` in f32 and `scale` of shape `(out, 1)`.
pub fn absmax_quantize(w: &Tensor, algo: WeightQuantizeAlgo) -> Result<(Tensor, Tensor)> {
    let qmax = algo.qmax();
    let w = w.to_dtype(DType::F32)?;
    let absmax = w.abs()?.max_keepdim(D::Minus1)?;
    let scale = (absmax / qmax)?.maximum(1e-12f64)?;
    let q = w.broadcast_div(&scale)?.round()?.clamp(-qmax, qmax)?;
    Ok((q, scale))
}

/// Quantise-dequantise, keeping the input dtype. The result carries no graph.
pub fn fake_quantize(w: &Tensor, algo: WeightQuantizeAlgo) -> Result<Tensor> {
    let dtype = w.dtype();
    let (q, scale) = absmax_quantize(&w.detach(), algo)?;
    q.broadcast_mul(&scale)?.to_dtype(dtype)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn int8_round_trip_error_is_bounded() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[0.9f32, -0.45, 0.1, 0.0], [-2.0, 1.0, 0.5, 0.25]], &dev).unwrap();
        let dq = fake_quantize(&w, WeightQuantizeAlgo::Int8).unwrap();
        let a = w.to_vec2::<f32>().unwrap();
        let b = dq.to_vec2::<f32>().unwrap();
        for (row_a, row_b) in a.iter().zip(&b) {
            let absmax = row_a.iter().fold(0f32, |m, v| m.max(v.abs()));
            let half_step = absmax / 127.0 / 2.0 + 1e-6;
            for (x, y) in row_a.iter().zip(row_b) {
                assert!((x - y).abs() <= half_step, "{x} vs {y}");
            }
        }
    }

    #[test]
    fn int4_uses_fifteen_levels() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[1.0f32, -1.0, 0.6, 0.07, -0.3]], &dev).unwrap();
        let (q, scale) = absmax_quantize(&w, WeightQuantizeAlgo::Int4).unwrap();
        assert_eq!(q.to_vec2::<f32>().unwrap(), vec![vec![7.0, -7.0, 4.0, 0.0, -2.0]]);
        let s = scale.to_vec2::<f32>().unwrap()[0][0];
        assert!((s - 1.0 / 7.0).abs() < 1e-6);
    }

    #[test]
    fn zero_rows_stay_zero() {
        let w = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let dq = fake_quantize(&w, WeightQuantizeAlgo::Int8).unwrap();
        assert_eq!(dq.to_vec2::<f32>().unwrap(), vec![vec![0.0; 3]; 2]);
    }

    #[test]
    fn parses_algo_names() {
        assert_eq!(
            "weight_only_int4".parse::<WeightQuantizeAlgo>().unwrap(),
            WeightQuantizeAlgo::Int4
        );
        assert!("nf4".parse::<WeightQuantizeAlgo>().is_err());
    }
}
