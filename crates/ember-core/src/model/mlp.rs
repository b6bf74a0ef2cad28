//! GELU feed-forward block.
//!
//! # Formula
//!
//! `MLP(x) = gelu(x @ up_proj^T) @ down_proj^T`
//!
//! GELU uses the tanh approximation.

use crate::error::Result;
use candle_core::quantized::QMatMul;
use candle_core::{Device, Module, Tensor};

/// Two-layer MLP with a GELU in between.
#[derive(Debug, Clone)]
pub struct GeluMlp {
    /// Up projection: hidden -> 4 * hidden
    up_proj: QMatMul,
    /// Down projection: 4 * hidden -> hidden
    down_proj: QMatMul,
}

impl GeluMlp {
    /// Create an MLP from loaded projections.
    pub fn new(up_proj: QMatMul, down_proj: QMatMul) -> Self {
        Self { up_proj, down_proj }
    }

    /// Create an MLP with random dense weights (for testing).
    pub fn random(hidden_size: usize, intermediate_size: usize, device: &Device) -> Result<Self> {
        // [out_features, in_features]
        let up = Tensor::randn(0.0f32, 0.02, &[intermediate_size, hidden_size], device)?;
        let down = Tensor::randn(0.0f32, 0.02, &[hidden_size, intermediate_size], device)?;
        Ok(Self {
            up_proj: QMatMul::Tensor(up),
            down_proj: QMatMul::Tensor(down),
        })
    }

    /// Forward pass over `[n_tokens, hidden_size]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.up_proj.forward(&x.contiguous()?)?;
        let activated = hidden.gelu()?;
        Ok(self.down_proj.forward(&activated.contiguous()?)?)
    }
}
