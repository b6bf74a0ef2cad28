//! Layer normalization without a bias term.
//!
//! # Formula
//!
//! `LayerNorm(x) = (x - mean(x)) / sqrt(var(x) + eps) * weight`

use crate::error::{EmberError, Result};
use candle_core::{DType, Device, Tensor, D};

/// Epsilon used by every norm in the model.
pub const LAYER_NORM_EPS: f64 = 1e-5;

/// Layer normalization with a learned scale.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// Scale parameter, `[hidden_size]`.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl LayerNorm {
    /// Create a norm from a loaded scale vector.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        if weight.rank() != 1 {
            return Err(EmberError::InvalidHyperparameters(format!(
                "norm weight must be 1-D, got shape {:?}",
                weight.dims()
            )));
        }
        Ok(Self { weight, eps })
    }

    /// Create a norm with unit scale (for testing).
    pub fn ones(hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, DType::F32, device)?;
        Ok(Self { weight, eps })
    }

    /// Normalize over the last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let inv_std = (var + self.eps)?.sqrt()?.recip()?;
        let normalized = centered.broadcast_mul(&inv_std)?;
        Ok(normalized.broadcast_mul(&self.weight)?)
    }

    /// Width of the normalized dimension.
    pub fn hidden_size(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Get the scale tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_has_zero_mean_unit_variance() {
        let norm = LayerNorm::ones(16, LAYER_NORM_EPS, &Device::Cpu).unwrap();
        let x = Tensor::randn(3.0f32, 2.0, &[4, 16], &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.dims(), &[4, 16]);

        for row in y.to_vec2::<f32>().unwrap() {
            let mean: f32 = row.iter().sum::<f32>() / 16.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 16.0;
            assert!(mean.abs() < 1e-4, "mean {mean}");
            assert!((var - 1.0).abs() < 1e-2, "var {var}");
        }
    }

    #[test]
    fn constant_row_normalizes_to_zero() {
        let norm = LayerNorm::ones(8, LAYER_NORM_EPS, &Device::Cpu).unwrap();
        let x = Tensor::full(2.5f32, (1, 8), &Device::Cpu).unwrap();
        let y: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(y.iter().all(|v| v.abs() < 1e-4));
    }

    #[test]
    fn scale_is_applied() {
        let weight = Tensor::new(&[2.0f32, 2.0, 2.0, 2.0], &Device::Cpu).unwrap();
        let norm = LayerNorm::new(weight, LAYER_NORM_EPS).unwrap();
        let x = Tensor::new(&[[1.0f32, -1.0, 1.0, -1.0]], &Device::Cpu).unwrap();
        let y: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (got, want) in y.iter().zip([2.0f32, -2.0, 2.0, -2.0]) {
            assert!((got - want).abs() < 1e-3, "{got} vs {want}");
        }
        assert_eq!(norm.hidden_size(), 4);
    }

    #[test]
    fn rejects_matrix_weight() {
        let weight = Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(LayerNorm::new(weight, LAYER_NORM_EPS).is_err());
    }
}
