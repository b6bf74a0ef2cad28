//! Attention with Linear Biases (ALiBi).
//!
//! Instead of position embeddings each head adds `slope * (key_pos - query_pos)`
//! to its attention scores, so distant keys are penalized linearly. Keys past
//! the query position are masked with `-inf`.
//!
//! # Reference
//!
//! [Train Short, Test Long](https://arxiv.org/abs/2108.12409)

use crate::error::Result;
use candle_core::{Device, Tensor};

/// Maximum bias used to derive the head slopes.
pub const ALIBI_MAX_BIAS: f32 = 8.0;

/// Per-head ALiBi slopes.
///
/// For head counts that are not a power of two the first `m` heads (largest
/// power of two below `n_heads`) take the geometric series for `m`, the rest
/// interleave the series for `2m`.
pub fn alibi_slopes(n_heads: usize, max_bias: f32) -> Vec<f32> {
    if n_heads == 0 {
        return Vec::new();
    }
    let m = 1usize << (usize::BITS - 1 - n_heads.leading_zeros());
    let m0 = 2f32.powf(-max_bias / m as f32);
    let m1 = 2f32.powf(-(max_bias / 2.0) / m as f32);

    (0..n_heads)
        .map(|h| {
            if h < m {
                m0.powi(h as i32 + 1)
            } else {
                m1.powi(2 * (h - m) as i32 + 1)
            }
        })
        .collect()
}

/// ALiBi bias generator for one model.
#[derive(Debug, Clone)]
pub struct Alibi {
    slopes: Vec<f32>,
}

impl Alibi {
    /// Precompute slopes for `n_heads` heads.
    pub fn new(n_heads: usize) -> Self {
        Self {
            slopes: alibi_slopes(n_heads, ALIBI_MAX_BIAS),
        }
    }

    /// Head slopes.
    pub fn slopes(&self) -> &[f32] {
        &self.slopes
    }

    /// Number of `f32` values in the bias for a window.
    pub fn bias_len(&self, n_past: usize, n_tokens: usize) -> usize {
        self.slopes.len() * n_tokens * (n_past + n_tokens)
    }

    /// Write the combined bias and causal mask into `buf`.
    ///
    /// Layout is `[n_heads, n_tokens, n_past + n_tokens]`. Query `i` sits at
    /// absolute position `n_past + i`.
    pub fn fill(&self, n_past: usize, n_tokens: usize, buf: &mut Vec<f32>) {
        let total = n_past + n_tokens;
        buf.clear();
        for &slope in &self.slopes {
            for i in 0..n_tokens {
                let query_pos = n_past + i;
                for key_pos in 0..total {
                    if key_pos > query_pos {
                        buf.push(f32::NEG_INFINITY);
                    } else {
                        buf.push(-slope * (query_pos - key_pos) as f32);
                    }
                }
            }
        }
    }

    /// Build the bias as a `[n_heads, n_tokens, n_past + n_tokens]` tensor,
    /// staging it through `buf`.
    pub fn bias(
        &self,
        n_past: usize,
        n_tokens: usize,
        buf: &mut Vec<f32>,
        device: &Device,
    ) -> Result<Tensor> {
        self.fill(n_past, n_tokens, buf);
        let shape = (self.slopes.len(), n_tokens, n_past + n_tokens);
        Ok(Tensor::from_slice(buf.as_slice(), shape, device)?)
    }
}
