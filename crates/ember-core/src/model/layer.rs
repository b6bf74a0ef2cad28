//! Decoder block.
//!
//! A single block combining:
//! - Pre-attention LayerNorm
//! - Fused QKV self-attention with ALiBi bias and the KV cache
//! - Pre-MLP LayerNorm
//! - GELU MLP

use super::{GeluMlp, KvCache, LayerNorm};
use crate::error::Result;
use candle_core::quantized::QMatMul;
use candle_core::{Device, Module, Tensor, D};

/// Fused-QKV multi-head self-attention.
#[derive(Debug, Clone)]
pub struct Attention {
    /// Combined projection: [3 * hidden_size, hidden_size]
    wqkv: QMatMul,
    /// Output projection: [hidden_size, hidden_size]
    out_proj: QMatMul,
    /// Number of attention heads.
    n_heads: usize,
    /// Head dimension.
    head_dim: usize,
}

impl Attention {
    /// Create attention from loaded projections.
    pub fn new(wqkv: QMatMul, out_proj: QMatMul, n_heads: usize, head_dim: usize) -> Self {
        Self {
            wqkv,
            out_proj,
            n_heads,
            head_dim,
        }
    }

    /// Create attention with random dense weights (for testing).
    pub fn random(hidden_size: usize, n_heads: usize, device: &Device) -> Result<Self> {
        let wqkv = Tensor::randn(0.0f32, 0.2, &[3 * hidden_size, hidden_size], device)?;
        let out_proj = Tensor::randn(0.0f32, 0.2, &[hidden_size, hidden_size], device)?;
        Ok(Self {
            wqkv: QMatMul::Tensor(wqkv),
            out_proj: QMatMul::Tensor(out_proj),
            n_heads,
            head_dim: hidden_size / n_heads,
        })
    }

    fn hidden_size(&self) -> usize {
        self.n_heads * self.head_dim
    }

    /// Run attention for `[N, hidden]` normalized inputs at positions
    /// `[n_past, n_past + N)`.
    ///
    /// Writes this window's keys and values into `cache` first, then attends
    /// over `[0, n_past + N)`. `bias` is `[n_heads, N, n_past + N]` and
    /// already carries the causal mask.
    ///
    /// Returns the projected output `[N, hidden]` and the post-softmax
    /// weights `[n_heads, N, n_past + N]`.
    fn attend(
        &self,
        x: &Tensor,
        cache: &mut KvCache,
        layer_idx: usize,
        n_past: usize,
        bias: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let n = x.dims()[0];
        let d = self.hidden_size();
        let total = n_past + n;

        let qkv = self.wqkv.forward(&x.contiguous()?)?;
        let q = qkv.narrow(1, 0, d)?;
        let k = qkv.narrow(1, d, d)?;
        let v = qkv.narrow(1, 2 * d, d)?;

        cache.store(layer_idx, n_past, &k, &v)?;
        let (keys, values) = cache.window(layer_idx, total)?;

        // [tokens, hidden] -> [heads, tokens, head_dim]
        let q = q
            .reshape((n, self.n_heads, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()?;
        let keys = keys
            .reshape((total, self.n_heads, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()?;
        let values = values
            .reshape((total, self.n_heads, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&keys.t()?)? * scale)?;
        let scores = scores.broadcast_add(bias)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;

        // [heads, N, head_dim] -> [N, hidden]
        let context = probs.matmul(&values)?;
        let context = context.transpose(0, 1)?.contiguous()?.reshape((n, d))?;
        let output = self.out_proj.forward(&context)?;

        Ok((output, probs))
    }

    /// Get the number of heads.
    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

/// A single decoder block.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    /// Pre-attention layer norm.
    norm_1: LayerNorm,
    /// Self-attention.
    attention: Attention,
    /// Pre-MLP layer norm.
    norm_2: LayerNorm,
    /// MLP.
    mlp: GeluMlp,
}

impl DecoderLayer {
    /// Assemble a block from its parts.
    pub fn new(norm_1: LayerNorm, attention: Attention, norm_2: LayerNorm, mlp: GeluMlp) -> Self {
        Self {
            norm_1,
            attention,
            norm_2,
            mlp,
        }
    }

    /// Create a block with random weights (for testing).
    pub fn random(hidden_size: usize, n_heads: usize, device: &Device) -> Result<Self> {
        let eps = super::LAYER_NORM_EPS;
        Ok(Self {
            norm_1: LayerNorm::ones(hidden_size, eps, device)?,
            attention: Attention::random(hidden_size, n_heads, device)?,
            norm_2: LayerNorm::ones(hidden_size, eps, device)?,
            mlp: GeluMlp::random(hidden_size, 4 * hidden_size, device)?,
        })
    }

    /// Forward pass for `[N, hidden]` hidden states, updating `cache`.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        cache: &mut KvCache,
        layer_idx: usize,
        n_past: usize,
        bias: &Tensor,
    ) -> Result<Tensor> {
        let normed = self.norm_1.forward(hidden_states)?;
        let (attn_output, _) = self
            .attention
            .attend(&normed, cache, layer_idx, n_past, bias)?;
        let hidden_states = (hidden_states + attn_output)?;

        let normed = self.norm_2.forward(&hidden_states)?;
        let mlp_output = self.mlp.forward(&normed)?;
        Ok((hidden_states + mlp_output)?)
    }

    /// Post-softmax attention weights for a window, `[n_heads, N, n_past + N]`.
    ///
    /// Updates `cache` exactly as [`forward`](Self::forward) would.
    pub fn attention_weights(
        &self,
        hidden_states: &Tensor,
        cache: &mut KvCache,
        layer_idx: usize,
        n_past: usize,
        bias: &Tensor,
    ) -> Result<Tensor> {
        let normed = self.norm_1.forward(hidden_states)?;
        let (_, probs) = self
            .attention
            .attend(&normed, cache, layer_idx, n_past, bias)?;
        Ok(probs)
    }

    /// Get the attention module.
    pub fn attention(&self) -> &Attention {
        &self.attention
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Alibi;

    const HIDDEN: usize = 16;
    const HEADS: usize = 4;

    fn setup() -> (DecoderLayer, KvCache, Alibi) {
        let layer = DecoderLayer::random(HIDDEN, HEADS, &Device::Cpu).unwrap();
        let cache = KvCache::new(1, 16, HIDDEN, false, &Device::Cpu).unwrap();
        (layer, cache, Alibi::new(HEADS))
    }

    #[test]
    fn forward_shape() {
        let (layer, mut cache, alibi) = setup();
        let mut buf = Vec::new();
        let bias = alibi.bias(0, 6, &mut buf, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[6, HIDDEN], &Device::Cpu).unwrap();
        let y = layer.forward(&x, &mut cache, 0, 0, &bias).unwrap();
        assert_eq!(y.dims(), &[6, HIDDEN]);
    }

    #[test]
    fn attention_is_causal() {
        let (layer, mut cache, alibi) = setup();
        let mut buf = Vec::new();
        let device = Device::Cpu;

        let prefix = Tensor::randn(0.0f32, 1.0, &[3, HIDDEN], &device).unwrap();
        let bias = alibi.bias(0, 3, &mut buf, &device).unwrap();
        layer.forward(&prefix, &mut cache, 0, 0, &bias).unwrap();

        let n_past = 3;
        let x = Tensor::randn(0.0f32, 1.0, &[5, HIDDEN], &device).unwrap();
        let bias = alibi.bias(n_past, 5, &mut buf, &device).unwrap();
        let probs = layer
            .attention_weights(&x, &mut cache, 0, n_past, &bias)
            .unwrap();
        assert_eq!(probs.dims(), &[HEADS, 5, 8]);

        let probs: Vec<Vec<Vec<f32>>> = probs.to_vec3().unwrap();
        for head in &probs {
            for (i, row) in head.iter().enumerate() {
                for (j, &p) in row.iter().enumerate() {
                    if j > n_past + i {
                        assert_eq!(p, 0.0, "query {i} attends to future key {j}");
                    }
                }
                let sum: f32 = row.iter().sum();
                assert!((sum - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn attention_dims() {
        let (layer, _, _) = setup();
        assert_eq!(layer.attention().n_heads(), HEADS);
        assert_eq!(layer.attention().head_dim(), HIDDEN / HEADS);
    }
}
