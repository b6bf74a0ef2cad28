//! Decoder-only ALiBi transformer and its forward pass.

use super::{Alibi, DecoderLayer, Hyperparameters, KvCache, LayerNorm, ModelMetadata};
use crate::error::{EmberError, Result};
use candle_core::quantized::QMatMul;
use candle_core::{Device, Module, Tensor};
use tracing::debug;

/// Headroom applied whenever the scratch arena grows.
const SCRATCH_HEADROOM: f64 = 1.1;

/// Which positions produce logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogitsMode {
    /// Only the final position, `n_vocab` values.
    Last,
    /// Every position in the window, `n_vocab * N` values.
    All,
}

/// Reusable host-side buffer for per-call staging data.
///
/// Sized from the bytes-per-token observed on the first call. Whenever a
/// later call needs more than the current capacity it grows to the required
/// size plus 10%.
///
/// Only the host-side staging lives here: the ALiBi bias block and the
/// logits count. Tensor intermediates of the forward pass are allocated by
/// candle and are not governed by this policy, so `mem_per_token` measures
/// the staging footprint, not the whole working set.
#[derive(Debug, Default)]
pub struct ScratchArena {
    buf: Vec<f32>,
    mem_per_token: usize,
}

impl ScratchArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes per token measured on the first call, 0 before it.
    pub fn mem_per_token(&self) -> usize {
        self.mem_per_token
    }

    /// Current capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.buf.capacity() * std::mem::size_of::<f32>()
    }

    /// Make room for `needed` floats of staging for an `n_tokens` window.
    fn prepare(&mut self, n_tokens: usize, needed: usize) -> Result<&mut Vec<f32>> {
        let float = std::mem::size_of::<f32>();
        let estimate = self.mem_per_token * n_tokens;
        let required = estimate.max(needed * float);

        if required > self.capacity_bytes() {
            let target = (required as f64 * SCRATCH_HEADROOM) as usize;
            let floats = target.div_ceil(float);
            self.buf.clear();
            self.buf
                .try_reserve_exact(floats)
                .map_err(|_| EmberError::OutOfMemory { requested: target })?;
            debug!(
                bytes = self.capacity_bytes(),
                n_tokens, "grew scratch arena"
            );
        }
        Ok(&mut self.buf)
    }

    /// Record usage of the first call.
    fn observe(&mut self, n_tokens: usize, used_bytes: usize) {
        if self.mem_per_token == 0 && n_tokens > 0 {
            self.mem_per_token = used_bytes / n_tokens;
        }
    }
}

/// Model parameters, immutable after load.
#[derive(Debug)]
pub struct Model {
    /// Load-time facts.
    metadata: ModelMetadata,
    /// Token embedding table, `[n_vocab, hidden]`, dense for lookups.
    wte: Tensor,
    /// The same table used as the output projection.
    lm_head: QMatMul,
    /// Decoder blocks.
    layers: Vec<DecoderLayer>,
    /// Final norm.
    norm_f: LayerNorm,
    /// Positional bias.
    alibi: Alibi,
    /// Device for computation.
    device: Device,
}

impl Model {
    /// Assemble a model from loaded parts.
    pub fn new(
        metadata: ModelMetadata,
        wte: Tensor,
        lm_head: QMatMul,
        layers: Vec<DecoderLayer>,
        norm_f: LayerNorm,
        device: Device,
    ) -> Self {
        let alibi = Alibi::new(metadata.hparams.n_heads);
        Self {
            metadata,
            wte,
            lm_head,
            layers,
            norm_f,
            alibi,
            device,
        }
    }

    /// Get hyperparameters.
    pub fn hparams(&self) -> &Hyperparameters {
        &self.metadata.hparams
    }

    /// Get load-time metadata.
    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// Get device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Get the decoder blocks.
    pub fn layers(&self) -> &[DecoderLayer] {
        &self.layers
    }

    /// Allocate a cache sized for this model.
    pub fn new_cache(&self, f16: bool) -> Result<KvCache> {
        let hp = self.hparams();
        KvCache::new(
            hp.n_layers,
            hp.max_sequence_len,
            hp.embedding_dim,
            f16,
            &self.device,
        )
    }

    /// Check a window before it touches the cache.
    pub fn validate_window(&self, tokens: &[u32], n_past: usize) -> Result<()> {
        let hp = self.hparams();
        if tokens.is_empty() {
            return Err(EmberError::EmptyBatch);
        }
        if n_past + tokens.len() > hp.max_sequence_len {
            return Err(EmberError::ContextOverflow {
                n_past,
                n_tokens: tokens.len(),
                max: hp.max_sequence_len,
            });
        }
        if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= hp.n_vocab) {
            return Err(EmberError::UnknownToken(bad));
        }
        Ok(())
    }

    /// Run one forward pass over `tokens` at positions `[n_past, n_past + N)`.
    ///
    /// Writes keys and values for the window into `cache` and returns the
    /// logits selected by `mode`, row-major by position.
    pub fn forward(
        &self,
        tokens: &[u32],
        n_past: usize,
        cache: &mut KvCache,
        scratch: &mut ScratchArena,
        mode: LogitsMode,
    ) -> Result<Vec<f32>> {
        self.validate_window(tokens, n_past)?;
        let n = tokens.len();

        let bias_len = self.alibi.bias_len(n_past, n);
        let buf = scratch.prepare(n, bias_len)?;
        let bias = self.alibi.bias(n_past, n, buf, &self.device)?;

        let ids = Tensor::from_slice(tokens, n, &self.device)?;
        let mut hidden = self.wte.index_select(&ids, 0)?;
        for (il, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, cache, il, n_past, &bias)?;
        }
        let hidden = self.norm_f.forward(&hidden)?;

        let hidden = match mode {
            LogitsMode::All => hidden,
            LogitsMode::Last => hidden.narrow(0, n - 1, 1)?,
        };
        let logits = self.lm_head.forward(&hidden.contiguous()?)?;
        let logits = logits.flatten_all()?.to_vec1::<f32>()?;

        let used = (bias_len + logits.len()) * std::mem::size_of::<f32>();
        scratch.observe(n, used);

        Ok(logits)
    }
}
