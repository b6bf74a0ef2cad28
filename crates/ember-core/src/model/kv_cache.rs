//! Fixed-capacity KV cache for incremental decoding.
//!
//! Keys and values for every layer live in two preallocated tensors of
//! shape `[n_layers * max_seq_len, embedding_dim]`. Row
//! `layer * max_seq_len + pos` holds position `pos` of `layer`. Each forward
//! pass writes rows `[n_past, n_past + N)` in place and reads back
//! `[0, n_past + N)`.

use crate::error::{EmberError, Result};
use candle_core::{DType, Device, Tensor};

/// Preallocated key/value storage for all layers.
#[derive(Debug)]
pub struct KvCache {
    /// Cached keys.
    keys: Tensor,
    /// Cached values.
    values: Tensor,
    /// Number of layers.
    n_layers: usize,
    /// Positions per layer.
    max_seq_len: usize,
    /// Row width.
    dim: usize,
}

impl KvCache {
    /// Allocate a zeroed cache.
    ///
    /// `f16` selects half precision storage; otherwise F32.
    pub fn new(
        n_layers: usize,
        max_seq_len: usize,
        dim: usize,
        f16: bool,
        device: &Device,
    ) -> Result<Self> {
        let dtype = if f16 { DType::F16 } else { DType::F32 };
        let rows = n_layers * max_seq_len;
        let keys = Tensor::zeros((rows, dim), dtype, device)?;
        let values = Tensor::zeros((rows, dim), dtype, device)?;
        Ok(Self {
            keys,
            values,
            n_layers,
            max_seq_len,
            dim,
        })
    }

    fn check_range(&self, layer: usize, start: usize, len: usize) -> Result<()> {
        if layer >= self.n_layers {
            return Err(EmberError::InvalidHyperparameters(format!(
                "layer {layer} out of range for {} layers",
                self.n_layers
            )));
        }
        if start + len > self.max_seq_len {
            return Err(EmberError::ContextOverflow {
                n_past: start,
                n_tokens: len,
                max: self.max_seq_len,
            });
        }
        Ok(())
    }

    /// Write `[N, dim]` keys and values for `layer` at positions
    /// `[n_past, n_past + N)`.
    pub fn store(&mut self, layer: usize, n_past: usize, keys: &Tensor, values: &Tensor) -> Result<()> {
        let n = keys.dims()[0];
        self.check_range(layer, n_past, n)?;
        let offset = layer * self.max_seq_len + n_past;
        let dtype = self.keys.dtype();
        // slice_set needs contiguous sources of the cache dtype.
        let keys = keys.to_dtype(dtype)?.contiguous()?;
        let values = values.to_dtype(dtype)?.contiguous()?;
        self.keys.slice_set(&keys, 0, offset)?;
        self.values.slice_set(&values, 0, offset)?;
        Ok(())
    }

    /// Read back positions `[0, len)` of `layer` as F32 `[len, dim]` tensors.
    pub fn window(&self, layer: usize, len: usize) -> Result<(Tensor, Tensor)> {
        self.check_range(layer, 0, len)?;
        let offset = layer * self.max_seq_len;
        let keys = self.keys.narrow(0, offset, len)?.to_dtype(DType::F32)?;
        let values = self.values.narrow(0, offset, len)?.to_dtype(DType::F32)?;
        Ok((keys, values))
    }

    /// Storage element type.
    pub fn dtype(&self) -> DType {
        self.keys.dtype()
    }

    /// Positions per layer.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Number of layers.
    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    /// Total bytes held by keys and values.
    pub fn size_bytes(&self) -> usize {
        2 * self.n_layers * self.max_seq_len * self.dim * self.dtype().size_in_bytes()
    }
}
