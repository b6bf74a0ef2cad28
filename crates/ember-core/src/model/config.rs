//! Model hyperparameters and weight encodings.

use crate::error::{EmberError, Result};
use candle_core::quantized::GgmlDType;
use serde::{Deserialize, Serialize};

/// Multiplier folding the quantization version into the encoded float type.
pub const QNT_VERSION_FACTOR: i32 = 1000;

/// Numeric encoding declared for the large weight matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatEncoding {
    /// Every tensor is F32.
    AllF32,
    /// Matrices are F16.
    MostlyF16,
    /// Matrices are Q4_0.
    MostlyQ4_0,
    /// Matrices are Q4_1.
    MostlyQ4_1,
    /// Matrices are Q4_1 with some F16 tensors (read as Q4_1).
    MostlyQ4_1SomeF16,
    /// Matrices are Q8_0.
    MostlyQ8_0,
    /// Matrices are Q5_0.
    MostlyQ5_0,
    /// Matrices are Q5_1.
    MostlyQ5_1,
    /// Matrices are Q2_K.
    MostlyQ2K,
    /// Matrices are Q3_K.
    MostlyQ3K,
    /// Matrices are Q4_K.
    MostlyQ4K,
    /// Matrices are Q5_K.
    MostlyQ5K,
    /// Matrices are Q6_K.
    MostlyQ6K,
}

impl FloatEncoding {
    /// Decode the raw value (quantization version already stripped).
    pub fn from_raw(raw: i32) -> Result<Self> {
        let encoding = match raw {
            0 => Self::AllF32,
            1 => Self::MostlyF16,
            2 => Self::MostlyQ4_0,
            3 => Self::MostlyQ4_1,
            4 => Self::MostlyQ4_1SomeF16,
            7 => Self::MostlyQ8_0,
            8 => Self::MostlyQ5_0,
            9 => Self::MostlyQ5_1,
            10 => Self::MostlyQ2K,
            11 => Self::MostlyQ3K,
            12 => Self::MostlyQ4K,
            13 => Self::MostlyQ5K,
            14 => Self::MostlyQ6K,
            other => return Err(EmberError::UnknownFloatType(other)),
        };
        Ok(encoding)
    }

    /// Raw value as stored in the checkpoint (without quantization version).
    pub fn as_raw(self) -> i32 {
        match self {
            Self::AllF32 => 0,
            Self::MostlyF16 => 1,
            Self::MostlyQ4_0 => 2,
            Self::MostlyQ4_1 => 3,
            Self::MostlyQ4_1SomeF16 => 4,
            Self::MostlyQ8_0 => 7,
            Self::MostlyQ5_0 => 8,
            Self::MostlyQ5_1 => 9,
            Self::MostlyQ2K => 10,
            Self::MostlyQ3K => 11,
            Self::MostlyQ4K => 12,
            Self::MostlyQ5K => 13,
            Self::MostlyQ6K => 14,
        }
    }

    /// Storage element type of the weight matrices.
    pub fn weight_dtype(self) -> GgmlDType {
        match self {
            Self::AllF32 => GgmlDType::F32,
            Self::MostlyF16 => GgmlDType::F16,
            Self::MostlyQ4_0 => GgmlDType::Q4_0,
            Self::MostlyQ4_1 | Self::MostlyQ4_1SomeF16 => GgmlDType::Q4_1,
            Self::MostlyQ8_0 => GgmlDType::Q8_0,
            Self::MostlyQ5_0 => GgmlDType::Q5_0,
            Self::MostlyQ5_1 => GgmlDType::Q5_1,
            Self::MostlyQ2K => GgmlDType::Q2K,
            Self::MostlyQ3K => GgmlDType::Q3K,
            Self::MostlyQ4K => GgmlDType::Q4K,
            Self::MostlyQ5K => GgmlDType::Q5K,
            Self::MostlyQ6K => GgmlDType::Q6K,
        }
    }
}

/// Element type for a tensor record type tag.
pub fn dtype_from_tag(tag: i32) -> Option<GgmlDType> {
    let dtype = match tag {
        0 => GgmlDType::F32,
        1 => GgmlDType::F16,
        2 => GgmlDType::Q4_0,
        3 => GgmlDType::Q4_1,
        6 => GgmlDType::Q5_0,
        7 => GgmlDType::Q5_1,
        8 => GgmlDType::Q8_0,
        9 => GgmlDType::Q8_1,
        10 => GgmlDType::Q2K,
        11 => GgmlDType::Q3K,
        12 => GgmlDType::Q4K,
        13 => GgmlDType::Q5K,
        14 => GgmlDType::Q6K,
        15 => GgmlDType::Q8K,
        _ => return None,
    };
    Some(dtype)
}

/// Byte footprint of `n_elements` values of `dtype`.
///
/// Returns `None` when the count is not a whole number of blocks or the
/// size does not fit in `usize`.
pub fn byte_footprint(dtype: GgmlDType, n_elements: usize) -> Option<usize> {
    let block = dtype.block_size();
    if n_elements % block != 0 {
        return None;
    }
    (n_elements / block).checked_mul(dtype.type_size())
}

/// Transformer hyperparameters as stored in the checkpoint header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hyperparameters {
    /// Model (embedding) dimension.
    pub embedding_dim: usize,
    /// Context length; also the KV cache capacity.
    pub max_sequence_len: usize,
    /// Number of attention heads.
    pub n_heads: usize,
    /// Number of transformer blocks.
    pub n_layers: usize,
    /// Vocabulary size.
    pub n_vocab: usize,
    /// Weight encoding.
    pub float_encoding: FloatEncoding,
}

impl Hyperparameters {
    /// Decode the six header fields.
    ///
    /// Returns the hyperparameters and the quantization version folded into
    /// the float type field.
    pub fn from_header(fields: [i32; 6]) -> Result<(Self, i32)> {
        let [d_model, max_seq_len, n_heads, n_layers, n_vocab, ftype] = fields;

        let positive = |name: &str, v: i32| -> Result<usize> {
            if v <= 0 {
                return Err(EmberError::InvalidHyperparameters(format!(
                    "{name} must be > 0, got {v}"
                )));
            }
            Ok(v as usize)
        };

        let quant_version = ftype / QNT_VERSION_FACTOR;
        let float_encoding = FloatEncoding::from_raw(ftype % QNT_VERSION_FACTOR)?;

        let hparams = Self {
            embedding_dim: positive("embedding_dim", d_model)?,
            max_sequence_len: positive("max_sequence_len", max_seq_len)?,
            n_heads: positive("n_heads", n_heads)?,
            n_layers: positive("n_layers", n_layers)?,
            n_vocab: positive("n_vocab", n_vocab)?,
            float_encoding,
        };
        hparams.validate()?;
        Ok((hparams, quant_version))
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.n_heads == 0 || self.embedding_dim % self.n_heads != 0 {
            return Err(EmberError::InvalidHyperparameters(format!(
                "embedding_dim ({}) must be divisible by n_heads ({})",
                self.embedding_dim, self.n_heads
            )));
        }
        if self.embedding_dim.checked_mul(4).is_none() {
            return Err(EmberError::InvalidHyperparameters(format!(
                "embedding_dim ({}) is too large",
                self.embedding_dim
            )));
        }
        Ok(())
    }

    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        self.embedding_dim / self.n_heads
    }

    /// Inner width of the MLP.
    pub fn mlp_dim(&self) -> usize {
        4 * self.embedding_dim
    }
}

/// Architecture-independent facts about a loaded model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    /// Header hyperparameters.
    pub hparams: Hyperparameters,
    /// Quantization version folded into the float type field.
    pub quant_version: i32,
    /// Number of tensor records read.
    pub n_tensors: usize,
    /// Total payload bytes read.
    pub bytes_loaded: usize,
}
