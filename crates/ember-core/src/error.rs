//! Error types for Ember Core.

use thiserror::Error;

/// Result type alias for Ember operations.
pub type Result<T> = std::result::Result<T, EmberError>;

/// Broad failure classes, used by callers to decide how to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or inconsistent checkpoint data. Loading is aborted.
    Format,
    /// Backend or arena allocation failure.
    Resource,
    /// A caller-provided bound was exceeded: truncate or resize and retry.
    Capacity,
    /// The caller violated an API precondition.
    Contract,
    /// Underlying I/O failure.
    Io,
    /// Failure reported by the tensor backend.
    Backend,
}

/// Errors that can occur in Ember operations.
#[derive(Error, Debug)]
pub enum EmberError {
    /// The stream does not start with the checkpoint magic.
    #[error("bad magic: expected 0x67676d6c, found {found:#010x}")]
    BadMagic {
        /// Value found at the start of the stream.
        found: u32,
    },

    /// Hyperparameters are out of range or inconsistent.
    #[error("invalid hyperparameters: {0}")]
    InvalidHyperparameters(String),

    /// The encoded float type does not name a known weight encoding.
    #[error("bad float type value {0}")]
    UnknownFloatType(i32),

    /// A tensor record carries an unknown element type tag.
    #[error("tensor '{name}' has unknown type tag {tag}")]
    UnknownTensorType {
        /// Tensor name.
        name: String,
        /// Type tag found in the record.
        tag: i32,
    },

    /// A tensor record names a tensor the model does not have.
    #[error("unknown tensor '{0}' in model file")]
    UnknownTensor(String),

    /// The same tensor appears twice in the stream.
    #[error("tensor '{0}' appears more than once in model file")]
    DuplicateTensor(String),

    /// The stream ended before every tensor was read.
    #[error("tensor '{0}' missing from model file")]
    MissingTensor(String),

    /// A tensor record declares a dimension count other than 1 or 2.
    ///
    /// Raised before the record's name is read.
    #[error("tensor record has {n_dims} dimensions, expected 1 or 2")]
    TooManyDimensions {
        /// Declared dimension count.
        n_dims: i32,
    },

    /// Declared extents disagree with the expected tensor shape.
    #[error("tensor '{name}' has wrong shape in model file: got {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        /// Tensor name.
        name: String,
        /// Expected extents, innermost first.
        expected: [usize; 2],
        /// Extents found in the record, innermost first.
        actual: [usize; 2],
    },

    /// Declared byte size disagrees with the expected tensor footprint.
    #[error("tensor '{name}' has wrong size in model file: got {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Tensor name.
        name: String,
        /// Expected byte footprint.
        expected: usize,
        /// Byte size implied by the record.
        actual: usize,
    },

    /// The stream ended in the middle of a record.
    #[error("unexpected end of stream while reading {0}")]
    Truncated(String),

    /// A vocabulary record is malformed.
    #[error("invalid vocabulary: {0}")]
    InvalidVocab(String),

    /// Arena or buffer allocation failed.
    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory {
        /// Requested allocation in bytes.
        requested: usize,
    },

    /// Tokenized text does not fit in the caller's buffer.
    #[error("too many tokens: {n_tokens} tokens, capacity {capacity}")]
    TooManyTokens {
        /// Number of tokens the text encodes to.
        n_tokens: usize,
        /// Caller-provided capacity.
        capacity: usize,
    },

    /// The evaluation window runs past the context length.
    #[error("context overflow: n_past {n_past} + {n_tokens} tokens exceeds max sequence length {max}")]
    ContextOverflow {
        /// Cache cursor.
        n_past: usize,
        /// Tokens in the window.
        n_tokens: usize,
        /// Maximum sequence length of the model.
        max: usize,
    },

    /// An evaluation was requested with no tokens.
    #[error("evaluate called with an empty token window")]
    EmptyBatch,

    /// A token id outside the vocabulary.
    #[error("unknown token id {0}")]
    UnknownToken(u32),

    /// Sampling parameters are degenerate.
    #[error("invalid sampling parameters: {0}")]
    InvalidSampling(String),

    /// Sampling was requested before any evaluation produced logits.
    #[error("no logits available, call evaluate first")]
    NoLogits,

    /// Worker pool construction failed.
    #[error("thread pool error: {0}")]
    ThreadPool(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parse error.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl EmberError {
    /// Failure class of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BadMagic { .. }
            | Self::InvalidHyperparameters(_)
            | Self::UnknownFloatType(_)
            | Self::UnknownTensorType { .. }
            | Self::UnknownTensor(_)
            | Self::DuplicateTensor(_)
            | Self::MissingTensor(_)
            | Self::TooManyDimensions { .. }
            | Self::ShapeMismatch { .. }
            | Self::SizeMismatch { .. }
            | Self::Truncated(_)
            | Self::InvalidVocab(_) => ErrorCategory::Format,
            Self::OutOfMemory { .. } | Self::ThreadPool(_) => ErrorCategory::Resource,
            Self::TooManyTokens { .. } | Self::ContextOverflow { .. } => ErrorCategory::Capacity,
            Self::EmptyBatch
            | Self::UnknownToken(_)
            | Self::InvalidSampling(_)
            | Self::NoLogits
            | Self::Config(_) => ErrorCategory::Contract,
            Self::Io(_) => ErrorCategory::Io,
            Self::Tensor(_) => ErrorCategory::Backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(EmberError::BadMagic { found: 0 }.category(), ErrorCategory::Format);
        assert_eq!(
            EmberError::OutOfMemory { requested: 1 }.category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            EmberError::TooManyTokens { n_tokens: 9, capacity: 4 }.category(),
            ErrorCategory::Capacity
        );
        assert_eq!(EmberError::NoLogits.category(), ErrorCategory::Contract);
    }

    #[test]
    fn bad_magic_message() {
        let err = EmberError::BadMagic { found: 0x1234 };
        assert_eq!(err.to_string(), "bad magic: expected 0x67676d6c, found 0x00001234");
    }
}
