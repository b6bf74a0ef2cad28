//! Model loading and inference.
//!
//! Provides the pieces of the decoder-only ALiBi transformer:
//! - Hyperparameters and weight encodings
//! - Unigram tokenizer
//! - Checkpoint loading
//! - Forward pass with an incremental KV cache

mod alibi;
mod config;
mod kv_cache;
mod layer;
mod layernorm;
mod loader;
mod mlp;
mod tokenizer;
mod transformer;

pub use alibi::{alibi_slopes, Alibi, ALIBI_MAX_BIAS};
pub use config::{
    byte_footprint, dtype_from_tag, FloatEncoding, Hyperparameters, ModelMetadata,
    QNT_VERSION_FACTOR,
};
pub use kv_cache::KvCache;
pub use layer::{Attention, DecoderLayer};
pub use layernorm::{LayerNorm, LAYER_NORM_EPS};
pub use loader::{
    block_tensor_name, planned_tensors, Checkpoint, TensorSpec, WeightArena, BLOCK_ROLES,
    FINAL_NORM, MAGIC, SLOT_ALIGN, TENSOR_OVERHEAD, TOKEN_EMBEDDING,
};
pub use mlp::GeluMlp;
pub use tokenizer::{Tokenizer, VocabEntry, UNKNOWN_TOKEN, WORD_BOUNDARY};
pub use transformer::{LogitsMode, Model, ScratchArena};
