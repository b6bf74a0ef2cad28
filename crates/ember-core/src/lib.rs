//! # Ember Core
//!
//! Inference core for decoder-only transformers with ALiBi attention,
//! fused QKV projections and tied input/output embeddings.
//!
//! This crate provides:
//! - **Checkpoint loader** with strict shape and size validation
//! - **Unigram tokenizer** with best-path segmentation
//! - **Forward pass** over a preallocated incremental KV cache
//! - **Sampler** with repetition penalty, temperature, top-k and top-p
//! - **Session** binding the above to one sequence

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod model;
pub mod sampling;
pub mod session;

#[cfg(any(test, feature = "test-fixtures"))]
#[doc(hidden)]
pub mod testing;

pub use config::{GenerationConfig, SessionParams};
pub use error::{EmberError, ErrorCategory, Result};
pub use session::{Session, Timings};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{GenerationConfig, SessionParams};
    pub use crate::error::{EmberError, ErrorCategory, Result};
    pub use crate::model::{Checkpoint, Hyperparameters, Model, Tokenizer};
    pub use crate::sampling::{RepeatPenalty, Sampler, SamplingParams};
    pub use crate::session::{Session, Timings};
}
