//! # Ember
//!
//! Text generation with decoder-only ALiBi language models.
//!
//! Ember wraps [`ember_core`] with a thread-safe [`Engine`] that runs the
//! full prompt -> completion loop:
//! - **Prompt prefill** in configurable batches
//! - **Sampling** with repetition penalty, temperature, top-k and top-p
//! - **Streaming** of each generated piece to a callback
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ember::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder()
//!         .model_path("model.bin")
//!         .seed(42)
//!         .build()?;
//!
//!     let result = engine
//!         .generate("def fibonacci(n):")
//!         .max_tokens(64)
//!         .on_token(|piece| {
//!             print!("{piece}");
//!             true
//!         })
//!         .execute()?;
//!
//!     println!("\n{} tokens", result.num_generated_tokens);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use ember_core::*;

mod engine;

pub use engine::{Engine, EngineBuilder, GenerateRequest, GenerateResult, StopReason};

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{Engine, EngineBuilder, GenerateRequest, GenerateResult, StopReason};
    pub use ember_core::prelude::*;

    pub use anyhow;
    pub use tracing;
}
