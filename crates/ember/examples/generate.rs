//! Command-line completion example.
//!
//! Streams a completion for one prompt and prints a JSON summary.
//!
//! Run with:
//! ```bash
//! RUST_LOG=ember=info cargo run --release -p ember --example generate -- \
//!     /path/to/model.bin "def fibonacci(n):" [config.json]
//! ```

use anyhow::Result;
use ember::prelude::*;
use std::io::{self, Write};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        anyhow::bail!("usage: generate <checkpoint> <prompt> [config.json]");
    }

    let mut builder = Engine::builder().model_path(&args[1]);
    if let Some(config) = args.get(3) {
        builder = builder.config_file(config)?;
    }
    let engine = builder.build()?;

    let hp = engine.hparams();
    eprintln!(
        "model: {} layers, {} hidden, {} heads, context {}",
        hp.n_layers, hp.embedding_dim, hp.n_heads, hp.max_sequence_len
    );

    let mut stdout = io::stdout();
    print!("{}", args[2]);
    stdout.flush()?;

    let result = engine
        .generate(&args[2])
        .on_token(|piece| {
            print!("{piece}");
            stdout.flush().is_ok()
        })
        .execute()?;
    println!("\n");

    let summary = serde_json::json!({
        "prompt_tokens": result.num_prompt_tokens,
        "generated_tokens": result.num_generated_tokens,
        "stop_reason": result.stop_reason,
        "eval_ms_per_token": result.timings.eval_ms_per_token(),
        "sample_ms_per_token": result.timings.sample_ms_per_token(),
        "load_ms": result.timings.t_load_us as f64 / 1000.0,
    });
    eprintln!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
