//! Interactive text inference over a checkpoint file.
//!
//! Loads a checkpoint, warms up the session and completes prompts read
//! from stdin, streaming each sampled piece.
//!
//! Run with:
//! ```bash
//! RUST_LOG=info cargo run --release -p ember-core --example text_inference -- /path/to/model.bin
//! ```

use ember_core::prelude::*;
use std::io::{self, Write};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const MAX_NEW_TOKENS: usize = 64;
const N_THREADS: usize = 4;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let model_path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: text_inference <checkpoint>"))?;

    println!("Text Inference Example");
    println!("======================\n");

    println!("Loading checkpoint...");
    let load_start = Instant::now();
    let checkpoint = Checkpoint::load(&model_path)?;
    let meta = checkpoint.model.metadata().clone();
    println!("Loaded in {:.2}s", load_start.elapsed().as_secs_f64());
    println!(
        "  {} layers, {} hidden, {} heads, {} vocab",
        meta.hparams.n_layers, meta.hparams.embedding_dim, meta.hparams.n_heads, meta.hparams.n_vocab
    );
    println!("  {} tensors, {:.1} MB", meta.n_tensors, meta.bytes_loaded as f64 / 1e6);

    let mut session = Session::new(checkpoint, SessionParams::default())?;
    session.warmup(N_THREADS)?;
    println!(
        "  {} bytes of scratch per token",
        session.runtime().mem_per_token()
    );

    println!("\n--- Text Generation ---");
    println!("Enter prompts (empty line to quit):\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let max_seq = session.hparams().max_sequence_len;

    loop {
        print!("> ");
        stdout.flush()?;

        let mut prompt = String::new();
        stdin.read_line(&mut prompt)?;
        let prompt = prompt.trim();
        if prompt.is_empty() {
            break;
        }

        session.reset();
        let tokens = session.tokenize(prompt, max_seq)?;
        println!("\nTokens: {:?}", tokens);
        println!("({} tokens)", tokens.len());
        if tokens.is_empty() {
            continue;
        }

        print!("\nGenerated: ");
        stdout.flush()?;

        let gen_start = Instant::now();
        let mut history = tokens.clone();
        session.evaluate(&tokens, 0, N_THREADS)?;

        let budget = MAX_NEW_TOKENS.min(max_seq - tokens.len());
        let mut generated = 0;
        while generated < budget {
            let id = session.sample_with_repeat_penalty(&history, 64, 40, 0.95, 0.8, 1.1)?;
            if id == 0 {
                break;
            }
            print!("{}", session.detokenize(id)?);
            stdout.flush()?;
            history.push(id);
            generated += 1;
            if generated < budget {
                session.evaluate(&[id], session.n_past(), N_THREADS)?;
            }
        }

        let gen_time = gen_start.elapsed();
        println!("\n");
        println!(
            "Generated {} tokens in {:.2}ms ({:.1} tok/s)",
            generated,
            gen_time.as_secs_f64() * 1000.0,
            generated as f64 / gen_time.as_secs_f64()
        );

        let t = session.timings();
        println!(
            "eval {:.2} ms/token, sample {:.2} ms/token\n",
            t.eval_ms_per_token(),
            t.sample_ms_per_token()
        );
    }

    println!("Goodbye!");
    Ok(())
}
