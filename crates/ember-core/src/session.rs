//! Long-lived inference session.
//!
//! A [`Session`] binds a loaded model and tokenizer to the mutable state of
//! one sequence: KV cache, logits buffer, cursor, RNG and timing counters.
//! Calls must not overlap; wrap the session in a mutex to share it.
//!
//! # Example
//!
//! ```ignore
//! use ember_core::prelude::*;
//!
//! let checkpoint = Checkpoint::load("model.bin")?;
//! let mut session = Session::new(checkpoint, SessionParams::default())?;
//! let prompt = session.tokenize("def fib(n):", 512)?;
//! session.evaluate(&prompt, 0, 4)?;
//! let next = session.sample(40, 0.95, 0.8)?;
//! print!("{}", session.detokenize(next)?);
//! ```

use crate::config::SessionParams;
use crate::error::{EmberError, Result};
use crate::model::{
    Checkpoint, Hyperparameters, KvCache, LogitsMode, Model, ScratchArena, Tokenizer,
};
use crate::sampling::{RepeatPenalty, Sampler, SamplingParams};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Ids evaluated by [`Session::warmup`].
const WARMUP_TOKENS: [u32; 4] = [0, 1, 2, 3];

/// Cumulative timing counters, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    /// Session creation to the end of the first evaluation.
    pub t_load_us: u64,
    /// Total time spent sampling.
    pub t_sample_us: u64,
    /// Total time spent in forward passes.
    pub t_eval_us: u64,
    /// Number of sample calls.
    pub n_sample: u64,
    /// Number of evaluate calls.
    pub n_eval: u64,
    /// Tokens processed across all evaluate calls.
    pub n_eval_tokens: u64,
}

impl Timings {
    /// Mean forward-pass time per evaluated token, in milliseconds.
    pub fn eval_ms_per_token(&self) -> f64 {
        if self.n_eval_tokens == 0 {
            return 0.0;
        }
        self.t_eval_us as f64 / 1000.0 / self.n_eval_tokens as f64
    }

    /// Mean time per sample call, in milliseconds.
    pub fn sample_ms_per_token(&self) -> f64 {
        if self.n_sample == 0 {
            return 0.0;
        }
        self.t_sample_us as f64 / 1000.0 / self.n_sample as f64
    }
}

/// Mutable per-sequence state owned by a session.
#[derive(Debug)]
pub struct RuntimeState {
    /// Logits of the last evaluation.
    logits: Vec<f32>,
    /// Positions already in the cache.
    n_past: usize,
    /// Sampling generator.
    rng: StdRng,
    /// Timing counters.
    timings: Timings,
    /// Set after the first evaluation completes.
    has_evaluated_once: bool,
    /// Staging buffer reused across forward passes.
    scratch: ScratchArena,
    /// Worker pools keyed by thread count.
    pools: HashMap<usize, Arc<rayon::ThreadPool>>,
    /// Creation time, for the load measurement.
    created: Instant,
}

impl RuntimeState {
    fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            logits: Vec::new(),
            n_past: 0,
            rng,
            timings: Timings::default(),
            has_evaluated_once: false,
            scratch: ScratchArena::new(),
            pools: HashMap::new(),
            created: Instant::now(),
        }
    }

    fn pool(&mut self, n_threads: usize) -> Result<Arc<rayon::ThreadPool>> {
        let n_threads = n_threads.max(1);
        if let Some(pool) = self.pools.get(&n_threads) {
            return Ok(pool.clone());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .thread_name(|i| format!("ember-worker-{i}"))
            .build()
            .map_err(|e| EmberError::ThreadPool(e.to_string()))?;
        let pool = Arc::new(pool);
        self.pools.insert(n_threads, pool.clone());
        Ok(pool)
    }

    /// Bytes per token observed on the first forward pass.
    pub fn mem_per_token(&self) -> usize {
        self.scratch.mem_per_token()
    }
}

/// Model, tokenizer and per-sequence runtime state.
#[derive(Debug)]
pub struct Session {
    model: Model,
    tokenizer: Tokenizer,
    cache: KvCache,
    params: SessionParams,
    runtime: RuntimeState,
}

impl Session {
    /// Create a session and allocate its KV cache.
    pub fn new(checkpoint: Checkpoint, params: SessionParams) -> Result<Self> {
        let Checkpoint { model, tokenizer } = checkpoint;
        let cache = model.new_cache(params.f16_cache)?;
        info!(
            cache_mb = cache.size_bytes() as f64 / (1024.0 * 1024.0),
            dtype = ?cache.dtype(),
            max_sequence_len = cache.max_seq_len(),
            "allocated kv cache"
        );
        Ok(Self {
            model,
            tokenizer,
            cache,
            params,
            runtime: RuntimeState::new(params.seed),
        })
    }

    /// Encode text, failing if it needs more than `max_tokens` ids.
    pub fn tokenize(&self, text: &str, max_tokens: usize) -> Result<Vec<u32>> {
        let ids = self.tokenizer.encode(text);
        if ids.len() > max_tokens {
            return Err(EmberError::TooManyTokens {
                n_tokens: ids.len(),
                capacity: max_tokens,
            });
        }
        Ok(ids)
    }

    /// Text of a single token, with word boundaries rendered as spaces.
    pub fn detokenize(&self, id: u32) -> Result<String> {
        self.tokenizer
            .render_piece(id)
            .ok_or(EmberError::UnknownToken(id))
    }

    /// Decode a token sequence.
    pub fn decode(&self, ids: &[u32]) -> String {
        self.tokenizer.decode(ids)
    }

    /// Run a forward pass over `tokens` at positions `[n_past, n_past + N)`.
    ///
    /// On success the cursor moves to `n_past + N` and the logits buffer is
    /// replaced. The window is validated before the cache is touched; other
    /// failures leave the cache partially written.
    pub fn evaluate(&mut self, tokens: &[u32], n_past: usize, n_threads: usize) -> Result<()> {
        self.model.validate_window(tokens, n_past)?;
        let pool = self.runtime.pool(n_threads)?;
        let mode = if self.params.keep_all_logits {
            LogitsMode::All
        } else {
            LogitsMode::Last
        };

        let start = Instant::now();
        let model = &self.model;
        let cache = &mut self.cache;
        let scratch = &mut self.runtime.scratch;
        let logits = pool.install(|| model.forward(tokens, n_past, cache, scratch, mode))?;
        let elapsed = start.elapsed().as_micros() as u64;

        let runtime = &mut self.runtime;
        runtime.logits = logits;
        runtime.n_past = n_past + tokens.len();
        runtime.timings.t_eval_us += elapsed;
        runtime.timings.n_eval += 1;
        runtime.timings.n_eval_tokens += tokens.len() as u64;

        if !runtime.has_evaluated_once {
            runtime.has_evaluated_once = true;
            runtime.timings.t_load_us = runtime.created.elapsed().as_micros() as u64;
            debug!(
                t_load_us = runtime.timings.t_load_us,
                mem_per_token = runtime.scratch.mem_per_token(),
                "first evaluation complete"
            );
        }
        Ok(())
    }

    /// Evaluate a short fixed window to size the scratch arena, then rewind.
    pub fn warmup(&mut self, n_threads: usize) -> Result<()> {
        let hp = self.model.hparams();
        let len = WARMUP_TOKENS
            .len()
            .min(hp.n_vocab)
            .min(hp.max_sequence_len);
        self.evaluate(&WARMUP_TOKENS[..len], 0, n_threads)?;
        self.reset();
        Ok(())
    }

    /// Sample the next token from the final position's logits.
    pub fn sample(&mut self, top_k: i32, top_p: f32, temperature: f32) -> Result<u32> {
        let params = SamplingParams {
            top_k,
            top_p,
            temperature,
        };
        self.sample_inner(params, None)
    }

    /// Sample with a penalty on ids in the last `repeat_window` of `recent`.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_with_repeat_penalty(
        &mut self,
        recent: &[u32],
        repeat_window: usize,
        top_k: i32,
        top_p: f32,
        temperature: f32,
        repeat_penalty: f32,
    ) -> Result<u32> {
        let params = SamplingParams {
            top_k,
            top_p,
            temperature,
        };
        let penalty = RepeatPenalty::new(recent, repeat_window, repeat_penalty);
        self.sample_inner(params, Some(&penalty))
    }

    fn sample_inner(
        &mut self,
        params: SamplingParams,
        penalty: Option<&RepeatPenalty<'_>>,
    ) -> Result<u32> {
        let start = Instant::now();
        let sampler = Sampler::new(params)?;
        let n_vocab = self.n_vocab();
        let runtime = &mut self.runtime;
        if n_vocab == 0 || runtime.logits.len() < n_vocab {
            return Err(EmberError::NoLogits);
        }
        // Final position only.
        let logits = &runtime.logits[runtime.logits.len() - n_vocab..];
        let id = sampler.sample(logits, penalty, &mut runtime.rng)?;

        runtime.timings.t_sample_us += start.elapsed().as_micros() as u64;
        runtime.timings.n_sample += 1;
        Ok(id)
    }

    /// Logits of the last evaluation: `n_vocab` values, or `n_vocab * N`
    /// when the session keeps all positions.
    pub fn logits(&self) -> &[f32] {
        &self.runtime.logits
    }

    /// Positions currently in the cache.
    pub fn n_past(&self) -> usize {
        self.runtime.n_past
    }

    /// Vocabulary size.
    pub fn n_vocab(&self) -> usize {
        self.model.hparams().n_vocab
    }

    /// Model hyperparameters.
    pub fn hparams(&self) -> &Hyperparameters {
        self.model.hparams()
    }

    /// Snapshot of the timing counters.
    pub fn timings(&self) -> Timings {
        self.runtime.timings
    }

    /// Session creation parameters.
    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Get the tokenizer.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Get the model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Get the runtime state.
    pub fn runtime(&self) -> &RuntimeState {
        &self.runtime
    }

    /// Rewind the cursor and drop logits. Cache rows are overwritten lazily.
    pub fn reset(&mut self) {
        self.runtime.n_past = 0;
        self.runtime.logits.clear();
    }
}
