//! High-level generation engine.

use anyhow::{bail, Context, Result};
use ember_core::{
    model::{Checkpoint, Hyperparameters, UNKNOWN_TOKEN},
    GenerationConfig, Session, Timings,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};

/// Builder for creating an Engine.
pub struct EngineBuilder {
    model_path: Option<PathBuf>,
    checkpoint: Option<Checkpoint>,
    config: GenerationConfig,
    warmup: bool,
}

impl EngineBuilder {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self {
            model_path: None,
            checkpoint: None,
            config: GenerationConfig::default(),
            warmup: true,
        }
    }

    /// Load weights from a checkpoint file.
    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    /// Use an already loaded checkpoint.
    pub fn checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Set the generation configuration.
    pub fn config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    /// Read the generation configuration from a JSON file.
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        self.config = GenerationConfig::from_file(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Ok(self)
    }

    /// Set worker thread count.
    pub fn n_threads(mut self, n: usize) -> Self {
        self.config.n_threads = n;
        self
    }

    /// Set the RNG seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Skip the warmup pass at build time.
    pub fn skip_warmup(mut self) -> Self {
        self.warmup = false;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let checkpoint = match (self.checkpoint, self.model_path) {
            (Some(checkpoint), _) => checkpoint,
            (None, Some(path)) => Checkpoint::load(&path)
                .with_context(|| format!("loading checkpoint {}", path.display()))?,
            (None, None) => bail!("engine needs a model path or a checkpoint"),
        };

        let mut session = Session::new(checkpoint, self.config.session_params())?;
        if self.warmup {
            session.warmup(self.config.n_threads)?;
            debug!(
                mem_per_token = session.runtime().mem_per_token(),
                "warmup complete"
            );
        }

        Ok(Engine {
            config: self.config,
            session: Mutex::new(session),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper running prompt completions on one session.
///
/// Requests are serialized; each one rewinds the session and starts from
/// an empty context.
pub struct Engine {
    config: GenerationConfig,
    session: Mutex<Session>,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Get engine configuration.
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Model hyperparameters.
    pub fn hparams(&self) -> Hyperparameters {
        self.session.lock().hparams().clone()
    }

    /// Cumulative timing counters of the underlying session.
    pub fn timings(&self) -> Timings {
        self.session.lock().timings()
    }

    /// Encode text with the model's tokenizer.
    pub fn tokenize(&self, text: &str) -> Vec<u32> {
        self.session.lock().tokenizer().encode(text)
    }

    /// Generate text from a prompt.
    pub fn generate<'a>(&'a self, prompt: &str) -> GenerateRequest<'a> {
        GenerateRequest {
            engine: self,
            prompt: prompt.to_string(),
            config: self.config.clone(),
            on_token: None,
        }
    }
}

/// Piece callback; returning `false` stops generation.
type TokenCallback<'a> = Box<dyn FnMut(&str) -> bool + 'a>;

/// A generation request.
pub struct GenerateRequest<'a> {
    engine: &'a Engine,
    prompt: String,
    config: GenerationConfig,
    on_token: Option<TokenCallback<'a>>,
}

impl<'a> GenerateRequest<'a> {
    /// Set maximum tokens to generate.
    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.n_predict = n;
        self
    }

    /// Set temperature.
    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t;
        self
    }

    /// Set top-k.
    pub fn top_k(mut self, k: i32) -> Self {
        self.config.top_k = k;
        self
    }

    /// Set nucleus threshold.
    pub fn top_p(mut self, p: f32) -> Self {
        self.config.top_p = p;
        self
    }

    /// Set prompt batch size.
    pub fn n_batch(mut self, n: usize) -> Self {
        self.config.n_batch = n;
        self
    }

    /// Stream each generated piece to `f`.
    pub fn on_token(mut self, f: impl FnMut(&str) -> bool + 'a) -> Self {
        self.on_token = Some(Box::new(f));
        self
    }

    /// Execute the generation.
    pub fn execute(self) -> Result<GenerateResult> {
        let GenerateRequest {
            engine,
            prompt,
            config,
            mut on_token,
        } = self;
        config.validate()?;

        let mut session = engine.session.lock();
        session.reset();

        let max_seq = session.hparams().max_sequence_len;
        let prompt_tokens = session.tokenize(&prompt, max_seq)?;
        if prompt_tokens.is_empty() {
            bail!("prompt produced no tokens");
        }

        let budget = config.n_predict.min(max_seq - prompt_tokens.len());
        debug!(
            prompt_tokens = prompt_tokens.len(),
            budget, "starting generation"
        );

        for chunk in prompt_tokens.chunks(config.n_batch) {
            let n_past = session.n_past();
            session.evaluate(chunk, n_past, config.n_threads)?;
        }

        let before = session.timings();
        let mut history = prompt_tokens.clone();
        let mut generated = Vec::new();
        let mut stop_reason = StopReason::Budget;

        while generated.len() < budget {
            let id = session.sample_with_repeat_penalty(
                &history,
                config.repeat_last_n,
                config.top_k,
                config.top_p,
                config.temperature,
                config.repeat_penalty,
            )?;
            if id == UNKNOWN_TOKEN {
                stop_reason = StopReason::EndOfText;
                break;
            }
            history.push(id);
            generated.push(id);

            if let Some(f) = on_token.as_mut() {
                let piece = session.detokenize(id)?;
                if !f(&piece) {
                    stop_reason = StopReason::Callback;
                    break;
                }
            }
            if generated.len() < budget {
                let n_past = session.n_past();
                session.evaluate(&[id], n_past, config.n_threads)?;
            }
        }

        let timings = session.timings();
        let predicted = timings.n_eval_tokens - before.n_eval_tokens;
        let predict_ms = if predicted == 0 {
            0.0
        } else {
            (timings.t_eval_us - before.t_eval_us) as f64 / 1000.0 / predicted as f64
        };
        info!(
            prompt_tokens = prompt_tokens.len(),
            generated = generated.len(),
            predict_ms_per_token = predict_ms,
            sample_ms_per_token = timings.sample_ms_per_token(),
            stop = ?stop_reason,
            "generation complete"
        );

        Ok(GenerateResult {
            text: session.decode(&generated),
            num_prompt_tokens: prompt_tokens.len(),
            num_generated_tokens: generated.len(),
            tokens: generated,
            stop_reason,
            timings,
        })
    }
}

/// Why generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced the end-of-text token.
    EndOfText,
    /// The token callback asked to stop.
    Callback,
    /// The token budget ran out.
    Budget,
}

/// Result of text generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateResult {
    /// Generated text.
    pub text: String,
    /// Generated token IDs.
    pub tokens: Vec<u32>,
    /// Number of prompt tokens.
    pub num_prompt_tokens: usize,
    /// Number of generated tokens.
    pub num_generated_tokens: usize,
    /// Why generation ended.
    pub stop_reason: StopReason,
    /// Session counters after the request.
    pub timings: Timings,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::testing::{toy_checkpoint, toy_checkpoint_bytes, toy_hparams};
    use std::io::Write;

    fn config() -> GenerationConfig {
        GenerationConfig {
            n_threads: 1,
            seed: Some(11),
            f16_cache: false,
            ..Default::default()
        }
    }

    fn engine(seed: u64) -> Engine {
        Engine::builder()
            .checkpoint(toy_checkpoint(seed))
            .config(config())
            .build()
            .unwrap()
    }

    #[test]
    fn engine_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine>();
    }

    #[test]
    fn generation_is_reproducible() {
        let a = engine(1).generate("hello").max_tokens(8).execute().unwrap();
        let b = engine(1).generate("hello").max_tokens(8).execute().unwrap();
        assert_eq!(a.tokens, b.tokens);
        assert_eq!(a.text, b.text);
        assert!(a.num_generated_tokens <= 8);
        assert_eq!(a.num_generated_tokens, a.tokens.len());
        assert!(!a.tokens.contains(&UNKNOWN_TOKEN));
    }

    #[test]
    fn budget_is_clamped_to_context() {
        let engine = engine(2);
        let prompt_len = engine.tokenize("hello there").len();
        let max_seq = toy_hparams().max_sequence_len;

        let result = engine.generate("hello there").max_tokens(1000).execute().unwrap();
        assert_eq!(result.num_prompt_tokens, prompt_len);
        assert!(result.num_generated_tokens <= max_seq - prompt_len);
        if result.stop_reason == StopReason::Budget {
            assert_eq!(result.num_generated_tokens, max_seq - prompt_len);
        }
    }

    #[test]
    fn callback_receives_pieces_and_can_stop() {
        let engine = engine(3);
        let mut pieces = Vec::new();
        let result = engine
            .generate("the")
            .max_tokens(10)
            .on_token(|piece| {
                pieces.push(piece.to_string());
                false
            })
            .execute()
            .unwrap();

        match result.stop_reason {
            StopReason::Callback => {
                assert_eq!(result.num_generated_tokens, 1);
                assert_eq!(pieces.concat(), result.text);
            }
            StopReason::EndOfText => assert!(pieces.is_empty()),
            StopReason::Budget => panic!("callback should stop before the budget"),
        }
    }

    #[test]
    fn batch_size_does_not_change_greedy_output() {
        let run = |n_batch| {
            engine(4)
                .generate("hello world")
                .top_k(1)
                .n_batch(n_batch)
                .max_tokens(6)
                .execute()
                .unwrap()
                .tokens
        };
        assert_eq!(run(1), run(8));
    }

    #[test]
    fn requests_start_from_a_fresh_context() {
        let engine = engine(5);
        let first = engine.generate("hello").top_k(1).max_tokens(4).execute().unwrap();
        let second = engine.generate("hello").top_k(1).max_tokens(4).execute().unwrap();
        assert_eq!(first.tokens, second.tokens);
        assert!(second.timings.n_eval > first.timings.n_eval);
    }

    #[test]
    fn bad_inputs_are_errors() {
        let engine = engine(6);
        assert!(engine.generate("").execute().is_err());
        assert!(engine.generate("hello").temperature(0.0).execute().is_err());

        let long = "x".repeat(toy_hparams().max_sequence_len + 1);
        assert!(engine.generate(&long).execute().is_err());

        assert!(Engine::builder().config(config()).build().is_err());
    }

    #[test]
    fn build_from_files() {
        let mut model = tempfile::NamedTempFile::new().unwrap();
        model.write_all(&toy_checkpoint_bytes(7)).unwrap();
        let mut cfg = tempfile::NamedTempFile::new().unwrap();
        write!(cfg, r#"{{"n_threads": 1, "seed": 3, "n_predict": 5}}"#).unwrap();

        let engine = Engine::builder()
            .model_path(model.path())
            .config_file(cfg.path())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(engine.config().n_predict, 5);
        assert_eq!(engine.hparams(), toy_hparams());

        let result = engine.generate("hello").execute().unwrap();
        assert!(result.num_generated_tokens <= 5);
    }

    #[test]
    fn result_serializes() {
        let result = engine(8).generate("he").max_tokens(2).execute().unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert!(json["stop_reason"].is_string());
        assert_eq!(json["num_prompt_tokens"], result.num_prompt_tokens);
    }
}
