//! Session and generation configuration.

use crate::error::{EmberError, Result};
use crate::sampling::SamplingParams;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Inputs fixed when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    /// RNG seed; `None` seeds from OS entropy.
    pub seed: Option<u64>,
    /// Keep logits for every position of the last window, not only the final one.
    pub keep_all_logits: bool,
    /// Store the KV cache in F16.
    pub f16_cache: bool,
}

/// Settings for a prompt -> completion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Worker threads per forward pass.
    pub n_threads: usize,
    /// Maximum tokens to generate.
    pub n_predict: usize,
    /// Prompt tokens fed per forward pass.
    pub n_batch: usize,
    /// Top-k truncation, `<= 0` disables.
    pub top_k: i32,
    /// Nucleus threshold.
    pub top_p: f32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Trailing window for the repetition penalty.
    pub repeat_last_n: usize,
    /// Repetition penalty factor.
    pub repeat_penalty: f32,
    /// RNG seed; `None` seeds from OS entropy.
    pub seed: Option<u64>,
    /// Keep logits for every position.
    pub keep_all_logits: bool,
    /// Store the KV cache in F16.
    pub f16_cache: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let sampling = SamplingParams::default();
        Self {
            n_threads: cores.min(4),
            n_predict: 200,
            n_batch: 8,
            top_k: sampling.top_k,
            top_p: sampling.top_p,
            temperature: sampling.temperature,
            repeat_last_n: 64,
            repeat_penalty: 1.10,
            seed: None,
            keep_all_logits: false,
            f16_cache: true,
        }
    }
}

impl GenerationConfig {
    /// Load a config from a JSON file; missing fields take defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range settings.
    pub fn validate(&self) -> Result<()> {
        self.sampling().validate()?;
        if self.top_p > 1.0 {
            return Err(EmberError::InvalidSampling(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if self.repeat_penalty.is_nan() || self.repeat_penalty <= 0.0 {
            return Err(EmberError::InvalidSampling(format!(
                "repeat_penalty must be > 0, got {}",
                self.repeat_penalty
            )));
        }
        if self.n_batch == 0 {
            return Err(EmberError::InvalidSampling("n_batch must be > 0".into()));
        }
        if self.n_threads == 0 {
            return Err(EmberError::InvalidSampling("n_threads must be > 0".into()));
        }
        Ok(())
    }

    /// Sampling subset of the config.
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            top_k: self.top_k,
            top_p: self.top_p,
            temperature: self.temperature,
        }
    }

    /// Session creation parameters.
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            seed: self.seed,
            keep_all_logits: self.keep_all_logits,
            f16_cache: self.f16_cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = GenerationConfig::default();
        assert_eq!(config.top_k, 40);
        assert_eq!(config.repeat_last_n, 64);
        assert_eq!(config.n_batch, 8);
        assert!(config.n_threads >= 1 && config.n_threads <= 4);
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = GenerationConfig::from_json(r#"{"top_k": 1, "seed": 7}"#).unwrap();
        assert_eq!(config.top_k, 1);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.n_predict, 200);
        assert_eq!(config.session_params().seed, Some(7));
    }

    #[test]
    fn from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"temperature": 0.5, "f16_cache": false}}"#).unwrap();
        let config = GenerationConfig::from_file(file.path()).unwrap();
        assert_eq!(config.temperature, 0.5);
        assert!(!config.session_params().f16_cache);
    }

    #[test]
    fn invalid_values_rejected() {
        for json in [
            r#"{"temperature": 0.0}"#,
            r#"{"top_p": 1.5}"#,
            r#"{"repeat_penalty": 0.0}"#,
            r#"{"n_batch": 0}"#,
            r#"{"n_threads": 0}"#,
        ] {
            assert!(GenerationConfig::from_json(json).is_err(), "{json}");
        }
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = GenerationConfig::from_json("{").unwrap_err();
        assert!(matches!(err, EmberError::Config(_)));
    }
}
