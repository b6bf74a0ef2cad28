//! Next-token sampling.
//!
//! Operates on raw logit slices. The pipeline order is fixed:
//!
//! 1. repetition penalty over the trailing window of recent tokens
//! 2. temperature scaling
//! 3. sort descending and keep the top `k`
//! 4. softmax over the survivors
//! 5. nucleus cut at cumulative mass `top_p`, then renormalize
//! 6. draw from the seeded generator

use crate::error::{EmberError, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Truncation and temperature settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Keep this many highest logits; `<= 0` disables truncation.
    pub top_k: i32,
    /// Nucleus mass threshold; values above 1 behave as 1.
    pub top_p: f32,
    /// Logit divisor; must be positive.
    pub temperature: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.95,
            temperature: 0.80,
        }
    }
}

impl SamplingParams {
    /// Reject degenerate settings.
    pub fn validate(&self) -> Result<()> {
        if self.temperature.is_nan() || self.temperature <= 0.0 {
            return Err(EmberError::InvalidSampling(format!(
                "temperature must be > 0, got {}",
                self.temperature
            )));
        }
        if self.top_p.is_nan() || self.top_p < 0.0 {
            return Err(EmberError::InvalidSampling(format!(
                "top_p must be >= 0, got {}",
                self.top_p
            )));
        }
        if self.top_p == 0.0 && self.top_k <= 0 {
            return Err(EmberError::InvalidSampling(
                "top_k <= 0 with top_p == 0 leaves no candidates".into(),
            ));
        }
        Ok(())
    }
}

/// Repetition penalty over recently emitted tokens.
#[derive(Debug, Clone, Copy)]
pub struct RepeatPenalty<'a> {
    /// Emitted tokens, oldest first.
    pub recent: &'a [u32],
    /// Only the last `window` entries of `recent` count.
    pub window: usize,
    /// Penalty factor; 1 disables.
    pub penalty: f32,
}

impl<'a> RepeatPenalty<'a> {
    /// Create a penalty over `recent`.
    pub fn new(recent: &'a [u32], window: usize, penalty: f32) -> Self {
        Self {
            recent,
            window,
            penalty,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.penalty.is_nan() || self.penalty <= 0.0 {
            return Err(EmberError::InvalidSampling(format!(
                "repeat_penalty must be > 0, got {}",
                self.penalty
            )));
        }
        Ok(())
    }

    /// Penalize each distinct id in the window once.
    ///
    /// Positive logits are divided by the penalty, the rest multiplied.
    pub fn apply(&self, logits: &mut [f32]) {
        let start = self.recent.len().saturating_sub(self.window);
        let mut seen = vec![false; logits.len()];
        for &tok in &self.recent[start..] {
            let idx = tok as usize;
            if idx >= logits.len() || seen[idx] {
                continue;
            }
            seen[idx] = true;
            if logits[idx] > 0.0 {
                logits[idx] /= self.penalty;
            } else {
                logits[idx] *= self.penalty;
            }
        }
    }
}

/// Return the index of the maximum value in the logit slice.
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0u32;
    let mut max_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > max_val {
            max_val = v;
            best = i as u32;
        }
    }
    best
}

/// Validated sampler.
#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    params: SamplingParams,
}

impl Sampler {
    /// Create a sampler, rejecting degenerate parameters.
    pub fn new(params: SamplingParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    /// Get the parameters.
    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Final candidate distribution as `(id, probability)`, most likely first.
    ///
    /// Non-finite logits are never candidates.
    pub fn distribution(
        &self,
        logits: &[f32],
        penalty: Option<&RepeatPenalty<'_>>,
    ) -> Result<Vec<(u32, f32)>> {
        if logits.is_empty() {
            return Err(EmberError::InvalidSampling("empty logits".into()));
        }

        let mut scaled = logits.to_vec();
        if let Some(penalty) = penalty {
            penalty.validate()?;
            penalty.apply(&mut scaled);
        }

        let temperature = self.params.temperature;
        let mut candidates: Vec<(u32, f32)> = scaled
            .iter()
            .enumerate()
            .map(|(i, &l)| (i as u32, l / temperature))
            .filter(|(_, l)| l.is_finite())
            .collect();
        if candidates.is_empty() {
            return Err(EmberError::InvalidSampling(
                "no finite logits to sample from".into(),
            ));
        }

        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        let top_k = self.params.top_k;
        if top_k > 0 && (top_k as usize) < candidates.len() {
            candidates.truncate(top_k as usize);
        }

        // Stable softmax; the first candidate holds the max.
        let max_val = candidates[0].1;
        let mut sum = 0.0f32;
        for c in candidates.iter_mut() {
            c.1 = (c.1 - max_val).exp();
            sum += c.1;
        }
        for c in candidates.iter_mut() {
            c.1 /= sum;
        }

        let top_p = self.params.top_p.min(1.0);
        if top_p < 1.0 {
            let mut cumsum = 0.0f32;
            let mut keep = candidates.len();
            for (i, c) in candidates.iter().enumerate() {
                cumsum += c.1;
                if cumsum >= top_p {
                    keep = i + 1;
                    break;
                }
            }
            candidates.truncate(keep);
            let kept: f32 = candidates.iter().map(|c| c.1).sum();
            for c in candidates.iter_mut() {
                c.1 /= kept;
            }
        }

        Ok(candidates)
    }

    /// Draw one token id.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        logits: &[f32],
        penalty: Option<&RepeatPenalty<'_>>,
        rng: &mut R,
    ) -> Result<u32> {
        let candidates = self.distribution(logits, penalty)?;
        if candidates.len() == 1 {
            return Ok(candidates[0].0);
        }
        let dist = WeightedIndex::new(candidates.iter().map(|c| c.1))
            .map_err(|e| EmberError::InvalidSampling(e.to_string()))?;
        Ok(candidates[dist.sample(rng)].0)
    }
}
