use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, Result};

/// Token id within the model vocabulary
pub type TokenId = u32;

/// Mirostat adaptive sampling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirostatMode {
    #[default]
    None,
    V1,
    V2,
}

/// Generation parameters for one request.
///
/// Defaults follow the llama.cpp runtime defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Upper bound on prompt + completion tokens
    pub max_length: usize,
    /// Upper bound on completion tokens; 0 means "until the context is full"
    pub max_new_tokens: usize,
    /// Context window; prompts of this length or longer are rejected
    pub max_context_length: usize,
    /// 0 = greedy, < 0 = sample the unfiltered distribution
    pub temperature: f32,
    pub top_p: f32,
    /// 0 disables top-k truncation
    pub top_k: usize,
    pub min_p: f32,
    pub typical_p: f32,
    pub tail_free_z: f32,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Allow negative frequency/presence penalties (they then reward repeats)
    pub allow_negative_penalties: bool,
    /// Penalty window over the most recent history; `None` = whole history
    pub penalty_last_n: Option<usize>,
    /// Whether the newline token takes part in the penalty stage
    pub penalize_nl: bool,
    pub mirostat_mode: MirostatMode,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub do_sample: bool,
    /// Added to the raw logits before any other stage
    pub logit_bias: HashMap<TokenId, f32>,
    pub seed: Option<u64>,
    /// Record the log-probability of every sampled token
    pub logprobs: bool,
    /// Runtime thread hint, passed through untouched
    pub num_threads: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 2048,
            max_new_tokens: 256,
            max_context_length: 2048,
            temperature: 0.8,
            top_p: 0.95,
            top_k: 40,
            min_p: 0.05,
            typical_p: 1.0,
            tail_free_z: 1.0,
            repetition_penalty: 1.1,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            allow_negative_penalties: false,
            penalty_last_n: None,
            penalize_nl: true,
            mirostat_mode: MirostatMode::None,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            do_sample: true,
            logit_bias: HashMap::new(),
            seed: None,
            logprobs: false,
            num_threads: 0,
        }
    }
}

impl GenerationConfig {
    /// Deterministic argmax decoding
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            do_sample: false,
            repetition_penalty: 1.0,
            ..Default::default()
        }
    }

    /// Reject out-of-range values before generation starts.
    pub fn validate(&self) -> Result<()> {
        if self.max_context_length == 0 {
            return Err(EngineError::invalid("max_context_length", 0, "must be positive"));
        }
        if self.max_length == 0 {
            return Err(EngineError::invalid("max_length", 0, "must be positive"));
        }
        if !self.temperature.is_finite() {
            return Err(EngineError::invalid("temperature", self.temperature, "must be finite"));
        }
        for (name, value) in [
            ("top_p", self.top_p),
            ("min_p", self.min_p),
            ("typical_p", self.typical_p),
            ("tail_free_z", self.tail_free_z),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(EngineError::invalid(name, value, "must lie in (0, 1]"));
            }
        }
        if !(self.repetition_penalty > 0.0 && self.repetition_penalty.is_finite()) {
            return Err(EngineError::invalid(
                "repetition_penalty",
                self.repetition_penalty,
                "must be a positive factor",
            ));
        }
        for (name, value) in [
            ("frequency_penalty", self.frequency_penalty),
            ("presence_penalty", self.presence_penalty),
        ] {
            if !value.is_finite() {
                return Err(EngineError::invalid(name, value, "must be finite"));
            }
            if value < 0.0 && !self.allow_negative_penalties {
                return Err(EngineError::invalid(name, value, "negative penalties are not allowed"));
            }
        }
        if self.mirostat_mode != MirostatMode::None {
            if !(self.mirostat_tau > 0.0 && self.mirostat_tau.is_finite()) {
                return Err(EngineError::invalid("mirostat_tau", self.mirostat_tau, "must be positive"));
            }
            if !(self.mirostat_eta > 0.0 && self.mirostat_eta.is_finite()) {
                return Err(EngineError::invalid("mirostat_eta", self.mirostat_eta, "must be positive"));
            }
        }
        if let Some((id, bias)) = self.logit_bias.iter().find(|(_, b)| b.is_nan()) {
            return Err(EngineError::invalid("logit_bias", format!("{id}: {bias}"), "bias is NaN"));
        }
        Ok(())
    }

    /// Number of completion tokens a prompt of `prompt_len` may produce.
    pub fn completion_budget(&self, prompt_len: usize) -> usize {
        let window = self.max_length.min(self.max_context_length);
        let room = window.saturating_sub(prompt_len);
        if self.max_new_tokens == 0 {
            room
        } else {
            self.max_new_tokens.min(room)
        }
    }
}

/// Finish reason reported when a stop string fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStringFinish {
    #[default]
    Stop,
    FunctionCall,
}

/// Stop conditions beyond the model's own eos ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StopSpec {
    /// Literal strings matched against the cumulative decoded text
    pub strings: Vec<String>,
    /// Token ids that end generation like eos does
    pub token_ids: Vec<TokenId>,
    /// Classification used when one of `strings` matches
    pub string_finish: StopStringFinish,
}

impl StopSpec {
    pub fn strings<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            strings: strings.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_token_ids(mut self, ids: Vec<TokenId>) -> Self {
        self.token_ids = ids;
        self
    }

    pub fn with_string_finish(mut self, finish: StopStringFinish) -> Self {
        self.string_finish = finish;
        self
    }
}

/// One generation request: a tokenized prompt plus how to continue it.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt_tokens: Vec<TokenId>,
    pub config: GenerationConfig,
    pub stop: StopSpec,
}

impl GenerationRequest {
    pub fn new(prompt_tokens: Vec<TokenId>, config: GenerationConfig) -> Self {
        Self {
            prompt_tokens,
            config,
            stop: StopSpec::default(),
        }
    }

    pub fn with_stop(mut self, stop: StopSpec) -> Self {
        self.stop = stop;
        self
    }

    /// Pre-loop validation: sampling ranges and context fit.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        if self.prompt_tokens.is_empty() {
            return Err(EngineError::invalid("prompt_tokens", "[]", "prompt must not be empty"));
        }
        if self.prompt_tokens.len() >= self.config.max_context_length {
            return Err(EngineError::ContextOverflow {
                prompt_tokens: self.prompt_tokens.len(),
                max_context_length: self.config.max_context_length,
            });
        }
        Ok(())
    }
}
