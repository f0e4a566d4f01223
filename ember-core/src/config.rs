use std::str::FromStr;

use crate::context::LogitsRetention;
use crate::error::{EngineError, Result};

/// Engine-wide settings, fixed when the engine is built
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model name echoed in every completion chunk
    pub model_name: String,
    /// Context window of the loaded model
    pub max_context_length: usize,
    /// Number of saved states the state cache keeps; 0 disables it
    pub state_cache_capacity: usize,
    /// Total size bound of the cached state blobs, if any
    pub state_cache_bytes: Option<usize>,
    /// Chunks buffered between the decode thread and a stream consumer
    pub stream_buffer: usize,
    pub logits_retention: LogitsRetention,
    /// Seed used when a request does not carry its own
    pub default_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_name: "ember".to_string(),
            max_context_length: 2048,
            state_cache_capacity: 8,
            state_cache_bytes: None,
            stream_buffer: 32,
            logits_retention: LogitsRetention::Last,
            default_seed: 299792458,
        }
    }
}

impl EngineConfig {
    pub fn with_model_name(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Default::default()
        }
    }

    pub fn max_context_length(mut self, n: usize) -> Self {
        self.max_context_length = n;
        self
    }

    pub fn state_cache_capacity(mut self, n: usize) -> Self {
        self.state_cache_capacity = n;
        self
    }

    pub fn state_cache_bytes(mut self, limit: Option<usize>) -> Self {
        self.state_cache_bytes = limit;
        self
    }

    pub fn stream_buffer(mut self, n: usize) -> Self {
        self.stream_buffer = n;
        self
    }

    pub fn logits_retention(mut self, retention: LogitsRetention) -> Self {
        self.logits_retention = retention;
        self
    }

    pub fn default_seed(mut self, seed: u64) -> Self {
        self.default_seed = seed;
        self
    }

    /// Defaults overridden by `EMBER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = lookup("EMBER_MODEL_NAME") {
            config.model_name = name;
        }
        if let Some(v) = lookup("EMBER_CONTEXT_LENGTH") {
            config.max_context_length = parse("EMBER_CONTEXT_LENGTH", &v)?;
        }
        if let Some(v) = lookup("EMBER_STATE_CACHE_CAPACITY") {
            config.state_cache_capacity = parse("EMBER_STATE_CACHE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("EMBER_STATE_CACHE_BYTES") {
            config.state_cache_bytes = Some(parse("EMBER_STATE_CACHE_BYTES", &v)?);
        }
        if let Some(v) = lookup("EMBER_STREAM_BUFFER") {
            config.stream_buffer = parse("EMBER_STREAM_BUFFER", &v)?;
        }
        if let Some(v) = lookup("EMBER_LOGITS_ALL") {
            if parse::<bool>("EMBER_LOGITS_ALL", &v)? {
                config.logits_retention = LogitsRetention::All;
            }
        }
        if let Some(v) = lookup("EMBER_SEED") {
            config.default_seed = parse("EMBER_SEED", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_context_length == 0 {
            return Err(EngineError::Config("max_context_length must be positive".into()));
        }
        if self.stream_buffer == 0 {
            return Err(EngineError::Config("stream_buffer must be positive".into()));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{key}: cannot parse {value:?}")))
}
