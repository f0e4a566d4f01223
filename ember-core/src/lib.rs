//! Ember Core - token-by-token text generation engine
//!
//! This crate implements the generation core that sits between a loaded
//! model runtime and a caller:
//! - Context state with prefix reuse across requests
//! - Sampling: penalties, top-k/top-p/min-p/typical/tail-free, mirostat
//! - Incremental UTF-8 safe detokenization with stop strings
//! - LRU cache of saved runtime states keyed by token prefix
//! - OpenAI-style completion chunks over a bounded streaming channel

pub mod error;
pub mod config;
pub mod request;
pub mod context;
pub mod sampler;
pub mod detokenizer;
pub mod state_cache;
pub mod model;
pub mod engine;
pub mod completion;

pub use error::{EngineError, Result};
pub use config::EngineConfig;
pub use request::{GenerationConfig, GenerationRequest, MirostatMode, StopSpec, StopStringFinish, TokenId};
pub use context::{ContextState, LogitsRetention};
pub use sampler::{logits_to_logprobs, Candidates, MirostatState, Sampler};
pub use detokenizer::{DetokenizeStep, IncrementalDetokenizer};
pub use state_cache::{CachedState, StateBlob, StateCache, StateCacheStats};
pub use model::{GrammarConstraint, ModelRuntime};
pub use engine::{CancelToken, DecodePhase, GenerationOutput, InferenceEngine};
pub use completion::{Completion, CompletionChunk, CompletionStream, FinishReason, Role, Usage};
