use anyhow::anyhow;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::completion::FinishReason;
use crate::config::EngineConfig;
use crate::context::{ContextState, LogitsRetention};
use crate::detokenizer::IncrementalDetokenizer;
use crate::error::{EngineError, Result};
use crate::model::{GrammarConstraint, ModelRuntime};
use crate::request::{GenerationConfig, GenerationRequest, StopStringFinish, TokenId};
use crate::sampler::{token_logprob, Sampler};
use crate::state_cache::{StateBlob, StateCache, StateCacheStats};

/// Where a generation is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    Idle,
    Prefill,
    Decode,
    StoppedEos,
    StoppedStopString,
    StoppedLength,
    Cancelled,
    Error,
}

impl DecodePhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Idle | Self::Prefill | Self::Decode)
    }

    /// Finish reason reported to callers; `None` for cancelled or failed runs
    pub fn finish_reason(self, string_finish: StopStringFinish) -> Option<FinishReason> {
        match self {
            Self::StoppedEos => Some(FinishReason::Stop),
            Self::StoppedStopString => Some(match string_finish {
                StopStringFinish::Stop => FinishReason::Stop,
                StopStringFinish::FunctionCall => FinishReason::FunctionCall,
            }),
            Self::StoppedLength => Some(FinishReason::Length),
            _ => None,
        }
    }
}

/// Cooperative cancellation flag with an optional deadline
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Result of one decode loop run
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub prompt_tokens: usize,
    /// Every sampled token, including a terminating eos / stop id
    pub completion_tokens: Vec<TokenId>,
    /// Released text, stop strings excluded
    pub text: String,
    /// Terminal phase
    pub phase: DecodePhase,
    pub finish_reason: Option<FinishReason>,
    /// Log-probability of each completion token, when requested
    pub logprobs: Option<Vec<f32>>,
    /// Prompt positions reused from the live context or the state cache
    pub reused_tokens: usize,
    pub tokens_per_second: f64,
}

struct EngineInner {
    runtime: Box<dyn ModelRuntime>,
    /// Context of the most recent generation, kept for prefix reuse
    live: ContextState,
}

/// Decode loop controller owning one model runtime.
///
/// Generations are serialized: the runtime lock is held for the whole run.
#[derive(Clone)]
pub struct InferenceEngine {
    config: EngineConfig,
    inner: Arc<Mutex<EngineInner>>,
    cache: Arc<StateCache>,
}

impl InferenceEngine {
    pub fn new(runtime: Box<dyn ModelRuntime>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Initializing inference engine: model={}, context={}, vocab={}, state cache={}",
            config.model_name,
            config.max_context_length,
            runtime.vocab_size(),
            config.state_cache_capacity
        );
        let live = ContextState::new(config.max_context_length, config.logits_retention);
        Ok(Self {
            cache: Arc::new(
                StateCache::new(config.state_cache_capacity).with_byte_limit(config.state_cache_bytes),
            ),
            inner: Arc::new(Mutex::new(EngineInner { runtime, live })),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn model_name(&self) -> &str {
        &self.config.model_name
    }

    pub fn state_cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> StateCacheStats {
        self.cache.stats()
    }

    /// Tokens held by the live context
    pub fn live_tokens(&self) -> Vec<TokenId> {
        self.inner.lock().live.history().to_vec()
    }

    /// Logits rows retained by the live context
    pub fn live_logits_rows(&self) -> usize {
        self.inner.lock().live.logits_rows()
    }

    /// Forget the live context; the next request prefills from scratch.
    pub fn reset(&self) {
        self.inner.lock().live.reset();
    }

    /// Context window for `config`, capped by the engine's own
    pub fn max_context_length(&self, config: &GenerationConfig) -> usize {
        config.max_context_length.min(self.config.max_context_length)
    }

    /// Checks run before any generation work.
    pub fn validate(&self, request: &GenerationRequest) -> Result<()> {
        request.validate()?;
        let max_context_length = self.max_context_length(&request.config);
        if request.prompt_tokens.len() >= max_context_length {
            return Err(EngineError::ContextOverflow {
                prompt_tokens: request.prompt_tokens.len(),
                max_context_length,
            });
        }
        Ok(())
    }

    /// Run the decode loop for `request`.
    ///
    /// `on_fragment` receives each released text fragment with the number of
    /// completion tokens sampled so far; returning `false` cancels the
    /// generation.
    pub fn generate<F>(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
        grammar: Option<&mut dyn GrammarConstraint>,
        on_fragment: F,
    ) -> Result<GenerationOutput>
    where
        F: FnMut(&str, usize) -> bool,
    {
        self.validate(request)?;

        let mut inner = self.inner.lock();
        let result = self.run(&mut inner, request, cancel, grammar, on_fragment);
        if let Err(e) = &result {
            error!("Generation failed: {}", e);
            debug!("phase: -> {:?}", DecodePhase::Error);
            // runtime state is unknown after a failure
            inner.live.reset();
        }
        result
    }

    fn run<F>(
        &self,
        inner: &mut EngineInner,
        request: &GenerationRequest,
        cancel: &CancelToken,
        mut grammar: Option<&mut dyn GrammarConstraint>,
        mut on_fragment: F,
    ) -> Result<GenerationOutput>
    where
        F: FnMut(&str, usize) -> bool,
    {
        let EngineInner { runtime, live } = inner;
        let config = &request.config;
        let prompt = request.prompt_tokens.as_slice();
        let prompt_len = prompt.len();
        let max_context_length = self.max_context_length(config);
        let budget = config
            .completion_budget(prompt_len)
            .min(max_context_length - prompt_len);
        let start_time = Instant::now();

        if let Some(g) = grammar.as_deref_mut() {
            g.reset();
        }

        // ===== PREFILL PHASE =====
        let mut phase = DecodePhase::Prefill;
        debug!("phase: {:?} -> {:?}", DecodePhase::Idle, phase);

        live.set_max_context_length(max_context_length);
        // the last prompt token is always evaluated to get fresh logits
        let reuse_cap = prompt_len - 1;
        let mut n_past = live.overlap(prompt).min(reuse_cap);

        if self.cache.capacity() > 0 && n_past < reuse_cap {
            match self.cache.lookup(&prompt[..reuse_cap], n_past) {
                Some((overlap, cached)) => {
                    let restored = cached
                        .blob
                        .verify()
                        .map_err(anyhow::Error::from)
                        .and_then(|blob| runtime.load_state(blob));
                    match restored {
                        Ok(()) => {
                            *live = cached.context;
                            live.set_max_context_length(max_context_length);
                            n_past = overlap.min(live.n_tokens());
                            debug!("Restored cached state, reusing {} prompt tokens", n_past);
                        }
                        Err(e) => {
                            warn!("Failed to restore cached state: {:#}", e);
                            n_past = 0;
                        }
                    }
                }
                None => debug!("No cached state beats the live context ({} tokens)", n_past),
            }
        }

        if n_past == 0 {
            live.reset();
        } else {
            live.truncate_to(n_past);
        }
        live.prefill(&prompt[n_past..])?;
        debug!("Prefilling {} tokens ({} reused)", prompt_len - n_past, n_past);
        evaluate(&mut **runtime, live, config, n_past, prompt_len)?;
        let reused_tokens = n_past;

        // ===== DECODE PHASE =====
        debug!("phase: {:?} -> {:?}", phase, DecodePhase::Decode);

        let eos_token_ids = runtime.eos_token_ids().to_vec();
        let mut sampler = Sampler::new(config.seed.unwrap_or(self.config.default_seed))
            .with_newline_token(runtime.newline_token());
        let mut detokenizer = IncrementalDetokenizer::new(request.stop.strings.iter().cloned());
        let mut completion_tokens: Vec<TokenId> = Vec::with_capacity(budget.min(1024));
        let mut logprobs = config.logprobs.then(Vec::new);
        let mut text = String::new();

        phase = loop {
            if completion_tokens.len() >= budget {
                break DecodePhase::StoppedLength;
            }
            if cancel.is_cancelled() {
                break DecodePhase::Cancelled;
            }

            let logits = live
                .last_logits()
                .ok_or_else(|| anyhow!("no logits for position {}", live.n_tokens()))?;
            let token = match grammar.as_deref_mut() {
                Some(g) => sampler.sample_constrained(logits, live.history(), config, g)?,
                None => sampler.sample(logits, live.history(), config)?,
            };
            if let Some(lp) = logprobs.as_mut() {
                lp.push(token_logprob(logits, token).unwrap_or(f32::NEG_INFINITY));
            }
            completion_tokens.push(token);

            if eos_token_ids.contains(&token) || request.stop.token_ids.contains(&token) {
                break DecodePhase::StoppedEos;
            }

            let step = detokenizer.push(&runtime.decode(&[token]));
            if !step.fragment.is_empty() {
                text.push_str(&step.fragment);
                if !on_fragment(&step.fragment, completion_tokens.len()) {
                    break DecodePhase::Cancelled;
                }
            }
            if step.stop_found {
                break DecodePhase::StoppedStopString;
            }
            if completion_tokens.len() >= budget {
                break DecodePhase::StoppedLength;
            }

            live.append(token)?;
            let n_past = live.n_tokens() - 1;
            evaluate(&mut **runtime, live, config, n_past, prompt_len)?;
        };
        debug!("phase: {:?} -> {:?}", DecodePhase::Decode, phase);

        if matches!(phase, DecodePhase::StoppedEos | DecodePhase::StoppedLength) {
            let rest = detokenizer.finish();
            if !rest.is_empty() {
                text.push_str(&rest);
                on_fragment(&rest, completion_tokens.len());
            }
        }

        if phase != DecodePhase::Cancelled && self.cache.capacity() > 0 {
            match runtime.save_state() {
                Ok(bytes) => {
                    let key: Vec<TokenId> = prompt.iter().chain(&completion_tokens).copied().collect();
                    debug!("Saving state for {} tokens ({} bytes)", key.len(), bytes.len());
                    self.cache.store(key, live.clone(), StateBlob::new(bytes));
                }
                Err(e) => warn!("Failed to save runtime state: {:#}", e),
            }
        }

        let tokens_per_second = completion_tokens.len() as f64 / start_time.elapsed().as_secs_f64().max(1e-9);
        info!(
            "Generated {} tokens ({:.1} tok/s), {:?}",
            completion_tokens.len(),
            tokens_per_second,
            phase
        );

        Ok(GenerationOutput {
            prompt_tokens: prompt_len,
            finish_reason: phase.finish_reason(request.stop.string_finish),
            completion_tokens,
            text,
            phase,
            logprobs,
            reused_tokens,
            tokens_per_second,
        })
    }
}

/// Evaluate `live.history()[n_past..]` and record the logits it yields.
fn evaluate(
    runtime: &mut dyn ModelRuntime,
    live: &mut ContextState,
    config: &GenerationConfig,
    n_past: usize,
    prompt_len: usize,
) -> Result<()> {
    let rows = match live.retention() {
        LogitsRetention::All => runtime.eval_logits(live.history(), config, n_past, prompt_len)?,
        LogitsRetention::Last => {
            vec![runtime.next_token_logits(live.history(), config, n_past, prompt_len)?]
        }
    };

    let vocab_size = runtime.vocab_size();
    match rows.last() {
        Some(row) if row.len() == vocab_size => {}
        Some(row) => {
            return Err(anyhow!(
                "logits row has {} entries, vocabulary has {}",
                row.len(),
                vocab_size
            )
            .into())
        }
        None => return Err(anyhow!("runtime returned no logits").into()),
    }
    live.record_logits(rows);
    Ok(())
}
