use anyhow::bail;
use ember_core::*;
use parking_lot::Mutex;
use std::sync::Arc;

/// Calls observed by a stub runtime
#[derive(Default)]
struct Recorder {
    /// `(n_past, evaluated suffix)` per logits request
    calls: Vec<(usize, Vec<TokenId>)>,
    loads: usize,
    saves: usize,
}

enum Policy {
    /// Always predict the same token
    Always(TokenId),
    /// Predict the scripted completion, then eos
    Script(Vec<TokenId>),
    /// Lowercase letter derived from the whole history
    Letters,
}

/// Byte-level stub: token `t < 256` decodes to the byte `t`.
///
/// Keeps the tokens it has evaluated, the way a real runtime keeps its kv
/// cache, and fails when asked to continue from a prefix it does not hold.
struct StubRuntime {
    vocab: usize,
    eos: Vec<TokenId>,
    policy: Policy,
    evaluated: Vec<TokenId>,
    recorder: Arc<Mutex<Recorder>>,
    fail_on_call: Option<usize>,
}

impl StubRuntime {
    fn new(vocab: usize, eos: TokenId, policy: Policy) -> Self {
        Self {
            vocab,
            eos: vec![eos],
            policy,
            evaluated: Vec::new(),
            recorder: Arc::new(Mutex::new(Recorder::default())),
            fail_on_call: None,
        }
    }

    fn script(text: &str) -> Self {
        Self::new(256, 0, Policy::Script(text.bytes().map(TokenId::from).collect()))
    }

    fn script_bytes(bytes: &[u8]) -> Self {
        Self::new(256, 0, Policy::Script(bytes.iter().copied().map(TokenId::from).collect()))
    }

    fn letters() -> Self {
        Self::new(256, 0, Policy::Letters)
    }

    fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    fn recorder(&self) -> Arc<Mutex<Recorder>> {
        self.recorder.clone()
    }

    fn next_token(&self, history: &[TokenId], prompt_len: usize) -> TokenId {
        match &self.policy {
            Policy::Always(token) => *token,
            Policy::Script(script) => script
                .get(history.len() - prompt_len)
                .copied()
                .unwrap_or(self.eos[0]),
            Policy::Letters => {
                let h = history
                    .iter()
                    .fold(7u32, |acc, &t| acc.wrapping_mul(31).wrapping_add(t));
                TokenId::from(b'a') + h % 26
            }
        }
    }
}

impl ModelRuntime for StubRuntime {
    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn eos_token_ids(&self) -> &[TokenId] {
        &self.eos
    }

    fn next_token_logits(
        &mut self,
        history: &[TokenId],
        _config: &GenerationConfig,
        n_past: usize,
        prompt_len: usize,
    ) -> anyhow::Result<Vec<f32>> {
        let call = {
            let mut recorder = self.recorder.lock();
            recorder.calls.push((n_past, history[n_past..].to_vec()));
            recorder.calls.len()
        };
        if self.fail_on_call == Some(call) {
            bail!("simulated device failure");
        }
        if n_past > self.evaluated.len() || self.evaluated[..n_past] != history[..n_past] {
            bail!("runtime does not hold the first {} tokens", n_past);
        }
        self.evaluated.truncate(n_past);
        self.evaluated.extend_from_slice(&history[n_past..]);

        let mut logits = vec![0.0; self.vocab];
        logits[self.next_token(history, prompt_len) as usize] = 10.0;
        Ok(logits)
    }

    fn eval_logits(
        &mut self,
        history: &[TokenId],
        config: &GenerationConfig,
        n_past: usize,
        prompt_len: usize,
    ) -> anyhow::Result<Vec<Vec<f32>>> {
        let last = self.next_token_logits(history, config, n_past, prompt_len)?;
        let mut rows = vec![vec![0.0; self.vocab]; history.len() - n_past - 1];
        rows.push(last);
        Ok(rows)
    }

    fn decode(&self, tokens: &[TokenId]) -> Vec<u8> {
        tokens.iter().filter(|&&t| t < 256).map(|&t| t as u8).collect()
    }

    fn save_state(&self) -> anyhow::Result<Vec<u8>> {
        self.recorder.lock().saves += 1;
        Ok(self.evaluated.iter().flat_map(|t| t.to_le_bytes()).collect())
    }

    fn load_state(&mut self, blob: &[u8]) -> anyhow::Result<()> {
        self.recorder.lock().loads += 1;
        if blob.len() % 4 != 0 {
            bail!("blob is not a token list");
        }
        self.evaluated = blob
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(())
    }
}

fn engine_with(runtime: StubRuntime) -> InferenceEngine {
    InferenceEngine::new(Box::new(runtime), EngineConfig::with_model_name("stub").max_context_length(64)).unwrap()
}

fn greedy(prompt: Vec<TokenId>, max_new_tokens: usize) -> GenerationRequest {
    GenerationRequest::new(
        prompt,
        GenerationConfig {
            max_new_tokens,
            ..GenerationConfig::greedy()
        },
    )
}

#[test]
fn test_eos_first_token() {
    let engine = engine_with(StubRuntime::new(100, 99, Policy::Always(99)));
    let request = GenerationRequest::new(
        vec![1, 2, 3],
        GenerationConfig {
            max_length: 6,
            ..GenerationConfig::greedy()
        },
    );

    let completion = engine.create_completion(&request, &CancelToken::new()).unwrap();
    assert_eq!(completion.finish_reason, Some(FinishReason::Stop));
    assert_eq!(completion.usage.completion_tokens, 1);
    assert_eq!(completion.usage.total_tokens, 4);
    assert_eq!(completion.text, "");
    assert!(completion.id.starts_with("cmpl-"));
    assert_eq!(completion.model, "stub");
}

#[test]
fn test_stop_string_never_leaks() {
    let engine = engine_with(StubRuntime::script("go STOP now"));
    let request = greedy(vec![1, 2, 3], 32).with_stop(StopSpec::strings(["STOP"]));

    let mut fragments = Vec::new();
    let output = engine
        .generate(&request, &CancelToken::new(), None, |fragment, _| {
            fragments.push(fragment.to_string());
            true
        })
        .unwrap();

    assert_eq!(output.text, "go ");
    assert_eq!(fragments.concat(), "go ");
    assert!(fragments.iter().all(|f| !f.contains("STOP") && !f.contains("ST")));
    assert_eq!(output.phase, DecodePhase::StoppedStopString);
    assert_eq!(output.finish_reason, Some(FinishReason::Stop));
}

#[test]
fn test_stop_string_function_call_classification() {
    let engine = engine_with(StubRuntime::script("call<|observation|>tail"));
    let request = greedy(vec![1], 64).with_stop(
        StopSpec::strings(["<|observation|>"]).with_string_finish(StopStringFinish::FunctionCall),
    );

    let completion = engine.create_completion(&request, &CancelToken::new()).unwrap();
    assert_eq!(completion.text, "call");
    assert_eq!(completion.finish_reason, Some(FinishReason::FunctionCall));
}

#[test]
fn test_split_code_point_never_replaced() {
    let text = "a€b€";
    let engine = engine_with(StubRuntime::script_bytes(text.as_bytes()));

    let mut fragments = Vec::new();
    let output = engine
        .generate(&greedy(vec![1], 32), &CancelToken::new(), None, |fragment, _| {
            fragments.push(fragment.to_string());
            true
        })
        .unwrap();

    assert_eq!(output.text, text);
    assert!(fragments.iter().all(|f| !f.contains('\u{FFFD}')));
    // one token per byte, plus eos
    assert_eq!(output.completion_tokens.len(), text.len() + 1);
}

#[test]
fn test_live_prefix_reuse_prefills_only_suffix() {
    let runtime = StubRuntime::letters();
    let recorder = runtime.recorder();
    let engine = engine_with(runtime);

    engine.create_completion(&greedy(vec![1, 2, 3], 2), &CancelToken::new()).unwrap();
    let first_calls = recorder.lock().calls.len();

    let output = engine
        .generate(&greedy(vec![1, 2, 3, 4, 5], 2), &CancelToken::new(), None, |_, _| true)
        .unwrap();
    assert_eq!(output.reused_tokens, 3);

    let recorder = recorder.lock();
    assert_eq!(recorder.calls[first_calls], (3, vec![4, 5]));
    assert_eq!(recorder.loads, 0);
    // the cached entry holds no more of the prompt than the live context
    assert_eq!(engine.cache_stats().hits, 0);
}

#[test]
fn test_cached_state_prefills_only_suffix() {
    let runtime = StubRuntime::letters();
    let recorder = runtime.recorder();
    let engine = engine_with(runtime);

    engine.create_completion(&greedy(vec![1, 2, 3], 2), &CancelToken::new()).unwrap();
    // replaces the live context so only the state cache can help
    engine.create_completion(&greedy(vec![40, 41], 2), &CancelToken::new()).unwrap();
    let before = recorder.lock().calls.len();

    let output = engine
        .generate(&greedy(vec![1, 2, 3, 4, 5], 2), &CancelToken::new(), None, |_, _| true)
        .unwrap();
    assert_eq!(output.reused_tokens, 3);

    let recorder = recorder.lock();
    assert_eq!(recorder.loads, 1);
    assert_eq!(recorder.calls[before], (3, vec![4, 5]));
    assert_eq!(engine.cache_stats().hits, 1);
}

#[test]
fn test_cold_and_warm_outputs_match() {
    let prompt = vec![10, 11, 12, 13];

    let cold_engine = engine_with(StubRuntime::letters());
    let cold = cold_engine
        .create_completion(&greedy(prompt.clone(), 8), &CancelToken::new())
        .unwrap();

    let runtime = StubRuntime::letters();
    let recorder = runtime.recorder();
    let warm_engine = engine_with(runtime);
    warm_engine
        .create_completion(&greedy(vec![10, 11, 12], 8), &CancelToken::new())
        .unwrap();
    warm_engine
        .create_completion(&greedy(vec![50, 51], 8), &CancelToken::new())
        .unwrap();
    let warm = warm_engine
        .create_completion(&greedy(prompt, 8), &CancelToken::new())
        .unwrap();

    assert_eq!(recorder.lock().loads, 1);
    assert_eq!(warm.text, cold.text);
    assert_eq!(warm.tokens, cold.tokens);
    assert_eq!(warm.usage, cold.usage);
}

#[test]
fn test_termination_bound() {
    let runtime = StubRuntime::letters();
    let recorder = runtime.recorder();
    let engine = engine_with(runtime);

    let prompt = vec![1, 2, 3, 4];
    let request = GenerationRequest::new(
        prompt.clone(),
        GenerationConfig {
            max_length: 10,
            max_new_tokens: 0,
            ..GenerationConfig::greedy()
        },
    );
    let completion = engine.create_completion(&request, &CancelToken::new()).unwrap();

    assert_eq!(completion.finish_reason, Some(FinishReason::Length));
    assert_eq!(completion.usage.completion_tokens, 10 - prompt.len());
    assert!(recorder.lock().calls.len() <= 10 - prompt.len());
}

#[test]
fn test_validation_errors_before_generation() {
    let runtime = StubRuntime::letters();
    let recorder = runtime.recorder();
    let engine = engine_with(runtime);

    let overflow = greedy((0..64).collect(), 4);
    assert!(matches!(
        engine.create_completion(&overflow, &CancelToken::new()),
        Err(EngineError::ContextOverflow { .. })
    ));

    let mut bad_top_p = greedy(vec![1], 4);
    bad_top_p.config.top_p = 0.0;
    let err = engine.create_completion_stream(bad_top_p, CancelToken::new()).err().unwrap();
    assert!(matches!(err, EngineError::InvalidSamplingParameter { name: "top_p", .. }));

    assert!(recorder.lock().calls.is_empty());
}

#[test]
fn test_corrupt_cache_entry_falls_back_to_full_prefill() {
    let runtime = StubRuntime::letters();
    let recorder = runtime.recorder();
    let engine = engine_with(runtime);

    let mut context = ContextState::new(64, LogitsRetention::Last);
    context.prefill(&[1, 2, 3]).unwrap();
    engine
        .state_cache()
        .store(vec![1, 2, 3, 9], context, StateBlob::with_declared_len(vec![0; 12], 40));

    let output = engine
        .generate(&greedy(vec![1, 2, 3, 4], 2), &CancelToken::new(), None, |_, _| true)
        .unwrap();

    assert_eq!(output.reused_tokens, 0);
    let recorder = recorder.lock();
    assert_eq!(recorder.calls[0], (0, vec![1, 2, 3, 4]));
    assert_eq!(recorder.loads, 0);
    assert_eq!(engine.cache_stats().corruptions, 1);
}

#[test]
fn test_cancelled_generation_not_cached() {
    let engine = engine_with(StubRuntime::letters());
    let cancel = CancelToken::new();
    cancel.cancel();

    let completion = engine.create_completion(&greedy(vec![1, 2], 8), &cancel).unwrap();
    assert_eq!(completion.finish_reason, None);
    assert_eq!(engine.cache_stats().entries, 0);

    engine.create_completion(&greedy(vec![1, 2], 8), &CancelToken::new()).unwrap();
    assert_eq!(engine.cache_stats().entries, 1);
}

#[test]
fn test_grammar_constrained_completion() {
    struct OnlyX;
    impl GrammarConstraint for OnlyX {
        fn is_allowed(&self, token: TokenId) -> bool {
            token == TokenId::from(b'x')
        }
        fn accept(&mut self, _token: TokenId) {}
        fn reset(&mut self) {}
    }

    let engine = engine_with(StubRuntime::letters());
    let completion = engine
        .create_completion_constrained(&greedy(vec![1], 3), &CancelToken::new(), &mut OnlyX)
        .unwrap();
    assert_eq!(completion.text, "xxx");
}

#[test]
fn test_grammar_reset_once_per_generation() {
    #[derive(Default)]
    struct Counting {
        resets: usize,
        accepted: Vec<TokenId>,
    }
    impl GrammarConstraint for Counting {
        fn is_allowed(&self, _token: TokenId) -> bool {
            true
        }
        fn accept(&mut self, token: TokenId) {
            self.accepted.push(token);
        }
        fn reset(&mut self) {
            self.resets += 1;
            self.accepted.clear();
        }
    }

    let engine = engine_with(StubRuntime::letters());
    let mut grammar = Counting::default();

    let first = engine
        .create_completion_constrained(&greedy(vec![1, 2], 3), &CancelToken::new(), &mut grammar)
        .unwrap();
    assert_eq!(grammar.resets, 1);
    assert_eq!(grammar.accepted, first.tokens);

    let second = engine
        .create_completion_constrained(&greedy(vec![7], 2), &CancelToken::new(), &mut grammar)
        .unwrap();
    assert_eq!(grammar.resets, 2);
    assert_eq!(grammar.accepted, second.tokens);
    assert_eq!(grammar.accepted.len(), 2);

    // eos is accepted like any other sampled token
    let engine = engine_with(StubRuntime::script("ok"));
    let done = engine
        .create_completion_constrained(&greedy(vec![1], 8), &CancelToken::new(), &mut grammar)
        .unwrap();
    assert_eq!(grammar.resets, 3);
    assert_eq!(done.tokens, vec![TokenId::from(b'o'), TokenId::from(b'k'), 0]);
    assert_eq!(grammar.accepted, done.tokens);
}

#[test]
fn test_full_logits_retention_tracks_every_position() {
    let runtime = StubRuntime::letters();
    let recorder = runtime.recorder();
    let engine = InferenceEngine::new(
        Box::new(runtime),
        EngineConfig::with_model_name("stub")
            .max_context_length(64)
            .logits_retention(LogitsRetention::All),
    )
    .unwrap();
    let rows_match = || engine.live_logits_rows() == engine.live_tokens().len();

    let first = engine.create_completion(&greedy(vec![1, 2], 3), &CancelToken::new()).unwrap();
    assert_eq!(engine.live_logits_rows(), 4);
    assert!(rows_match());

    // live prefix reuse
    let mut prompt: Vec<TokenId> = vec![1, 2];
    prompt.extend_from_slice(&first.tokens[..2]);
    let mut extended = prompt.clone();
    extended.push(5);
    let output = engine
        .generate(&greedy(extended, 2), &CancelToken::new(), None, |_, _| true)
        .unwrap();
    assert_eq!(output.reused_tokens, 4);
    assert!(rows_match());

    // restore from the state cache after the live context moved away
    engine.create_completion(&greedy(vec![40, 41], 2), &CancelToken::new()).unwrap();
    assert!(rows_match());
    prompt.push(9);
    let output = engine
        .generate(&greedy(prompt, 2), &CancelToken::new(), None, |_, _| true)
        .unwrap();
    assert_eq!(output.reused_tokens, 4);
    assert_eq!(recorder.lock().loads, 1);
    assert_eq!(engine.live_tokens().len(), 6);
    assert!(rows_match());
}

#[tokio::test]
async fn test_stream_chunks() {
    let engine = engine_with(StubRuntime::script("go STOP now"));
    let request = greedy(vec![1, 2, 3], 32).with_stop(StopSpec::strings(["STOP"]));
    let mut stream = engine.create_completion_stream(request, CancelToken::new()).unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }

    let first = &chunks[0];
    assert_eq!(first.role, Some(Role::Assistant));
    assert_eq!(first.text_delta, "");

    let last = chunks.last().unwrap();
    assert_eq!(last.finish_reason, Some(FinishReason::Stop));
    assert_eq!(last.text_delta, "");
    assert_eq!(last.cumulative_text, "go ");

    for chunk in &chunks {
        assert_eq!(chunk.id, stream.id());
        assert!(!chunk.text_delta.contains("STOP"));
        assert_eq!(
            chunk.usage.prompt_tokens + chunk.usage.completion_tokens,
            chunk.usage.total_tokens
        );
    }
    assert!(chunks[..chunks.len() - 1].iter().all(|c| c.finish_reason.is_none()));
    let streamed: String = chunks.iter().map(|c| c.text_delta.as_str()).collect();
    assert_eq!(streamed, "go ");
}

#[tokio::test]
async fn test_stream_runtime_failure_is_terminal() {
    let engine = engine_with(StubRuntime::letters().failing_on_call(3));
    let mut stream = engine
        .create_completion_stream(greedy(vec![1, 2], 16), CancelToken::new())
        .unwrap();

    let mut texts = Vec::new();
    let mut error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                assert!(chunk.finish_reason.is_none());
                texts.push(chunk.text_delta);
            }
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }

    assert!(matches!(error, Some(EngineError::ModelRuntimeFailure(_))));
    assert!(stream.next().await.is_none());
    // fragments emitted before the failure stay delivered
    assert_eq!(texts.concat().len(), 2);
    assert!(engine.live_tokens().is_empty());
    assert_eq!(engine.cache_stats().entries, 0);
}

#[test]
fn test_stream_cancel_midway_skips_cache() {
    let runtime = StubRuntime::letters();
    let engine = InferenceEngine::new(
        Box::new(runtime),
        EngineConfig::with_model_name("stub")
            .max_context_length(512)
            .stream_buffer(1),
    )
    .unwrap();

    let cancel = CancelToken::new();
    let mut stream = engine
        .create_completion_stream(greedy(vec![1, 2], 400), cancel.clone())
        .unwrap();

    let role = stream.blocking_next().unwrap().unwrap();
    assert_eq!(role.role, Some(Role::Assistant));
    let first = stream.blocking_next().unwrap().unwrap();
    assert_eq!(first.text_delta.len(), 1);
    cancel.cancel();

    let mut remaining = 0;
    while let Some(item) = stream.blocking_next() {
        let chunk = item.unwrap();
        assert!(chunk.finish_reason.is_none());
        remaining += 1;
    }
    assert!(remaining < 400);
    assert_eq!(engine.cache_stats().entries, 0);
}

#[test]
fn test_usage_invariant_in_every_chunk() {
    let engine = engine_with(StubRuntime::letters());
    let mut stream = engine
        .create_completion_stream(greedy(vec![5, 6, 7], 5), CancelToken::new())
        .unwrap();

    let mut last_completion = 0;
    while let Some(item) = stream.blocking_next() {
        let usage = item.unwrap().usage;
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.prompt_tokens + usage.completion_tokens, usage.total_tokens);
        assert!(usage.completion_tokens >= last_completion);
        last_completion = usage.completion_tokens;
    }
    assert_eq!(last_completion, 5);
}

#[test]
fn test_mirostat_through_engine() {
    let engine = engine_with(StubRuntime::letters());
    let request = GenerationRequest::new(
        vec![1, 2, 3],
        GenerationConfig {
            max_new_tokens: 6,
            temperature: 0.7,
            mirostat_mode: MirostatMode::V2,
            seed: Some(5),
            ..Default::default()
        },
    );
    let completion = engine.create_completion(&request, &CancelToken::new()).unwrap();
    assert_eq!(completion.usage.completion_tokens, 6);
    assert_eq!(completion.finish_reason, Some(FinishReason::Length));
}
