//! Completion assembly: OpenAI-style chunks, usage accounting and the
//! streaming channel between the decode thread and a consumer.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::engine::{CancelToken, GenerationOutput, InferenceEngine};
use crate::error::{EngineError, Result};
use crate::model::GrammarConstraint;
use crate::request::{GenerationRequest, TokenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    FunctionCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Assistant,
}

/// Token accounting; `total_tokens == prompt_tokens + completion_tokens`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One streamed piece of a completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub role: Option<Role>,
    pub text_delta: String,
    pub cumulative_text: String,
    pub finish_reason: Option<FinishReason>,
    /// Tokens accounted for up to this chunk
    pub usage: Usage,
}

/// Aggregated, non-streamed completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub text: String,
    /// `None` when the generation was cancelled
    pub finish_reason: Option<FinishReason>,
    pub usage: Usage,
    pub tokens: Vec<TokenId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub logprobs: Option<Vec<f32>>,
}

/// Identity shared by every chunk of one generation
#[derive(Debug, Clone)]
struct ChunkHeader {
    id: String,
    created: u64,
    model: String,
}

impl ChunkHeader {
    fn new(model: &str) -> Self {
        Self {
            id: format!("cmpl-{}", Uuid::new_v4()),
            created: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            model: model.to_string(),
        }
    }

    fn chunk(&self, text_delta: &str, cumulative_text: &str, usage: Usage) -> CompletionChunk {
        CompletionChunk {
            id: self.id.clone(),
            object: "text_completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            role: None,
            text_delta: text_delta.to_string(),
            cumulative_text: cumulative_text.to_string(),
            finish_reason: None,
            usage,
        }
    }

    fn role_chunk(&self, prompt_tokens: usize) -> CompletionChunk {
        CompletionChunk {
            role: Some(Role::Assistant),
            ..self.chunk("", "", Usage::new(prompt_tokens, 0))
        }
    }

    fn final_chunk(&self, output: &GenerationOutput, finish_reason: FinishReason) -> CompletionChunk {
        CompletionChunk {
            finish_reason: Some(finish_reason),
            ..self.chunk(
                "",
                &output.text,
                Usage::new(output.prompt_tokens, output.completion_tokens.len()),
            )
        }
    }

    fn completion(self, output: GenerationOutput) -> Completion {
        Completion {
            usage: Usage::new(output.prompt_tokens, output.completion_tokens.len()),
            id: self.id,
            object: "text_completion".to_string(),
            created: self.created,
            model: self.model,
            text: output.text,
            finish_reason: output.finish_reason,
            tokens: output.completion_tokens,
            logprobs: output.logprobs,
        }
    }
}

/// Receiving end of a streamed completion.
///
/// Yields a role chunk, one chunk per text fragment and a final chunk
/// carrying the finish reason. An `Err` item is terminal. A cancelled
/// stream closes without a final chunk.
pub struct CompletionStream {
    id: String,
    receiver: mpsc::Receiver<Result<CompletionChunk>>,
}

impl CompletionStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn next(&mut self) -> Option<Result<CompletionChunk>> {
        self.receiver.recv().await
    }

    /// Blocking receive for callers outside an async runtime
    pub fn blocking_next(&mut self) -> Option<Result<CompletionChunk>> {
        self.receiver.blocking_recv()
    }
}

impl InferenceEngine {
    /// Generate a full completion.
    pub fn create_completion(&self, request: &GenerationRequest, cancel: &CancelToken) -> Result<Completion> {
        let header = ChunkHeader::new(self.model_name());
        let output = self.generate(request, cancel, None, |_, _| true)?;
        Ok(header.completion(output))
    }

    /// Generate a full completion under a grammar.
    pub fn create_completion_constrained(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
        grammar: &mut dyn GrammarConstraint,
    ) -> Result<Completion> {
        let header = ChunkHeader::new(self.model_name());
        let output = self.generate(request, cancel, Some(grammar), |_, _| true)?;
        Ok(header.completion(output))
    }

    /// Start a streamed completion on a dedicated decode thread.
    ///
    /// Validation errors are returned here, before any chunk is produced.
    /// Dropping the stream cancels the generation at the next fragment.
    pub fn create_completion_stream(
        &self,
        request: GenerationRequest,
        cancel: CancelToken,
    ) -> Result<CompletionStream> {
        self.spawn_stream(request, cancel, None)
    }

    pub fn create_completion_stream_constrained(
        &self,
        request: GenerationRequest,
        cancel: CancelToken,
        grammar: Box<dyn GrammarConstraint>,
    ) -> Result<CompletionStream> {
        self.spawn_stream(request, cancel, Some(grammar))
    }

    fn spawn_stream(
        &self,
        request: GenerationRequest,
        cancel: CancelToken,
        grammar: Option<Box<dyn GrammarConstraint>>,
    ) -> Result<CompletionStream> {
        self.validate(&request)?;

        let (tx, receiver) = mpsc::channel(self.config().stream_buffer);
        let header = ChunkHeader::new(self.model_name());
        let id = header.id.clone();
        let engine = self.clone();

        std::thread::Builder::new()
            .name("ember-decode".to_string())
            .spawn(move || engine.stream_worker(request, cancel, grammar, header, tx))
            .map_err(|e| EngineError::ModelRuntimeFailure(anyhow!("failed to spawn decode thread: {}", e)))?;

        Ok(CompletionStream { id, receiver })
    }

    fn stream_worker(
        &self,
        request: GenerationRequest,
        cancel: CancelToken,
        mut grammar: Option<Box<dyn GrammarConstraint>>,
        header: ChunkHeader,
        tx: mpsc::Sender<Result<CompletionChunk>>,
    ) {
        let prompt_tokens = request.prompt_tokens.len();
        if tx.blocking_send(Ok(header.role_chunk(prompt_tokens))).is_err() {
            debug!("Stream {} dropped before generation started", header.id);
            return;
        }

        let mut cumulative = String::new();
        let result = self.generate(&request, &cancel, grammar_mut(&mut grammar), |fragment, sampled| {
            cumulative.push_str(fragment);
            let usage = Usage::new(prompt_tokens, sampled);
            tx.blocking_send(Ok(header.chunk(fragment, &cumulative, usage))).is_ok()
        });

        match result {
            Ok(output) => match output.finish_reason {
                Some(reason) => {
                    let _ = tx.blocking_send(Ok(header.final_chunk(&output, reason)));
                }
                None => debug!(
                    "Stream {} cancelled after {} tokens",
                    header.id,
                    output.completion_tokens.len()
                ),
            },
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
            }
        }
    }
}

fn grammar_mut(grammar: &mut Option<Box<dyn GrammarConstraint>>) -> Option<&mut dyn GrammarConstraint> {
    match grammar {
        Some(g) => Some(g.as_mut()),
        None => None,
    }
}
