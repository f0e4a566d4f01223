//! Model runtime seam
//!
//! The engine never touches weights, devices or tokenizers. Everything it
//! needs from a concrete backend (llama.cpp, chatglm.cpp, ...) goes through
//! [`ModelRuntime`], chosen once when the engine is built.

use anyhow::{bail, Result};

use crate::request::{GenerationConfig, TokenId};

/// Capability set a model backend exposes to the decode loop.
pub trait ModelRuntime: Send {
    /// Vocabulary size; every logits row has this many entries
    fn vocab_size(&self) -> usize;

    /// Token ids that end generation
    fn eos_token_ids(&self) -> &[TokenId];

    /// Newline token, used by the `penalize_nl` switch
    fn newline_token(&self) -> Option<TokenId> {
        None
    }

    /// Evaluate `history[n_past..]` on top of the `n_past` positions the
    /// runtime already holds, returning the logits row for the next token.
    fn next_token_logits(
        &mut self,
        history: &[TokenId],
        config: &GenerationConfig,
        n_past: usize,
        prompt_len: usize,
    ) -> Result<Vec<f32>>;

    /// Like [`next_token_logits`](Self::next_token_logits) but returns one
    /// row per evaluated position. Needed for full logits retention.
    fn eval_logits(
        &mut self,
        history: &[TokenId],
        config: &GenerationConfig,
        n_past: usize,
        prompt_len: usize,
    ) -> Result<Vec<Vec<f32>>> {
        let _ = (history, config, n_past, prompt_len);
        bail!("runtime does not expose per-position logits")
    }

    /// Raw bytes of the given tokens; may end inside a UTF-8 sequence
    fn decode(&self, tokens: &[TokenId]) -> Vec<u8>;

    /// Serialize the runtime's decode state (kv cache and friends)
    fn save_state(&self) -> Result<Vec<u8>>;

    /// Restore a blob produced by [`save_state`](Self::save_state)
    fn load_state(&mut self, blob: &[u8]) -> Result<()>;
}

/// Grammar collaborator restricting which tokens may be sampled next.
pub trait GrammarConstraint: Send {
    fn is_allowed(&self, token: TokenId) -> bool;

    /// Advance the grammar past a sampled token
    fn accept(&mut self, token: TokenId);

    fn reset(&mut self);
}
