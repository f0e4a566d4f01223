//! Context state: committed token history, cursor and logits rows for one session

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::request::TokenId;

/// How many logits rows a context keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogitsRetention {
    /// Only the row for the most recent position
    #[default]
    Last,
    /// One row per committed position
    All,
}

/// Tokens processed so far plus the logits the runtime produced for them.
///
/// Invariants: `n_tokens() <= max_context_length`; with
/// [`LogitsRetention::All`] the row count equals `n_tokens()` once the
/// runtime has answered, otherwise at most one row is held.
#[derive(Debug, Clone)]
pub struct ContextState {
    history: Vec<TokenId>,
    logits: Vec<Vec<f32>>,
    retention: LogitsRetention,
    max_context_length: usize,
}

impl ContextState {
    pub fn new(max_context_length: usize, retention: LogitsRetention) -> Self {
        Self {
            history: Vec::with_capacity(max_context_length.min(4096)),
            logits: Vec::new(),
            retention,
            max_context_length,
        }
    }

    /// Committed tokens
    pub fn history(&self) -> &[TokenId] {
        &self.history
    }

    /// Cursor: count of committed positions
    pub fn n_tokens(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn max_context_length(&self) -> usize {
        self.max_context_length
    }

    pub fn retention(&self) -> LogitsRetention {
        self.retention
    }

    /// Resize the window; shrinking below the committed history clears it.
    pub fn set_max_context_length(&mut self, max_context_length: usize) {
        self.max_context_length = max_context_length;
        if self.history.len() > max_context_length {
            self.reset();
        }
    }

    /// Commit a batch of tokens as processed history.
    pub fn prefill(&mut self, tokens: &[TokenId]) -> Result<()> {
        let total = self.history.len() + tokens.len();
        if total > self.max_context_length {
            return Err(EngineError::ContextOverflow {
                prompt_tokens: total,
                max_context_length: self.max_context_length,
            });
        }
        self.history.extend_from_slice(tokens);
        Ok(())
    }

    /// Commit a single token.
    pub fn append(&mut self, token: TokenId) -> Result<()> {
        self.prefill(std::slice::from_ref(&token))
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.logits.clear();
    }

    /// Drop history and logits beyond position `n`.
    pub fn truncate_to(&mut self, n: usize) {
        let before = self.history.len();
        self.history.truncate(n);
        match self.retention {
            LogitsRetention::All => self.logits.truncate(n),
            // the kept row belonged to a position that no longer exists
            LogitsRetention::Last if n < before => self.logits.clear(),
            LogitsRetention::Last => {}
        }
    }

    /// Store the rows the runtime returned for the newest positions.
    ///
    /// Rows are aligned to the tail of the history: the last row belongs
    /// to the last committed token.
    pub fn record_logits(&mut self, rows: Vec<Vec<f32>>) {
        match self.retention {
            LogitsRetention::Last => {
                if let Some(last) = rows.into_iter().last() {
                    self.logits.clear();
                    self.logits.push(last);
                }
            }
            LogitsRetention::All => {
                let first_pos = self.history.len().saturating_sub(rows.len());
                self.logits.truncate(first_pos);
                // positions evaluated without a row of their own stay empty
                self.logits.resize(first_pos, Vec::new());
                self.logits.extend(rows);
            }
        }
    }

    /// Logits for the next-token prediction
    pub fn last_logits(&self) -> Option<&[f32]> {
        self.logits.last().map(Vec::as_slice)
    }

    /// Logits row for `position`, when retained
    pub fn logits_at(&self, position: usize) -> Option<&[f32]> {
        match self.retention {
            LogitsRetention::All => self.logits.get(position).map(Vec::as_slice),
            LogitsRetention::Last if position + 1 == self.history.len() => self.last_logits(),
            LogitsRetention::Last => None,
        }
    }

    pub fn logits_rows(&self) -> usize {
        self.logits.len()
    }

    /// Length of the shared prefix between the committed history and `tokens`
    pub fn overlap(&self, tokens: &[TokenId]) -> usize {
        longest_token_prefix(&self.history, tokens)
    }
}

/// Length of the longest common prefix of two token sequences
pub fn longest_token_prefix(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
