use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::context::{longest_token_prefix, ContextState};
use crate::error::{EngineError, Result};
use crate::request::TokenId;

/// Opaque runtime state plus the length it was saved with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBlob {
    declared_len: usize,
    bytes: Vec<u8>,
}

impl StateBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            declared_len: bytes.len(),
            bytes,
        }
    }

    /// Blob whose header claims `declared_len` bytes regardless of its payload
    pub fn with_declared_len(bytes: Vec<u8>, declared_len: usize) -> Self {
        Self {
            declared_len,
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Payload, once its size matches the declared length
    pub fn verify(&self) -> Result<&[u8]> {
        if self.declared_len != self.bytes.len() {
            return Err(EngineError::CacheCorruption {
                declared: self.declared_len,
                actual: self.bytes.len(),
            });
        }
        Ok(&self.bytes)
    }
}

/// Snapshot of a finished generation, restorable as a warm start
#[derive(Debug, Clone)]
pub struct CachedState {
    /// Prompt followed by the completion tokens
    pub key: Vec<TokenId>,
    /// Evaluated context at the time of saving
    pub context: ContextState,
    pub blob: StateBlob,
}

impl CachedState {
    pub fn verify(&self) -> Result<&[u8]> {
        self.blob.verify()
    }

    /// Tokens shared with `tokens`, counted over the evaluated context
    pub fn overlap(&self, tokens: &[TokenId]) -> usize {
        longest_token_prefix(self.context.history(), tokens)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub corruptions: u64,
    /// Sum of the stored blob sizes
    pub bytes: usize,
    pub byte_limit: Option<usize>,
}

#[derive(Default)]
struct Inner {
    /// Most recently used first
    entries: VecDeque<CachedState>,
    hits: u64,
    misses: u64,
    evictions: u64,
    corruptions: u64,
}

impl Inner {
    fn bytes(&self) -> usize {
        self.entries.iter().map(|e| e.blob.len()).sum()
    }
}

/// Bounded LRU of saved runtime states keyed by token sequence.
///
/// Bounded by entry count and, optionally, by the total size of the
/// stored blobs.
pub struct StateCache {
    capacity: usize,
    byte_limit: Option<usize>,
    inner: Mutex<Inner>,
}

impl StateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            byte_limit: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Also evict once the stored blobs exceed `limit` bytes in total
    pub fn with_byte_limit(mut self, limit: Option<usize>) -> Self {
        self.byte_limit = limit;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn byte_limit(&self) -> Option<usize> {
        self.byte_limit
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Entry sharing the longest prefix with `tokens`, if that prefix is
    /// longer than `longer_than`.
    ///
    /// Returns the overlap length with a copy of the entry. Entries that do
    /// not beat `longer_than` are left untouched. A corrupt entry is evicted
    /// and reported as a miss.
    pub fn lookup(&self, tokens: &[TokenId], longer_than: usize) -> Option<(usize, CachedState)> {
        let mut inner = self.inner.lock();

        let best = inner
            .entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (idx, entry.overlap(tokens)))
            .filter(|&(_, overlap)| overlap > longer_than)
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)));

        let Some((idx, overlap)) = best else {
            inner.misses += 1;
            return None;
        };

        if let Err(e) = inner.entries[idx].verify().map(|_| ()) {
            warn!("Dropping corrupt cache entry ({} tokens): {}", inner.entries[idx].key.len(), e);
            inner.entries.remove(idx);
            inner.corruptions += 1;
            inner.misses += 1;
            return None;
        }

        let entry = inner.entries.remove(idx)?;
        inner.entries.push_front(entry.clone());
        inner.hits += 1;
        debug!("State cache hit: {} shared tokens", overlap);
        Some((overlap, entry))
    }

    /// Insert a state, replacing any entry with the same key and evicting
    /// the least recently used ones beyond capacity or the byte limit.
    ///
    /// A blob larger than the byte limit on its own is not stored.
    pub fn store(&self, key: Vec<TokenId>, context: ContextState, blob: StateBlob) {
        if self.capacity == 0 {
            return;
        }
        if let Some(limit) = self.byte_limit {
            if blob.len() > limit {
                debug!("Not caching state of {} bytes (limit {})", blob.len(), limit);
                return;
            }
        }
        let mut inner = self.inner.lock();
        inner.entries.retain(|e| e.key != key);
        inner.entries.push_front(CachedState { key, context, blob });

        while inner.entries.len() > self.capacity
            || self.byte_limit.is_some_and(|limit| inner.bytes() > limit)
        {
            let Some(evicted) = inner.entries.pop_back() else {
                break;
            };
            inner.evictions += 1;
            debug!("Evicted cached state ({} tokens, {} bytes)", evicted.key.len(), evicted.blob.len());
        }
    }

    pub fn remove(&self, key: &[TokenId]) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.key != key);
        inner.entries.len() != before
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn stats(&self) -> StateCacheStats {
        let inner = self.inner.lock();
        StateCacheStats {
            entries: inner.entries.len(),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            corruptions: inner.corruptions,
            bytes: inner.bytes(),
            byte_limit: self.byte_limit,
        }
    }
}
