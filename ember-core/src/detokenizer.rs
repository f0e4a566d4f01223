//! Incremental detokenizer
//!
//! Turns the byte stream of sampled tokens into valid UTF-8 text fragments.
//! Fragments never end inside a multi-byte code point, never contain a
//! stop string, and never end with text that could still grow into one.

/// Result of feeding one token's bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetokenizeStep {
    /// Newly releasable text; empty when everything is withheld
    pub fragment: String,
    /// A full stop string matched during this step
    pub stop_found: bool,
}

pub struct IncrementalDetokenizer {
    stop_strings: Vec<String>,
    /// Bytes of a code point that is not complete yet
    pending: Vec<u8>,
    /// Decoded text, including the withheld tail
    text: String,
    /// Byte length of `text` already handed out
    emitted: usize,
    stopped: bool,
}

impl IncrementalDetokenizer {
    pub fn new<I, S>(stop_strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stop_strings: stop_strings
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
            pending: Vec::new(),
            text: String::new(),
            emitted: 0,
            stopped: false,
        }
    }

    /// Feed the bytes of one sampled token.
    pub fn push(&mut self, bytes: &[u8]) -> DetokenizeStep {
        if self.stopped {
            return DetokenizeStep::default();
        }
        self.pending.extend_from_slice(bytes);
        if incomplete_utf8_tail(&self.pending) {
            return DetokenizeStep::default();
        }

        self.text.push_str(&String::from_utf8_lossy(&self.pending));
        self.pending.clear();

        if let Some(pos) = self.first_stop_match() {
            self.text.truncate(pos.max(self.emitted));
            self.stopped = true;
            return DetokenizeStep {
                fragment: self.release(self.text.len()),
                stop_found: true,
            };
        }

        let held = self.partial_stop_suffix();
        let end = (self.text.len() - held).max(self.emitted);
        DetokenizeStep {
            fragment: self.release(end),
            stop_found: false,
        }
    }

    /// Release whatever is still withheld. Incomplete trailing bytes are dropped.
    pub fn finish(&mut self) -> String {
        self.pending.clear();
        if self.stopped {
            return String::new();
        }
        self.release(self.text.len())
    }

    /// Text released so far
    pub fn text(&self) -> &str {
        &self.text[..self.emitted]
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    fn release(&mut self, end: usize) -> String {
        let fragment = self.text[self.emitted..end].to_string();
        self.emitted = end;
        fragment
    }

    /// Earliest position at which any stop string occurs
    fn first_stop_match(&self) -> Option<usize> {
        self.stop_strings
            .iter()
            .filter_map(|s| self.text.find(s.as_str()))
            .min()
    }

    /// Length of the longest tail of `text` that is a proper prefix of some stop string
    fn partial_stop_suffix(&self) -> usize {
        self.stop_strings
            .iter()
            .filter_map(|stop| {
                (1..stop.len())
                    .rev()
                    .filter(|&k| stop.is_char_boundary(k))
                    .find(|&k| self.text.ends_with(&stop[..k]))
            })
            .max()
            .unwrap_or(0)
    }
}

/// Whether `bytes` ends inside a multi-byte UTF-8 sequence.
///
/// Only the last three bytes can hold the lead byte of an unfinished
/// sequence.
pub fn incomplete_utf8_tail(bytes: &[u8]) -> bool {
    for (distance, &b) in bytes.iter().rev().take(3).enumerate() {
        let needed = if b & 0xE0 == 0xC0 {
            2
        } else if b & 0xF0 == 0xE0 {
            3
        } else if b & 0xF8 == 0xF0 {
            4
        } else if b & 0xC0 == 0x80 {
            // continuation byte, keep looking for the lead
            continue;
        } else {
            return false;
        };
        return needed > distance + 1;
    }
    false
}
