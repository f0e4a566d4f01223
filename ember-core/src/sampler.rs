//! Sampling engine - turns a logits row into the next token id
//!
//! Stage order: logit bias, repetition/frequency/presence penalties,
//! grammar mask, then either a greedy/softmax short-circuit, the
//! top-k → tail-free → typical → top-p → min-p → temperature chain, or
//! mirostat on the temperature-scaled distribution. Every narrowing stage
//! keeps at least one candidate.

use anyhow::anyhow;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::model::GrammarConstraint;
use crate::request::{GenerationConfig, MirostatMode, TokenId};

/// Number of top candidates mirostat v1 uses to estimate the Zipf exponent
const MIROSTAT_M: usize = 100;

/// One entry of the candidate set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Candidate set for one decode step, narrowed in place by each stage
#[derive(Debug, Clone)]
pub struct Candidates {
    data: Vec<TokenData>,
    sorted: bool,
}

impl Candidates {
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenData {
                id: id as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        Self { data, sorted: false }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[TokenData] {
        &self.data
    }

    pub fn ids(&self) -> Vec<TokenId> {
        self.data.iter().map(|c| c.id).collect()
    }

    fn position(&self, id: TokenId) -> Option<usize> {
        let idx = id as usize;
        match self.data.get(idx) {
            Some(c) if c.id == id => Some(idx),
            _ => self.data.iter().position(|c| c.id == id),
        }
    }

    pub fn logit_of(&self, id: TokenId) -> Option<f32> {
        self.position(id).map(|i| self.data[i].logit)
    }

    pub fn set_logit(&mut self, id: TokenId, logit: f32) {
        if let Some(i) = self.position(id) {
            self.data[i].logit = logit;
            self.sorted = false;
        }
    }

    pub fn add_bias(&mut self, id: TokenId, bias: f32) {
        if let Some(i) = self.position(id) {
            self.data[i].logit += bias;
            self.sorted = false;
        }
    }

    fn sort_by_logit(&mut self) {
        if !self.sorted {
            self.data
                .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(Ordering::Equal));
            self.sorted = true;
        }
    }

    /// Sort by logit (descending) and fill `p` with normalized probabilities.
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }
        self.sort_by_logit();
        let max = self.data[0].logit;
        let mut sum = 0.0f32;
        for c in &mut self.data {
            c.p = if c.logit == f32::NEG_INFINITY {
                0.0
            } else {
                (c.logit - max).exp()
            };
            sum += c.p;
        }
        if sum > 0.0 {
            for c in &mut self.data {
                c.p /= sum;
            }
        }
    }

    /// Highest-logit candidate; ties go to the lowest id.
    pub fn argmax(&self) -> Option<TokenId> {
        self.data
            .iter()
            .max_by(|a, b| {
                a.logit
                    .partial_cmp(&b.logit)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|c| c.id)
    }

    /// llama.cpp-style repetition penalty plus OpenAI-style frequency and
    /// presence penalties over `last_tokens`.
    pub fn apply_penalties(
        &mut self,
        last_tokens: &[TokenId],
        repeat: f32,
        frequency: f32,
        presence: f32,
    ) {
        if last_tokens.is_empty() || (repeat == 1.0 && frequency == 0.0 && presence == 0.0) {
            return;
        }
        let mut counts: HashMap<TokenId, usize> = HashMap::new();
        for &t in last_tokens {
            *counts.entry(t).or_default() += 1;
        }
        for c in &mut self.data {
            let Some(&count) = counts.get(&c.id) else {
                continue;
            };
            if c.logit <= 0.0 {
                c.logit *= repeat;
            } else {
                c.logit /= repeat;
            }
            c.logit -= count as f32 * frequency + presence;
        }
        self.sorted = false;
    }

    /// Mask out every token the grammar rejects.
    pub fn apply_grammar(&mut self, grammar: &dyn GrammarConstraint) -> Result<()> {
        let mut any = false;
        for c in &mut self.data {
            if grammar.is_allowed(c.id) {
                any |= c.logit != f32::NEG_INFINITY;
            } else {
                c.logit = f32::NEG_INFINITY;
            }
        }
        if !any {
            return Err(EngineError::ModelRuntimeFailure(anyhow!(
                "grammar rejected every candidate"
            )));
        }
        Ok(())
    }

    pub fn top_k(&mut self, k: usize, min_keep: usize) {
        if k == 0 {
            return;
        }
        let k = k.max(min_keep).min(self.data.len());
        self.sort_by_logit();
        self.data.truncate(k);
    }

    /// Tail-free sampling: cut where the second derivative of the sorted
    /// probability curve has accumulated `z` of its mass.
    pub fn tail_free(&mut self, z: f32, min_keep: usize) {
        if z >= 1.0 || self.data.len() <= 2 {
            return;
        }
        self.softmax();

        let first: Vec<f32> = self.data.windows(2).map(|w| w[0].p - w[1].p).collect();
        let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();
        let sum: f32 = second.iter().sum();
        if sum > 1e-6 {
            for d in &mut second {
                *d /= sum;
            }
        } else {
            let uniform = 1.0 / second.len() as f32;
            second.iter_mut().for_each(|d| *d = uniform);
        }

        let mut cum = 0.0f32;
        let mut last_idx = self.data.len();
        for (i, d) in second.iter().enumerate() {
            cum += d;
            if cum > z && i >= min_keep {
                last_idx = i;
                break;
            }
        }
        self.data.truncate(last_idx.max(min_keep));
    }

    /// Locally typical sampling: keep tokens whose surprise is closest to
    /// the distribution's entropy until `p` of the mass is covered.
    pub fn typical(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 || self.data.is_empty() {
            return;
        }
        self.softmax();

        let entropy: f32 = -self
            .data
            .iter()
            .filter(|c| c.p > 0.0)
            .map(|c| c.p * c.p.ln())
            .sum::<f32>();

        let mut order: Vec<(usize, f32)> = self
            .data
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let shifted = if c.p > 0.0 {
                    (-c.p.ln() - entropy).abs()
                } else {
                    f32::INFINITY
                };
                (i, shifted)
            })
            .collect();
        order.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let mut cum = 0.0f32;
        let mut last_idx = order.len();
        for (i, &(idx, _)) in order.iter().enumerate() {
            cum += self.data[idx].p;
            if cum > p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }

        self.data = order[..last_idx]
            .iter()
            .map(|&(idx, _)| self.data[idx])
            .collect();
        self.sorted = false;
    }

    /// Nucleus filtering.
    pub fn top_p(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 || self.data.is_empty() {
            return;
        }
        self.softmax();

        let mut cum = 0.0f32;
        let mut last_idx = self.data.len();
        for (i, c) in self.data.iter().enumerate() {
            cum += c.p;
            if cum >= p && i + 1 >= min_keep {
                last_idx = i + 1;
                break;
            }
        }
        self.data.truncate(last_idx);
    }

    /// Drop tokens less likely than `p` times the most likely one.
    pub fn min_p(&mut self, p: f32, min_keep: usize) {
        if p <= 0.0 || self.data.is_empty() {
            return;
        }
        self.softmax();

        let threshold = p * self.data[0].p;
        let keep = self
            .data
            .iter()
            .take_while(|c| c.p >= threshold)
            .count()
            .max(min_keep)
            .min(self.data.len());
        self.data.truncate(keep);
    }

    pub fn temperature(&mut self, temp: f32) {
        for c in &mut self.data {
            c.logit /= temp;
        }
    }
}

/// Adaptive target-surprise state shared across the steps of one generation
#[derive(Debug, Clone, PartialEq)]
pub struct MirostatState {
    pub tau: f32,
    pub eta: f32,
    pub mu: f32,
}

impl MirostatState {
    pub fn new(tau: f32, eta: f32) -> Self {
        Self {
            tau,
            eta,
            mu: 2.0 * tau,
        }
    }

    /// Move `mu` against the error between observed and target surprise
    pub fn update(&mut self, observed_surprise: f32) {
        self.mu -= self.eta * (observed_surprise - self.tau);
    }
}

/// Token sampler with a seeded RNG
pub struct Sampler {
    rng: StdRng,
    newline_token: Option<TokenId>,
    mirostat: Option<MirostatState>,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            newline_token: None,
            mirostat: None,
        }
    }

    pub fn with_newline_token(mut self, token: Option<TokenId>) -> Self {
        self.newline_token = token;
        self
    }

    /// Current mirostat state, once a mirostat step has run
    pub fn mirostat(&self) -> Option<&MirostatState> {
        self.mirostat.as_ref()
    }

    /// Sample the next token from `logits` given the running history.
    pub fn sample(
        &mut self,
        logits: &[f32],
        history: &[TokenId],
        config: &GenerationConfig,
    ) -> Result<TokenId> {
        self.run(logits, history, config, None)
    }

    /// Same as [`sample`](Self::sample) with a grammar mask applied.
    pub fn sample_constrained(
        &mut self,
        logits: &[f32],
        history: &[TokenId],
        config: &GenerationConfig,
        grammar: &mut dyn GrammarConstraint,
    ) -> Result<TokenId> {
        self.run(logits, history, config, Some(grammar))
    }

    fn run(
        &mut self,
        logits: &[f32],
        history: &[TokenId],
        config: &GenerationConfig,
        mut grammar: Option<&mut dyn GrammarConstraint>,
    ) -> Result<TokenId> {
        if logits.is_empty() {
            return Err(EngineError::ModelRuntimeFailure(anyhow!("empty logits row")));
        }
        let mut candidates = Candidates::from_logits(logits);

        for (&id, &bias) in &config.logit_bias {
            candidates.add_bias(id, bias);
        }

        let nl_logit = self
            .newline_token
            .and_then(|nl| candidates.logit_of(nl).map(|logit| (nl, logit)));
        candidates.apply_penalties(
            penalty_window(history, config),
            config.repetition_penalty,
            config.frequency_penalty,
            config.presence_penalty,
        );
        if !config.penalize_nl {
            if let Some((nl, logit)) = nl_logit {
                candidates.set_logit(nl, logit);
            }
        }

        if let Some(g) = grammar.as_deref_mut() {
            candidates.apply_grammar(g)?;
        }

        let token = if config.temperature == 0.0 {
            candidates.argmax()
        } else if config.temperature < 0.0 {
            candidates.softmax();
            self.draw(&candidates, config.do_sample)
                .map(|i| candidates.data[i].id)
        } else {
            match config.mirostat_mode {
                MirostatMode::None => {
                    candidates.top_k(config.top_k, 1);
                    candidates.tail_free(config.tail_free_z, 1);
                    candidates.typical(config.typical_p, 1);
                    candidates.top_p(config.top_p, 1);
                    candidates.min_p(config.min_p, 1);
                    candidates.temperature(config.temperature);
                    candidates.softmax();
                    self.draw(&candidates, config.do_sample)
                        .map(|i| candidates.data[i].id)
                }
                MirostatMode::V1 => {
                    candidates.temperature(config.temperature);
                    self.mirostat_v1(&mut candidates, config)
                }
                MirostatMode::V2 => {
                    candidates.temperature(config.temperature);
                    self.mirostat_v2(&mut candidates, config)
                }
            }
        };

        let token = token.ok_or_else(|| {
            EngineError::ModelRuntimeFailure(anyhow!("no candidate left to sample"))
        })?;
        if let Some(g) = grammar {
            g.accept(token);
        }
        Ok(token)
    }

    /// Index of the drawn candidate; candidates must be softmaxed.
    fn draw(&mut self, candidates: &Candidates, do_sample: bool) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        if !do_sample {
            // softmax left them sorted by logit
            return Some(0);
        }
        let r: f32 = self.rng.gen();
        let mut cumsum = 0.0f32;
        for (i, c) in candidates.data.iter().enumerate() {
            cumsum += c.p;
            if cumsum >= r {
                return Some(i);
            }
        }
        candidates.data.iter().rposition(|c| c.p > 0.0).or(Some(0))
    }

    fn mirostat_state(&mut self, config: &GenerationConfig) -> &mut MirostatState {
        self.mirostat
            .get_or_insert_with(|| MirostatState::new(config.mirostat_tau, config.mirostat_eta))
    }

    /// Mirostat v1: estimate the Zipf exponent from the head of the
    /// distribution and derive a top-k cut from the current `mu`.
    fn mirostat_v1(
        &mut self,
        candidates: &mut Candidates,
        config: &GenerationConfig,
    ) -> Option<TokenId> {
        candidates.softmax();
        let n = candidates.len() as f32;
        let m = MIROSTAT_M.min(candidates.len());

        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        for i in 0..m.saturating_sub(1) {
            let (p0, p1) = (candidates.data[i].p, candidates.data[i + 1].p);
            if p1 <= 0.0 {
                break;
            }
            let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
            let b_i = (p0 / p1).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }

        let mu = self.mirostat_state(config).mu;
        let k = if sum_ti_sq > 0.0 {
            let s_hat = sum_ti_bi / sum_ti_sq;
            let epsilon_hat = s_hat - 1.0;
            mirostat_v1_k(epsilon_hat, s_hat, mu, n, candidates.len())
        } else {
            1
        };

        candidates.top_k(k, 1);
        candidates.softmax();
        self.finish_mirostat(candidates, config)
    }

    /// Mirostat v2: drop every token whose surprise exceeds `mu`.
    fn mirostat_v2(
        &mut self,
        candidates: &mut Candidates,
        config: &GenerationConfig,
    ) -> Option<TokenId> {
        candidates.softmax();
        let mu = self.mirostat_state(config).mu;
        let keep = candidates
            .data
            .iter()
            .take_while(|c| -c.p.log2() <= mu)
            .count()
            .max(1);
        candidates.data.truncate(keep);
        candidates.softmax();
        self.finish_mirostat(candidates, config)
    }

    fn finish_mirostat(
        &mut self,
        candidates: &Candidates,
        config: &GenerationConfig,
    ) -> Option<TokenId> {
        let idx = self.draw(candidates, config.do_sample)?;
        let chosen = candidates.data[idx];
        let observed = -chosen.p.max(f32::MIN_POSITIVE).log2();
        self.mirostat_state(config).update(observed);
        Some(chosen.id)
    }
}

/// Top-k cut for mirostat v1, truncated toward zero.
///
/// A non-finite estimate keeps every candidate.
fn mirostat_v1_k(epsilon_hat: f32, s_hat: f32, mu: f32, n: f32, n_candidates: usize) -> usize {
    let k = ((epsilon_hat * 2f32.powf(mu)) / (1.0 - n.powf(-epsilon_hat))).powf(1.0 / s_hat);
    if !k.is_finite() {
        return n_candidates;
    }
    // top_k treats 0 as disabled
    (k as usize).clamp(1, n_candidates.max(1))
}

/// Tail of `history` the penalties look at
fn penalty_window<'a>(history: &'a [TokenId], config: &GenerationConfig) -> &'a [TokenId] {
    let n = config
        .penalty_last_n
        .unwrap_or(history.len())
        .min(config.max_context_length);
    &history[history.len().saturating_sub(n)..]
}

/// Log-softmax of a logits row
pub fn logits_to_logprobs(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let max = if max.is_finite() { max } else { 0.0 };
    let sum: f32 = logits.iter().map(|&l| (l - max).exp()).sum();
    let log_sum = sum.ln();
    logits.iter().map(|&l| l - max - log_sum).collect()
}

/// Log-probability of `token` under the raw row
pub fn token_logprob(logits: &[f32], token: TokenId) -> Option<f32> {
    let idx = token as usize;
    if idx >= logits.len() {
        return None;
    }
    logits_to_logprobs(logits).get(idx).copied()
}
