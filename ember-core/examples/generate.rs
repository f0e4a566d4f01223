//! Example: streamed text generation with a toy byte-level runtime
//!
//! The runtime is a bigram model over bytes built from a small corpus, so
//! the example runs without model weights.
//!
//! Run with:
//!   cargo run --example generate -- --prompt "the cat"
//!   RUST_LOG=debug cargo run --example generate -- --prompt "the" --stop "."

use anyhow::{bail, Result};
use ember_core::{
    CancelToken, EngineConfig, GenerationConfig, GenerationRequest, InferenceEngine, ModelRuntime,
    StopSpec, TokenId,
};
use std::io::Write;
use tracing_subscriber::EnvFilter;

const CORPUS: &str = "the cat sat on the mat. the dog sat on the log. \
the cat saw the dog and the dog saw the cat. a bird sang on the roof. \
the sun set over the hills and the cat slept on the mat.";

const EOS: TokenId = 256;

/// Next-byte scores from bigram counts; token ids are byte values plus eos
struct BigramRuntime {
    counts: Vec<[f32; 257]>,
    evaluated: Vec<TokenId>,
}

impl BigramRuntime {
    fn new(corpus: &str) -> Self {
        let mut counts = vec![[0.0f32; 257]; 257];
        let bytes = corpus.as_bytes();
        for pair in bytes.windows(2) {
            counts[pair[0] as usize][pair[1] as usize] += 1.0;
        }
        if let Some(&last) = bytes.last() {
            counts[last as usize][EOS as usize] += 1.0;
        }
        Self {
            counts,
            evaluated: Vec::new(),
        }
    }
}

impl ModelRuntime for BigramRuntime {
    fn vocab_size(&self) -> usize {
        257
    }

    fn eos_token_ids(&self) -> &[TokenId] {
        &[EOS]
    }

    fn newline_token(&self) -> Option<TokenId> {
        Some(TokenId::from(b'\n'))
    }

    fn next_token_logits(
        &mut self,
        history: &[TokenId],
        _config: &GenerationConfig,
        n_past: usize,
        _prompt_len: usize,
    ) -> Result<Vec<f32>> {
        self.evaluated.truncate(n_past);
        self.evaluated.extend_from_slice(&history[n_past..]);
        let Some(&last) = history.last() else {
            bail!("empty history");
        };
        Ok(self.counts[last as usize]
            .iter()
            .map(|&c| (c + 0.01).ln())
            .collect())
    }

    fn decode(&self, tokens: &[TokenId]) -> Vec<u8> {
        tokens.iter().filter(|&&t| t < EOS).map(|&t| t as u8).collect()
    }

    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(self.evaluated.iter().flat_map(|t| t.to_le_bytes()).collect())
    }

    fn load_state(&mut self, blob: &[u8]) -> Result<()> {
        self.evaluated = blob
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let arg = |name: &str| {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };
    let prompt = arg("--prompt").unwrap_or_else(|| "the cat".to_string());
    let max_tokens = arg("--max-tokens").and_then(|s| s.parse().ok()).unwrap_or(60);
    let stop: Vec<String> = arg("--stop").into_iter().collect();

    let config = EngineConfig::from_env()?;
    println!("Ember - generation core demo");
    println!("Model: {}", config.model_name);
    println!("Prompt: {}", prompt);
    println!();

    let engine = InferenceEngine::new(Box::new(BigramRuntime::new(CORPUS)), config)?;

    let request = GenerationRequest::new(
        prompt.bytes().map(TokenId::from).collect(),
        GenerationConfig {
            max_new_tokens: max_tokens,
            temperature: 0.7,
            seed: Some(7),
            ..Default::default()
        },
    )
    .with_stop(StopSpec::strings(stop));

    // Streamed run
    let mut stream = engine.create_completion_stream(request.clone(), CancelToken::new())?;
    print!("{}", prompt);
    let mut finish = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        print!("{}", chunk.text_delta);
        std::io::stdout().flush()?;
        if chunk.finish_reason.is_some() {
            finish = Some((chunk.finish_reason, chunk.usage));
        }
    }
    println!();
    println!("---");
    if let Some((reason, usage)) = finish {
        println!("finish_reason: {:?}, usage: {:?}", reason, usage);
    }

    // Same request again: served from the live context
    let completion = engine.create_completion(&request, &CancelToken::new())?;
    println!("repeat: {:?}", completion.text);

    let stats = engine.cache_stats();
    println!(
        "state cache: {} entries, {} hits, {} misses",
        stats.entries, stats.hits, stats.misses
    );
    Ok(())
}
