//! Per-session execution context: the committed token prefix, the runtime
//! cursor, and the bundles that move between executor and resource manager
//! during context switches.

use crate::config::SamplerParams;
use crate::io::TokenId;

/// The ordered sequence of token ids the executor has already ingested into
/// its KV-cache, plus an optional peek at the next token that has been
/// sampled but not yet processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedTokens {
    tokens: Vec<TokenId>,
    pending: Option<TokenId>,
}

impl ProcessedTokens {
    pub fn new(tokens: Vec<TokenId>) -> Self {
        Self {
            tokens,
            pending: None,
        }
    }

    /// Length of the committed prefix.
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn extend(&mut self, tokens: &[TokenId]) {
        self.tokens.extend_from_slice(tokens);
    }

    pub fn truncate(&mut self, len: usize) {
        self.tokens.truncate(len);
    }

    pub fn pending(&self) -> Option<TokenId> {
        self.pending
    }

    pub fn set_pending(&mut self, token: Option<TokenId>) {
        self.pending = token;
    }

    /// Commits the pending token to the prefix, if any.
    pub fn commit_pending(&mut self) {
        if let Some(t) = self.pending.take() {
            self.tokens.push(t);
        }
    }
}

/// Per-session executor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub output_heads: usize,
    pub tokens_per_decode: usize,
    pub sampler_params: SamplerParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            output_heads: 1,
            tokens_per_decode: 1,
            sampler_params: SamplerParams::default(),
        }
    }
}

/// Per-session executor cursor.
///
/// Invariant: at every quiescent moment,
/// `0 <= current_step <= ProcessedTokens::token_count()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeState {
    pub current_step: usize,
    pub ran_decode: bool,
}

/// The materialized KV-cache state for a branch of history: the committed
/// prefix, an optional serialized KV snapshot, and the LoRA binding.
#[derive(Debug, Clone, Default)]
pub struct ProcessedContext {
    pub processed_tokens: ProcessedTokens,
    /// Serialized per-layer K/V buffers for the prefix, produced by
    /// [`crate::executor::KvCache::serialize`]. Empty for a fresh context.
    pub kv_state: Vec<u8>,
    pub lora_id: Option<u32>,
}

impl ProcessedContext {
    /// A context with no committed history.
    pub fn is_fresh(&self) -> bool {
        self.processed_tokens.token_count() == 0 && self.processed_tokens.pending().is_none()
    }
}

/// The full execution context moved in and out of the executor on a context
/// switch.
#[derive(Debug, Clone, Default)]
pub struct LlmContext {
    pub processed: ProcessedContext,
    pub config: RuntimeConfig,
    pub state: RuntimeState,
}

/// Opaque per-session state of a streaming audio encoder.
pub trait AudioContext: Send {
    fn clone_box(&self) -> Box<dyn AudioContext>;
}

impl Clone for Box<dyn AudioContext> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
