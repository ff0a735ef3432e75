//! Executor contracts.
//!
//! The runtime never sees a concrete forward pass; it drives executors
//! through the narrow capability set below. Executors are stateful (they
//! own the live context) and are not required to be thread-safe — the
//! resource manager serializes every call behind its lock.

mod context;
mod kv;

pub use context::{
    AudioContext, LlmContext, ProcessedContext, ProcessedTokens, RuntimeConfig, RuntimeState,
};
pub use kv::KvCache;

use crate::config::ModelAssets;
use crate::error::Result;
use crate::io::{InputAudio, InputImage, TokenId};
use crate::sampler::Logits;

/// Vision embeddings produced by a vision encoder for one image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorVisionData {
    pub embeddings: Vec<f32>,
    pub per_layer_embeddings: Option<Vec<f32>>,
}

/// Audio embeddings produced by an audio encoder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutorAudioData {
    pub embeddings: Vec<f32>,
    pub per_layer_embeddings: Option<Vec<f32>>,
}

/// The unit of work handed to [`LlmExecutor::prefill`] and
/// [`LlmExecutor::decode_logits`]: text token ids plus optional modality
/// embeddings.
#[derive(Debug, Clone, Default)]
pub struct ExecutorInputs {
    pub text_tokens: Vec<TokenId>,
    pub vision: Option<ExecutorVisionData>,
    pub audio: Option<ExecutorAudioData>,
}

impl ExecutorInputs {
    pub fn from_tokens(text_tokens: Vec<TokenId>) -> Self {
        Self {
            text_tokens,
            vision: None,
            audio: None,
        }
    }
}

/// Per-prefill overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefillParams {
    /// Overrides the executor's current step for this prefill.
    pub current_step: Option<usize>,
}

/// The contract between the runtime and an LLM executor implementation.
///
/// Semantics of the context calls: the executor owns exactly one live
/// context (processed tokens + runtime config + runtime state).
/// `clone_context` snapshots it, `restore_context` replaces it, and
/// `create_new_context` builds a fresh one without installing it.
pub trait LlmExecutor: Send {
    fn backend_name(&self) -> &str;

    /// Ingests prompt tokens (and modality embeddings) into the KV-cache
    /// starting at the current step. Emits no output.
    fn prefill(&mut self, inputs: &ExecutorInputs, params: &PrefillParams) -> Result<()>;

    /// One decode step with internal sampling: returns one token per output
    /// head and advances the context.
    fn decode_text_tokens(&mut self) -> Result<Vec<TokenId>>;

    /// One decode step with external sampling: ingests `inputs` (the
    /// previously sampled tokens; empty right after prefill) and returns
    /// the logits for the next position, one row per output head.
    fn decode_logits(&mut self, inputs: &ExecutorInputs) -> Result<Logits>;

    fn clone_context(&self) -> Result<LlmContext>;

    fn restore_context(&mut self, context: LlmContext) -> Result<()>;

    fn create_new_context(
        &mut self,
        lora_id: Option<u32>,
        config: RuntimeConfig,
    ) -> Result<LlmContext>;

    fn runtime_config(&self) -> Result<RuntimeConfig>;

    fn update_runtime_config(&mut self, config: &RuntimeConfig) -> Result<()>;

    fn runtime_state(&self) -> Result<RuntimeState>;

    fn update_runtime_state(&mut self, state: &RuntimeState) -> Result<()>;

    fn current_step(&self) -> Result<usize>;

    fn set_current_step(&mut self, step: usize) -> Result<()>;

    /// Snapshot of the committed prefix of the live context.
    fn processed_tokens(&self) -> Result<ProcessedTokens>;

    fn load_lora(&mut self, lora_id: u32, assets: &ModelAssets) -> Result<()>;

    fn reset(&mut self) -> Result<()>;

    /// Best-effort cancellation of an in-flight kernel. No-op when idle.
    fn cancel(&mut self) -> Result<()>;

    fn vocab_size(&self) -> Result<usize>;
}

/// A vision encoder plus projection adapter.
pub trait VisionExecutor: Send {
    fn encode(&mut self, image: &InputImage) -> Result<ExecutorVisionData>;

    /// Expected input layout, `[batch, height, width, channels]`.
    fn expected_input_dimensions(&self) -> Result<Vec<usize>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AudioExecutorProperties {
    /// Streaming models carry per-session [`AudioContext`] state.
    pub is_streaming_model: bool,
    pub max_sequence_length: usize,
}

/// An audio encoder.
pub trait AudioExecutor: Send {
    fn encode(&mut self, audio: &InputAudio) -> Result<ExecutorAudioData>;

    fn reset(&mut self) -> Result<()>;

    fn properties(&self) -> Result<AudioExecutorProperties>;

    fn create_new_context(&mut self) -> Result<Box<dyn AudioContext>>;

    fn clone_context(&self) -> Result<Box<dyn AudioContext>>;

    fn restore_context(&mut self, context: Box<dyn AudioContext>) -> Result<()>;
}
