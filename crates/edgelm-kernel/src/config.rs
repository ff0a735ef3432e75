//! Engine, session and decode configuration.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::io::TokenId;

/// Compute backend an executor runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Cpu,
    Gpu,
    GpuArtisan,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Cpu => write!(f, "CPU"),
            Backend::Gpu => write!(f, "GPU"),
            Backend::GpuArtisan => write!(f, "GPU_ARTISAN"),
        }
    }
}

/// Activation precision for the vision encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationDataType {
    F32,
    F16,
}

/// Where the model weights come from: a file path or an in-memory buffer
/// (the scoped-file case, e.g. a descriptor handed over by a host app).
#[derive(Debug, Clone, Default)]
pub struct ModelAssets {
    path: Option<PathBuf>,
    buffer: Option<Arc<Vec<u8>>>,
}

impl ModelAssets {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            buffer: None,
        }
    }

    pub fn from_buffer(buffer: Vec<u8>) -> Self {
        Self {
            path: None,
            buffer: Some(Arc::new(buffer)),
        }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub fn buffer(&self) -> Option<&Arc<Vec<u8>>> {
        self.buffer.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.buffer.is_none()
    }
}

/// Settings for the main LLM executor.
#[derive(Debug, Clone)]
pub struct MainExecutorSettings {
    pub backend: Backend,
    pub model_assets: ModelAssets,
    /// Upper bound on prompt + output tokens resident in the KV-cache.
    pub max_num_tokens: usize,
    pub cache_dir: Option<PathBuf>,
}

impl MainExecutorSettings {
    pub fn new(backend: Backend, model_assets: ModelAssets) -> Self {
        Self {
            backend,
            model_assets,
            max_num_tokens: 4096,
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisionExecutorSettings {
    pub encoder_backend: Backend,
    pub adapter_backend: Backend,
    pub activation_dtype: ActivationDataType,
}

#[derive(Debug, Clone)]
pub struct AudioExecutorSettings {
    pub backend: Backend,
    pub max_sequence_length: usize,
    pub bundled_with_main_model: bool,
}

/// Token counts for a synthetic benchmark pass. When present on the engine,
/// sessions record timing and prefill inputs are replaced by synthetic
/// token sequences of the requested length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkParams {
    pub num_prefill_tokens: usize,
    pub num_decode_tokens: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SamplerType {
    #[default]
    Greedy,
    TopK,
    TopP,
}

/// Sampling hyper-parameters. `temperature == 0` means argmax.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerParams {
    pub sampler_type: SamplerType,
    pub k: usize,
    pub p: f32,
    pub temperature: f32,
    pub seed: u64,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            sampler_type: SamplerType::Greedy,
            k: 1,
            p: 1.0,
            temperature: 0.0,
            seed: 0,
        }
    }
}

impl SamplerParams {
    pub fn validate(&self) -> Result<()> {
        if self.temperature < 0.0 {
            return Err(Error::invalid_argument(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if self.k == 0 {
            return Err(Error::invalid_argument("top-k must be >= 1"));
        }
        if !(self.p > 0.0 && self.p <= 1.0) {
            return Err(Error::invalid_argument(format!(
                "top-p must be in (0, 1], got {}",
                self.p
            )));
        }
        Ok(())
    }
}

/// Turn delimiters applied by the session when
/// `apply_prompt_template` is on. The conversation layer proper is out of
/// scope; this is the minimal set the session needs to open and close
/// turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplates {
    /// Emitted once at the very start of the first turn.
    pub system_preamble: String,
    pub user_prefix: String,
    pub user_suffix: String,
    /// Emitted as a silent tail-prefill right before decode starts.
    pub model_prefix: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            system_preamble: String::new(),
            user_prefix: "<start_of_turn>user\n".to_string(),
            user_suffix: "<end_of_turn>\n".to_string(),
            model_prefix: "<start_of_turn>model\n".to_string(),
        }
    }
}

/// A LoRA adapter requested by a session, identified by path and/or carried
/// as an in-memory asset.
#[derive(Debug, Clone, Default)]
pub struct LoraSpec {
    pub path: Option<String>,
    pub assets: Option<ModelAssets>,
}

/// Hook for an external constraint-decoding provider. The scheduler asks it
/// after every generated token whether decoding must stop.
pub trait DecodeConstraint: Send + Sync {
    fn should_stop(&self, generated: &[TokenId]) -> bool;
}

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub main_executor: MainExecutorSettings,
    pub vision_executor: Option<VisionExecutorSettings>,
    pub audio_executor: Option<AudioExecutorSettings>,
    pub benchmark_params: Option<BenchmarkParams>,
    pub sampler_params: Option<SamplerParams>,
}

impl EngineSettings {
    pub fn new(main_executor: MainExecutorSettings) -> Self {
        Self {
            main_executor,
            vision_executor: None,
            audio_executor: None,
            benchmark_params: None,
            sampler_params: None,
        }
    }

    pub fn benchmark_enabled(&self) -> bool {
        self.benchmark_params.is_some()
    }

    /// Validates the settings tree. A non-CPU vision adapter backend is
    /// accepted but may lose precision, so it only warns.
    pub fn validate(&self) -> Result<()> {
        if let Some(sampler) = &self.sampler_params {
            sampler.validate()?;
        }
        if let Some(vision) = &self.vision_executor {
            if vision.adapter_backend != Backend::Cpu {
                tracing::warn!(
                    adapter_backend = %vision.adapter_backend,
                    "vision adapter backend is not CPU, which may cause precision loss"
                );
            }
        }
        if let Some(audio) = &self.audio_executor {
            if audio.max_sequence_length == 0 {
                return Err(Error::invalid_argument(
                    "audio max_sequence_length must be > 0",
                ));
            }
        }
        if self.main_executor.max_num_tokens == 0 {
            return Err(Error::invalid_argument("max_num_tokens must be > 0"));
        }
        Ok(())
    }
}

/// Per-session configuration.
#[derive(Clone)]
pub struct SessionConfig {
    pub sampler_params: Option<SamplerParams>,
    pub max_output_tokens: usize,
    pub apply_prompt_template: bool,
    pub num_output_candidates: usize,
    pub lora: Option<LoraSpec>,
    pub stop_token_ids: Vec<TokenId>,
    pub prompt_templates: Option<PromptTemplates>,
    pub enable_audio_modality: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sampler_params: None,
            max_output_tokens: 256,
            apply_prompt_template: false,
            num_output_candidates: 1,
            lora: None,
            stop_token_ids: Vec::new(),
            prompt_templates: None,
            enable_audio_modality: false,
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("max_output_tokens", &self.max_output_tokens)
            .field("apply_prompt_template", &self.apply_prompt_template)
            .field("num_output_candidates", &self.num_output_candidates)
            .field("has_lora", &self.lora.is_some())
            .field("stop_token_ids", &self.stop_token_ids)
            .finish()
    }
}

impl SessionConfig {
    /// Fills unset fields from the engine settings and validates the
    /// result. Called by the engine before a session is registered.
    pub fn maybe_update_and_validate(&mut self, engine_settings: &EngineSettings) -> Result<()> {
        if self.sampler_params.is_none() {
            self.sampler_params = engine_settings.sampler_params;
        }
        if let Some(sampler) = &self.sampler_params {
            sampler.validate()?;
        }
        if self.num_output_candidates == 0 {
            return Err(Error::invalid_argument(
                "num_output_candidates must be >= 1",
            ));
        }
        if self.max_output_tokens == 0 {
            return Err(Error::invalid_argument("max_output_tokens must be >= 1"));
        }
        if self.apply_prompt_template && self.prompt_templates.is_none() {
            self.prompt_templates = Some(PromptTemplates::default());
        }
        Ok(())
    }

    /// The sampler parameters that will actually be used, falling back to
    /// the greedy default.
    pub fn effective_sampler_params(&self) -> SamplerParams {
        self.sampler_params.unwrap_or_default()
    }
}

/// Per-decode overrides.
#[derive(Clone, Default)]
pub struct DecodeConfig {
    pub max_output_tokens: Option<usize>,
    pub constraint: Option<Arc<dyn DecodeConstraint>>,
}

impl std::fmt::Debug for DecodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeConfig")
            .field("max_output_tokens", &self.max_output_tokens)
            .field("has_constraint", &self.constraint.is_some())
            .finish()
    }
}
