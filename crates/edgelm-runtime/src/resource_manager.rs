//! Executor ownership and context switching.
//!
//! The resource manager owns the one physical LLM executor (plus optional
//! vision/audio executors) through the [`ResourceRegistry`] and mediates
//! every interaction with them. Acquiring the executor for a session whose
//! handler is not the active one performs a context switch: the live
//! context is saved into the outgoing handler and the target handler's
//! context is loaded.
//!
//! The returned [`LockedLlmExecutor`] additionally intercepts prefill and
//! decode to reuse overlapping token prefixes and to detach non-longest
//! siblings copy-on-write before they mutate a shared prefix.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use edgelm_kernel::config::{
    AudioExecutorSettings, ModelAssets, SessionConfig, VisionExecutorSettings,
};
use edgelm_kernel::error::{Error, ErrorKind, Result};
use edgelm_kernel::executor::{
    AudioExecutor, ExecutorInputs, LlmContext, LlmExecutor, PrefillParams, ProcessedTokens,
    RuntimeConfig, RuntimeState, VisionExecutor,
};
use edgelm_kernel::io::TokenId;
use edgelm_kernel::sampler::Logits;

use crate::context_handler::{ContextHandler, SharedProcessedContext};
use crate::registry::{resource_ids, ResourceGuard, ResourceRegistry};

/// The main executor and the handler currently loaded on it, guarded as one
/// resource so the pair can never go out of sync.
pub struct MainExecutorSlot {
    pub executor: Box<dyn LlmExecutor>,
    current_handler: Option<Arc<ContextHandler>>,
}

/// Advances `current_step` past the run of input tokens that match the
/// committed prefix, dropping them from `input_ids`.
pub(crate) fn remove_matching_tokens(
    processed: &[TokenId],
    input_ids: &mut Vec<TokenId>,
    current_step: &mut usize,
) {
    let mut matched = 0;
    while *current_step + matched < processed.len()
        && matched < input_ids.len()
        && processed[*current_step + matched] == input_ids[matched]
    {
        matched += 1;
    }
    *current_step += matched;
    input_ids.drain(..matched);
}

/// Mediates executor access for the whole engine.
pub struct ResourceManager {
    registry: ResourceRegistry,
    audio_settings: Option<AudioExecutorSettings>,
    vision_settings: Option<VisionExecutorSettings>,
    lora_ids: Mutex<HashMap<String, u32>>,
    loaded_loras: Mutex<HashSet<u32>>,
}

impl ResourceManager {
    pub fn create(
        llm_executor: Box<dyn LlmExecutor>,
        vision_executor: Option<Box<dyn VisionExecutor>>,
        audio_executor: Option<Box<dyn AudioExecutor>>,
        vision_settings: Option<VisionExecutorSettings>,
        audio_settings: Option<AudioExecutorSettings>,
    ) -> Result<Self> {
        let registry = ResourceRegistry::new();
        registry.register(
            resource_ids::MAIN_EXECUTOR,
            MainExecutorSlot {
                executor: llm_executor,
                current_handler: None,
            },
        )?;
        if let Some(vision) = vision_executor {
            registry.register(resource_ids::VISION_EXECUTOR, vision)?;
        }
        if let Some(audio) = audio_executor {
            registry.register(resource_ids::AUDIO_EXECUTOR, audio)?;
        }
        Ok(Self {
            registry,
            audio_settings,
            vision_settings,
            lora_ids: Mutex::new(HashMap::new()),
            loaded_loras: Mutex::new(HashSet::new()),
        })
    }

    /// Canonicalizes a session's LoRA reference into an id. A path maps to
    /// one stable id; an asset carried without a path is assumed
    /// single-use and gets a unique per-session id.
    pub fn assign_lora_id(&self, lora_path: &str, has_scoped_assets: bool) -> Option<u32> {
        if lora_path.is_empty() && !has_scoped_assets {
            return None;
        }
        let mut map = self.lora_ids.lock().expect("lora map poisoned");
        if !lora_path.is_empty() {
            let next = map.len() as u32;
            Some(*map.entry(lora_path.to_string()).or_insert(next))
        } else {
            let id = map.len() as u32;
            map.insert(format!("scoped_lora:{id}"), id);
            Some(id)
        }
    }

    /// Builds a fresh parked handler for a new session, resolving and
    /// lazily loading its LoRA adapter under the executor lock.
    pub fn create_context_handler(
        &self,
        session_config: &SessionConfig,
    ) -> Result<Arc<ContextHandler>> {
        let mut lora_id = None;
        if let Some(spec) = &session_config.lora {
            lora_id =
                self.assign_lora_id(spec.path.as_deref().unwrap_or(""), spec.assets.is_some());
            if let Some(id) = lora_id {
                let needs_load = !self
                    .loaded_loras
                    .lock()
                    .expect("lora set poisoned")
                    .contains(&id);
                if needs_load {
                    let assets = spec
                        .assets
                        .clone()
                        .or_else(|| spec.path.as_ref().map(ModelAssets::from_path))
                        .ok_or_else(|| {
                            Error::invalid_argument("lora spec carries neither path nor assets")
                        })?;
                    let mut slot = self.main_slot()?;
                    slot.executor.load_lora(id, &assets)?;
                    self.loaded_loras
                        .lock()
                        .expect("lora set poisoned")
                        .insert(id);
                }
            }
        }

        let runtime_config = RuntimeConfig {
            output_heads: session_config.num_output_candidates,
            tokens_per_decode: 1,
            sampler_params: session_config.effective_sampler_params(),
        };
        let llm_context = {
            let mut slot = self.main_slot()?;
            slot.executor.create_new_context(lora_id, runtime_config)?
        };

        let mut audio_context = None;
        if session_config.enable_audio_modality {
            self.try_loading_audio_executor()?;
            let mut audio = self.acquire_audio_executor()?;
            match audio.properties() {
                Ok(props) => {
                    if props.is_streaming_model {
                        audio_context = Some(audio.create_new_context()?);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Unimplemented => {}
                Err(e) => return Err(e),
            }
        }

        Ok(Arc::new(ContextHandler::new(llm_context, audio_context)))
    }

    /// Clones a handler for a session clone. The shared processed context
    /// is alias-referenced, not deep-copied; the runtime config/state come
    /// from the handler's owned fields, or live from the executor when the
    /// source is the active handler.
    pub fn clone_context_handler(
        &self,
        source: &Arc<ContextHandler>,
    ) -> Result<Arc<ContextHandler>> {
        info!(
            source_has_runtime_config = source.has_runtime_config(),
            source_has_runtime_state = source.has_runtime_state(),
            source_has_processed_context =
                source.shared_processed_context().has_processed_context(),
            "resource_manager_clone_context_handler_begin"
        );
        let (runtime_config, runtime_state) =
            match (source.runtime_config(), source.runtime_state()) {
                (Some(config), Some(state)) => (config, state),
                _ => {
                    // The tasks touching runtime state run on the single
                    // execution thread, so reading live executor state here
                    // observes deterministic sequencing.
                    let slot = self.main_slot()?;
                    let is_current = slot
                        .current_handler
                        .as_ref()
                        .is_some_and(|cur| Arc::ptr_eq(cur, source));
                    if !is_current {
                        return Err(Error::internal(
                            "CLONE_RUNTIME_STATE_SOURCE_INVALID: context handler has no runtime \
                             config/state and is not the active handler; refusing to clone with \
                             executor state from a different active handler",
                        ));
                    }
                    (slot.executor.runtime_config()?, slot.executor.runtime_state()?)
                }
            };

        let shared = source.shared_processed_context();
        let audio_context = source.clone_audio_context();
        Ok(Arc::new(ContextHandler::bundle(
            shared,
            runtime_config,
            runtime_state,
            audio_context,
        )))
    }

    fn main_slot(&self) -> Result<ResourceGuard<MainExecutorSlot>> {
        self.registry
            .acquire::<MainExecutorSlot>(resource_ids::MAIN_EXECUTOR)
    }

    /// Locks the executor without any context-switch logic. Calls forward
    /// directly.
    pub fn acquire_executor(&self) -> Result<LockedLlmExecutor> {
        Ok(LockedLlmExecutor {
            slot: self.main_slot()?,
            current: None,
        })
    }

    /// The central context-switch operation: locks the executor and makes
    /// `target` the active handler, saving the outgoing handler's context
    /// as needed.
    pub fn acquire_executor_with_context_handler(
        &self,
        target: &Arc<ContextHandler>,
    ) -> Result<LockedLlmExecutor> {
        let mut slot = self.main_slot()?;
        let current = slot.current_handler.clone();

        let same_handler = current
            .as_ref()
            .is_some_and(|cur| Arc::ptr_eq(cur, target));
        let same_shared = current.as_ref().is_some_and(|cur| {
            Arc::ptr_eq(
                &cur.shared_processed_context(),
                &target.shared_processed_context(),
            )
        });
        info!(
            has_current_handler = current.is_some(),
            same_handler,
            same_shared_processed_context = same_shared,
            target_has_runtime_config = target.has_runtime_config(),
            target_has_runtime_state = target.has_runtime_state(),
            target_has_processed_context =
                target.shared_processed_context().has_processed_context(),
            "resource_manager_switch_begin"
        );

        if same_handler {
            return Ok(LockedLlmExecutor {
                slot,
                current: Some(Arc::clone(target)),
            });
        }

        if same_shared {
            // Sibling switch: the materialized prefix stays loaded; only
            // runtime config/state swap.
            let outgoing = current
                .as_ref()
                .ok_or_else(|| Error::internal("sibling switch without an active handler"))?;
            let live_config = slot.executor.runtime_config()?;
            let live_state = slot.executor.runtime_state()?;
            outgoing.set_runtime_config(live_config);
            outgoing.set_runtime_state(live_state);
            outgoing.mark_parked(live_state.current_step);

            let new_config = take_runtime_config_for_switch(target)?;
            let mut new_state = take_runtime_state_for_switch(target)?;
            let active_token_count = slot.executor.processed_tokens()?.token_count();
            if new_state.current_step > active_token_count {
                warn!(
                    original_current_step = new_state.current_step,
                    token_count = active_token_count,
                    "resource_manager_runtime_state_clamped_same_processed_context"
                );
                new_state.current_step = active_token_count;
            }
            info!("resource_manager_switch_same_processed_context");
            slot.executor.update_runtime_config(&new_config)?;
            slot.executor.update_runtime_state(&new_state)?;
            target.mark_active();
        } else {
            // Full switch: save the outgoing context, then restore or
            // freshly create the target's.
            if let Some(outgoing) = &current {
                let live = slot.executor.clone_context()?;
                let step = live.state.current_step;
                outgoing.set_runtime_config(live.config);
                outgoing.set_runtime_state(live.state);
                outgoing
                    .shared_processed_context()
                    .set_processed_context(live.processed)?;
                outgoing.mark_parked(step);
            }

            let new_config = take_runtime_config_for_switch(target)?;
            let mut new_state = take_runtime_state_for_switch(target)?;
            let new_processed = target.shared_processed_context().take_processed_context();
            let target_token_count = new_processed
                .as_ref()
                .map(|p| p.processed_tokens.token_count())
                .unwrap_or(0);
            if new_state.current_step > target_token_count {
                warn!(
                    original_current_step = new_state.current_step,
                    token_count = target_token_count,
                    "resource_manager_runtime_state_clamped_restored_context"
                );
                new_state.current_step = target_token_count;
            }
            let is_fresh_context = target_token_count == 0
                && new_state.current_step == 0
                && !new_state.ran_decode;
            info!(
                token_count = target_token_count,
                current_step = new_state.current_step,
                ran_decode = new_state.ran_decode,
                has_processed_context = new_processed.is_some(),
                path = if is_fresh_context {
                    "fresh_create_new_context"
                } else {
                    "restore_provided_context"
                },
                "resource_manager_restore_context_decision"
            );
            if is_fresh_context {
                let lora_id = new_processed.as_ref().and_then(|p| p.lora_id);
                let context = slot.executor.create_new_context(lora_id, new_config)?;
                slot.executor.restore_context(context)?;
                slot.executor.update_runtime_state(&new_state)?;
            } else {
                let processed = new_processed.unwrap_or_default();
                slot.executor.restore_context(LlmContext {
                    processed,
                    config: new_config,
                    state: new_state,
                })?;
            }
            target.mark_active();
        }

        // Audio contexts follow the same save-and-restore pattern.
        if let Some(outgoing) = &current {
            if outgoing.has_audio_context() {
                let audio = self.acquire_audio_executor()?;
                outgoing.set_audio_context(audio.clone_context()?);
            }
            if target.has_audio_context() {
                let mut audio = self.acquire_audio_executor()?;
                if let Some(context) = target.clone_audio_context() {
                    audio.restore_context(context)?;
                }
            }
        }

        slot.current_handler = Some(Arc::clone(target));
        info!(
            current_has_runtime_config = target.has_runtime_config(),
            current_has_runtime_state = target.has_runtime_state(),
            current_has_processed_context =
                target.shared_processed_context().has_processed_context(),
            "resource_manager_switch_end"
        );

        Ok(LockedLlmExecutor {
            slot,
            current: Some(Arc::clone(target)),
        })
    }

    pub fn try_loading_vision_executor(&self) -> Result<()> {
        if self.registry.has_resource(resource_ids::VISION_EXECUTOR) {
            return Ok(());
        }
        let settings = self
            .vision_settings
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("vision executor settings are missing"))?;
        Err(Error::unimplemented(format!(
            "vision executor backend is not supported: {}",
            settings.encoder_backend
        )))
    }

    pub fn acquire_vision_executor(&self) -> Result<ResourceGuard<Box<dyn VisionExecutor>>> {
        self.registry
            .acquire::<Box<dyn VisionExecutor>>(resource_ids::VISION_EXECUTOR)
    }

    pub fn try_loading_audio_executor(&self) -> Result<()> {
        if self.registry.has_resource(resource_ids::AUDIO_EXECUTOR) {
            return Ok(());
        }
        let settings = self
            .audio_settings
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("audio executor settings are missing"))?;
        Err(Error::unimplemented(format!(
            "audio executor backend is not supported: {}",
            settings.backend
        )))
    }

    pub fn acquire_audio_executor(&self) -> Result<ResourceGuard<Box<dyn AudioExecutor>>> {
        self.registry
            .acquire::<Box<dyn AudioExecutor>>(resource_ids::AUDIO_EXECUTOR)
    }
}

fn take_runtime_config_for_switch(handler: &ContextHandler) -> Result<RuntimeConfig> {
    handler.take_runtime_config().ok_or_else(|| {
        Error::internal(
            "SWITCH_RUNTIME_CONFIG_MISSING: target context handler has no runtime config while \
             being activated",
        )
    })
}

fn take_runtime_state_for_switch(handler: &ContextHandler) -> Result<RuntimeState> {
    handler.take_runtime_state().ok_or_else(|| {
        Error::internal(
            "SWITCH_RUNTIME_STATE_MISSING: target context handler has no runtime state while \
             being activated",
        )
    })
}

/// A locked executor bound to the active handler. Prefill and decode run
/// the prefix-matching and copy-on-write checks before delegating; every
/// other call forwards verbatim. The executor lock is held for the guard's
/// lifetime.
pub struct LockedLlmExecutor {
    slot: ResourceGuard<MainExecutorSlot>,
    current: Option<Arc<ContextHandler>>,
}

impl LockedLlmExecutor {
    pub fn backend_name(&self) -> String {
        self.slot.executor.backend_name().to_string()
    }

    pub fn prefill(&mut self, inputs: &ExecutorInputs, params: &PrefillParams) -> Result<()> {
        let Some(handler) = self.current.clone() else {
            return self.slot.executor.prefill(inputs, params);
        };
        if inputs.text_tokens.is_empty() {
            if inputs.vision.is_some() || inputs.audio.is_some() {
                return self.slot.executor.prefill(inputs, params);
            }
            return Ok(());
        }

        let mut current_step = self.slot.executor.current_step()?;
        if let Some(step) = params.current_step {
            current_step = step;
        }
        let processed = self.slot.executor.processed_tokens()?;
        let token_count = processed.token_count();
        // A context switch can restore a context with fewer tokens than
        // the saved current_step; clamping is a safe no-op otherwise.
        if current_step > token_count {
            warn!(
                original_current_step = current_step,
                token_count, "prefill_current_step_clamped"
            );
            current_step = token_count;
        }
        // A prompt that re-sends the whole committed prefix restarts from
        // step 0 so the overlap is elided below instead of re-ingested.
        if current_step == token_count
            && token_count > 0
            && params.current_step.is_none()
            && inputs.text_tokens.len() >= token_count
            && inputs.text_tokens[..token_count] == *processed.tokens()
        {
            current_step = 0;
        }
        // Continuing exactly at the end of the committed prefix: nothing to
        // optimize.
        if token_count == current_step {
            return self.slot.executor.prefill(inputs, params);
        }

        let mut input_ids = inputs.text_tokens.clone();
        remove_matching_tokens(processed.tokens(), &mut input_ids, &mut current_step);
        if current_step > token_count {
            warn!(
                original_current_step = current_step,
                token_count, "prefill_current_step_clamped_post_remove_matching"
            );
            current_step = token_count;
        }
        // Everything requested was processed previously; just move the
        // cursor.
        if input_ids.is_empty() {
            return self.slot.executor.set_current_step(current_step);
        }

        let new_inputs = ExecutorInputs {
            text_tokens: input_ids,
            vision: inputs.vision.clone(),
            audio: inputs.audio.clone(),
        };
        let new_params = PrefillParams {
            current_step: Some(current_step),
        };
        if token_count == current_step {
            return self.slot.executor.prefill(&new_inputs, &new_params);
        }

        // Residual inputs diverge below the committed prefix: the active
        // handler is about to overwrite a suffix possibly shared with
        // siblings.
        let longest = handler
            .shared_processed_context()
            .longest_step(current_step);
        if longest != current_step {
            self.save_processed_context_and_separate_loaded_handler()?;
        }
        self.slot.executor.set_current_step(current_step)?;
        self.slot.executor.prefill(&new_inputs, &new_params)
    }

    pub fn decode_text_tokens(&mut self) -> Result<Vec<TokenId>> {
        self.maybe_truncate_processed_tokens()?;
        self.slot.executor.decode_text_tokens()
    }

    pub fn decode_logits(&mut self, inputs: &ExecutorInputs) -> Result<Logits> {
        let current_step = self.slot.executor.current_step()?;
        let processed = self.slot.executor.processed_tokens()?;
        // When the cursor sits right after a pending (sampled but
        // unprocessed) token, step back so the executor processes it.
        if current_step > 0 && current_step == processed.token_count() && processed.pending().is_some() {
            self.slot.executor.set_current_step(current_step - 1)?;
        }
        self.maybe_truncate_processed_tokens()?;
        self.slot.executor.decode_logits(inputs)
    }

    pub fn current_step(&self) -> Result<usize> {
        self.slot.executor.current_step()
    }

    pub fn set_current_step(&mut self, step: usize) -> Result<()> {
        self.slot.executor.set_current_step(step)
    }

    pub fn processed_tokens(&self) -> Result<ProcessedTokens> {
        self.slot.executor.processed_tokens()
    }

    pub fn runtime_config(&self) -> Result<RuntimeConfig> {
        self.slot.executor.runtime_config()
    }

    pub fn update_runtime_config(&mut self, config: &RuntimeConfig) -> Result<()> {
        self.slot.executor.update_runtime_config(config)
    }

    pub fn runtime_state(&self) -> Result<RuntimeState> {
        self.slot.executor.runtime_state()
    }

    pub fn update_runtime_state(&mut self, state: &RuntimeState) -> Result<()> {
        self.slot.executor.update_runtime_state(state)
    }

    pub fn clone_context(&self) -> Result<LlmContext> {
        self.slot.executor.clone_context()
    }

    pub fn restore_context(&mut self, context: LlmContext) -> Result<()> {
        self.slot.executor.restore_context(context)
    }

    pub fn vocab_size(&self) -> Result<usize> {
        self.slot.executor.vocab_size()
    }

    pub fn reset(&mut self) -> Result<()> {
        self.slot.executor.reset()
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.slot.executor.cancel()
    }

    fn maybe_truncate_processed_tokens(&mut self) -> Result<()> {
        let Some(handler) = self.current.clone() else {
            return Ok(());
        };
        let current_step = self.slot.executor.current_step()?;
        let processed = self.slot.executor.processed_tokens()?;
        if processed.token_count() == current_step {
            return Ok(());
        }
        let longest = handler
            .shared_processed_context()
            .longest_step(current_step);
        if longest != current_step {
            self.save_processed_context_and_separate_loaded_handler()?;
        }
        // The restored shared context may not match the executor's cursor;
        // the executor truncates on the next mutation.
        self.slot.executor.set_current_step(current_step)
    }

    /// Saves the executor's live processed context into the active
    /// handler's shared cell (for its siblings) and points the active
    /// handler at a fresh empty cell. The active handler must not own any
    /// context artifacts at this point — they all live in the executor.
    fn save_processed_context_and_separate_loaded_handler(&mut self) -> Result<()> {
        let handler = self
            .current
            .clone()
            .ok_or_else(|| Error::internal("no active handler to detach"))?;
        let has_runtime_config = handler.has_runtime_config();
        let has_runtime_state = handler.has_runtime_state();
        let has_processed_context = handler.shared_processed_context().has_processed_context();
        if has_runtime_config || has_runtime_state || has_processed_context {
            error!(
                has_runtime_config,
                has_runtime_state,
                has_processed_context,
                "active context handler owns context artifacts unexpectedly; refusing unsafe \
                 normalization and failing fast"
            );
            return Err(Error::internal(
                "OWNERSHIP_INVARIANT_VIOLATION: the active context handler must not own any \
                 runtime state, runtime config or processed context when detaching",
            ));
        }
        let live = self.slot.executor.clone_context()?;
        handler
            .shared_processed_context()
            .set_processed_context(live.processed)?;
        handler.update_shared_processed_context(Arc::new(SharedProcessedContext::empty()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgelm_kernel::executor::ProcessedContext;

    #[derive(Default)]
    struct StubState {
        tokens: Vec<TokenId>,
        step: usize,
        ran_decode: bool,
        config: RuntimeConfig,
        lora_id: Option<u32>,
        prefill_calls: Vec<Vec<TokenId>>,
        loaded_loras: Vec<u32>,
    }

    /// Executor model for tests: the KV-cache is the token vector itself.
    /// The state handle stays with the test for call inspection.
    struct StubExecutor {
        state: Arc<Mutex<StubState>>,
    }

    impl LlmExecutor for StubExecutor {
        fn backend_name(&self) -> &str {
            "stub"
        }

        fn prefill(&mut self, inputs: &ExecutorInputs, params: &PrefillParams) -> Result<()> {
            let mut s = self.state.lock().unwrap();
            if let Some(step) = params.current_step {
                s.step = step;
            }
            let step = s.step;
            s.tokens.truncate(step);
            s.tokens.extend_from_slice(&inputs.text_tokens);
            s.step = s.tokens.len();
            s.prefill_calls.push(inputs.text_tokens.clone());
            Ok(())
        }

        fn decode_text_tokens(&mut self) -> Result<Vec<TokenId>> {
            let mut s = self.state.lock().unwrap();
            s.ran_decode = true;
            s.tokens.push(99);
            s.step = s.tokens.len();
            Ok(vec![99])
        }

        fn decode_logits(&mut self, inputs: &ExecutorInputs) -> Result<Logits> {
            let mut s = self.state.lock().unwrap();
            s.ran_decode = true;
            let step = s.step;
            s.tokens.truncate(step);
            s.tokens.extend_from_slice(&inputs.text_tokens);
            s.step = s.tokens.len();
            Ok(Logits::F32(vec![0.0, 0.0, 1.0, 0.0]))
        }

        fn clone_context(&self) -> Result<LlmContext> {
            let s = self.state.lock().unwrap();
            Ok(LlmContext {
                processed: ProcessedContext {
                    processed_tokens: ProcessedTokens::new(s.tokens.clone()),
                    kv_state: Vec::new(),
                    lora_id: s.lora_id,
                },
                config: s.config.clone(),
                state: RuntimeState {
                    current_step: s.step,
                    ran_decode: s.ran_decode,
                },
            })
        }

        fn restore_context(&mut self, context: LlmContext) -> Result<()> {
            let mut s = self.state.lock().unwrap();
            s.tokens = context.processed.processed_tokens.tokens().to_vec();
            s.lora_id = context.processed.lora_id;
            s.config = context.config;
            s.step = context.state.current_step;
            s.ran_decode = context.state.ran_decode;
            Ok(())
        }

        fn create_new_context(
            &mut self,
            lora_id: Option<u32>,
            config: RuntimeConfig,
        ) -> Result<LlmContext> {
            Ok(LlmContext {
                processed: ProcessedContext {
                    processed_tokens: ProcessedTokens::default(),
                    kv_state: Vec::new(),
                    lora_id,
                },
                config,
                state: RuntimeState::default(),
            })
        }

        fn runtime_config(&self) -> Result<RuntimeConfig> {
            Ok(self.state.lock().unwrap().config.clone())
        }

        fn update_runtime_config(&mut self, config: &RuntimeConfig) -> Result<()> {
            self.state.lock().unwrap().config = config.clone();
            Ok(())
        }

        fn runtime_state(&self) -> Result<RuntimeState> {
            let s = self.state.lock().unwrap();
            Ok(RuntimeState {
                current_step: s.step,
                ran_decode: s.ran_decode,
            })
        }

        fn update_runtime_state(&mut self, state: &RuntimeState) -> Result<()> {
            let mut s = self.state.lock().unwrap();
            s.step = state.current_step;
            s.ran_decode = state.ran_decode;
            Ok(())
        }

        fn current_step(&self) -> Result<usize> {
            Ok(self.state.lock().unwrap().step)
        }

        fn set_current_step(&mut self, step: usize) -> Result<()> {
            self.state.lock().unwrap().step = step;
            Ok(())
        }

        fn processed_tokens(&self) -> Result<ProcessedTokens> {
            Ok(ProcessedTokens::new(
                self.state.lock().unwrap().tokens.clone(),
            ))
        }

        fn load_lora(&mut self, lora_id: u32, _assets: &ModelAssets) -> Result<()> {
            self.state.lock().unwrap().loaded_loras.push(lora_id);
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            let mut s = self.state.lock().unwrap();
            s.tokens.clear();
            s.step = 0;
            s.ran_decode = false;
            Ok(())
        }

        fn cancel(&mut self) -> Result<()> {
            Ok(())
        }

        fn vocab_size(&self) -> Result<usize> {
            Ok(4)
        }
    }

    fn manager() -> ResourceManager {
        manager_with_state().0
    }

    fn manager_with_state() -> (ResourceManager, Arc<Mutex<StubState>>) {
        let state = Arc::new(Mutex::new(StubState::default()));
        let executor = StubExecutor {
            state: Arc::clone(&state),
        };
        (
            ResourceManager::create(Box::new(executor), None, None, None, None).unwrap(),
            state,
        )
    }

    #[test]
    fn remove_matching_tokens_trims_shared_prefix() {
        let processed = vec![1, 2, 3, 4];
        let mut input = vec![3, 4, 5, 6];
        let mut step = 2;
        remove_matching_tokens(&processed, &mut input, &mut step);
        assert_eq!(step, 4);
        assert_eq!(input, vec![5, 6]);
    }

    #[test]
    fn remove_matching_tokens_stops_at_divergence() {
        let processed = vec![1, 2, 3];
        let mut input = vec![1, 9];
        let mut step = 0;
        remove_matching_tokens(&processed, &mut input, &mut step);
        assert_eq!(step, 1);
        assert_eq!(input, vec![9]);
    }

    #[test]
    fn assign_lora_id_is_stable_per_path() {
        let manager = manager();
        assert_eq!(manager.assign_lora_id("", false), None);
        let a = manager.assign_lora_id("adapters/a.bin", false);
        let b = manager.assign_lora_id("adapters/b.bin", false);
        assert_eq!(manager.assign_lora_id("adapters/a.bin", false), a);
        assert_ne!(a, b);
        // A scoped asset without a path gets a unique id each time.
        let s1 = manager.assign_lora_id("", true);
        let s2 = manager.assign_lora_id("", true);
        assert_ne!(s1, s2);
    }

    #[test]
    fn first_acquire_creates_fresh_context() {
        let manager = manager();
        let handler = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        let locked = manager
            .acquire_executor_with_context_handler(&handler)
            .unwrap();
        assert_eq!(locked.current_step().unwrap(), 0);
        // Active handler owns nothing.
        assert!(!handler.has_runtime_config());
        assert!(!handler.has_runtime_state());
        assert!(!handler.shared_processed_context().has_processed_context());
    }

    #[test]
    fn same_handler_acquire_is_a_noop() {
        let manager = manager();
        let handler = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        {
            let mut locked = manager
                .acquire_executor_with_context_handler(&handler)
                .unwrap();
            locked
                .prefill(
                    &ExecutorInputs::from_tokens(vec![1, 2, 3]),
                    &PrefillParams::default(),
                )
                .unwrap();
        }
        let locked = manager
            .acquire_executor_with_context_handler(&handler)
            .unwrap();
        assert_eq!(locked.processed_tokens().unwrap().tokens(), &[1, 2, 3]);
        assert_eq!(locked.current_step().unwrap(), 3);
    }

    #[test]
    fn full_switch_saves_and_restores_contexts() {
        let manager = manager();
        let a = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        let b = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        {
            let mut locked = manager.acquire_executor_with_context_handler(&a).unwrap();
            locked
                .prefill(
                    &ExecutorInputs::from_tokens(vec![1, 2, 3]),
                    &PrefillParams::default(),
                )
                .unwrap();
        }
        {
            let mut locked = manager.acquire_executor_with_context_handler(&b).unwrap();
            // B starts fresh even though A left tokens behind.
            assert_eq!(locked.current_step().unwrap(), 0);
            assert_eq!(locked.processed_tokens().unwrap().token_count(), 0);
            locked
                .prefill(
                    &ExecutorInputs::from_tokens(vec![7, 8]),
                    &PrefillParams::default(),
                )
                .unwrap();
        }
        // A is parked with its full context.
        assert!(a.has_runtime_config());
        assert!(a.has_runtime_state());
        assert_eq!(a.shared_processed_context().processed_token_count(), 3);
        // Switching back restores A's tokens.
        let locked = manager.acquire_executor_with_context_handler(&a).unwrap();
        assert_eq!(locked.processed_tokens().unwrap().tokens(), &[1, 2, 3]);
        assert_eq!(locked.current_step().unwrap(), 3);
        // And B is parked with its own.
        assert_eq!(b.shared_processed_context().processed_token_count(), 2);
    }

    #[test]
    fn prefix_matching_elides_processed_tokens() {
        let manager = manager();
        let handler = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        let mut locked = manager
            .acquire_executor_with_context_handler(&handler)
            .unwrap();
        locked
            .prefill(
                &ExecutorInputs::from_tokens(vec![1, 2, 3]),
                &PrefillParams::default(),
            )
            .unwrap();
        // Re-prefill with the old prompt plus a suffix, rewinding to 0.
        locked
            .prefill(
                &ExecutorInputs::from_tokens(vec![1, 2, 3, 4, 5]),
                &PrefillParams {
                    current_step: Some(0),
                },
            )
            .unwrap();
        assert_eq!(locked.processed_tokens().unwrap().tokens(), &[1, 2, 3, 4, 5]);
        assert_eq!(locked.current_step().unwrap(), 5);
    }

    #[test]
    fn resent_full_prompt_issues_only_the_suffix() {
        let (manager, state) = manager_with_state();
        let handler = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        let mut locked = manager
            .acquire_executor_with_context_handler(&handler)
            .unwrap();
        locked
            .prefill(
                &ExecutorInputs::from_tokens(vec![1, 2, 3]),
                &PrefillParams::default(),
            )
            .unwrap();
        // Re-send the whole prompt plus a suffix, no explicit step.
        locked
            .prefill(
                &ExecutorInputs::from_tokens(vec![1, 2, 3, 4, 5]),
                &PrefillParams::default(),
            )
            .unwrap();
        assert_eq!(locked.processed_tokens().unwrap().tokens(), &[1, 2, 3, 4, 5]);
        assert_eq!(locked.current_step().unwrap(), 5);
        // The executor only ever ingested the two deltas.
        let calls = state.lock().unwrap().prefill_calls.clone();
        assert_eq!(calls, vec![vec![1, 2, 3], vec![4, 5]]);
    }

    #[test]
    fn resent_identical_prompt_is_a_pure_noop() {
        let (manager, state) = manager_with_state();
        let handler = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        let mut locked = manager
            .acquire_executor_with_context_handler(&handler)
            .unwrap();
        locked
            .prefill(
                &ExecutorInputs::from_tokens(vec![1, 2, 3]),
                &PrefillParams::default(),
            )
            .unwrap();
        locked
            .prefill(
                &ExecutorInputs::from_tokens(vec![1, 2, 3]),
                &PrefillParams::default(),
            )
            .unwrap();
        assert_eq!(locked.processed_tokens().unwrap().tokens(), &[1, 2, 3]);
        assert_eq!(locked.current_step().unwrap(), 3);
        assert_eq!(state.lock().unwrap().prefill_calls.len(), 1);
    }

    #[test]
    fn appended_turn_is_not_mistaken_for_a_resend() {
        let (manager, state) = manager_with_state();
        let handler = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        let mut locked = manager
            .acquire_executor_with_context_handler(&handler)
            .unwrap();
        locked
            .prefill(
                &ExecutorInputs::from_tokens(vec![1, 2, 3]),
                &PrefillParams::default(),
            )
            .unwrap();
        // A follow-up turn that does not repeat the prefix appends.
        locked
            .prefill(
                &ExecutorInputs::from_tokens(vec![7, 8]),
                &PrefillParams::default(),
            )
            .unwrap();
        assert_eq!(locked.processed_tokens().unwrap().tokens(), &[1, 2, 3, 7, 8]);
        let calls = state.lock().unwrap().prefill_calls.clone();
        assert_eq!(calls, vec![vec![1, 2, 3], vec![7, 8]]);
    }

    #[test]
    fn fully_matching_prefill_only_moves_cursor() {
        let manager = manager();
        let handler = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        let mut locked = manager
            .acquire_executor_with_context_handler(&handler)
            .unwrap();
        locked
            .prefill(
                &ExecutorInputs::from_tokens(vec![1, 2, 3]),
                &PrefillParams::default(),
            )
            .unwrap();
        locked
            .prefill(
                &ExecutorInputs::from_tokens(vec![1, 2]),
                &PrefillParams {
                    current_step: Some(0),
                },
            )
            .unwrap();
        // Nothing re-ingested, tokens intact, cursor after the match.
        assert_eq!(locked.processed_tokens().unwrap().tokens(), &[1, 2, 3]);
        assert_eq!(locked.current_step().unwrap(), 2);
    }

    #[test]
    fn diverging_non_longest_sibling_detaches_copy_on_write() {
        let manager = manager();
        let a = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        {
            let mut locked = manager.acquire_executor_with_context_handler(&a).unwrap();
            locked
                .prefill(
                    &ExecutorInputs::from_tokens(vec![1, 2, 3, 4]),
                    &PrefillParams::default(),
                )
                .unwrap();
        }
        // Clone B from A while A is active.
        let b = manager.clone_context_handler(&a).unwrap();
        assert!(a.shares_processed_context_with(&b));

        // B rewinds to step 2 and prefills a diverging suffix; A (parked at
        // step 4) is longer, so B must detach before mutating.
        let shared_before = a.shared_processed_context();
        {
            let mut locked = manager.acquire_executor_with_context_handler(&b).unwrap();
            locked
                .prefill(
                    &ExecutorInputs::from_tokens(vec![9, 10]),
                    &PrefillParams {
                        current_step: Some(2),
                    },
                )
                .unwrap();
            assert_eq!(locked.processed_tokens().unwrap().tokens(), &[1, 2, 9, 10]);
        }
        assert!(!a.shares_processed_context_with(&b));
        // A's prefix was materialized into the old shared cell before B
        // overwrote the executor.
        assert_eq!(shared_before.processed_token_count(), 4);
        // Switching back to A still sees its original tokens.
        let locked = manager.acquire_executor_with_context_handler(&a).unwrap();
        assert_eq!(locked.processed_tokens().unwrap().tokens(), &[1, 2, 3, 4]);
    }

    #[test]
    fn clone_of_parked_handler_without_state_fails() {
        let manager = manager();
        let a = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        let b = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        // Activate A, then B; then strip A's owned state to simulate the
        // broken invariant.
        drop(manager.acquire_executor_with_context_handler(&a).unwrap());
        drop(manager.acquire_executor_with_context_handler(&b).unwrap());
        a.take_runtime_config();
        a.take_runtime_state();
        let err = manager.clone_context_handler(&a).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("CLONE_RUNTIME_STATE_SOURCE_INVALID"));
    }

    #[test]
    fn clamps_restored_step_to_token_count() {
        let manager = manager();
        let a = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        // Corrupt the parked state with an oversized step.
        a.set_runtime_state(RuntimeState {
            current_step: 50,
            ran_decode: true,
        });
        let locked = manager.acquire_executor_with_context_handler(&a).unwrap();
        assert_eq!(locked.current_step().unwrap(), 0);
    }

    #[test]
    fn plain_acquire_skips_switch_logic() {
        let manager = manager();
        let handler = manager
            .create_context_handler(&SessionConfig::default())
            .unwrap();
        let mut locked = manager.acquire_executor().unwrap();
        locked
            .prefill(
                &ExecutorInputs::from_tokens(vec![5]),
                &PrefillParams::default(),
            )
            .unwrap();
        // The handler stays parked and untouched.
        assert!(handler.has_runtime_config());
        assert!(handler.has_runtime_state());
    }
}
