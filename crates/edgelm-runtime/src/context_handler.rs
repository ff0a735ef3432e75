//! Per-session context handlers.
//!
//! A [`ContextHandler`] is a session's bookmark into the executor. While a
//! handler is the active one, it owns nothing — its runtime config, runtime
//! state and processed context all live in the executor and the handler is
//! only a pointer back. While parked, the handler owns its runtime
//! config/state and its [`SharedProcessedContext`] holds the materialized
//! prefix.
//!
//! Several handlers (clones) may alias one `SharedProcessedContext`. The
//! shared cell tracks the parked siblings' steps so the resource manager
//! can tell whether the active handler is the longest sibling — the one
//! allowed to mutate the shared prefix without copy-on-write detachment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use edgelm_kernel::error::{Error, Result};
use edgelm_kernel::executor::{AudioContext, LlmContext, ProcessedContext, RuntimeConfig, RuntimeState};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct SharedState {
    processed: Option<ProcessedContext>,
    /// Steps of parked handlers aliasing this context, by handler id. The
    /// active handler never has an entry; its live step comes from the
    /// executor.
    parked_steps: HashMap<u64, usize>,
}

/// Reference-counted holder of the materialized prefix for one branch of
/// history.
#[derive(Default)]
pub struct SharedProcessedContext {
    inner: Mutex<SharedState>,
}

impl SharedProcessedContext {
    pub fn new(processed: Option<ProcessedContext>) -> Self {
        Self {
            inner: Mutex::new(SharedState {
                processed,
                parked_steps: HashMap::new(),
            }),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_processed_context(&self) -> bool {
        self.inner.lock().expect("shared context poisoned").processed.is_some()
    }

    /// Stores the materialized prefix. The cell must be empty: a populated
    /// cell means some other path already parked a context here.
    pub fn set_processed_context(&self, context: ProcessedContext) -> Result<()> {
        let mut state = self.inner.lock().expect("shared context poisoned");
        if state.processed.is_some() {
            return Err(Error::internal(
                "shared processed context is already populated",
            ));
        }
        state.processed = Some(context);
        Ok(())
    }

    /// Removes and returns the materialized prefix, leaving the cell empty
    /// (the caller is about to load it into the executor).
    pub fn take_processed_context(&self) -> Option<ProcessedContext> {
        self.inner.lock().expect("shared context poisoned").processed.take()
    }

    pub fn processed_token_count(&self) -> usize {
        self.inner
            .lock()
            .expect("shared context poisoned")
            .processed
            .as_ref()
            .map(|p| p.processed_tokens.token_count())
            .unwrap_or(0)
    }

    fn record_parked_step(&self, handler_id: u64, step: usize) {
        self.inner
            .lock()
            .expect("shared context poisoned")
            .parked_steps
            .insert(handler_id, step);
    }

    fn clear_parked_step(&self, handler_id: u64) {
        self.inner
            .lock()
            .expect("shared context poisoned")
            .parked_steps
            .remove(&handler_id);
    }

    /// The largest step among handlers aliasing this context, given the
    /// active handler's live step.
    pub fn longest_step(&self, active_step: usize) -> usize {
        self.inner
            .lock()
            .expect("shared context poisoned")
            .parked_steps
            .values()
            .copied()
            .chain(std::iter::once(active_step))
            .max()
            .unwrap_or(active_step)
    }
}

#[derive(Default)]
struct OwnedState {
    runtime_config: Option<RuntimeConfig>,
    runtime_state: Option<RuntimeState>,
    audio_context: Option<Box<dyn AudioContext>>,
}

/// A session's bookmark into the executor; active or parked.
pub struct ContextHandler {
    id: u64,
    shared: Mutex<Arc<SharedProcessedContext>>,
    owned: Mutex<OwnedState>,
}

impl std::fmt::Debug for ContextHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandler")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ContextHandler {
    /// Builds a parked handler that owns a freshly created context.
    pub fn new(llm_context: LlmContext, audio_context: Option<Box<dyn AudioContext>>) -> Self {
        let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
        let step = llm_context.state.current_step;
        let shared = Arc::new(SharedProcessedContext::new(Some(llm_context.processed)));
        shared.record_parked_step(id, step);
        Self {
            id,
            shared: Mutex::new(shared),
            owned: Mutex::new(OwnedState {
                runtime_config: Some(llm_context.config),
                runtime_state: Some(llm_context.state),
                audio_context,
            }),
        }
    }

    /// Builds a parked handler aliasing an existing shared context — the
    /// clone path.
    pub fn bundle(
        shared: Arc<SharedProcessedContext>,
        runtime_config: RuntimeConfig,
        runtime_state: RuntimeState,
        audio_context: Option<Box<dyn AudioContext>>,
    ) -> Self {
        let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
        shared.record_parked_step(id, runtime_state.current_step);
        Self {
            id,
            shared: Mutex::new(shared),
            owned: Mutex::new(OwnedState {
                runtime_config: Some(runtime_config),
                runtime_state: Some(runtime_state),
                audio_context,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn shared_processed_context(&self) -> Arc<SharedProcessedContext> {
        Arc::clone(&self.shared.lock().expect("handler poisoned"))
    }

    /// Points the handler at a different shared context (copy-on-write
    /// detachment). Any parked-step entry moves off the old cell.
    pub fn update_shared_processed_context(&self, new_shared: Arc<SharedProcessedContext>) {
        let mut shared = self.shared.lock().expect("handler poisoned");
        shared.clear_parked_step(self.id);
        *shared = new_shared;
    }

    /// Whether this handler and `other` alias the same shared context.
    pub fn shares_processed_context_with(&self, other: &ContextHandler) -> bool {
        Arc::ptr_eq(
            &self.shared_processed_context(),
            &other.shared_processed_context(),
        )
    }

    pub fn has_runtime_config(&self) -> bool {
        self.owned.lock().expect("handler poisoned").runtime_config.is_some()
    }

    pub fn has_runtime_state(&self) -> bool {
        self.owned.lock().expect("handler poisoned").runtime_state.is_some()
    }

    pub fn runtime_config(&self) -> Option<RuntimeConfig> {
        self.owned.lock().expect("handler poisoned").runtime_config.clone()
    }

    pub fn runtime_state(&self) -> Option<RuntimeState> {
        self.owned.lock().expect("handler poisoned").runtime_state
    }

    pub fn take_runtime_config(&self) -> Option<RuntimeConfig> {
        self.owned.lock().expect("handler poisoned").runtime_config.take()
    }

    pub fn take_runtime_state(&self) -> Option<RuntimeState> {
        self.owned.lock().expect("handler poisoned").runtime_state.take()
    }

    pub fn set_runtime_config(&self, config: RuntimeConfig) {
        self.owned.lock().expect("handler poisoned").runtime_config = Some(config);
    }

    pub fn set_runtime_state(&self, state: RuntimeState) {
        self.owned.lock().expect("handler poisoned").runtime_state = Some(state);
    }

    /// Records this handler as parked at `step` on its shared context.
    pub fn mark_parked(&self, step: usize) {
        self.shared_processed_context().record_parked_step(self.id, step);
    }

    /// Removes this handler's parked entry; its live step is now the
    /// executor's.
    pub fn mark_active(&self) {
        self.shared_processed_context().clear_parked_step(self.id);
    }

    pub fn has_audio_context(&self) -> bool {
        self.owned.lock().expect("handler poisoned").audio_context.is_some()
    }

    pub fn clone_audio_context(&self) -> Option<Box<dyn AudioContext>> {
        self.owned.lock().expect("handler poisoned").audio_context.clone()
    }

    pub fn set_audio_context(&self, context: Box<dyn AudioContext>) {
        self.owned.lock().expect("handler poisoned").audio_context = Some(context);
    }
}

impl Drop for ContextHandler {
    fn drop(&mut self) {
        self.shared_processed_context().clear_parked_step(self.id);
    }
}
