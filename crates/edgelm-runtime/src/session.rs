//! Per-conversation session facade.
//!
//! A session is an id, a cursor in the `Fresh → Prefilled → Decoded` state
//! machine, and the `last_task_ids` frontier: the set of submitted,
//! not-yet-terminal tasks that any new submission for this session must
//! depend on. The frontier is cleared — with a structured warning — the
//! moment any callback observes a terminal error/cancel/failure state, so
//! the next submission starts a fresh dependency chain.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use tracing::{info, warn};

use edgelm_kernel::benchmark::BenchmarkInfo;
use edgelm_kernel::config::{BenchmarkParams, DecodeConfig, SessionConfig};
use edgelm_kernel::error::{Error, Result};
use edgelm_kernel::io::{InputData, Responses, SessionId, TaskId, TaskState, TokenId};
use edgelm_kernel::message::{ContentPart, Message, MessageContent};

use crate::bridge::{stream_channel, ResponseStream};
use crate::engine::DEFAULT_TIMEOUT;
use crate::execution::{ExecutionManager, SharedTokenizer, TaskCallback, TaskController};
use crate::prompt::{apply_prompt_templates, ContentType};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Prefilled,
    Decoded,
}

struct SessionShared {
    session_state: SessionState,
    last_task_ids: HashSet<TaskId>,
    active_cancels: Vec<Arc<AtomicBool>>,
}

/// Builds the structured cancellation status delivered to embedders. The
/// field set and order are stable.
pub(crate) fn build_structured_cancelled_status(
    reason_code: &str,
    origin_component: &str,
    session_id: SessionId,
    is_prefill: bool,
    is_decode: bool,
) -> Error {
    Error::cancelled(format!(
        "cancel_reason_code={reason_code};origin_component={origin_component};generation_id=0;\
         session_id={session_id};is_prefill={};is_decode={};op_id=0",
        u8::from(is_prefill),
        u8::from(is_decode),
    ))
}

fn clear_last_task_ids_with_reason(
    session_id: SessionId,
    shared: &Mutex<SessionShared>,
    reason: &str,
) {
    let mut state = shared.lock().expect("session state poisoned");
    warn!(
        session_id = %session_id,
        reason,
        prev_count = state.last_task_ids.len(),
        "session_last_task_ids_cleared"
    );
    state.last_task_ids.clear();
}

/// One conversation bound to the engine's execution manager.
pub struct Session {
    session_id: SessionId,
    weak_self: Weak<Session>,
    execution_manager: Weak<ExecutionManager>,
    tokenizer: SharedTokenizer,
    session_config: SessionConfig,
    benchmark_params: Option<BenchmarkParams>,
    shared: Arc<Mutex<SessionShared>>,
}

impl Session {
    pub(crate) fn create(
        execution_manager: &Arc<ExecutionManager>,
        tokenizer: SharedTokenizer,
        session_config: SessionConfig,
        benchmark_info: Option<BenchmarkInfo>,
    ) -> Result<Arc<Self>> {
        let session_id =
            execution_manager.register_new_session(session_config.clone(), benchmark_info.clone())?;
        let benchmark_params = benchmark_info.as_ref().map(|b| b.params());
        Ok(Self::attach(
            execution_manager,
            tokenizer,
            session_id,
            session_config,
            benchmark_params,
            SessionState::Fresh,
            HashSet::new(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn attach(
        execution_manager: &Arc<ExecutionManager>,
        tokenizer: SharedTokenizer,
        session_id: SessionId,
        session_config: SessionConfig,
        benchmark_params: Option<BenchmarkParams>,
        session_state: SessionState,
        last_task_ids: HashSet<TaskId>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            session_id,
            weak_self: weak_self.clone(),
            execution_manager: Arc::downgrade(execution_manager),
            tokenizer,
            session_config,
            benchmark_params,
            shared: Arc::new(Mutex::new(SessionShared {
                session_state,
                last_task_ids,
                active_cancels: Vec::new(),
            })),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.lock().expect("session state poisoned").session_state
    }

    /// Snapshot of the dependency frontier.
    pub fn last_task_ids(&self) -> HashSet<TaskId> {
        self.shared
            .lock()
            .expect("session state poisoned")
            .last_task_ids
            .clone()
    }

    fn execution_manager(&self) -> Result<Arc<ExecutionManager>> {
        self.execution_manager
            .upgrade()
            .ok_or_else(|| Error::failed_precondition("execution manager is not available"))
    }

    /// Tokenizes text contents; other modalities pass through.
    fn tokenize_contents(&self, contents: Vec<InputData>) -> Result<Vec<InputData>> {
        let mut out = Vec::with_capacity(contents.len());
        for content in contents {
            match content {
                InputData::Text(text) => {
                    let ids = self
                        .tokenizer
                        .lock()
                        .expect("tokenizer poisoned")
                        .text_to_ids(&text)?;
                    out.push(InputData::Tokens(ids));
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }

    fn preprocess_for_prefill(&self, contents: Vec<InputData>) -> Result<Vec<InputData>> {
        // A benchmark pass replaces the prompt with a synthetic token
        // sequence of the configured length.
        if let Some(params) = self.benchmark_params {
            if params.num_prefill_tokens > 0 {
                let ids: Vec<TokenId> = (0..params.num_prefill_tokens)
                    .map(|i| (i % 97) as TokenId)
                    .collect();
                return Ok(vec![InputData::Tokens(ids)]);
            }
        }
        let (content_type, is_first_turn) = {
            let state = self.shared.lock().expect("session state poisoned");
            let is_first_turn = state.session_state == SessionState::Fresh;
            let content_type = if self.session_config.apply_prompt_template {
                if is_first_turn || state.session_state == SessionState::Decoded {
                    ContentType::First
                } else {
                    ContentType::Middle
                }
            } else {
                ContentType::Na
            };
            (content_type, is_first_turn)
        };
        let templated =
            apply_prompt_templates(contents, content_type, &self.session_config, is_first_turn);
        self.tokenize_contents(templated)
    }

    /// Submits a prefill task depending on the current frontier and
    /// advances the state machine to `Prefilled`.
    pub fn run_prefill_async(
        &self,
        contents: Vec<InputData>,
        mut callback: TaskCallback,
    ) -> Result<TaskController> {
        let em = self.execution_manager()?;
        let cancelled = Arc::new(AtomicBool::new(false));
        let preprocessed = self.preprocess_for_prefill(contents)?;

        let task_id = em.new_task_id();
        let deps = self.last_task_ids();
        info!(
            session_id = %self.session_id,
            task_id = %task_id,
            dep_count = deps.len(),
            "session_prefill_task_created"
        );

        let session_id = self.session_id;
        let shared = Arc::clone(&self.shared);
        let wrapped: TaskCallback = Box::new(move |responses: Result<Responses>| {
            match &responses {
                Err(_) => clear_last_task_ids_with_reason(
                    session_id,
                    &shared,
                    "prefill_async_callback_error_status",
                ),
                Ok(r) => {
                    let state = r.task_state();
                    if state.is_end_state() && state != TaskState::Done {
                        clear_last_task_ids_with_reason(
                            session_id,
                            &shared,
                            "prefill_async_callback_terminal_state",
                        );
                    }
                }
            }
            callback(responses);
        });

        em.add_prefill_task(
            self.session_id,
            task_id,
            preprocessed,
            deps,
            Arc::clone(&cancelled),
            wrapped,
        )?;
        {
            let mut state = self.shared.lock().expect("session state poisoned");
            state.session_state = SessionState::Prefilled;
            state.last_task_ids = HashSet::from([task_id]);
            state.active_cancels.push(Arc::clone(&cancelled));
        }
        Ok(em.controller(task_id, cancelled))
    }

    /// Synchronous prefill: submit, block, surface the outcome.
    pub fn run_prefill(&self, contents: Vec<InputData>) -> Result<()> {
        info!(
            session_id = %self.session_id,
            session_state = ?self.session_state(),
            input_count = contents.len(),
            "session_run_prefill_start"
        );
        let status: Arc<Mutex<Result<()>>> = Arc::new(Mutex::new(Ok(())));
        let session_id = self.session_id;
        let cb_status = Arc::clone(&status);
        let controller = self.run_prefill_async(
            contents,
            Box::new(move |responses| {
                let mut slot = cb_status.lock().expect("prefill status poisoned");
                *slot = match responses {
                    Err(e) => Err(e),
                    Ok(r) => match r.task_state() {
                        TaskState::Cancelled | TaskState::DependentTaskCancelled => {
                            warn!(
                                session_id = %session_id,
                                task_state = ?r.task_state(),
                                "session_run_prefill_cancelled"
                            );
                            Err(build_structured_cancelled_status(
                                "PREFILL_TASK_CANCELLED_STATE",
                                "SCHEDULER",
                                session_id,
                                true,
                                false,
                            ))
                        }
                        TaskState::Failed | TaskState::DependentTaskFailed => {
                            warn!(
                                session_id = %session_id,
                                task_state = ?r.task_state(),
                                "session_run_prefill_failed"
                            );
                            // The root cause already surfaced through the
                            // failing predecessor's own callback.
                            Ok(())
                        }
                        _ => Ok(()),
                    },
                };
            }),
        )?;
        controller.wait_until_done(DEFAULT_TIMEOUT)?;
        let slot = status.lock().expect("prefill status poisoned");
        slot.clone()
    }

    /// Submits a decode task. When templates are active, a silent
    /// tail-prefill carrying the turn suffix goes in first so the prompt is
    /// fully set up for decoding.
    pub fn run_decode_async(
        &self,
        mut callback: TaskCallback,
        decode_config: DecodeConfig,
    ) -> Result<TaskController> {
        {
            let state = self.shared.lock().expect("session state poisoned");
            if state.session_state != SessionState::Prefilled {
                return Err(Error::failed_precondition("session is not prefilled yet"));
            }
        }
        let em = self.execution_manager()?;
        let cancelled = Arc::new(AtomicBool::new(false));

        if self.session_config.apply_prompt_template {
            let templated = apply_prompt_templates(
                vec![InputData::Text(String::new())],
                ContentType::Last,
                &self.session_config,
                false,
            );
            if !templated.is_empty() {
                let preprocessed = self.tokenize_contents(templated)?;
                let tail_id = em.new_task_id();
                let deps = self.last_task_ids();
                info!(
                    session_id = %self.session_id,
                    task_id = %tail_id,
                    dep_count = deps.len(),
                    "session_prefill_tail_task_created"
                );
                em.add_prefill_task(
                    self.session_id,
                    tail_id,
                    preprocessed,
                    deps,
                    Arc::clone(&cancelled),
                    Box::new(|_| {}),
                )?;
                let mut state = self.shared.lock().expect("session state poisoned");
                state.last_task_ids = HashSet::from([tail_id]);
            }
        }
        {
            let mut state = self.shared.lock().expect("session state poisoned");
            state.session_state = SessionState::Decoded;
        }

        let task_id = em.new_task_id();
        let deps = self.last_task_ids();
        info!(
            session_id = %self.session_id,
            task_id = %task_id,
            dep_count = deps.len(),
            "session_decode_task_created"
        );

        let session_id = self.session_id;
        let shared = Arc::clone(&self.shared);
        let wrapped: TaskCallback = Box::new(move |responses: Result<Responses>| {
            match &responses {
                Err(_) => clear_last_task_ids_with_reason(
                    session_id,
                    &shared,
                    "decode_async_callback_error_status",
                ),
                Ok(r) => {
                    let state = r.task_state();
                    if state.is_end_state() && state != TaskState::Done {
                        clear_last_task_ids_with_reason(
                            session_id,
                            &shared,
                            "decode_async_callback_terminal_state",
                        );
                    }
                }
            }
            callback(responses);
        });

        em.add_decode_task(
            self.session_id,
            task_id,
            deps,
            decode_config.constraint.clone(),
            Arc::clone(&cancelled),
            wrapped,
            decode_config
                .max_output_tokens
                .unwrap_or(self.session_config.max_output_tokens),
        )?;
        {
            let mut state = self.shared.lock().expect("session state poisoned");
            state.last_task_ids = HashSet::from([task_id]);
            state.active_cancels.push(Arc::clone(&cancelled));
        }
        Ok(em.controller(task_id, cancelled))
    }

    /// Accumulating synchronous decode: per-token texts concatenate,
    /// per-token scores add up and are normalized by the token count on
    /// the terminal chunk.
    pub fn run_decode(&self, decode_config: DecodeConfig) -> Result<Responses> {
        let candidates = self.session_config.num_output_candidates;
        let collected: Arc<Mutex<Result<Responses>>> = Arc::new(Mutex::new(Ok(Responses::new(
            TaskState::Created,
            vec![String::new(); candidates],
            vec![0.0; candidates],
        ))));
        let num_decode_tokens = Arc::new(Mutex::new(0usize));

        let session_id = self.session_id;
        let cb_collected = Arc::clone(&collected);
        let cb_tokens = Arc::clone(&num_decode_tokens);
        let controller = self.run_decode_async(
            Box::new(move |responses| {
                let mut slot = cb_collected.lock().expect("decode status poisoned");
                let responses = match responses {
                    Err(e) => {
                        *slot = Err(e);
                        return;
                    }
                    Ok(r) => r,
                };
                let state = responses.task_state();
                if matches!(
                    state,
                    TaskState::Cancelled | TaskState::DependentTaskCancelled
                ) {
                    warn!(
                        session_id = %session_id,
                        task_state = ?state,
                        "session_run_decode_cancelled"
                    );
                    *slot = Err(build_structured_cancelled_status(
                        "DECODE_TASK_CANCELLED_STATE",
                        "SCHEDULER",
                        session_id,
                        false,
                        true,
                    ));
                    return;
                }
                if matches!(state, TaskState::Failed | TaskState::DependentTaskFailed) {
                    warn!(
                        session_id = %session_id,
                        task_state = ?state,
                        "session_run_decode_failed"
                    );
                }
                let Ok(accumulated) = slot.as_mut() else {
                    return;
                };
                accumulated.set_task_state(state);
                if !state.is_end_state()
                    && responses.texts().is_empty()
                    && responses.scores().is_empty()
                {
                    return;
                }
                if accumulated.scores().len() == responses.scores().len() {
                    for (acc, score) in accumulated
                        .scores_mut()
                        .iter_mut()
                        .zip(responses.scores())
                    {
                        *acc += score;
                    }
                }
                if accumulated.texts().len() == responses.texts().len() {
                    *cb_tokens.lock().expect("token count poisoned") += 1;
                    for (acc, text) in accumulated.texts_mut().iter_mut().zip(responses.texts()) {
                        acc.push_str(text);
                    }
                } else if !responses.texts().is_empty() {
                    *slot = Err(Error::internal(format!(
                        "decode responses size mismatch: {} vs {}",
                        candidates,
                        responses.texts().len()
                    )));
                    return;
                }
                if state.is_end_state() {
                    let count = (*cb_tokens.lock().expect("token count poisoned")).max(1);
                    for score in accumulated.scores_mut() {
                        *score /= count as f32;
                    }
                }
            }),
            decode_config,
        )?;
        controller.wait_until_done(DEFAULT_TIMEOUT)?;
        let slot = collected.lock().expect("decode status poisoned");
        slot.clone()
    }

    /// Scores `target_text` (batch size must be 1) against the current
    /// context: the sum of per-token log-probabilities.
    pub fn run_text_scoring_async(
        &self,
        target_text: &[&str],
        callback: TaskCallback,
        store_token_lengths: bool,
    ) -> Result<TaskController> {
        if target_text.len() != 1 {
            return Err(Error::invalid_argument("target text size should be 1"));
        }
        let em = self.execution_manager()?;
        let cancelled = Arc::new(AtomicBool::new(false));
        let task_id = em.new_task_id();
        em.add_text_scoring_task(
            self.session_id,
            task_id,
            self.last_task_ids(),
            target_text[0].to_string(),
            store_token_lengths,
            Arc::clone(&cancelled),
            callback,
        )?;
        Ok(em.controller(task_id, cancelled))
    }

    pub fn run_text_scoring(
        &self,
        target_text: &[&str],
        store_token_lengths: bool,
    ) -> Result<Responses> {
        let collected: Arc<Mutex<Option<Result<Responses>>>> = Arc::new(Mutex::new(None));
        let cb_collected = Arc::clone(&collected);
        let controller = self.run_text_scoring_async(
            target_text,
            Box::new(move |responses| {
                *cb_collected.lock().expect("scoring status poisoned") = Some(responses);
            }),
            store_token_lengths,
        )?;
        controller.wait_until_done(DEFAULT_TIMEOUT)?;
        let mut slot = collected.lock().expect("scoring status poisoned");
        slot.take()
            .unwrap_or_else(|| Err(Error::internal("scoring callback never fired")))
    }

    /// Prefill then decode, synchronously.
    pub fn generate_content(&self, contents: Vec<InputData>) -> Result<Responses> {
        self.run_prefill(contents)?;
        self.run_decode(DecodeConfig::default())
    }

    /// Prefill then decode, streaming: the caller's callback receives the
    /// decode chunks once the prefill completes.
    pub fn generate_content_stream(
        &self,
        contents: Vec<InputData>,
        callback: TaskCallback,
        decode_config: DecodeConfig,
    ) -> Result<()> {
        let session_id = self.session_id;
        let shared = Arc::clone(&self.shared);
        let weak_self = self.weak_self.clone();
        let mut stream_callback = Some(callback);
        let prefill_callback: TaskCallback = Box::new(move |responses: Result<Responses>| {
            match responses {
                Err(e) => {
                    clear_last_task_ids_with_reason(
                        session_id,
                        &shared,
                        "stream_prefill_callback_error_status",
                    );
                    if let Some(mut cb) = stream_callback.take() {
                        cb(Err(e));
                    }
                }
                Ok(r) if r.task_state() == TaskState::Done => {
                    let Some(session) = weak_self.upgrade() else {
                        return;
                    };
                    if let Some(cb) = stream_callback.take() {
                        if let Err(e) = session.run_decode_async(cb, decode_config.clone()) {
                            tracing::error!(
                                session_id = %session_id,
                                error = %e,
                                "failed to start decode task"
                            );
                        }
                    }
                }
                Ok(r) if r.task_state().is_end_state() => {
                    warn!(
                        session_id = %session_id,
                        prefill_state = ?r.task_state(),
                        "session_stream_prefill_end_non_done"
                    );
                    clear_last_task_ids_with_reason(
                        session_id,
                        &shared,
                        "stream_prefill_callback_end_non_done",
                    );
                    if let Some(mut cb) = stream_callback.take() {
                        cb(Err(build_structured_cancelled_status(
                            "PREFILL_TASK_CANCELLED_STATE",
                            "SCHEDULER",
                            session_id,
                            true,
                            false,
                        )));
                    }
                }
                Ok(_) => {}
            }
        });
        self.run_prefill_async(contents, prefill_callback)?;
        Ok(())
    }

    /// Clones this session: the clone's context aliases this session's
    /// shared processed context until one of them diverges.
    pub fn clone_session_async(&self, callback: TaskCallback) -> Result<Arc<Session>> {
        let em = self.execution_manager()?;
        let task_id = em.new_task_id();
        let benchmark_info = em.benchmark_info(self.session_id)?;
        let dest = em.register_new_session(self.session_config.clone(), benchmark_info)?;

        em.add_clone_session_task(
            self.session_id,
            task_id,
            self.last_task_ids(),
            dest,
            Arc::new(AtomicBool::new(false)),
            callback,
        )?;
        let (session_state, last_task_ids) = {
            let mut state = self.shared.lock().expect("session state poisoned");
            state.last_task_ids = HashSet::from([task_id]);
            (state.session_state, state.last_task_ids.clone())
        };

        Ok(Session::attach(
            &em,
            Arc::clone(&self.tokenizer),
            dest,
            self.session_config.clone(),
            self.benchmark_params,
            session_state,
            last_task_ids,
        ))
    }

    pub fn clone_session(&self) -> Result<Arc<Session>> {
        let done: Arc<(Mutex<Option<Result<()>>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let cb_done = Arc::clone(&done);
        let session = self.clone_session_async(Box::new(move |responses| {
            let (slot, cv) = &*cb_done;
            *slot.lock().expect("clone status poisoned") = Some(responses.map(|_| ()));
            cv.notify_all();
        }))?;
        let (slot, cv) = &*done;
        let guard = slot.lock().expect("clone status poisoned");
        let (guard, wait) = cv
            .wait_timeout_while(guard, DEFAULT_TIMEOUT, |s| s.is_none())
            .expect("clone status poisoned");
        if wait.timed_out() && guard.is_none() {
            return Err(Error::deadline_exceeded(
                "timed out waiting for clone callback completion",
            ));
        }
        match guard.as_ref() {
            Some(Ok(())) => Ok(session),
            Some(Err(e)) => Err(e.clone()),
            None => Err(Error::internal("clone callback never fired")),
        }
    }

    pub fn get_benchmark_info(&self) -> Result<BenchmarkInfo> {
        self.execution_manager()?
            .benchmark_info(self.session_id)?
            .ok_or_else(|| {
                Error::internal(
                    "benchmark is not enabled; set benchmark_params in the engine settings",
                )
            })
    }

    pub fn with_benchmark_info_mut<R>(
        &self,
        f: impl FnOnce(&mut BenchmarkInfo) -> R,
    ) -> Result<R> {
        self.execution_manager()?
            .with_benchmark_info_mut(self.session_id, f)
    }

    /// Requests cooperative cancellation of every task this session has
    /// submitted and not yet observed as terminal.
    pub fn cancel_process(&self) {
        let cancels = {
            let mut state = self.shared.lock().expect("session state poisoned");
            std::mem::take(&mut state.active_cancels)
        };
        info!(
            session_id = %self.session_id,
            cancel_count = cancels.len(),
            "session_cancel_process"
        );
        for cancel in cancels {
            cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Synchronous message round-trip: prefill the message, decode, wrap
    /// the first candidate as an assistant message.
    pub fn send_message(&self, message: &Message) -> Result<Message> {
        let contents = contents_from_message(message)?;
        let responses = self.generate_content(contents)?;
        Ok(Message::assistant(
            responses.texts().first().cloned().unwrap_or_default(),
        ))
    }

    /// Streaming message round-trip over the async bridge.
    pub fn send_message_async(&self, message: &Message) -> Result<ResponseStream> {
        let contents = contents_from_message(message)?;
        let (sender, stream) = stream_channel();
        self.generate_content_stream(contents, sender.into_callback(), DecodeConfig::default())?;
        Ok(stream)
    }
}

/// Resolves a wire message into session inputs. Image parts carry base64
/// pixels and are decoded and preprocessed here; tool responses are
/// serialized back to JSON text for the model.
pub(crate) fn contents_from_message(message: &Message) -> Result<Vec<InputData>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    match &message.content {
        MessageContent::Text(text) => Ok(vec![InputData::Text(text.clone())]),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => Ok(InputData::Text(text.clone())),
                ContentPart::Image { data } => {
                    let encoded = data.as_ref().ok_or_else(|| {
                        Error::invalid_argument("image content part carries no pixel data")
                    })?;
                    let raw = STANDARD.decode(encoded).map_err(|e| {
                        Error::invalid_argument(format!("image content part is not valid base64: {e}"))
                    })?;
                    Ok(InputData::Image(crate::vision::preprocess_image(&raw)?))
                }
                ContentPart::ToolResponse { tool_response } => Ok(InputData::Text(
                    serde_json::to_string(&tool_response.output).unwrap_or_default(),
                )),
            })
            .collect(),
    }
}
