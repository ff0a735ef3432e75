//! The execution manager: a dependency-ordered task scheduler draining onto
//! a single worker thread.
//!
//! Submitters enqueue tasks from arbitrary threads, holding the scheduler
//! mutex only for O(1) bookkeeping. The worker picks the first task in FIFO
//! submission order whose predecessors are all terminal, resolves
//! cancelled/failed predecessors without touching the executor, and
//! otherwise acquires the executor through the resource manager (context
//! switching as needed) and dispatches. Callbacks run on the worker thread,
//! never synchronously under a submission call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use edgelm_kernel::benchmark::BenchmarkInfo;
use edgelm_kernel::config::{DecodeConstraint, SessionConfig};
use edgelm_kernel::error::{Error, Result};
use edgelm_kernel::executor::{ExecutorInputs, PrefillParams};
use edgelm_kernel::io::{InputData, Responses, SessionId, TaskId, TaskState, TokenId};
use edgelm_kernel::sampler::{Logits, Sampler};
use edgelm_kernel::tokenizer::Tokenizer;

use crate::context_handler::ContextHandler;
use crate::resource_manager::ResourceManager;
use crate::sampler::TopPSampler;

/// Callback invoked on the worker thread with streaming and terminal
/// responses of a task.
pub type TaskCallback = Box<dyn FnMut(Result<Responses>) + Send>;

/// Tokenizer shared between the engine, sessions and the worker.
/// Streaming detokenization mutates buffering state, hence the lock.
pub type SharedTokenizer = Arc<Mutex<Box<dyn Tokenizer>>>;

enum TaskPayload {
    Prefill {
        contents: Vec<InputData>,
    },
    Decode {
        constraint: Option<Arc<dyn DecodeConstraint>>,
        max_output_tokens: usize,
    },
    TextScoring {
        target_text: String,
        store_token_lengths: bool,
    },
    CloneSession {
        dest: SessionId,
    },
}

struct TaskEntry {
    id: TaskId,
    session: SessionId,
    deps: HashSet<TaskId>,
    cancelled: Arc<AtomicBool>,
    callback: TaskCallback,
    payload: TaskPayload,
}

/// Everything the manager tracks about one session.
pub struct SessionInfo {
    pub session_config: SessionConfig,
    pub benchmark_info: Option<BenchmarkInfo>,
    pub(crate) handler: Arc<ContextHandler>,
}

#[derive(Default)]
struct ExecState {
    next_task_id: u64,
    next_session_id: u64,
    sessions: HashMap<SessionId, SessionInfo>,
    pending: VecDeque<TaskEntry>,
    /// Terminal outcome of every finished task, used to resolve dependent
    /// tasks.
    outcomes: HashMap<TaskId, TaskState>,
    /// Number of tasks currently executing on the worker (0 or 1).
    active: usize,
    shutdown: bool,
}

struct SchedulerShared {
    state: Mutex<ExecState>,
    cv: Condvar,
}

impl SchedulerShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, ExecState> {
        self.state.lock().expect("scheduler state poisoned")
    }
}

/// Handle returned to submitters: cancel the task or block until it
/// reaches a terminal state.
pub struct TaskController {
    task_id: TaskId,
    cancelled: Arc<AtomicBool>,
    shared: Weak<SchedulerShared>,
}

impl TaskController {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Requests cooperative cancellation. The flag is checked before
    /// dispatch and between decode iterations; an in-flight kernel is not
    /// aborted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(shared) = self.shared.upgrade() {
            shared.cv.notify_all();
        }
    }

    /// Blocks until the task is terminal, or fails with
    /// `DeadlineExceeded` leaving the task live.
    pub fn wait_until_done(&self, timeout: Duration) -> Result<()> {
        let shared = self.shared.upgrade().ok_or_else(|| {
            Error::failed_precondition("execution manager is not available")
        })?;
        let state = shared.lock();
        let (state, wait) = shared
            .cv
            .wait_timeout_while(state, timeout, |s| !s.outcomes.contains_key(&self.task_id))
            .expect("scheduler state poisoned");
        if wait.timed_out() && !state.outcomes.contains_key(&self.task_id) {
            return Err(Error::deadline_exceeded(format!(
                "task {} still running after {:?}",
                self.task_id, timeout
            )));
        }
        Ok(())
    }
}

/// The scheduler.
pub struct ExecutionManager {
    shared: Arc<SchedulerShared>,
    resource_manager: Arc<ResourceManager>,
    tokenizer: SharedTokenizer,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionManager {
    pub fn create(
        resource_manager: Arc<ResourceManager>,
        tokenizer: SharedTokenizer,
    ) -> Arc<Self> {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(ExecState::default()),
            cv: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            let resource_manager = Arc::clone(&resource_manager);
            let tokenizer = Arc::clone(&tokenizer);
            std::thread::Builder::new()
                .name("edgelm-exec".to_string())
                .spawn(move || worker_loop(shared, resource_manager, tokenizer))
                .expect("failed to spawn execution thread")
        };
        Arc::new(Self {
            shared,
            resource_manager,
            tokenizer,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.resource_manager
    }

    pub fn tokenizer(&self) -> &SharedTokenizer {
        &self.tokenizer
    }

    /// Registers a session, creating its context handler.
    pub fn register_new_session(
        &self,
        session_config: SessionConfig,
        benchmark_info: Option<BenchmarkInfo>,
    ) -> Result<SessionId> {
        let handler = self.resource_manager.create_context_handler(&session_config)?;
        let mut state = self.shared.lock();
        let id = SessionId(state.next_session_id);
        state.next_session_id += 1;
        state.sessions.insert(
            id,
            SessionInfo {
                session_config,
                benchmark_info,
                handler,
            },
        );
        debug!(session_id = %id, "session_registered");
        Ok(id)
    }

    pub fn new_task_id(&self) -> TaskId {
        let mut state = self.shared.lock();
        let id = TaskId(state.next_task_id);
        state.next_task_id += 1;
        id
    }

    pub fn add_prefill_task(
        &self,
        session: SessionId,
        task_id: TaskId,
        contents: Vec<InputData>,
        deps: HashSet<TaskId>,
        cancelled: Arc<AtomicBool>,
        callback: TaskCallback,
    ) -> Result<()> {
        self.add_task(TaskEntry {
            id: task_id,
            session,
            deps,
            cancelled,
            callback,
            payload: TaskPayload::Prefill { contents },
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_decode_task(
        &self,
        session: SessionId,
        task_id: TaskId,
        deps: HashSet<TaskId>,
        constraint: Option<Arc<dyn DecodeConstraint>>,
        cancelled: Arc<AtomicBool>,
        callback: TaskCallback,
        max_output_tokens: usize,
    ) -> Result<()> {
        self.add_task(TaskEntry {
            id: task_id,
            session,
            deps,
            cancelled,
            callback,
            payload: TaskPayload::Decode {
                constraint,
                max_output_tokens,
            },
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_text_scoring_task(
        &self,
        session: SessionId,
        task_id: TaskId,
        deps: HashSet<TaskId>,
        target_text: String,
        store_token_lengths: bool,
        cancelled: Arc<AtomicBool>,
        callback: TaskCallback,
    ) -> Result<()> {
        self.add_task(TaskEntry {
            id: task_id,
            session,
            deps,
            cancelled,
            callback,
            payload: TaskPayload::TextScoring {
                target_text,
                store_token_lengths,
            },
        })
    }

    pub fn add_clone_session_task(
        &self,
        session: SessionId,
        task_id: TaskId,
        deps: HashSet<TaskId>,
        dest: SessionId,
        cancelled: Arc<AtomicBool>,
        callback: TaskCallback,
    ) -> Result<()> {
        self.add_task(TaskEntry {
            id: task_id,
            session,
            deps,
            cancelled,
            callback,
            payload: TaskPayload::CloneSession { dest },
        })
    }

    fn add_task(&self, task: TaskEntry) -> Result<()> {
        let mut state = self.shared.lock();
        if !state.sessions.contains_key(&task.session) {
            return Err(Error::not_found(format!(
                "session {} is not registered",
                task.session
            )));
        }
        debug!(
            task_id = %task.id,
            session_id = %task.session,
            dep_count = task.deps.len(),
            "task_submitted"
        );
        state.pending.push_back(task);
        drop(state);
        self.shared.cv.notify_all();
        Ok(())
    }

    /// Builds the controller for a submitted task.
    pub fn controller(&self, task_id: TaskId, cancelled: Arc<AtomicBool>) -> TaskController {
        TaskController {
            task_id,
            cancelled,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Blocks until every submitted task is terminal.
    pub fn wait_until_all_done(&self, timeout: Duration) -> Result<()> {
        let state = self.shared.lock();
        let (state, wait) = self
            .shared
            .cv
            .wait_timeout_while(state, timeout, |s| {
                !(s.pending.is_empty() && s.active == 0)
            })
            .expect("scheduler state poisoned");
        if wait.timed_out() && !(state.pending.is_empty() && state.active == 0) {
            return Err(Error::deadline_exceeded(format!(
                "tasks still running after {timeout:?}"
            )));
        }
        Ok(())
    }

    /// Runs `f` against the session's registration record.
    pub fn with_session_info<R>(
        &self,
        session: SessionId,
        f: impl FnOnce(&SessionInfo) -> R,
    ) -> Result<R> {
        let state = self.shared.lock();
        state
            .sessions
            .get(&session)
            .map(f)
            .ok_or_else(|| Error::not_found(format!("session {session} is not registered")))
    }

    pub fn session_config(&self, session: SessionId) -> Result<SessionConfig> {
        let state = self.shared.lock();
        state
            .sessions
            .get(&session)
            .map(|info| info.session_config.clone())
            .ok_or_else(|| Error::not_found(format!("session {session} is not registered")))
    }

    pub fn benchmark_info(&self, session: SessionId) -> Result<Option<BenchmarkInfo>> {
        let state = self.shared.lock();
        state
            .sessions
            .get(&session)
            .map(|info| info.benchmark_info.clone())
            .ok_or_else(|| Error::not_found(format!("session {session} is not registered")))
    }

    /// Runs `f` against the session's mutable benchmark info.
    pub fn with_benchmark_info_mut<R>(
        &self,
        session: SessionId,
        f: impl FnOnce(&mut BenchmarkInfo) -> R,
    ) -> Result<R> {
        let mut state = self.shared.lock();
        let info = state
            .sessions
            .get_mut(&session)
            .ok_or_else(|| Error::not_found(format!("session {session} is not registered")))?;
        let bench = info.benchmark_info.as_mut().ok_or_else(|| {
            Error::failed_precondition(
                "benchmark is not enabled; set benchmark_params in the engine settings",
            )
        })?;
        Ok(f(bench))
    }

    /// Stops the worker after the queue drains. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
        }
        self.shared.cv.notify_all();
        let handle = self.worker.lock().expect("worker handle poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for ExecutionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve_dependency_outcome(
    deps: &HashSet<TaskId>,
    outcomes: &HashMap<TaskId, TaskState>,
) -> Option<TaskState> {
    let mut failed = false;
    for dep in deps {
        match outcomes.get(dep) {
            Some(TaskState::Cancelled) | Some(TaskState::DependentTaskCancelled) => {
                return Some(TaskState::DependentTaskCancelled);
            }
            Some(TaskState::Failed) | Some(TaskState::DependentTaskFailed) => {
                failed = true;
            }
            _ => {}
        }
    }
    failed.then_some(TaskState::DependentTaskFailed)
}

fn worker_loop(
    shared: Arc<SchedulerShared>,
    resource_manager: Arc<ResourceManager>,
    tokenizer: SharedTokenizer,
) {
    loop {
        let task = {
            let mut state = shared.lock();
            loop {
                let ready = state.pending.iter().position(|t| {
                    t.deps.iter().all(|d| state.outcomes.contains_key(d))
                });
                if let Some(pos) = ready {
                    let task = state.pending.remove(pos).expect("position valid");
                    state.active += 1;
                    break Some(task);
                }
                if state.shutdown {
                    break None;
                }
                state = shared.cv.wait(state).expect("scheduler state poisoned");
            }
        };
        let Some(mut task) = task else {
            return;
        };

        let dep_state = {
            let state = shared.lock();
            resolve_dependency_outcome(&task.deps, &state.outcomes)
        };
        let final_state = if let Some(state) = dep_state {
            debug!(task_id = %task.id, ?state, "task_resolved_from_dependency");
            (task.callback)(Ok(Responses::with_state(state)));
            state
        } else if task.cancelled.load(Ordering::SeqCst) {
            debug!(task_id = %task.id, "task_cancelled_before_dispatch");
            (task.callback)(Ok(Responses::with_state(TaskState::Cancelled)));
            TaskState::Cancelled
        } else {
            dispatch_task(&shared, &resource_manager, &tokenizer, &mut task)
        };

        let mut state = shared.lock();
        state.outcomes.insert(task.id, final_state);
        state.active -= 1;
        drop(state);
        shared.cv.notify_all();
    }
}

fn session_snapshot(
    shared: &SchedulerShared,
    session: SessionId,
) -> Result<(Arc<ContextHandler>, SessionConfig, bool)> {
    let state = shared.lock();
    let info = state
        .sessions
        .get(&session)
        .ok_or_else(|| Error::not_found(format!("session {session} is not registered")))?;
    Ok((
        Arc::clone(&info.handler),
        info.session_config.clone(),
        info.benchmark_info.is_some(),
    ))
}

fn record_benchmark(
    shared: &SchedulerShared,
    session: SessionId,
    f: impl FnOnce(&mut BenchmarkInfo),
) {
    let mut state = shared.lock();
    if let Some(info) = state.sessions.get_mut(&session) {
        if let Some(bench) = info.benchmark_info.as_mut() {
            f(bench);
        }
    }
}

fn dispatch_task(
    shared: &SchedulerShared,
    resource_manager: &ResourceManager,
    tokenizer: &SharedTokenizer,
    task: &mut TaskEntry,
) -> TaskState {
    match &task.payload {
        TaskPayload::Prefill { contents } => {
            let contents = contents.clone();
            run_prefill(shared, resource_manager, tokenizer, task, contents)
        }
        TaskPayload::Decode {
            constraint,
            max_output_tokens,
        } => {
            let constraint = constraint.clone();
            let max_output_tokens = *max_output_tokens;
            run_decode(
                shared,
                resource_manager,
                tokenizer,
                task,
                constraint,
                max_output_tokens,
            )
        }
        TaskPayload::TextScoring {
            target_text,
            store_token_lengths,
        } => {
            let target_text = target_text.clone();
            let store_token_lengths = *store_token_lengths;
            run_text_scoring(
                shared,
                resource_manager,
                tokenizer,
                task,
                target_text,
                store_token_lengths,
            )
        }
        TaskPayload::CloneSession { dest } => {
            let dest = *dest;
            run_clone_session(shared, resource_manager, task, dest)
        }
    }
}

/// Turns session inputs into executor inputs, encoding modalities through
/// the vision/audio executors.
fn build_executor_inputs(
    resource_manager: &ResourceManager,
    tokenizer: &SharedTokenizer,
    contents: &[InputData],
) -> Result<ExecutorInputs> {
    let mut inputs = ExecutorInputs::default();
    for content in contents {
        match content {
            InputData::Tokens(ids) => inputs.text_tokens.extend_from_slice(ids),
            InputData::Text(text) => {
                let ids = tokenizer
                    .lock()
                    .expect("tokenizer poisoned")
                    .text_to_ids(text)?;
                inputs.text_tokens.extend_from_slice(&ids);
            }
            InputData::Image(image) => {
                resource_manager.try_loading_vision_executor()?;
                let mut vision = resource_manager.acquire_vision_executor()?;
                inputs.vision = Some(vision.encode(image)?);
            }
            InputData::Audio(audio) => {
                resource_manager.try_loading_audio_executor()?;
                let mut encoder = resource_manager.acquire_audio_executor()?;
                inputs.audio = Some(encoder.encode(audio)?);
            }
            _ => unreachable!("InputData is non_exhaustive but all variants are handled"),
        }
    }
    Ok(inputs)
}

fn run_prefill(
    shared: &SchedulerShared,
    resource_manager: &ResourceManager,
    tokenizer: &SharedTokenizer,
    task: &mut TaskEntry,
    contents: Vec<InputData>,
) -> TaskState {
    let (handler, _config, _bench) = match session_snapshot(shared, task.session) {
        Ok(v) => v,
        Err(e) => {
            (task.callback)(Err(e));
            return TaskState::Failed;
        }
    };
    let started = Instant::now();
    let result = (|| -> Result<usize> {
        let inputs = build_executor_inputs(resource_manager, tokenizer, &contents)?;
        let num_tokens = inputs.text_tokens.len();
        let mut locked = resource_manager.acquire_executor_with_context_handler(&handler)?;
        locked.prefill(&inputs, &PrefillParams::default())?;
        Ok(num_tokens)
    })();
    match result {
        Ok(num_tokens) => {
            record_benchmark(shared, task.session, |bench| {
                bench.add_prefill_turn(num_tokens, started.elapsed());
            });
            (task.callback)(Ok(Responses::with_state(TaskState::Done)));
            TaskState::Done
        }
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "prefill_task_failed");
            (task.callback)(Err(e));
            TaskState::Failed
        }
    }
}

fn log_prob_of(logits: &Logits, candidates: usize, token: TokenId) -> Result<f32> {
    let values = logits.to_f32_vec();
    if values.is_empty() || values.len() % candidates.max(1) != 0 {
        return Err(Error::internal(format!(
            "logits length {} does not divide into {} rows",
            values.len(),
            candidates
        )));
    }
    let vocab = values.len() / candidates.max(1);
    let row = &values[..vocab];
    let index = usize::try_from(token)
        .ok()
        .filter(|&i| i < vocab)
        .ok_or_else(|| {
            Error::invalid_argument(format!("token {token} outside vocabulary of {vocab}"))
        })?;
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum: f32 = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
    Ok(row[index] - max - log_sum)
}

fn run_decode(
    shared: &SchedulerShared,
    resource_manager: &ResourceManager,
    tokenizer: &SharedTokenizer,
    task: &mut TaskEntry,
    constraint: Option<Arc<dyn DecodeConstraint>>,
    max_output_tokens: usize,
) -> TaskState {
    let (handler, config, _bench) = match session_snapshot(shared, task.session) {
        Ok(v) => v,
        Err(e) => {
            (task.callback)(Err(e));
            return TaskState::Failed;
        }
    };
    let candidates = config.num_output_candidates;
    let mut sampler =
        match TopPSampler::from_params(&config.effective_sampler_params(), candidates) {
            Ok(s) => s,
            Err(e) => {
                (task.callback)(Err(e));
                return TaskState::Failed;
            }
        };
    let mut locked = match resource_manager.acquire_executor_with_context_handler(&handler) {
        Ok(l) => l,
        Err(e) => {
            (task.callback)(Err(e));
            return TaskState::Failed;
        }
    };

    let decode_start = Instant::now();
    let mut first_token_elapsed = None;
    let mut inputs = ExecutorInputs::default();
    let mut generated: Vec<TokenId> = Vec::new();
    let mut ids = vec![0 as TokenId; candidates];
    let mut scores = vec![0f32; candidates];
    let mut num_tokens = 0usize;
    let mut final_state = TaskState::Done;

    for _ in 0..max_output_tokens {
        if task.cancelled.load(Ordering::SeqCst) {
            let _ = locked.cancel();
            final_state = TaskState::Cancelled;
            break;
        }
        let logits = match locked.decode_logits(&inputs) {
            Ok(l) => l,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "decode_task_failed");
                (task.callback)(Err(e));
                return TaskState::Failed;
            }
        };
        if let Err(e) = sampler.sample_to_id_and_score(&logits, &mut ids, Some(&mut scores)) {
            (task.callback)(Err(e));
            return TaskState::Failed;
        }
        if first_token_elapsed.is_none() {
            first_token_elapsed = Some(decode_start.elapsed());
        }
        if config.stop_token_ids.contains(&ids[0]) {
            break;
        }

        let texts = {
            let mut tok = tokenizer.lock().expect("tokenizer poisoned");
            let mut texts = Vec::with_capacity(candidates);
            let mut failed = None;
            for &id in &ids {
                match tok.ids_to_text(&[id]) {
                    Ok(piece) => texts.push(piece),
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = failed {
                drop(tok);
                (task.callback)(Err(e));
                return TaskState::Failed;
            }
            texts
        };
        num_tokens += 1;
        generated.push(ids[0]);
        (task.callback)(Ok(Responses::new(
            TaskState::Processing,
            texts,
            scores.clone(),
        )));
        if constraint
            .as_ref()
            .is_some_and(|c| c.should_stop(&generated))
        {
            break;
        }
        inputs = ExecutorInputs::from_tokens(ids.clone());
    }
    drop(locked);

    record_benchmark(shared, task.session, |bench| {
        bench.add_decode_turn(num_tokens, decode_start.elapsed());
        if let Some(elapsed) = first_token_elapsed {
            bench.record_time_to_first_token(elapsed);
        }
    });
    (task.callback)(Ok(Responses::with_state(final_state)));
    final_state
}

fn run_text_scoring(
    shared: &SchedulerShared,
    resource_manager: &ResourceManager,
    tokenizer: &SharedTokenizer,
    task: &mut TaskEntry,
    target_text: String,
    store_token_lengths: bool,
) -> TaskState {
    let (handler, config, _bench) = match session_snapshot(shared, task.session) {
        Ok(v) => v,
        Err(e) => {
            (task.callback)(Err(e));
            return TaskState::Failed;
        }
    };
    let result = (|| -> Result<Responses> {
        let target_ids = tokenizer
            .lock()
            .expect("tokenizer poisoned")
            .text_to_ids(&target_text)?;
        let mut locked = resource_manager.acquire_executor_with_context_handler(&handler)?;
        let mut score = 0f32;
        let mut inputs = ExecutorInputs::default();
        for &token in &target_ids {
            let logits = locked.decode_logits(&inputs)?;
            score += log_prob_of(&logits, config.num_output_candidates, token)?;
            inputs = ExecutorInputs::from_tokens(vec![token]);
        }
        if let Some(&last) = target_ids.last() {
            locked.prefill(
                &ExecutorInputs::from_tokens(vec![last]),
                &PrefillParams::default(),
            )?;
        }
        let mut responses =
            Responses::new(TaskState::Done, vec![target_text.clone()], vec![score]);
        if store_token_lengths {
            responses.set_token_lengths(vec![target_ids.len()]);
        }
        Ok(responses)
    })();
    match result {
        Ok(responses) => {
            (task.callback)(Ok(responses));
            TaskState::Done
        }
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "text_scoring_task_failed");
            (task.callback)(Err(e));
            TaskState::Failed
        }
    }
}

fn run_clone_session(
    shared: &SchedulerShared,
    resource_manager: &ResourceManager,
    task: &mut TaskEntry,
    dest: SessionId,
) -> TaskState {
    let (handler, _config, _bench) = match session_snapshot(shared, task.session) {
        Ok(v) => v,
        Err(e) => {
            (task.callback)(Err(e));
            return TaskState::Failed;
        }
    };
    match resource_manager.clone_context_handler(&handler) {
        Ok(new_handler) => {
            let mut state = shared.lock();
            match state.sessions.get_mut(&dest) {
                Some(info) => {
                    info.handler = new_handler;
                }
                None => {
                    drop(state);
                    let e =
                        Error::not_found(format!("destination session {dest} is not registered"));
                    (task.callback)(Err(e));
                    return TaskState::Failed;
                }
            }
            drop(state);
            debug!(source = %task.session, dest = %dest, "session_cloned");
            (task.callback)(Ok(Responses::with_state(TaskState::Done)));
            TaskState::Done
        }
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "clone_session_task_failed");
            (task.callback)(Err(e));
            TaskState::Failed
        }
    }
}
