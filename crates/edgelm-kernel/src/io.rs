//! Input/output types that cross the session and scheduler boundary.

use std::fmt;

/// A single vocabulary token id.
pub type TokenId = i32;

/// Identifier of a registered session. Sessions are numbered in
/// registration order by the execution manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a submitted task. Monotonic per execution manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of a task. Transitions are monotonic: once a task
/// reaches an end state it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TaskState {
    Created,
    Processing,
    Done,
    Cancelled,
    DependentTaskCancelled,
    Failed,
    DependentTaskFailed,
}

impl TaskState {
    /// Whether this state is terminal.
    pub fn is_end_state(self) -> bool {
        !matches!(self, TaskState::Created | TaskState::Processing)
    }
}

/// A preprocessed image ready for the vision executor: packed f32 pixels in
/// `[batch, height, width, channels]` layout.
#[derive(Debug, Clone, PartialEq)]
pub struct InputImage {
    pub data: Vec<f32>,
    pub dims: [usize; 4],
}

impl InputImage {
    /// Size in bytes of the packed f32 buffer.
    pub fn packed_byte_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// A preprocessed audio spectrogram for the audio executor.
#[derive(Debug, Clone, PartialEq)]
pub struct InputAudio {
    pub spectrogram: Vec<f32>,
    pub num_frames: usize,
}

/// One piece of session input. Text is tokenized by the session before
/// submission, so the scheduler only ever sees `Tokens`, `Image` and
/// `Audio`.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum InputData {
    Text(String),
    Tokens(Vec<TokenId>),
    Image(InputImage),
    Audio(InputAudio),
}

/// Streaming or aggregated response payload delivered to task callbacks.
///
/// For a decode task the callback fires once per generated token with
/// `task_state == Processing` and per-candidate text/score deltas, then a
/// final time with the terminal state.
#[derive(Debug, Clone)]
pub struct Responses {
    task_state: TaskState,
    texts: Vec<String>,
    scores: Vec<f32>,
    token_lengths: Option<Vec<usize>>,
}

impl Responses {
    pub fn new(task_state: TaskState, texts: Vec<String>, scores: Vec<f32>) -> Self {
        Self {
            task_state,
            texts,
            scores,
            token_lengths: None,
        }
    }

    /// A response carrying only a state, e.g. a prefill completion or a
    /// terminal decode chunk.
    pub fn with_state(task_state: TaskState) -> Self {
        Self::new(task_state, Vec::new(), Vec::new())
    }

    pub fn task_state(&self) -> TaskState {
        self.task_state
    }

    pub fn set_task_state(&mut self, state: TaskState) {
        self.task_state = state;
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    pub fn texts_mut(&mut self) -> &mut Vec<String> {
        &mut self.texts
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn scores_mut(&mut self) -> &mut Vec<f32> {
        &mut self.scores
    }

    pub fn token_lengths(&self) -> Option<&[usize]> {
        self.token_lengths.as_deref()
    }

    pub fn set_token_lengths(&mut self, lengths: Vec<usize>) {
        self.token_lengths = Some(lengths);
    }
}
