//! Bridges between callback-driven decode and embedder-facing iteration.
//!
//! Two shapes are provided: a blocking [`ResponseIterator`] for embedders
//! that cannot drive callbacks (a mutex/condvar FIFO; `next()` waits for
//! the worker without ever holding the executor lock), and an async
//! [`ResponseStream`] implementing [`futures::Stream`] for embedders that
//! live on a runtime.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use edgelm_kernel::error::{ErrorKind, Result};
use edgelm_kernel::io::{Responses, TaskState};

use crate::execution::TaskCallback;

struct QueueState {
    items: VecDeque<Result<Responses>>,
    finished: bool,
}

struct SharedQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

/// Producing half of the blocking bridge; converts into a task callback.
pub struct ResponseSender {
    shared: Arc<SharedQueue>,
}

impl ResponseSender {
    pub fn send(&self, item: Result<Responses>) {
        let terminal = match &item {
            Ok(responses) => responses.task_state().is_end_state(),
            Err(_) => true,
        };
        let mut state = self.shared.state.lock().expect("bridge queue poisoned");
        state.items.push_back(item);
        if terminal {
            state.finished = true;
        }
        drop(state);
        self.shared.cv.notify_all();
    }

    /// Wraps the sender as a task callback for the session APIs.
    pub fn into_callback(self) -> TaskCallback {
        Box::new(move |item| self.send(item))
    }
}

/// Blocking consumer of streamed responses. Iteration ends after a terminal
/// chunk has been delivered, or immediately upon observing a cancellation.
pub struct ResponseIterator {
    shared: Arc<SharedQueue>,
}

impl Iterator for ResponseIterator {
    type Item = Result<Responses>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut state = self.shared.state.lock().expect("bridge queue poisoned");
        loop {
            if let Some(item) = state.items.pop_front() {
                let is_cancel = match &item {
                    Ok(responses) => matches!(
                        responses.task_state(),
                        TaskState::Cancelled | TaskState::DependentTaskCancelled
                    ),
                    Err(e) => e.kind() == ErrorKind::Cancelled,
                };
                if is_cancel {
                    // Drain silently: cancellation ends iteration.
                    state.finished = true;
                    return None;
                }
                return Some(item);
            }
            if state.finished {
                return None;
            }
            state = self
                .shared
                .cv
                .wait(state)
                .expect("bridge queue poisoned");
        }
    }
}

/// Creates the blocking sender/iterator pair.
pub fn blocking_channel() -> (ResponseSender, ResponseIterator) {
    let shared = Arc::new(SharedQueue {
        state: Mutex::new(QueueState {
            items: VecDeque::new(),
            finished: false,
        }),
        cv: Condvar::new(),
    });
    (
        ResponseSender {
            shared: Arc::clone(&shared),
        },
        ResponseIterator { shared },
    )
}

/// Producing half of the async bridge.
pub struct StreamSender {
    tx: mpsc::UnboundedSender<Result<Responses>>,
}

impl StreamSender {
    pub fn send(&self, item: Result<Responses>) {
        let _ = self.tx.send(item);
    }

    pub fn into_callback(self) -> TaskCallback {
        Box::new(move |item| self.send(item))
    }
}

/// Async stream of decode chunks. The stream terminates after a terminal
/// chunk or an error has been yielded.
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<Result<Responses>>,
    done: bool,
}

impl Stream for ResponseStream {
    type Item = Result<Responses>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                let terminal = match &item {
                    Ok(responses) => responses.task_state().is_end_state(),
                    Err(_) => true,
                };
                if terminal {
                    self.done = true;
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Creates the async sender/stream pair.
pub fn stream_channel() -> (StreamSender, ResponseStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StreamSender { tx }, ResponseStream { rx, done: false })
}
