//! Crate-level error taxonomy for edgelm.
//!
//! Every operation in the runtime returns one of these kinds. The
//! [`Error::Cancelled`] variant carries a structured `key=value;...` reason
//! string so that embedders can machine-parse cancellation causes; the field
//! set is stable across implementations.

use thiserror::Error;

/// The error taxonomy shared by every edgelm operation.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input: empty image, wrong tensor shape, negative
    /// temperature, scoring batch != 1, and similar.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown resource id or unknown token.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate registration.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The operation cannot run in the current state (execution manager
    /// gone, session not prefilled before decode).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The backend or provider is not supported in this build.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// Invariant violation inside the runtime.
    #[error("internal: {0}")]
    Internal(String),

    /// Cooperative cancellation. The payload is a structured
    /// `key=value;...` reason string.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A `wait_until_done` style call timed out; the task stays live.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

/// Discriminant-only view of [`Error`], convenient for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Unimplemented,
    Internal,
    Cancelled,
    DeadlineExceeded,
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    pub fn unimplemented(msg: impl Into<String>) -> Self {
        Self::Unimplemented(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        Self::DeadlineExceeded(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Self::Unimplemented(_) => ErrorKind::Unimplemented,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
        }
    }
}

/// Convenience result alias used across both crates.
pub type Result<T, E = Error> = std::result::Result<T, E>;
