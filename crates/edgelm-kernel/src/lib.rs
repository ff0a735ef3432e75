//! Contracts for the edgelm runtime.
//!
//! This crate defines everything the runtime crate implements against:
//! executor / tokenizer / sampler traits, the session and task data model,
//! configuration, the error taxonomy, and benchmark instrumentation types.
//! Per edgelm's kernel rules, concrete machinery (scheduler, resource
//! manager, engine) lives in `edgelm-runtime`; this crate never depends on
//! it.

// error module
pub mod error;

// io types: inputs, responses, task states, ids
pub mod io;

// wire messages
pub mod message;

// configuration
pub mod config;

// executor contracts
pub mod executor;

// tokenizer contract and streaming UTF-8 fusion
pub mod tokenizer;

// sampler contract
pub mod sampler;

// benchmark instrumentation
pub mod benchmark;

// logging init
pub mod logging;

pub use error::{Error, ErrorKind, Result};
pub use io::{Responses, SessionId, TaskId, TaskState, TokenId};
