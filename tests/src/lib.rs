//! edgelm testing support.
//!
//! Provides a scripted executor and a byte-level tokenizer so engine and
//! session behavior can be exercised deterministically without a real
//! model or accelerator.

pub mod fakes;

pub use fakes::{ByteLevelTokenizer, ScriptedExecutor, ScriptedState, ScriptedVisionExecutor};
