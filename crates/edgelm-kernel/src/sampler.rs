//! Sampler contract.

use half::f16;

use crate::error::{Error, Result};
use crate::io::TokenId;

/// A batch of logits rows as produced by [`crate::executor::LlmExecutor::decode_logits`].
/// Both precisions decode to f32 for the math.
#[derive(Debug, Clone, PartialEq)]
pub enum Logits {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl Logits {
    pub fn len(&self) -> usize {
        match self {
            Logits::F32(v) => v.len(),
            Logits::F16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Logits::F32(v) => v.clone(),
            Logits::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
        }
    }
}

/// Top-k / top-p / temperature sampling over a logits batch.
///
/// Implementations hold their RNG, so the same seed over the same logits
/// sequence yields the same ids and scores.
pub trait Sampler: Send {
    /// Samples one token id per batch row into `ids`. When `scores` is
    /// provided, writes the natural log of the full-softmax probability of
    /// each selected id.
    fn sample_to_id_and_score(
        &mut self,
        logits: &Logits,
        ids: &mut [TokenId],
        scores: Option<&mut [f32]>,
    ) -> Result<()>;

    /// Running `sum(-ln p(selected))` across all calls since construction.
    /// Fails with `FailedPrecondition` when perplexity tracking was not
    /// requested at construction.
    fn perplexity(&self) -> Result<f32> {
        Err(Error::failed_precondition(
            "perplexity is not computed by this sampler",
        ))
    }
}
