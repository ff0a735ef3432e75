//! Top-k / top-p / temperature sampling with optional perplexity tracking.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use edgelm_kernel::config::{SamplerParams, SamplerType};
use edgelm_kernel::error::{Error, Result};
use edgelm_kernel::io::TokenId;
use edgelm_kernel::sampler::{Logits, Sampler};

/// Softmax with temperature scaling and max-subtraction for stability.
/// `temperature == 0` degenerates to a one-hot argmax distribution.
fn softmax_with_temperature(row: &[f32], temperature: f32) -> Vec<f32> {
    if temperature == 0.0 {
        let mut best = 0;
        for (i, &v) in row.iter().enumerate() {
            if v > row[best] {
                best = i;
            }
        }
        let mut probs = vec![0.0; row.len()];
        probs[best] = 1.0;
        return probs;
    }
    let max = row
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        // All rows non-finite; fall back to uniform.
        return vec![1.0 / row.len() as f32; row.len()];
    }
    let mut probs: Vec<f32> = row
        .iter()
        .map(|&v| {
            if v.is_finite() {
                ((v - max) / temperature).exp()
            } else {
                0.0
            }
        })
        .collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        for p in &mut probs {
            *p /= sum;
        }
    }
    probs
}

/// CPU sampler applying temperature softmax, top-k, then nucleus cut at
/// cumulative probability `p`. One instance carries its own seeded RNG, so
/// identical inputs always reproduce identical outputs.
pub struct TopPSampler {
    k: usize,
    p: f32,
    temperature: f32,
    batch_size: usize,
    rng: StdRng,
    perplexity: Option<f32>,
}

impl TopPSampler {
    pub fn create(
        k: usize,
        p: f32,
        temperature: f32,
        batch_size: usize,
        seed: u64,
        compute_perplexity: bool,
    ) -> Result<Self> {
        if temperature < 0.0 {
            return Err(Error::invalid_argument(format!(
                "temperature must be >= 0, got {temperature}"
            )));
        }
        if k == 0 {
            return Err(Error::invalid_argument("top-k must be >= 1"));
        }
        if !(p > 0.0 && p <= 1.0) {
            return Err(Error::invalid_argument(format!(
                "top-p must be in (0, 1], got {p}"
            )));
        }
        if batch_size == 0 {
            return Err(Error::invalid_argument("batch_size must be >= 1"));
        }
        Ok(Self {
            k,
            p,
            temperature,
            batch_size,
            rng: StdRng::seed_from_u64(seed),
            perplexity: compute_perplexity.then_some(0.0),
        })
    }

    /// Builds a sampler from session sampler params; the greedy type maps
    /// to argmax (`k = 1`, `temperature = 0`).
    pub fn from_params(params: &SamplerParams, batch_size: usize) -> Result<Self> {
        match params.sampler_type {
            SamplerType::Greedy => Self::create(1, 1.0, 0.0, batch_size, params.seed, false),
            SamplerType::TopK => {
                Self::create(params.k, 1.0, params.temperature, batch_size, params.seed, false)
            }
            SamplerType::TopP => Self::create(
                params.k,
                params.p,
                params.temperature,
                batch_size,
                params.seed,
                false,
            ),
        }
    }
}

impl Sampler for TopPSampler {
    fn sample_to_id_and_score(
        &mut self,
        logits: &Logits,
        ids: &mut [TokenId],
        mut scores: Option<&mut [f32]>,
    ) -> Result<()> {
        let values = logits.to_f32_vec();
        if values.is_empty() || values.len() % self.batch_size != 0 {
            return Err(Error::invalid_argument(format!(
                "logits length {} does not divide into batch size {}",
                values.len(),
                self.batch_size
            )));
        }
        if ids.len() != self.batch_size {
            return Err(Error::invalid_argument(format!(
                "ids buffer has {} entries, expected {}",
                ids.len(),
                self.batch_size
            )));
        }
        if let Some(scores) = &scores {
            if scores.len() != self.batch_size {
                return Err(Error::invalid_argument(format!(
                    "scores buffer has {} entries, expected {}",
                    scores.len(),
                    self.batch_size
                )));
            }
        }
        let vocab = values.len() / self.batch_size;

        for batch in 0..self.batch_size {
            let row = &values[batch * vocab..(batch + 1) * vocab];
            let probs = softmax_with_temperature(row, self.temperature);

            let mut order: Vec<usize> = (0..vocab).collect();
            order.sort_by(|&a, &b| {
                probs[b]
                    .partial_cmp(&probs[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let shortlist = &order[..self.k.min(vocab)];

            // Nucleus cut: keep candidates until their cumulative
            // probability reaches p, always keeping at least one.
            let mut cumulative = 0.0;
            let mut cutoff = 0;
            for (i, &id) in shortlist.iter().enumerate() {
                cumulative += probs[id];
                cutoff = i;
                if cumulative >= self.p {
                    break;
                }
            }
            let nucleus = &shortlist[..=cutoff];
            let nucleus_mass: f32 = nucleus.iter().map(|&id| probs[id]).sum();

            let selected = if nucleus_mass <= 0.0 || !nucleus_mass.is_finite() {
                nucleus[0]
            } else {
                let r: f32 = self.rng.gen::<f32>() * nucleus_mass;
                let mut acc = 0.0;
                let mut picked = nucleus[nucleus.len() - 1];
                for &id in nucleus {
                    acc += probs[id];
                    if r <= acc {
                        picked = id;
                        break;
                    }
                }
                picked
            };

            ids[batch] = selected as TokenId;
            // Score against the full softmax, not the renormalized nucleus.
            let log_prob = probs[selected].max(f32::MIN_POSITIVE).ln();
            if let Some(scores) = scores.as_deref_mut() {
                scores[batch] = log_prob;
            }
            if let Some(acc) = &mut self.perplexity {
                *acc += -log_prob;
            }
        }
        Ok(())
    }

    fn perplexity(&self) -> Result<f32> {
        self.perplexity.ok_or_else(|| {
            Error::failed_precondition("perplexity is not computed by this sampler")
        })
    }
}
