//! Benchmark instrumentation attached to engines and sessions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::BenchmarkParams;
use crate::error::{Error, Result};

/// Well-known init phase names.
pub mod init_phase {
    pub const EXECUTOR: &str = "executor";
    pub const TOKENIZER: &str = "tokenizer";
}

/// One prefill or decode turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnRecord {
    pub num_tokens: usize,
    pub elapsed: Duration,
}

impl TurnRecord {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.num_tokens as f64 / secs
        }
    }
}

/// Timing collected during engine init and session turns. Exposed to
/// embedders with nanosecond-resolution durations.
#[derive(Debug, Clone)]
pub struct BenchmarkInfo {
    params: BenchmarkParams,
    init_phases: HashMap<String, Duration>,
    started_phases: HashMap<String, Instant>,
    prefill_turns: Vec<TurnRecord>,
    decode_turns: Vec<TurnRecord>,
    time_to_first_token: Option<Duration>,
}

impl BenchmarkInfo {
    pub fn new(params: BenchmarkParams) -> Self {
        Self {
            params,
            init_phases: HashMap::new(),
            started_phases: HashMap::new(),
            prefill_turns: Vec::new(),
            decode_turns: Vec::new(),
            time_to_first_token: None,
        }
    }

    pub fn params(&self) -> BenchmarkParams {
        self.params
    }

    pub fn time_init_phase_start(&mut self, phase: &str) -> Result<()> {
        if self.started_phases.contains_key(phase) {
            return Err(Error::already_exists(format!(
                "init phase '{phase}' already started"
            )));
        }
        self.started_phases.insert(phase.to_string(), Instant::now());
        Ok(())
    }

    pub fn time_init_phase_end(&mut self, phase: &str) -> Result<()> {
        let start = self
            .started_phases
            .remove(phase)
            .ok_or_else(|| Error::not_found(format!("init phase '{phase}' was not started")))?;
        self.init_phases.insert(phase.to_string(), start.elapsed());
        Ok(())
    }

    pub fn init_phase(&self, phase: &str) -> Option<Duration> {
        self.init_phases.get(phase).copied()
    }

    pub fn add_prefill_turn(&mut self, num_tokens: usize, elapsed: Duration) {
        self.prefill_turns.push(TurnRecord {
            num_tokens,
            elapsed,
        });
    }

    pub fn add_decode_turn(&mut self, num_tokens: usize, elapsed: Duration) {
        self.decode_turns.push(TurnRecord {
            num_tokens,
            elapsed,
        });
    }

    pub fn prefill_turns(&self) -> &[TurnRecord] {
        &self.prefill_turns
    }

    pub fn decode_turns(&self) -> &[TurnRecord] {
        &self.decode_turns
    }

    /// Records time-to-first-token once; later calls are ignored.
    pub fn record_time_to_first_token(&mut self, elapsed: Duration) {
        self.time_to_first_token.get_or_insert(elapsed);
    }

    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.time_to_first_token
    }
}
