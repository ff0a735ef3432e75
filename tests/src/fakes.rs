//! Deterministic fakes for engine-level tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edgelm_kernel::config::ModelAssets;
use edgelm_kernel::error::{Error, Result};
use edgelm_kernel::executor::{
    ExecutorInputs, ExecutorVisionData, LlmContext, LlmExecutor, PrefillParams, ProcessedContext,
    ProcessedTokens, RuntimeConfig, RuntimeState, VisionExecutor,
};
use edgelm_kernel::io::{InputImage, TokenId};
use edgelm_kernel::sampler::Logits;
use edgelm_kernel::tokenizer::{parse_byte_piece, Tokenizer, Utf8TokenBuffer};

const VOCAB_SIZE: usize = 256;

/// Inspectable state of a [`ScriptedExecutor`]. Tests keep the shared
/// handle to inject failures, add latency, and assert on the calls the
/// runtime actually issued.
#[derive(Default)]
pub struct ScriptedState {
    pub tokens: Vec<TokenId>,
    pub step: usize,
    pub ran_decode: bool,
    pub config: RuntimeConfig,
    pub lora_id: Option<u32>,
    /// Tokens the executor "generates", in order. When exhausted, decode
    /// keeps emitting `eos_token`.
    pub script: VecDeque<TokenId>,
    pub eos_token: TokenId,
    pub fail_prefill: bool,
    pub fail_decode: bool,
    pub prefill_delay: Duration,
    pub decode_delay: Duration,
    pub prefill_calls: Vec<Vec<TokenId>>,
    /// How many prefills carried vision embeddings.
    pub vision_prefills: usize,
    pub decode_calls: usize,
    pub loaded_loras: Vec<u32>,
}

/// An executor whose KV-cache is its token vector and whose "model" is a
/// scripted token sequence. Decode returns one-hot logits on the next
/// scripted token, so a greedy sampler reproduces the script exactly.
pub struct ScriptedExecutor {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedExecutor {
    /// Builds an executor that will generate `script`, then `eos_token`
    /// forever. Returns the executor and the shared state handle.
    pub fn scripted(
        script: Vec<TokenId>,
        eos_token: TokenId,
    ) -> (Self, Arc<Mutex<ScriptedState>>) {
        let state = Arc::new(Mutex::new(ScriptedState {
            script: script.into(),
            eos_token,
            ..ScriptedState::default()
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
        self.state.lock().expect("scripted state poisoned")
    }
}

impl LlmExecutor for ScriptedExecutor {
    fn backend_name(&self) -> &str {
        "scripted"
    }

    fn prefill(&mut self, inputs: &ExecutorInputs, params: &PrefillParams) -> Result<()> {
        let (delay, fail) = {
            let s = self.lock();
            (s.prefill_delay, s.fail_prefill)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if fail {
            return Err(Error::internal("injected prefill failure"));
        }
        let mut s = self.lock();
        if let Some(step) = params.current_step {
            s.step = step;
        }
        let step = s.step;
        s.tokens.truncate(step);
        s.tokens.extend_from_slice(&inputs.text_tokens);
        s.step = s.tokens.len();
        s.prefill_calls.push(inputs.text_tokens.clone());
        if inputs.vision.is_some() {
            s.vision_prefills += 1;
        }
        Ok(())
    }

    fn decode_text_tokens(&mut self) -> Result<Vec<TokenId>> {
        let mut s = self.lock();
        if s.fail_decode {
            return Err(Error::internal("injected decode failure"));
        }
        let eos = s.eos_token;
        let next = s.script.pop_front().unwrap_or(eos);
        s.ran_decode = true;
        s.decode_calls += 1;
        s.tokens.push(next);
        s.step = s.tokens.len();
        Ok(vec![next])
    }

    fn decode_logits(&mut self, inputs: &ExecutorInputs) -> Result<Logits> {
        let (next, delay) = {
            let mut s = self.lock();
            if s.fail_decode {
                return Err(Error::internal("injected decode failure"));
            }
            let step = s.step;
            s.tokens.truncate(step);
            s.tokens.extend_from_slice(&inputs.text_tokens);
            s.step = s.tokens.len();
            s.ran_decode = true;
            s.decode_calls += 1;
            let eos = s.eos_token;
            (s.script.pop_front().unwrap_or(eos), s.decode_delay)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut logits = vec![0.0f32; VOCAB_SIZE];
        let index = usize::try_from(next).unwrap_or(0).min(VOCAB_SIZE - 1);
        logits[index] = 16.0;
        Ok(Logits::F32(logits))
    }

    fn clone_context(&self) -> Result<LlmContext> {
        let s = self.lock();
        Ok(LlmContext {
            processed: ProcessedContext {
                processed_tokens: ProcessedTokens::new(s.tokens.clone()),
                kv_state: s.tokens.iter().map(|&t| t as u8).collect(),
                lora_id: s.lora_id,
            },
            config: s.config.clone(),
            state: RuntimeState {
                current_step: s.step,
                ran_decode: s.ran_decode,
            },
        })
    }

    fn restore_context(&mut self, context: LlmContext) -> Result<()> {
        let mut s = self.lock();
        s.tokens = context.processed.processed_tokens.tokens().to_vec();
        s.lora_id = context.processed.lora_id;
        s.config = context.config;
        s.step = context.state.current_step;
        s.ran_decode = context.state.ran_decode;
        Ok(())
    }

    fn create_new_context(
        &mut self,
        lora_id: Option<u32>,
        config: RuntimeConfig,
    ) -> Result<LlmContext> {
        Ok(LlmContext {
            processed: ProcessedContext {
                processed_tokens: ProcessedTokens::default(),
                kv_state: Vec::new(),
                lora_id,
            },
            config,
            state: RuntimeState::default(),
        })
    }

    fn runtime_config(&self) -> Result<RuntimeConfig> {
        Ok(self.lock().config.clone())
    }

    fn update_runtime_config(&mut self, config: &RuntimeConfig) -> Result<()> {
        self.lock().config = config.clone();
        Ok(())
    }

    fn runtime_state(&self) -> Result<RuntimeState> {
        let s = self.lock();
        Ok(RuntimeState {
            current_step: s.step,
            ran_decode: s.ran_decode,
        })
    }

    fn update_runtime_state(&mut self, state: &RuntimeState) -> Result<()> {
        let mut s = self.lock();
        s.step = state.current_step;
        s.ran_decode = state.ran_decode;
        Ok(())
    }

    fn current_step(&self) -> Result<usize> {
        Ok(self.lock().step)
    }

    fn set_current_step(&mut self, step: usize) -> Result<()> {
        self.lock().step = step;
        Ok(())
    }

    fn processed_tokens(&self) -> Result<ProcessedTokens> {
        Ok(ProcessedTokens::new(self.lock().tokens.clone()))
    }

    fn load_lora(&mut self, lora_id: u32, _assets: &ModelAssets) -> Result<()> {
        self.lock().loaded_loras.push(lora_id);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let mut s = self.lock();
        s.tokens.clear();
        s.step = 0;
        s.ran_decode = false;
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        Ok(())
    }

    fn vocab_size(&self) -> Result<usize> {
        Ok(VOCAB_SIZE)
    }
}

/// Vision encoder fake: embeds an image as a fixed-size mean-pixel vector
/// and counts invocations.
pub struct ScriptedVisionExecutor {
    encode_calls: Arc<Mutex<usize>>,
}

impl ScriptedVisionExecutor {
    /// Returns the executor and a shared handle to its call counter.
    pub fn counting() -> (Self, Arc<Mutex<usize>>) {
        let encode_calls = Arc::new(Mutex::new(0));
        (
            Self {
                encode_calls: Arc::clone(&encode_calls),
            },
            encode_calls,
        )
    }
}

impl VisionExecutor for ScriptedVisionExecutor {
    fn encode(&mut self, image: &InputImage) -> Result<ExecutorVisionData> {
        if image.data.is_empty() {
            return Err(Error::invalid_argument("image tensor is empty"));
        }
        *self.encode_calls.lock().expect("encode counter poisoned") += 1;
        let mean = image.data.iter().sum::<f32>() / image.data.len() as f32;
        Ok(ExecutorVisionData {
            embeddings: vec![mean; 8],
            per_layer_embeddings: None,
        })
    }

    fn expected_input_dimensions(&self) -> Result<Vec<usize>> {
        Ok(vec![1, 768, 768, 3])
    }
}

/// Byte-level tokenizer: every byte is one token. Printable ASCII maps to
/// plain pieces; everything else to `<0xHH>` byte pieces, exercising the
/// streaming UTF-8 reassembly path.
pub struct ByteLevelTokenizer {
    buffer: Utf8TokenBuffer,
}

impl ByteLevelTokenizer {
    pub fn new() -> Self {
        Self {
            buffer: Utf8TokenBuffer::new(),
        }
    }
}

impl Default for ByteLevelTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for ByteLevelTokenizer {
    fn text_to_ids(&self, text: &str) -> Result<Vec<TokenId>> {
        Ok(text.bytes().map(|b| b as TokenId).collect())
    }

    fn token_to_id(&self, token: &str) -> Result<TokenId> {
        if let Some(byte) = parse_byte_piece(token) {
            return Ok(byte as TokenId);
        }
        let mut bytes = token.bytes();
        match (bytes.next(), bytes.next()) {
            (Some(b), None) => Ok(b as TokenId),
            _ => Err(Error::not_found(format!("unknown token: {token}"))),
        }
    }

    fn id_to_piece(&self, id: TokenId) -> Result<String> {
        let byte = u8::try_from(id)
            .map_err(|_| Error::not_found(format!("unknown token id: {id}")))?;
        if (0x20..0x7F).contains(&byte) {
            Ok((byte as char).to_string())
        } else {
            Ok(format!("<0x{byte:02X}>"))
        }
    }

    fn ids_to_text(&mut self, ids: &[TokenId]) -> Result<String> {
        let mut out = String::new();
        for &id in ids {
            let piece = self.id_to_piece(id)?;
            out.push_str(&self.buffer.push_piece(&piece));
        }
        Ok(out)
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }
}
