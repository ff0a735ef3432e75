//! Engine construction and lifecycle.
//!
//! The engine wires the executor and tokenizer (resolved through
//! process-wide backend factories) into a resource manager and an
//! execution manager, and hands out sessions. Process-wide concerns — the
//! runtime environment and logging — are initialized once, on first engine
//! construction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, error, info};

use edgelm_kernel::benchmark::{init_phase, BenchmarkInfo};
use edgelm_kernel::config::{
    Backend, BenchmarkParams, EngineSettings, MainExecutorSettings, ModelAssets, SessionConfig,
};
use edgelm_kernel::error::{Error, Result};
use edgelm_kernel::executor::{AudioExecutor, LlmExecutor, RuntimeConfig, VisionExecutor};
use edgelm_kernel::io::InputData;
use edgelm_kernel::logging;
use edgelm_kernel::tokenizer::Tokenizer;

use crate::execution::{ExecutionManager, SharedTokenizer};
use crate::resource_manager::ResourceManager;
use crate::session::Session;

/// Default wait applied to synchronous session calls and engine teardown.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Process-wide runtime environment. Accelerator handles and similar
/// process-scoped options hang off this; it is created once and lives for
/// the process.
pub struct RuntimeEnvironment {
    options: Vec<String>,
}

impl RuntimeEnvironment {
    pub fn options(&self) -> &[String] {
        &self.options
    }
}

static ENVIRONMENT: OnceCell<RuntimeEnvironment> = OnceCell::new();

/// Returns the process-wide environment, creating it on first use.
pub fn runtime_environment() -> &'static RuntimeEnvironment {
    ENVIRONMENT.get_or_init(|| {
        debug!("runtime_environment_created");
        RuntimeEnvironment {
            options: Vec::new(),
        }
    })
}

type ExecutorFactory = Arc<dyn Fn(&EngineSettings) -> Result<Box<dyn LlmExecutor>> + Send + Sync>;
type TokenizerFactory = Arc<dyn Fn(&ModelAssets) -> Result<Box<dyn Tokenizer>> + Send + Sync>;

static EXECUTOR_FACTORIES: Lazy<RwLock<HashMap<Backend, ExecutorFactory>>> =
    Lazy::new(Default::default);
static TOKENIZER_FACTORY: Lazy<RwLock<Option<TokenizerFactory>>> = Lazy::new(Default::default);

/// Registers the executor implementation for a backend. Embedders and
/// executor crates call this once at startup; a later registration for the
/// same backend wins.
pub fn register_executor_factory(
    backend: Backend,
    factory: impl Fn(&EngineSettings) -> Result<Box<dyn LlmExecutor>> + Send + Sync + 'static,
) {
    EXECUTOR_FACTORIES
        .write()
        .expect("factory registry poisoned")
        .insert(backend, Arc::new(factory));
}

/// Registers the tokenizer loader used by [`Engine::create`].
pub fn register_tokenizer_factory(
    factory: impl Fn(&ModelAssets) -> Result<Box<dyn Tokenizer>> + Send + Sync + 'static,
) {
    *TOKENIZER_FACTORY
        .write()
        .expect("factory registry poisoned") = Some(Arc::new(factory));
}

/// Caller-supplied engine components for [`Engine::create_with_components`].
pub struct EngineComponents {
    pub executor: Box<dyn LlmExecutor>,
    pub tokenizer: Box<dyn Tokenizer>,
    pub vision_executor: Option<Box<dyn VisionExecutor>>,
    pub audio_executor: Option<Box<dyn AudioExecutor>>,
}

impl EngineComponents {
    pub fn new(executor: Box<dyn LlmExecutor>, tokenizer: Box<dyn Tokenizer>) -> Self {
        Self {
            executor,
            tokenizer,
            vision_executor: None,
            audio_executor: None,
        }
    }

    pub fn with_vision_executor(mut self, vision_executor: Box<dyn VisionExecutor>) -> Self {
        self.vision_executor = Some(vision_executor);
        self
    }

    pub fn with_audio_executor(mut self, audio_executor: Box<dyn AudioExecutor>) -> Self {
        self.audio_executor = Some(audio_executor);
        self
    }
}

/// The top-level runtime object. Outlives all of its sessions; dropping it
/// waits for submitted work to drain.
pub struct Engine {
    engine_settings: EngineSettings,
    execution_manager: Arc<ExecutionManager>,
    tokenizer: SharedTokenizer,
    benchmark_info: Option<BenchmarkInfo>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Builds an engine from settings using the registered backend
    /// factories.
    pub fn create(engine_settings: EngineSettings) -> Result<Engine> {
        logging::init();
        runtime_environment();
        engine_settings.validate()?;
        info!(backend = %engine_settings.main_executor.backend, "engine_create_begin");

        let mut benchmark_info = engine_settings.benchmark_params.map(BenchmarkInfo::new);
        if let Some(bench) = &mut benchmark_info {
            bench.time_init_phase_start(init_phase::EXECUTOR)?;
        }

        if let Some(bench) = &mut benchmark_info {
            bench.time_init_phase_start(init_phase::TOKENIZER)?;
        }
        let tokenizer_factory = TOKENIZER_FACTORY
            .read()
            .expect("factory registry poisoned")
            .clone()
            .ok_or_else(|| {
                Error::unimplemented("no tokenizer factory is registered in this build")
            })?;
        let tokenizer = tokenizer_factory(&engine_settings.main_executor.model_assets)?;
        if let Some(bench) = &mut benchmark_info {
            bench.time_init_phase_end(init_phase::TOKENIZER)?;
        }

        let backend = engine_settings.main_executor.backend;
        let executor_factory = EXECUTOR_FACTORIES
            .read()
            .expect("factory registry poisoned")
            .get(&backend)
            .cloned()
            .ok_or_else(|| Error::invalid_argument(format!("unsupported backend: {backend}")))?;
        let executor = executor_factory(&engine_settings)?;
        if let Some(bench) = &mut benchmark_info {
            bench.time_init_phase_end(init_phase::EXECUTOR)?;
        }

        Self::assemble(
            engine_settings,
            EngineComponents::new(executor, tokenizer),
            benchmark_info,
        )
    }

    /// Builds an engine around caller-supplied components, bypassing the
    /// factory registries.
    pub fn create_with_components(
        engine_settings: EngineSettings,
        components: EngineComponents,
    ) -> Result<Engine> {
        logging::init();
        runtime_environment();
        engine_settings.validate()?;
        let benchmark_info = engine_settings.benchmark_params.map(BenchmarkInfo::new);
        Self::assemble(engine_settings, components, benchmark_info)
    }

    fn assemble(
        engine_settings: EngineSettings,
        components: EngineComponents,
        benchmark_info: Option<BenchmarkInfo>,
    ) -> Result<Engine> {
        let EngineComponents {
            mut executor,
            tokenizer,
            vision_executor,
            audio_executor,
        } = components;
        // Seed the executor with the default runtime config (greedy, one
        // output head, one token per decode); sessions override per their
        // own config.
        executor.update_runtime_config(&RuntimeConfig::default())?;

        let resource_manager = Arc::new(ResourceManager::create(
            executor,
            vision_executor,
            audio_executor,
            engine_settings.vision_executor.clone(),
            engine_settings.audio_executor.clone(),
        )?);
        let tokenizer: SharedTokenizer = Arc::new(Mutex::new(tokenizer));
        let execution_manager =
            ExecutionManager::create(resource_manager, Arc::clone(&tokenizer));
        info!("engine_created");
        Ok(Engine {
            engine_settings,
            execution_manager,
            tokenizer,
            benchmark_info,
        })
    }

    /// Creates a session, filling unset session fields from the engine
    /// settings.
    pub fn create_session(&self, session_config: SessionConfig) -> Result<Arc<Session>> {
        let mut config = session_config;
        config.maybe_update_and_validate(&self.engine_settings)?;
        Session::create(
            &self.execution_manager,
            Arc::clone(&self.tokenizer),
            config,
            self.benchmark_info.clone(),
        )
    }

    /// Blocks until all submitted tasks across all sessions are terminal.
    pub fn wait_until_done(&self, timeout: Duration) -> Result<()> {
        self.execution_manager.wait_until_all_done(timeout)
    }

    pub fn engine_settings(&self) -> &EngineSettings {
        &self.engine_settings
    }

    pub fn tokenizer(&self) -> &SharedTokenizer {
        &self.tokenizer
    }

    /// Runs a synthetic prefill/decode pass against the model and returns
    /// the collected timings.
    pub fn benchmark(
        model_path: impl Into<PathBuf>,
        backend: Backend,
        num_prefill_tokens: usize,
        num_decode_tokens: usize,
        cache_dir: Option<PathBuf>,
    ) -> Result<BenchmarkInfo> {
        let mut main = MainExecutorSettings::new(backend, ModelAssets::from_path(model_path));
        main.cache_dir = cache_dir;
        let mut settings = EngineSettings::new(main);
        settings.benchmark_params = Some(BenchmarkParams {
            num_prefill_tokens,
            num_decode_tokens,
        });

        let engine = Engine::create(settings)?;
        let session = engine.create_session(SessionConfig {
            max_output_tokens: num_decode_tokens.max(1),
            ..SessionConfig::default()
        })?;
        session.run_prefill(vec![InputData::Text(String::new())])?;

        // The decode turn measures raw throughput through the executor's
        // internal sampler: back-to-back steps with no logits round-trip.
        let session_id = session.session_id();
        let handler = engine
            .execution_manager
            .with_session_info(session_id, |info| Arc::clone(&info.handler))?;
        let decode_start = Instant::now();
        let mut first_token_elapsed = None;
        let mut num_tokens = 0usize;
        {
            let mut locked = engine
                .execution_manager
                .resource_manager()
                .acquire_executor_with_context_handler(&handler)?;
            for _ in 0..num_decode_tokens {
                locked.decode_text_tokens()?;
                if first_token_elapsed.is_none() {
                    first_token_elapsed = Some(decode_start.elapsed());
                }
                num_tokens += 1;
            }
        }
        engine
            .execution_manager
            .with_benchmark_info_mut(session_id, |bench| {
                bench.add_decode_turn(num_tokens, decode_start.elapsed());
                if let Some(elapsed) = first_token_elapsed {
                    bench.record_time_to_first_token(elapsed);
                }
            })?;
        session.get_benchmark_info()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.wait_until_done(DEFAULT_TIMEOUT) {
            error!(error = %e, "engine_teardown_wait_failed");
        }
        self.execution_manager.shutdown();
    }
}
