//! End-to-end scenarios driving the engine through the scripted executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;

use edgelm_kernel::config::{
    Backend, DecodeConfig, EngineSettings, MainExecutorSettings, ModelAssets, SessionConfig,
};
use edgelm_kernel::error::ErrorKind;
use edgelm_kernel::io::{InputData, TaskState, TokenId};
use edgelm_kernel::message::{ContentPart, Message, MessageContent, Role};
use edgelm_runtime::engine::{
    register_executor_factory, register_tokenizer_factory, EngineComponents,
};
use edgelm_runtime::Engine;
use edgelm_testing::{ByteLevelTokenizer, ScriptedExecutor, ScriptedState, ScriptedVisionExecutor};

const EOS: TokenId = 0;

fn engine_settings() -> EngineSettings {
    EngineSettings::new(MainExecutorSettings::new(
        Backend::Cpu,
        ModelAssets::from_buffer(vec![0u8; 8]),
    ))
}

fn engine_with_script(script: &[u8]) -> (Engine, Arc<Mutex<ScriptedState>>) {
    let script: Vec<TokenId> = script.iter().map(|&b| b as TokenId).collect();
    let (executor, state) = ScriptedExecutor::scripted(script, EOS);
    let engine = Engine::create_with_components(
        engine_settings(),
        EngineComponents::new(Box::new(executor), Box::new(ByteLevelTokenizer::new())),
    )
    .unwrap();
    (engine, state)
}

fn session_config(max_output_tokens: usize) -> SessionConfig {
    SessionConfig {
        max_output_tokens,
        stop_token_ids: vec![EOS],
        ..SessionConfig::default()
    }
}

fn tokens_of(text: &str) -> Vec<TokenId> {
    text.bytes().map(|b| b as TokenId).collect()
}

#[test]
fn streamed_decode_accumulates_text_and_keeps_frontier_on_done() {
    let (engine, _state) = engine_with_script(b"Hello");
    let session = engine.create_session(session_config(64)).unwrap();

    #[derive(Default)]
    struct Observed {
        accumulated: String,
        processing_chunks: usize,
        final_state: Option<TaskState>,
    }
    let observed = Arc::new(Mutex::new(Observed::default()));

    let cb_observed = Arc::clone(&observed);
    session
        .generate_content_stream(
            vec![InputData::Text("Hi".into())],
            Box::new(move |responses| {
                let responses = responses.unwrap();
                let mut o = cb_observed.lock().unwrap();
                match responses.task_state() {
                    TaskState::Processing => {
                        o.processing_chunks += 1;
                        o.accumulated.push_str(&responses.texts()[0]);
                    }
                    state if state.is_end_state() => o.final_state = Some(state),
                    _ => {}
                }
            }),
            DecodeConfig::default(),
        )
        .unwrap();

    engine.wait_until_done(Duration::from_secs(10)).unwrap();
    let o = observed.lock().unwrap();
    assert!(o.processing_chunks >= 2);
    assert_eq!(o.accumulated, "Hello");
    assert_eq!(o.final_state, Some(TaskState::Done));
    // On Done the frontier keeps the decode task id for chaining.
    assert!(!session.last_task_ids().is_empty());
}

#[test]
fn clone_divergence_keeps_both_histories_intact() {
    let (engine, state) = engine_with_script(b"xxxx");
    let a = engine.create_session(session_config(8)).unwrap();

    a.run_prefill(vec![InputData::Text("The sky is".into())])
        .unwrap();
    let b = a.clone_session().unwrap();

    b.run_prefill(vec![InputData::Text(" blue.".into())])
        .unwrap();
    a.run_prefill(vec![InputData::Text(" red.".into())])
        .unwrap();
    engine.wait_until_done(Duration::from_secs(10)).unwrap();

    // Decoding on B must first restore B's context; its history reads
    // "The sky is blue." even though A prefilled afterwards.
    b.run_decode(DecodeConfig {
        max_output_tokens: Some(1),
        constraint: None,
    })
    .unwrap();
    {
        let s = state.lock().unwrap();
        let expected = tokens_of("The sky is blue.");
        assert_eq!(&s.tokens[..expected.len()], &expected[..]);
    }

    // And decoding on A restores A's diverged history.
    a.run_decode(DecodeConfig {
        max_output_tokens: Some(1),
        constraint: None,
    })
    .unwrap();
    {
        let s = state.lock().unwrap();
        let expected = tokens_of("The sky is red.");
        assert_eq!(&s.tokens[..expected.len()], &expected[..]);
        let other = tokens_of("The sky is blue.");
        assert_ne!(&s.tokens[..other.len()], &other[..]);
    }
}

#[test]
fn cancel_during_decode_emits_cancelled_and_clears_frontier() {
    let (engine, state) = engine_with_script(&[b'y'; 100]);
    state.lock().unwrap().decode_delay = Duration::from_millis(20);
    let session = engine.create_session(session_config(100)).unwrap();
    session
        .run_prefill(vec![InputData::Text("go".into())])
        .unwrap();

    let states: Arc<Mutex<Vec<TaskState>>> = Arc::new(Mutex::new(Vec::new()));
    let cancel_issued = Arc::new(AtomicBool::new(false));

    let cb_states = Arc::clone(&states);
    let cb_session = Arc::clone(&session);
    let cb_cancel = Arc::clone(&cancel_issued);
    let controller = session
        .run_decode_async(
            Box::new(move |responses| {
                let responses = responses.unwrap();
                cb_states.lock().unwrap().push(responses.task_state());
                if !cb_cancel.swap(true, Ordering::SeqCst) {
                    cb_session.cancel_process();
                }
            }),
            DecodeConfig::default(),
        )
        .unwrap();
    controller.wait_until_done(Duration::from_secs(10)).unwrap();

    let states = states.lock().unwrap();
    assert_eq!(*states.last().unwrap(), TaskState::Cancelled);
    assert!(session.last_task_ids().is_empty());
}

#[test]
fn cancelled_sync_decode_returns_structured_status() {
    let (engine, state) = engine_with_script(&[b'y'; 100]);
    state.lock().unwrap().decode_delay = Duration::from_millis(40);
    let session = engine.create_session(session_config(100)).unwrap();
    session
        .run_prefill(vec![InputData::Text("go".into())])
        .unwrap();

    let canceller = {
        let session = Arc::clone(&session);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            session.cancel_process();
        })
    };

    let err = session.run_decode(DecodeConfig::default()).unwrap_err();
    canceller.join().unwrap();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    let text = err.to_string();
    assert!(text.contains("cancel_reason_code=DECODE_TASK_CANCELLED_STATE"));
    assert!(text.contains("origin_component=SCHEDULER"));
    assert!(text.contains("is_decode=1"));
    assert!(session.last_task_ids().is_empty());
}

#[test]
fn dependent_decode_fails_without_invoking_the_executor() {
    let (engine, state) = engine_with_script(b"zz");
    {
        let mut s = state.lock().unwrap();
        s.fail_prefill = true;
        // Keep the prefill in flight long enough for the decode below to
        // land its dependency on it.
        s.prefill_delay = Duration::from_millis(80);
    }
    let session = engine.create_session(session_config(8)).unwrap();

    let prefill_error = Arc::new(Mutex::new(None));
    let cb_error = Arc::clone(&prefill_error);
    session
        .run_prefill_async(
            vec![InputData::Text("doomed".into())],
            Box::new(move |responses| {
                *cb_error.lock().unwrap() = Some(responses.err());
            }),
        )
        .unwrap();

    let decode_state = Arc::new(Mutex::new(None));
    let cb_state = Arc::clone(&decode_state);
    let controller = session
        .run_decode_async(
            Box::new(move |responses| {
                *cb_state.lock().unwrap() = Some(responses.unwrap().task_state());
            }),
            DecodeConfig::default(),
        )
        .unwrap();
    controller.wait_until_done(Duration::from_secs(10)).unwrap();

    assert!(prefill_error.lock().unwrap().as_ref().unwrap().is_some());
    assert_eq!(
        *decode_state.lock().unwrap(),
        Some(TaskState::DependentTaskFailed)
    );
    assert_eq!(state.lock().unwrap().decode_calls, 0);
    assert!(session.last_task_ids().is_empty());
}

#[test]
fn multibyte_character_reassembles_across_chunks() {
    // The script emits a degree sign split into its two UTF-8 bytes.
    let (engine, _state) = engine_with_script(&[0xC2, 0xB0]);
    let session = engine.create_session(session_config(8)).unwrap();
    session
        .run_prefill(vec![InputData::Text("temp:".into())])
        .unwrap();

    let responses = session.run_decode(DecodeConfig::default()).unwrap();
    assert_eq!(responses.task_state(), TaskState::Done);
    assert_eq!(responses.texts()[0], "°");
}

/// A 1x1 uncompressed 24-bit BMP holding a single red pixel.
fn tiny_bmp() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"BM");
    out.extend_from_slice(&58u32.to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&54u32.to_le_bytes());
    out.extend_from_slice(&40u32.to_le_bytes());
    out.extend_from_slice(&1i32.to_le_bytes());
    out.extend_from_slice(&1i32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&24u16.to_le_bytes());
    out.extend_from_slice(&[0; 24]);
    // BGR pixel plus row padding.
    out.extend_from_slice(&[0, 0, 255, 0]);
    out
}

#[test]
fn image_message_prefills_through_the_vision_executor() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let (executor, state) = ScriptedExecutor::scripted(
        b"Seen".iter().map(|&b| b as TokenId).collect(),
        EOS,
    );
    let (vision, encode_calls) = ScriptedVisionExecutor::counting();
    let engine = Engine::create_with_components(
        engine_settings(),
        EngineComponents::new(Box::new(executor), Box::new(ByteLevelTokenizer::new()))
            .with_vision_executor(Box::new(vision)),
    )
    .unwrap();
    let session = engine.create_session(session_config(64)).unwrap();

    let message = Message {
        role: Role::User,
        content: MessageContent::Parts(vec![
            ContentPart::Text {
                text: "what is this?".into(),
            },
            ContentPart::Image {
                data: Some(STANDARD.encode(tiny_bmp())),
            },
        ]),
        tool_calls: None,
    };
    let reply = session.send_message(&message).unwrap();

    assert_eq!(reply.text(), "Seen");
    // The image was encoded exactly once and its embeddings rode along
    // with the text prefill.
    assert_eq!(*encode_calls.lock().unwrap(), 1);
    let s = state.lock().unwrap();
    assert_eq!(s.vision_prefills, 1);
    let prompt = tokens_of("what is this?");
    assert_eq!(s.prefill_calls[0], prompt);
}

#[test]
fn image_message_without_a_vision_executor_fails_prefill() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let (engine, _state) = engine_with_script(b"never");
    let session = engine.create_session(session_config(8)).unwrap();
    let message = Message {
        role: Role::User,
        content: MessageContent::Parts(vec![ContentPart::Image {
            data: Some(STANDARD.encode(tiny_bmp())),
        }]),
        tool_calls: None,
    };
    // The message resolves, but the prefill task fails when it reaches the
    // unconfigured vision path.
    let err = session.send_message(&message).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn send_message_round_trip() {
    let (engine, _state) = engine_with_script(b"Hi there");
    let session = engine.create_session(session_config(64)).unwrap();

    let reply = session.send_message(&Message::user("Hello")).unwrap();
    assert_eq!(reply.text(), "Hi there");
}

#[test]
fn send_message_async_streams_chunks() {
    // Engine and session construction are blocking; only the stream is
    // consumed on a runtime.
    let (engine, _state) = engine_with_script(b"ok!");
    let session = engine.create_session(session_config(64)).unwrap();
    let mut stream = session.send_message_async(&Message::user("ping")).unwrap();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let (accumulated, final_state) = runtime.block_on(async move {
        let mut accumulated = String::new();
        let mut final_state = None;
        while let Some(item) = stream.next().await {
            let responses = item.unwrap();
            if responses.task_state() == TaskState::Processing {
                accumulated.push_str(&responses.texts()[0]);
            }
            if responses.task_state().is_end_state() {
                final_state = Some(responses.task_state());
            }
        }
        (accumulated, final_state)
    });
    assert_eq!(accumulated, "ok!");
    assert_eq!(final_state, Some(TaskState::Done));
}

#[test]
fn prompt_templates_wrap_turns_and_open_model_turn() {
    let (engine, state) = engine_with_script(b"fine");
    let session = engine
        .create_session(SessionConfig {
            apply_prompt_template: true,
            ..session_config(16)
        })
        .unwrap();

    session
        .run_prefill(vec![InputData::Text("Hi".into())])
        .unwrap();
    session.run_decode(DecodeConfig::default()).unwrap();
    engine.wait_until_done(Duration::from_secs(10)).unwrap();

    let calls = state.lock().unwrap().prefill_calls.clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], tokens_of("<start_of_turn>user\nHi"));
    assert_eq!(calls[1], tokens_of("<end_of_turn>\n<start_of_turn>model\n"));
}

#[test]
fn text_scoring_requires_batch_of_one() {
    let (engine, _state) = engine_with_script(b"");
    let session = engine.create_session(session_config(8)).unwrap();

    let err = session.run_text_scoring(&["a", "b"], false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    session
        .run_prefill(vec![InputData::Text("ctx".into())])
        .unwrap();
    let responses = session.run_text_scoring(&["ab"], true).unwrap();
    assert_eq!(responses.task_state(), TaskState::Done);
    assert_eq!(responses.scores().len(), 1);
    assert_eq!(responses.token_lengths(), Some(&[2usize][..]));
}

#[test]
fn second_decode_requires_a_new_prefill() {
    let (engine, _state) = engine_with_script(b"one two");
    let session = engine.create_session(session_config(4)).unwrap();
    session
        .run_prefill(vec![InputData::Text("x".into())])
        .unwrap();
    session.run_decode(DecodeConfig::default()).unwrap();

    // Decoded state: decode again only after another prefill.
    let err = session.run_decode(DecodeConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    session
        .run_prefill(vec![InputData::Text("y".into())])
        .unwrap();
    assert!(session.run_decode(DecodeConfig::default()).is_ok());
}

#[test]
fn engine_benchmark_collects_turns_and_first_token_time() {
    register_tokenizer_factory(|_assets| Ok(Box::new(ByteLevelTokenizer::new())));
    register_executor_factory(Backend::Cpu, |_settings| {
        let (executor, _state) = ScriptedExecutor::scripted(vec![b'z' as TokenId; 64], EOS);
        Ok(Box::new(executor))
    });

    let bench = Engine::benchmark("model.task", Backend::Cpu, 16, 4, None).unwrap();
    assert!(bench
        .init_phase(edgelm_kernel::benchmark::init_phase::EXECUTOR)
        .is_some());
    assert!(bench
        .init_phase(edgelm_kernel::benchmark::init_phase::TOKENIZER)
        .is_some());
    assert_eq!(bench.prefill_turns()[0].num_tokens, 16);
    assert_eq!(bench.decode_turns()[0].num_tokens, 4);
    assert!(bench.time_to_first_token().is_some());
}
