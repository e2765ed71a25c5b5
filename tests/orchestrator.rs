mod common;

use common::{poll_until_done, ready_core, riddle_reply, test_core};
use riddler_core::{
    runtime::{ChatMessage, ScriptedBackend, ScriptedReply},
    streaming::FinishReason,
    CoreStatus, Error, ExchangeOutcome, LoadError, ParsedReply, RequestId, Role,
};
use std::time::Duration;

#[tokio::test]
async fn test_riddle_round_trip() {
    let mut test = ready_core().await;
    test.backend.push_reply("riddler", riddle_reply());

    let mut exchange = test.core.submit_riddle_request().expect("test: submit");
    assert_eq!(test.core.active_requests(), 1);

    let mut fragments = Vec::new();
    let outcome = poll_until_done(&mut exchange, &mut fragments).await;

    assert_eq!(
        fragments,
        vec![
            "RIDDLE: What has keys but no locks? ",
            "ANSWER: A piano",
            "<END_RIDDLE>"
        ]
    );
    match outcome {
        ExchangeOutcome::Completed {
            result,
            finish_reason,
            fragments,
            ..
        } => {
            assert_eq!(
                result.reply,
                ParsedReply::Riddle {
                    riddle: "What has keys but no locks?".to_string(),
                    answer: "A piano".to_string(),
                }
            );
            assert_eq!(finish_reason, FinishReason::StopMarker("<END_RIDDLE>".to_string()));
            assert_eq!(fragments, 3);
        }
        other => panic!("expected a riddle, got {:?}", other),
    }
    assert_eq!(test.core.active_requests(), 0);
}

#[tokio::test]
async fn test_grading_round_trip() {
    let mut test = ready_core().await;
    test.backend.push_reply(
        "grader",
        ScriptedReply::new(["Incorrect - the answer", " was a piano.", "<|im_end|>"]),
    );

    let exchange = test
        .core
        .submit_grade_request("What has keys but no locks?", "A piano", "a door")
        .expect("test: submit");

    let mut fragments = Vec::new();
    let outcome = exchange.wait(|f| fragments.push(f.to_string())).await;
    assert_eq!(fragments.len(), 3);

    match outcome {
        ExchangeOutcome::Completed { result, .. } => {
            assert_eq!(result.sanitized, "Incorrect - the answer was a piano.");
            assert_eq!(
                result.reply,
                ParsedReply::Verdict {
                    verdict: "Incorrect - the answer was a piano.".to_string(),
                    correct: Some(false),
                }
            );
        }
        other => panic!("expected a verdict, got {:?}", other),
    }

    // The grading prompt carries all three fields
    let grader = test.core.session(Role::Grader).expect("test: grader session");
    let prompt = &grader.history()[1].content;
    assert!(prompt.contains("Riddle: What has keys but no locks?"));
    assert!(prompt.contains("Correct answer: A piano"));
    assert!(prompt.contains("Player answer: a door"));
}

#[tokio::test]
async fn test_unformatted_riddle_falls_back_to_whole_text() {
    let mut test = ready_core().await;
    test.backend.push_reply(
        "riddler",
        ScriptedReply::from_text("I am tall when young and short when old.\n\n\n\nWhat am I?"),
    );

    let exchange = test.core.submit_riddle_request().expect("test: submit");
    let result = match exchange.wait(|_| {}).await {
        ExchangeOutcome::Completed { result, .. } => result,
        other => panic!("expected completion, got {:?}", other),
    };
    let (riddle, answer) = result.riddle().expect("test: riddle reply");
    assert_eq!(riddle, "I am tall when young and short when old.\n\nWhat am I?");
    assert_eq!(answer, "");

    // Nothing to grade against
    let graded = test.core.submit_grade_request(riddle, answer, "a candle");
    assert!(matches!(graded, Err(Error::Validation(_))));
    assert!(!test.core.session(Role::Grader).expect("test: grader").is_busy());
}

#[tokio::test]
async fn test_second_riddle_request_is_rejected_while_busy() {
    let mut test = ready_core().await;
    let (reply, gate) = riddle_reply().gated();
    test.backend.push_reply("riddler", reply);
    test.backend
        .push_reply("grader", ScriptedReply::new(["Correct!"]));

    let first = test.core.submit_riddle_request().expect("test: submit");
    let history = test
        .core
        .session(Role::Riddler)
        .expect("test: riddler")
        .history()
        .to_vec();

    let second = test.core.submit_riddle_request();
    assert!(matches!(second, Err(Error::SessionBusy(Role::Riddler))));
    assert_eq!(
        test.core.session(Role::Riddler).expect("test: riddler").history(),
        history.as_slice()
    );

    // The other session is independent
    let grade = test
        .core
        .submit_grade_request("What has keys?", "A piano", "piano")
        .expect("test: grade while riddler busy");
    assert!(matches!(
        grade.wait(|_| {}).await,
        ExchangeOutcome::Completed { .. }
    ));

    gate.open();
    assert!(matches!(first.wait(|_| {}).await, ExchangeOutcome::Completed { .. }));
    assert!(!test.core.session(Role::Riddler).expect("test: riddler").is_busy());
}

#[tokio::test]
async fn test_cancel_mid_stream() {
    let mut test = ready_core().await;
    let (reply, gate) = ScriptedReply::new([
        "RIDDLE: What walks ",
        "on four legs ",
        "in the morning? ",
        "ANSWER: A person",
    ])
    .gated();
    test.backend.push_reply("riddler", reply);

    let mut exchange = test.core.submit_riddle_request().expect("test: submit");
    let id = exchange.id();

    gate.release(1);
    assert_eq!(exchange.next_fragment().await.as_deref(), Some("RIDDLE: What walks "));

    assert!(test.core.cancel(id));
    gate.open();

    let mut late = Vec::new();
    let outcome = exchange.wait(|f| late.push(f.to_string())).await;
    assert_eq!(outcome, ExchangeOutcome::Cancelled);
    assert!(late.is_empty(), "fragments delivered after cancel: {:?}", late);
    assert!(!test.core.cancel(id));

    // Next exchange starts from the preamble, with no trace of the partial riddle
    test.backend.push_reply("riddler", riddle_reply());
    let next = test.core.submit_riddle_request().expect("test: submit after cancel");
    let history = test.core.session(Role::Riddler).expect("test: riddler").history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, "system");
    assert_eq!(history[1], ChatMessage::user(test.core.settings().riddler.prompt.clone()));
    assert!(history.iter().all(|m| !m.content.contains("What walks")));
    assert!(matches!(next.wait(|_| {}).await, ExchangeOutcome::Completed { .. }));
}

#[tokio::test]
async fn test_cancel_after_worker_finished_reports_cancelled() {
    let mut test = ready_core().await;
    test.backend.push_reply("riddler", riddle_reply());

    let mut exchange = test.core.submit_riddle_request().expect("test: submit");
    let id = exchange.id();
    assert_eq!(exchange.role(), Role::Riddler);

    // Let the worker run to completion without draining anything
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while test.core.session(Role::Riddler).expect("test: riddler").is_busy() {
        assert!(tokio::time::Instant::now() < deadline, "test: worker never settled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!exchange.is_finished());

    assert!(test.core.cancel(id));

    let mut fragments = Vec::new();
    let outcome = exchange.poll(|f| fragments.push(f.to_string()));
    assert_eq!(outcome, Some(ExchangeOutcome::Cancelled));
    assert!(fragments.is_empty(), "fragments delivered after cancel: {:?}", fragments);
    assert!(exchange.is_finished());
    assert_eq!(test.core.active_requests(), 0);
}

#[tokio::test]
async fn test_generation_failure_keeps_session_usable() {
    let mut test = ready_core().await;
    test.backend.push_reply(
        "riddler",
        ScriptedReply::new(["RIDDLE: half a riddle", " and more"]).failing_at(1, "decode failed"),
    );
    test.backend.push_reply("riddler", riddle_reply());

    let exchange = test.core.submit_riddle_request().expect("test: submit");
    let mut fragments = Vec::new();
    let outcome = exchange.wait(|f| fragments.push(f.to_string())).await;
    assert_eq!(fragments, vec!["RIDDLE: half a riddle"]);
    assert_eq!(
        outcome,
        ExchangeOutcome::Failed("Generation error: decode failed".to_string())
    );

    let retry = test.core.submit_riddle_request().expect("test: retry");
    match retry.wait(|_| {}).await {
        ExchangeOutcome::Completed { result, .. } => {
            assert_eq!(result.riddle(), Some(("What has keys but no locks?", "A piano")));
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rejected_generation_fails_the_request_only() {
    let mut test = ready_core().await;
    test.backend.push_reply(
        "grader",
        ScriptedReply::default().failing_on_start("prompt does not fit the context"),
    );
    test.backend.push_reply("grader", ScriptedReply::new(["Correct."]));

    let exchange = test
        .core
        .submit_grade_request("What has keys?", "A piano", "piano")
        .expect("test: submit");
    assert_eq!(
        exchange.wait(|_| {}).await,
        ExchangeOutcome::Failed("Generation error: prompt does not fit the context".to_string())
    );

    let retry = test
        .core
        .submit_grade_request("What has keys?", "A piano", "piano")
        .expect("test: retry");
    match retry.wait(|_| {}).await {
        ExchangeOutcome::Completed { result, .. } => {
            assert_eq!(result.verdict(), Some("Correct."));
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_backend_panic_is_contained() {
    let mut test = ready_core().await;
    test.backend
        .push_reply("grader", ScriptedReply::new(["Correct", "!"]).panicking_at(1));

    let exchange = test
        .core
        .submit_grade_request("What has keys?", "A piano", "piano")
        .expect("test: submit");
    match exchange.wait(|_| {}).await {
        ExchangeOutcome::Failed(reason) => assert!(reason.contains("panicked"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!test.core.session(Role::Grader).expect("test: grader").is_busy());
}

#[tokio::test]
async fn test_dropping_an_exchange_cancels_it() {
    let mut test = ready_core().await;
    let (reply, gate) = riddle_reply().gated();
    test.backend.push_reply("riddler", reply);

    let exchange = test.core.submit_riddle_request().expect("test: submit");
    let id = exchange.id();
    drop(exchange);
    assert_eq!(test.core.active_requests(), 0);
    assert!(!test.core.cancel(id));

    gate.open();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while test.core.session(Role::Riddler).expect("test: riddler").is_busy() {
        assert!(tokio::time::Instant::now() < deadline, "test: worker never settled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    test.backend.push_reply("riddler", riddle_reply());
    let next = test.core.submit_riddle_request().expect("test: submit after drop");
    assert!(matches!(next.wait(|_| {}).await, ExchangeOutcome::Completed { .. }));
}

#[tokio::test]
async fn test_cancel_unknown_request() {
    let test = ready_core().await;
    assert!(!test.core.cancel(RequestId(999)));
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_requests() {
    let mut test = ready_core().await;
    let (reply, gate) = riddle_reply().gated();
    test.backend.push_reply("riddler", reply);

    let exchange = test.core.submit_riddle_request().expect("test: submit");
    test.core.shutdown();
    assert_eq!(test.core.status(), CoreStatus::ShutDown);
    assert!(test.core.session(Role::Riddler).is_none());
    assert!(test.core.model_info().is_none());

    gate.open();
    assert_eq!(exchange.wait(|_| {}).await, ExchangeOutcome::Cancelled);

    assert!(matches!(test.core.submit_riddle_request(), Err(Error::ShutDown)));
    assert!(matches!(test.core.initialize().await, Err(Error::ShutDown)));
    // Idempotent
    test.core.shutdown();
}

#[tokio::test]
async fn test_missing_model_file_fails_initialization() {
    let mut test = test_core(ScriptedBackend::new());
    let mut settings = test.core.settings().clone();
    settings.model.path = "/nonexistent/riddler.gguf".into();
    let mut core = riddler_core::RiddleCore::new(
        settings,
        std::sync::Arc::new(test.backend.clone()),
        tokio::runtime::Handle::current(),
    )
    .expect("test: core");

    let result = core.initialize().await;
    assert!(matches!(result, Err(Error::Load(LoadError::FileNotFound(_)))));
    assert_eq!(core.status(), CoreStatus::Failed);
    assert!(matches!(core.submit_riddle_request(), Err(Error::NotReady)));

    // The untouched core is still loadable
    test.core.initialize().await.expect("test: initialize");
    assert_eq!(test.core.status(), CoreStatus::Ready);
}

#[tokio::test]
async fn test_native_init_failure() {
    let mut test = test_core(ScriptedBackend::failing_load("unsupported quantization"));
    let result = test.core.initialize().await;
    match result {
        Err(Error::Load(LoadError::NativeInit(msg))) => assert_eq!(msg, "unsupported quantization"),
        other => panic!("expected native init failure, got {:?}", other),
    }
    assert_eq!(test.core.status(), CoreStatus::Failed);
}

#[tokio::test]
async fn test_requests_before_initialize_are_rejected() {
    let mut test = test_core(ScriptedBackend::new());
    assert_eq!(test.core.status(), CoreStatus::Uninitialized);
    assert!(matches!(test.core.submit_riddle_request(), Err(Error::NotReady)));
    assert!(matches!(
        test.core.submit_grade_request("r", "a", "g"),
        Err(Error::NotReady)
    ));
}

#[tokio::test]
async fn test_model_info_after_initialize() {
    let test = ready_core().await;
    let info = test.core.model_info().expect("test: model info");
    assert_eq!(info.backend, "scripted");
    assert_eq!(info.context_size, 2048);
}
