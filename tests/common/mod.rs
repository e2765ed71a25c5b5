//! Common test utilities for the riddle core

#![allow(dead_code)]

use riddler_core::{
    runtime::{ScriptedBackend, ScriptedReply},
    ExchangeOutcome, RiddleCore, Settings,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

pub struct TestCore {
    pub core: RiddleCore,
    pub backend: ScriptedBackend,
    // Keeps the placeholder model file alive
    _model_file: NamedTempFile,
}

/// Default settings pointing at `model_file`
pub fn test_settings(model_file: &NamedTempFile) -> Settings {
    let mut settings = Settings::defaults().expect("test: default settings");
    settings.model.path = model_file.path().to_path_buf();
    settings.model.threads = Some(1);
    settings
}

/// An uninitialized core over a scripted backend
pub fn test_core(backend: ScriptedBackend) -> TestCore {
    let model_file = NamedTempFile::new().expect("test: model file");
    let settings = test_settings(&model_file);
    let core = RiddleCore::new(
        settings,
        Arc::new(backend.clone()),
        tokio::runtime::Handle::current(),
    )
    .expect("test: core");
    TestCore {
        core,
        backend,
        _model_file: model_file,
    }
}

/// A core that has finished initializing
pub async fn ready_core() -> TestCore {
    let mut test = test_core(ScriptedBackend::new());
    test.core.initialize().await.expect("test: initialize");
    test
}

pub fn riddle_reply() -> ScriptedReply {
    ScriptedReply::new([
        "RIDDLE: What has keys but no locks? ",
        "ANSWER: A piano",
        "<END_RIDDLE>",
    ])
}

/// Poll an exchange the way the interactive loop does, once per tick
pub async fn poll_until_done(
    exchange: &mut riddler_core::Exchange,
    fragments: &mut Vec<String>,
) -> ExchangeOutcome {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(outcome) = exchange.poll(|f| fragments.push(f.to_string())) {
            return outcome;
        }
        assert!(tokio::time::Instant::now() < deadline, "test: exchange never settled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
