//! Orchestration core
//!
//! `RiddleCore` is the composition root for the riddle game: it owns the
//! model handle and both sessions, hands out request ids, and tears
//! everything down in dependency order. The frontend constructs exactly one
//! and passes it around explicitly.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::parser::{OutputParser, ParsedResult, ReplyKind};
use crate::runtime::{ChatTemplate, ModelBackend, ModelHandle, ModelInfo, PromptTemplate};
use crate::session::{Role, Session};
use crate::streaming::{FinishReason, GenerationOutcome, RequestId, StreamHandle};

/// Lifecycle state of the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreStatus {
    Uninitialized,
    Ready,
    /// Initialization failed; the core cannot be used
    Failed,
    ShutDown,
}

/// Cancellation tokens of requests whose terminal state has not been observed
#[derive(Debug, Clone, Default)]
struct RequestRegistry {
    next_id: Arc<AtomicU64>,
    active: Arc<Mutex<HashMap<RequestId, CancellationToken>>>,
}

impl RequestRegistry {
    fn register(&self) -> (RequestId, CancellationToken) {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let token = CancellationToken::new();
        self.active.lock().insert(id, token.clone());
        (id, token)
    }

    fn release(&self, id: RequestId) {
        self.active.lock().remove(&id);
    }

    fn cancel(&self, id: RequestId) -> bool {
        match self.active.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) -> usize {
        let active = self.active.lock();
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    fn len(&self) -> usize {
        self.active.lock().len()
    }
}

/// Terminal result of an exchange as seen by the frontend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Completed {
        result: ParsedResult,
        finish_reason: FinishReason,
        fragments: usize,
        elapsed: Duration,
    },
    Cancelled,
    /// The request failed; the session stays usable
    Failed(String),
}

/// One in-flight request: streamed fragments, then a parsed result.
///
/// Dropping an unfinished exchange cancels its request.
pub struct Exchange {
    role: Role,
    stream: StreamHandle,
    parser: OutputParser,
    registry: RequestRegistry,
    outcome: Option<ExchangeOutcome>,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.stream.id())
            .field("role", &self.role)
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl Exchange {
    fn new(role: Role, stream: StreamHandle, parser: OutputParser, registry: RequestRegistry) -> Self {
        Self {
            role,
            stream,
            parser,
            registry,
            outcome: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.stream.id()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn cancel(&self) {
        self.stream.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Drain queued fragments without blocking. Call once per interactive tick.
    pub fn poll<F>(&mut self, on_fragment: F) -> Option<ExchangeOutcome>
    where
        F: FnMut(&str),
    {
        if self.outcome.is_none() {
            if let Some(outcome) = self.stream.drain(on_fragment) {
                self.settle(outcome);
            }
        }
        self.outcome.clone()
    }

    /// Wait for the next fragment; `None` once the exchange is terminal
    pub async fn next_fragment(&mut self) -> Option<String> {
        if self.outcome.is_some() {
            return None;
        }
        let fragment = self.stream.next_fragment().await;
        if fragment.is_none() {
            if let Some(outcome) = self.stream.drain(|_| {}) {
                self.settle(outcome);
            }
        }
        fragment
    }

    /// Wait for the terminal outcome, handing fragments to `on_fragment`
    pub async fn wait<F>(mut self, mut on_fragment: F) -> ExchangeOutcome
    where
        F: FnMut(&str),
    {
        while self.outcome.is_none() {
            match self.stream.next_fragment().await {
                Some(fragment) => on_fragment(&fragment),
                None => {
                    if let Some(outcome) = self.stream.drain(|_| {}) {
                        self.settle(outcome);
                    }
                }
            }
        }
        self.outcome.take().unwrap_or(ExchangeOutcome::Cancelled)
    }

    fn settle(&mut self, outcome: GenerationOutcome) {
        let id = self.stream.id();
        self.registry.release(id);
        let outcome = match outcome {
            GenerationOutcome::Completed(completion) => {
                let result = self.parser.parse(&completion.text);
                tracing::debug!(request_id = %id, role = %self.role, reply = ?result.reply, "Parsed reply");
                ExchangeOutcome::Completed {
                    result,
                    finish_reason: completion.finish_reason,
                    fragments: completion.fragments,
                    elapsed: completion.elapsed,
                }
            }
            GenerationOutcome::Cancelled { fragments } => {
                tracing::info!(request_id = %id, role = %self.role, fragments, "Request cancelled");
                ExchangeOutcome::Cancelled
            }
            GenerationOutcome::Failed { reason, .. } => {
                tracing::warn!(request_id = %id, role = %self.role, "Request failed: {}", reason);
                ExchangeOutcome::Failed(reason)
            }
        };
        self.outcome = Some(outcome);
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.registry.release(self.stream.id());
    }
}

/// Composition root owning the model and both sessions
pub struct RiddleCore {
    settings: Settings,
    backend: Arc<dyn ModelBackend>,
    runtime: Handle,
    status: CoreStatus,
    grading_prompt: PromptTemplate,
    registry: RequestRegistry,
    // Sessions are declared before the model: they must drop first
    riddler: Option<Session>,
    grader: Option<Session>,
    model: Option<ModelHandle>,
}

impl fmt::Debug for RiddleCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RiddleCore")
            .field("backend", &self.backend.name())
            .field("status", &self.status)
            .field("model", &self.model)
            .field("active_requests", &self.registry.len())
            .finish()
    }
}

impl RiddleCore {
    /// Build an uninitialized core. Settings are validated here.
    pub fn new(settings: Settings, backend: Arc<dyn ModelBackend>, runtime: Handle) -> Result<Self> {
        settings.validate()?;
        let grading_prompt = PromptTemplate::new(settings.grader.prompt.as_str())?;
        Ok(Self {
            settings,
            backend,
            runtime,
            status: CoreStatus::Uninitialized,
            grading_prompt,
            registry: RequestRegistry::default(),
            riddler: None,
            grader: None,
            model: None,
        })
    }

    pub fn status(&self) -> CoreStatus {
        self.status
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn model_info(&self) -> Option<&ModelInfo> {
        self.model.as_ref().map(ModelHandle::info)
    }

    pub fn session(&self, role: Role) -> Option<&Session> {
        match role {
            Role::Riddler => self.riddler.as_ref(),
            Role::Grader => self.grader.as_ref(),
        }
    }

    /// Requests whose terminal state has not been observed yet
    pub fn active_requests(&self) -> usize {
        self.registry.len()
    }

    /// Load the model and create both sessions.
    ///
    /// Loading runs on the blocking pool; the core reports `Ready` only once
    /// it has succeeded. A load error is fatal and leaves the core `Failed`.
    pub async fn initialize(&mut self) -> Result<()> {
        match self.status {
            CoreStatus::Ready => return Ok(()),
            CoreStatus::ShutDown => return Err(Error::ShutDown),
            CoreStatus::Uninitialized | CoreStatus::Failed => {}
        }

        let backend = self.backend.clone();
        let settings = self.settings.clone();
        let runtime = self.runtime.clone();
        let loaded = self
            .runtime
            .spawn_blocking(move || build_sessions(backend.as_ref(), &settings, runtime))
            .await
            .map_err(|e| Error::Internal(format!("model load task failed: {}", e)))
            .and_then(|result| result);

        match loaded {
            Ok((model, riddler, grader)) => {
                tracing::info!(
                    model = %model.info().name,
                    backend = %model.info().backend,
                    "Riddle core ready"
                );
                self.riddler = Some(riddler);
                self.grader = Some(grader);
                self.model = Some(model);
                self.status = CoreStatus::Ready;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Initialization failed: {}", e);
                self.status = CoreStatus::Failed;
                Err(e)
            }
        }
    }

    /// Start a fresh riddle exchange
    pub fn submit_riddle_request(&mut self) -> Result<Exchange> {
        let prompt = self.settings.riddler.prompt.clone();
        self.start(Role::Riddler, &prompt)
    }

    /// Start grading `guess` against the riddle's correct answer
    pub fn submit_grade_request(&mut self, riddle: &str, correct_answer: &str, guess: &str) -> Result<Exchange> {
        self.ensure_ready()?;
        if correct_answer.trim().is_empty() {
            return Err(Error::Validation(
                "cannot grade without a correct answer".to_string(),
            ));
        }
        let message = self
            .grading_prompt
            .render_grading(riddle.trim(), correct_answer.trim(), guess.trim())?;
        self.start(Role::Grader, &message)
    }

    /// Cancel a request by id. Returns false if it is unknown or already settled.
    pub fn cancel(&self, id: RequestId) -> bool {
        let found = self.registry.cancel(id);
        tracing::debug!(request_id = %id, found, "Cancel requested");
        found
    }

    /// Cancel everything in flight and release sessions, then the model
    pub fn shutdown(&mut self) {
        if self.status == CoreStatus::ShutDown {
            return;
        }
        let cancelled = self.registry.cancel_all();
        tracing::info!(cancelled, "Shutting down riddle core");

        self.riddler = None;
        self.grader = None;
        if let Some(model) = self.model.take() {
            model.unload();
        }
        self.status = CoreStatus::ShutDown;
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.status {
            CoreStatus::Ready => Ok(()),
            CoreStatus::ShutDown => Err(Error::ShutDown),
            CoreStatus::Uninitialized | CoreStatus::Failed => Err(Error::NotReady),
        }
    }

    /// Reset the role's session and submit one independent exchange
    fn start(&mut self, role: Role, message: &str) -> Result<Exchange> {
        self.ensure_ready()?;
        let session = match role {
            Role::Riddler => self.riddler.as_mut(),
            Role::Grader => self.grader.as_mut(),
        }
        .ok_or(Error::NotReady)?;

        session.reset()?;

        let (id, cancel) = self.registry.register();
        let sampling = &self.settings.role(role).sampling;
        let stream = match session.submit(id, message, sampling, cancel) {
            Ok(stream) => stream,
            Err(e) => {
                self.registry.release(id);
                return Err(e);
            }
        };

        let kind = match role {
            Role::Riddler => ReplyKind::Riddle,
            Role::Grader => ReplyKind::Verdict,
        };
        let parser = OutputParser::new(kind, self.settings.strip_markers(role));
        tracing::info!(request_id = %id, role = %role, "Request submitted");
        Ok(Exchange::new(role, stream, parser, self.registry.clone()))
    }
}

impl Drop for RiddleCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_sessions(
    backend: &dyn ModelBackend,
    settings: &Settings,
    runtime: Handle,
) -> Result<(ModelHandle, Session, Session)> {
    let model = ModelHandle::load(backend, &settings.model.path, &settings.model_params())?;
    let template = ChatTemplate::new(settings.chat.template.as_str())?;

    let riddler = Session::create(
        &model,
        Role::Riddler,
        settings.riddler.preamble.trim(),
        &settings.context_params(Role::Riddler),
        template.clone(),
        runtime.clone(),
    )?;
    let grader = Session::create(
        &model,
        Role::Grader,
        settings.grader.preamble.trim(),
        &settings.context_params(Role::Grader),
        template,
        runtime,
    )?;
    Ok((model, riddler, grader))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_ids_are_monotonic() {
        let registry = RequestRegistry::default();
        let (first, _) = registry.register();
        let (second, _) = registry.register();
        assert_eq!(first, RequestId(1));
        assert_eq!(second, RequestId(2));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_cancel_and_release() {
        let registry = RequestRegistry::default();
        let (id, token) = registry.register();
        assert!(registry.cancel(id));
        assert!(token.is_cancelled());

        registry.release(id);
        assert!(!registry.cancel(id));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_cancel_all() {
        let registry = RequestRegistry::default();
        let tokens: Vec<_> = (0..3).map(|_| registry.register().1).collect();
        assert_eq!(registry.cancel_all(), 3);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }
}
