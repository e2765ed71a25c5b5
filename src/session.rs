//! Conversational sessions
//!
//! A session pairs one inference context with a role-specific preamble and
//! a message history. It serializes its own requests: while a request is in
//! flight, submitting or resetting is rejected with `SessionBusy`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::runtime::{ChatMessage, ChatTemplate, ContextParams, ModelHandle, SamplingConfig};
use crate::streaming::{self, GenerationRequest, InFlightGuard, RequestId, SharedContext, StreamHandle};

/// Conversational role of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Riddler,
    Grader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Riddler => "riddler",
            Role::Grader => "grader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One independent conversational role bound to its own inference context
pub struct Session {
    role: Role,
    preamble: String,
    history: Vec<ChatMessage>,
    template: ChatTemplate,
    context: SharedContext,
    in_flight: Arc<AtomicBool>,
    runtime: Handle,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("history", &self.history.len())
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl Session {
    /// Create a session with a fresh context on `model`
    pub fn create(
        model: &ModelHandle,
        role: Role,
        preamble: impl Into<String>,
        params: &ContextParams,
        template: ChatTemplate,
        runtime: Handle,
    ) -> Result<Self> {
        let context = model.create_context(params)?;
        let preamble = preamble.into();
        Ok(Self {
            role,
            history: vec![ChatMessage::system(preamble.clone())],
            preamble,
            template,
            context: Arc::new(Mutex::new(context)),
            in_flight: Arc::new(AtomicBool::new(false)),
            runtime,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn preamble(&self) -> &str {
        &self.preamble
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// True while a submitted request has not settled
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Clear history back to just the preamble
    pub fn reset(&mut self) -> Result<()> {
        if self.is_busy() {
            return Err(Error::SessionBusy(self.role));
        }
        self.history.clear();
        self.history.push(ChatMessage::system(self.preamble.clone()));
        Ok(())
    }

    /// Submit a user message and start streaming the reply.
    ///
    /// The worker receives a rendered snapshot of the history; it never
    /// touches the session itself.
    #[instrument(name = "session.submit", skip(self, message, sampling, cancel), fields(role = %self.role))]
    pub fn submit(
        &mut self,
        id: RequestId,
        message: &str,
        sampling: &SamplingConfig,
        cancel: CancellationToken,
    ) -> Result<StreamHandle> {
        let guard = InFlightGuard::acquire(&self.in_flight).ok_or_else(|| {
            tracing::warn!(request_id = %id, "Rejected submit while a request is in flight");
            Error::SessionBusy(self.role)
        })?;
        sampling.validate()?;

        let mut snapshot = self.history.clone();
        snapshot.push(ChatMessage::user(message));
        let prompt = self.template.render(&snapshot, true)?;
        self.history = snapshot;

        tracing::debug!(request_id = %id, prompt_len = prompt.len(), turns = self.history.len(), "Submitting");

        let request = GenerationRequest {
            id,
            prompt,
            sampling: sampling.clone(),
            cancel,
        };
        Ok(streaming::spawn_generation(&self.runtime, self.context.clone(), request, Some(guard)))
    }
}
