//! Streaming pipeline for fragment-by-fragment generation
//!
//! Generation runs on a blocking worker. Every fragment is appended to the
//! worker's accumulator and pushed, in production order, onto a
//! single-producer/single-consumer queue that the interactive thread drains
//! once per tick. The worker checks cancellation and stop markers only at
//! fragment boundaries; a fragment already being computed always completes.
//! The terminal event is the last item on the queue, so it can never
//! overtake a fragment.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::runtime::{InferenceContext, SamplingConfig};

/// Identifier of one submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Why a completed generation stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// The accumulated text contained this stop marker
    StopMarker(String),
    /// The engine ran out of fragments (end of sequence or token limit)
    EndOfStream,
}

/// Text and statistics of a completed generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Accumulated text, cut at the first stop marker
    pub text: String,
    /// Everything the engine produced
    pub raw: String,
    pub finish_reason: FinishReason,
    pub fragments: usize,
    pub elapsed: Duration,
}

/// Terminal state of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed(Completion),
    /// Not an error: the request was cancelled before it completed
    Cancelled { fragments: usize },
    /// The engine raised an error or panicked. `partial` is diagnostic only.
    Failed { reason: String, partial: String },
}

impl GenerationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, GenerationOutcome::Completed(_))
    }
}

/// Item on the fragment queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(String),
    Finished(GenerationOutcome),
}

/// Immutable description of one generation
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: RequestId,
    pub prompt: String,
    pub sampling: SamplingConfig,
    pub cancel: CancellationToken,
}

/// Marks a context as having a request in flight.
///
/// Released when the worker settles, before the terminal event is queued,
/// so a consumer that has seen the terminal event may submit again at once.
#[derive(Debug)]
pub struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    /// `None` when the flag is already held
    pub fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Shared, exclusively-locked inference context
pub type SharedContext = Arc<Mutex<Box<dyn InferenceContext>>>;

/// Finds the earliest stop marker in a growing buffer
#[derive(Debug, Clone)]
struct StopMatcher {
    markers: Vec<String>,
    longest: usize,
}

impl StopMatcher {
    fn new(markers: &[String]) -> Self {
        let markers: Vec<String> = markers.iter().filter(|m| !m.is_empty()).cloned().collect();
        let longest = markers.iter().map(String::len).max().unwrap_or(0);
        Self { markers, longest }
    }

    /// Search only the region a fragment appended at `appended_at` can affect
    fn find(&self, text: &str, appended_at: usize) -> Option<(usize, &str)> {
        if self.markers.is_empty() {
            return None;
        }
        let mut start = appended_at.saturating_sub(self.longest.saturating_sub(1));
        while !text.is_char_boundary(start) {
            start -= 1;
        }
        let window = &text[start..];
        self.markers
            .iter()
            .filter_map(|m| window.find(m.as_str()).map(|pos| (start + pos, m.as_str())))
            .min_by_key(|(pos, _)| *pos)
    }
}

/// Spawn a generation worker on the blocking pool and return its consumer handle
pub fn spawn_generation(
    runtime: &Handle,
    context: SharedContext,
    request: GenerationRequest,
    guard: Option<InFlightGuard>,
) -> StreamHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = request.id;
    let cancel = request.cancel.clone();

    runtime.spawn_blocking(move || {
        let id = request.id;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| run_generation(&context, &request, &tx))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let reason = panic_payload_message(payload.as_ref());
                tracing::error!(request_id = %id, "Generation worker panicked: {}", reason);
                GenerationOutcome::Failed {
                    reason: format!("generation panicked: {}", reason),
                    partial: String::new(),
                }
            }
        };
        drop(guard);
        if tx.send(StreamEvent::Finished(outcome)).is_err() {
            tracing::debug!(request_id = %id, "Consumer dropped before the terminal event");
        }
    });

    StreamHandle::new(id, rx, cancel)
}

/// Worker body: pull fragments until a terminal condition holds
fn run_generation(
    context: &SharedContext,
    request: &GenerationRequest,
    tx: &mpsc::UnboundedSender<StreamEvent>,
) -> GenerationOutcome {
    let start = Instant::now();
    let id = request.id;

    if request.cancel.is_cancelled() {
        tracing::debug!(request_id = %id, "Cancelled before generation started");
        return GenerationOutcome::Cancelled { fragments: 0 };
    }

    let mut context = context.lock();
    let stream = match context.generate(&request.prompt, &request.sampling) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(request_id = %id, "Generation failed to start: {}", e);
            return GenerationOutcome::Failed {
                reason: e.to_string(),
                partial: String::new(),
            };
        }
    };

    let matcher = StopMatcher::new(&request.sampling.stop_markers);
    let mut accumulated = String::new();
    let mut fragments = 0usize;
    let mut stopped_at: Option<(usize, String)> = None;

    for item in stream {
        let fragment = match item {
            Ok(fragment) => fragment,
            Err(e) => {
                tracing::warn!(
                    request_id = %id,
                    fragments,
                    "Generation failed mid-stream: {}",
                    e
                );
                tracing::debug!(request_id = %id, partial = %accumulated, "Discarded partial output");
                return GenerationOutcome::Failed {
                    reason: e.to_string(),
                    partial: accumulated,
                };
            }
        };

        let appended_at = accumulated.len();
        accumulated.push_str(&fragment);
        fragments += 1;

        if tx.send(StreamEvent::Fragment(fragment)).is_err() {
            tracing::debug!(request_id = %id, "Consumer went away, stopping generation");
            return GenerationOutcome::Cancelled { fragments };
        }

        if let Some((pos, marker)) = matcher.find(&accumulated, appended_at) {
            tracing::debug!(request_id = %id, marker, "Stop marker reached");
            stopped_at = Some((pos, marker.to_string()));
            break;
        }

        if request.cancel.is_cancelled() {
            tracing::debug!(request_id = %id, fragments, "Cancellation observed");
            return GenerationOutcome::Cancelled { fragments };
        }
    }

    let elapsed = start.elapsed();
    let (text, finish_reason) = match stopped_at {
        Some((pos, marker)) => (accumulated[..pos].to_string(), FinishReason::StopMarker(marker)),
        None => (accumulated.clone(), FinishReason::EndOfStream),
    };

    tracing::info!(
        request_id = %id,
        fragments,
        elapsed_ms = elapsed.as_millis() as u64,
        "Generation completed"
    );

    GenerationOutcome::Completed(Completion {
        text,
        raw: accumulated,
        finish_reason,
        fragments,
        elapsed,
    })
}

fn panic_payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Consumer end of a request's fragment queue.
///
/// Owned by the interactive thread. Once the request's token is cancelled
/// the handle stops delivering fragments, even ones already queued, and
/// reports `Cancelled`.
#[derive(Debug)]
pub struct StreamHandle {
    id: RequestId,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
    outcome: Option<GenerationOutcome>,
    delivered: usize,
}

impl StreamHandle {
    fn new(id: RequestId, events: mpsc::UnboundedReceiver<StreamEvent>, cancel: CancellationToken) -> Self {
        Self {
            id,
            events,
            cancel,
            outcome: None,
            delivered: 0,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Ask the worker to stop after its current fragment
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fragments handed to the consumer so far
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Non-blocking drain for one interactive tick.
    ///
    /// Hands every queued fragment to `on_fragment` in order and returns the
    /// outcome once the request has reached its terminal state.
    pub fn drain<F>(&mut self, mut on_fragment: F) -> Option<GenerationOutcome>
    where
        F: FnMut(&str),
    {
        while self.outcome.is_none() {
            match self.events.try_recv() {
                Ok(event) => self.accept(event, &mut on_fragment),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.worker_vanished(),
            }
        }
        self.outcome.clone()
    }

    /// Wait for the next fragment; `None` once the request is terminal
    pub async fn next_fragment(&mut self) -> Option<String> {
        while self.outcome.is_none() {
            let mut fragment = None;
            match self.events.recv().await {
                Some(event) => self.accept(event, &mut |f: &str| fragment = Some(f.to_string())),
                None => self.worker_vanished(),
            }
            if fragment.is_some() {
                return fragment;
            }
        }
        None
    }

    /// Wait for the terminal state, handing fragments to `on_fragment`
    pub async fn finish<F>(mut self, mut on_fragment: F) -> GenerationOutcome
    where
        F: FnMut(&str),
    {
        while self.outcome.is_none() {
            match self.events.recv().await {
                Some(event) => self.accept(event, &mut on_fragment),
                None => self.worker_vanished(),
            }
        }
        self.outcome.take().unwrap_or(GenerationOutcome::Cancelled { fragments: 0 })
    }

    fn accept(&mut self, event: StreamEvent, on_fragment: &mut dyn FnMut(&str)) {
        match event {
            StreamEvent::Fragment(fragment) => {
                if self.cancel.is_cancelled() {
                    tracing::trace!(request_id = %self.id, "Dropping fragment queued before cancellation");
                    return;
                }
                self.delivered += 1;
                on_fragment(&fragment);
            }
            StreamEvent::Finished(outcome) => {
                let outcome = match outcome {
                    GenerationOutcome::Completed(_) if self.cancel.is_cancelled() => {
                        GenerationOutcome::Cancelled {
                            fragments: self.delivered,
                        }
                    }
                    other => other,
                };
                self.outcome = Some(outcome);
            }
        }
    }

    fn worker_vanished(&mut self) {
        tracing::error!(request_id = %self.id, "Generation worker exited without a result");
        self.outcome = Some(GenerationOutcome::Failed {
            reason: "generation worker exited without a result".to_string(),
            partial: String::new(),
        });
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            // Nobody is listening any more
            self.cancel.cancel();
        }
    }
}
