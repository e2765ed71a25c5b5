//! Deterministic in-process backend
//!
//! Plays back scripted replies fragment by fragment instead of running a
//! model. Replies are keyed by context label, so each session gets its own
//! script. Used by the test suite and by `riddler --scripted` dry runs.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use super::{
    ContextParams, FragmentStream, InferenceContext, LoadedModel, ModelBackend, ModelInfo,
    ModelParams, SamplingConfig,
};
use crate::constants::markers;
use crate::error::{Error, LoadError, Result};

/// Releases fragments of a gated reply one at a time.
///
/// Dropping the gate opens it for good.
#[derive(Debug)]
pub struct FragmentGate {
    tx: mpsc::Sender<()>,
}

impl FragmentGate {
    /// Allow `count` more fragments through
    pub fn release(&self, count: usize) {
        for _ in 0..count {
            let _ = self.tx.send(());
        }
    }

    /// Let every remaining fragment through
    pub fn open(self) {
        drop(self);
    }
}

/// One scripted generation
#[derive(Clone, Default)]
pub struct ScriptedReply {
    fragments: Vec<String>,
    fail_at: Option<(usize, String)>,
    fail_on_start: Option<String>,
    panic_at: Option<usize>,
    fragment_delay: Duration,
    gate: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
}

impl std::fmt::Debug for ScriptedReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedReply")
            .field("fragments", &self.fragments)
            .field("fail_at", &self.fail_at)
            .field("fail_on_start", &self.fail_on_start)
            .field("panic_at", &self.panic_at)
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

impl ScriptedReply {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Split `text` into word-sized fragments, keeping whitespace attached
    pub fn from_text(text: &str) -> Self {
        let mut fragments = Vec::new();
        let mut current = String::new();
        for ch in text.chars() {
            if ch.is_whitespace() && !current.trim().is_empty() {
                fragments.push(std::mem::take(&mut current));
            }
            current.push(ch);
        }
        if !current.is_empty() {
            fragments.push(current);
        }
        Self::new(fragments)
    }

    /// Raise a generation error instead of producing fragment `index`
    pub fn failing_at(mut self, index: usize, reason: impl Into<String>) -> Self {
        self.fail_at = Some((index, reason.into()));
        self
    }

    /// Reject the generation call itself
    pub fn failing_on_start(mut self, reason: impl Into<String>) -> Self {
        self.fail_on_start = Some(reason.into());
        self
    }

    /// Panic instead of producing fragment `index`
    pub fn panicking_at(mut self, index: usize) -> Self {
        self.panic_at = Some(index);
        self
    }

    /// Sleep before each fragment, standing in for compute cost
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    /// Hold every fragment until the returned gate releases it
    pub fn gated(mut self) -> (Self, FragmentGate) {
        let (tx, rx) = mpsc::channel();
        self.gate = Some(Arc::new(Mutex::new(rx)));
        (self, FragmentGate { tx })
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }
}

#[derive(Default)]
struct Script {
    queued: VecDeque<ScriptedReply>,
    rotation: Vec<ScriptedReply>,
    next: usize,
}

impl Script {
    fn next_reply(&mut self) -> Option<ScriptedReply> {
        if let Some(reply) = self.queued.pop_front() {
            return Some(reply);
        }
        if self.rotation.is_empty() {
            return None;
        }
        let reply = self.rotation[self.next % self.rotation.len()].clone();
        self.next += 1;
        Some(reply)
    }
}

type Scripts = Arc<Mutex<HashMap<String, Script>>>;

/// Backend that plays back scripted replies
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    load_failure: Option<String>,
    scripts: Scripts,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose load always fails with a native init error
    pub fn failing_load(reason: impl Into<String>) -> Self {
        Self {
            load_failure: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Canned riddles and verdicts for dry runs without a model
    pub fn demo() -> Self {
        let backend = Self::new();
        let pace = Duration::from_millis(40);
        backend.set_rotation(
            "riddler",
            [
                ("What has keys but can't open locks?", "A piano"),
                ("What gets wetter the more it dries?", "A towel"),
                ("What has a neck but no head?", "A bottle"),
            ]
            .into_iter()
            .map(|(riddle, answer)| {
                let text = format!(
                    "{} {}\n{} {}\n{}",
                    markers::RIDDLE,
                    riddle,
                    markers::ANSWER,
                    answer,
                    markers::END_RIDDLE
                );
                ScriptedReply::from_text(&text).with_delay(pace)
            }),
        );
        backend.set_rotation(
            "grader",
            [ScriptedReply::from_text(
                "Unable to judge in a scripted run - compare your answer with the one above.",
            )
            .with_delay(pace)],
        );
        backend
    }

    /// Queue a one-shot reply for contexts labelled `label`
    pub fn push_reply(&self, label: &str, reply: ScriptedReply) {
        self.scripts
            .lock()
            .entry(label.to_string())
            .or_default()
            .queued
            .push_back(reply);
    }

    /// Replies reused round-robin once the queue for `label` is empty
    pub fn set_rotation<I>(&self, label: &str, replies: I)
    where
        I: IntoIterator<Item = ScriptedReply>,
    {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(label.to_string()).or_default();
        script.rotation = replies.into_iter().collect();
        script.next = 0;
    }
}

impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Arc<dyn LoadedModel>> {
        if let Some(reason) = &self.load_failure {
            return Err(LoadError::NativeInit(reason.clone()).into());
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("scripted")
            .to_string();
        Ok(Arc::new(ScriptedModel {
            name,
            params: params.clone(),
            scripts: self.scripts.clone(),
        }))
    }
}

struct ScriptedModel {
    name: String,
    params: ModelParams,
    scripts: Scripts,
}

impl LoadedModel for ScriptedModel {
    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.name.clone(),
            backend: "scripted".to_string(),
            context_size: self.params.context_size,
            gpu_layers: self.params.gpu_layers,
        }
    }

    fn create_context(self: Arc<Self>, params: &ContextParams) -> Result<Box<dyn InferenceContext>> {
        Ok(Box::new(ScriptedContext {
            model: self,
            params: params.clone(),
        }))
    }
}

struct ScriptedContext {
    model: Arc<ScriptedModel>,
    params: ContextParams,
}

impl InferenceContext for ScriptedContext {
    fn context_size(&self) -> u32 {
        self.params.context_size
    }

    fn generate<'a>(&'a mut self, prompt: &str, sampling: &SamplingConfig) -> Result<FragmentStream<'a>> {
        let reply = self
            .model
            .scripts
            .lock()
            .get_mut(&self.params.label)
            .and_then(Script::next_reply)
            .ok_or_else(|| {
                Error::Generation(format!("no scripted reply for '{}'", self.params.label))
            })?;

        if let Some(reason) = reply.fail_on_start {
            return Err(Error::Generation(reason));
        }

        tracing::trace!(
            label = %self.params.label,
            prompt_len = prompt.len(),
            fragments = reply.fragments.len(),
            "Playing scripted reply"
        );

        Ok(Box::new(ScriptedFragments {
            fragments: reply.fragments,
            index: 0,
            max_tokens: sampling.max_tokens,
            fail_at: reply.fail_at,
            panic_at: reply.panic_at,
            delay: reply.fragment_delay,
            gate: reply.gate,
        }))
    }
}

struct ScriptedFragments {
    fragments: Vec<String>,
    index: usize,
    max_tokens: usize,
    fail_at: Option<(usize, String)>,
    panic_at: Option<usize>,
    delay: Duration,
    gate: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
}

impl Iterator for ScriptedFragments {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.fragments.len() || self.index >= self.max_tokens {
            return None;
        }
        if let Some(gate) = &self.gate {
            // A disconnected gate is open
            let _ = gate.lock().recv();
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.panic_at == Some(self.index) {
            panic!("scripted panic at fragment {}", self.index);
        }
        if let Some((at, reason)) = &self.fail_at {
            if *at == self.index {
                self.index = self.fragments.len();
                return Some(Err(Error::Generation(reason.clone())));
            }
        }
        let fragment = self.fragments[self.index].clone();
        self.index += 1;
        Some(Ok(fragment))
    }
}
