//! Runtime abstraction layer for local text-generation engines
//!
//! The engine itself (tokenization, weights, sampling math) is consumed as an
//! opaque capability: given a prompt and a sampling configuration it produces
//! a lazy sequence of text fragments. This module defines that seam:
//! - `ModelBackend`: loads weights into a `LoadedModel`
//! - `LoadedModel`: immutable, shareable weights that create contexts
//! - `InferenceContext`: per-session execution state that generates fragments

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::constants::defaults;
use crate::error::{Error, Result};

#[cfg(feature = "llama")]
pub mod llamacpp; // llama.cpp backend for GGUF weights
pub mod model; // Model handle lifecycle
pub mod scripted; // Deterministic in-process backend
pub mod template; // Chat and prompt templates

pub use model::ModelHandle;
pub use scripted::{FragmentGate, ScriptedBackend, ScriptedReply};
pub use template::{ChatMessage, ChatTemplate, PromptTemplate};

/// Lazy, pull-based sequence of generated text fragments.
///
/// Each `next()` may block on native computation; the sequence is consumed on
/// the worker that created it.
pub type FragmentStream<'a> = Box<dyn Iterator<Item = Result<String>> + 'a>;

/// Loads model weights. Implemented once per engine.
pub trait ModelBackend: Send + Sync {
    /// Short engine name used in logs and `ModelInfo`
    fn name(&self) -> &str;

    /// Load weights from `path`. Blocking; may take seconds.
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Arc<dyn LoadedModel>>;
}

/// Loaded, immutable weights shared read-only by every context.
pub trait LoadedModel: Send + Sync {
    /// Describe the loaded model
    fn info(&self) -> ModelInfo;

    /// Create an independent execution context bound to these weights.
    ///
    /// The context keeps the `Arc` alive, so weights always outlive contexts.
    fn create_context(self: Arc<Self>, params: &ContextParams) -> Result<Box<dyn InferenceContext>>;
}

/// Per-session execution state with its own cache and sequence state.
pub trait InferenceContext: Send {
    /// Context window in tokens
    fn context_size(&self) -> u32;

    /// Start generating from `prompt`. Fragments are produced lazily.
    fn generate<'a>(&'a mut self, prompt: &str, sampling: &SamplingConfig) -> Result<FragmentStream<'a>>;
}

/// Parameters for loading weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Context window the model will be asked to support
    pub context_size: u32,
    /// Layers offloaded to the GPU (0 = CPU only)
    pub gpu_layers: u32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            context_size: defaults::CONTEXT_SIZE,
            gpu_layers: 0,
        }
    }
}

/// Parameters for creating an inference context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextParams {
    /// Owner label, used in logs
    pub label: String,
    /// Context window in tokens
    pub context_size: u32,
    /// Prompt batch size
    pub batch_size: u32,
    /// CPU threads used for generation
    pub threads: usize,
}

impl ContextParams {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            context_size: defaults::CONTEXT_SIZE,
            batch_size: defaults::BATCH_SIZE,
            threads: num_cpus::get_physical(),
        }
    }

    pub fn with_context_size(mut self, context_size: u32) -> Self {
        self.context_size = context_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}

/// Sampling configuration for one role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature (0.0 = greedy)
    pub temperature: f32,
    /// Nucleus sampling threshold
    pub top_p: f32,
    /// Top-k sampling parameter
    pub top_k: i32,
    /// Repetition penalty (1.0 = no penalty)
    pub repeat_penalty: f32,
    /// Number of recent tokens the repetition penalty looks at
    pub penalty_window: i32,
    /// Maximum tokens to generate
    pub max_tokens: usize,
    /// Random seed; `None` lets the backend choose
    #[serde(default)]
    pub seed: Option<u32>,
    /// Generation stops once the accumulated text contains any of these
    #[serde(default)]
    pub stop_markers: Vec<String>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            penalty_window: 64,
            max_tokens: 256,
            seed: None,
            stop_markers: Vec::new(),
        }
    }
}

impl SamplingConfig {
    /// Reject values no engine can honour
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::Validation(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::Validation(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.top_k < 0 {
            return Err(Error::Validation(format!("top_k must be >= 0, got {}", self.top_k)));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return Err(Error::Validation(format!(
                "repeat_penalty must be positive, got {}",
                self.repeat_penalty
            )));
        }
        if self.max_tokens == 0 {
            return Err(Error::Validation("max_tokens must be at least 1".to_string()));
        }
        if self.stop_markers.iter().any(|m| m.is_empty()) {
            return Err(Error::Validation("stop markers must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn with_stop_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_markers = markers.into_iter().map(Into::into).collect();
        self
    }
}

/// Model information structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub backend: String,
    pub context_size: u32,
    pub gpu_layers: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sampling_is_valid() {
        assert!(SamplingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_sampling_validation() {
        let bad_top_p = SamplingConfig {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(matches!(bad_top_p.validate(), Err(Error::Validation(_))));

        let bad_temp = SamplingConfig {
            temperature: f32::NAN,
            ..Default::default()
        };
        assert!(bad_temp.validate().is_err());

        let no_tokens = SamplingConfig {
            max_tokens: 0,
            ..Default::default()
        };
        assert!(no_tokens.validate().is_err());

        let empty_marker = SamplingConfig::default().with_stop_markers([""]);
        assert!(empty_marker.validate().is_err());
    }

    #[test]
    fn test_context_params_builder() {
        let params = ContextParams::new("riddler")
            .with_context_size(1024)
            .with_batch_size(64)
            .with_threads(2);
        assert_eq!(params.label, "riddler");
        assert_eq!(params.context_size, 1024);
        assert_eq!(params.batch_size, 64);
        assert_eq!(params.threads, 2);
    }
}
