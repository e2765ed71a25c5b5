//! Configuration management for riddler.
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Default configuration (embedded in binary)
//! 2. User-specified configuration file
//! 3. Environment variables (prefixed with `RIDDLER`, `__` between sections)
//! 4. Command-line arguments (applied by the CLI)
//!
//! # Environment Variables
//!
//! - `RIDDLER__MODEL__PATH` - GGUF model file
//! - `RIDDLER__MODEL__GPU_LAYERS` - Layers offloaded to the GPU
//! - `RIDDLER__RIDDLER__SAMPLING__SEED` - Fixed seed for riddle generation

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::runtime::{ChatTemplate, ContextParams, ModelParams, PromptTemplate, SamplingConfig};
use crate::session::Role;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub model: ModelSettings,
    pub chat: ChatSettings,
    pub riddler: RoleSettings,
    pub grader: RoleSettings,
}

/// Model file and engine parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// GGUF model file
    pub path: PathBuf,
    /// Context window in tokens
    pub context_size: u32,
    /// Layers offloaded to the GPU
    #[serde(default)]
    pub gpu_layers: u32,
    /// Prompt batch size
    pub batch_size: u32,
    /// CPU threads; defaults to the physical core count
    #[serde(default)]
    pub threads: Option<usize>,
}

/// Chat template and the turn-boundary markers it produces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSettings {
    pub template: String,
    #[serde(default)]
    pub turn_markers: Vec<String>,
}

/// Per-role preamble, prompt and sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSettings {
    /// Fixed instruction text the history resets to
    pub preamble: String,
    /// User message (riddler) or jinja prompt template (grader)
    pub prompt: String,
    pub sampling: SamplingConfig,
}

impl Settings {
    /// Embedded defaults only
    pub fn defaults() -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Load configuration from all sources
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml));

        if let Some(path) = path {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RIDDLER")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("chat.turn_markers")
                .with_list_parse_key("riddler.sampling.stop_markers")
                .with_list_parse_key("grader.sampling.stop_markers")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that cannot produce a working core
    pub fn validate(&self) -> Result<()> {
        if self.model.context_size == 0 {
            return Err(Error::Config("model.context_size must be positive".to_string()));
        }
        if self.model.batch_size == 0 {
            return Err(Error::Config("model.batch_size must be positive".to_string()));
        }
        if self.model.threads == Some(0) {
            return Err(Error::Config("model.threads must be positive".to_string()));
        }
        ChatTemplate::new(self.chat.template.as_str())?;
        PromptTemplate::new(self.grader.prompt.as_str())?;
        for role in [Role::Riddler, Role::Grader] {
            let settings = self.role(role);
            if settings.prompt.trim().is_empty() {
                return Err(Error::Config(format!("{}.prompt must not be empty", role)));
            }
            settings
                .sampling
                .validate()
                .map_err(|e| Error::Config(format!("{}.sampling: {}", role, e)))?;
        }
        Ok(())
    }

    pub fn role(&self, role: Role) -> &RoleSettings {
        match role {
            Role::Riddler => &self.riddler,
            Role::Grader => &self.grader,
        }
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            context_size: self.model.context_size,
            gpu_layers: self.model.gpu_layers,
        }
    }

    pub fn context_params(&self, role: Role) -> ContextParams {
        let params = ContextParams::new(role.as_str())
            .with_context_size(self.model.context_size)
            .with_batch_size(self.model.batch_size);
        match self.model.threads {
            Some(threads) => params.with_threads(threads),
            None => params,
        }
    }

    /// Markers removed from a role's output before parsing
    pub fn strip_markers(&self, role: Role) -> Vec<String> {
        let mut markers = self.role(role).sampling.stop_markers.clone();
        for marker in &self.chat.turn_markers {
            if !markers.contains(marker) {
                markers.push(marker.clone());
            }
        }
        markers
    }
}
