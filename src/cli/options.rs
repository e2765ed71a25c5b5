use clap::Args;
use std::path::PathBuf;

use crate::config::Settings;

/// Logging options shared by every command
#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    /// Default log level; RUST_LOG takes precedence
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "warn", global = true)]
    pub log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long = "log-file", value_name = "FILE", global = true)]
    pub log_file: Option<PathBuf>,
}

/// Engine overrides applied on top of the loaded configuration
#[derive(Args, Debug, Clone, Default)]
pub struct EngineArgs {
    /// GGUF model file
    #[arg(short, long, value_name = "FILE")]
    pub model: Option<PathBuf>,

    /// Fixed sampling seed for both roles
    #[arg(long)]
    pub seed: Option<u32>,

    /// Layers offloaded to the GPU
    #[arg(long = "gpu-layers", value_name = "N")]
    pub gpu_layers: Option<u32>,

    /// CPU threads used for generation
    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,

    /// Replay canned replies instead of running a model
    #[arg(long)]
    pub scripted: bool,
}

impl EngineArgs {
    /// Command-line values win over every other source
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(model) = &self.model {
            settings.model.path = model.clone();
        }
        if let Some(seed) = self.seed {
            settings.riddler.sampling.seed = Some(seed);
            settings.grader.sampling.seed = Some(seed);
        }
        if let Some(gpu_layers) = self.gpu_layers {
            settings.model.gpu_layers = gpu_layers;
        }
        if let Some(threads) = self.threads {
            settings.model.threads = Some(threads);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_args_override_settings() {
        let mut settings = Settings::defaults().expect("test: defaults");
        let args = EngineArgs {
            model: Some(PathBuf::from("/models/small.gguf")),
            seed: Some(42),
            gpu_layers: Some(12),
            threads: None,
            scripted: false,
        };
        args.apply(&mut settings);

        assert_eq!(settings.model.path, PathBuf::from("/models/small.gguf"));
        assert_eq!(settings.riddler.sampling.seed, Some(42));
        assert_eq!(settings.grader.sampling.seed, Some(42));
        assert_eq!(settings.model.gpu_layers, 12);
        assert_eq!(settings.model.threads, None);
    }
}
