//! Model handle lifecycle
//!
//! A `ModelHandle` owns the loaded weights for the whole process. It is
//! created once by an explicit load and released once at shutdown, after
//! every context created from it has been dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

use super::{ContextParams, InferenceContext, LoadedModel, ModelBackend, ModelInfo, ModelParams};
use crate::error::{Error, LoadError, Result};

/// Owned handle to loaded model weights
pub struct ModelHandle {
    path: PathBuf,
    params: ModelParams,
    info: ModelInfo,
    model: Arc<dyn LoadedModel>,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("path", &self.path)
            .field("params", &self.params)
            .field("info", &self.info)
            .finish()
    }
}

impl ModelHandle {
    /// Load weights through `backend`. Blocking; call it off the interactive thread.
    #[instrument(name = "model.load", skip(backend, params), fields(
        backend = backend.name(),
        path = %path.display(),
        context_size = params.context_size,
        gpu_layers = params.gpu_layers
    ))]
    pub fn load(backend: &dyn ModelBackend, path: &Path, params: &ModelParams) -> Result<Self> {
        if !path.is_file() {
            tracing::error!("Model file not found: {}", path.display());
            return Err(LoadError::FileNotFound(path.to_path_buf()).into());
        }
        if params.context_size == 0 {
            return Err(LoadError::NativeInit("context size must be positive".to_string()).into());
        }

        let start = std::time::Instant::now();
        let model = backend.load_model(path, params).map_err(|e| match e {
            Error::Load(load) => Error::Load(load),
            other => Error::Load(LoadError::NativeInit(other.to_string())),
        })?;
        let info = model.info();

        tracing::info!(
            model = %info.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Loaded model"
        );

        Ok(Self {
            path: path.to_path_buf(),
            params: params.clone(),
            info,
            model,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Create an independent context; it shares the weights read-only.
    pub fn create_context(&self, params: &ContextParams) -> Result<Box<dyn InferenceContext>> {
        if params.context_size > self.params.context_size {
            tracing::warn!(
                label = %params.label,
                requested = params.context_size,
                loaded = self.params.context_size,
                "Context window exceeds the size the model was loaded for"
            );
        }
        let context = self.model.clone().create_context(params)?;
        tracing::debug!(label = %params.label, context_size = context.context_size(), "Created inference context");
        Ok(context)
    }

    /// Number of contexts still holding the weights
    pub fn live_contexts(&self) -> usize {
        Arc::strong_count(&self.model) - 1
    }

    /// Release the weights.
    ///
    /// Consumes the handle so it runs at most once. Contexts hold their own
    /// reference, so if any is still alive (a worker finishing its current
    /// fragment) the native release happens when the last one drops.
    pub fn unload(self) {
        let live = self.live_contexts();
        if live > 0 {
            tracing::warn!(
                live_contexts = live,
                "Unloading model while contexts are alive; release deferred until they drop"
            );
        } else {
            tracing::info!(model = %self.info.name, "Unloading model");
        }
        drop(self.model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ScriptedBackend;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_file_is_file_not_found() {
        let backend = ScriptedBackend::new();
        let result = ModelHandle::load(
            &backend,
            Path::new("/nonexistent/model.gguf"),
            &ModelParams::default(),
        );
        assert!(matches!(result, Err(Error::Load(LoadError::FileNotFound(_)))));
    }

    #[test]
    fn test_backend_rejection_is_native_init() {
        let file = NamedTempFile::new().expect("test: temp file");
        let backend = ScriptedBackend::failing_load("unsupported quantization");
        let result = ModelHandle::load(&backend, file.path(), &ModelParams::default());
        match result {
            Err(Error::Load(LoadError::NativeInit(msg))) => {
                assert!(msg.contains("unsupported quantization"))
            }
            other => panic!("expected NativeInit, got {:?}", other),
        }
    }

    #[test]
    fn test_contexts_keep_weights_alive() {
        let file = NamedTempFile::new().expect("test: temp file");
        let backend = ScriptedBackend::new();
        let handle = ModelHandle::load(&backend, file.path(), &ModelParams::default())
            .expect("test: load");
        assert_eq!(handle.live_contexts(), 0);

        let ctx_a = handle.create_context(&ContextParams::new("a")).expect("test: context");
        let ctx_b = handle.create_context(&ContextParams::new("b")).expect("test: context");
        assert_eq!(handle.live_contexts(), 2);

        drop(ctx_a);
        drop(ctx_b);
        assert_eq!(handle.live_contexts(), 0);
        handle.unload();
    }
}
