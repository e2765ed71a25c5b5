//! LLama.cpp backend for GGUF weights

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use llama_cpp_2::{
    context::params::LlamaContextParams,
    context::LlamaContext,
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel},
    sampling::LlamaSampler,
};

use super::{
    ContextParams, FragmentStream, InferenceContext, LoadedModel, ModelBackend, ModelInfo,
    ModelParams, SamplingConfig,
};
use crate::error::{Error, LoadError, Result};

/// Process-wide llama.cpp backend. Initialize it once.
pub struct LlamaCppBackend {
    backend: Arc<LlamaBackend>,
}

impl LlamaCppBackend {
    pub fn new() -> Result<Self> {
        let backend = LlamaBackend::init().map_err(|e| LoadError::NativeInit(e.to_string()))?;
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

impl ModelBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Arc<dyn LoadedModel>> {
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| LoadError::NativeInit(format!("failed to load {}: {}", path.display(), e)))?;

        let trained = model.n_ctx_train();
        if params.context_size > trained {
            tracing::warn!(
                requested = params.context_size,
                trained,
                "Context size exceeds the model's training context"
            );
        }

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model")
            .to_string();

        Ok(Arc::new(LoadedLlama {
            model,
            backend: self.backend.clone(),
            name,
            params: params.clone(),
        }))
    }
}

// Field order matters: the model is freed before the backend
struct LoadedLlama {
    model: LlamaModel,
    backend: Arc<LlamaBackend>,
    name: String,
    params: ModelParams,
}

impl LoadedModel for LoadedLlama {
    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.name.clone(),
            backend: "llama.cpp".to_string(),
            context_size: self.params.context_size,
            gpu_layers: self.params.gpu_layers,
        }
    }

    fn create_context(self: Arc<Self>, params: &ContextParams) -> Result<Box<dyn InferenceContext>> {
        if params.context_size == 0 || params.batch_size == 0 {
            return Err(Error::Validation(
                "context and batch size must be positive".to_string(),
            ));
        }
        Ok(Box::new(LlamaSessionContext {
            loaded: self,
            params: params.clone(),
        }))
    }
}

/// Per-session state: the loaded weights and this session's context settings.
///
/// No native `LlamaContext` lives here between exchanges. One is built for
/// every generation and dropped with its fragment stream, so the KV cache
/// never outlives an exchange. Sessions reset their history before each
/// submit, so there is no prefix to reuse. A context kept here would borrow
/// `loaded.model` from the same struct.
struct LlamaSessionContext {
    loaded: Arc<LoadedLlama>,
    params: ContextParams,
}

impl LlamaSessionContext {
    fn native_params(&self) -> LlamaContextParams {
        let threads = i32::try_from(self.params.threads).unwrap_or(i32::MAX);
        LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(self.params.context_size))
            .with_n_batch(self.params.batch_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads)
    }
}

impl InferenceContext for LlamaSessionContext {
    fn context_size(&self) -> u32 {
        self.params.context_size
    }

    fn generate<'a>(&'a mut self, prompt: &str, sampling: &SamplingConfig) -> Result<FragmentStream<'a>> {
        let model = &self.loaded.model;
        let tokens = model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| Error::Generation(format!("failed to tokenize prompt: {}", e)))?;

        let n_ctx = self.params.context_size as usize;
        if tokens.len() >= n_ctx {
            return Err(Error::Generation(format!(
                "prompt of {} tokens does not fit a {} token context",
                tokens.len(),
                n_ctx
            )));
        }

        let mut ctx = model
            .new_context(&self.loaded.backend, self.native_params())
            .map_err(|e| Error::Generation(format!("failed to create context: {}", e)))?;

        let n_batch = (self.params.batch_size as usize).max(1);
        for chunk in tokens.chunks(n_batch) {
            let mut batch = LlamaBatch::get_one(chunk)
                .map_err(|e| Error::Generation(format!("failed to create batch: {}", e)))?;
            ctx.decode(&mut batch)
                .map_err(|e| Error::Generation(format!("prompt decode failed: {}", e)))?;
        }

        tracing::debug!(
            label = %self.params.label,
            prompt_tokens = tokens.len(),
            "Prompt decoded"
        );

        Ok(Box::new(LlamaFragments {
            model,
            ctx,
            sampler: build_sampler(sampling),
            decoder: encoding_rs::UTF_8.new_decoder(),
            remaining: sampling.max_tokens.min(n_ctx - tokens.len()),
            done: false,
        }))
    }
}

fn build_sampler(sampling: &SamplingConfig) -> LlamaSampler {
    let mut samplers = Vec::new();

    if sampling.repeat_penalty != 1.0 {
        samplers.push(LlamaSampler::penalties(
            sampling.penalty_window,
            sampling.repeat_penalty,
            0.0,
            0.0,
        ));
    }

    if sampling.temperature <= 0.0 {
        samplers.push(LlamaSampler::greedy());
    } else {
        if sampling.top_k > 0 {
            samplers.push(LlamaSampler::top_k(sampling.top_k));
        }
        samplers.push(LlamaSampler::top_p(sampling.top_p, 1));
        samplers.push(LlamaSampler::temp(sampling.temperature));
        samplers.push(LlamaSampler::dist(sampling.seed.unwrap_or_else(random_seed)));
    }

    LlamaSampler::chain_simple(samplers)
}

fn random_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ d.as_secs() as u32)
        .unwrap_or(0)
}

/// One token per step; empty pieces are folded into the next fragment
struct LlamaFragments<'a> {
    model: &'a LlamaModel,
    ctx: LlamaContext<'a>,
    sampler: LlamaSampler,
    decoder: encoding_rs::Decoder,
    remaining: usize,
    done: bool,
}

impl LlamaFragments<'_> {
    fn fail(&mut self, msg: String) -> Option<Result<String>> {
        self.done = true;
        Some(Err(Error::Generation(msg)))
    }
}

impl Iterator for LlamaFragments<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && self.remaining > 0 {
            let token = self.sampler.sample(&self.ctx, -1);
            self.sampler.accept(token);

            if self.model.is_eog_token(token) {
                self.done = true;
                return None;
            }
            self.remaining -= 1;

            let piece = match self.model.token_to_piece(token, &mut self.decoder, true, None) {
                Ok(piece) => piece,
                Err(e) => return self.fail(format!("failed to decode token: {}", e)),
            };

            let next = [token];
            let mut batch = match LlamaBatch::get_one(&next) {
                Ok(batch) => batch,
                Err(e) => return self.fail(format!("failed to create batch: {}", e)),
            };
            if let Err(e) = self.ctx.decode(&mut batch) {
                return self.fail(format!("decode failed: {}", e));
            }

            if !piece.is_empty() {
                return Some(Ok(piece));
            }
        }
        None
    }
}
