//! In-process GGUF inference through llama.cpp.

use std::io::Read;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use llama_cpp_2::{
    context::params::LlamaContextParams,
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    sampling::LlamaSampler,
    token::LlamaToken,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::provider::{ChatMessage, GenerationBackend, GenerationError, Role};
use crate::config::settings::{GenerationModelConfig, HardwareConfig};

const GPU_LAYERS_ALL: u32 = 100;

struct Loaded {
    model: Arc<LlamaModel>,
    context_length: u32,
    max_tokens: usize,
    temperature: f32,
}

pub struct LlamaCppBackend {
    loaded: RwLock<Option<Loaded>>,
}

/// llama.cpp may only be initialised once per process.
fn backend() -> Result<&'static LlamaBackend, GenerationError> {
    static BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();
    BACKEND
        .get_or_init(|| LlamaBackend::init().map_err(|e| format!("{:?}", e)))
        .as_ref()
        .map_err(|e| GenerationError::ModelLoad(format!("failed to initialize llama.cpp: {}", e)))
}

fn check_gguf(path: &Path) -> Result<(), GenerationError> {
    let mut magic = [0u8; 4];
    std::fs::File::open(path)
        .and_then(|mut file| file.read_exact(&mut magic))
        .map_err(|e| GenerationError::ModelLoad(format!("cannot read model {}: {}", path.display(), e)))?;
    if &magic != b"GGUF" {
        return Err(GenerationError::ModelLoad(format!(
            "{} is not a GGUF model file",
            path.display()
        )));
    }
    Ok(())
}

fn check_hardware(hardware: &HardwareConfig) -> Result<(), GenerationError> {
    if hardware.use_cuda && !cfg!(feature = "llama-cpp-cuda") {
        return Err(GenerationError::ModelLoad(
            "CUDA was requested but this build has no CUDA support".to_string(),
        ));
    }
    if hardware.use_vulkan {
        return Err(GenerationError::ModelLoad(
            "Vulkan was requested but this build has no Vulkan support".to_string(),
        ));
    }
    Ok(())
}

/// ChatML, understood by most instruction-tuned GGUF models.
fn render_chatml(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        prompt.push_str("<|im_start|>");
        prompt.push_str(role);
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

impl LlamaCppBackend {
    pub fn new() -> Self {
        Self {
            loaded: RwLock::new(None),
        }
    }

    fn model(&self) -> Result<(Arc<LlamaModel>, u32, usize, f32), GenerationError> {
        let guard = self.loaded.read().map_err(|_| GenerationError::NotLoaded)?;
        let loaded = guard.as_ref().ok_or(GenerationError::NotLoaded)?;
        Ok((
            Arc::clone(&loaded.model),
            loaded.context_length,
            loaded.max_tokens,
            loaded.temperature,
        ))
    }
}

impl Default for LlamaCppBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    async fn load(&self, config: &GenerationModelConfig, hardware: &HardwareConfig) -> Result<(), GenerationError> {
        let path = config
            .local_path
            .clone()
            .ok_or_else(|| GenerationError::ModelLoad("no local model path configured".to_string()))?;
        check_hardware(hardware)?;
        let gpu_layers = if hardware.use_gpu { GPU_LAYERS_ALL } else { 0 };

        let model = tokio::task::spawn_blocking(move || {
            check_gguf(&path)?;
            let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
            LlamaModel::load_from_file(backend()?, &path, &params)
                .map_err(|e| GenerationError::ModelLoad(format!("failed to load {}: {:?}", path.display(), e)))
        })
        .await
        .map_err(|e| GenerationError::ModelLoad(format!("model load task failed: {}", e)))??;

        info!(
            "Loaded GGUF model (context {}, gpu layers {})",
            config.context_length, gpu_layers
        );
        *self.loaded.write().map_err(|_| GenerationError::NotLoaded)? = Some(Loaded {
            model: Arc::new(model),
            context_length: config.context_length.max(1) as u32,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        });
        Ok(())
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, GenerationError> {
        let (model, ..) = self.model()?;
        let tokens = model
            .str_to_token(text, AddBos::Never)
            .map_err(|e| GenerationError::Tokenize(format!("{:?}", e)))?;
        Ok(tokens.into_iter().map(|t| t.0 as u32).collect())
    }

    fn detokenize(&self, tokens: &[u32]) -> Result<String, GenerationError> {
        let (model, ..) = self.model()?;
        let mut text = String::new();
        for &token in tokens {
            let piece = model
                .token_to_str(LlamaToken(token as i32), Special::Plaintext)
                .map_err(|e| GenerationError::Tokenize(format!("{:?}", e)))?;
            text.push_str(&piece);
        }
        Ok(text)
    }

    async fn stream_generate(
        &self,
        messages: &[ChatMessage],
        cancel: CancellationToken,
        deltas: UnboundedSender<String>,
    ) -> Result<(), GenerationError> {
        let (model, context_length, max_tokens, temperature) = self.model()?;
        let prompt = render_chatml(messages);

        tokio::task::spawn_blocking(move || {
            let backend = backend()?;
            let prompt_tokens = model
                .str_to_token(&prompt, AddBos::Always)
                .map_err(|e| GenerationError::Tokenize(format!("{:?}", e)))?;
            if prompt_tokens.len() >= context_length as usize {
                return Err(GenerationError::Request(format!(
                    "prompt of {} tokens does not fit the {} token context",
                    prompt_tokens.len(),
                    context_length
                )));
            }

            let params = LlamaContextParams::default()
                .with_n_ctx(NonZeroU32::new(context_length))
                .with_n_batch(context_length);
            let mut context = model
                .new_context(backend, params)
                .map_err(|e| GenerationError::Request(format!("failed to create context: {:?}", e)))?;

            let mut batch = LlamaBatch::new(context_length as usize, 1);
            let last = prompt_tokens.len() - 1;
            for (i, &token) in prompt_tokens.iter().enumerate() {
                batch
                    .add(token, i as i32, &[0], i == last)
                    .map_err(|e| GenerationError::Stream(format!("{:?}", e)))?;
            }
            context
                .decode(&mut batch)
                .map_err(|e| GenerationError::Stream(format!("decode failed: {:?}", e)))?;

            let eos = model.token_eos();
            let limit = (prompt_tokens.len() + max_tokens).min(context_length as usize);
            let mut position = prompt_tokens.len();
            let mut sampler = LlamaSampler::chain_simple([
                LlamaSampler::temp(temperature),
                LlamaSampler::top_p(0.95, 1),
                LlamaSampler::greedy(),
            ]);

            while position < limit {
                if cancel.is_cancelled() {
                    debug!("llama.cpp generation cancelled at {} tokens", position);
                    return Ok(());
                }

                let token = sampler.sample(&context, -1);
                if token == eos {
                    break;
                }
                // pieces that are not valid UTF-8 on their own are dropped
                if let Ok(piece) = model.token_to_str(token, Special::Plaintext) {
                    if !piece.is_empty() && deltas.send(piece).is_err() {
                        return Ok(());
                    }
                }

                batch.clear();
                batch
                    .add(token, position as i32, &[0], true)
                    .map_err(|e| GenerationError::Stream(format!("{:?}", e)))?;
                context
                    .decode(&mut batch)
                    .map_err(|e| GenerationError::Stream(format!("decode failed: {:?}", e)))?;
                position += 1;
            }
            Ok(())
        })
        .await
        .map_err(|e| GenerationError::Stream(format!("generation task failed: {}", e)))?
    }

    async fn unload(&self) {
        if let Ok(mut loaded) = self.loaded.write() {
            *loaded = None;
        }
    }
}
