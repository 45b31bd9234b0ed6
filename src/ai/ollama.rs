use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::provider::{
    byte_detokenize, byte_tokenize, next_within, within_idle, ChatMessage, GenerationBackend, GenerationError,
    LineBuffer,
};
use crate::config::settings::{GenerationModelConfig, HardwareConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct OllamaTarget {
    http: reqwest::Client,
    // longest silence tolerated between response chunks
    idle: Duration,
    base_url: String,
    model: String,
    options: serde_json::Value,
}

/// Local Ollama daemon, `/api/chat` streaming newline-delimited JSON.
pub struct OllamaBackend {
    target: RwLock<Option<OllamaTarget>>,
}

#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
}

impl OllamaBackend {
    pub fn new() -> Self {
        Self {
            target: RwLock::new(None),
        }
    }

    fn target(&self) -> Result<OllamaTarget, GenerationError> {
        self.target
            .read()
            .map_err(|_| GenerationError::NotLoaded)?
            .clone()
            .ok_or(GenerationError::NotLoaded)
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn model_options(config: &GenerationModelConfig, hardware: &HardwareConfig) -> serde_json::Value {
    let mut options = serde_json::json!({
        "num_ctx": config.context_length,
        "num_predict": config.max_tokens,
        "temperature": config.temperature,
    });
    if !hardware.use_gpu {
        options["num_gpu"] = serde_json::json!(0);
    }
    options
}

enum Parsed {
    Delta(String),
    Done,
    Skip,
}

fn parse_line(line: &str) -> Result<Parsed, GenerationError> {
    let parsed: ChatLine = serde_json::from_str(line)
        .map_err(|e| GenerationError::Stream(format!("malformed line {:?}: {}", line, e)))?;
    if let Some(error) = parsed.error {
        return Err(GenerationError::Stream(error));
    }
    let content = parsed.message.map(|m| m.content).unwrap_or_default();
    Ok(match (content.is_empty(), parsed.done) {
        (false, _) => Parsed::Delta(content),
        (true, true) => Parsed::Done,
        (true, false) => Parsed::Skip,
    })
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn load(&self, config: &GenerationModelConfig, hardware: &HardwareConfig) -> Result<(), GenerationError> {
        if hardware.use_cuda || hardware.use_vulkan {
            // the daemon picks its own accelerator, it cannot be forced from here
            debug!("Ollama ignores explicit CUDA/Vulkan requests");
        }

        let idle = Duration::from_secs(config.timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .connect_timeout(idle.min(CONNECT_TIMEOUT))
            .build()
            .map_err(|e| GenerationError::ModelLoad(format!("failed to build http client: {}", e)))?;
        let base_url = config.endpoint.trim_end_matches('/').to_string();

        let show = http
            .post(format!("{}/api/show", base_url))
            .json(&serde_json::json!({ "model": config.model }))
            .send();
        let response = within_idle(idle, show)
            .await
            .map_err(|e| GenerationError::ModelLoad(format!("Ollama at {} did not answer: {}", base_url, e)))?
            .map_err(|e| GenerationError::ModelLoad(format!("Ollama at {} is not reachable: {}", base_url, e)))?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(GenerationError::ModelLoad(format!(
                    "model '{}' is not pulled in Ollama",
                    config.model
                )))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(GenerationError::ModelLoad(format!(
                    "Ollama returned {} for model '{}': {}",
                    status, config.model, body
                )));
            }
        }

        info!("Ollama model {} ready at {}", config.model, base_url);
        let target = OllamaTarget {
            http,
            idle,
            base_url,
            model: config.model.clone(),
            options: model_options(config, hardware),
        };
        *self.target.write().map_err(|_| GenerationError::NotLoaded)? = Some(target);
        Ok(())
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, GenerationError> {
        Ok(byte_tokenize(text))
    }

    fn detokenize(&self, tokens: &[u32]) -> Result<String, GenerationError> {
        byte_detokenize(tokens)
    }

    async fn stream_generate(
        &self,
        messages: &[ChatMessage],
        cancel: CancellationToken,
        deltas: UnboundedSender<String>,
    ) -> Result<(), GenerationError> {
        let target = self.target()?;
        let request = target
            .http
            .post(format!("{}/api/chat", target.base_url))
            .json(&serde_json::json!({
                "model": target.model,
                "messages": messages,
                "stream": true,
                "options": target.options,
            }));

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            response = within_idle(target.idle, request.send()) => {
                response?.map_err(|e| GenerationError::Request(e.to_string()))?
            }
        };
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::Request(format!("Ollama returned {}: {}", status, text)));
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = next_within(&mut stream, target.idle) => chunk?,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| GenerationError::Stream(e.to_string()))?;

            for line in lines.push(&chunk) {
                match parse_line(&line)? {
                    Parsed::Delta(delta) => {
                        if deltas.send(delta).is_err() {
                            return Ok(());
                        }
                    }
                    Parsed::Done => return Ok(()),
                    Parsed::Skip => {}
                }
            }
        }

        if let Some(line) = lines.finish() {
            if let Parsed::Delta(delta) = parse_line(&line)? {
                let _ = deltas.send(delta);
            }
        }
        Ok(())
    }

    async fn unload(&self) {
        if let Ok(mut target) = self.target.write() {
            *target = None;
        }
    }
}
