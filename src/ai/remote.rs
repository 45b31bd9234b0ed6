use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
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
struct RemoteTarget {
    http: reqwest::Client,
    // longest silence tolerated between response chunks
    idle: Duration,
    url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: usize,
    temperature: f32,
}

/// OpenAI-compatible `/chat/completions` with server-sent events.
pub struct RemoteBackend {
    target: RwLock<Option<RemoteTarget>>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl RemoteBackend {
    pub fn new() -> Self {
        Self {
            target: RwLock::new(None),
        }
    }

    fn target(&self) -> Result<RemoteTarget, GenerationError> {
        self.target
            .read()
            .map_err(|_| GenerationError::NotLoaded)?
            .clone()
            .ok_or(GenerationError::NotLoaded)
    }
}

impl Default for RemoteBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Content delta of one SSE line; `None` for keep-alives, role-only
/// chunks and the `[DONE]` sentinel.
fn parse_sse_line(line: &str) -> Result<Option<String>, GenerationError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }
    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|e| GenerationError::Stream(format!("malformed chunk {:?}: {}", data, e)))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

fn is_done(line: &str) -> bool {
    line.strip_prefix("data:").map(str::trim) == Some("[DONE]")
}

#[async_trait]
impl GenerationBackend for RemoteBackend {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn load(&self, config: &GenerationModelConfig, _hardware: &HardwareConfig) -> Result<(), GenerationError> {
        let base = reqwest::Url::parse(config.endpoint.trim_end_matches('/'))
            .map_err(|e| GenerationError::ModelLoad(format!("invalid endpoint {:?}: {}", config.endpoint, e)))?;
        if config.model.trim().is_empty() {
            return Err(GenerationError::ModelLoad("no model name configured".to_string()));
        }

        let idle = Duration::from_secs(config.timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .connect_timeout(idle.min(CONNECT_TIMEOUT))
            .build()
            .map_err(|e| GenerationError::ModelLoad(format!("failed to build http client: {}", e)))?;

        let target = RemoteTarget {
            http,
            idle,
            url: format!("{}/chat/completions", base.as_str().trim_end_matches('/')),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        };
        info!("Using remote model {} at {}", target.model, target.url);
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
        let body = serde_json::json!({
            "model": target.model,
            "messages": messages,
            "stream": true,
            "max_tokens": target.max_tokens,
            "temperature": target.temperature,
        });

        let mut request = target.http.post(&target.url).json(&body);
        if let Some(key) = &target.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            response = within_idle(target.idle, request.send()) => {
                response?.map_err(|e| GenerationError::Request(e.to_string()))?
            }
        };
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::Request(format!("server returned {}: {}", status, text)));
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Remote generation cancelled");
                    return Ok(());
                }
                chunk = next_within(&mut stream, target.idle) => chunk?,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| GenerationError::Stream(e.to_string()))?;

            for line in lines.push(&chunk) {
                if is_done(&line) {
                    return Ok(());
                }
                if let Some(delta) = parse_sse_line(&line)? {
                    if deltas.send(delta).is_err() {
                        return Ok(());
                    }
                }
            }
        }

        if let Some(line) = lines.finish() {
            if !is_done(&line) {
                if let Some(delta) = parse_sse_line(&line)? {
                    let _ = deltas.send(delta);
                }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_content_and_keepalives() {
        let line = r#"data: {"id":"1","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap(), Some("Hel".to_string()));

        let role_only = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(role_only).unwrap(), None);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), None);
        assert!(is_done("data: [DONE]"));
        assert!(parse_sse_line("data: {broken").is_err());
    }

    #[tokio::test]
    async fn test_load_rejects_bad_endpoint() {
        let backend = RemoteBackend::new();
        let config = GenerationModelConfig {
            endpoint: "not a url".to_string(),
            ..GenerationModelConfig::default()
        };
        let err = backend.load(&config, &HardwareConfig::default()).await.unwrap_err();
        assert!(matches!(err, GenerationError::ModelLoad(_)));
    }

    #[tokio::test]
    async fn test_generate_before_load_fails() {
        let backend = RemoteBackend::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let err = backend
            .stream_generate(&[ChatMessage::user("hi")], CancellationToken::new(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::NotLoaded));
    }
}
