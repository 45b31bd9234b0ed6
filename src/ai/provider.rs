use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::settings::{GenerationModelConfig, GenerationProviderKind, HardwareConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    /// Invalid path, unreadable format, unreachable model host or
    /// unavailable acceleration. Never retried with a fallback here.
    #[error("{0}")]
    ModelLoad(String),

    #[error("model is not loaded")]
    NotLoaded,

    #[error("generation request failed: {0}")]
    Request(String),

    #[error("generation stream failed: {0}")]
    Stream(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),
}

/// One generation backend. Aborting is signalled through the
/// `CancellationToken` handed to [`stream_generate`].
///
/// [`stream_generate`]: GenerationBackend::stream_generate
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, config: &GenerationModelConfig, hardware: &HardwareConfig) -> Result<(), GenerationError>;

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, GenerationError>;

    fn detokenize(&self, tokens: &[u32]) -> Result<String, GenerationError>;

    /// Streams the completion of `messages` into `deltas`, in generation
    /// order. Returns once the model stops, fails, or `cancel` fires.
    async fn stream_generate(
        &self,
        messages: &[ChatMessage],
        cancel: CancellationToken,
        deltas: UnboundedSender<String>,
    ) -> Result<(), GenerationError>;

    async fn unload(&self);
}

pub type BackendFactory =
    Arc<dyn Fn(&GenerationModelConfig) -> Result<Arc<dyn GenerationBackend>, GenerationError> + Send + Sync>;

/// Selects the backend by the configured provider kind.
pub fn build_backend(config: &GenerationModelConfig) -> Result<Arc<dyn GenerationBackend>, GenerationError> {
    let backend: Arc<dyn GenerationBackend> = match config.provider {
        GenerationProviderKind::OpenAi => Arc::new(super::remote::RemoteBackend::new()),
        GenerationProviderKind::Ollama => Arc::new(super::ollama::OllamaBackend::new()),
        #[cfg(feature = "llama-cpp")]
        GenerationProviderKind::LlamaCpp => Arc::new(super::llama_cpp::LlamaCppBackend::new()),
        #[cfg(not(feature = "llama-cpp"))]
        GenerationProviderKind::LlamaCpp => {
            return Err(GenerationError::ModelLoad(
                "local GGUF models need a build with the `llama-cpp` feature".to_string(),
            ))
        }
    };
    Ok(backend)
}

pub fn default_backend_factory() -> BackendFactory {
    Arc::new(build_backend)
}

/// HTTP backends have no tokenizer of their own; UTF-8 bytes are
/// reversible and never undercount for length accounting.
pub(crate) fn byte_tokenize(text: &str) -> Vec<u32> {
    text.bytes().map(u32::from).collect()
}

pub(crate) fn byte_detokenize(tokens: &[u32]) -> Result<String, GenerationError> {
    let bytes = tokens
        .iter()
        .map(|&t| u8::try_from(t).map_err(|_| GenerationError::Tokenize(format!("token {} is not a byte", t))))
        .collect::<Result<Vec<u8>, _>>()?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Waits for `pending` (the response head or the next body chunk),
/// failing once the server has been silent for `idle`. A long generation
/// that keeps streaming is never cut off.
pub(crate) async fn within_idle<F: Future>(idle: Duration, pending: F) -> Result<F::Output, GenerationError> {
    tokio::time::timeout(idle, pending)
        .await
        .map_err(|_| GenerationError::Stream(format!("no data from the server for {}s", idle.as_secs_f32())))
}

pub(crate) async fn next_within<S>(stream: &mut S, idle: Duration) -> Result<Option<S::Item>, GenerationError>
where
    S: Stream + Unpin,
{
    within_idle(idle, stream.next()).await
}

/// Splits a byte stream into complete lines; partial lines and split
/// UTF-8 sequences wait for the next chunk.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Whatever is left once the stream ends without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = String::from_utf8_lossy(&rest).trim().to_string();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_joins_split_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        let lines = buffer.push(b": 1}\r\n\r\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\": 1}", "data: [DONE]"]);
        assert!(buffer.finish().is_none());

        let snowman = "☃".as_bytes();
        assert!(buffer.push(&snowman[..1]).is_empty());
        assert_eq!(buffer.push(&[&snowman[1..], b"\n"].concat()), vec!["☃"]);
    }

    #[test]
    fn test_byte_tokens_round_trip() {
        let tokens = byte_tokenize("héllo");
        assert_eq!(tokens.len(), 6);
        assert_eq!(byte_detokenize(&tokens).unwrap(), "héllo");
        assert!(byte_detokenize(&[300]).is_err());
    }

    #[cfg(not(feature = "llama-cpp"))]
    #[test]
    fn test_llama_cpp_requires_feature() {
        let config = GenerationModelConfig {
            provider: GenerationProviderKind::LlamaCpp,
            ..GenerationModelConfig::default()
        };
        assert!(matches!(build_backend(&config), Err(GenerationError::ModelLoad(_))));
    }

    #[tokio::test]
    async fn test_idle_timeout_spans_one_chunk_not_the_stream() {
        let ticks = futures::stream::unfold(0u32, |n| async move {
            if n == 5 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
            Some((n, n + 1))
        });
        let mut ticks = Box::pin(ticks);
        let idle = Duration::from_millis(150);

        let mut seen = Vec::new();
        while let Some(n) = next_within(&mut ticks, idle).await.unwrap() {
            seen.push(n);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        let mut silent = Box::pin(futures::stream::pending::<u32>());
        let err = next_within(&mut silent, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, GenerationError::Stream(_)));
    }
}
