#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use note_vault::ai::provider::{BackendFactory, ChatMessage, GenerationBackend, GenerationError};
use note_vault::config::settings::{
    EmbeddingModelConfig, GenerationModelConfig, HardwareConfig, Settings, StorageBackend,
};
use note_vault::config::MemoryPreferenceStore;
use note_vault::vault::embeddings::{EmbedderFactory, EmbeddingError, EmbeddingProvider};
use note_vault::IndexEvent;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

pub const DIMS: usize = 8;

/// Bag-of-bytes vectors; optionally unavailable from the n-th call on.
pub struct FakeEmbedder {
    calls: AtomicUsize,
    fail_from_call: Option<usize>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None, Duration::ZERO))
    }

    pub fn failing_from(call: usize) -> Arc<Self> {
        Arc::new(Self::build(Some(call), Duration::ZERO))
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(None, delay))
    }

    fn build(fail_from_call: Option<usize>, delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_from_call,
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; DIMS];
        for byte in text.bytes() {
            vector[byte as usize % DIMS] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    fn model_id(&self) -> &str {
        "fake-embedder"
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_from_call.map_or(false, |from| call >= from) {
            return Err(EmbeddingError::Unavailable("connection refused".to_string()));
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(texts.iter().map(|text| Self::vector(text)).collect())
    }
}

pub fn embedder_factory(embedder: Arc<FakeEmbedder>) -> EmbedderFactory {
    Arc::new(move |_: &EmbeddingModelConfig| {
        let provider: Arc<dyn EmbeddingProvider> = embedder.clone();
        Ok(provider)
    })
}

/// Streams fixed words with a pause before each, or fails mid-stream.
pub struct ScriptedBackend {
    words: Vec<String>,
    delay: Duration,
    fail_after: Option<usize>,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedBackend {
    pub fn new(words: &[&str], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            words: words.iter().map(|w| w.to_string()).collect(),
            delay,
            fail_after: None,
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn failing_after(words: &[&str], fail_after: usize) -> Arc<Self> {
        Arc::new(Self {
            words: words.iter().map(|w| w.to_string()).collect(),
            delay: Duration::ZERO,
            fail_after: Some(fail_after),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Vec<ChatMessage> {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn load(&self, _: &GenerationModelConfig, _: &HardwareConfig) -> Result<(), GenerationError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>, GenerationError> {
        Ok(text.split_whitespace().map(|w| w.len() as u32).collect())
    }

    fn detokenize(&self, _: &[u32]) -> Result<String, GenerationError> {
        Ok(String::new())
    }

    async fn stream_generate(
        &self,
        messages: &[ChatMessage],
        cancel: CancellationToken,
        deltas: UnboundedSender<String>,
    ) -> Result<(), GenerationError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        for (i, word) in self.words.iter().enumerate() {
            if self.fail_after == Some(i) {
                return Err(GenerationError::Stream("connection reset".to_string()));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.delay) => {}
            }
            let _ = deltas.send(word.clone());
        }
        Ok(())
    }

    async fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn backend_factory(backend: Arc<ScriptedBackend>) -> BackendFactory {
    Arc::new(move |_: &GenerationModelConfig| {
        let backend: Arc<dyn GenerationBackend> = backend.clone();
        Ok(backend)
    })
}

pub fn embedding_config() -> EmbeddingModelConfig {
    EmbeddingModelConfig {
        model: "fake-embedder".to_string(),
        dimensions: DIMS,
        batch_size: 4,
        ..EmbeddingModelConfig::default()
    }
}

pub fn prefs() -> Arc<MemoryPreferenceStore> {
    Arc::new(MemoryPreferenceStore::new(
        embedding_config(),
        GenerationModelConfig::default(),
    ))
}

pub fn settings(data_dir: &Path, storage: StorageBackend) -> Settings {
    let mut settings = Settings::default();
    settings.vault.storage = storage;
    settings.vault.data_dir = data_dir.to_path_buf();
    settings.vault.debounce_ms = 50;
    settings.vault.chunk_size = 200;
    settings.state_file = data_dir.join("state.json");
    settings
}

pub fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub fn drain(rx: &mut UnboundedReceiver<IndexEvent>) -> Vec<IndexEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Waits for the end of the next pass: `Progress(1.0)` or an error.
pub async fn next_pass(rx: &mut UnboundedReceiver<IndexEvent>) -> Vec<IndexEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => panic!("pass did not finish, got {:?}", events),
            event = rx.recv() => {
                let event = event.expect("index channel closed");
                let done = matches!(event, IndexEvent::Error(_))
                    || matches!(event, IndexEvent::Progress(p) if p >= 1.0);
                events.push(event);
                if done {
                    return events;
                }
            }
        }
    }
}
