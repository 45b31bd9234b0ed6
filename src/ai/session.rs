//! Streaming chat session bound to one loaded generation backend.
//!
//! `Uninitialized -> Loading -> Ready <-> Generating`, back to
//! `Uninitialized` on teardown. One prompt runs at a time. Deltas reach the
//! caller through a gate that `abort` closes under the same lock the
//! forwarder sends under, so nothing is delivered once `abort` returns.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::provider::{BackendFactory, ChatMessage, GenerationBackend, GenerationError};
use crate::config::settings::{GenerationModelConfig, HardwareConfig};
use crate::error::VaultError;
use crate::session::pool::SharedPool;
use crate::Result;

pub type BackendPool = SharedPool<Arc<dyn GenerationBackend>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Loading,
    Ready,
    Generating,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PromptOptions {
    /// Clears the history, sends the prompt alone and records nothing.
    pub ignore_history: bool,
}

/// Events of one `stream_prompt` call, terminated by exactly one `Done`
/// or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEvent {
    Token(String),
    Error(String),
    Done,
}

#[derive(Clone)]
struct ActiveCall {
    cancel: CancellationToken,
    open: Arc<Mutex<bool>>,
}

impl ActiveCall {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            open: Arc::new(Mutex::new(true)),
        }
    }

    fn close(&self) {
        if let Ok(mut open) = self.open.lock() {
            *open = false;
        }
        self.cancel.cancel();
    }

    /// Sends `delta` unless the call was aborted; returns whether it went out.
    fn forward(&self, events: &UnboundedSender<StreamEvent>, delta: String) -> bool {
        let Ok(open) = self.open.lock() else {
            return false;
        };
        *open && events.send(StreamEvent::Token(delta)).is_ok()
    }
}

struct Loaded {
    backend: Arc<dyn GenerationBackend>,
    pool_key: String,
    context_length: usize,
}

struct Inner {
    state: SessionState,
    loaded: Option<Loaded>,
    history: Vec<ChatMessage>,
    active: Option<ActiveCall>,
    // set by `abort`, cleared when the next prompt starts
    aborted: bool,
    // bumped by `teardown`; a load that finishes under an older epoch is
    // handed back instead of committed
    epoch: u64,
}

pub struct GenerationSession {
    inner: Mutex<Inner>,
    // held for the whole of a prompt; a new prompt waits on it only when
    // the previous one was aborted
    turn: tokio::sync::Mutex<()>,
    pool: Arc<BackendPool>,
    factory: BackendFactory,
}

impl GenerationSession {
    pub fn new(pool: Arc<BackendPool>, factory: BackendFactory) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Uninitialized,
                loaded: None,
                history: Vec::new(),
                active: None,
                aborted: false,
                epoch: 0,
            }),
            turn: tokio::sync::Mutex::new(()),
            pool,
            factory,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| VaultError::Internal("generation session lock poisoned".to_string()))
    }

    pub fn state(&self) -> SessionState {
        self.lock().map(|inner| inner.state).unwrap_or(SessionState::Uninitialized)
    }

    /// Loads the model (or joins an already loaded one with the same
    /// configuration). Reinitialising with the same configuration is a
    /// no-op; a different one replaces the current model.
    #[instrument(skip_all, fields(provider = ?config.provider, model = %config.model))]
    pub async fn init(&self, config: &GenerationModelConfig, hardware: &HardwareConfig) -> Result<()> {
        let key = config.fingerprint(hardware);
        let (previous, epoch) = {
            let mut inner = self.lock()?;
            match inner.state {
                SessionState::Loading | SessionState::Generating => return Err(VaultError::Busy),
                SessionState::Ready if inner.loaded.as_ref().map(|l| l.pool_key.as_str()) == Some(key.as_str()) => {
                    return Ok(())
                }
                _ => {}
            }
            inner.state = SessionState::Loading;
            (inner.loaded.take(), inner.epoch)
        };
        if let Some(previous) = previous {
            self.release(&previous.pool_key).await;
        }

        let factory = Arc::clone(&self.factory);
        let loaded = self
            .pool
            .acquire(&key, || async move {
                let backend = (*factory)(config)?;
                backend.load(config, hardware).await?;
                Ok::<_, GenerationError>(backend)
            })
            .await;
        let loaded_ok = loaded.is_ok();

        let committed = {
            let mut inner = self.lock()?;
            if inner.epoch != epoch {
                None
            } else {
                Some(match loaded {
                    Ok(backend) => {
                        debug!("Generation backend {} ready", backend.name());
                        inner.loaded = Some(Loaded {
                            backend,
                            pool_key: key.clone(),
                            context_length: config.context_length,
                        });
                        inner.state = SessionState::Ready;
                        Ok(())
                    }
                    Err(e) => {
                        inner.state = SessionState::Uninitialized;
                        Err(VaultError::ModelLoad(e.to_string()))
                    }
                })
            }
        };

        match committed {
            Some(result) => result,
            None => {
                debug!("Session torn down while loading {}", key);
                if loaded_ok {
                    self.release(&key).await;
                }
                Err(VaultError::Closed)
            }
        }
    }

    async fn release(&self, key: &str) {
        if let Some(backend) = self.pool.release(key).await {
            backend.unload().await;
        }
    }

    /// Streams the completion of `prompt` into `events` and resolves with
    /// the delivered text. Misuse (`Busy`, `NotInitialized`) is returned
    /// before any event; provider failures end in one `Error` event and an
    /// empty result.
    #[instrument(skip_all, fields(ignore_history = options.ignore_history))]
    pub async fn stream_prompt(
        &self,
        prompt: &str,
        options: PromptOptions,
        events: UnboundedSender<StreamEvent>,
    ) -> Result<String> {
        let _turn = match self.turn.try_lock() {
            Ok(turn) => turn,
            Err(_) => {
                if !self.lock()?.aborted {
                    return Err(VaultError::Busy);
                }
                self.turn.lock().await
            }
        };

        let (backend, messages, call) = {
            let mut inner = self.lock()?;
            match inner.state {
                SessionState::Ready => {}
                SessionState::Generating | SessionState::Loading => return Err(VaultError::Busy),
                SessionState::Uninitialized => return Err(VaultError::NotInitialized),
            }
            let backend = match inner.loaded.as_ref() {
                Some(loaded) => Arc::clone(&loaded.backend),
                None => return Err(VaultError::NotInitialized),
            };

            let user = ChatMessage::user(prompt);
            let messages = if options.ignore_history {
                inner.history.clear();
                vec![user]
            } else {
                inner.history.push(user);
                inner.history.clone()
            };

            let call = ActiveCall::new();
            inner.active = Some(call.clone());
            inner.aborted = false;
            inner.state = SessionState::Generating;
            (backend, messages, call)
        };

        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel();
        let generation = backend.stream_generate(&messages, call.cancel.clone(), delta_tx);
        tokio::pin!(generation);

        let mut text = String::new();
        let result = loop {
            tokio::select! {
                biased;
                Some(delta) = delta_rx.recv() => {
                    if call.forward(&events, delta.clone()) {
                        text.push_str(&delta);
                    }
                }
                result = &mut generation => {
                    while let Ok(delta) = delta_rx.try_recv() {
                        if call.forward(&events, delta.clone()) {
                            text.push_str(&delta);
                        }
                    }
                    break result;
                }
            }
        };

        let aborted = call.cancel.is_cancelled();
        let mut inner = self.lock()?;
        inner.active = None;
        if inner.state == SessionState::Generating {
            inner.state = SessionState::Ready;
        }

        match result {
            Err(e) if !aborted => {
                warn!("Generation failed: {}", e);
                if !options.ignore_history {
                    inner.history.pop();
                }
                let _ = events.send(StreamEvent::Error(VaultError::from(e).user_message()));
                Ok(String::new())
            }
            _ => {
                if !options.ignore_history {
                    inner.history.push(ChatMessage::assistant(text.clone()));
                }
                if aborted {
                    debug!("Generation aborted after {} bytes", text.len());
                }
                let _ = events.send(StreamEvent::Done);
                Ok(text)
            }
        }
    }

    /// Stops the in-flight prompt, if any. No token is delivered once this
    /// returns.
    pub fn abort(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            let inner = &mut *guard;
            if let Some(call) = &inner.active {
                call.close();
                inner.aborted = true;
            }
        }
    }

    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let backend = self.backend()?;
        Ok(backend.tokenize(text)?)
    }

    pub fn detokenize(&self, tokens: &[u32]) -> Result<String> {
        let backend = self.backend()?;
        Ok(backend.detokenize(tokens)?)
    }

    fn backend(&self) -> Result<Arc<dyn GenerationBackend>> {
        self.lock()?
            .loaded
            .as_ref()
            .map(|loaded| Arc::clone(&loaded.backend))
            .ok_or(VaultError::NotInitialized)
    }

    pub fn context_length(&self) -> Option<usize> {
        self.lock()
            .ok()
            .and_then(|inner| inner.loaded.as_ref().map(|l| l.context_length))
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.lock().map(|inner| inner.history.clone()).unwrap_or_default()
    }

    pub fn clear_history(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.history.clear();
        }
    }

    /// Aborts any prompt, waits for it to settle and gives the model back
    /// to the pool. Idempotent.
    pub async fn teardown(&self) {
        self.abort();
        if let Ok(mut inner) = self.inner.lock() {
            inner.epoch += 1;
        }
        let _turn = self.turn.lock().await;
        let loaded = match self.inner.lock() {
            Ok(mut inner) => {
                inner.epoch += 1;
                inner.state = SessionState::Uninitialized;
                inner.history.clear();
                inner.loaded.take()
            }
            Err(_) => None,
        };
        if let Some(loaded) = loaded {
            self.release(&loaded.pool_key).await;
        }
    }
}
