//! Surface exposed to the host UI: opaque session ids in, event streams out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{instrument, warn};

use crate::ai::context::ContextBuilder;
use crate::ai::provider::{default_backend_factory, BackendFactory};
use crate::ai::session::{GenerationSession, PromptOptions, SessionState, StreamEvent};
use crate::config::preferences::PreferenceStore;
use crate::config::settings::Settings;
use crate::session::registry::{SessionId, VaultRegistry, VaultSession};
use crate::vault::embeddings::{default_embedder_factory, EmbedderFactory};
use crate::vault::storage::SearchHit;
use crate::vault::synchronizer::IndexEvent;
use crate::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatOptions {
    pub ignore_history: bool,
    /// Number of retrieved chunks to prepend to the prompt; 0 sends the
    /// prompt as typed.
    pub context_chunks: usize,
}

pub struct VaultService {
    registry: Arc<VaultRegistry>,
}

impl VaultService {
    pub fn new(prefs: Arc<dyn PreferenceStore>, settings: Settings) -> Self {
        Self::with_factories(prefs, settings, default_backend_factory(), default_embedder_factory())
    }

    pub fn with_factories(
        prefs: Arc<dyn PreferenceStore>,
        settings: Settings,
        backend_factory: BackendFactory,
        embedder_factory: EmbedderFactory,
    ) -> Self {
        Self {
            registry: Arc::new(VaultRegistry::new(settings, prefs, backend_factory, embedder_factory)),
        }
    }

    pub fn registry(&self) -> &Arc<VaultRegistry> {
        &self.registry
    }

    /// Opens `directory` under a fresh session id and starts indexing it.
    /// Failing to start the embedder or table is reported on the returned
    /// stream; the session stays open so the user can fix settings and
    /// reindex.
    #[instrument(skip(self))]
    pub async fn open_vault_and_index(&self, directory: &Path) -> Result<(SessionId, UnboundedReceiver<IndexEvent>)> {
        let session = self.registry.open_vault(SessionId::generate(), directory)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.start(&session, tx).await;
        Ok((session.id().clone(), rx))
    }

    /// Requests a full pass. Events go to a new stream when indexing had
    /// never started, otherwise to the session's original stream.
    pub async fn reindex(&self, id: &SessionId) -> Result<UnboundedReceiver<IndexEvent>> {
        let session = self.registry.lookup_by_session_id(id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        if session.is_indexing().await {
            session.reindex().await?;
        } else {
            self.start(&session, tx).await;
        }
        Ok(rx)
    }

    async fn start(&self, session: &Arc<VaultSession>, events: UnboundedSender<IndexEvent>) {
        if let Err(e) = self.registry.start_indexing(session, events.clone()).await {
            warn!("Indexing {} did not start: {}", session.directory().display(), e);
            let _ = events.send(IndexEvent::Error(e.user_message()));
        }
    }

    /// Streams the answer to `prompt`. The generation model is loaded on
    /// first use from the current preferences. Every failure, including
    /// misuse while another prompt runs, arrives as one `Error` event.
    #[instrument(skip(self, prompt))]
    pub fn send_chat_message(
        &self,
        id: &SessionId,
        prompt: &str,
        options: ChatOptions,
    ) -> Result<UnboundedReceiver<StreamEvent>> {
        let session = self.registry.lookup_by_session_id(id)?;
        let prefs = Arc::clone(self.registry.prefs());
        let prompt = prompt.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let generation = session.generation();
            if generation.state() == SessionState::Uninitialized {
                let (config, hardware) = prefs.get_generation_model_config();
                if let Err(e) = generation.init(&config, &hardware).await {
                    let _ = tx.send(StreamEvent::Error(e.user_message()));
                    return;
                }
            }

            let prompt = if options.context_chunks > 0 {
                augment(&session, generation, &prompt, options.context_chunks).await
            } else {
                prompt
            };

            let prompt_options = PromptOptions {
                ignore_history: options.ignore_history,
            };
            if let Err(e) = generation.stream_prompt(&prompt, prompt_options, tx.clone()).await {
                let _ = tx.send(StreamEvent::Error(e.user_message()));
            }
        });

        Ok(rx)
    }

    pub fn abort_generation(&self, id: &SessionId) -> Result<()> {
        self.registry.lookup_by_session_id(id)?.generation().abort();
        Ok(())
    }

    pub async fn close_vault(&self, id: &SessionId) -> Result<()> {
        self.registry.close_session(id).await
    }

    pub async fn search(&self, id: &SessionId, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.registry.lookup_by_session_id(id)?.search(query, limit).await
    }

    pub fn last_opened_directory(&self) -> Option<PathBuf> {
        self.registry.prefs().get_last_opened_directory()
    }

    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}

/// Prepends retrieved chunks; falls back to the plain prompt when
/// retrieval fails.
async fn augment(session: &VaultSession, generation: &GenerationSession, prompt: &str, chunks: usize) -> String {
    let hits = match session.search(prompt, chunks).await {
        Ok(hits) => hits,
        Err(e) => {
            warn!("Retrieval for chat failed, sending prompt without context: {}", e);
            return prompt.to_string();
        }
    };

    let builder = ContextBuilder::for_context_length(generation.context_length().unwrap_or(2048));
    builder.build(prompt, &hits, |text| {
        generation
            .tokenize(text)
            .map(|tokens| tokens.len())
            .unwrap_or_else(|_| text.len() / 4)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::preferences::MemoryPreferenceStore;
    use crate::config::settings::StorageBackend;
    use crate::error::VaultError;

    fn service() -> VaultService {
        let mut settings = Settings::default();
        settings.vault.storage = StorageBackend::Memory;
        VaultService::new(Arc::new(MemoryPreferenceStore::default()), settings)
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let service = service();
        let id = SessionId::from("missing");
        assert!(matches!(
            service.send_chat_message(&id, "hi", ChatOptions::default()),
            Err(VaultError::NotFound(_))
        ));
        assert!(matches!(service.abort_generation(&id), Err(VaultError::NotFound(_))));
        service.close_vault(&id).await.unwrap();
    }

    #[test]
    fn test_chat_options_deserialize_with_defaults() {
        let options: ChatOptions = serde_json::from_str(r#"{"ignore_history": true}"#).unwrap();
        assert!(options.ignore_history);
        assert_eq!(options.context_chunks, 0);
    }
}
