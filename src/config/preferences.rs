// src/config/preferences.rs - Key-value preferences consumed by the core
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::settings::{EmbeddingModelConfig, GenerationModelConfig, HardwareConfig, Settings};
use crate::error::VaultError;
use crate::Result;

/// Preference store the core reads model configuration from. Storage of
/// these values belongs to the host application.
pub trait PreferenceStore: Send + Sync {
    fn get_embedding_model_config(&self) -> EmbeddingModelConfig;
    fn get_generation_model_config(&self) -> (GenerationModelConfig, HardwareConfig);
    fn get_last_opened_directory(&self) -> Option<PathBuf>;
    fn set_last_opened_directory(&self, directory: &Path) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    last_opened_directory: Option<PathBuf>,
}

/// Model configuration from [`Settings`], mutable state in a JSON file.
pub struct SettingsPreferenceStore {
    settings: Settings,
    state: Mutex<PersistedState>,
}

impl SettingsPreferenceStore {
    pub fn new(settings: Settings) -> Result<Self> {
        let state = match std::fs::read(&settings.state_file) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(
                    "Ignoring unreadable state file {}: {}",
                    settings.state_file.display(),
                    e
                );
                PersistedState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => return Err(VaultError::io(&settings.state_file, e)),
        };

        Ok(Self {
            settings,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &PersistedState) -> Result<()> {
        let path = &self.settings.state_file;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| VaultError::io(parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        std::fs::write(path, bytes).map_err(|e| VaultError::io(path, e))
    }
}

impl PreferenceStore for SettingsPreferenceStore {
    fn get_embedding_model_config(&self) -> EmbeddingModelConfig {
        self.settings.embedding.clone()
    }

    fn get_generation_model_config(&self) -> (GenerationModelConfig, HardwareConfig) {
        (self.settings.generation.clone(), self.settings.hardware)
    }

    fn get_last_opened_directory(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.last_opened_directory.clone())
    }

    fn set_last_opened_directory(&self, directory: &Path) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| VaultError::Config("preference state lock poisoned".to_string()))?;
        state.last_opened_directory = Some(directory.to_path_buf());
        self.persist(&state)
    }
}

/// In-process store, used by tests and hosts that keep preferences elsewhere.
pub struct MemoryPreferenceStore {
    embedding: EmbeddingModelConfig,
    generation: GenerationModelConfig,
    hardware: HardwareConfig,
    last_opened: Mutex<Option<PathBuf>>,
}

impl MemoryPreferenceStore {
    pub fn new(embedding: EmbeddingModelConfig, generation: GenerationModelConfig) -> Self {
        Self {
            embedding,
            generation,
            hardware: HardwareConfig::default(),
            last_opened: Mutex::new(None),
        }
    }

    pub fn with_hardware(mut self, hardware: HardwareConfig) -> Self {
        self.hardware = hardware;
        self
    }
}

impl Default for MemoryPreferenceStore {
    fn default() -> Self {
        Self::new(EmbeddingModelConfig::default(), GenerationModelConfig::default())
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get_embedding_model_config(&self) -> EmbeddingModelConfig {
        self.embedding.clone()
    }

    fn get_generation_model_config(&self) -> (GenerationModelConfig, HardwareConfig) {
        (self.generation.clone(), self.hardware)
    }

    fn get_last_opened_directory(&self) -> Option<PathBuf> {
        self.last_opened.lock().ok().and_then(|last| last.clone())
    }

    fn set_last_opened_directory(&self, directory: &Path) -> Result<()> {
        if let Ok(mut last) = self.last_opened.lock() {
            *last = Some(directory.to_path_buf());
        }
        Ok(())
    }
}
