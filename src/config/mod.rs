pub mod preferences;
pub mod settings;

pub use preferences::{MemoryPreferenceStore, PreferenceStore, SettingsPreferenceStore};
pub use settings::{
    EmbeddingModelConfig, EmbeddingProviderKind, GenerationModelConfig, GenerationProviderKind,
    HardwareConfig, LogFormat, LoggingConfig, Settings, StorageBackend, VaultConfig,
};
