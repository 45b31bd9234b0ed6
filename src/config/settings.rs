use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub vault: VaultConfig,
    pub embedding: EmbeddingModelConfig,
    pub generation: GenerationModelConfig,
    pub hardware: HardwareConfig,
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub extensions: Vec<String>,
    pub ignored_names: Vec<String>,
    pub chunk_size: usize,
    pub embed_concurrency: usize,
    pub debounce_ms: u64,
    pub storage: StorageBackend,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// OpenAI-compatible `/embeddings` endpoint (OpenAI, LM Studio, llama-server)
    OpenAi,
    /// Local Ollama daemon
    Ollama,
}

/// Immutable for the lifetime of a vault table; a different fingerprint
/// (or dimensionality) forces a full re-embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingModelConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub dimensions: usize,
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl EmbeddingModelConfig {
    pub fn fingerprint(&self) -> String {
        format!(
            "{:?}|{}|{}|{}",
            self.provider,
            self.endpoint.trim_end_matches('/'),
            self.model,
            self.dimensions
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationProviderKind {
    /// OpenAI-compatible chat completions endpoint
    #[serde(rename = "openai")]
    OpenAi,
    /// Local Ollama daemon
    Ollama,
    /// GGUF file loaded in-process (requires the `llama-cpp` feature)
    LlamaCpp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationModelConfig {
    pub provider: GenerationProviderKind,
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub local_path: Option<PathBuf>,
    pub context_length: usize,
    pub max_tokens: usize,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl GenerationModelConfig {
    pub fn fingerprint(&self, hardware: &HardwareConfig) -> String {
        let location = match (&self.local_path, self.provider) {
            (Some(path), GenerationProviderKind::LlamaCpp) => path.display().to_string(),
            _ => self.endpoint.trim_end_matches('/').to_string(),
        };
        format!(
            "{:?}|{}|{}|ctx={}|gpu={}|cuda={}|vulkan={}",
            self.provider,
            location,
            self.model,
            self.context_length,
            hardware.use_gpu,
            hardware.use_cuda,
            hardware.use_vulkan
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub use_gpu: bool,
    pub use_cuda: bool,
    pub use_vulkan: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Pretty,
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["md".to_string(), "markdown".to_string(), "txt".to_string()],
            ignored_names: vec![
                ".git".to_string(),
                ".obsidian".to_string(),
                ".trash".to_string(),
                "node_modules".to_string(),
            ],
            chunk_size: 1000,
            embed_concurrency: 4,
            debounce_ms: 300,
            storage: StorageBackend::Sqlite,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Default for EmbeddingModelConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::OpenAi,
            model: "text-embedding-nomic-embed-text-v1.5".to_string(),
            endpoint: "http://localhost:1234/v1".to_string(),
            api_key: None,
            dimensions: 768,
            batch_size: 32,
            timeout_secs: 60,
        }
    }
}

impl Default for GenerationModelConfig {
    fn default() -> Self {
        Self {
            provider: GenerationProviderKind::OpenAi,
            model: "local-model".to_string(),
            endpoint: "http://localhost:1234/v1".to_string(),
            api_key: None,
            local_path: None,
            context_length: 4096,
            max_tokens: 1024,
            temperature: 0.7,
            timeout_secs: 300,
        }
    }
}

impl Settings {
    /// Layers an optional config file with `NOTE_VAULT__SECTION__KEY`
    /// environment overrides.
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("NOTE_VAULT").separator("__"))
            .build()?;

        let mut settings: Settings = settings.try_deserialize()?;
        if settings.state_file.as_os_str().is_empty() {
            settings.state_file = settings.vault.data_dir.join("state.json");
        }
        Ok(settings)
    }

    pub fn vector_db_path(&self) -> PathBuf {
        self.vault.data_dir.join("vectordb.sqlite")
    }
}
