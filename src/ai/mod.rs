pub mod context;
#[cfg(feature = "llama-cpp")]
pub mod llama_cpp;
pub mod ollama;
pub mod provider;
pub mod remote;
pub mod session;

pub use context::ContextBuilder;
pub use provider::{
    build_backend, default_backend_factory, BackendFactory, ChatMessage, GenerationBackend, GenerationError, Role,
};
pub use session::{BackendPool, GenerationSession, PromptOptions, SessionState, StreamEvent};
