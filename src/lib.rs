pub mod ai;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logger;
pub mod session;
pub mod vault;

pub use config::{PreferenceStore, Settings};
pub use error::VaultError;
pub use session::{ChatOptions, SessionId, VaultService};
pub use vault::IndexEvent;
pub use ai::StreamEvent;

pub type Result<T> = std::result::Result<T, VaultError>;
