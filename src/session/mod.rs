pub mod pool;
pub mod registry;
pub mod service;
pub mod worker;

pub use pool::SharedPool;
pub use registry::{EmbedderPool, SessionId, VaultRegistry, VaultSession};
pub use service::{ChatOptions, VaultService};
pub use worker::{SyncRequest, VaultWorker};
