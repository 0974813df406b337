pub mod monitor;
pub mod refresh;
pub mod storage;
pub mod token;
pub mod token_store;

pub use monitor::{MonitorHandle, RefreshOutcome, RefreshWindow, SessionMonitor, TickOutcome};
pub use refresh::{HttpRefreshClient, RefreshClient, RefreshError};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError, UnavailableStore};
pub use token::{Claims, SessionSnapshot, SessionState, TokenBundle, TokenResponse};
pub use token_store::TokenStore;
