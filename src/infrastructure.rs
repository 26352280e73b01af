//! Infrastructure layer for network, browser, store, and file system integrations
//!
//! This module provides the resilient fetch layer, the tunnel session
//! manager, the batched sheet sync engine, and configuration/logging.

pub mod config; // Configuration tree and loaders
pub mod logging; // Logging infrastructure
pub mod proxy_pool;
pub mod retry_manager;
pub mod http_client;
pub mod marketplace;
pub mod tunnel;
pub mod sheets;
pub mod sync_engine;
pub mod local_export; // Fallback when the sheet store is unreachable

// Re-export commonly used items
pub use config::{AppConfig, ConfigManager};
pub use http_client::{FetchError, MarketplaceClient, MarketplaceClientConfig, SessionContext};
pub use logging::{get_log_directory, init_logging, init_logging_with_config};
pub use retry_manager::{RetryPolicy, execute_with_policy};
pub use sheets::{GoogleSheetsStore, SheetStore, StoreError};
pub use sync_engine::{CommitOutcome, SyncEngine, SyncError};
pub use tunnel::{TunnelManager, TunnelSession, TunnelSettings};
