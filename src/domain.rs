//! Domain module - pure values and rules
//!
//! Nothing here performs I/O:
//! - `proxy`: proxy endpoint notation parsing
//! - `shard`: item id to CDN shard mapping
//! - `listing`: marketplace response shapes and their cell values
//! - `sync_intents`: pending cell writes of a job

pub mod listing;
pub mod proxy;
pub mod shard;
pub mod sync_intents;

pub use listing::{OzonPriceOutcome, ProductSummary};
pub use proxy::{ProxyDescriptor, ProxyProtocol};
pub use shard::{ShardAddress, ShardError};
pub use sync_intents::{ColorIntent, UpdateBatch, UpdateIntent};
