//! Application layer
//!
//! Per-marketplace jobs built on the infrastructure components.

pub mod jobs;
pub mod tasks;

pub use jobs::{JobKind, JobReport, JobRunner, MarketplaceEndpoints};
