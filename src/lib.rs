//! Marketplace Pricing Sync - listing prices collected through a proxy tunnel
//!
//! Jobs open a browser session routed through a local forwarding endpoint,
//! fetch marketplace data over the same route, and reconcile the results
//! into a spreadsheet, falling back to local files when the store is down.

// Module declarations
pub mod domain;
pub mod infrastructure;
pub mod application;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
