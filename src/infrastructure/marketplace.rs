//! Marketplace endpoint clients built on [`MarketplaceClient`](crate::infrastructure::http_client::MarketplaceClient)

pub mod ozon;
pub mod wildberries;

pub use ozon::{OzonClient, OzonEndpoints};
pub use wildberries::{WbEndpoints, WildberriesClient};
