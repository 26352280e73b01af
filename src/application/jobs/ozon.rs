//! Ozon price job

use anyhow::Result;
use tracing::{info, warn};

use super::{JobTally, resolve_column};
use crate::application::tasks::{Task, extract_ozon_article};
use crate::domain::sync_intents::UpdateBatch;
use crate::infrastructure::config::ColumnConfig;
use crate::infrastructure::marketplace::OzonClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OzonColumns {
    pub inputs: Vec<u32>,
    pub price: u32,
}

impl OzonColumns {
    pub fn resolve(columns: &ColumnConfig) -> Result<Self> {
        Ok(Self {
            inputs: vec![resolve_column("ozon_input", &columns.ozon_input)?],
            price: resolve_column("ozon_price", &columns.ozon_price)?,
        })
    }
}

/// Fetch every article's price; failures leave the price cell empty
pub async fn process(
    client: &OzonClient,
    tasks: &[Task],
    columns: &OzonColumns,
    batch: &mut UpdateBatch,
) -> JobTally {
    let mut tally = JobTally::default();
    info!("🔍 Found {} Ozon items", tasks.len());

    for (index, task) in tasks.iter().enumerate() {
        if index > 0 {
            client.http().pause_between_items().await;
        }

        let article = extract_ozon_article(&task.value);
        match client.fetch_price(&article).await {
            Ok(price) => {
                tally.processed += 1;
                batch.set(task.row, columns.price, price);
            }
            Err(e) => {
                tally.errored += 1;
                batch.set(task.row, columns.price, "");
                if e.is_fatal_for_job() {
                    warn!("🛑 Stopping Ozon job at row {}: {}", task.row, e);
                    tally.aborted = Some(e.to_string());
                    break;
                }
                warn!("⚠️ Row {} ({}) failed: {}", task.row, article, e);
            }
        }
    }

    tally
}
