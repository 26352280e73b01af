//! Wildberries price job

use anyhow::Result;
use tracing::{info, warn};

use super::{JobTally, resolve_column};
use crate::application::tasks::{Task, extract_nm_id};
use crate::domain::sync_intents::{ColorIntent, UpdateBatch};
use crate::infrastructure::config::ColumnConfig;
use crate::infrastructure::marketplace::WildberriesClient;

/// Placeholder for a cell that holds no usable item id
pub const INVALID_MARKER: &str = "INVALID";

const ERROR_PREFIX_CHARS: usize = 20;

/// Sheet columns the job reads and writes, 1-based
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WbColumns {
    pub inputs: Vec<u32>,
    pub price: u32,
    pub rating_reviews: u32,
    pub display_battery: u32,
    pub promo: u32,
    pub seller: u32,
    pub promo_color: String,
}

impl WbColumns {
    pub fn resolve(columns: &ColumnConfig) -> Result<Self> {
        let mut inputs = vec![
            resolve_column("wb_sku", &columns.wb_sku)?,
            resolve_column("wb_link", &columns.wb_link)?,
        ];
        inputs.dedup();
        Ok(Self {
            inputs,
            price: resolve_column("wb_price", &columns.wb_price)?,
            rating_reviews: resolve_column("wb_rating_reviews", &columns.wb_rating_reviews)?,
            display_battery: resolve_column("wb_display_battery", &columns.wb_display_battery)?,
            promo: resolve_column("wb_promo", &columns.wb_promo)?,
            seller: resolve_column("wb_seller", &columns.wb_seller)?,
            promo_color: columns.promo_color.clone(),
        })
    }

    fn write_row(&self, batch: &mut UpdateBatch, row: u32, values: [&str; 5]) {
        let targets = [
            self.price,
            self.rating_reviews,
            self.display_battery,
            self.promo,
            self.seller,
        ];
        for (column, value) in targets.into_iter().zip(values) {
            batch.set(row, column, value);
        }
    }
}

fn error_cell(error: &impl ToString) -> String {
    let text: String = error.to_string().chars().take(ERROR_PREFIX_CHARS).collect();
    format!("ERR: {text}")
}

/// Fetch every task and queue its five cells.
///
/// An authentication failure stops the loop; everything queued so far stays in `batch`.
pub async fn process(
    client: &WildberriesClient,
    tasks: &[Task],
    columns: &WbColumns,
    batch: &mut UpdateBatch,
) -> JobTally {
    let mut tally = JobTally::default();
    info!("🔍 Found {} Wildberries items", tasks.len());

    for (index, task) in tasks.iter().enumerate() {
        if index > 0 {
            client.http().pause_between_items().await;
        }

        let Some(nm_id) = extract_nm_id(&task.value) else {
            tally.errored += 1;
            columns.write_row(batch, task.row, [INVALID_MARKER, "", "", "", ""]);
            continue;
        };

        match client.product_summary(&nm_id).await {
            Ok(summary) => {
                tally.processed += 1;
                columns.write_row(
                    batch,
                    task.row,
                    [
                        &summary.price,
                        &summary.rating_reviews,
                        summary.display_or_battery(),
                        &summary.promo,
                        &summary.seller,
                    ],
                );
                if summary.has_promo {
                    match ColorIntent::new(task.row, columns.promo, &columns.promo_color) {
                        Ok(color) => batch.push_color(color),
                        Err(e) => warn!("Skipping promo color: {}", e),
                    }
                }
            }
            Err(e) => {
                tally.errored += 1;
                columns.write_row(batch, task.row, [&error_cell(&e), "", "", "", ""]);
                if e.is_fatal_for_job() {
                    warn!("🛑 Stopping Wildberries job at row {}: {}", task.row, e);
                    tally.aborted = Some(e.to_string());
                    break;
                }
                warn!("⚠️ Row {} ({}) failed: {}", task.row, nm_id, e);
            }
        }
    }

    tally
}
