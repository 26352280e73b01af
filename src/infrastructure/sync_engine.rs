//! Batched, rate-limit-aware synchronization to the sheet store
//!
//! A job hands its [`UpdateBatch`] to [`SyncEngine::commit`] once. Values go
//! out as a single batch write, color annotations as a separate formatting
//! batch, and a batch that cannot be written ends up in local artifacts.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::domain::sync_intents::{ColorIntent, UpdateBatch, UpdateIntent};
use crate::infrastructure::config::{ExportConfig, SheetsConfig};
use crate::infrastructure::local_export::{LocalArtifacts, LocalExporter};
use crate::infrastructure::sheets::{CellBackground, CellWrite, SheetStore, StoreError, a1};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("batch write failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

/// What happened to a committed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing was pending
    Empty,
    Synced { cells: usize, colors_applied: bool },
    /// The store was unreachable; the batch is on disk instead
    PersistedLocally {
        cells: usize,
        artifacts: LocalArtifacts,
        error: String,
    },
}

impl CommitOutcome {
    #[must_use]
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced { .. } | Self::Empty)
    }
}

pub struct SyncEngine {
    store: Arc<dyn SheetStore>,
    exporter: LocalExporter,
    max_attempts: u32,
    backoff_unit: Duration,
}

impl SyncEngine {
    #[must_use]
    pub fn new(store: Arc<dyn SheetStore>, exporter: LocalExporter) -> Self {
        Self {
            store,
            exporter,
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn from_config(store: Arc<dyn SheetStore>, sheets: &SheetsConfig, export: &ExportConfig) -> Self {
        Self {
            max_attempts: sheets.max_attempts.max(1),
            backoff_unit: Duration::from_millis(sheets.backoff_unit_ms),
            ..Self::new(store, LocalExporter::from_config(export))
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn SheetStore> {
        &self.store
    }

    /// Rate-limited failures wait `2^attempt` units; others retry at once
    async fn with_retries<F, Fut>(&self, what: &str, mut call: F) -> Result<(), (u32, StoreError)>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), StoreError>>,
    {
        let mut last_error = None;
        for attempt in 0..self.max_attempts {
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_rate_limited() => {
                    let wait = self.backoff_unit * 2u32.saturating_pow(attempt);
                    warn!(
                        "⏳ {} rate limited (attempt {}/{}), waiting {:?}",
                        what,
                        attempt + 1,
                        self.max_attempts,
                        wait
                    );
                    sleep(wait).await;
                    last_error = Some(e);
                }
                Err(e) => {
                    error!("❌ {} failed (attempt {}/{}): {}", what, attempt + 1, self.max_attempts, e);
                    if attempt + 1 == self.max_attempts {
                        return Err((attempt + 1, e));
                    }
                    last_error = Some(e);
                }
            }
        }
        Err((
            self.max_attempts,
            last_error.unwrap_or_else(|| StoreError::Transport("no attempts made".to_string())),
        ))
    }

    /// Write all updates as one batch; an empty slice makes no call
    pub async fn flush(&self, updates: &[UpdateIntent]) -> Result<(), SyncError> {
        if updates.is_empty() {
            return Ok(());
        }
        let cells: Vec<CellWrite> = updates
            .iter()
            .map(|u| CellWrite {
                range: a1(u.row, u.column),
                value: u.value.clone(),
            })
            .collect();

        self.with_retries("Batch write", || self.store.batch_write_cells(&cells))
            .await
            .map_err(|(attempts, source)| SyncError::Exhausted { attempts, source })?;
        info!("📤 Flushed {} cells", cells.len());
        Ok(())
    }

    /// Apply background colors; `false` when every attempt failed
    pub async fn apply_colors(&self, colors: &[ColorIntent]) -> bool {
        if colors.is_empty() {
            return true;
        }
        let cells: Vec<CellBackground> = colors
            .iter()
            .map(|c| CellBackground {
                row: c.row,
                column: c.column,
                rgb: c.rgb(),
            })
            .collect();

        match self
            .with_retries("Color update", || self.store.batch_set_background(&cells))
            .await
        {
            Ok(()) => {
                info!("🎨 Colored {} cells", cells.len());
                true
            }
            Err((_, e)) => {
                warn!("⚠️ Giving up on cell colors: {}", e);
                false
            }
        }
    }

    #[must_use]
    pub fn persist_locally(&self, updates: &[UpdateIntent], colors: &[ColorIntent]) -> LocalArtifacts {
        self.exporter.persist(updates, colors)
    }

    /// Flush, color, and fall back to local files. Always leaves `batch` empty.
    pub async fn commit(&self, batch: &mut UpdateBatch) -> CommitOutcome {
        let (updates, colors) = batch.drain();
        if updates.is_empty() && colors.is_empty() {
            return CommitOutcome::Empty;
        }

        match self.flush(&updates).await {
            Ok(()) => CommitOutcome::Synced {
                cells: updates.len(),
                colors_applied: self.apply_colors(&colors).await,
            },
            Err(e) => {
                error!("❌ Sync failed, saving {} updates locally: {}", updates.len(), e);
                let artifacts = self.persist_locally(&updates, &colors);
                CommitOutcome::PersistedLocally {
                    cells: updates.len(),
                    artifacts,
                    error: e.to_string(),
                }
            }
        }
    }
}
