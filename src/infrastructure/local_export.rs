//! Local fallback persistence
//!
//! When a flush cannot reach the store, the pending batch is written to a CSV
//! file and an XLSX workbook side by side. Both carry the same rows and can be
//! re-imported with [`load_artifact`].

use anyhow::{Context, Result, bail};
use calamine::{Data, Reader, Xlsx, open_workbook};
use chrono::Local;
use rust_xlsxwriter::Workbook;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::domain::sync_intents::{ColorIntent, UpdateIntent};
use crate::infrastructure::config::ExportConfig;
use crate::infrastructure::sheets::{column_index_to_letter, column_letter_to_index};

const COLUMNS: [&str; 4] = ["Row", "Column", "Value", "Promo"];

/// One exported update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRow {
    #[serde(rename = "Row")]
    pub row: u32,
    #[serde(rename = "Column")]
    pub column: String,
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "Promo")]
    pub promo: String,
}

/// Files written by one persist call; a `None` slot failed independently
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalArtifacts {
    pub csv: Option<PathBuf>,
    pub workbook: Option<PathBuf>,
}

impl LocalArtifacts {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.csv.is_none() && self.workbook.is_none()
    }
}

pub struct LocalExporter {
    dir: PathBuf,
    prefix: String,
    sheet_title: String,
}

impl LocalExporter {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, sheet_title: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            sheet_title: sheet_title.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &ExportConfig) -> Self {
        Self::new(&config.dir, &config.file_prefix, &config.sheet_title)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rows in insertion order; a row with any color intent is marked as promo
    #[must_use]
    pub fn rows(updates: &[UpdateIntent], colors: &[ColorIntent]) -> Vec<ExportRow> {
        let promo_rows: HashSet<u32> = colors.iter().map(|c| c.row).collect();
        updates
            .iter()
            .map(|u| ExportRow {
                row: u.row,
                column: column_index_to_letter(u.column),
                value: u.value.clone(),
                promo: if promo_rows.contains(&u.row) {
                    "Yes".to_string()
                } else {
                    String::new()
                },
            })
            .collect()
    }

    /// Write both artifacts. Never fails; each file is attempted on its own.
    #[must_use]
    pub fn persist(&self, updates: &[UpdateIntent], colors: &[ColorIntent]) -> LocalArtifacts {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!("⚠️ Cannot create export directory {}: {}", self.dir.display(), e);
        }

        let rows = Self::rows(updates, colors);
        let stem = self.unique_stem();
        let artifacts = self.write_artifacts(&stem, &rows);
        if !artifacts.is_empty() {
            info!("💾 Saved {} pending updates locally as {}", updates.len(), stem);
        }
        artifacts
    }

    fn write_artifacts(&self, stem: &str, rows: &[ExportRow]) -> LocalArtifacts {
        let csv_path = self.dir.join(format!("{stem}.csv"));
        let workbook_path = self.dir.join(format!("{stem}.xlsx"));

        let csv = match write_csv(&csv_path, rows) {
            Ok(()) => Some(csv_path),
            Err(e) => {
                warn!("⚠️ CSV export failed: {:#}", e);
                None
            }
        };
        let workbook = match self.write_workbook(&workbook_path, rows) {
            Ok(()) => Some(workbook_path),
            Err(e) => {
                warn!("⚠️ Workbook export failed: {:#}", e);
                None
            }
        };
        LocalArtifacts { csv, workbook }
    }

    /// `<prefix>_<timestamp>` with a counter suffix when a file already exists
    fn unique_stem(&self) -> String {
        let base = format!("{}_{}", self.prefix, Local::now().format("%Y%m%d_%H%M%S%6f"));
        let taken = |stem: &str| {
            self.dir.join(format!("{stem}.csv")).exists() || self.dir.join(format!("{stem}.xlsx")).exists()
        };
        if !taken(&base) {
            return base;
        }
        (1u32..)
            .map(|n| format!("{base}_{n}"))
            .find(|stem| !taken(stem))
            .unwrap_or(base)
    }

    fn write_workbook(&self, path: &Path, rows: &[ExportRow]) -> Result<()> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet
            .set_name(&self.sheet_title)
            .with_context(|| format!("Invalid sheet title {:?}", self.sheet_title))?;
        for (col, title) in (0u16..).zip(COLUMNS) {
            sheet.write_string(0, col, title)?;
        }
        for (line, row) in (1u32..).zip(rows) {
            sheet.write_number(line, 0, f64::from(row.row))?;
            sheet.write_string(line, 1, &row.column)?;
            sheet.write_string(line, 2, &row.value)?;
            sheet.write_string(line, 3, &row.promo)?;
        }
        workbook
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

fn write_csv(path: &Path, rows: &[ExportRow]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
    if rows.is_empty() {
        writer.write_record(COLUMNS)?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn cell_text(cell: Option<&Data>) -> String {
    match cell {
        Some(Data::String(s)) => s.clone(),
        Some(Data::Float(n)) if n.fract() == 0.0 => format!("{n:.0}"),
        Some(Data::Float(n)) => n.to_string(),
        Some(Data::Int(n)) => n.to_string(),
        Some(Data::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn read_workbook(path: &Path) -> Result<Vec<ExportRow>> {
    let mut workbook: Xlsx<_> =
        open_workbook(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let range = workbook
        .worksheet_range_at(0)
        .with_context(|| format!("Workbook {} has no sheets", path.display()))?
        .with_context(|| format!("Malformed workbook artifact {}", path.display()))?;

    range
        .rows()
        .skip(1)
        .map(|cells| {
            let row = cell_text(cells.first());
            Ok(ExportRow {
                row: row
                    .parse()
                    .with_context(|| format!("Invalid row number {row:?}"))?,
                column: cell_text(cells.get(1)),
                value: cell_text(cells.get(2)),
                promo: cell_text(cells.get(3)),
            })
        })
        .collect()
}

/// Re-import a CSV or XLSX artifact as update intents
pub fn load_artifact(path: &Path) -> Result<Vec<UpdateIntent>> {
    let rows: Vec<ExportRow> = match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => {
            let mut reader = csv::Reader::from_path(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            reader
                .deserialize()
                .collect::<Result<_, _>>()
                .with_context(|| format!("Malformed CSV artifact {}", path.display()))?
        }
        Some("xlsx") => read_workbook(path)?,
        _ => bail!("Unsupported artifact type: {}", path.display()),
    };

    rows.into_iter()
        .map(|row| -> Result<UpdateIntent> {
            let column = column_letter_to_index(&row.column)
                .with_context(|| format!("Invalid column {:?}", row.column))?;
            Ok(UpdateIntent::new(row.row, column, row.value)?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch() -> (Vec<UpdateIntent>, Vec<ColorIntent>) {
        let updates = vec![
            UpdateIntent::new(2, 13, "1999").unwrap(),
            UpdateIntent::new(2, 30, "Скидка 20%").unwrap(),
            UpdateIntent::new(3, 13, "ERR: timeout").unwrap(),
            UpdateIntent::new(2, 13, "2099").unwrap(),
        ];
        let colors = vec![ColorIntent::new(2, 30, "#b7e1cd").unwrap()];
        (updates, colors)
    }

    #[test]
    fn rows_keep_order_and_mark_promo() {
        let (updates, colors) = batch();
        let rows = LocalExporter::rows(&updates, &colors);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].column, "M");
        assert_eq!(rows[1].column, "AD");
        assert_eq!(rows[0].promo, "Yes");
        assert_eq!(rows[2].promo, "");
        assert_eq!(rows[3].value, "2099");
    }

    #[test]
    fn both_artifacts_reload_to_the_same_intents() {
        let dir = TempDir::new().unwrap();
        let exporter = LocalExporter::new(dir.path(), "wb_results", "WB Results");
        let (updates, colors) = batch();

        let artifacts = exporter.persist(&updates, &colors);
        let csv = artifacts.csv.unwrap();
        let workbook = artifacts.workbook.unwrap();
        assert!(csv.file_name().unwrap().to_string_lossy().starts_with("wb_results_"));
        assert_eq!(csv.file_stem(), workbook.file_stem());

        assert_eq!(load_artifact(&csv).unwrap(), updates);
        assert_eq!(load_artifact(&workbook).unwrap(), updates);
    }

    #[test]
    fn repeated_persists_never_overwrite() {
        let dir = TempDir::new().unwrap();
        let exporter = LocalExporter::new(dir.path(), "wb_results", "WB Results");
        let (updates, colors) = batch();

        let first = exporter.persist(&updates, &colors);
        let second = exporter.persist(&updates, &colors);
        assert_ne!(first.csv, second.csv);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 4);
    }

    #[test]
    fn workbook_is_a_spreadsheet_with_a_header_row() {
        let dir = TempDir::new().unwrap();
        let exporter = LocalExporter::new(dir.path(), "wb_results", "WB Results");
        let (updates, colors) = batch();

        let path = exporter.persist(&updates, &colors).workbook.unwrap();
        assert_eq!(path.extension().unwrap(), "xlsx");

        let mut workbook: Xlsx<_> = open_workbook(&path).unwrap();
        assert_eq!(workbook.sheet_names(), vec!["WB Results".to_string()]);
        let range = workbook.worksheet_range_at(0).unwrap().unwrap();
        let header: Vec<String> = range.rows().next().unwrap().iter().map(|c| cell_text(Some(c))).collect();
        assert_eq!(header, COLUMNS);
        assert_eq!(range.get_size(), (5, 4));
        assert_eq!(range.get_value((1, 0)), Some(&Data::Float(2.0)));
        assert_eq!(range.get_value((2, 3)), Some(&Data::String("Yes".to_string())));
    }

    #[test]
    fn unwritable_directory_yields_no_artifacts() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let exporter = LocalExporter::new(blocker.join("exports"), "p", "s");

        let (updates, colors) = batch();
        assert!(exporter.persist(&updates, &colors).is_empty());
    }

    #[test]
    fn one_failed_artifact_does_not_block_the_other() {
        let dir = TempDir::new().unwrap();
        let exporter = LocalExporter::new(dir.path(), "p", "Results");
        let (updates, colors) = batch();
        let rows = LocalExporter::rows(&updates, &colors);

        std::fs::create_dir(dir.path().join("blocked.csv")).unwrap();
        let artifacts = exporter.write_artifacts("blocked", &rows);
        assert!(artifacts.csv.is_none());
        assert_eq!(load_artifact(&artifacts.workbook.unwrap()).unwrap(), updates);

        let bad_title = LocalExporter::new(dir.path(), "p", "bad[title]");
        let artifacts = bad_title.write_artifacts("titled", &rows);
        assert!(artifacts.workbook.is_none());
        assert_eq!(load_artifact(&artifacts.csv.unwrap()).unwrap(), updates);
    }

    #[test]
    fn rejects_unknown_extensions() {
        assert!(load_artifact(Path::new("results.json")).is_err());
    }
}
