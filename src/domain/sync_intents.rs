//! Cell update intents accumulated by a job before a batch flush

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntentError {
    #[error("row and column keys are 1-based, got ({row}, {column})")]
    InvalidCell { row: u32, column: u32 },

    #[error("color {0:?} is not a 6-digit hex value")]
    InvalidColor(String),
}

/// A single cell value to write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateIntent {
    pub row: u32,
    pub column: u32,
    pub value: String,
}

impl UpdateIntent {
    pub fn new(row: u32, column: u32, value: impl Into<String>) -> Result<Self, IntentError> {
        check_cell(row, column)?;
        Ok(Self {
            row,
            column,
            value: value.into(),
        })
    }
}

/// A single-cell background color annotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorIntent {
    pub row: u32,
    pub column: u32,
    /// Six uppercase-or-lowercase hex digits, without `#`
    pub color_hex: String,
}

impl ColorIntent {
    pub fn new(row: u32, column: u32, color_hex: &str) -> Result<Self, IntentError> {
        check_cell(row, column)?;
        let hex = color_hex.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IntentError::InvalidColor(color_hex.to_string()));
        }
        Ok(Self {
            row,
            column,
            color_hex: hex.to_string(),
        })
    }

    /// Color channels scaled to `0.0..=1.0`
    #[must_use]
    pub fn rgb(&self) -> (f32, f32, f32) {
        let channel = |i: usize| {
            u8::from_str_radix(&self.color_hex[i..i + 2], 16).map_or(0.0, |v| f32::from(v) / 255.0)
        };
        (channel(0), channel(2), channel(4))
    }
}

fn check_cell(row: u32, column: u32) -> Result<(), IntentError> {
    if row == 0 || column == 0 {
        return Err(IntentError::InvalidCell { row, column });
    }
    Ok(())
}

/// Insertion-ordered batch of pending writes, owned by one job
#[derive(Debug, Clone, Default)]
pub struct UpdateBatch {
    updates: Vec<UpdateIntent>,
    colors: Vec<ColorIntent>,
}

impl UpdateBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_update(&mut self, intent: UpdateIntent) {
        self.updates.push(intent);
    }

    pub fn push_color(&mut self, intent: ColorIntent) {
        self.colors.push(intent);
    }

    /// Queue a value, silently ignoring out-of-range cells
    pub fn set(&mut self, row: u32, column: u32, value: impl Into<String>) {
        match UpdateIntent::new(row, column, value) {
            Ok(intent) => self.updates.push(intent),
            Err(e) => tracing::warn!("Dropping update intent: {}", e),
        }
    }

    #[must_use]
    pub fn updates(&self) -> &[UpdateIntent] {
        &self.updates
    }

    #[must_use]
    pub fn colors(&self) -> &[ColorIntent] {
        &self.colors
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.colors.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    /// Take everything out, leaving the batch empty
    pub fn drain(&mut self) -> (Vec<UpdateIntent>, Vec<ColorIntent>) {
        (std::mem::take(&mut self.updates), std::mem::take(&mut self.colors))
    }
}
