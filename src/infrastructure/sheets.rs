//! Tabular store interface and A1 addressing
//!
//! The sync engine talks to the spreadsheet only through [`SheetStore`].

pub mod google;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use google::GoogleSheetsStore;

/// A value destined for one A1 range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellWrite {
    pub range: String,
    pub value: String,
}

/// A background color for one cell, channels in `0.0..=1.0`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellBackground {
    /// 1-based
    pub row: u32,
    /// 1-based
    pub column: u32,
    pub rgb: (f32, f32, f32),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl StoreError {
    /// Structured signal first, message text as a fallback
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Rejected { status: 429, .. } => true,
            Self::Rejected { message, .. } | Self::Transport(message) => {
                let lower = message.to_lowercase();
                lower.contains("quota") || lower.contains("rate")
            }
        }
    }
}

#[async_trait]
pub trait SheetStore: Send + Sync {
    /// Every row of the target sheet, ragged rows as returned
    async fn read_all_values(&self) -> Result<Vec<Vec<String>>, StoreError>;

    async fn batch_write_cells(&self, cells: &[CellWrite]) -> Result<(), StoreError>;

    async fn batch_set_background(&self, cells: &[CellBackground]) -> Result<(), StoreError>;
}

/// `"A"` → 1, `"AD"` → 30. `None` for anything but ASCII letters.
#[must_use]
pub fn column_letter_to_index(letters: &str) -> Option<u32> {
    if letters.is_empty() {
        return None;
    }
    letters.bytes().try_fold(0u32, |acc, b| {
        if !b.is_ascii_alphabetic() {
            return None;
        }
        let digit = u32::from(b.to_ascii_uppercase() - b'A') + 1;
        acc.checked_mul(26)?.checked_add(digit)
    })
}

/// 1 → `"A"`, 30 → `"AD"`. Column 0 has no letters.
#[must_use]
pub fn column_index_to_letter(index: u32) -> String {
    let mut n = index;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(char::from(b'A' + u8::try_from(rem).unwrap_or(0)));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

#[must_use]
pub fn a1(row: u32, column: u32) -> String {
    format!("{}{}", column_index_to_letter(column), row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("A", 1)]
    #[case("k", 11)]
    #[case("Z", 26)]
    #[case("AA", 27)]
    #[case("AD", 30)]
    #[case("ZZ", 702)]
    fn letters_map_to_indices(#[case] letters: &str, #[case] index: u32) {
        assert_eq!(column_letter_to_index(letters), Some(index));
        assert_eq!(column_index_to_letter(index), letters.to_uppercase());
    }

    #[test]
    fn rejects_non_letters() {
        assert_eq!(column_letter_to_index(""), None);
        assert_eq!(column_letter_to_index("A1"), None);
        assert_eq!(column_index_to_letter(0), "");
        assert_eq!(a1(2, 13), "M2");
    }

    #[test]
    fn rate_limit_detection_prefers_structure() {
        assert!(StoreError::RateLimited { message: String::new() }.is_rate_limited());
        assert!(StoreError::Rejected { status: 429, message: "slow down".into() }.is_rate_limited());
        assert!(StoreError::Transport("Quota exceeded for quota metric".into()).is_rate_limited());
        assert!(!StoreError::Rejected { status: 400, message: "bad range".into() }.is_rate_limited());
    }

    proptest! {
        #[test]
        fn column_letters_round_trip(index in 1u32..100_000) {
            prop_assert_eq!(column_letter_to_index(&column_index_to_letter(index)), Some(index));
        }
    }
}
