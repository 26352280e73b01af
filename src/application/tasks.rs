//! Task collection from the sheet grid

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

lazy_static! {
    static ref WB_CATALOG_ID: Option<Regex> = Regex::new(r"/catalog/(\d+)/").ok();
    static ref OZON_PRODUCT_ID: Option<Regex> = Regex::new(r"/product/(\d+)").ok();
}

/// Marketplace a cell value points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Wildberries,
    Ozon,
    Skip,
}

/// Classify a cell. Bare digits count as `numeric_default`; other
/// non-URL text is skipped.
#[must_use]
pub fn detect_link_kind(value: &str, numeric_default: LinkKind) -> LinkKind {
    let v = value.trim();
    if !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()) {
        return numeric_default;
    }
    let lower = v.to_lowercase();
    if !lower.starts_with("http") {
        return LinkKind::Skip;
    }
    if lower.contains("wildberries") || lower.contains("wb.ru") {
        LinkKind::Wildberries
    } else if lower.contains("ozon.ru") || lower.contains("ozon.by") {
        LinkKind::Ozon
    } else {
        LinkKind::Skip
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Wildberries item id from a catalog link or bare digits
#[must_use]
pub fn extract_nm_id(value: &str) -> Option<String> {
    let v = value.trim();
    WB_CATALOG_ID
        .as_ref()
        .and_then(|re| re.captures(v))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .or_else(|| is_digits(v).then(|| v.to_string()))
}

/// Ozon article from a product link, otherwise the raw value
#[must_use]
pub fn extract_ozon_article(value: &str) -> String {
    let v = value.trim();
    OZON_PRODUCT_ID
        .as_ref()
        .and_then(|re| re.captures(v))
        .and_then(|c| c.get(1))
        .map_or_else(|| v.to_string(), |m| m.as_str().to_string())
}

/// One sheet cell to process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Task {
    /// 1-based sheet row
    pub row: u32,
    pub value: String,
}

/// Scan rows from 2 down in each input column, keeping values of `kind`.
///
/// Identical (row, value) pairs collapse, so a row naming the same item in
/// two input columns yields one task.
#[must_use]
pub fn collect_tasks(grid: &[Vec<String>], input_columns: &[u32], kind: LinkKind) -> Vec<Task> {
    let mut seen = HashSet::new();
    let mut tasks = Vec::new();

    for (index, row) in grid.iter().enumerate().skip(1) {
        let Ok(row_number) = u32::try_from(index + 1) else {
            break;
        };
        for &column in input_columns {
            let Some(cell) = column
                .checked_sub(1)
                .and_then(|c| row.get(usize::try_from(c).ok()?))
            else {
                continue;
            };
            let value = cell.trim();
            if value.is_empty() || detect_link_kind(value, kind) != kind {
                continue;
            }
            let task = Task {
                row: row_number,
                value: value.to_string(),
            };
            if seen.insert(task.clone()) {
                tasks.push(task);
            }
        }
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("123456", LinkKind::Wildberries, LinkKind::Wildberries)]
    #[case("123456", LinkKind::Ozon, LinkKind::Ozon)]
    #[case("https://www.wildberries.ru/catalog/1/detail.aspx", LinkKind::Ozon, LinkKind::Wildberries)]
    #[case("https://WB.RU/catalog/1/", LinkKind::Wildberries, LinkKind::Wildberries)]
    #[case("https://www.ozon.by/product/x-42/", LinkKind::Wildberries, LinkKind::Ozon)]
    #[case("www.ozon.ru/product/1", LinkKind::Ozon, LinkKind::Skip)]
    #[case("https://example.com/", LinkKind::Wildberries, LinkKind::Skip)]
    #[case("n/a", LinkKind::Wildberries, LinkKind::Skip)]
    fn classifies_links(#[case] value: &str, #[case] default: LinkKind, #[case] expected: LinkKind) {
        assert_eq!(detect_link_kind(value, default), expected);
    }

    #[test]
    fn extracts_identifiers() {
        assert_eq!(
            extract_nm_id("https://www.wildberries.ru/catalog/987654/detail.aspx").as_deref(),
            Some("987654")
        );
        assert_eq!(extract_nm_id(" 42 ").as_deref(), Some("42"));
        assert_eq!(extract_nm_id("https://www.wildberries.ru/brands/acme"), None);

        assert_eq!(
            extract_ozon_article("https://www.ozon.ru/product/phone-123456/"),
            "https://www.ozon.ru/product/phone-123456/"
        );
        assert_eq!(extract_ozon_article("https://www.ozon.ru/product/1234567/?sh=x"), "1234567");
        assert_eq!(extract_ozon_article("765"), "765");
    }

    #[test]
    fn collects_in_order_and_collapses_duplicates() {
        let grid: Vec<Vec<String>> = vec![
            vec!["header", "sku", "link"],
            vec!["", "111", "111"],
            vec!["", "https://www.ozon.ru/product/9", "https://www.wildberries.ru/catalog/222/detail.aspx"],
            vec![""],
            vec!["", "333"],
        ]
        .into_iter()
        .map(|row| row.into_iter().map(String::from).collect())
        .collect();

        let wb = collect_tasks(&grid, &[2, 3], LinkKind::Wildberries);
        assert_eq!(
            wb,
            vec![
                Task { row: 2, value: "111".into() },
                Task { row: 3, value: "https://www.wildberries.ru/catalog/222/detail.aspx".into() },
                Task { row: 5, value: "333".into() },
            ]
        );

        let ozon = collect_tasks(&grid, &[2], LinkKind::Ozon);
        assert_eq!(ozon.iter().map(|t| t.row).collect::<Vec<_>>(), vec![2, 3, 5]);
    }
}
