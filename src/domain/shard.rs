//! Storage shard routing for numeric item identifiers
//!
//! Item cards live on CDN hosts partitioned into numbered shards. The shard
//! is selected from the item's *volume* (its identifier with the last five
//! digits removed) through a fixed table of inclusive upper bounds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inclusive volume upper bounds, ascending, with their shard ids
const SHARD_TABLE: &[(u64, &str)] = &[
    (143, "01"),
    (287, "02"),
    (431, "03"),
    (719, "04"),
    (1007, "05"),
    (1061, "06"),
    (1115, "07"),
    (1169, "08"),
    (1313, "09"),
    (1601, "10"),
    (1655, "11"),
    (1919, "12"),
    (2045, "13"),
    (2189, "14"),
    (2405, "15"),
    (2621, "16"),
    (2837, "17"),
    (3053, "18"),
    (3269, "19"),
    (3485, "20"),
    (3701, "21"),
    (3917, "22"),
    (4133, "23"),
    (4349, "24"),
    (4565, "25"),
    (4877, "26"),
    (5189, "27"),
    (5501, "28"),
    (5813, "29"),
    (6125, "30"),
    (6437, "31"),
    (6749, "32"),
    (7061, "33"),
    (7373, "34"),
    (7685, "35"),
    (7997, "36"),
    (8309, "37"),
];

/// Shard used for every volume above the last table bound
pub const CATCH_ALL_SHARD: &str = "38";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardError {
    #[error("identifier {0:?} is not a non-negative integer")]
    InvalidIdentifier(String),
}

/// Storage location of one item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardAddress {
    pub shard_id: String,
    pub volume_id: String,
    pub id_prefix: String,
}

impl ShardAddress {
    /// CDN URL of the item card document
    #[must_use]
    pub fn card_url(&self, item_id: &str) -> String {
        format!(
            "https://basket-{}.wbbasket.ru/vol{}/part{}/{}/info/ru/card.json",
            self.shard_id, self.volume_id, self.id_prefix, item_id
        )
    }
}

/// Map a volume number to its shard id
#[must_use]
pub fn shard_for_volume(volume: u64) -> &'static str {
    SHARD_TABLE
        .iter()
        .find(|(upper, _)| volume <= *upper)
        .map_or(CATCH_ALL_SHARD, |(_, shard)| shard)
}

/// Resolve the storage address of a numeric identifier.
///
/// Pure and deterministic; identical input always yields an identical
/// address.
pub fn resolve(numeric_id: &str) -> Result<ShardAddress, ShardError> {
    let id = numeric_id.trim();
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ShardError::InvalidIdentifier(numeric_id.to_string()));
    }

    let prefix = &id[..id.len().saturating_sub(3)];
    let volume_digits = if prefix.len() > 2 {
        &prefix[..prefix.len() - 2]
    } else {
        "0"
    };

    let canonical = match volume_digits.trim_start_matches('0') {
        "" => "0",
        digits => digits,
    };
    // Anything wider than u64 is far past the last bound anyway.
    let volume = canonical.parse::<u64>().unwrap_or(u64::MAX);

    Ok(ShardAddress {
        shard_id: shard_for_volume(volume).to_string(),
        volume_id: canonical.to_string(),
        id_prefix: prefix.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn resolves_nine_digit_identifier() {
        let address = resolve("123456789").unwrap();
        assert_eq!(address.id_prefix, "123456");
        assert_eq!(address.volume_id, "1234");
        assert_eq!(address.shard_id, "09");
        assert_eq!(resolve("123456789").unwrap(), address);
        assert_eq!(
            address.card_url("123456789"),
            "https://basket-09.wbbasket.ru/vol1234/part123456/123456789/info/ru/card.json"
        );
    }

    #[rstest]
    #[case("7", "0", "", "01")]
    #[case("12345", "0", "12", "01")]
    #[case("14399999", "143", "14399", "01")]
    #[case("14400000", "144", "14400", "02")]
    #[case("830999999", "8309", "830999", "37")]
    #[case("831000000", "8310", "831000", "38")]
    #[case("0012345678", "123", "0012345", "01")]
    fn resolves_boundaries(
        #[case] id: &str,
        #[case] volume: &str,
        #[case] prefix: &str,
        #[case] shard: &str,
    ) {
        let address = resolve(id).unwrap();
        assert_eq!(address.volume_id, volume);
        assert_eq!(address.id_prefix, prefix);
        assert_eq!(address.shard_id, shard);
    }

    #[rstest]
    #[case("")]
    #[case("12a45")]
    #[case("-12345")]
    #[case("1.5")]
    fn rejects_non_numeric(#[case] id: &str) {
        assert!(matches!(resolve(id), Err(ShardError::InvalidIdentifier(_))));
    }

    #[test]
    fn huge_identifiers_land_in_catch_all() {
        let address = resolve("99999999999999999999999999999").unwrap();
        assert_eq!(address.shard_id, CATCH_ALL_SHARD);
    }

    #[test]
    fn every_table_bound_maps_to_its_own_shard() {
        for (upper, shard) in SHARD_TABLE {
            assert_eq!(shard_for_volume(*upper), *shard);
            assert_ne!(shard_for_volume(upper + 1), *shard);
        }
        assert_eq!(shard_for_volume(u64::MAX), CATCH_ALL_SHARD);
    }

    proptest! {
        #[test]
        fn shard_ids_never_decrease(a in 0u64..20_000, b in 0u64..20_000) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(shard_for_volume(lo) <= shard_for_volume(hi));
        }

        #[test]
        fn resolve_is_deterministic(id in "[0-9]{1,15}") {
            prop_assert_eq!(resolve(&id).unwrap(), resolve(&id).unwrap());
        }
    }
}
