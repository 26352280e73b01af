//! Typed shapes of marketplace listing responses
//!
//! Upstream payloads are loosely typed and frequently missing fields, so
//! every field here is optional and absence is kept as `None` instead of
//! leaking raw JSON maps into the rest of the crate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Wildberries CDN card document (`card.json`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WbCard {
    #[serde(default)]
    pub options: Vec<Value>,
}

/// One named characteristic from a card
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WbCardOption {
    pub name: Option<String>,
    pub value: Option<Value>,
}

impl WbCard {
    /// Options that are objects; anything else in the array is ignored
    pub fn named_options(&self) -> impl Iterator<Item = WbCardOption> + '_ {
        self.options
            .iter()
            .filter(|v| v.is_object())
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Wildberries detail endpoint response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WbDetail {
    #[serde(default)]
    pub products: Vec<WbDetailProduct>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WbDetailProduct {
    #[serde(default)]
    pub sizes: Vec<WbSize>,
    pub rating: Option<Number>,
    pub feedbacks: Option<u64>,
    pub nm_feedbacks: Option<u64>,
    pub promo_text_card: Option<String>,
    pub promo_text_cat: Option<String>,
    pub brand: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WbSize {
    pub price: Option<WbPrice>,
}

/// Prices are in kopecks
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct WbPrice {
    pub basic: Option<f64>,
    pub product: Option<f64>,
}

/// Cell-ready summary of one Wildberries item
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProductSummary {
    pub price: String,
    pub rating_reviews: String,
    pub display_type: String,
    pub battery_type: String,
    pub promo: String,
    pub has_promo: bool,
    pub seller: String,
}

impl ProductSummary {
    /// Combine the card and detail documents of one item
    #[must_use]
    pub fn from_documents(card: &WbCard, detail: &WbDetail) -> Self {
        let mut summary = Self::default();

        if let Some(product) = detail.products.first() {
            let prices: Vec<WbPrice> = product.sizes.iter().filter_map(|s| s.price).collect();

            if let Some(kopecks) = prices.iter().filter_map(|p| p.product).find(|p| *p != 0.0) {
                summary.price = format!("{}", (kopecks / 100.0).trunc());
            }

            let rating = product.rating.as_ref().filter(|r| r.as_f64().is_some_and(|v| v != 0.0));
            let feedbacks = product
                .feedbacks
                .filter(|f| *f != 0)
                .or(product.nm_feedbacks)
                .filter(|f| *f != 0);
            summary.rating_reviews = match (rating, feedbacks) {
                (Some(r), Some(f)) => format!("{r} / {f}"),
                (Some(r), None) => r.to_string(),
                _ => String::new(),
            };

            let promo_text = [&product.promo_text_card, &product.promo_text_cat]
                .into_iter()
                .flatten()
                .find(|t| !t.is_empty());
            let discounted = prices.iter().any(|p| match (p.basic, p.product) {
                (Some(basic), Some(current)) => current != 0.0 && basic > current,
                _ => false,
            });
            summary.has_promo = discounted || promo_text.is_some();
            summary.promo = promo_text.cloned().unwrap_or_default();
            summary.seller = product.brand.clone().unwrap_or_default();
        }

        for option in card.named_options() {
            let name = option.name.unwrap_or_default().to_lowercase();
            let Some(value) = option.value.as_ref().and_then(cell_text) else {
                continue;
            };
            if summary.display_type.is_empty() && (name.contains("дисплей") || name.contains("экран")) {
                summary.display_type.clone_from(&value);
            }
            if summary.battery_type.is_empty()
                && (name.contains("аккумулятор") || name.contains("батарея"))
            {
                summary.battery_type = value;
            }
        }

        summary
    }

    /// Value for the combined display/battery column
    #[must_use]
    pub fn display_or_battery(&self) -> &str {
        if self.display_type.is_empty() {
            &self.battery_type
        } else {
            &self.display_type
        }
    }
}

/// Render a JSON scalar the way it should appear in a cell
fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Array(a) if a.is_empty() => None,
        Value::Object(o) if o.is_empty() => None,
        other => Some(other.to_string()),
    }
}

/// Ozon composer page response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OzonPage {
    #[serde(default)]
    pub widget_states: Map<String, Value>,
}

/// Price widget; arrives either inline or as a JSON-encoded string
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OzonWebPrice {
    pub is_available: Option<bool>,
    pub card_price: Option<String>,
    pub price: Option<String>,
}

/// What the composer page says about an item's price
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OzonPriceOutcome {
    Price(String),
    Unavailable,
    Missing,
}

impl OzonPage {
    /// Extract the price from the first `webPrice*` widget.
    ///
    /// Fails only when the widget payload itself cannot be decoded.
    pub fn price(&self) -> Result<OzonPriceOutcome, serde_json::Error> {
        let Some((_, raw)) = self.widget_states.iter().find(|(k, _)| k.starts_with("webPrice")) else {
            return Ok(OzonPriceOutcome::Missing);
        };

        let widget: OzonWebPrice = match raw {
            Value::String(encoded) => serde_json::from_str(encoded)?,
            other => serde_json::from_value(other.clone())?,
        };

        if !widget.is_available.unwrap_or(false) {
            return Ok(OzonPriceOutcome::Unavailable);
        }

        let digits: String = widget
            .card_price
            .filter(|p| !p.is_empty())
            .or(widget.price)
            .unwrap_or_default()
            .chars()
            .filter(char::is_ascii_digit)
            .collect();

        Ok(if digits.is_empty() {
            OzonPriceOutcome::Missing
        } else {
            OzonPriceOutcome::Price(digits)
        })
    }
}
