//! Price reconciliation: one canonical price per cabin category.
//!
//! Per category the first valid value wins, in this order: the direct
//! `cheapest<category>` field, `cheapest.combined`, `cheapest.prices`,
//! `cheapest.cachedprices`, then the minimum over the detailed rate matrix.
//! The direct-over-combined ordering is inferred from observed behaviour and
//! is not a documented upstream contract.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use voyage_core::{CabinCategory, CategoryPrice, CategoryPrices, LineId, PriceSource, ReconciledPrices};

use crate::document::{category_value, FeedDocument};
use crate::{DocumentError, ParsedDocument};

/// Lines whose feed reports prices multiplied by this factor.
pub const DEFAULT_SCALE_FACTOR: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PricingRules {
    scaled_lines: BTreeSet<LineId>,
    scale_factor: f64,
}

impl Default for PricingRules {
    fn default() -> Self {
        Self {
            scaled_lines: BTreeSet::new(),
            scale_factor: DEFAULT_SCALE_FACTOR,
        }
    }
}

impl PricingRules {
    pub fn new(scaled_lines: impl IntoIterator<Item = LineId>) -> Self {
        Self {
            scaled_lines: scaled_lines.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn is_scaled(&self, line_id: LineId) -> bool {
        self.scaled_lines.contains(&line_id)
    }

    /// Undo the provider's pre-multiplication for affected lines. Every money
    /// value read from a document goes through here.
    pub fn scale(&self, line_id: LineId, raw: f64) -> f64 {
        if self.is_scaled(line_id) {
            raw / self.scale_factor
        } else {
            raw
        }
    }

    /// Scaled, rounded to cents, and `None` unless strictly positive.
    pub fn normalize_price(&self, line_id: LineId, raw: f64) -> Option<f64> {
        let value = round_cents(self.scale(line_id, raw));
        (value.is_finite() && value > 0.0).then_some(value)
    }

    pub fn reconcile(&self, doc: &FeedDocument, line_id: LineId) -> ReconciledPrices {
        let computed = self.computed_minimums(doc, line_id);
        let mut categories = CategoryPrices::default();

        for category in CabinCategory::ALL {
            let candidates = [
                (PriceSource::Direct, doc.direct_price(category)),
                (PriceSource::Combined, category_value(&doc.cheapest.combined, category)),
                (PriceSource::Static, category_value(&doc.cheapest.prices, category)),
                (PriceSource::Cached, category_value(&doc.cheapest.cachedprices, category)),
            ];
            let picked = candidates
                .into_iter()
                .find_map(|(source, raw)| {
                    let value = self.normalize_price(line_id, raw?)?;
                    Some(CategoryPrice { value, source })
                })
                .or_else(|| {
                    computed.get(&category).map(|value| CategoryPrice {
                        value: *value,
                        source: PriceSource::Computed,
                    })
                });
            categories.set(category, picked);
        }

        ReconciledPrices::from_categories(categories)
    }

    /// Entry point for stored raw documents, which may still carry the
    /// character-indexed corruption. Scaling follows the document's own feed
    /// line id; `fallback_line` only covers documents without one.
    pub fn reconcile_value(
        &self,
        value: Value,
        fallback_line: LineId,
    ) -> Result<ReconciledPrices, DocumentError> {
        let parsed = ParsedDocument::from_value("<stored>", value)?;
        let line_id = parsed.doc.lineid.unwrap_or(fallback_line);
        Ok(self.reconcile(&parsed.doc, line_id))
    }

    fn computed_minimums(&self, doc: &FeedDocument, line_id: LineId) -> BTreeMap<CabinCategory, f64> {
        let mut minimums: BTreeMap<CabinCategory, f64> = BTreeMap::new();
        for cell in doc.price_matrix() {
            let Some(price) = self.normalize_price(line_id, cell.price) else {
                continue;
            };
            let hint = doc.cabin_hint(&cell.cabin_code);
            let Some(category) = classify_cabin(&cell.cabin_code, hint.as_deref()) else {
                continue;
            };
            minimums
                .entry(category)
                .and_modify(|current| *current = current.min(price))
                .or_insert(price);
        }
        minimums
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

const CODE_PREFIXES: &[(&str, CabinCategory)] = &[
    ("ste", CabinCategory::Suite),
    ("su", CabinCategory::Suite),
    ("bal", CabinCategory::Balcony),
    ("vb", CabinCategory::Balcony),
    ("ov", CabinCategory::Oceanview),
    ("oc", CabinCategory::Oceanview),
    ("out", CabinCategory::Oceanview),
    ("int", CabinCategory::Interior),
    ("in", CabinCategory::Interior),
];

fn keyword_category(text: &str) -> Option<CabinCategory> {
    let lower = text.to_ascii_lowercase();
    if lower.contains("suite") {
        Some(CabinCategory::Suite)
    } else if lower.contains("balcon") || lower.contains("veranda") {
        Some(CabinCategory::Balcony)
    } else if lower.contains("ocean") || lower.contains("outside") {
        Some(CabinCategory::Oceanview)
    } else if lower.contains("interior") || lower.contains("inside") {
        Some(CabinCategory::Interior)
    } else {
        None
    }
}

fn prefix_category(code: &str) -> Option<CabinCategory> {
    let lower = code.to_ascii_lowercase();
    let token = lower.split(|c: char| !c.is_ascii_alphanumeric()).next()?;
    CODE_PREFIXES
        .iter()
        .find(|(prefix, _)| token.starts_with(prefix))
        .map(|(_, category)| *category)
}

/// Bucket a cabin code into a category. The document's cabin metadata wins
/// when it names a category; otherwise keywords, then code prefixes.
pub fn classify_cabin(code: &str, hint: Option<&str>) -> Option<CabinCategory> {
    hint.and_then(keyword_category)
        .or_else(|| keyword_category(code))
        .or_else(|| prefix_category(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> FeedDocument {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn direct_field_outranks_combined() {
        let d = doc(json!({"cheapestinside": 522.00, "cheapest": {"combined": {"inside": 1093.18}}}));
        let prices = PricingRules::default().reconcile(&d, 22);
        let interior = prices.categories.interior.unwrap();
        assert_eq!(interior.value, 522.00);
        assert_eq!(interior.source, PriceSource::Direct);
    }

    #[test]
    fn scaled_line_divides_direct_values() {
        let d = doc(json!({"cheapestinside": 522000}));
        let prices = PricingRules::new([329]).reconcile(&d, 329);
        assert_eq!(prices.categories.value(CabinCategory::Interior), Some(522.00));
        assert_eq!(prices.cheapest, Some(522.00));
    }

    #[test]
    fn scaling_is_identical_for_direct_and_combined() {
        let rules = PricingRules::new([329]);
        let direct = rules.reconcile(&doc(json!({"cheapestbalcony": "1234567"})), 329);
        let combined = rules.reconcile(&doc(json!({"cheapest": {"combined": {"balcony": 1234567}}})), 329);
        assert_eq!(
            direct.categories.value(CabinCategory::Balcony),
            combined.categories.value(CabinCategory::Balcony)
        );
        assert_eq!(direct.categories.value(CabinCategory::Balcony), Some(1234.57));
        assert_eq!(
            combined.categories.balcony.map(|p| p.source),
            Some(PriceSource::Combined)
        );
    }

    #[test]
    fn unscaled_lines_are_left_alone() {
        let d = doc(json!({"cheapestinside": 522000}));
        let prices = PricingRules::new([329]).reconcile(&d, 22);
        assert_eq!(prices.categories.value(CabinCategory::Interior), Some(522000.0));
    }

    #[test]
    fn computed_minimum_within_bucket() {
        let d = doc(json!({
            "prices": {
                "BESTRATE": {
                    "INT-A": {"101": {"price": 410.00}},
                    "INT-B": {"101": {"price": 399.00}}
                }
            }
        }));
        let prices = PricingRules::default().reconcile(&d, 22);
        let interior = prices.categories.interior.unwrap();
        assert_eq!(interior.value, 399.00);
        assert_eq!(interior.source, PriceSource::Computed);
        assert_eq!(prices.categories.oceanview, None);
    }

    #[test]
    fn invalid_values_fall_through_to_next_source() {
        let d = doc(json!({
            "cheapestoutside": 0,
            "cheapest": {
                "combined": {"outside": "-5"},
                "prices": {"outside": null},
                "cachedprices": {"outside": 812.5}
            }
        }));
        let prices = PricingRules::default().reconcile(&d, 22);
        let oceanview = prices.categories.oceanview.unwrap();
        assert_eq!(oceanview.value, 812.5);
        assert_eq!(oceanview.source, PriceSource::Cached);
    }

    #[test]
    fn no_sources_yield_null_not_zero() {
        let prices = PricingRules::default().reconcile(&doc(json!({"cheapestinside": "n/a"})), 22);
        assert!(prices.categories.is_empty());
        assert_eq!(prices.cheapest, None);
        assert!(!prices.has_pricing());
    }

    #[test]
    fn flags_non_monotonic_categories_without_rejecting() {
        let d = doc(json!({"cheapestinside": 900, "cheapestoutside": 700, "cheapestbalcony": 800}));
        let prices = PricingRules::default().reconcile(&d, 22);
        assert_eq!(prices.cheapest, Some(700.0));
        assert_eq!(prices.flags, vec!["interior>oceanview".to_string()]);
    }

    #[test]
    fn cabin_metadata_overrides_code_guess() {
        let d = doc(json!({
            "cabins": {"4N": {"codtype": "balcony", "name": "Deluxe"}},
            "prices": {"R": {"4N": {"101": {"price": 1500}}, "IN": {"101": {"price": 700}}}}
        }));
        let prices = PricingRules::default().reconcile(&d, 22);
        assert_eq!(prices.categories.value(CabinCategory::Balcony), Some(1500.0));
        assert_eq!(prices.categories.value(CabinCategory::Interior), Some(700.0));
    }

    #[test]
    fn classifies_codes_by_keyword_and_prefix() {
        assert_eq!(classify_cabin("JUNIOR SUITE BALCONY", None), Some(CabinCategory::Suite));
        assert_eq!(classify_cabin("VERANDA", None), Some(CabinCategory::Balcony));
        assert_eq!(classify_cabin("OV1", None), Some(CabinCategory::Oceanview));
        assert_eq!(classify_cabin("INT-B", None), Some(CabinCategory::Interior));
        assert_eq!(classify_cabin("XQ", None), None);
    }

    #[test]
    fn corrupted_documents_reconcile_like_clean_ones() {
        let clean = json!({"cheapestinside": 522.0, "cheapest": {"combined": {"suite": 2400}}});
        let rules = PricingRules::default();
        let expected = rules.reconcile_value(clean.clone(), 22).unwrap();
        let repaired = rules.reconcile_value(crate::char_indexed(&clean), 22).unwrap();
        assert_eq!(expected, repaired);
        assert_eq!(repaired.cheapest, Some(522.0));
    }

    #[test]
    fn stored_documents_scale_by_their_feed_line() {
        let rules = PricingRules::new([329]);
        let stored = json!({"lineid": 329, "cheapestinside": 522000});
        let prices = rules.reconcile_value(stored, 7).unwrap();
        assert_eq!(prices.cheapest, Some(522.0));

        let unlabelled = rules.reconcile_value(json!({"cheapestinside": 522000}), 329).unwrap();
        assert_eq!(unlabelled.cheapest, Some(522.0));
    }
}
