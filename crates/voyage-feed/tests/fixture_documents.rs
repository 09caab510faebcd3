use std::path::Path;

use chrono::NaiveDate;
use voyage_core::{CabinCategory, NormalizedCruise, PriceSource};
use voyage_feed::{char_indexed, Normalizer, ParsedDocument, PricingRules, Repair};

fn fixture(name: &str) -> Vec<u8> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
    std::fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

fn normalizer() -> Normalizer {
    Normalizer::new(PricingRules::new([329]), "USD")
}

fn normalize(feed_path: &str, name: &str) -> NormalizedCruise {
    let parsed = ParsedDocument::from_bytes(feed_path, &fixture(name)).unwrap();
    normalizer().normalize(&parsed).unwrap()
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

#[test]
fn direct_price_wins_and_itinerary_is_dated() {
    let n = normalize("/2025/05/22/231/2143102.json", "direct_and_combined.json");

    let prices = &n.cheapest.prices;
    let interior = prices.get(CabinCategory::Interior).unwrap();
    assert_eq!((interior.value, interior.source), (522.00, PriceSource::Direct));
    assert_eq!(prices.value(CabinCategory::Oceanview), Some(689.00));
    assert_eq!(prices.value(CabinCategory::Balcony), Some(901.50));
    let suite = prices.get(CabinCategory::Suite).unwrap();
    assert_eq!((suite.value, suite.source), (2400.0, PriceSource::Cached));
    assert_eq!(n.cheapest.cheapest_price, Some(522.00));
    assert_eq!(n.cheapest.cheapest_category, Some(CabinCategory::Interior));
    assert!(n.cheapest.check_invariant().is_ok());
    assert_eq!(n.cruise.cheapest_price, n.cheapest.cheapest_price);

    assert_eq!(n.cruise.return_date, date("2025-05-17"));
    assert_eq!(n.itinerary.len(), 8);
    assert_eq!(n.itinerary.iter().filter(|d| d.is_sea_day).count(), 4);
    assert_eq!(n.itinerary[7].date, date("2025-05-17"));
    assert_eq!(n.itinerary[0].depart_time.as_deref(), Some("16:30"));

    let port_ids: Vec<i32> = n.ports.iter().map(|p| p.id).collect();
    assert_eq!(port_ids, vec![9, 118, 4031]);
    assert_eq!(n.line.name.as_deref(), Some("Royal Caribbean"));
    assert_eq!(n.regions[0].name.as_deref(), Some("Caribbean"));
}

#[test]
fn scaled_line_prices_are_divided() {
    let n = normalize("/2025/06/329/5120/990011.json", "scaled_line.json");

    assert_eq!(n.cruise.interior_price, Some(522.00));
    assert_eq!(n.cruise.balcony_price, Some(1234.57));
    assert_eq!(n.cruise.cheapest_price, Some(522.00));

    let unscaled = ParsedDocument::from_bytes("/2025/06/329/5120/990011.json", &fixture("scaled_line.json")).unwrap();
    let raw = Normalizer::new(PricingRules::default(), "USD").normalize(&unscaled).unwrap();
    assert_eq!(raw.cruise.interior_price, Some(522_000.0));
}

#[test]
fn rate_matrix_fills_missing_categories() {
    let n = normalize("/2025/07/16/77/55001.json", "rate_matrix.json");

    let interior = n.cheapest.prices.get(CabinCategory::Interior).unwrap();
    assert_eq!((interior.value, interior.source), (399.00, PriceSource::Computed));
    assert_eq!(n.cheapest.prices.value(CabinCategory::Oceanview), Some(575.0));
    assert_eq!(n.cheapest.cheapest_price, Some(399.00));
    assert!(!n.cheapest.no_pricing);

    assert_eq!(n.pricing_lines.len(), 3);
    let int_b = n.pricing_lines.iter().find(|l| l.cabin_code == "INT-B").unwrap();
    assert_eq!(int_b.total_price, Some(519.00));
    assert_eq!(n.cruise.return_date, date("2025-07-06"));
    assert_eq!(n.alternatives.len(), 1);
    assert_eq!(n.alternatives[0].price, Some(640.0));

    let without = ParsedDocument::from_bytes("/2025/07/16/77/55001.json", &fixture("rate_matrix.json")).unwrap();
    let lean = normalizer().with_pricing_lines(false).normalize(&without).unwrap();
    assert!(lean.pricing_lines.is_empty());
    assert_eq!(lean.cheapest, n.cheapest);
}

#[test]
fn char_indexed_document_normalizes_like_the_clean_one() {
    let clean_bytes = fixture("direct_and_combined.json");
    let clean: serde_json::Value = serde_json::from_slice(&clean_bytes).unwrap();
    let corrupted = serde_json::to_vec(&char_indexed(&clean)).unwrap();

    let parsed = ParsedDocument::from_bytes("/2025/05/22/231/2143102.json", &corrupted).unwrap();
    assert!(matches!(parsed.repair, Some(Repair::CharIndexed { .. })));

    let repaired = normalizer().normalize(&parsed).unwrap();
    let expected = normalize("/2025/05/22/231/2143102.json", "direct_and_combined.json");
    assert_eq!(repaired, expected);
    assert_eq!(repaired.cruise.raw_hash, expected.cruise.raw_hash);
}

#[test]
fn truncated_document_is_a_parse_error() {
    let bytes = fixture("scaled_line.json");
    let truncated = &bytes[..bytes.len() / 2];
    assert!(ParsedDocument::from_bytes("/2025/06/329/5120/990011.json", truncated).is_err());
}
