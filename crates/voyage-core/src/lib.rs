//! Core domain model for the cruise feed pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod path;

pub use path::{feed_path, line_dir, month_dir, ship_dir, CruiseRef, PathError};

pub const CRATE_NAME: &str = "voyage-core";

pub type LineId = i32;
pub type ShipId = i32;
pub type PortId = i32;
pub type RegionId = i32;
/// Internal cruise id: the upstream "code-to-cruise" id, stable per sailing instance.
pub type CruiseId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CabinCategory {
    Interior,
    Oceanview,
    Balcony,
    Suite,
}

impl CabinCategory {
    /// Cabin classes in ascending expected price order.
    pub const ALL: [CabinCategory; 4] = [
        CabinCategory::Interior,
        CabinCategory::Oceanview,
        CabinCategory::Balcony,
        CabinCategory::Suite,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CabinCategory::Interior => "interior",
            CabinCategory::Oceanview => "oceanview",
            CabinCategory::Balcony => "balcony",
            CabinCategory::Suite => "suite",
        }
    }
}

impl fmt::Display for CabinCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CabinCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interior" => Ok(CabinCategory::Interior),
            "oceanview" => Ok(CabinCategory::Oceanview),
            "balcony" => Ok(CabinCategory::Balcony),
            "suite" => Ok(CabinCategory::Suite),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Which part of the document a category price was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Direct,
    Combined,
    Static,
    Cached,
    Computed,
}

impl PriceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PriceSource::Direct => "direct",
            PriceSource::Combined => "combined",
            PriceSource::Static => "static",
            PriceSource::Cached => "cached",
            PriceSource::Computed => "computed",
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriceSource {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(PriceSource::Direct),
            "combined" => Ok(PriceSource::Combined),
            "static" => Ok(PriceSource::Static),
            "cached" => Ok(PriceSource::Cached),
            "computed" => Ok(PriceSource::Computed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown variant `{0}`")]
pub struct UnknownVariant(pub String);

/// A category price together with the source that won.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CategoryPrice {
    pub value: f64,
    pub source: PriceSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CategoryPrices {
    pub interior: Option<CategoryPrice>,
    pub oceanview: Option<CategoryPrice>,
    pub balcony: Option<CategoryPrice>,
    pub suite: Option<CategoryPrice>,
}

impl CategoryPrices {
    pub fn get(&self, category: CabinCategory) -> Option<CategoryPrice> {
        match category {
            CabinCategory::Interior => self.interior,
            CabinCategory::Oceanview => self.oceanview,
            CabinCategory::Balcony => self.balcony,
            CabinCategory::Suite => self.suite,
        }
    }

    pub fn set(&mut self, category: CabinCategory, price: Option<CategoryPrice>) {
        let slot = match category {
            CabinCategory::Interior => &mut self.interior,
            CabinCategory::Oceanview => &mut self.oceanview,
            CabinCategory::Balcony => &mut self.balcony,
            CabinCategory::Suite => &mut self.suite,
        };
        *slot = price;
    }

    pub fn value(&self, category: CabinCategory) -> Option<f64> {
        self.get(category).map(|p| p.value)
    }

    /// Plain values in `CabinCategory::ALL` order.
    pub fn values(&self) -> [Option<f64>; 4] {
        CabinCategory::ALL.map(|c| self.value(c))
    }

    pub fn is_empty(&self) -> bool {
        self.values().iter().all(Option::is_none)
    }

    /// Lowest present category price, ties resolved toward the cheaper cabin class.
    pub fn cheapest(&self) -> Option<(CabinCategory, f64)> {
        CabinCategory::ALL
            .iter()
            .filter_map(|c| self.value(*c).map(|v| (*c, v)))
            .fold(None, |best, (c, v)| match best {
                Some((_, bv)) if bv <= v => best,
                _ => Some((c, v)),
            })
    }
}

/// Output of price reconciliation for one document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReconciledPrices {
    pub categories: CategoryPrices,
    pub cheapest: Option<f64>,
    pub cheapest_category: Option<CabinCategory>,
    /// Non-monotonic category pairs such as `interior>oceanview`.
    pub flags: Vec<String>,
}

impl ReconciledPrices {
    pub fn from_categories(categories: CategoryPrices) -> Self {
        let cheapest = categories.cheapest();
        Self {
            flags: monotonic_flags(&categories),
            cheapest: cheapest.map(|(_, v)| v),
            cheapest_category: cheapest.map(|(c, _)| c),
            categories,
        }
    }

    pub fn has_pricing(&self) -> bool {
        self.cheapest.is_some()
    }

    pub fn cheapest_source(&self) -> Option<PriceSource> {
        self.cheapest_category
            .and_then(|c| self.categories.get(c))
            .map(|p| p.source)
    }
}

/// Adjacent present categories that break `interior <= oceanview <= balcony <= suite`.
pub fn monotonic_flags(categories: &CategoryPrices) -> Vec<String> {
    let present: Vec<(CabinCategory, f64)> = CabinCategory::ALL
        .iter()
        .filter_map(|c| categories.value(*c).map(|v| (*c, v)))
        .collect();
    present
        .windows(2)
        .filter(|pair| pair[0].1 > pair[1].1)
        .map(|pair| format!("{}>{}", pair[0].0, pair[1].0))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("cheapest price {stored:?} does not match category minimum {expected:?}")]
pub struct InvariantViolation {
    pub stored: Option<f64>,
    pub expected: Option<f64>,
}

/// `cheapest == min(non-null category prices)`; both null when no category is priced.
pub fn check_cheapest_invariant(
    categories: [Option<f64>; 4],
    cheapest: Option<f64>,
) -> Result<(), InvariantViolation> {
    let expected = categories
        .iter()
        .flatten()
        .copied()
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))));
    let matches = match (expected, cheapest) {
        (None, None) => true,
        (Some(e), Some(s)) => (e - s).abs() < 0.005,
        _ => false,
    };
    if matches {
        Ok(())
    } else {
        Err(InvariantViolation {
            stored: cheapest,
            expected,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CruiseLine {
    pub id: LineId,
    /// `None` when the document does not name the line; stored as a placeholder.
    pub name: Option<String>,
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ship {
    pub id: ShipId,
    pub line_id: LineId,
    pub name: Option<String>,
    pub code: Option<String>,
    pub tonnage: Option<i32>,
    pub capacity: Option<i32>,
    pub star_rating: Option<f64>,
    pub launched: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub name: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub name: Option<String>,
}

/// Display name used when an entity is referenced without a name.
pub fn placeholder_name(kind: &str, id: i32) -> String {
    format!("{kind} {id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CruiseRecord {
    pub id: CruiseId,
    /// Upstream cruise id; repeats across sailing instances of one itinerary.
    pub cruise_id: i64,
    pub line_id: LineId,
    pub ship_id: ShipId,
    pub name: String,
    pub sail_date: NaiveDate,
    pub return_date: NaiveDate,
    pub nights: i32,
    pub embark_port_id: Option<PortId>,
    pub disembark_port_id: Option<PortId>,
    pub port_ids: Vec<PortId>,
    pub region_ids: Vec<RegionId>,
    pub source_path: String,
    pub raw_document: serde_json::Value,
    pub raw_hash: String,
    pub interior_price: Option<f64>,
    pub oceanview_price: Option<f64>,
    pub balcony_price: Option<f64>,
    pub suite_price: Option<f64>,
    pub cheapest_price: Option<f64>,
    pub currency: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItineraryDay {
    pub day_number: i32,
    pub date: NaiveDate,
    pub port_id: Option<PortId>,
    pub port_name: Option<String>,
    pub arrive_time: Option<String>,
    pub depart_time: Option<String>,
    pub description: Option<String>,
    pub is_sea_day: bool,
    pub is_tender_port: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingLine {
    pub rate_code: String,
    pub cabin_code: String,
    pub occupancy_code: String,
    pub category: Option<CabinCategory>,
    pub base_price: Option<f64>,
    pub total_price: Option<f64>,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheapestPricing {
    pub cruise_id: CruiseId,
    pub prices: CategoryPrices,
    pub cheapest_price: Option<f64>,
    pub cheapest_category: Option<CabinCategory>,
    pub currency: String,
    pub no_pricing: bool,
    pub flags: Vec<String>,
}

impl CheapestPricing {
    pub fn from_reconciled(cruise_id: CruiseId, prices: &ReconciledPrices, currency: &str) -> Self {
        Self {
            cruise_id,
            prices: prices.categories,
            cheapest_price: prices.cheapest,
            cheapest_category: prices.cheapest_category,
            currency: currency.to_string(),
            no_pricing: !prices.has_pricing(),
            flags: prices.flags.clone(),
        }
    }

    pub fn check_invariant(&self) -> Result<(), InvariantViolation> {
        check_cheapest_invariant(self.prices.values(), self.cheapest_price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeSailing {
    pub alt_cruise_id: i64,
    pub sail_date: Option<NaiveDate>,
    pub ship_id: Option<ShipId>,
    pub price: Option<f64>,
}

/// Everything one feed document writes, in dependency order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedCruise {
    pub line: CruiseLine,
    pub ship: Ship,
    pub ports: Vec<Port>,
    pub regions: Vec<Region>,
    pub cruise: CruiseRecord,
    pub itinerary: Vec<ItineraryDay>,
    pub pricing_lines: Vec<PricingLine>,
    pub cheapest: CheapestPricing,
    pub alternatives: Vec<AlternativeSailing>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "cruiseline_pricing_updated")]
    LinePricingUpdated,
    #[serde(rename = "cruises_live_pricing_updated")]
    LivePricingUpdated,
}

impl WebhookEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookEventType::LinePricingUpdated => "cruiseline_pricing_updated",
            WebhookEventType::LivePricingUpdated => "cruises_live_pricing_updated",
        }
    }
}

impl FromStr for WebhookEventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cruiseline_pricing_updated" => Ok(WebhookEventType::LinePricingUpdated),
            "cruises_live_pricing_updated" => Ok(WebhookEventType::LivePricingUpdated),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Processing => "processing",
            WebhookStatus::Completed => "completed",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WebhookStatus::Completed | WebhookStatus::Failed)
    }

    /// `pending -> processing -> completed | failed`; terminal states never move.
    pub fn can_transition_to(self, next: WebhookStatus) -> bool {
        matches!(
            (self, next),
            (WebhookStatus::Pending, WebhookStatus::Processing)
                | (WebhookStatus::Processing, WebhookStatus::Completed)
                | (WebhookStatus::Processing, WebhookStatus::Failed)
        )
    }
}

impl FromStr for WebhookStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WebhookStatus::Pending),
            "processing" => Ok(WebhookStatus::Processing),
            "completed" => Ok(WebhookStatus::Completed),
            "failed" => Ok(WebhookStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Append-only audit record of one inbound webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub job_id: Uuid,
    pub external_line_id: LineId,
    pub line_id: LineId,
    pub event_type: WebhookEventType,
    pub currency: Option<String>,
    pub paths: Vec<String>,
    pub received_at: DateTime<Utc>,
    pub status: WebhookStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price(value: f64) -> Option<CategoryPrice> {
        Some(CategoryPrice {
            value,
            source: PriceSource::Direct,
        })
    }

    #[test]
    fn cheapest_is_minimum_of_present_categories() {
        let categories = CategoryPrices {
            interior: None,
            oceanview: price(799.0),
            balcony: price(650.0),
            suite: price(2100.0),
        };
        let reconciled = ReconciledPrices::from_categories(categories);
        assert_eq!(reconciled.cheapest, Some(650.0));
        assert_eq!(reconciled.cheapest_category, Some(CabinCategory::Balcony));
        assert_eq!(reconciled.flags, vec!["oceanview>balcony".to_string()]);
    }

    #[test]
    fn no_categories_means_no_cheapest() {
        let reconciled = ReconciledPrices::from_categories(CategoryPrices::default());
        assert!(!reconciled.has_pricing());
        assert!(reconciled.flags.is_empty());
        assert!(check_cheapest_invariant([None; 4], None).is_ok());
    }

    #[test]
    fn invariant_rejects_stale_cheapest() {
        let err = check_cheapest_invariant([Some(500.0), Some(600.0), None, None], Some(450.0))
            .unwrap_err();
        assert_eq!(err.expected, Some(500.0));
        assert!(check_cheapest_invariant([None, Some(600.0), None, None], None).is_err());
    }

    #[test]
    fn webhook_status_transitions_are_one_way() {
        assert!(WebhookStatus::Pending.can_transition_to(WebhookStatus::Processing));
        assert!(WebhookStatus::Processing.can_transition_to(WebhookStatus::Failed));
        assert!(!WebhookStatus::Completed.can_transition_to(WebhookStatus::Processing));
        assert!(!WebhookStatus::Pending.can_transition_to(WebhookStatus::Completed));
    }

    #[test]
    fn webhook_event_type_uses_feed_names() {
        let parsed: WebhookEventType =
            serde_json::from_str("\"cruiseline_pricing_updated\"").unwrap();
        assert_eq!(parsed, WebhookEventType::LinePricingUpdated);
        assert_eq!(
            "cruises_live_pricing_updated".parse::<WebhookEventType>().unwrap(),
            WebhookEventType::LivePricingUpdated
        );
    }
}
