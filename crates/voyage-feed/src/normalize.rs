//! Map one parsed document onto the relational model.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Days, NaiveDate};
use thiserror::Error;
use tracing::warn;
use voyage_core::{
    AlternativeSailing, CheapestPricing, CruiseLine, CruiseRecord, CruiseRef, ItineraryDay,
    LineId, NormalizedCruise, Port, PortId, PricingLine, Region, Ship,
};

use crate::document::FeedItineraryEntry;
use crate::pricing::{classify_cabin, PricingRules};
use crate::ParsedDocument;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{path}: missing required field `{field}`")]
    Missing { path: String, field: &'static str },
    #[error("{path}: invalid `{field}`: {reason}")]
    Invalid {
        path: String,
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: PricingRules,
    default_currency: String,
    pricing_lines: bool,
}

impl Normalizer {
    pub fn new(rules: PricingRules, default_currency: impl Into<String>) -> Self {
        Self {
            rules,
            default_currency: default_currency.into(),
            pricing_lines: true,
        }
    }

    /// Skip building detailed pricing rows (they can run to thousands per cruise).
    pub fn with_pricing_lines(mut self, enabled: bool) -> Self {
        self.pricing_lines = enabled;
        self
    }

    pub fn rules(&self) -> &PricingRules {
        &self.rules
    }

    pub fn normalize(&self, parsed: &ParsedDocument) -> Result<NormalizedCruise, ValidationError> {
        let doc = &parsed.doc;
        let path = parsed.path.as_str();
        let location = CruiseRef::parse(path).ok();
        let missing = |field: &'static str| ValidationError::Missing {
            path: path.to_string(),
            field,
        };

        let id = doc.codetocruiseid.ok_or_else(|| missing("codetocruiseid"))?;
        let cruise_id = doc
            .cruiseid
            .or(location.map(|l| l.cruise_id))
            .ok_or_else(|| missing("cruiseid"))?;
        let line_id = doc
            .lineid
            .or(location.map(|l| l.line_id))
            .ok_or_else(|| missing("lineid"))?;
        let ship_id = doc
            .shipid
            .or(location.map(|l| l.ship_id))
            .ok_or_else(|| missing("shipid"))?;
        let sail_date = doc.sail_date().ok_or_else(|| missing("saildate"))?;

        let nights = doc
            .nights()
            .unwrap_or_else(|| (doc.itinerary.len() as i32 - 1).max(0));
        if nights < 0 {
            return Err(ValidationError::Invalid {
                path: path.to_string(),
                field: "nights",
                reason: format!("{nights} is negative"),
            });
        }
        let return_date = add_days(sail_date, nights as u64).ok_or_else(|| ValidationError::Invalid {
            path: path.to_string(),
            field: "nights",
            reason: format!("{sail_date} + {nights} nights overflows"),
        })?;

        let prices = self.rules.reconcile(doc, line_id);
        if !prices.has_pricing() {
            warn!(%path, cruise = id, "no category price could be derived");
        }
        if !prices.flags.is_empty() {
            warn!(%path, cruise = id, flags = ?prices.flags, "non-monotonic category prices");
        }

        let currency = doc
            .currency
            .clone()
            .unwrap_or_else(|| self.default_currency.clone());

        let itinerary = self.itinerary(&doc.itinerary, sail_date);
        let embark_port_id = doc
            .startportid
            .filter(|id| *id > 0)
            .or_else(|| doc.portids.iter().copied().find(|id| *id > 0));
        let disembark_port_id = doc
            .endportid
            .filter(|id| *id > 0)
            .or_else(|| doc.portids.iter().rev().copied().find(|id| *id > 0));
        let ports = self.ports(parsed, &itinerary, [embark_port_id, disembark_port_id]);
        let region_names = doc.region_names();
        let regions = dedup_ids(&doc.regionids)
            .into_iter()
            .map(|id| Region {
                id,
                name: region_names.get(&id).cloned(),
            })
            .collect();

        let cruise = CruiseRecord {
            id,
            cruise_id,
            line_id,
            ship_id,
            name: doc.name.clone().unwrap_or_else(|| format!("{nights} Night Cruise")),
            sail_date,
            return_date,
            nights,
            embark_port_id,
            disembark_port_id,
            port_ids: doc.portids.clone(),
            region_ids: dedup_ids(&doc.regionids),
            source_path: parsed.path.clone(),
            raw_document: parsed.raw.clone(),
            raw_hash: parsed.content_hash.clone(),
            interior_price: prices.categories.value(voyage_core::CabinCategory::Interior),
            oceanview_price: prices.categories.value(voyage_core::CabinCategory::Oceanview),
            balcony_price: prices.categories.value(voyage_core::CabinCategory::Balcony),
            suite_price: prices.categories.value(voyage_core::CabinCategory::Suite),
            cheapest_price: prices.cheapest,
            currency: currency.clone(),
            is_active: true,
        };

        let pricing_lines = if self.pricing_lines {
            self.pricing_lines(parsed, line_id, &currency)
        } else {
            Vec::new()
        };

        Ok(NormalizedCruise {
            line: CruiseLine {
                id: line_id,
                name: doc.line_name(),
                code: doc.linecontent.code.clone(),
            },
            ship: Ship {
                id: ship_id,
                line_id,
                name: doc.shipcontent.name.clone(),
                code: doc.shipcontent.code.clone(),
                tonnage: doc.shipcontent.tonnage,
                capacity: doc.shipcontent.occupancy,
                star_rating: doc.shipcontent.starrating,
                launched: doc.shipcontent.launched,
            },
            ports,
            regions,
            cheapest: CheapestPricing::from_reconciled(id, &prices, &currency),
            alternatives: self.alternatives(parsed, line_id),
            itinerary,
            pricing_lines,
            cruise,
        })
    }

    /// Ordered by `(day, orderid)` and renumbered 1..N; dates follow the sail date.
    fn itinerary(&self, entries: &[FeedItineraryEntry], sail_date: NaiveDate) -> Vec<ItineraryDay> {
        let mut ordered: Vec<&FeedItineraryEntry> = entries.iter().collect();
        ordered.sort_by_key(|e| (e.day.unwrap_or(i32::MAX), e.orderid.unwrap_or(i32::MAX)));

        ordered
            .into_iter()
            .enumerate()
            .filter_map(|(idx, entry)| {
                let date = add_days(sail_date, idx as u64)?;
                let name = entry.name.clone();
                let at_sea = name
                    .as_deref()
                    .map(|n| {
                        let n = n.to_ascii_lowercase();
                        n.contains("at sea") || n == "cruising"
                    })
                    .unwrap_or(false);
                let port_id = entry.portid.filter(|id| *id > 0 && !at_sea);
                let is_tender_port = entry.tender
                    || entry
                        .description
                        .as_deref()
                        .is_some_and(|d| d.to_ascii_lowercase().contains("tender"));
                Some(ItineraryDay {
                    day_number: idx as i32 + 1,
                    date,
                    is_sea_day: port_id.is_none(),
                    port_id,
                    port_name: name,
                    arrive_time: entry.arrivetime.clone(),
                    depart_time: entry.departtime.clone(),
                    description: entry.description.clone(),
                    is_tender_port,
                })
            })
            .collect()
    }

    fn ports(
        &self,
        parsed: &ParsedDocument,
        itinerary: &[ItineraryDay],
        endpoints: [Option<PortId>; 2],
    ) -> Vec<Port> {
        let doc = &parsed.doc;
        let mut names = doc.port_names();
        let mut coords: BTreeMap<PortId, (Option<f64>, Option<f64>)> = BTreeMap::new();
        for entry in &doc.itinerary {
            if let Some(id) = entry.portid.filter(|id| *id > 0) {
                coords.entry(id).or_insert((entry.latitude, entry.longitude));
            }
        }
        for day in itinerary {
            if let (Some(id), Some(name)) = (day.port_id, &day.port_name) {
                names.entry(id).or_insert_with(|| name.clone());
            }
        }

        let ids: BTreeSet<PortId> = doc
            .portids
            .iter()
            .copied()
            .chain(endpoints.into_iter().flatten())
            .chain(itinerary.iter().filter_map(|d| d.port_id))
            .filter(|id| *id > 0)
            .collect();

        ids.into_iter()
            .map(|id| {
                let (latitude, longitude) = coords.get(&id).copied().unwrap_or((None, None));
                Port {
                    id,
                    name: names.get(&id).cloned(),
                    country: None,
                    latitude,
                    longitude,
                }
            })
            .collect()
    }

    fn pricing_lines(&self, parsed: &ParsedDocument, line_id: LineId, currency: &str) -> Vec<PricingLine> {
        let doc = &parsed.doc;
        doc.price_matrix()
            .into_iter()
            .map(|cell| {
                let base_price = self.rules.normalize_price(line_id, cell.price);
                let extras: f64 = [cell.taxes, cell.ncf, cell.gratuity]
                    .into_iter()
                    .flatten()
                    .map(|v| self.rules.scale(line_id, v))
                    .sum();
                let hint = doc.cabin_hint(&cell.cabin_code);
                PricingLine {
                    category: classify_cabin(&cell.cabin_code, hint.as_deref()),
                    total_price: base_price.map(|b| ((b + extras) * 100.0).round() / 100.0),
                    base_price,
                    rate_code: cell.rate_code,
                    cabin_code: cell.cabin_code,
                    occupancy_code: cell.occupancy_code,
                    currency: currency.to_string(),
                }
            })
            .collect()
    }

    fn alternatives(&self, parsed: &ParsedDocument, line_id: LineId) -> Vec<AlternativeSailing> {
        let mut by_id: BTreeMap<i64, AlternativeSailing> = BTreeMap::new();
        for alt in parsed.doc.alt_sailings() {
            by_id.entry(alt.id).or_insert(AlternativeSailing {
                alt_cruise_id: alt.id,
                sail_date: alt.sail_date,
                ship_id: alt.ship_id,
                price: alt.price.and_then(|p| self.rules.normalize_price(line_id, p)),
            });
        }
        let mut alternatives: Vec<_> = by_id.into_values().collect();
        alternatives.sort_by_key(|a| (a.sail_date, a.alt_cruise_id));
        alternatives
    }
}

fn add_days(date: NaiveDate, days: u64) -> Option<NaiveDate> {
    date.checked_add_days(Days::new(days))
}

fn dedup_ids(ids: &[i32]) -> Vec<i32> {
    let mut seen = BTreeSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use voyage_core::{CabinCategory, PriceSource};

    fn sample() -> ParsedDocument {
        ParsedDocument::from_value(
            "/2025/05/22/231/345.json",
            json!({
                "cruiseid": 345,
                "codetocruiseid": 2143102,
                "lineid": 22,
                "shipid": 231,
                "name": "7 Night Western Caribbean",
                "saildate": "2025-05-10",
                "nights": 7,
                "portids": "118,9,118",
                "regionids": "4",
                "ports": {"118": "Miami", "9": "Cozumel"},
                "regions": {"4": "Caribbean"},
                "linecontent": {"name": "Royal Caribbean", "code": "RCI"},
                "shipcontent": {"name": "Wonder of the Seas", "tonnage": "236857", "occupancy": 5734},
                "itinerary": [
                    {"day": 2, "portid": 0, "name": "At Sea"},
                    {"day": 1, "portid": 118, "name": "Miami", "departtime": "16:30"},
                    {"day": 3, "portid": 9, "name": "Cozumel", "description": "Tender port"}
                ],
                "cheapestinside": 522.0,
                "cheapest": {"combined": {"inside": 1093.18, "balcony": 980}},
                "prices": {"RATE": {"SU1": {"101": {"price": 2100, "taxes": 150, "ncf": 90}}}},
                "altsailings": [{"id": 2143103, "saildate": "2025-05-17", "price": 540}]
            }),
        )
        .unwrap()
    }

    #[test]
    fn normalizes_a_complete_document() {
        let normalizer = Normalizer::new(PricingRules::default(), "USD");
        let n = normalizer.normalize(&sample()).unwrap();

        assert_eq!(n.cruise.id, 2143102);
        assert_eq!(n.cruise.cruise_id, 345);
        assert_eq!(n.cruise.return_date, NaiveDate::from_ymd_opt(2025, 5, 17).unwrap());
        assert_eq!(n.cruise.embark_port_id, Some(118));
        assert_eq!(n.cruise.disembark_port_id, Some(118));
        assert_eq!(n.cruise.interior_price, Some(522.0));
        assert_eq!(n.cruise.cheapest_price, Some(522.0));
        assert_eq!(n.line.name.as_deref(), Some("Royal Caribbean"));
        assert_eq!(n.ship.tonnage, Some(236857));
        assert_eq!(n.ports.len(), 2);
        assert_eq!(n.regions[0].name.as_deref(), Some("Caribbean"));

        assert_eq!(n.cheapest.prices.suite.map(|p| p.source), Some(PriceSource::Computed));
        assert_eq!(n.cheapest.prices.balcony.map(|p| p.source), Some(PriceSource::Combined));
        assert_eq!(n.cheapest.cheapest_category, Some(CabinCategory::Interior));
        assert!(n.cheapest.check_invariant().is_ok());

        assert_eq!(n.pricing_lines.len(), 1);
        assert_eq!(n.pricing_lines[0].total_price, Some(2340.0));
        assert_eq!(n.alternatives[0].alt_cruise_id, 2143103);
    }

    #[test]
    fn itinerary_is_ordered_renumbered_and_dated() {
        let normalizer = Normalizer::new(PricingRules::default(), "USD");
        let n = normalizer.normalize(&sample()).unwrap();
        let days: Vec<_> = n
            .itinerary
            .iter()
            .map(|d| (d.day_number, d.date.to_string(), d.port_id, d.is_sea_day, d.is_tender_port))
            .collect();
        assert_eq!(
            days,
            vec![
                (1, "2025-05-10".to_string(), Some(118), false, false),
                (2, "2025-05-11".to_string(), None, true, false),
                (3, "2025-05-12".to_string(), Some(9), false, true),
            ]
        );
    }

    #[test]
    fn zero_port_ids_never_become_endpoints() {
        let parsed = ParsedDocument::from_value(
            "/2025/05/22/231/345.json",
            json!({
                "codetocruiseid": 2143102,
                "saildate": "2025-05-10",
                "nights": 7,
                "startportid": 0,
                "endportid": "0",
                "portids": "0,118,9,0",
                "cheapestinside": 522.0,
                "cheapest": null
            }),
        )
        .unwrap();
        let n = Normalizer::new(PricingRules::default(), "USD")
            .normalize(&parsed)
            .unwrap();
        assert_eq!(n.cruise.embark_port_id, Some(118));
        assert_eq!(n.cruise.disembark_port_id, Some(9));
        assert!(n.ports.iter().all(|p| p.id > 0));
        assert_eq!(n.cruise.cheapest_price, Some(522.0));
    }

    #[test]
    fn missing_code_to_cruise_id_is_a_validation_error() {
        let parsed = ParsedDocument::from_value("/2025/05/22/231/345.json", json!({"saildate": "2025-05-10"}))
            .unwrap();
        let err = Normalizer::new(PricingRules::default(), "USD")
            .normalize(&parsed)
            .unwrap_err();
        assert!(matches!(err, ValidationError::Missing { field: "codetocruiseid", .. }));
    }

    #[test]
    fn ids_fall_back_to_the_feed_path() {
        let parsed = ParsedDocument::from_value(
            "/2025/05/22/231/345.json",
            json!({"codetocruiseid": 1, "startdate": "2025-05-10", "nights": 3}),
        )
        .unwrap();
        let n = Normalizer::new(PricingRules::default(), "GBP")
            .normalize(&parsed)
            .unwrap();
        assert_eq!((n.cruise.line_id, n.cruise.ship_id, n.cruise.cruise_id), (22, 231, 345));
        assert_eq!(n.line.name, None);
        assert_eq!(n.cruise.cheapest_price, None);
        assert!(n.cheapest.no_pricing);
        assert_eq!(n.cheapest.currency, "GBP");
    }

    #[test]
    fn pricing_lines_can_be_switched_off() {
        let n = Normalizer::new(PricingRules::default(), "USD")
            .with_pricing_lines(false)
            .normalize(&sample())
            .unwrap();
        assert!(n.pricing_lines.is_empty());
        assert_eq!(n.cheapest.prices.suite.map(|p| p.value), Some(2100.0));
    }
}
