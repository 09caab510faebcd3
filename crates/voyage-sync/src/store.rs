//! Catalog persistence seam. Postgres in production, an in-memory store with
//! the same transactional contract for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use voyage_core::{
    check_cheapest_invariant, placeholder_name, AlternativeSailing, CheapestPricing, CruiseId,
    CruiseRecord, InvariantViolation, ItineraryDay, LineId, NormalizedCruise, PortId, PricingLine,
    RegionId, Ship, ShipId, WebhookEvent, WebhookStatus, WriteOutcome,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cruise {cruise_id}: {violation}")]
    Invariant {
        cruise_id: CruiseId,
        #[source]
        violation: InvariantViolation,
    },
    #[error("write step `{step}` failed for cruise {cruise_id}: {reason}")]
    Step {
        cruise_id: CruiseId,
        step: WriteStep,
        reason: String,
    },
    #[error("webhook event {0} does not exist")]
    EventNotFound(Uuid),
    #[error("webhook event {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: WebhookStatus,
        to: WebhookStatus,
    },
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

/// The ordered steps of one cruise write. Any failure rolls back all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteStep {
    LineAndShip,
    PortsAndRegions,
    Cruise,
    Itinerary,
    PricingLines,
    CheapestPricing,
    Alternatives,
    Verify,
}

impl fmt::Display for WriteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteStep::LineAndShip => "line_and_ship",
            WriteStep::PortsAndRegions => "ports_and_regions",
            WriteStep::Cruise => "cruise",
            WriteStep::Itinerary => "itinerary",
            WriteStep::PricingLines => "pricing_lines",
            WriteStep::CheapestPricing => "cheapest_pricing",
            WriteStep::Alternatives => "alternatives",
            WriteStep::Verify => "verify",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Replace the detailed per-rate rows. Off keeps whatever is stored.
    pub write_pricing_lines: bool,
    /// Rewrite even when the stored document hash matches.
    pub force: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            write_pricing_lines: true,
            force: false,
        }
    }
}

/// Half-open range of sail dates, `from <= d < until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SailWindow {
    pub from: NaiveDate,
    pub until: NaiveDate,
}

impl SailWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date < self.until
    }
}

/// A stored cruise whose cheapest-price bookkeeping disagrees with its
/// category prices (or has none).
#[derive(Debug, Clone, PartialEq)]
pub struct RepairCandidate {
    pub cruise_id: CruiseId,
    pub line_id: LineId,
    pub currency: String,
    pub raw_document: serde_json::Value,
}

/// A name with its provenance. Placeholders never overwrite real names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredName {
    pub name: String,
    pub placeholder: bool,
}

impl StoredName {
    pub fn merge(existing: Option<&StoredName>, incoming: Option<&str>, kind: &str, id: i32) -> Self {
        match (incoming, existing) {
            (Some(name), _) => StoredName {
                name: name.to_string(),
                placeholder: false,
            },
            (None, Some(existing)) => existing.clone(),
            (None, None) => StoredName {
                name: placeholder_name(kind, id),
                placeholder: true,
            },
        }
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Write everything one document describes in a single transaction.
    async fn apply_cruise(
        &self,
        cruise: &NormalizedCruise,
        options: ApplyOptions,
    ) -> Result<WriteOutcome, StoreError>;

    /// Deactivate the line's cruises in `window` whose source path is not
    /// among `listed`, the feed paths a full crawl found. Returns how many
    /// rows changed.
    async fn mark_missing_inactive(
        &self,
        line_id: LineId,
        window: SailWindow,
        listed: &[String],
    ) -> Result<u64, StoreError>;

    async fn cruises_needing_repair(&self, limit: usize) -> Result<Vec<RepairCandidate>, StoreError>;

    /// Replace category prices and the cheapest-pricing row of one cruise,
    /// verified like a full write.
    async fn rewrite_prices(&self, pricing: &CheapestPricing) -> Result<(), StoreError>;

    async fn record_webhook_event(&self, event: &WebhookEvent) -> Result<(), StoreError>;

    async fn set_webhook_status(
        &self,
        id: Uuid,
        status: WebhookStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn webhook_event(&self, id: Uuid) -> Result<Option<WebhookEvent>, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredShip {
    pub ship: Ship,
    pub name: StoredName,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPort {
    pub name: StoredName,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Catalog contents, excluding bookkeeping timestamps. Two runs that ingest
/// the same documents produce equal snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogSnapshot {
    pub lines: BTreeMap<LineId, (StoredName, Option<String>)>,
    pub ships: BTreeMap<ShipId, StoredShip>,
    pub ports: BTreeMap<PortId, StoredPort>,
    pub regions: BTreeMap<RegionId, StoredName>,
    pub cruises: BTreeMap<CruiseId, CruiseRecord>,
    pub itinerary: BTreeMap<CruiseId, Vec<ItineraryDay>>,
    pub pricing_lines: BTreeMap<CruiseId, Vec<PricingLine>>,
    pub cheapest: BTreeMap<CruiseId, CheapestPricing>,
    pub alternatives: BTreeMap<CruiseId, Vec<AlternativeSailing>>,
}

impl CatalogSnapshot {
    fn write(
        &mut self,
        cruise: &NormalizedCruise,
        options: ApplyOptions,
        fail_at: Option<WriteStep>,
    ) -> Result<(), StoreError> {
        let id = cruise.cruise.id;
        let step = |step: WriteStep| -> Result<(), StoreError> {
            if fail_at == Some(step) {
                return Err(StoreError::Step {
                    cruise_id: id,
                    step,
                    reason: "injected failure".into(),
                });
            }
            Ok(())
        };

        step(WriteStep::LineAndShip)?;
        let line = &cruise.line;
        let (existing_name, existing_code) = match self.lines.get(&line.id) {
            Some((name, code)) => (Some(name.clone()), code.clone()),
            None => (None, None),
        };
        let name = StoredName::merge(existing_name.as_ref(), line.name.as_deref(), "Line", line.id);
        self.lines
            .insert(line.id, (name, line.code.clone().or(existing_code)));

        let incoming = &cruise.ship;
        let previous = self.ships.get(&incoming.id);
        let merged = match previous {
            Some(prev) => Ship {
                id: incoming.id,
                line_id: incoming.line_id,
                name: incoming.name.clone().or_else(|| prev.ship.name.clone()),
                code: incoming.code.clone().or_else(|| prev.ship.code.clone()),
                tonnage: incoming.tonnage.or(prev.ship.tonnage),
                capacity: incoming.capacity.or(prev.ship.capacity),
                star_rating: incoming.star_rating.or(prev.ship.star_rating),
                launched: incoming.launched.or(prev.ship.launched),
            },
            None => incoming.clone(),
        };
        let ship_name = StoredName::merge(
            previous.map(|p| &p.name),
            incoming.name.as_deref(),
            "Ship",
            incoming.id,
        );
        self.ships.insert(
            incoming.id,
            StoredShip {
                ship: merged,
                name: ship_name,
            },
        );

        step(WriteStep::PortsAndRegions)?;
        for port in &cruise.ports {
            let previous = self.ports.get(&port.id);
            let stored = StoredPort {
                name: StoredName::merge(previous.map(|p| &p.name), port.name.as_deref(), "Port", port.id),
                country: port.country.clone().or_else(|| previous.and_then(|p| p.country.clone())),
                latitude: port.latitude.or_else(|| previous.and_then(|p| p.latitude)),
                longitude: port.longitude.or_else(|| previous.and_then(|p| p.longitude)),
            };
            self.ports.insert(port.id, stored);
        }
        for region in &cruise.regions {
            let merged = StoredName::merge(
                self.regions.get(&region.id),
                region.name.as_deref(),
                "Region",
                region.id,
            );
            self.regions.insert(region.id, merged);
        }

        step(WriteStep::Cruise)?;
        self.cruises.insert(id, cruise.cruise.clone());

        step(WriteStep::Itinerary)?;
        self.itinerary.insert(id, cruise.itinerary.clone());

        step(WriteStep::PricingLines)?;
        if options.write_pricing_lines {
            self.pricing_lines.insert(id, cruise.pricing_lines.clone());
        }

        step(WriteStep::CheapestPricing)?;
        self.cheapest.insert(id, cruise.cheapest.clone());

        step(WriteStep::Alternatives)?;
        self.alternatives.insert(id, cruise.alternatives.clone());

        step(WriteStep::Verify)?;
        self.verify(id)
    }

    /// Read back what was written and check the cheapest-price invariant on
    /// both the cruise row and its cheapest-pricing row.
    fn verify(&self, id: CruiseId) -> Result<(), StoreError> {
        let Some(cruise) = self.cruises.get(&id) else {
            return Err(StoreError::Decode(format!("cruise {id} vanished mid-write")));
        };
        let categories = [
            cruise.interior_price,
            cruise.oceanview_price,
            cruise.balcony_price,
            cruise.suite_price,
        ];
        check_cheapest_invariant(categories, cruise.cheapest_price)
            .map_err(|violation| StoreError::Invariant {
                cruise_id: id,
                violation,
            })?;
        if let Some(cheapest) = self.cheapest.get(&id) {
            cheapest.check_invariant().map_err(|violation| StoreError::Invariant {
                cruise_id: id,
                violation,
            })?;
            if cheapest.prices.values() != categories {
                return Err(StoreError::Invariant {
                    cruise_id: id,
                    violation: InvariantViolation {
                        stored: cheapest.cheapest_price,
                        expected: cruise.cheapest_price,
                    },
                });
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    catalog: CatalogSnapshot,
    synced_at: BTreeMap<CruiseId, DateTime<Utc>>,
    events: BTreeMap<Uuid, WebhookEvent>,
    fail_at: Option<WriteStep>,
    writes: usize,
}

/// Snapshot-isolated in-memory catalog: each write runs against a copy that
/// replaces the live state only when every step succeeded.
#[derive(Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every subsequent write fails at `step` until cleared with `None`.
    pub fn fail_at(&self, step: Option<WriteStep>) {
        self.state().fail_at = step;
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        self.state().catalog.clone()
    }

    /// Committed cruise writes (inserted or updated).
    pub fn write_count(&self) -> usize {
        self.state().writes
    }

    pub fn cruise(&self, id: CruiseId) -> Option<CruiseRecord> {
        self.state().catalog.cruises.get(&id).cloned()
    }

    pub fn cheapest(&self, id: CruiseId) -> Option<CheapestPricing> {
        self.state().catalog.cheapest.get(&id).cloned()
    }

    pub fn last_synced_at(&self, id: CruiseId) -> Option<DateTime<Utc>> {
        self.state().synced_at.get(&id).copied()
    }

    pub fn events(&self) -> Vec<WebhookEvent> {
        self.state().events.values().cloned().collect()
    }

    /// Overwrite the stored cheapest price without any checks, the way drift
    /// appears in a long-lived database.
    pub fn tamper_cheapest_price(&self, id: CruiseId, value: Option<f64>) {
        let mut state = self.state();
        if let Some(cruise) = state.catalog.cruises.get_mut(&id) {
            cruise.cheapest_price = value;
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn apply_cruise(
        &self,
        cruise: &NormalizedCruise,
        options: ApplyOptions,
    ) -> Result<WriteOutcome, StoreError> {
        let mut state = self.state();
        let id = cruise.cruise.id;
        let existing = state.catalog.cruises.get(&id);
        let outcome = match existing {
            Some(stored)
                if !options.force && stored.is_active && stored.raw_hash == cruise.cruise.raw_hash =>
            {
                return Ok(WriteOutcome::Unchanged)
            }
            Some(_) => WriteOutcome::Updated,
            None => WriteOutcome::Inserted,
        };

        let mut next = state.catalog.clone();
        next.write(cruise, options, state.fail_at)?;
        state.catalog = next;
        state.synced_at.insert(id, Utc::now());
        state.writes += 1;
        Ok(outcome)
    }

    async fn mark_missing_inactive(
        &self,
        line_id: LineId,
        window: SailWindow,
        listed: &[String],
    ) -> Result<u64, StoreError> {
        let listed: BTreeSet<&str> = listed.iter().map(String::as_str).collect();
        let mut state = self.state();
        let mut changed = 0;
        for cruise in state.catalog.cruises.values_mut() {
            if cruise.line_id == line_id
                && cruise.is_active
                && window.contains(cruise.sail_date)
                && !listed.contains(cruise.source_path.as_str())
            {
                cruise.is_active = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn cruises_needing_repair(&self, limit: usize) -> Result<Vec<RepairCandidate>, StoreError> {
        let state = self.state();
        Ok(state
            .catalog
            .cruises
            .values()
            .filter(|c| {
                let categories = [c.interior_price, c.oceanview_price, c.balcony_price, c.suite_price];
                let cheapest = state.catalog.cheapest.get(&c.id);
                check_cheapest_invariant(categories, c.cheapest_price).is_err()
                    || cheapest.is_none_or(|p| p.cheapest_price != c.cheapest_price)
            })
            .take(limit)
            .map(|c| RepairCandidate {
                cruise_id: c.id,
                line_id: c.line_id,
                currency: c.currency.clone(),
                raw_document: c.raw_document.clone(),
            })
            .collect())
    }

    async fn rewrite_prices(&self, pricing: &CheapestPricing) -> Result<(), StoreError> {
        let mut state = self.state();
        let id = pricing.cruise_id;
        let mut next = state.catalog.clone();
        let Some(cruise) = next.cruises.get_mut(&id) else {
            return Err(StoreError::Decode(format!("cruise {id} does not exist")));
        };
        let [interior, oceanview, balcony, suite] = pricing.prices.values();
        cruise.interior_price = interior;
        cruise.oceanview_price = oceanview;
        cruise.balcony_price = balcony;
        cruise.suite_price = suite;
        cruise.cheapest_price = pricing.cheapest_price;
        next.cheapest.insert(id, pricing.clone());
        next.verify(id)?;
        state.catalog = next;
        Ok(())
    }

    async fn record_webhook_event(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        self.state().events.insert(event.id, event.clone());
        Ok(())
    }

    async fn set_webhook_status(
        &self,
        id: Uuid,
        status: WebhookStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let event = state.events.get_mut(&id).ok_or(StoreError::EventNotFound(id))?;
        if !event.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: event.status,
                to: status,
            });
        }
        event.status = status;
        if status.is_terminal() {
            event.processed_at = Some(Utc::now());
        }
        event.error = error.map(ToString::to_string);
        Ok(())
    }

    async fn webhook_event(&self, id: Uuid) -> Result<Option<WebhookEvent>, StoreError> {
        Ok(self.state().events.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_names_yield_to_real_ones_only() {
        let placeholder = StoredName::merge(None, None, "Port", 118);
        assert_eq!(placeholder.name, "Port 118");
        assert!(placeholder.placeholder);

        let real = StoredName::merge(Some(&placeholder), Some("Miami"), "Port", 118);
        assert_eq!(real.name, "Miami");
        assert!(!real.placeholder);

        let kept = StoredName::merge(Some(&real), None, "Port", 118);
        assert_eq!(kept, real);
    }

    #[test]
    fn sail_window_is_half_open() {
        let window = SailWindow {
            from: NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(),
            until: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        };
        assert!(window.contains(NaiveDate::from_ymd_opt(2025, 5, 1).unwrap()));
        assert!(!window.contains(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()));
    }
}
