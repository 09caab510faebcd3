//! Normalize a parsed document and write it through the catalog store.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;
use voyage_core::{CruiseId, LineId, NormalizedCruise, WriteOutcome};
use voyage_feed::{Normalizer, ParsedDocument, ValidationError};

use crate::config::LineMappings;
use crate::store::{ApplyOptions, CatalogStore, StoreError};

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertReport {
    pub cruise_id: CruiseId,
    pub outcome: WriteOutcome,
    /// No category price could be derived; the cruise is stored unpriced.
    pub no_pricing: bool,
    pub flags: Vec<String>,
}

#[derive(Clone)]
pub struct Upserter {
    store: Arc<dyn CatalogStore>,
    normalizer: Normalizer,
    options: ApplyOptions,
    lines: LineMappings,
}

impl Upserter {
    pub fn new(store: Arc<dyn CatalogStore>, normalizer: Normalizer, options: ApplyOptions) -> Self {
        Self {
            store,
            normalizer,
            options,
            lines: LineMappings::default(),
        }
    }

    /// Rows are written under the catalog line id; feed line ids keep
    /// naming directories and job slots.
    pub fn with_line_mappings(mut self, lines: LineMappings) -> Self {
        self.lines = lines;
        self
    }

    pub fn catalog_line(&self, feed_line: LineId) -> LineId {
        self.lines.resolve(feed_line)
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.options.force = force;
        self
    }

    pub async fn upsert(&self, parsed: &ParsedDocument) -> Result<UpsertReport, UpsertError> {
        let mut cruise = self.normalizer.normalize(parsed)?;
        self.remap_line(&mut cruise);
        let outcome = self.store.apply_cruise(&cruise, self.options).await?;
        if cruise.cheapest.no_pricing && outcome != WriteOutcome::Unchanged {
            warn!(path = %parsed.path, cruise_id = cruise.cruise.id, "stored without pricing");
        }
        Ok(UpsertReport {
            cruise_id: cruise.cruise.id,
            outcome,
            no_pricing: cruise.cheapest.no_pricing,
            flags: cruise.cheapest.flags,
        })
    }

    fn remap_line(&self, cruise: &mut NormalizedCruise) {
        let line_id = self.catalog_line(cruise.line.id);
        cruise.line.id = line_id;
        cruise.ship.line_id = line_id;
        cruise.cruise.line_id = line_id;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use voyage_feed::PricingRules;

    use super::*;
    use crate::store::{MemoryCatalogStore, WriteStep};

    fn document(id: i64, interior: f64) -> ParsedDocument {
        ParsedDocument::from_value(
            format!("/2025/05/22/231/{id}.json"),
            json!({
                "codetocruiseid": id,
                "cruiseid": 900 + id,
                "lineid": 22,
                "shipid": 231,
                "saildate": "2025-05-10",
                "nights": 3,
                "name": "Bahamas Getaway",
                "startportid": 118,
                "portids": [118, 4031, 118],
                "cheapestinside": interior,
                "cheapestoutside": 799,
                "itinerary": [
                    {"day": 1, "portid": 118, "name": "Miami"},
                    {"day": 2, "portid": 4031, "name": "Nassau"},
                    {"day": 3, "portid": 0, "name": "At Sea"},
                    {"day": 4, "portid": 118, "name": "Miami"}
                ]
            }),
        )
        .unwrap()
    }

    fn upserter(store: Arc<MemoryCatalogStore>) -> Upserter {
        Upserter::new(
            store,
            Normalizer::new(PricingRules::new([329]), "USD"),
            ApplyOptions::default(),
        )
    }

    #[tokio::test]
    async fn reingesting_the_same_document_is_a_no_op() {
        let store = Arc::new(MemoryCatalogStore::new());
        let upserter = upserter(Arc::clone(&store));
        let doc = document(1, 522.0);

        let first = upserter.upsert(&doc).await.unwrap();
        let after_first = store.snapshot();
        let second = upserter.upsert(&doc).await.unwrap();

        assert_eq!(first.outcome, WriteOutcome::Inserted);
        assert_eq!(second.outcome, WriteOutcome::Unchanged);
        assert_eq!(store.snapshot(), after_first);
        assert_eq!(store.write_count(), 1);

        let forced = upserter.clone().with_force(true).upsert(&doc).await.unwrap();
        assert_eq!(forced.outcome, WriteOutcome::Updated);
        assert_eq!(store.snapshot(), after_first);
    }

    #[tokio::test]
    async fn failed_step_rolls_back_the_whole_document() {
        let store = Arc::new(MemoryCatalogStore::new());
        let upserter = upserter(Arc::clone(&store));
        upserter.upsert(&document(1, 522.0)).await.unwrap();
        let before = store.snapshot();

        store.fail_at(Some(WriteStep::Alternatives));
        let err = upserter.upsert(&document(1, 480.0)).await.unwrap_err();
        assert!(matches!(
            err,
            UpsertError::Store(StoreError::Step { step: WriteStep::Alternatives, .. })
        ));
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.cruise(1).unwrap().interior_price, Some(522.0));

        store.fail_at(None);
        let report = upserter.upsert(&document(1, 480.0)).await.unwrap();
        assert_eq!(report.outcome, WriteOutcome::Updated);
        assert_eq!(store.cheapest(1).unwrap().cheapest_price, Some(480.0));
    }

    #[tokio::test]
    async fn unnamed_references_get_placeholders() {
        let store = Arc::new(MemoryCatalogStore::new());
        upserter(Arc::clone(&store)).upsert(&document(1, 522.0)).await.unwrap();

        let snapshot = store.snapshot();
        let (line, _) = &snapshot.lines[&22];
        assert_eq!(line.name, "Line 22");
        assert!(line.placeholder);
        assert_eq!(snapshot.ports[&4031].name.name, "Nassau");
        assert!(!snapshot.ports[&4031].name.placeholder);
    }

    #[tokio::test]
    async fn rows_are_written_under_the_catalog_line() {
        let store = Arc::new(MemoryCatalogStore::new());
        let upserter = upserter(Arc::clone(&store)).with_line_mappings(LineMappings::new(1, [(22, 7)]));
        upserter.upsert(&document(1, 522.0)).await.unwrap();

        let cruise = store.cruise(1).unwrap();
        assert_eq!(cruise.line_id, 7);
        assert_eq!(cruise.source_path, "/2025/05/22/231/1.json");
        let snapshot = store.snapshot();
        assert!(snapshot.lines.contains_key(&7));
        assert!(!snapshot.lines.contains_key(&22));
        assert_eq!(upserter.catalog_line(22), 7);
        assert_eq!(upserter.catalog_line(15), 15);
    }

    #[tokio::test]
    async fn invalid_documents_never_reach_the_store() {
        let store = Arc::new(MemoryCatalogStore::new());
        let doc = ParsedDocument::from_value("/2025/05/22/231/5.json", json!({"lineid": 22})).unwrap();

        let err = upserter(Arc::clone(&store)).upsert(&doc).await.unwrap_err();
        assert!(matches!(err, UpsertError::Validation(_)));
        assert_eq!(store.write_count(), 0);
    }
}
