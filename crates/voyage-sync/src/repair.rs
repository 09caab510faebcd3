//! Periodic reconciliation of stored cheapest prices against the stored raw
//! documents.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};
use voyage_core::CheapestPricing;
use voyage_feed::PricingRules;

use crate::store::{CatalogStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub scanned: usize,
    pub repaired: usize,
    /// Stored documents that no longer parse even after corruption repair.
    pub unreadable: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct PriceRepairer {
    store: Arc<dyn CatalogStore>,
    rules: PricingRules,
    batch_limit: usize,
}

impl PriceRepairer {
    pub fn new(store: Arc<dyn CatalogStore>, rules: PricingRules) -> Self {
        Self {
            store,
            rules,
            batch_limit: 1_000,
        }
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// Recompute category and cheapest prices for every cruise whose stored
    /// values disagree, from its stored raw document.
    #[instrument(skip_all)]
    pub async fn repair_cheapest_pricing(&self) -> Result<RepairReport, StoreError> {
        let candidates = self.store.cruises_needing_repair(self.batch_limit).await?;
        let mut report = RepairReport {
            scanned: candidates.len(),
            ..RepairReport::default()
        };

        for candidate in candidates {
            let prices = match self.rules.reconcile_value(candidate.raw_document, candidate.line_id) {
                Ok(prices) => prices,
                Err(err) => {
                    warn!(cruise_id = candidate.cruise_id, error = %err, "stored document unreadable");
                    report.unreadable += 1;
                    continue;
                }
            };
            let pricing = CheapestPricing::from_reconciled(candidate.cruise_id, &prices, &candidate.currency);
            match self.store.rewrite_prices(&pricing).await {
                Ok(()) => report.repaired += 1,
                Err(err) => {
                    warn!(cruise_id = candidate.cruise_id, error = %err, "price repair failed");
                    report.failed += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                repaired = report.repaired,
                unreadable = report.unreadable,
                failed = report.failed,
                "cheapest-price repair finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use voyage_feed::{Normalizer, ParsedDocument};

    use super::*;
    use crate::store::{ApplyOptions, MemoryCatalogStore};
    use crate::upsert::Upserter;

    #[tokio::test]
    async fn drifted_cheapest_prices_are_recomputed() {
        let store = Arc::new(MemoryCatalogStore::new());
        let rules = PricingRules::new([329]);
        let upserter = Upserter::new(
            store.clone(),
            Normalizer::new(rules.clone(), "USD"),
            ApplyOptions::default(),
        );
        let doc = ParsedDocument::from_value(
            "/2025/05/22/231/8.json",
            json!({
                "codetocruiseid": 8,
                "lineid": 22,
                "shipid": 231,
                "saildate": "2025-05-10",
                "nights": 7,
                "cheapestinside": "522.00",
                "cheapest": {"combined": {"balcony": 901}}
            }),
        )
        .unwrap();
        upserter.upsert(&doc).await.unwrap();

        store.tamper_cheapest_price(8, Some(1.0));
        let repairer = PriceRepairer::new(store.clone(), rules);
        let report = repairer.repair_cheapest_pricing().await.unwrap();

        assert_eq!((report.scanned, report.repaired), (1, 1));
        assert_eq!(store.cruise(8).unwrap().cheapest_price, Some(522.0));
        assert_eq!(repairer.repair_cheapest_pricing().await.unwrap().scanned, 0);
    }
}
