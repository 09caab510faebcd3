//! Postgres catalog store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use voyage_core::{
    check_cheapest_invariant, AlternativeSailing, CabinCategory, CheapestPricing, CruiseId,
    CruiseLine, CruiseRecord, InvariantViolation, ItineraryDay, LineId, NormalizedCruise, Port,
    PricingLine, Region, Ship, WebhookEvent, WebhookStatus, WriteOutcome,
};

use crate::store::{
    ApplyOptions, CatalogStore, RepairCandidate, SailWindow, StoreError, StoredName, WriteStep,
};

/// Postgres bind parameters are capped at 65535 per statement.
const INSERT_CHUNK: usize = 1_000;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(2))
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

#[derive(Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn step_error(cruise_id: CruiseId, step: WriteStep) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| {
        warn!(cruise_id, %step, error = %err, "cruise write step failed");
        StoreError::Step {
            cruise_id,
            step,
            reason: err.to_string(),
        }
    }
}

async fn upsert_line(conn: &mut PgConnection, line: &CruiseLine) -> Result<(), sqlx::Error> {
    let name = StoredName::merge(None, line.name.as_deref(), "Line", line.id);
    sqlx::query(
        r#"
        INSERT INTO cruise_lines (id, name, name_is_placeholder, code)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE SET
          name = CASE WHEN EXCLUDED.name_is_placeholder THEN cruise_lines.name ELSE EXCLUDED.name END,
          name_is_placeholder = cruise_lines.name_is_placeholder AND EXCLUDED.name_is_placeholder,
          code = COALESCE(EXCLUDED.code, cruise_lines.code),
          updated_at = now()
        "#,
    )
    .bind(line.id)
    .bind(name.name)
    .bind(name.placeholder)
    .bind(line.code.as_deref())
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_ship(conn: &mut PgConnection, ship: &Ship) -> Result<(), sqlx::Error> {
    let name = StoredName::merge(None, ship.name.as_deref(), "Ship", ship.id);
    sqlx::query(
        r#"
        INSERT INTO ships (id, line_id, name, name_is_placeholder, code, tonnage, capacity, star_rating, launched)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET
          line_id = EXCLUDED.line_id,
          name = CASE WHEN EXCLUDED.name_is_placeholder THEN ships.name ELSE EXCLUDED.name END,
          name_is_placeholder = ships.name_is_placeholder AND EXCLUDED.name_is_placeholder,
          code = COALESCE(EXCLUDED.code, ships.code),
          tonnage = COALESCE(EXCLUDED.tonnage, ships.tonnage),
          capacity = COALESCE(EXCLUDED.capacity, ships.capacity),
          star_rating = COALESCE(EXCLUDED.star_rating, ships.star_rating),
          launched = COALESCE(EXCLUDED.launched, ships.launched),
          updated_at = now()
        "#,
    )
    .bind(ship.id)
    .bind(ship.line_id)
    .bind(name.name)
    .bind(name.placeholder)
    .bind(ship.code.as_deref())
    .bind(ship.tonnage)
    .bind(ship.capacity)
    .bind(ship.star_rating)
    .bind(ship.launched)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_port(conn: &mut PgConnection, port: &Port) -> Result<(), sqlx::Error> {
    let name = StoredName::merge(None, port.name.as_deref(), "Port", port.id);
    sqlx::query(
        r#"
        INSERT INTO ports (id, name, name_is_placeholder, country, latitude, longitude)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE SET
          name = CASE WHEN EXCLUDED.name_is_placeholder THEN ports.name ELSE EXCLUDED.name END,
          name_is_placeholder = ports.name_is_placeholder AND EXCLUDED.name_is_placeholder,
          country = COALESCE(EXCLUDED.country, ports.country),
          latitude = COALESCE(EXCLUDED.latitude, ports.latitude),
          longitude = COALESCE(EXCLUDED.longitude, ports.longitude),
          updated_at = now()
        "#,
    )
    .bind(port.id)
    .bind(name.name)
    .bind(name.placeholder)
    .bind(port.country.as_deref())
    .bind(port.latitude)
    .bind(port.longitude)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_region(conn: &mut PgConnection, region: &Region) -> Result<(), sqlx::Error> {
    let name = StoredName::merge(None, region.name.as_deref(), "Region", region.id);
    sqlx::query(
        r#"
        INSERT INTO regions (id, name, name_is_placeholder)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE SET
          name = CASE WHEN EXCLUDED.name_is_placeholder THEN regions.name ELSE EXCLUDED.name END,
          name_is_placeholder = regions.name_is_placeholder AND EXCLUDED.name_is_placeholder,
          updated_at = now()
        "#,
    )
    .bind(region.id)
    .bind(name.name)
    .bind(name.placeholder)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_cruise(conn: &mut PgConnection, cruise: &CruiseRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO cruises (
          id, cruise_id, line_id, ship_id, name, sail_date, return_date, nights,
          embark_port_id, disembark_port_id, port_ids, region_ids,
          source_path, raw_document, raw_hash,
          interior_price, oceanview_price, balcony_price, suite_price, cheapest_price,
          currency, is_active, last_synced_at
        )
        VALUES (
          $1, $2, $3, $4, $5, $6, $7, $8,
          $9, $10, $11, $12,
          $13, $14, $15,
          $16::numeric, $17::numeric, $18::numeric, $19::numeric, $20::numeric,
          $21, $22, now()
        )
        ON CONFLICT (id) DO UPDATE SET
          cruise_id = EXCLUDED.cruise_id,
          line_id = EXCLUDED.line_id,
          ship_id = EXCLUDED.ship_id,
          name = EXCLUDED.name,
          sail_date = EXCLUDED.sail_date,
          return_date = EXCLUDED.return_date,
          nights = EXCLUDED.nights,
          embark_port_id = EXCLUDED.embark_port_id,
          disembark_port_id = EXCLUDED.disembark_port_id,
          port_ids = EXCLUDED.port_ids,
          region_ids = EXCLUDED.region_ids,
          source_path = EXCLUDED.source_path,
          raw_document = EXCLUDED.raw_document,
          raw_hash = EXCLUDED.raw_hash,
          interior_price = EXCLUDED.interior_price,
          oceanview_price = EXCLUDED.oceanview_price,
          balcony_price = EXCLUDED.balcony_price,
          suite_price = EXCLUDED.suite_price,
          cheapest_price = EXCLUDED.cheapest_price,
          currency = EXCLUDED.currency,
          is_active = EXCLUDED.is_active,
          last_synced_at = now(),
          updated_at = now()
        "#,
    )
    .bind(cruise.id)
    .bind(cruise.cruise_id)
    .bind(cruise.line_id)
    .bind(cruise.ship_id)
    .bind(&cruise.name)
    .bind(cruise.sail_date)
    .bind(cruise.return_date)
    .bind(cruise.nights)
    .bind(cruise.embark_port_id)
    .bind(cruise.disembark_port_id)
    .bind(&cruise.port_ids)
    .bind(&cruise.region_ids)
    .bind(&cruise.source_path)
    .bind(&cruise.raw_document)
    .bind(&cruise.raw_hash)
    .bind(cruise.interior_price)
    .bind(cruise.oceanview_price)
    .bind(cruise.balcony_price)
    .bind(cruise.suite_price)
    .bind(cruise.cheapest_price)
    .bind(&cruise.currency)
    .bind(cruise.is_active)
    .execute(conn)
    .await?;
    Ok(())
}

async fn replace_itinerary(
    conn: &mut PgConnection,
    cruise_id: CruiseId,
    days: &[ItineraryDay],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM itinerary_days WHERE cruise_id = $1")
        .bind(cruise_id)
        .execute(&mut *conn)
        .await?;
    for chunk in days.chunks(INSERT_CHUNK) {
        let mut insert = QueryBuilder::<Postgres>::new(
            "INSERT INTO itinerary_days (cruise_id, day_number, date, port_id, port_name, \
             arrive_time, depart_time, description, is_sea_day, is_tender_port) ",
        );
        insert.push_values(chunk, |mut row, day| {
            row.push_bind(cruise_id)
                .push_bind(day.day_number)
                .push_bind(day.date)
                .push_bind(day.port_id)
                .push_bind(day.port_name.clone())
                .push_bind(day.arrive_time.clone())
                .push_bind(day.depart_time.clone())
                .push_bind(day.description.clone())
                .push_bind(day.is_sea_day)
                .push_bind(day.is_tender_port);
        });
        insert.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn replace_pricing_lines(
    conn: &mut PgConnection,
    cruise_id: CruiseId,
    lines: &[PricingLine],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM pricing_lines WHERE cruise_id = $1")
        .bind(cruise_id)
        .execute(&mut *conn)
        .await?;
    for chunk in lines.chunks(INSERT_CHUNK) {
        let mut insert = QueryBuilder::<Postgres>::new(
            "INSERT INTO pricing_lines (cruise_id, rate_code, cabin_code, occupancy_code, \
             category, base_price, total_price, currency) ",
        );
        insert.push_values(chunk, |mut row, line| {
            row.push_bind(cruise_id)
                .push_bind(line.rate_code.clone())
                .push_bind(line.cabin_code.clone())
                .push_bind(line.occupancy_code.clone())
                .push_bind(line.category.map(CabinCategory::as_str))
                .push_bind(line.base_price)
                .push_unseparated("::numeric")
                .push_bind(line.total_price)
                .push_unseparated("::numeric")
                .push_bind(line.currency.clone());
        });
        insert.push(" ON CONFLICT (cruise_id, rate_code, cabin_code, occupancy_code) DO NOTHING");
        insert.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn upsert_cheapest(conn: &mut PgConnection, pricing: &CheapestPricing) -> Result<(), sqlx::Error> {
    let source = |category: CabinCategory| pricing.prices.get(category).map(|p| p.source.as_str());
    sqlx::query(
        r#"
        INSERT INTO cheapest_pricing (
          cruise_id,
          interior_price, interior_source, oceanview_price, oceanview_source,
          balcony_price, balcony_source, suite_price, suite_source,
          cheapest_price, cheapest_category, currency, no_pricing, flags, updated_at
        )
        VALUES (
          $1,
          $2::numeric, $3, $4::numeric, $5,
          $6::numeric, $7, $8::numeric, $9,
          $10::numeric, $11, $12, $13, $14, now()
        )
        ON CONFLICT (cruise_id) DO UPDATE SET
          interior_price = EXCLUDED.interior_price,
          interior_source = EXCLUDED.interior_source,
          oceanview_price = EXCLUDED.oceanview_price,
          oceanview_source = EXCLUDED.oceanview_source,
          balcony_price = EXCLUDED.balcony_price,
          balcony_source = EXCLUDED.balcony_source,
          suite_price = EXCLUDED.suite_price,
          suite_source = EXCLUDED.suite_source,
          cheapest_price = EXCLUDED.cheapest_price,
          cheapest_category = EXCLUDED.cheapest_category,
          currency = EXCLUDED.currency,
          no_pricing = EXCLUDED.no_pricing,
          flags = EXCLUDED.flags,
          updated_at = now()
        "#,
    )
    .bind(pricing.cruise_id)
    .bind(pricing.prices.value(CabinCategory::Interior))
    .bind(source(CabinCategory::Interior))
    .bind(pricing.prices.value(CabinCategory::Oceanview))
    .bind(source(CabinCategory::Oceanview))
    .bind(pricing.prices.value(CabinCategory::Balcony))
    .bind(source(CabinCategory::Balcony))
    .bind(pricing.prices.value(CabinCategory::Suite))
    .bind(source(CabinCategory::Suite))
    .bind(pricing.cheapest_price)
    .bind(pricing.cheapest_category.map(CabinCategory::as_str))
    .bind(&pricing.currency)
    .bind(pricing.no_pricing)
    .bind(&pricing.flags)
    .execute(conn)
    .await?;
    Ok(())
}

async fn replace_alternatives(
    conn: &mut PgConnection,
    cruise_id: CruiseId,
    alternatives: &[AlternativeSailing],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM alternative_sailings WHERE cruise_id = $1")
        .bind(cruise_id)
        .execute(&mut *conn)
        .await?;
    for chunk in alternatives.chunks(INSERT_CHUNK) {
        let mut insert = QueryBuilder::<Postgres>::new(
            "INSERT INTO alternative_sailings (cruise_id, alt_cruise_id, sail_date, ship_id, price) ",
        );
        insert.push_values(chunk, |mut row, alt| {
            row.push_bind(cruise_id)
                .push_bind(alt.alt_cruise_id)
                .push_bind(alt.sail_date)
                .push_bind(alt.ship_id)
                .push_bind(alt.price)
                .push_unseparated("::numeric");
        });
        insert.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Read the committed-to-be prices back and check both the cruise row and
/// its cheapest-pricing row against the category minimum.
async fn verify_cheapest(conn: &mut PgConnection, cruise_id: CruiseId) -> Result<(), StoreError> {
    let row = sqlx::query(
        r#"
        SELECT c.interior_price::float8 AS interior,
               c.oceanview_price::float8 AS oceanview,
               c.balcony_price::float8 AS balcony,
               c.suite_price::float8 AS suite,
               c.cheapest_price::float8 AS cheapest,
               cp.cruise_id IS NOT NULL AS has_summary,
               cp.cheapest_price::float8 AS summary_cheapest
          FROM cruises c
          LEFT JOIN cheapest_pricing cp ON cp.cruise_id = c.id
         WHERE c.id = $1
        "#,
    )
    .bind(cruise_id)
    .fetch_optional(conn)
    .await?;
    let Some(row) = row else {
        return Err(StoreError::Decode(format!("cruise {cruise_id} vanished mid-write")));
    };

    let categories: [Option<f64>; 4] = [
        row.try_get("interior")?,
        row.try_get("oceanview")?,
        row.try_get("balcony")?,
        row.try_get("suite")?,
    ];
    let cheapest: Option<f64> = row.try_get("cheapest")?;
    let invariant = |violation: InvariantViolation| StoreError::Invariant {
        cruise_id,
        violation,
    };
    check_cheapest_invariant(categories, cheapest).map_err(invariant)?;
    if row.try_get::<bool, _>("has_summary")? {
        let summary: Option<f64> = row.try_get("summary_cheapest")?;
        check_cheapest_invariant(categories, summary).map_err(invariant)?;
    }
    Ok(())
}

fn event_from_row(row: &PgRow) -> Result<WebhookEvent, StoreError> {
    let event_type: String = row.try_get("event_type")?;
    let status: String = row.try_get("status")?;
    Ok(WebhookEvent {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        external_line_id: row.try_get("external_line_id")?,
        line_id: row.try_get("line_id")?,
        event_type: event_type
            .parse()
            .map_err(|err| StoreError::Decode(format!("event_type: {err}")))?,
        currency: row.try_get("currency")?,
        paths: row.try_get("paths")?,
        received_at: row.try_get::<DateTime<Utc>, _>("received_at")?,
        status: status
            .parse()
            .map_err(|err| StoreError::Decode(format!("status: {err}")))?,
        processed_at: row.try_get("processed_at")?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    #[instrument(skip_all, fields(cruise_id = cruise.cruise.id))]
    async fn apply_cruise(
        &self,
        cruise: &NormalizedCruise,
        options: ApplyOptions,
    ) -> Result<WriteOutcome, StoreError> {
        let id = cruise.cruise.id;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT raw_hash, is_active FROM cruises WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let outcome = match existing {
            Some(row) => {
                let hash: String = row.try_get("raw_hash")?;
                let active: bool = row.try_get("is_active")?;
                if !options.force && active && hash == cruise.cruise.raw_hash {
                    debug!("document unchanged");
                    return Ok(WriteOutcome::Unchanged);
                }
                WriteOutcome::Updated
            }
            None => WriteOutcome::Inserted,
        };

        upsert_line(&mut tx, &cruise.line)
            .await
            .map_err(step_error(id, WriteStep::LineAndShip))?;
        upsert_ship(&mut tx, &cruise.ship)
            .await
            .map_err(step_error(id, WriteStep::LineAndShip))?;

        for port in &cruise.ports {
            upsert_port(&mut tx, port)
                .await
                .map_err(step_error(id, WriteStep::PortsAndRegions))?;
        }
        for region in &cruise.regions {
            upsert_region(&mut tx, region)
                .await
                .map_err(step_error(id, WriteStep::PortsAndRegions))?;
        }

        upsert_cruise(&mut tx, &cruise.cruise)
            .await
            .map_err(step_error(id, WriteStep::Cruise))?;
        replace_itinerary(&mut tx, id, &cruise.itinerary)
            .await
            .map_err(step_error(id, WriteStep::Itinerary))?;
        if options.write_pricing_lines {
            replace_pricing_lines(&mut tx, id, &cruise.pricing_lines)
                .await
                .map_err(step_error(id, WriteStep::PricingLines))?;
        }
        upsert_cheapest(&mut tx, &cruise.cheapest)
            .await
            .map_err(step_error(id, WriteStep::CheapestPricing))?;
        replace_alternatives(&mut tx, id, &cruise.alternatives)
            .await
            .map_err(step_error(id, WriteStep::Alternatives))?;

        verify_cheapest(&mut tx, id).await?;
        tx.commit().await?;
        debug!(?outcome, "cruise written");
        Ok(outcome)
    }

    #[instrument(skip_all, fields(line_id = line_id))]
    async fn mark_missing_inactive(
        &self,
        line_id: LineId,
        window: SailWindow,
        listed: &[String],
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cruises
               SET is_active = FALSE, updated_at = now()
             WHERE line_id = $1
               AND sail_date >= $2
               AND sail_date < $3
               AND is_active
               AND NOT (source_path = ANY($4))
            "#,
        )
        .bind(line_id)
        .bind(window.from)
        .bind(window.until)
        .bind(listed)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip_all)]
    async fn cruises_needing_repair(&self, limit: usize) -> Result<Vec<RepairCandidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.line_id, c.currency, c.raw_document
              FROM cruises c
              LEFT JOIN cheapest_pricing cp ON cp.cruise_id = c.id
             WHERE cp.cruise_id IS NULL
                OR c.cheapest_price IS DISTINCT FROM
                   LEAST(c.interior_price, c.oceanview_price, c.balcony_price, c.suite_price)
                OR cp.cheapest_price IS DISTINCT FROM c.cheapest_price
             ORDER BY c.id
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RepairCandidate {
                cruise_id: row.try_get("id")?,
                line_id: row.try_get("line_id")?,
                currency: row.try_get("currency")?,
                raw_document: row.try_get("raw_document")?,
            });
        }
        Ok(out)
    }

    #[instrument(skip_all, fields(cruise_id = pricing.cruise_id))]
    async fn rewrite_prices(&self, pricing: &CheapestPricing) -> Result<(), StoreError> {
        let id = pricing.cruise_id;
        let mut tx = self.pool.begin().await?;
        let [interior, oceanview, balcony, suite] = pricing.prices.values();
        sqlx::query(
            r#"
            UPDATE cruises
               SET interior_price = $2::numeric,
                   oceanview_price = $3::numeric,
                   balcony_price = $4::numeric,
                   suite_price = $5::numeric,
                   cheapest_price = $6::numeric,
                   updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(interior)
        .bind(oceanview)
        .bind(balcony)
        .bind(suite)
        .bind(pricing.cheapest_price)
        .execute(&mut *tx)
        .await
        .map_err(step_error(id, WriteStep::Cruise))?;
        upsert_cheapest(&mut tx, pricing)
            .await
            .map_err(step_error(id, WriteStep::CheapestPricing))?;
        verify_cheapest(&mut tx, id).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all, fields(event_id = %event.id))]
    async fn record_webhook_event(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (
              id, job_id, external_line_id, line_id, event_type, currency, paths,
              received_at, status, processed_at, error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.id)
        .bind(event.job_id)
        .bind(event.external_line_id)
        .bind(event.line_id)
        .bind(event.event_type.as_str())
        .bind(event.currency.as_deref())
        .bind(&event.paths)
        .bind(event.received_at)
        .bind(event.status.as_str())
        .bind(event.processed_at)
        .bind(event.error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(event_id = %id, status = status.as_str()))]
    async fn set_webhook_status(
        &self,
        id: Uuid,
        status: WebhookStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let allowed_from: Vec<&str> = [
            WebhookStatus::Pending,
            WebhookStatus::Processing,
            WebhookStatus::Completed,
            WebhookStatus::Failed,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(status))
        .map(WebhookStatus::as_str)
        .collect();

        let result = sqlx::query(
            r#"
            UPDATE webhook_events
               SET status = $2,
                   error = $3,
                   processed_at = CASE WHEN $4 THEN now() ELSE processed_at END
             WHERE id = $1
               AND status = ANY($5)
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(status.is_terminal())
        .bind(&allowed_from)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.webhook_event(id).await? {
            None => Err(StoreError::EventNotFound(id)),
            Some(event) => Err(StoreError::InvalidTransition {
                id,
                from: event.status,
                to: status,
            }),
        }
    }

    async fn webhook_event(&self, id: Uuid) -> Result<Option<WebhookEvent>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, job_id, external_line_id, line_id, event_type, currency, paths,
                   received_at, status, processed_at, error
              FROM webhook_events
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }
}
