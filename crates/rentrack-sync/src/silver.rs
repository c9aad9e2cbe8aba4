//! Bronze → silver promotion.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use rentrack_core::{normalize_listing, NeighborhoodTable, NormalizedListing, RawListing};
use rentrack_storage::{RawStore, SilverStore, StoreError};
use serde::Serialize;
use tracing::{info, warn};

/// Outcome of one silver promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SilverPromotion {
    pub scrape_date: NaiveDate,
    pub raw_rows: usize,
    /// Rows left after keeping each unit's latest capture of the day.
    pub selected_rows: usize,
    pub skipped_incomplete: usize,
    pub skipped_duplicates: usize,
    pub inserted: usize,
}

/// Cleaned batch ready to replace a silver partition.
#[derive(Debug, Clone)]
pub struct CleanBatch {
    pub listings: Vec<NormalizedListing>,
    pub selected_rows: usize,
    pub skipped_incomplete: usize,
    pub skipped_duplicates: usize,
}

pub struct SilverPromoter {
    neighborhoods: NeighborhoodTable,
}

impl SilverPromoter {
    pub fn new(neighborhoods: NeighborhoodTable) -> Self {
        Self { neighborhoods }
    }

    /// Keeps, per unit id, only the rows carrying that unit's latest timestamp.
    /// Rows tied on the latest timestamp all survive; missing ids form one group.
    pub fn latest_per_unit(rows: Vec<RawListing>) -> Vec<RawListing> {
        let mut latest: HashMap<Option<String>, DateTime<Utc>> = HashMap::new();
        for row in &rows {
            latest
                .entry(row.unit_id.clone())
                .and_modify(|ts| *ts = (*ts).max(row.scrape_timestamp))
                .or_insert(row.scrape_timestamp);
        }
        rows.into_iter()
            .filter(|row| latest.get(&row.unit_id) == Some(&row.scrape_timestamp))
            .collect()
    }

    /// Selects, validates, normalizes and deduplicates one day's raw rows.
    pub fn clean_batch(&self, rows: Vec<RawListing>) -> CleanBatch {
        let selected = Self::latest_per_unit(rows);
        let selected_rows = selected.len();

        let mut skipped_incomplete = 0usize;
        let mut skipped_duplicates = 0usize;
        let mut seen_units: HashSet<Option<String>> = HashSet::new();
        let mut listings = Vec::with_capacity(selected_rows);

        for raw in &selected {
            let listing = match normalize_listing(raw, &self.neighborhoods) {
                Ok(listing) => listing,
                Err(reason) => {
                    warn!(
                        building = raw.building_name.as_deref().unwrap_or_default(),
                        price = raw.price_raw.as_deref().unwrap_or_default(),
                        %reason,
                        "skipping incomplete bronze row"
                    );
                    skipped_incomplete += 1;
                    continue;
                }
            };

            if !seen_units.insert(listing.unit_id.clone()) {
                info!(
                    unit_id = listing.unit_id.as_deref().unwrap_or_default(),
                    date = %listing.scrape_date,
                    "skipping duplicate unit for capture date"
                );
                skipped_duplicates += 1;
                continue;
            }
            listings.push(listing);
        }

        CleanBatch {
            listings,
            selected_rows,
            skipped_incomplete,
            skipped_duplicates,
        }
    }

    /// Replaces the silver partition of the most recent bronze capture date.
    ///
    /// Returns `Ok(None)` when there is nothing to promote.
    pub async fn promote<S>(&self, store: &S) -> Result<Option<SilverPromotion>, StoreError>
    where
        S: RawStore + SilverStore + ?Sized,
    {
        let Some((latest_timestamp, scrape_date)) = store.latest_capture().await? else {
            warn!("no bronze listings to promote");
            return Ok(None);
        };

        let rows = store.raw_listings_for_date(scrape_date).await?;
        if rows.is_empty() {
            warn!(%scrape_date, %latest_timestamp, "no bronze listings for latest capture date");
            return Ok(None);
        }
        let raw_rows = rows.len();

        let batch = self.clean_batch(rows);
        let inserted = store
            .replace_silver_partition(scrape_date, &batch.listings)
            .await?;

        let promotion = SilverPromotion {
            scrape_date,
            raw_rows,
            selected_rows: batch.selected_rows,
            skipped_incomplete: batch.skipped_incomplete,
            skipped_duplicates: batch.skipped_duplicates,
            inserted,
        };
        info!(
            %scrape_date,
            raw_rows,
            inserted,
            skipped_incomplete = promotion.skipped_incomplete,
            skipped_duplicates = promotion.skipped_duplicates,
            "promoted bronze listings into silver"
        );
        Ok(Some(promotion))
    }
}
