//! Core domain model for the rental listing tracker.
//!
//! Listings move through three tiers: raw scraped rows (bronze), cleaned and
//! deduplicated rows (silver) and per-day statistics (gold). This crate holds
//! the row types plus the pure pieces that turn one tier into the next: field
//! normalizers and the listing signature used to match units across days.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod normalize;
pub mod signature;

pub use normalize::{normalize_listing, NeighborhoodTable, NeighborhoodTableError, SkipReason};
pub use signature::{ListingSignature, SignatureKey};

pub const CRATE_NAME: &str = "rentrack-core";

/// Label used when a zip code is missing or absent from the neighborhood table.
pub const DEFAULT_NEIGHBORHOOD: &str = "General Area";

/// Bronze-tier row exactly as the scraper captured it.
///
/// Every descriptive field is free text; nothing is validated until promotion.
/// Repeated captures within a day may produce several rows for the same unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    #[serde(default)]
    pub building_name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zipcode: Option<String>,
    #[serde(default)]
    pub unit_name: Option<String>,
    #[serde(default)]
    pub unit_id: Option<String>,
    #[serde(default)]
    pub price_raw: Option<String>,
    #[serde(default)]
    pub beds: Option<String>,
    #[serde(default)]
    pub baths: Option<String>,
    #[serde(default)]
    pub sqft: Option<String>,
    #[serde(default)]
    pub available_move_in_date: Option<String>,
    #[serde(default)]
    pub total_available_units: Option<i64>,
    #[serde(default)]
    pub listing_url: Option<String>,
    pub scrape_date: NaiveDate,
    pub scrape_timestamp: DateTime<Utc>,
}

/// Silver-tier row: typed, cleaned, one per (unit_id, scrape_date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub title: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zipcode: Option<String>,
    pub neighborhood: String,
    pub price: Option<i64>,
    /// Bedroom count; `0` means studio.
    pub beds: Option<i64>,
    pub baths: Option<f64>,
    pub sqft: Option<i64>,
    pub unit_name: Option<String>,
    pub unit_id: Option<String>,
    pub available_move_in_date: Option<String>,
    pub total_available_units: Option<i64>,
    pub listing_url: Option<String>,
    pub scrape_date: NaiveDate,
    pub scrape_timestamp: DateTime<Utc>,
}

impl NormalizedListing {
    pub fn signature(&self) -> ListingSignature {
        ListingSignature::for_listing(self)
    }

    /// Price per square foot, only defined for a priced listing with positive area.
    pub fn price_per_sqft(&self) -> Option<f64> {
        match (self.price, self.sqft) {
            (Some(price), Some(sqft)) if sqft > 0 => Some(price as f64 / sqft as f64),
            _ => None,
        }
    }
}

/// Gold-tier row: descriptive statistics for one capture date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub scrape_date: NaiveDate,
    /// All silver listings of the date, priced or not.
    pub listing_count: i64,
    pub median_price: f64,
    pub avg_price: f64,
    pub median_price_per_sqft: Option<f64>,
    pub avg_price_per_sqft: Option<f64>,
    pub avg_sqft: Option<f64>,
    pub avg_beds: Option<f64>,
    pub avg_baths: Option<f64>,
    pub min_price: f64,
    pub max_price: f64,
    pub price_std_dev: f64,
    pub studio_count: i64,
    pub one_bed_count: i64,
    pub two_plus_bed_count: i64,
}
