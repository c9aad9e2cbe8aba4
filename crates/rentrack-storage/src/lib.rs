//! SQLite tier storage for the rental listing tracker.
//!
//! Bronze rows are append-only. Silver partitions and gold rows are only ever
//! replaced whole, one capture date at a time, inside a transaction, so a
//! reader sees either the previous partition or the new one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rentrack_core::{DailyAggregate, NormalizedListing, RawListing};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "rentrack-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("creating database directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("row for {found} does not belong to partition {expected}")]
    PartitionMismatch { expected: NaiveDate, found: NaiveDate },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Bronze tier: raw scraped rows.
#[async_trait]
pub trait RawStore: Send + Sync {
    async fn append_raw_listings(&self, rows: &[RawListing]) -> StoreResult<usize>;
    /// Most recent capture timestamp together with the capture date recorded on that row.
    async fn latest_capture(&self) -> StoreResult<Option<(DateTime<Utc>, NaiveDate)>>;
    async fn raw_listings_for_date(&self, date: NaiveDate) -> StoreResult<Vec<RawListing>>;
}

/// Silver tier: normalized listings partitioned by capture date.
#[async_trait]
pub trait SilverStore: Send + Sync {
    /// Deletes the date's partition and inserts `rows` in one transaction.
    async fn replace_silver_partition(
        &self,
        date: NaiveDate,
        rows: &[NormalizedListing],
    ) -> StoreResult<usize>;
    async fn silver_dates_desc(&self) -> StoreResult<Vec<NaiveDate>>;
    async fn silver_partition(&self, date: NaiveDate) -> StoreResult<Vec<NormalizedListing>>;
    async fn latest_silver_partition(
        &self,
    ) -> StoreResult<Option<(NaiveDate, Vec<NormalizedListing>)>>;
    async fn latest_silver_by_zip(&self, zip: &str) -> StoreResult<Vec<NormalizedListing>>;
    async fn silver_by_date(&self) -> StoreResult<BTreeMap<NaiveDate, Vec<NormalizedListing>>>;
}

/// Gold tier: one aggregate row per capture date.
#[async_trait]
pub trait GoldStore: Send + Sync {
    async fn replace_aggregate(&self, row: &DailyAggregate) -> StoreResult<()>;
    async fn delete_aggregate(&self, date: NaiveDate) -> StoreResult<bool>;
    async fn aggregates(&self) -> StoreResult<Vec<DailyAggregate>>;
    async fn aggregates_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<DailyAggregate>>;
    async fn aggregate_for(&self, date: NaiveDate) -> StoreResult<Option<DailyAggregate>>;
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS bronze_listings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        building_name TEXT,
        address TEXT,
        city TEXT,
        state TEXT,
        zipcode TEXT,
        unit_name TEXT,
        unit_id TEXT,
        price_raw TEXT,
        beds TEXT,
        baths TEXT,
        sqft TEXT,
        available_move_in_date TEXT,
        total_available_units INTEGER,
        listing_url TEXT,
        scrape_date TEXT NOT NULL,
        scrape_timestamp TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_bronze_date ON bronze_listings(scrape_date)",
    r#"
    CREATE TABLE IF NOT EXISTS silver_listings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        address TEXT,
        city TEXT,
        state TEXT,
        zipcode TEXT,
        neighborhood TEXT NOT NULL,
        price INTEGER,
        beds INTEGER,
        baths REAL,
        sqft INTEGER,
        unit_name TEXT,
        unit_id TEXT,
        available_move_in_date TEXT,
        total_available_units INTEGER,
        listing_url TEXT,
        scrape_date TEXT NOT NULL,
        scrape_timestamp TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_silver_date ON silver_listings(scrape_date)",
    "CREATE INDEX IF NOT EXISTS idx_silver_zip ON silver_listings(zipcode)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_silver_unique_unit_date ON silver_listings(unit_id, scrape_date)",
    r#"
    CREATE TABLE IF NOT EXISTS gold_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scrape_date TEXT NOT NULL UNIQUE,
        median_price REAL NOT NULL,
        avg_price REAL NOT NULL,
        median_price_per_sqft REAL,
        avg_price_per_sqft REAL,
        avg_sqft REAL,
        avg_beds REAL,
        avg_baths REAL,
        listing_count INTEGER NOT NULL,
        min_price REAL NOT NULL,
        max_price REAL NOT NULL,
        price_std_dev REAL NOT NULL,
        studio_count INTEGER NOT NULL,
        one_bed_count INTEGER NOT NULL,
        two_plus_bed_count INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS meta (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_updated TEXT
    )
    "#,
    "INSERT OR IGNORE INTO meta (id, last_updated) VALUES (1, NULL)",
];

const SILVER_COLUMNS: &str = "title, address, city, state, zipcode, neighborhood, price, beds, baths, sqft, unit_name, unit_id, available_move_in_date, total_available_units, listing_url, scrape_date, scrape_timestamp";

const GOLD_COLUMNS: &str = "scrape_date, median_price, avg_price, median_price_per_sqft, avg_price_per_sqft, avg_sqft, avg_beds, avg_baths, listing_count, min_price, max_price, price_std_dev, studio_count, one_bed_count, two_plus_bed_count";

/// All three tiers plus run bookkeeping in one SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file and ensures the schema.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "opened listing database");

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates tables and indexes; safe to call any number of times.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("bronze, silver, gold and meta tables ensured");
        Ok(())
    }

    pub async fn touch_last_updated(&self, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO meta (id, last_updated) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET last_updated = excluded.last_updated
            "#,
        )
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_updated(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let value: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT last_updated FROM meta WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.flatten())
    }

    pub async fn silver_count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM silver_listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn raw_from_row(row: &SqliteRow) -> Result<RawListing, sqlx::Error> {
    Ok(RawListing {
        building_name: row.try_get("building_name")?,
        address: row.try_get("address")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        zipcode: row.try_get("zipcode")?,
        unit_name: row.try_get("unit_name")?,
        unit_id: row.try_get("unit_id")?,
        price_raw: row.try_get("price_raw")?,
        beds: row.try_get("beds")?,
        baths: row.try_get("baths")?,
        sqft: row.try_get("sqft")?,
        available_move_in_date: row.try_get("available_move_in_date")?,
        total_available_units: row.try_get("total_available_units")?,
        listing_url: row.try_get("listing_url")?,
        scrape_date: row.try_get("scrape_date")?,
        scrape_timestamp: row.try_get("scrape_timestamp")?,
    })
}

fn silver_from_row(row: &SqliteRow) -> Result<NormalizedListing, sqlx::Error> {
    Ok(NormalizedListing {
        title: row.try_get("title")?,
        address: row.try_get("address")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        zipcode: row.try_get("zipcode")?,
        neighborhood: row.try_get("neighborhood")?,
        price: row.try_get("price")?,
        beds: row.try_get("beds")?,
        baths: row.try_get("baths")?,
        sqft: row.try_get("sqft")?,
        unit_name: row.try_get("unit_name")?,
        unit_id: row.try_get("unit_id")?,
        available_move_in_date: row.try_get("available_move_in_date")?,
        total_available_units: row.try_get("total_available_units")?,
        listing_url: row.try_get("listing_url")?,
        scrape_date: row.try_get("scrape_date")?,
        scrape_timestamp: row.try_get("scrape_timestamp")?,
    })
}

fn gold_from_row(row: &SqliteRow) -> Result<DailyAggregate, sqlx::Error> {
    Ok(DailyAggregate {
        scrape_date: row.try_get("scrape_date")?,
        listing_count: row.try_get("listing_count")?,
        median_price: row.try_get("median_price")?,
        avg_price: row.try_get("avg_price")?,
        median_price_per_sqft: row.try_get("median_price_per_sqft")?,
        avg_price_per_sqft: row.try_get("avg_price_per_sqft")?,
        avg_sqft: row.try_get("avg_sqft")?,
        avg_beds: row.try_get("avg_beds")?,
        avg_baths: row.try_get("avg_baths")?,
        min_price: row.try_get("min_price")?,
        max_price: row.try_get("max_price")?,
        price_std_dev: row.try_get("price_std_dev")?,
        studio_count: row.try_get("studio_count")?,
        one_bed_count: row.try_get("one_bed_count")?,
        two_plus_bed_count: row.try_get("two_plus_bed_count")?,
    })
}

fn collect_rows<T>(
    rows: Vec<SqliteRow>,
    map: fn(&SqliteRow) -> Result<T, sqlx::Error>,
) -> StoreResult<Vec<T>> {
    rows.iter()
        .map(|row| map(row).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl RawStore for SqliteStore {
    async fn append_raw_listings(&self, rows: &[RawListing]) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;
        for raw in rows {
            sqlx::query(
                r#"
                INSERT INTO bronze_listings (
                    building_name, address, city, state, zipcode,
                    unit_name, unit_id, price_raw, beds, baths, sqft,
                    available_move_in_date, total_available_units,
                    listing_url, scrape_date, scrape_timestamp
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&raw.building_name)
            .bind(&raw.address)
            .bind(&raw.city)
            .bind(&raw.state)
            .bind(&raw.zipcode)
            .bind(&raw.unit_name)
            .bind(&raw.unit_id)
            .bind(&raw.price_raw)
            .bind(&raw.beds)
            .bind(&raw.baths)
            .bind(&raw.sqft)
            .bind(&raw.available_move_in_date)
            .bind(raw.total_available_units)
            .bind(&raw.listing_url)
            .bind(raw.scrape_date)
            .bind(raw.scrape_timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(rows = rows.len(), "appended bronze listings");
        Ok(rows.len())
    }

    async fn latest_capture(&self) -> StoreResult<Option<(DateTime<Utc>, NaiveDate)>> {
        let row = sqlx::query(
            r#"
            SELECT scrape_timestamp, scrape_date
              FROM bronze_listings
             ORDER BY scrape_timestamp DESC, id DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some((row.try_get("scrape_timestamp")?, row.try_get("scrape_date")?))),
            None => Ok(None),
        }
    }

    async fn raw_listings_for_date(&self, date: NaiveDate) -> StoreResult<Vec<RawListing>> {
        let rows = sqlx::query("SELECT * FROM bronze_listings WHERE scrape_date = ? ORDER BY id")
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        collect_rows(rows, raw_from_row)
    }
}

#[async_trait]
impl SilverStore for SqliteStore {
    async fn replace_silver_partition(
        &self,
        date: NaiveDate,
        rows: &[NormalizedListing],
    ) -> StoreResult<usize> {
        if let Some(stray) = rows.iter().find(|r| r.scrape_date != date) {
            return Err(StoreError::PartitionMismatch {
                expected: date,
                found: stray.scrape_date,
            });
        }

        let mut tx = self.pool.begin().await?;
        let cleared = sqlx::query("DELETE FROM silver_listings WHERE scrape_date = ?")
            .bind(date)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        debug!(%date, cleared, "cleared existing silver partition");

        let insert = format!(
            "INSERT INTO silver_listings ({SILVER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        for listing in rows {
            sqlx::query(&insert)
                .bind(&listing.title)
                .bind(&listing.address)
                .bind(&listing.city)
                .bind(&listing.state)
                .bind(&listing.zipcode)
                .bind(&listing.neighborhood)
                .bind(listing.price)
                .bind(listing.beds)
                .bind(listing.baths)
                .bind(listing.sqft)
                .bind(&listing.unit_name)
                .bind(&listing.unit_id)
                .bind(&listing.available_move_in_date)
                .bind(listing.total_available_units)
                .bind(&listing.listing_url)
                .bind(listing.scrape_date)
                .bind(listing.scrape_timestamp)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!(%date, rows = rows.len(), "replaced silver partition");
        Ok(rows.len())
    }

    async fn silver_dates_desc(&self) -> StoreResult<Vec<NaiveDate>> {
        let dates = sqlx::query_scalar(
            "SELECT DISTINCT scrape_date FROM silver_listings ORDER BY scrape_date DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(dates)
    }

    async fn silver_partition(&self, date: NaiveDate) -> StoreResult<Vec<NormalizedListing>> {
        let rows = sqlx::query("SELECT * FROM silver_listings WHERE scrape_date = ? ORDER BY id")
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        collect_rows(rows, silver_from_row)
    }

    async fn latest_silver_partition(
        &self,
    ) -> StoreResult<Option<(NaiveDate, Vec<NormalizedListing>)>> {
        let Some(date) = self.silver_dates_desc().await?.into_iter().next() else {
            return Ok(None);
        };
        let rows = self.silver_partition(date).await?;
        Ok(Some((date, rows)))
    }

    async fn latest_silver_by_zip(&self, zip: &str) -> StoreResult<Vec<NormalizedListing>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM silver_listings
             WHERE zipcode = ?
               AND scrape_date = (SELECT MAX(scrape_date) FROM silver_listings)
             ORDER BY id
            "#,
        )
        .bind(zip)
        .fetch_all(&self.pool)
        .await?;
        collect_rows(rows, silver_from_row)
    }

    async fn silver_by_date(&self) -> StoreResult<BTreeMap<NaiveDate, Vec<NormalizedListing>>> {
        let rows = sqlx::query("SELECT * FROM silver_listings ORDER BY scrape_date, id")
            .fetch_all(&self.pool)
            .await?;
        let mut grouped: BTreeMap<NaiveDate, Vec<NormalizedListing>> = BTreeMap::new();
        for listing in collect_rows(rows, silver_from_row)? {
            grouped.entry(listing.scrape_date).or_default().push(listing);
        }
        Ok(grouped)
    }
}

#[async_trait]
impl GoldStore for SqliteStore {
    async fn replace_aggregate(&self, row: &DailyAggregate) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM gold_metrics WHERE scrape_date = ?")
            .bind(row.scrape_date)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "INSERT INTO gold_metrics ({GOLD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(row.scrape_date)
        .bind(row.median_price)
        .bind(row.avg_price)
        .bind(row.median_price_per_sqft)
        .bind(row.avg_price_per_sqft)
        .bind(row.avg_sqft)
        .bind(row.avg_beds)
        .bind(row.avg_baths)
        .bind(row.listing_count)
        .bind(row.min_price)
        .bind(row.max_price)
        .bind(row.price_std_dev)
        .bind(row.studio_count)
        .bind(row.one_bed_count)
        .bind(row.two_plus_bed_count)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_aggregate(&self, date: NaiveDate) -> StoreResult<bool> {
        let deleted = sqlx::query("DELETE FROM gold_metrics WHERE scrape_date = ?")
            .bind(date)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn aggregates(&self) -> StoreResult<Vec<DailyAggregate>> {
        let rows = sqlx::query("SELECT * FROM gold_metrics ORDER BY scrape_date ASC")
            .fetch_all(&self.pool)
            .await?;
        collect_rows(rows, gold_from_row)
    }

    async fn aggregates_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> StoreResult<Vec<DailyAggregate>> {
        let rows = sqlx::query(
            "SELECT * FROM gold_metrics WHERE scrape_date BETWEEN ? AND ? ORDER BY scrape_date ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        collect_rows(rows, gold_from_row)
    }

    async fn aggregate_for(&self, date: NaiveDate) -> StoreResult<Option<DailyAggregate>> {
        let row = sqlx::query("SELECT * FROM gold_metrics WHERE scrape_date = ?")
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(gold_from_row)
            .transpose()
            .map_err(StoreError::from)
    }
}
