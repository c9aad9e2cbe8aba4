//! Listing pipeline: bronze ingest, silver promotion, gold aggregation,
//! change detection and per-run reports.

pub mod changes;
pub mod gold;
pub mod silver;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use rentrack_core::{DailyAggregate, NeighborhoodTable, NormalizedListing, RawListing};
use rentrack_storage::{GoldStore, RawStore, SilverStore, SqliteStore};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use changes::{
    count_new_listings, delta_as_of, delta_between, diff_partitions, ChangeError, ChangeKind,
    DeltaReport, ListingChange, NewListingCount,
};
pub use gold::{GoldAggregator, GoldPromotion, StdDevKind};
pub use silver::{CleanBatch, SilverPromoter, SilverPromotion};

pub const CRATE_NAME: &str = "rentrack-sync";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    pub reports_dir: PathBuf,
    pub neighborhoods_path: Option<PathBuf>,
    pub std_dev: StdDevKind,
    pub export_parquet: bool,
    pub web_port: u16,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./housing_tracker.db")),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            neighborhoods_path: std::env::var("NEIGHBORHOODS_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            std_dev: std::env::var("RENTRACK_STDDEV")
                .ok()
                .and_then(|v| match v.parse() {
                    Ok(kind) => Some(kind),
                    Err(err) => {
                        warn!(%err, "ignoring RENTRACK_STDDEV");
                        None
                    }
                })
                .unwrap_or_default(),
            export_parquet: std::env::var("RENTRACK_EXPORT_PARQUET")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            web_port: std::env::var("RENTRACK_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    /// Configuration rooted in `dir`, with every other setting at its default.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            db_path: dir.join("housing_tracker.db"),
            reports_dir: dir.join("reports"),
            neighborhoods_path: None,
            std_dev: StdDevKind::default(),
            export_parquet: true,
            web_port: 8000,
        }
    }

    /// The configured neighborhood table, or the built-in one.
    pub fn neighborhoods(&self) -> Result<NeighborhoodTable> {
        match &self.neighborhoods_path {
            Some(path) => NeighborhoodTable::from_yaml_file(path)
                .with_context(|| format!("loading neighborhoods from {}", path.display())),
            None => Ok(NeighborhoodTable::des_moines()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report_date: NaiveDate,
    pub silver: Option<SilverPromotion>,
    pub gold: GoldPromotion,
    pub new_listings: Option<NewListingCount>,
    pub reports_dir: String,
    pub parquet_manifest: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: SqliteStore,
    silver: SilverPromoter,
    gold: GoldAggregator,
}

impl Pipeline {
    pub async fn open(config: PipelineConfig) -> Result<Self> {
        let neighborhoods = config.neighborhoods()?;
        if neighborhoods.is_empty() {
            warn!("neighborhood table has no entries; every listing gets the default label");
        } else {
            debug!(zips = neighborhoods.len(), "loaded neighborhood table");
        }
        let store = SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening {}", config.db_path.display()))?;
        Ok(Self {
            silver: SilverPromoter::new(neighborhoods),
            gold: GoldAggregator::new(config.std_dev),
            config,
            store,
        })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Appends a JSON batch of raw listings to the bronze table.
    pub async fn ingest_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let rows = load_raw_batch(path).await?;
        let inserted = self
            .store
            .append_raw_listings(&rows)
            .await
            .with_context(|| format!("appending bronze rows from {}", path.display()))?;
        info!(path = %path.display(), inserted, "ingested raw listings");
        Ok(inserted)
    }

    /// Silver promotion, gold aggregation, new-listing count, then reports.
    pub async fn run_once(&self) -> Result<PipelineRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let silver = self
            .silver
            .promote(&self.store)
            .await
            .context("promoting bronze listings into silver")?;
        let gold = self
            .gold
            .promote(&self.store)
            .await
            .context("aggregating silver listings into gold")?;
        let new_listings = match count_new_listings(&self.store).await {
            Ok(count) => Some(count),
            Err(ChangeError::InsufficientHistory { available }) => {
                info!(available, "skipping new-listing count");
                None
            }
            Err(err) => return Err(err).context("counting new listings"),
        };

        let finished_at = Utc::now();
        self.store
            .touch_last_updated(finished_at)
            .await
            .context("stamping last_updated")?;

        let report_date = silver
            .as_ref()
            .map(|s| s.scrape_date)
            .unwrap_or_else(|| started_at.date_naive());
        let reports_dir = self.config.reports_dir.join(report_date.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let parquet_manifest = if self.config.export_parquet {
            let path = self.export_parquet_snapshots(&reports_dir, report_date).await?;
            Some(path.display().to_string())
        } else {
            None
        };

        let summary = PipelineRunSummary {
            run_id,
            started_at,
            finished_at,
            report_date,
            silver,
            gold,
            new_listings,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest,
        };
        self.write_reports(&reports_dir, &summary).await?;

        info!(%run_id, %report_date, reports_dir = %summary.reports_dir, "pipeline run complete");
        Ok(summary)
    }

    async fn write_reports(&self, reports_dir: &Path, summary: &PipelineRunSummary) -> Result<()> {
        let headline = self
            .store
            .aggregate_for(summary.report_date)
            .await
            .context("loading headline aggregate")?;

        fs::write(
            reports_dir.join("daily_brief.md"),
            render_daily_brief(summary, headline.as_ref()),
        )
        .await
        .context("writing daily_brief.md")?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;
        Ok(())
    }

    async fn export_parquet_snapshots(
        &self,
        reports_dir: &Path,
        report_date: NaiveDate,
    ) -> Result<PathBuf> {
        let snapshot_dir = reports_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let aggregates = self.store.aggregates().await.context("loading gold rows")?;
        let listings = self
            .store
            .silver_partition(report_date)
            .await
            .context("loading silver partition")?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                write_snapshot(
                    "gold_metrics",
                    reports_dir,
                    &snapshot_dir.join("gold_metrics.parquet"),
                    gold_batch(&aggregates)?,
                )?,
                write_snapshot(
                    "silver_listings",
                    reports_dir,
                    &snapshot_dir.join("silver_listings.parquet"),
                    silver_batch(&listings)?,
                )?,
            ],
        };

        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }
}

pub async fn run_pipeline_once_from_env() -> Result<PipelineRunSummary> {
    let pipeline = Pipeline::open(PipelineConfig::from_env()).await?;
    pipeline.run_once().await
}

/// Reads a JSON array of raw listings, as handed over by the scraper.
pub async fn load_raw_batch(path: impl AsRef<Path>) -> Result<Vec<RawListing>> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

pub fn render_daily_brief(summary: &PipelineRunSummary, headline: Option<&DailyAggregate>) -> String {
    let mut lines = vec![
        "# Rental Listing Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Capture date: {}", summary.report_date),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        String::new(),
        "## Silver".to_string(),
    ];
    match &summary.silver {
        Some(s) => {
            lines.push(format!("- Raw rows: {}", s.raw_rows));
            lines.push(format!("- Latest per unit: {}", s.selected_rows));
            lines.push(format!("- Skipped (incomplete): {}", s.skipped_incomplete));
            lines.push(format!("- Skipped (duplicate unit): {}", s.skipped_duplicates));
            lines.push(format!("- Inserted: {}", s.inserted));
        }
        None => lines.push("- No bronze listings to promote".to_string()),
    }

    lines.push(String::new());
    lines.push("## Gold".to_string());
    lines.push(format!("- Dates aggregated: {}", summary.gold.rows_written));
    if !summary.gold.dates_without_prices.is_empty() {
        let dates = summary
            .gold
            .dates_without_prices
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("- Dates without prices: {dates}"));
    }
    if let Some(agg) = headline {
        lines.push(format!("- Listings: {}", agg.listing_count));
        lines.push(format!("- Median price: ${:.0}", agg.median_price));
        lines.push(format!("- Average price: ${:.2}", agg.avg_price));
        lines.push(format!("- Price range: ${:.0} to ${:.0}", agg.min_price, agg.max_price));
        if let Some(per_sqft) = agg.median_price_per_sqft {
            lines.push(format!("- Median price per sqft: ${per_sqft:.2}"));
        }
        lines.push(format!(
            "- Mix: {} studio, {} one-bed, {} two-plus",
            agg.studio_count, agg.one_bed_count, agg.two_plus_bed_count
        ));
    }

    lines.push(String::new());
    lines.push("## Changes".to_string());
    match &summary.new_listings {
        Some(count) => lines.push(format!(
            "- New listings since {}: {}",
            count.previous_date, count.new_listings
        )),
        None => lines.push("- Not enough history to compare".to_string()),
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Encodes `batch` in memory, writes it to `path` and describes the file for
/// the snapshot manifest.
fn write_snapshot(
    name: &str,
    reports_dir: &Path,
    path: &Path,
    batch: RecordBatch,
) -> Result<ParquetManifestFile> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .with_context(|| format!("encoding {name} snapshot"))?;
    writer
        .write(&batch)
        .with_context(|| format!("encoding {name} rows"))?;
    let encoded = writer
        .into_inner()
        .with_context(|| format!("finishing {name} snapshot"))?;
    std::fs::write(path, &encoded).with_context(|| format!("writing {}", path.display()))?;

    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: path
            .strip_prefix(reports_dir)
            .unwrap_or(path)
            .display()
            .to_string(),
        sha256: hex::encode(Sha256::digest(&encoded)),
        bytes: encoded.len() as u64,
    })
}

fn gold_batch(rows: &[DailyAggregate]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("scrape_date", DataType::Utf8, false),
        ArrowField::new("listing_count", DataType::Int64, false),
        ArrowField::new("median_price", DataType::Float64, false),
        ArrowField::new("avg_price", DataType::Float64, false),
        ArrowField::new("median_price_per_sqft", DataType::Float64, true),
        ArrowField::new("avg_price_per_sqft", DataType::Float64, true),
        ArrowField::new("avg_sqft", DataType::Float64, true),
        ArrowField::new("avg_beds", DataType::Float64, true),
        ArrowField::new("avg_baths", DataType::Float64, true),
        ArrowField::new("min_price", DataType::Float64, false),
        ArrowField::new("max_price", DataType::Float64, false),
        ArrowField::new("price_std_dev", DataType::Float64, false),
        ArrowField::new("studio_count", DataType::Int64, false),
        ArrowField::new("one_bed_count", DataType::Int64, false),
        ArrowField::new("two_plus_bed_count", DataType::Int64, false),
    ]));

    let dates = StringArray::from(
        rows.iter()
            .map(|r| Some(r.scrape_date.to_string()))
            .collect::<Vec<_>>(),
    );
    let floats = |f: fn(&DailyAggregate) -> f64| Float64Array::from(rows.iter().map(f).collect::<Vec<_>>());
    let optional = |f: fn(&DailyAggregate) -> Option<f64>| {
        Float64Array::from(rows.iter().map(f).collect::<Vec<_>>())
    };
    let ints = |f: fn(&DailyAggregate) -> i64| Int64Array::from(rows.iter().map(f).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(dates),
            Arc::new(ints(|r| r.listing_count)),
            Arc::new(floats(|r| r.median_price)),
            Arc::new(floats(|r| r.avg_price)),
            Arc::new(optional(|r| r.median_price_per_sqft)),
            Arc::new(optional(|r| r.avg_price_per_sqft)),
            Arc::new(optional(|r| r.avg_sqft)),
            Arc::new(optional(|r| r.avg_beds)),
            Arc::new(optional(|r| r.avg_baths)),
            Arc::new(floats(|r| r.min_price)),
            Arc::new(floats(|r| r.max_price)),
            Arc::new(floats(|r| r.price_std_dev)),
            Arc::new(ints(|r| r.studio_count)),
            Arc::new(ints(|r| r.one_bed_count)),
            Arc::new(ints(|r| r.two_plus_bed_count)),
        ],
    )
    .context("building gold_metrics record batch")
}

fn silver_batch(listings: &[NormalizedListing]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("scrape_date", DataType::Utf8, false),
        ArrowField::new("signature", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("unit_id", DataType::Utf8, true),
        ArrowField::new("neighborhood", DataType::Utf8, false),
        ArrowField::new("zipcode", DataType::Utf8, true),
        ArrowField::new("price", DataType::Int64, true),
        ArrowField::new("beds", DataType::Int64, true),
        ArrowField::new("baths", DataType::Float64, true),
        ArrowField::new("sqft", DataType::Int64, true),
    ]));

    let dates = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.scrape_date.to_string()))
            .collect::<Vec<_>>(),
    );
    let signatures = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.signature().to_string()))
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.title.as_str()))
            .collect::<Vec<_>>(),
    );
    let unit_ids = StringArray::from(listings.iter().map(|l| l.unit_id.as_deref()).collect::<Vec<_>>());
    let neighborhoods = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.neighborhood.as_str()))
            .collect::<Vec<_>>(),
    );
    let zips = StringArray::from(listings.iter().map(|l| l.zipcode.as_deref()).collect::<Vec<_>>());
    let prices = Int64Array::from(listings.iter().map(|l| l.price).collect::<Vec<_>>());
    let beds = Int64Array::from(listings.iter().map(|l| l.beds).collect::<Vec<_>>());
    let baths = Float64Array::from(listings.iter().map(|l| l.baths).collect::<Vec<_>>());
    let sqft = Int64Array::from(listings.iter().map(|l| l.sqft).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(dates),
            Arc::new(signatures),
            Arc::new(titles),
            Arc::new(unit_ids),
            Arc::new(neighborhoods),
            Arc::new(zips),
            Arc::new(prices),
            Arc::new(beds),
            Arc::new(baths),
            Arc::new(sqft),
        ],
    )
    .context("building silver_listings record batch")
}
