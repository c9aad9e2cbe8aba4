//! Silver → gold aggregation.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rentrack_core::{DailyAggregate, NormalizedListing};
use rentrack_storage::{GoldStore, SilverStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Denominator used for the price standard deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdDevKind {
    /// n − 1
    #[default]
    Sample,
    /// n
    Population,
}

impl fmt::Display for StdDevKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdDevKind::Sample => f.write_str("sample"),
            StdDevKind::Population => f.write_str("population"),
        }
    }
}

impl FromStr for StdDevKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sample" => Ok(StdDevKind::Sample),
            "population" => Ok(StdDevKind::Population),
            other => Err(format!("unknown standard deviation kind '{other}'")),
        }
    }
}

/// Outcome of one gold promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoldPromotion {
    pub dates_scanned: usize,
    pub rows_written: usize,
    /// Dates without a single priced listing; no aggregate row exists for them.
    pub dates_without_prices: Vec<NaiveDate>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

fn std_dev(values: &[f64], kind: StdDevKind) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let Some(avg) = mean(values) else {
        return 0.0;
    };
    let squares = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>();
    let denominator = match kind {
        StdDevKind::Sample => (n - 1) as f64,
        StdDevKind::Population => n as f64,
    };
    (squares / denominator).sqrt()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GoldAggregator {
    std_dev: StdDevKind,
}

impl GoldAggregator {
    pub fn new(std_dev: StdDevKind) -> Self {
        Self { std_dev }
    }

    /// Computes the aggregate for one capture date, or `None` when no listing
    /// of that date carries a price.
    pub fn aggregate_day(
        &self,
        scrape_date: NaiveDate,
        listings: &[NormalizedListing],
    ) -> Option<DailyAggregate> {
        let mut prices: Vec<f64> = listings
            .iter()
            .filter_map(|l| l.price)
            .map(|p| p as f64)
            .collect();
        if prices.is_empty() {
            return None;
        }

        let mut per_sqft: Vec<f64> = listings.iter().filter_map(|l| l.price_per_sqft()).collect();
        let sqfts: Vec<f64> = listings.iter().filter_map(|l| l.sqft).map(|s| s as f64).collect();
        let beds: Vec<f64> = listings.iter().filter_map(|l| l.beds).map(|b| b as f64).collect();
        let baths: Vec<f64> = listings.iter().filter_map(|l| l.baths).collect();

        let (mut studio_count, mut one_bed_count, mut two_plus_bed_count) = (0i64, 0i64, 0i64);
        for beds in listings.iter().filter_map(|l| l.beds) {
            match beds {
                0 => studio_count += 1,
                1 => one_bed_count += 1,
                b if b >= 2 => two_plus_bed_count += 1,
                _ => {}
            }
        }

        let avg_price = mean(&prices)?;
        let price_std_dev = std_dev(&prices, self.std_dev);
        let median_price = median(&mut prices)?;
        let min_price = prices.first().copied()?;
        let max_price = prices.last().copied()?;

        Some(DailyAggregate {
            scrape_date,
            listing_count: listings.len() as i64,
            median_price,
            avg_price,
            median_price_per_sqft: median(&mut per_sqft),
            avg_price_per_sqft: mean(&per_sqft),
            avg_sqft: mean(&sqfts),
            avg_beds: mean(&beds),
            avg_baths: mean(&baths),
            min_price,
            max_price,
            price_std_dev,
            studio_count,
            one_bed_count,
            two_plus_bed_count,
        })
    }

    /// Recomputes every date's aggregate from the full silver table.
    pub async fn promote<S>(&self, store: &S) -> Result<GoldPromotion, StoreError>
    where
        S: SilverStore + GoldStore + ?Sized,
    {
        let partitions = store.silver_by_date().await?;
        let mut summary = GoldPromotion {
            dates_scanned: partitions.len(),
            rows_written: 0,
            dates_without_prices: Vec::new(),
        };

        for (date, listings) in &partitions {
            match self.aggregate_day(*date, listings) {
                Some(row) => {
                    store.replace_aggregate(&row).await?;
                    summary.rows_written += 1;
                    debug!(%date, listing_count = row.listing_count, "wrote gold aggregate");
                }
                None => {
                    if store.delete_aggregate(*date).await? {
                        debug!(%date, "removed stale gold aggregate for unpriced date");
                    }
                    summary.dates_without_prices.push(*date);
                }
            }
        }

        for row in store.aggregates().await? {
            if partitions.contains_key(&row.scrape_date) {
                continue;
            }
            if store.delete_aggregate(row.scrape_date).await? {
                debug!(date = %row.scrape_date, "removed gold aggregate for emptied date");
                summary.dates_without_prices.push(row.scrape_date);
            }
        }

        info!(
            dates = summary.dates_scanned,
            rows_written = summary.rows_written,
            unpriced = summary.dates_without_prices.len(),
            std_dev = %self.std_dev,
            "promoted silver listings into gold_metrics"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rentrack_core::DEFAULT_NEIGHBORHOOD;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn listing(price: Option<i64>, beds: Option<i64>, sqft: Option<i64>) -> NormalizedListing {
        NormalizedListing {
            title: "Bldg".into(),
            address: None,
            city: None,
            state: None,
            zipcode: None,
            neighborhood: DEFAULT_NEIGHBORHOOD.into(),
            price,
            beds,
            baths: Some(1.0),
            sqft,
            unit_name: None,
            unit_id: None,
            available_move_in_date: None,
            total_available_units: None,
            listing_url: None,
            scrape_date: day(),
            scrape_timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 17, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn two_prices_produce_symmetric_statistics() {
        let agg = GoldAggregator::default()
            .aggregate_day(
                day(),
                &[listing(Some(1000), Some(1), Some(500)), listing(Some(1200), Some(2), Some(600))],
            )
            .expect("aggregate");
        assert_eq!(agg.median_price, 1100.0);
        assert_eq!(agg.avg_price, 1100.0);
        assert_eq!(agg.min_price, 1000.0);
        assert_eq!(agg.max_price, 1200.0);
        assert!(agg.price_std_dev > 0.0);
        assert!((agg.price_std_dev - 141.421_356).abs() < 1e-4);
        assert_eq!(agg.median_price_per_sqft, Some(2.0));
        assert_eq!(agg.avg_sqft, Some(550.0));
    }

    #[test]
    fn population_std_dev_uses_n() {
        let agg = GoldAggregator::new(StdDevKind::Population)
            .aggregate_day(day(), &[listing(Some(1000), None, None), listing(Some(1200), None, None)])
            .expect("aggregate");
        assert!((agg.price_std_dev - 100.0).abs() < 1e-9);
    }

    #[test]
    fn single_price_has_zero_spread() {
        let agg = GoldAggregator::default()
            .aggregate_day(day(), &[listing(Some(950), Some(0), None)])
            .expect("aggregate");
        assert_eq!(agg.price_std_dev, 0.0);
        assert_eq!(agg.median_price, 950.0);
        assert_eq!(agg.avg_price, 950.0);
        assert_eq!(agg.median_price_per_sqft, None);
        assert_eq!(agg.avg_sqft, None);
    }

    #[test]
    fn unpriced_listings_count_but_do_not_move_prices() {
        let rows = [
            listing(Some(1000), Some(0), Some(0)),
            listing(None, Some(1), Some(700)),
            listing(Some(2000), Some(3), Some(1000)),
            listing(None, None, None),
        ];
        let agg = GoldAggregator::default().aggregate_day(day(), &rows).expect("aggregate");
        assert_eq!(agg.listing_count, 4);
        assert_eq!(agg.avg_price, 1500.0);
        assert_eq!(agg.avg_price_per_sqft, Some(2.0));
        assert_eq!(agg.avg_sqft, Some((0.0 + 700.0 + 1000.0) / 3.0));
        assert_eq!(agg.studio_count, 1);
        assert_eq!(agg.one_bed_count, 1);
        assert_eq!(agg.two_plus_bed_count, 1);
        assert!(agg.studio_count + agg.one_bed_count + agg.two_plus_bed_count <= agg.listing_count);
    }

    #[test]
    fn date_without_prices_is_skipped() {
        let rows = [listing(None, Some(1), Some(700))];
        assert!(GoldAggregator::default().aggregate_day(day(), &rows).is_none());
    }

    #[test]
    fn odd_median_takes_middle_value() {
        let mut values = vec![3.0, 1.0, 2.0];
        assert_eq!(median(&mut values), Some(2.0));
        assert_eq!(median(&mut Vec::new()), None);
    }

    #[test]
    fn std_dev_kind_parses_from_config_text() {
        assert_eq!("Population".parse::<StdDevKind>(), Ok(StdDevKind::Population));
        assert_eq!(" sample ".parse::<StdDevKind>(), Ok(StdDevKind::Sample));
        assert!("median".parse::<StdDevKind>().is_err());
    }
}
