//! Day-over-day change detection by listing signature.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use rentrack_core::{ListingSignature, NormalizedListing, SignatureKey};
use rentrack_storage::{SilverStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ChangeError {
    #[error("not enough data: need two capture dates, found {available}")]
    InsufficientHistory { available: usize },
    #[error("no normalized listings for {0}")]
    MissingPartition(NaiveDate),
    #[error("cannot compare {0} with itself")]
    SameDate(NaiveDate),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingChange {
    pub signature: ListingSignature,
    pub key: SignatureKey,
    pub change: ChangeKind,
    pub price: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_price: Option<i64>,
    /// `price - previous_price`; negative for a price drop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
}

/// New and re-priced listings of `latest_date` relative to `previous_date`.
///
/// Unchanged listings and listings that disappeared are not reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeltaReport {
    pub latest_date: NaiveDate,
    pub previous_date: NaiveDate,
    pub changes: Vec<ListingChange>,
}

impl DeltaReport {
    pub fn new_listings(&self) -> impl Iterator<Item = &ListingChange> {
        self.changes.iter().filter(|c| c.change == ChangeKind::New)
    }

    pub fn changed_listings(&self) -> impl Iterator<Item = &ListingChange> {
        self.changes.iter().filter(|c| c.change == ChangeKind::Changed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NewListingCount {
    pub latest_date: NaiveDate,
    pub previous_date: NaiveDate,
    pub new_listings: usize,
}

/// Signature → price for every priced listing. A later listing with the same
/// signature overwrites an earlier one.
pub fn price_map(listings: &[NormalizedListing]) -> HashMap<SignatureKey, (ListingSignature, i64)> {
    listings
        .iter()
        .filter_map(|l| {
            let price = l.price?;
            let signature = l.signature();
            Some((signature.key(), (signature, price)))
        })
        .collect()
}

/// Compares two partitions. Pure; no date validation.
pub fn diff_partitions(
    previous_date: NaiveDate,
    previous: &[NormalizedListing],
    latest_date: NaiveDate,
    latest: &[NormalizedListing],
) -> DeltaReport {
    let before = price_map(previous);
    let after = price_map(latest);

    let mut changes: Vec<ListingChange> = after
        .into_iter()
        .filter_map(|(key, (signature, price))| match before.get(&key) {
            None => Some(ListingChange {
                signature,
                key,
                change: ChangeKind::New,
                price,
                previous_price: None,
                delta: None,
            }),
            Some((_, old)) if *old != price => Some(ListingChange {
                signature,
                key,
                change: ChangeKind::Changed,
                price,
                previous_price: Some(*old),
                delta: Some(price - old),
            }),
            Some(_) => None,
        })
        .collect();
    changes.sort_by(|a, b| {
        a.signature
            .to_string()
            .cmp(&b.signature.to_string())
            .then(a.key.cmp(&b.key))
    });

    DeltaReport {
        latest_date,
        previous_date,
        changes,
    }
}

/// Counts signatures on the latest capture date that were absent the day before.
pub async fn count_new_listings<S>(store: &S) -> Result<NewListingCount, ChangeError>
where
    S: SilverStore + ?Sized,
{
    let dates = store.silver_dates_desc().await?;
    let [latest_date, previous_date, ..] = dates[..] else {
        return Err(ChangeError::InsufficientHistory {
            available: dates.len(),
        });
    };

    let previous: HashSet<SignatureKey> = store
        .silver_partition(previous_date)
        .await?
        .iter()
        .map(|l| l.signature().key())
        .collect();
    let latest: HashSet<SignatureKey> = store
        .silver_partition(latest_date)
        .await?
        .iter()
        .map(|l| l.signature().key())
        .collect();

    let new_listings = latest.difference(&previous).count();
    debug!(%latest_date, %previous_date, new_listings, "counted new listings");
    Ok(NewListingCount {
        latest_date,
        previous_date,
        new_listings,
    })
}

/// Delta report between two explicit capture dates, given in either order.
pub async fn delta_between<S>(
    store: &S,
    first: NaiveDate,
    second: NaiveDate,
) -> Result<DeltaReport, ChangeError>
where
    S: SilverStore + ?Sized,
{
    if first == second {
        return Err(ChangeError::SameDate(first));
    }
    let (previous_date, latest_date) = if first < second {
        (first, second)
    } else {
        (second, first)
    };

    let previous = store.silver_partition(previous_date).await?;
    if previous.is_empty() {
        return Err(ChangeError::MissingPartition(previous_date));
    }
    let latest = store.silver_partition(latest_date).await?;
    if latest.is_empty() {
        return Err(ChangeError::MissingPartition(latest_date));
    }

    Ok(diff_partitions(previous_date, &previous, latest_date, &latest))
}

/// Delta report between the two most recent capture dates at or before
/// `as_of` (every date when `None`).
pub async fn delta_as_of<S>(store: &S, as_of: Option<NaiveDate>) -> Result<DeltaReport, ChangeError>
where
    S: SilverStore + ?Sized,
{
    let dates: Vec<NaiveDate> = store
        .silver_dates_desc()
        .await?
        .into_iter()
        .filter(|d| as_of.map_or(true, |limit| *d <= limit))
        .collect();
    let [latest_date, previous_date, ..] = dates[..] else {
        return Err(ChangeError::InsufficientHistory {
            available: dates.len(),
        });
    };
    delta_between(store, previous_date, latest_date).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn listing(unit_id: &str, d: u32, price: Option<i64>) -> NormalizedListing {
        NormalizedListing {
            title: "Bldg".into(),
            address: None,
            city: None,
            state: None,
            zipcode: None,
            neighborhood: "Downtown".into(),
            price,
            beds: Some(2),
            baths: Some(1.0),
            sqft: Some(900),
            unit_name: Some("unitA".into()),
            unit_id: Some(unit_id.into()),
            available_move_in_date: None,
            total_available_units: None,
            listing_url: None,
            scrape_date: day(d),
            scrape_timestamp: Utc.with_ymd_and_hms(2025, 6, d, 17, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn price_drop_is_reported_as_negative_delta() {
        let report = diff_partitions(
            day(1),
            &[listing("u1", 1, Some(1000))],
            day(2),
            &[listing("u1", 2, Some(950))],
        );
        assert_eq!(report.changes.len(), 1);
        let change = &report.changes[0];
        assert_eq!(change.signature.to_string(), "u1|bldg|unita|2|1|900");
        assert_eq!(change.change, ChangeKind::Changed);
        assert_eq!(change.previous_price, Some(1000));
        assert_eq!(change.delta, Some(-50));
    }

    #[test]
    fn later_only_signature_is_new_not_changed() {
        let report = diff_partitions(
            day(1),
            &[listing("u1", 1, Some(1000))],
            day(2),
            &[listing("u1", 2, Some(1000)), listing("u2", 2, Some(800))],
        );
        assert_eq!(report.new_listings().count(), 1);
        assert_eq!(report.changed_listings().count(), 0);
        assert_eq!(report.changes[0].signature.to_string(), "u2|bldg|unita|2|1|900");
        assert_eq!(report.changes[0].delta, None);
    }

    #[test]
    fn removed_and_unpriced_listings_are_not_reported() {
        let report = diff_partitions(
            day(1),
            &[listing("u1", 1, Some(1000)), listing("gone", 1, Some(700))],
            day(2),
            &[listing("u1", 2, Some(1000)), listing("u3", 2, None)],
        );
        assert!(report.changes.is_empty());
    }

    #[test]
    fn report_obeys_set_laws() {
        let before = [
            listing("a", 1, Some(1000)),
            listing("b", 1, Some(1100)),
            listing("c", 1, Some(1200)),
        ];
        let after = [
            listing("b", 2, Some(1150)),
            listing("c", 2, Some(1200)),
            listing("d", 2, Some(900)),
            listing("e", 2, Some(950)),
        ];
        let report = diff_partitions(day(1), &before, day(2), &after);

        let pa = price_map(&before);
        let pb = price_map(&after);
        let expected_new: HashSet<_> = pb.keys().filter(|k| !pa.contains_key(*k)).copied().collect();
        let expected_changed: HashSet<_> = pb
            .iter()
            .filter(|(k, (_, p))| pa.get(*k).is_some_and(|(_, old)| old != p))
            .map(|(k, _)| *k)
            .collect();

        let new: HashSet<_> = report.new_listings().map(|c| c.key).collect();
        let changed: HashSet<_> = report.changed_listings().map(|c| c.key).collect();
        assert_eq!(new, expected_new);
        assert_eq!(changed, expected_changed);
        for change in report.changed_listings() {
            assert_eq!(change.delta, Some(pb[&change.key].1 - pa[&change.key].1));
        }
    }

    #[test]
    fn report_serializes_signature_as_text() {
        let report = diff_partitions(
            day(1),
            &[listing("u1", 1, Some(1000))],
            day(2),
            &[listing("u1", 2, Some(1100))],
        );
        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["changes"][0]["change"], "changed");
        assert_eq!(json["changes"][0]["delta"], 100);
        assert_eq!(json["changes"][0]["signature"], "u1|bldg|unita|2|1|900");
        assert_eq!(json["latest_date"], "2025-06-02");
    }
}
