//! Field normalizers for promoting bronze rows to silver.
//!
//! Every normalizer takes raw scraped text and returns a typed value or
//! `None`. Malformed input never produces an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::{NormalizedListing, RawListing, DEFAULT_NEIGHBORHOOD};

static INTEGER_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]+").expect("integer pattern compiles"));
static DECIMAL_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]+(?:\.[0-9]+)?").expect("decimal pattern compiles"));
static ZIP_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]{5}").expect("zip pattern compiles"));
static AVAILABILITY_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)avail[ai]bility").expect("availability pattern compiles"));

fn non_blank(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

fn first_integer(text: &str) -> Option<i64> {
    INTEGER_RUN.find(text)?.as_str().parse().ok()
}

/// Upper-cases the first letter of every word and lower-cases the rest.
/// A word starts after any character that is not a letter.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

pub fn normalize_price(raw: Option<&str>) -> Option<i64> {
    let raw = non_blank(raw)?;
    first_integer(&raw.replace(',', ""))
}

pub fn normalize_beds(raw: Option<&str>) -> Option<i64> {
    let raw = non_blank(raw)?;
    if raw.to_lowercase().contains("studio") {
        return Some(0);
    }
    first_integer(raw)
}

pub fn normalize_baths(raw: Option<&str>) -> Option<f64> {
    let raw = non_blank(raw)?;
    DECIMAL_RUN.find(raw)?.as_str().parse().ok()
}

pub fn normalize_sqft(raw: Option<&str>) -> Option<i64> {
    let raw = non_blank(raw)?;
    first_integer(&raw.replace(',', ""))
}

pub fn normalize_zip(raw: Option<&str>) -> Option<String> {
    let raw = non_blank(raw)?;
    ZIP_RUN.find(raw).map(|m| m.as_str().to_string())
}

pub fn normalize_city(raw: Option<&str>) -> Option<String> {
    non_blank(raw).map(title_case)
}

pub fn normalize_state(raw: Option<&str>) -> Option<String> {
    non_blank(raw).map(str::to_uppercase)
}

pub fn normalize_address(raw: Option<&str>) -> Option<String> {
    let trimmed = non_blank(raw)?.trim_end_matches(',').trim_end();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn normalize_availability(raw: Option<&str>) -> Option<String> {
    let raw = non_blank(raw)?;
    let stripped = AVAILABILITY_LABEL.replace_all(raw, "");
    let stripped = stripped.trim();
    (!stripped.is_empty()).then(|| title_case(stripped))
}

#[derive(Debug, Error)]
pub enum NeighborhoodTableError {
    #[error("reading neighborhood table {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing neighborhood table: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Deserialize)]
struct NeighborhoodTableFile {
    zip_to_neighborhood: BTreeMap<String, String>,
    #[serde(default)]
    default: Option<String>,
}

/// Immutable zip code → neighborhood lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborhoodTable {
    entries: BTreeMap<String, String>,
    default_label: String,
}

impl Default for NeighborhoodTable {
    fn default() -> Self {
        Self::des_moines()
    }
}

impl NeighborhoodTable {
    pub fn new(entries: BTreeMap<String, String>, default_label: impl Into<String>) -> Self {
        Self {
            entries,
            default_label: default_label.into(),
        }
    }

    /// Built-in table for the Des Moines metro area.
    pub fn des_moines() -> Self {
        let entries = [
            ("50309", "Downtown"),
            ("50310", "Beaverdale"),
            ("50311", "Drake"),
            ("50312", "Sherman Hill"),
            ("50313", "Highland Park"),
            ("50314", "River Bend"),
            ("50315", "South Side"),
            ("50316", "Capitol East"),
            ("50317", "East Des Moines"),
            ("50320", "SE Des Moines"),
            ("50321", "Airport/SW"),
            ("50322", "Urbandale (DSM)"),
            ("50327", "Pleasant Hill"),
            ("50265", "Valley Junction (West Des Moines)"),
            ("50266", "Jordan Creek (West Des Moines)"),
            ("50023", "Northwest Ankeny"),
            ("50009", "Altoona"),
            ("50263", "Waukee"),
            ("50325", "Clive"),
            ("50131", "Johnston"),
            ("50211", "Norwalk"),
            ("50111", "Grimes"),
        ]
        .into_iter()
        .map(|(zip, name)| (zip.to_string(), name.to_string()))
        .collect();
        Self::new(entries, DEFAULT_NEIGHBORHOOD)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, NeighborhoodTableError> {
        let file: NeighborhoodTableFile = serde_yaml::from_str(text)?;
        Ok(Self::new(
            file.zip_to_neighborhood,
            file.default.unwrap_or_else(|| DEFAULT_NEIGHBORHOOD.to_string()),
        ))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, NeighborhoodTableError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| NeighborhoodTableError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn lookup(&self, zip: Option<&str>) -> &str {
        zip.and_then(|z| self.entries.get(z))
            .map(String::as_str)
            .unwrap_or(&self.default_label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why a bronze row was not promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingBuildingName,
    MissingPrice,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingBuildingName => f.write_str("missing building name"),
            SkipReason::MissingPrice => f.write_str("missing raw price"),
        }
    }
}

/// Cleans one bronze row into its silver form.
///
/// Rows without a building name or raw price text are rejected. A present but
/// unparseable price still promotes, with `price: None`.
pub fn normalize_listing(
    raw: &RawListing,
    neighborhoods: &NeighborhoodTable,
) -> Result<NormalizedListing, SkipReason> {
    let title = non_blank(raw.building_name.as_deref()).ok_or(SkipReason::MissingBuildingName)?;
    let price_raw = non_blank(raw.price_raw.as_deref()).ok_or(SkipReason::MissingPrice)?;

    let zipcode = normalize_zip(raw.zipcode.as_deref());
    let neighborhood = neighborhoods.lookup(zipcode.as_deref()).to_string();

    Ok(NormalizedListing {
        title: title.to_string(),
        address: normalize_address(raw.address.as_deref()),
        city: normalize_city(raw.city.as_deref()),
        state: normalize_state(raw.state.as_deref()),
        zipcode,
        neighborhood,
        price: normalize_price(Some(price_raw)),
        beds: normalize_beds(raw.beds.as_deref()),
        baths: normalize_baths(raw.baths.as_deref()),
        sqft: normalize_sqft(raw.sqft.as_deref()),
        unit_name: raw.unit_name.clone(),
        unit_id: raw.unit_id.clone(),
        available_move_in_date: normalize_availability(raw.available_move_in_date.as_deref()),
        total_available_units: raw.total_available_units,
        listing_url: raw.listing_url.clone(),
        scrape_date: raw.scrape_date,
        scrape_timestamp: raw.scrape_timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::io::Write;

    fn raw() -> RawListing {
        RawListing {
            building_name: Some("The Foundry".into()),
            address: Some(" 100 Court Ave, ".into()),
            city: Some("  des moines ".into()),
            state: Some("ia".into()),
            zipcode: Some("Des Moines, IA 50309-1234".into()),
            unit_name: Some("A1".into()),
            unit_id: Some("u-100".into()),
            price_raw: Some("$1,250 - $1,400/mo".into()),
            beds: Some("2 Beds".into()),
            baths: Some("1.5 Baths".into()),
            sqft: Some("1,020 sq ft".into()),
            available_move_in_date: Some("Availability Now".into()),
            total_available_units: Some(3),
            listing_url: Some("https://example.com/foundry".into()),
            scrape_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            scrape_timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 17, 5, 0).single().unwrap(),
        }
    }

    #[test]
    fn price_takes_first_run_after_dropping_separators() {
        assert_eq!(normalize_price(Some("$1,250 - $1,400")), Some(1250));
        assert_eq!(normalize_price(Some("Call for pricing")), None);
        assert_eq!(normalize_price(Some("")), None);
        assert_eq!(normalize_price(None), None);
        assert_eq!(normalize_price(Some("99999999999999999999999")), None);
    }

    #[test]
    fn beds_recognize_studio_in_any_case() {
        assert_eq!(normalize_beds(Some("STUDIO")), Some(0));
        assert_eq!(normalize_beds(Some("Studio / 1 Bath")), Some(0));
        assert_eq!(normalize_beds(Some("3 bd")), Some(3));
        assert_eq!(normalize_beds(Some("bedrooms")), None);
    }

    #[test]
    fn baths_keep_fractional_part() {
        assert_eq!(normalize_baths(Some("1.5 ba")), Some(1.5));
        assert_eq!(normalize_baths(Some("2 Baths")), Some(2.0));
        assert_eq!(normalize_baths(Some("2. baths")), Some(2.0));
        assert_eq!(normalize_baths(Some("n/a")), None);
    }

    #[test]
    fn sqft_and_zip_extract_digit_runs() {
        assert_eq!(normalize_sqft(Some("1,020 sq ft")), Some(1020));
        assert_eq!(normalize_sqft(Some("--")), None);
        assert_eq!(normalize_zip(Some("IA 50309-1234")), Some("50309".into()));
        assert_eq!(normalize_zip(Some("5030")), None);
    }

    #[test]
    fn text_fields_are_cleaned() {
        assert_eq!(normalize_city(Some("  west DES moines ")), Some("West Des Moines".into()));
        assert_eq!(normalize_city(Some("   ")), None);
        assert_eq!(normalize_state(Some(" ia ")), Some("IA".into()));
        assert_eq!(normalize_address(Some(" 100 Court Ave,, ")), Some("100 Court Ave".into()));
        assert_eq!(normalize_address(Some(",")), None);
    }

    #[test]
    fn availability_label_is_removed_case_insensitively() {
        assert_eq!(normalize_availability(Some("Availability now")), Some("Now".into()));
        assert_eq!(normalize_availability(Some("availibility JUL 1")), Some("Jul 1".into()));
        assert_eq!(normalize_availability(Some("AVAILABILITY")), None);
    }

    #[test]
    fn title_case_restarts_after_non_letters() {
        assert_eq!(title_case("o'neil PLACE"), "O'Neil Place");
        assert_eq!(title_case("1st street"), "1St Street");
    }

    #[test]
    fn neighborhood_lookup_falls_back_to_default() {
        let table = NeighborhoodTable::des_moines();
        assert_eq!(table.len(), 22);
        assert_eq!(table.lookup(Some("50309")), "Downtown");
        assert_eq!(table.lookup(Some("90210")), DEFAULT_NEIGHBORHOOD);
        assert_eq!(table.lookup(None), DEFAULT_NEIGHBORHOOD);
    }

    #[test]
    fn neighborhood_table_loads_from_yaml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("neighborhoods.yaml");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(file, "default: Elsewhere\nzip_to_neighborhood:\n  \"68102\": Old Market").expect("write");

        let table = NeighborhoodTable::from_yaml_file(&path).expect("load table");
        assert_eq!(table.lookup(Some("68102")), "Old Market");
        assert_eq!(table.lookup(Some("50309")), "Elsewhere");
    }

    #[test]
    fn missing_neighborhood_file_reports_path() {
        let err = NeighborhoodTable::from_yaml_file("/nonexistent/neighborhoods.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/neighborhoods.yaml"));
    }

    #[test]
    fn full_row_normalizes() {
        let listing = normalize_listing(&raw(), &NeighborhoodTable::des_moines()).expect("promotes");
        assert_eq!(listing.title, "The Foundry");
        assert_eq!(listing.address.as_deref(), Some("100 Court Ave"));
        assert_eq!(listing.city.as_deref(), Some("Des Moines"));
        assert_eq!(listing.state.as_deref(), Some("IA"));
        assert_eq!(listing.zipcode.as_deref(), Some("50309"));
        assert_eq!(listing.neighborhood, "Downtown");
        assert_eq!(listing.price, Some(1250));
        assert_eq!(listing.beds, Some(2));
        assert_eq!(listing.baths, Some(1.5));
        assert_eq!(listing.sqft, Some(1020));
        assert_eq!(listing.available_move_in_date.as_deref(), Some("Now"));
    }

    #[test]
    fn rows_without_identity_fields_are_rejected() {
        let table = NeighborhoodTable::des_moines();

        let mut no_name = raw();
        no_name.building_name = Some("  ".into());
        assert_eq!(
            normalize_listing(&no_name, &table).unwrap_err(),
            SkipReason::MissingBuildingName
        );

        let mut no_price = raw();
        no_price.price_raw = None;
        assert_eq!(normalize_listing(&no_price, &table).unwrap_err(), SkipReason::MissingPrice);

        let mut unpriced = raw();
        unpriced.price_raw = Some("Contact us".into());
        assert_eq!(normalize_listing(&unpriced, &table).expect("promotes").price, None);
    }
}
