//! Listing signatures: identity fingerprints for matching units across days.

use std::fmt;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::NormalizedListing;

/// Normalized identity tuple of a listing.
///
/// Strings are trimmed and lower-cased; numbers render without a trailing
/// `.0`. `None` and `Some("")` stay distinct in the hashed [`SignatureKey`]
/// even though both render as an empty token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListingSignature {
    tokens: [Option<String>; 6],
}

/// Fixed-width SHA-256 digest of a [`ListingSignature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignatureKey([u8; 32]);

fn text_token(value: Option<&str>) -> Option<String> {
    value.map(|v| v.trim().to_lowercase())
}

/// Renders a number so that `2.0` and `2` produce the same token.
pub fn numeric_token(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    format!("{value}")
}

impl ListingSignature {
    pub fn new(
        unit_id: Option<&str>,
        title: Option<&str>,
        unit_name: Option<&str>,
        beds: Option<f64>,
        baths: Option<f64>,
        sqft: Option<f64>,
    ) -> Self {
        Self {
            tokens: [
                text_token(unit_id),
                text_token(title),
                text_token(unit_name),
                beds.map(numeric_token),
                baths.map(numeric_token),
                sqft.map(numeric_token),
            ],
        }
    }

    pub fn for_listing(listing: &NormalizedListing) -> Self {
        Self::new(
            listing.unit_id.as_deref(),
            Some(&listing.title),
            listing.unit_name.as_deref(),
            listing.beds.map(|b| b as f64),
            listing.baths,
            listing.sqft.map(|s| s as f64),
        )
    }

    pub fn tokens(&self) -> impl Iterator<Item = Option<&str>> {
        self.tokens.iter().map(Option::as_deref)
    }

    pub fn key(&self) -> SignatureKey {
        let mut hasher = Sha256::new();
        for token in &self.tokens {
            match token {
                None => hasher.update([0u8]),
                Some(text) => {
                    hasher.update([1u8]);
                    hasher.update((text.len() as u64).to_be_bytes());
                    hasher.update(text.as_bytes());
                }
            }
        }
        SignatureKey(hasher.finalize().into())
    }
}

impl fmt::Display for ListingSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, token) in self.tokens().enumerate() {
            if idx > 0 {
                f.write_str("|")?;
            }
            f.write_str(token.unwrap_or_default())?;
        }
        Ok(())
    }
}

impl Serialize for ListingSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl SignatureKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for SignatureKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
