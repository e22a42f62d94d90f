use thiserror::Error;

use crate::extract::ScrapedListing;
use crate::title::{ItemName, MalformedTitle, parse_title};

/// One observed marketplace offer, ready for the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingRecord {
    pub item_type: String,
    pub skin_name: String,
    pub skin_quality: String,
    pub is_special_track: bool,
    pub price_usd: f64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error(transparent)]
    Title(#[from] MalformedTitle),
    #[error("price {0:?} is not a non-negative number")]
    Price(String),
    #[error("quantity {0:?} is not a non-negative integer")]
    Quantity(String),
}

impl ListingRecord {
    pub fn from_listing(listing: &ScrapedListing) -> Result<Self, RecordError> {
        let name = parse_title(&listing.raw_title)?;
        Self::from_parts(name, &listing.price_text, &listing.quantity_text)
    }

    /// Builds a record from a parsed title and the extractor's price and
    /// quantity text (price already stripped of its currency symbol).
    pub fn from_parts(
        name: ItemName,
        price_text: &str,
        quantity_text: &str,
    ) -> Result<Self, RecordError> {
        Ok(Self {
            price_usd: parse_price(price_text)?,
            quantity: parse_quantity(quantity_text)?,
            item_type: name.item_type,
            skin_name: name.skin_name,
            skin_quality: name.skin_quality,
            is_special_track: name.is_special_track,
        })
    }
}

/// `"1,234.56 USD"` -> `1234.56`, `"3,10€"` -> `3.1`.
///
/// A comma is the decimal mark when exactly two digits follow it and no `.`
/// comes after it (`1.234,56` -> `1234.56`); otherwise `,` groups thousands
/// and `.` is the decimal point. Anything after the number is ignored.
pub fn parse_price(text: &str) -> Result<f64, RecordError> {
    let err = || RecordError::Price(text.to_string());
    let text = text.trim();
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(text.len());
    let run = &text[..end];

    let number = match run.rsplit_once(',') {
        Some((whole, cents)) if cents.len() == 2 && !cents.contains('.') => {
            format!("{}.{cents}", whole.replace(['.', ','], ""))
        }
        _ => run.replace(',', ""),
    };
    let value = number.parse::<f64>().map_err(|_| err())?;
    if !value.is_finite() || value < 0.0 {
        return Err(err());
    }
    Ok(value)
}

pub fn parse_quantity(text: &str) -> Result<u32, RecordError> {
    let digits = text.trim().replace(',', "");
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(RecordError::Quantity(text.to_string()));
    }
    digits
        .parse::<u32>()
        .map_err(|_| RecordError::Quantity(text.to_string()))
}
