//! Decomposes a marketplace listing title into its typed name parts.
//!
//! Titles follow the market's naming convention:
//!
//! ```text
//! ★ StatTrak™ Bowie Knife | Doppler (Factory New)
//! ^ ^         ^             ^        ^
//! | |         item type     skin     quality
//! | special-track marker (optional)
//! rarity marker (optional)
//! ```
//!
//! Base items carry no `|` and get the `N/A` sentinel for skin and quality.

use std::fmt;

use thiserror::Error;

/// Sentinel stored for the skin and quality of items without a cosmetic variant.
pub const NOT_APPLICABLE: &str = "N/A";

/// Leading rarity star shown on knives and gloves.
pub const RARITY_MARKER: &str = "★";
/// Kill-tracking variant marker.
pub const SPECIAL_TRACK_MARKER: &str = "StatTrak™";

const NAME_SEPARATOR: char = '|';
const QUALITY_OPEN: char = '(';
const QUALITY_CLOSE: char = ')';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemName {
    pub item_type: String,
    pub skin_name: String,
    pub skin_quality: String,
    pub is_special_track: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    EmptyItemType,
    MissingSkin,
    MissingQuality,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MalformedReason::EmptyItemType => "no item type",
            MalformedReason::MissingSkin => "no skin name",
            MalformedReason::MissingQuality => "no skin quality",
        };
        f.write_str(s)
    }
}

/// A title that does not follow the naming convention. Such listings are
/// dropped before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed title {title:?}: {reason}")]
pub struct MalformedTitle {
    pub title: String,
    pub reason: MalformedReason,
}

/// Parses a raw listing title.
///
/// Rules, applied in order:
/// 1. surrounding whitespace and a leading [`RARITY_MARKER`] are dropped;
/// 2. if [`SPECIAL_TRACK_MARKER`] occurs, it is removed and the item is flagged;
/// 3. without a `|` the remainder is the item type;
/// 4. otherwise a single left-to-right scan fills the fields on `|`, `(` and `)`.
///    Delimiters never end up in a field and each field is whitespace-trimmed.
///    A `(` met before any skin text opens a bracketed skin and is skipped.
pub fn parse_title(raw: &str) -> Result<ItemName, MalformedTitle> {
    let malformed = |reason| MalformedTitle {
        title: raw.to_string(),
        reason,
    };

    let rest = raw.trim();
    let rest = rest.strip_prefix(RARITY_MARKER).unwrap_or(rest);

    let is_special_track = rest.contains(SPECIAL_TRACK_MARKER);
    let rest = if is_special_track {
        rest.replacen(SPECIAL_TRACK_MARKER, "", 1)
    } else {
        rest.to_string()
    };
    let rest = rest.trim();

    if !rest.contains(NAME_SEPARATOR) {
        if rest.is_empty() {
            return Err(malformed(MalformedReason::EmptyItemType));
        }
        return Ok(ItemName {
            item_type: rest.to_string(),
            skin_name: NOT_APPLICABLE.to_string(),
            skin_quality: NOT_APPLICABLE.to_string(),
            is_special_track,
        });
    }

    let mut buffer = String::new();
    let mut item_type: Option<String> = None;
    let mut skin_name: Option<String> = None;
    let mut skin_quality: Option<String> = None;

    for ch in rest.chars() {
        match ch {
            NAME_SEPARATOR => item_type = take_field(&mut buffer),
            QUALITY_OPEN if buffer.trim().is_empty() => {}
            QUALITY_OPEN => skin_name = take_field(&mut buffer),
            QUALITY_CLOSE => skin_quality = take_field(&mut buffer),
            _ => buffer.push(ch),
        }
    }

    let item_type = item_type.ok_or_else(|| malformed(MalformedReason::EmptyItemType))?;
    let skin_name = skin_name.ok_or_else(|| malformed(MalformedReason::MissingSkin))?;
    let skin_quality = skin_quality.ok_or_else(|| malformed(MalformedReason::MissingQuality))?;

    Ok(ItemName {
        item_type,
        skin_name,
        skin_quality,
        is_special_track,
    })
}

// Empty fields count as unset.
fn take_field(buffer: &mut String) -> Option<String> {
    let field = buffer.trim().to_string();
    buffer.clear();
    (!field.is_empty()).then_some(field)
}
