use anyhow::{Result, anyhow};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::warn;

/// Class marking one listing row; also what the renderer waits for.
pub const LISTING_ROW_CLASS: &str = "market_listing_row_link";

const ROW_CSS: &str = "a.market_listing_row_link";
const TITLE_CSS: &str = ".market_listing_item_name";
const PRICE_CSS: &str = "span.normal_price > span.normal_price";
const QUANTITY_CSS: &str = "span.market_listing_num_listings_qty";

/// Raw text pulled from one listing row. `price_text` has its leading
/// currency symbol removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedListing {
    pub raw_title: String,
    pub price_text: String,
    pub quantity_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubNode {
    Title,
    Price,
    Quantity,
}

/// A listing row without one of its required sub-nodes. The row is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("listing row {index} has no {missing:?} node")]
pub struct NodeFault {
    pub index: usize,
    pub missing: SubNode,
}

#[derive(Debug, Default)]
pub struct PageExtract {
    pub listings: Vec<ScrapedListing>,
    pub faults: Vec<NodeFault>,
}

impl PageExtract {
    /// No listing rows at all, i.e. past the last page.
    pub fn is_empty(&self) -> bool {
        self.listings.is_empty() && self.faults.is_empty()
    }
}

pub struct ListingSelectors {
    row: Selector,
    title: Selector,
    price: Selector,
    quantity: Selector,
}

impl ListingSelectors {
    pub fn new() -> Result<Self> {
        Ok(Self {
            row: parse_selector(ROW_CSS)?,
            title: parse_selector(TITLE_CSS)?,
            price: parse_selector(PRICE_CSS)?,
            quantity: parse_selector(QUANTITY_CSS)?,
        })
    }

    pub fn extract(&self, markup: &str) -> PageExtract {
        let doc = Html::parse_document(markup);
        let mut page = PageExtract::default();

        for (index, row) in doc.select(&self.row).enumerate() {
            match self.extract_row(index, &row) {
                Ok(listing) => page.listings.push(listing),
                Err(fault) => {
                    warn!(%fault, "skipping listing row");
                    page.faults.push(fault);
                }
            }
        }
        page
    }

    fn extract_row(&self, index: usize, row: &ElementRef) -> Result<ScrapedListing, NodeFault> {
        let text_of = |sel: &Selector, missing: SubNode| {
            row.select(sel)
                .next()
                .map(|e| e.text().collect::<String>().trim().to_string())
                .ok_or(NodeFault { index, missing })
        };

        let raw_title = text_of(&self.title, SubNode::Title)?;
        let price = text_of(&self.price, SubNode::Price)?;
        let quantity_text = text_of(&self.quantity, SubNode::Quantity)?;

        Ok(ScrapedListing {
            raw_title,
            price_text: strip_currency_symbol(&price).to_string(),
            quantity_text,
        })
    }
}

fn parse_selector(css: &'static str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {css:?}: {e}"))
}

/// Drops the leading currency symbol (`$`, `€`, `£`, ...), if any.
fn strip_currency_symbol(price: &str) -> &str {
    let mut chars = price.chars();
    match chars.next() {
        Some(c) if !c.is_ascii_digit() => chars.as_str().trim_start(),
        _ => price,
    }
}
