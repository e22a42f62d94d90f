//! Community-market knife scraper: page fetching with retry, listing title
//! parsing and deduplicating persistence into SQLite.

pub mod config;
pub mod controller;
pub mod extract;
pub mod fetch;
pub mod record;
pub mod render;
pub mod store;
pub mod title;
