//! RSS/RDF feed subscriptions: a streaming feed parser, a fetch adapter,
//! and a registry that keeps each subscribed feed's article list in sync.
//!
//! - [`feed`] - parsing, fetching, filtering, OPML import/export
//! - [`registry`] - the subscription list and its fetched articles
//! - [`storage`] - SQLite persistence of the subscription list
//! - [`config`] - optional TOML configuration
//! - [`util`] - text and URL helpers

pub mod config;
pub mod feed;
pub mod registry;
pub mod storage;
pub mod util;
