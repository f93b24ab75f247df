//! Feed retrieval and parsing.
//!
//! - [`parser`] - streaming RSS/RDF state machine over `quick-xml` events
//! - [`fetcher`] - HTTP GET with URL validation and a body size limit
//! - [`filter`] - case-insensitive article search
//! - [`opml`] - subscription import/export
//!
//! # Example
//!
//! ```ignore
//! use kiosk::feed::{filter_articles, Fetcher};
//!
//! let fetcher = Fetcher::new(&config)?;
//! let articles = fetcher.fetch("https://example.com/rss.xml").await?;
//! let hits = filter_articles(&articles, "rust");
//! ```

mod article;
mod fetcher;
mod filter;
mod opml;
mod parser;

pub use article::Article;
pub use fetcher::{FetchError, FetchResult, Fetcher};
pub use filter::filter_articles;
pub use opml::{export_opml, export_to_file, parse as parse_opml, parse_opml_content, OpmlError, OpmlFeed};
pub use parser::{parse_feed, FeedParser, ParseError, ParserState};
