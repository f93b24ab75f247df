//! Utility functions shared by the parser, the filter and the CLI.
//!
//! - **Text**: fragment cleanup, case-insensitive matching, terminal-safe output
//! - **URL validation**: syntax checks plus an optional SSRF guard

mod text;
mod url_validator;

pub use text::{
    clean_fragment, contains_ignore_case, display_width, strip_control_chars, truncate_to_width,
};
pub use url_validator::{validate_feed_url, validate_url_for_open, UrlValidationError};
