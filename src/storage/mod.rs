mod feeds;
mod kv;
mod schema;
mod types;

pub use feeds::FEEDS_KEY;
pub use schema::Database;
pub use types::{DatabaseError, Feed, RecordError};
