use serde_json::Value;
use std::collections::HashSet;

use super::schema::Database;
use super::types::{DatabaseError, Feed, RecordError};

/// Key under which the ordered subscription list is stored.
pub const FEEDS_KEY: &str = "saved_feeds";

impl Database {
    // ========================================================================
    // Feed List Operations
    // ========================================================================

    /// Load the persisted subscription list, in stored order.
    ///
    /// A missing key means no subscriptions yet. Individual records that are
    /// not objects, lack a field, carry a non-string field, have a malformed
    /// id, or repeat an earlier id are logged and skipped; the rest still
    /// load. A value that is not a JSON array at all is treated like an
    /// empty list.
    ///
    /// # Errors
    ///
    /// Only database access failures are returned.
    pub async fn load_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let Some(raw) = self.get_value(FEEDS_KEY).await? else {
            return Ok(Vec::new());
        };

        let records: Vec<Value> = match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Stored feed list is not a JSON array, ignoring it");
                return Ok(Vec::new());
            }
        };

        let mut seen = HashSet::with_capacity(records.len());
        let mut feeds = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let parsed = Feed::from_record(record).and_then(|feed| {
                if seen.insert(feed.id) {
                    Ok(feed)
                } else {
                    Err(RecordError::DuplicateId(feed.id))
                }
            });
            match parsed {
                Ok(feed) => feeds.push(feed),
                Err(e) => {
                    tracing::warn!(index = index, error = %e, "Skipping malformed feed record");
                }
            }
        }

        tracing::debug!(loaded = feeds.len(), stored = records.len(), "Loaded feed list");
        Ok(feeds)
    }

    /// Replace the persisted subscription list with `feeds`, keeping their order.
    pub async fn save_feeds(&self, feeds: &[Feed]) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(feeds)?;
        self.set_value(FEEDS_KEY, &json).await
    }
}
