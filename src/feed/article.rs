use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// One parsed `<item>` from a feed fetch.
///
/// The id is minted at parse time, so fetching the same remote item twice
/// yields two different articles. Text fields are never absent: anything the
/// source omitted is the empty string. `description` keeps whatever markup
/// the feed embedded, and `pub_date` is the raw source string.
///
/// PERF-010: String fields use `Arc<str>` so cloning an article list for a
/// snapshot or a filter result does not copy text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Article {
    pub id: Uuid,
    pub title: Arc<str>,
    pub description: Arc<str>,
    pub link: Arc<str>,
    pub pub_date: Arc<str>,
    pub creator: Arc<str>,
    /// `None` when the item had no non-empty `<category>`.
    pub categories: Option<Vec<Arc<str>>>,
}

impl Article {
    /// Whether any category matches `pred`. Items without categories never match.
    pub fn any_category(&self, mut pred: impl FnMut(&str) -> bool) -> bool {
        self.categories
            .as_deref()
            .is_some_and(|cats| cats.iter().any(|c| pred(&**c)))
    }
}
