//! The subscribed-feed collection and its per-feed article lists.
//!
//! [`Registry`] has a single owner that mutates it through `&mut self`.
//! Background fetches run on spawned tasks and report back over a channel;
//! the owner applies them with [`Registry::next_completion`],
//! [`Registry::drain_completions`] or [`Registry::wait_idle`]. Readers on
//! other tasks get [`Snapshot`]s and [`RegistryEvent`] notifications.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::feed::{filter_articles, Article, FetchError, Fetcher, OpmlFeed};
use crate::storage::{Database, DatabaseError, Feed};

/// Capacity of the notification channel. Slow subscribers see `Lagged`.
const EVENT_CAPACITY: usize = 64;

/// Capacity of the completion channel between fetch tasks and the owner.
const COMPLETION_CAPACITY: usize = 100;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No subscribed feed with id {0}")]
    UnknownFeed(Uuid),

    #[error("A feed with id {0} is already subscribed")]
    DuplicateFeed(Uuid),

    #[error("Fetching feed {feed_id} failed: {source}")]
    Fetch {
        feed_id: Uuid,
        #[source]
        source: FetchError,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ============================================================================
// Public Types
// ============================================================================

/// The article list from a feed's most recent successful fetch.
#[derive(Debug, Clone)]
pub struct FeedArticles {
    pub articles: Arc<Vec<Article>>,
    pub fetched_at: DateTime<Utc>,
}

/// Immutable view of the registry at one instant.
///
/// A feed with no entry in `articles` has never been fetched successfully.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub feeds: Arc<Vec<Feed>>,
    pub articles: HashMap<Uuid, FeedArticles>,
}

impl Snapshot {
    pub fn articles_for(&self, feed_id: Uuid) -> Option<&Arc<Vec<Article>>> {
        self.articles.get(&feed_id).map(|fa| &fa.articles)
    }
}

/// Which feed, and which of its articles, the front end has selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Selection {
    pub feed: Option<Uuid>,
    pub article: Option<Uuid>,
}

/// Change notifications for subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The feed list was added to, edited, reordered, or shrunk.
    FeedsChanged,
    /// A fetch succeeded and replaced the feed's article list.
    ArticlesReplaced { feed_id: Uuid, count: usize },
    /// A fetch failed; the previous article list is untouched.
    FetchFailed { feed_id: Uuid, error: String },
    /// The selected feed was deleted.
    SelectionCleared,
}

/// Result of [`Registry::edit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// No feed has that id; nothing changed.
    NotFound,
    /// Saved with the same url; no fetch was scheduled.
    Renamed,
    /// Saved with a new url; a re-fetch was scheduled.
    UrlChanged(Ticket),
}

/// Handle for one scheduled background fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

/// A background fetch that finished and was applied by the owner.
#[derive(Debug)]
pub struct Completion {
    pub ticket: Ticket,
    pub feed_id: Uuid,
    pub outcome: CompletionOutcome,
}

#[derive(Debug)]
pub enum CompletionOutcome {
    /// The article list was replaced with `count` articles.
    Replaced { count: usize },
    /// The fetch failed; the previous list is kept.
    Failed(FetchError),
    /// The fetch task panicked.
    Panicked(String),
}

/// Totals from [`Registry::refresh_all`].
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub succeeded: usize,
    pub failed: Vec<(Uuid, FetchError)>,
}

// ============================================================================
// Internal Types
// ============================================================================

struct InFlight {
    feed_id: Uuid,
    handle: AbortHandle,
}

/// Message a fetch task sends back to the owner.
struct FetchDone {
    ticket: Ticket,
    feed_id: Uuid,
    url: String,
    result: Result<Result<Vec<Article>, FetchError>, String>,
}

// ============================================================================
// Registry
// ============================================================================

pub struct Registry {
    db: Database,
    fetcher: Fetcher,
    feeds: Arc<Vec<Feed>>,
    articles: HashMap<Uuid, FeedArticles>,
    selection: Selection,
    events: broadcast::Sender<RegistryEvent>,
    done_tx: mpsc::Sender<FetchDone>,
    done_rx: mpsc::Receiver<FetchDone>,
    in_flight: HashMap<Ticket, InFlight>,
    next_ticket: u64,
    /// Runtime the fetch tasks are spawned on, captured in `load`.
    runtime: Handle,
}

impl Registry {
    /// Loads the persisted feed list. No fetches are started.
    ///
    /// Malformed records are skipped (and logged) by the storage layer.
    /// Background fetches are spawned on the runtime that runs this call,
    /// so the registry may be driven from outside that runtime afterwards.
    pub async fn load(db: Database, fetcher: Fetcher) -> Result<Self, RegistryError> {
        let feeds = db.load_feeds().await?;
        tracing::info!(feeds = feeds.len(), "Loaded subscriptions");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (done_tx, done_rx) = mpsc::channel(COMPLETION_CAPACITY);
        Ok(Self {
            db,
            fetcher,
            feeds: Arc::new(feeds),
            articles: HashMap::new(),
            selection: Selection::default(),
            events,
            done_tx,
            done_rx,
            in_flight: HashMap::new(),
            next_ticket: 0,
            runtime: Handle::current(),
        })
    }

    // ------------------------------------------------------------------------
    // Read access
    // ------------------------------------------------------------------------

    pub fn feeds(&self) -> &[Feed] {
        &self.feeds
    }

    pub fn feed(&self, id: Uuid) -> Option<&Feed> {
        self.feeds.iter().find(|f| f.id == id)
    }

    /// The feed's current article list, if it was ever fetched successfully.
    pub fn articles(&self, id: Uuid) -> Option<Arc<Vec<Article>>> {
        self.articles.get(&id).map(|fa| Arc::clone(&fa.articles))
    }

    pub fn fetched_at(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.articles.get(&id).map(|fa| fa.fetched_at)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            feeds: Arc::clone(&self.feeds),
            articles: self.articles.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Number of background fetches not yet applied.
    pub fn pending_fetches(&self) -> usize {
        self.in_flight.len()
    }

    /// Articles of `id` matching `query`; see [`filter_articles`].
    ///
    /// A feed that has not been fetched yet yields an empty list.
    pub fn search(&self, id: Uuid, query: &str) -> Result<Vec<Article>, RegistryError> {
        if self.feed(id).is_none() {
            return Err(RegistryError::UnknownFeed(id));
        }
        Ok(self
            .articles
            .get(&id)
            .map(|fa| filter_articles(&fa.articles, query))
            .unwrap_or_default())
    }

    // ------------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------------

    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// Selects a feed and clears the article selection. Returns false for an unknown id.
    pub fn select_feed(&mut self, id: Uuid) -> bool {
        if self.feed(id).is_none() {
            return false;
        }
        self.selection = Selection {
            feed: Some(id),
            article: None,
        };
        true
    }

    /// Selects an article of the selected feed. Returns false if it is not in that feed's list.
    pub fn select_article(&mut self, article_id: Uuid) -> bool {
        let Some(feed_id) = self.selection.feed else {
            return false;
        };
        let found = self
            .articles
            .get(&feed_id)
            .is_some_and(|fa| fa.articles.iter().any(|a| a.id == article_id));
        if found {
            self.selection.article = Some(article_id);
        }
        found
    }

    // ------------------------------------------------------------------------
    // Feed list mutations
    // ------------------------------------------------------------------------

    /// Appends `feed`, persists the list, and schedules its first fetch.
    ///
    /// A failing fetch leaves the feed subscribed with no articles and is
    /// reported as [`RegistryEvent::FetchFailed`].
    pub async fn add(&mut self, feed: Feed) -> Result<Ticket, RegistryError> {
        if self.feed(feed.id).is_some() {
            return Err(RegistryError::DuplicateFeed(feed.id));
        }
        let id = feed.id;
        tracing::info!(feed_id = %id, url = %feed.url, "Subscribing");

        let mut next = self.feeds.as_ref().clone();
        next.push(feed);
        self.commit(next).await?;
        self.schedule_fetch(id)
    }

    /// Replaces the feed with the same id.
    ///
    /// The list is persisted whenever the feed exists. A url change schedules
    /// a re-fetch and cancels fetches still running against the old url; the
    /// old articles stay until the new fetch succeeds.
    pub async fn edit(&mut self, feed: Feed) -> Result<EditOutcome, RegistryError> {
        let Some(pos) = self.position(feed.id) else {
            tracing::debug!(feed_id = %feed.id, "Edit of unknown feed ignored");
            return Ok(EditOutcome::NotFound);
        };
        let id = feed.id;
        let url_changed = self.feeds[pos].url != feed.url;

        let mut next = self.feeds.as_ref().clone();
        next[pos] = feed;
        self.commit(next).await?;

        if url_changed {
            self.cancel_fetches(id);
            Ok(EditOutcome::UrlChanged(self.schedule_fetch(id)?))
        } else {
            Ok(EditOutcome::Renamed)
        }
    }

    /// Unsubscribes `id`. Returns false if there was no such feed.
    ///
    /// Drops its articles, aborts its fetches, and clears the selection when
    /// the feed was selected.
    pub async fn delete(&mut self, id: Uuid) -> Result<bool, RegistryError> {
        let Some(pos) = self.position(id) else {
            return Ok(false);
        };

        let mut next = self.feeds.as_ref().clone();
        next.remove(pos);
        self.commit(next).await?;

        self.cancel_fetches(id);
        self.articles.remove(&id);
        if self.selection.feed == Some(id) {
            self.selection = Selection::default();
            self.emit(RegistryEvent::SelectionCleared);
        }
        tracing::info!(feed_id = %id, "Unsubscribed");
        Ok(true)
    }

    /// Moves the feeds at `from` so they sit before the feed currently at
    /// `to` (`to == len` means the end), keeping their relative order.
    ///
    /// Out-of-range indices are ignored. Never fetches.
    pub async fn move_feeds(&mut self, from: &[usize], to: usize) -> Result<(), RegistryError> {
        let len = self.feeds.len();
        let mut sources = BTreeSet::new();
        for &index in from {
            if index < len {
                sources.insert(index);
            } else {
                tracing::warn!(index, len, "Ignoring out-of-range move source");
            }
        }
        if to > len {
            tracing::warn!(to, len, "Ignoring out-of-range move destination");
            return Ok(());
        }
        if sources.is_empty() {
            return Ok(());
        }

        let next = move_items(self.feeds.as_ref().clone(), &sources, to);
        self.commit(next).await
    }

    /// Subscribes every entry whose url is not already subscribed.
    ///
    /// Persists once and schedules one fetch per new feed. Returns the number added.
    pub async fn import(&mut self, entries: &[OpmlFeed]) -> Result<usize, RegistryError> {
        let mut known: HashSet<String> = self.feeds.iter().map(|f| f.url.clone()).collect();
        let mut next = self.feeds.as_ref().clone();
        let mut added = Vec::new();

        for entry in entries {
            if !known.insert(entry.xml_url.clone()) {
                tracing::debug!(url = %entry.xml_url, "Already subscribed, skipping");
                continue;
            }
            let feed = Feed::new(entry.title.clone(), entry.xml_url.clone());
            added.push(feed.id);
            next.push(feed);
        }
        if added.is_empty() {
            return Ok(0);
        }

        self.commit(next).await?;
        for &id in &added {
            self.schedule_fetch(id)?;
        }
        tracing::info!(added = added.len(), "Imported subscriptions");
        Ok(added.len())
    }

    // ------------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------------

    /// Fetches `id` now and replaces its article list on success.
    ///
    /// On failure the previous list is kept and the error returned.
    pub async fn refresh(&mut self, id: Uuid) -> Result<usize, RegistryError> {
        let url = self
            .feed(id)
            .map(|f| f.url.clone())
            .ok_or(RegistryError::UnknownFeed(id))?;

        match self.fetcher.fetch(&url).await {
            Ok(articles) => Ok(self.replace_articles(id, articles)),
            Err(source) => {
                self.report_failure(id, &url, &source);
                Err(RegistryError::Fetch { feed_id: id, source })
            }
        }
    }

    /// Refreshes every feed concurrently, bounded by the configured limit.
    pub async fn refresh_all(&mut self) -> RefreshReport {
        let targets: Vec<(Uuid, String)> =
            self.feeds.iter().map(|f| (f.id, f.url.clone())).collect();
        let results = self.fetcher.fetch_many(targets).await;

        let mut report = RefreshReport::default();
        for fetched in results {
            match fetched.result {
                Ok(articles) => {
                    self.replace_articles(fetched.feed_id, articles);
                    report.succeeded += 1;
                }
                Err(e) => {
                    self.report_failure(fetched.feed_id, &fetched.url, &e);
                    report.failed.push((fetched.feed_id, e));
                }
            }
        }
        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed.len(),
            "Refresh complete"
        );
        report
    }

    /// Starts a background fetch of `id`'s current url.
    ///
    /// The result is applied when the owner next calls one of the
    /// completion methods. The task runs on the runtime captured by
    /// [`Registry::load`], so no runtime context is needed here.
    pub fn schedule_fetch(&mut self, id: Uuid) -> Result<Ticket, RegistryError> {
        let url = self
            .feed(id)
            .map(|f| f.url.clone())
            .ok_or(RegistryError::UnknownFeed(id))?;

        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;

        let fetcher = self.fetcher.clone();
        let tx = self.done_tx.clone();
        let handle = self.runtime.spawn(async move {
            let result = catch_task_panic(fetcher.fetch(&url)).await;
            let done = FetchDone {
                ticket,
                feed_id: id,
                url,
                result,
            };
            if tx.send(done).await.is_err() {
                tracing::debug!(feed_id = %id, "Registry dropped before fetch finished");
            }
        });

        self.in_flight.insert(
            ticket,
            InFlight {
                feed_id: id,
                handle: handle.abort_handle(),
            },
        );
        tracing::debug!(feed_id = %id, ticket = ticket.0, "Scheduled fetch");
        Ok(ticket)
    }

    /// Waits for the next background fetch and applies it.
    ///
    /// Returns `None` at once when nothing is in flight.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        while !self.in_flight.is_empty() {
            let done = self.done_rx.recv().await?;
            if let Some(completion) = self.apply(done) {
                return Some(completion);
            }
        }
        None
    }

    /// Applies every fetch that has already finished, without waiting.
    pub fn drain_completions(&mut self) -> Vec<Completion> {
        let mut applied = Vec::new();
        while let Ok(done) = self.done_rx.try_recv() {
            if let Some(completion) = self.apply(done) {
                applied.push(completion);
            }
        }
        applied
    }

    /// Waits until every scheduled fetch has been applied.
    pub async fn wait_idle(&mut self) -> Vec<Completion> {
        let mut applied = Vec::new();
        while let Some(completion) = self.next_completion().await {
            applied.push(completion);
        }
        applied
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn position(&self, id: Uuid) -> Option<usize> {
        self.feeds.iter().position(|f| f.id == id)
    }

    /// Persists `next`, then makes it the live list.
    async fn commit(&mut self, next: Vec<Feed>) -> Result<(), RegistryError> {
        self.db.save_feeds(&next).await?;
        self.feeds = Arc::new(next);
        self.emit(RegistryEvent::FeedsChanged);
        Ok(())
    }

    fn emit(&self, event: RegistryEvent) {
        // Err only means nobody is subscribed
        let _ = self.events.send(event);
    }

    fn cancel_fetches(&mut self, id: Uuid) {
        self.in_flight.retain(|ticket, job| {
            if job.feed_id != id {
                return true;
            }
            job.handle.abort();
            tracing::debug!(feed_id = %id, ticket = ticket.0, "Cancelled fetch");
            false
        });
    }

    fn replace_articles(&mut self, id: Uuid, articles: Vec<Article>) -> usize {
        let count = articles.len();
        self.articles.insert(
            id,
            FeedArticles {
                articles: Arc::new(articles),
                fetched_at: Utc::now(),
            },
        );
        tracing::debug!(feed_id = %id, count, "Replaced articles");
        self.emit(RegistryEvent::ArticlesReplaced { feed_id: id, count });
        count
    }

    fn report_failure(&self, id: Uuid, url: &str, error: &FetchError) {
        tracing::warn!(feed_id = %id, url = %url, error = %error, "Feed fetch failed");
        self.emit(RegistryEvent::FetchFailed {
            feed_id: id,
            error: error.to_string(),
        });
    }

    /// Applies one finished fetch.
    ///
    /// Returns `None`, leaving the articles untouched, for a cancelled
    /// ticket or a result for a url the feed no longer has. Url edits and
    /// deletes cancel their tickets, so the url check only backs that up.
    fn apply(&mut self, done: FetchDone) -> Option<Completion> {
        let Some(job) = self.in_flight.remove(&done.ticket) else {
            tracing::debug!(feed_id = %done.feed_id, ticket = done.ticket.0, "Dropping cancelled fetch result");
            return None;
        };
        debug_assert_eq!(job.feed_id, done.feed_id);

        if self.feed(done.feed_id).map(|f| f.url.as_str()) != Some(done.url.as_str()) {
            tracing::debug!(feed_id = %done.feed_id, url = %done.url, "Dropping stale fetch result");
            return None;
        }

        let outcome = match done.result {
            Ok(Ok(articles)) => CompletionOutcome::Replaced {
                count: self.replace_articles(done.feed_id, articles),
            },
            Ok(Err(e)) => {
                self.report_failure(done.feed_id, &done.url, &e);
                CompletionOutcome::Failed(e)
            }
            Err(panic_msg) => {
                tracing::error!(feed_id = %done.feed_id, error = %panic_msg, "Fetch task panicked");
                self.emit(RegistryEvent::FetchFailed {
                    feed_id: done.feed_id,
                    error: panic_msg.clone(),
                });
                CompletionOutcome::Panicked(panic_msg)
            }
        };

        Some(Completion {
            ticket: done.ticket,
            feed_id: done.feed_id,
            outcome,
        })
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let count = self.in_flight.len();
        for (_, job) in self.in_flight.drain() {
            job.handle.abort();
        }
        if count > 0 {
            tracing::debug!(count, "Aborted fetch tasks on Registry drop");
        }
    }
}

/// Runs a future, converting a panic into `Err(message)`.
async fn catch_task_panic<F, T>(future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    use futures::FutureExt;
    use std::panic::AssertUnwindSafe;

    AssertUnwindSafe(future).catch_unwind().await.map_err(|panic| {
        if let Some(s) = panic.downcast_ref::<&'static str>() {
            s.to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        }
    })
}

/// List move: the items at `sources` are taken out and reinserted, in their
/// original order, where the item at `to` used to be.
fn move_items<T>(items: Vec<T>, sources: &BTreeSet<usize>, to: usize) -> Vec<T> {
    let insert_at = to - sources.range(..to).count();
    let mut moved = Vec::with_capacity(sources.len());
    let mut rest = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        if sources.contains(&index) {
            moved.push(item);
        } else {
            rest.push(item);
        }
    }
    rest.splice(insert_at..insert_at, moved);
    rest
}
