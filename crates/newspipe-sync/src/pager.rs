//! Bounded page loop for one target/window, with per-page retries.

use std::time::Duration;

use newspipe_adapters::{ArticleSource, PageQuery, PageResult, SourceError};
use newspipe_core::{Article, DateWindow};
use newspipe_storage::{BackoffPolicy, DedupStore};
use tracing::{debug, error, info, instrument, warn};

use crate::IngestError;

/// A page that could not be fetched, with the attempts spent on it.
#[derive(Debug)]
pub struct FetchFailure {
    pub attempts: usize,
    pub error: SourceError,
}

/// Issues one page request, re-issuing it after a jittered backoff while the
/// source reports a transient failure. Makes at most `max_retries + 1` calls;
/// a fatal failure is returned after the first.
pub async fn fetch_with_retries(
    source: &dyn ArticleSource,
    query: &PageQuery,
    policy: &BackoffPolicy,
) -> Result<Vec<Article>, FetchFailure> {
    let mut attempts = 0usize;
    loop {
        attempts += 1;
        match source.fetch_page(query).await {
            PageResult::Success(articles) => {
                if attempts > 1 {
                    info!(attempts, page = query.page, "page fetch recovered");
                }
                return Ok(articles);
            }
            PageResult::Fatal(error) => {
                error!(attempts, page = query.page, error = %error, "page fetch failed permanently");
                return Err(FetchFailure { attempts, error });
            }
            PageResult::Transient(error) => {
                if attempts > policy.max_retries {
                    error!(attempts, page = query.page, error = %error, "page fetch retries exhausted");
                    return Err(FetchFailure { attempts, error });
                }
                let delay = policy.jittered_delay(attempts - 1);
                warn!(
                    attempt = attempts,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "page fetch failed; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The upstream returned a page with no records at all.
    Exhausted,
    /// Every budgeted page was requested.
    PageBudget,
    /// A page failed for good; see [`WindowFetch::failure`].
    Failed,
}

/// Outcome of one page loop. Articles from pages accepted before a failure
/// are kept: their identifiers are already durable, so they must still be
/// handed to the sinks.
#[derive(Debug)]
pub struct WindowFetch {
    /// Novel articles in page order.
    pub articles: Vec<Article>,
    pub pages_requested: u32,
    pub raw_records: usize,
    pub stop: StopReason,
    pub failure: Option<IngestError>,
}

/// Drives the page loop for a single target and window. Novel identifiers
/// are persisted before the next request goes out.
pub struct PagedFetcher<'a> {
    source: &'a dyn ArticleSource,
    dedup: &'a mut DedupStore,
    backoff: BackoffPolicy,
    pacing: Duration,
    page_size: u32,
    skip_duplicates: bool,
    lang: Option<String>,
}

impl<'a> PagedFetcher<'a> {
    pub fn new(source: &'a dyn ArticleSource, dedup: &'a mut DedupStore) -> Self {
        Self {
            source,
            dedup,
            backoff: BackoffPolicy::default(),
            pacing: Duration::ZERO,
            page_size: newspipe_adapters::MAX_PAGE_SIZE,
            skip_duplicates: true,
            lang: None,
        }
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn skip_duplicates(mut self, skip: bool) -> Self {
        self.skip_duplicates = skip;
        self
    }

    pub fn lang(mut self, lang: Option<String>) -> Self {
        self.lang = lang;
        self
    }

    #[instrument(
        name = "page_loop",
        skip_all,
        fields(target = %target, window = %window.map(|w| w.to_string()).unwrap_or_else(|| "recent".into()))
    )]
    pub async fn run(
        &mut self,
        target: &str,
        window: Option<DateWindow>,
        pages: u32,
    ) -> WindowFetch {
        let mut articles = Vec::new();
        let mut raw_records = 0usize;
        let mut pages_requested = 0u32;
        let mut stop = StopReason::PageBudget;
        let mut failure = None;

        for page in 1..=pages {
            let query = PageQuery {
                query: target.to_string(),
                lang: self.lang.clone(),
                window,
                page,
                page_size: self.page_size,
                skip_duplicates: self.skip_duplicates,
            };
            pages_requested = page;
            let raw = match fetch_with_retries(self.source, &query, &self.backoff).await {
                Ok(raw) => raw,
                Err(err) => {
                    failure = Some(IngestError::FetchFailed {
                        target: target.to_string(),
                        window: window.map(|w| w.to_string()).unwrap_or_else(|| "recent".into()),
                        page,
                        attempts: err.attempts,
                        source: err.error,
                    });
                    stop = StopReason::Failed;
                    break;
                }
            };

            if raw.is_empty() {
                debug!(page, "empty page; no more results");
                stop = StopReason::Exhausted;
                break;
            }
            raw_records += raw.len();
            let raw_count = raw.len();

            let novel = self.dedup.filter_novel(raw);
            let ids: Vec<&str> = novel.iter().filter_map(Article::identifier).collect();
            if let Err(err) = self.dedup.persist(&ids).await {
                failure = Some(IngestError::Storage(err));
                stop = StopReason::Failed;
                break;
            }
            debug!(page, raw = raw_count, novel = novel.len(), "page accepted");
            articles.extend(novel);

            if !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
        }

        WindowFetch {
            articles,
            pages_requested,
            raw_records,
            stop,
            failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use newspipe_adapters::MemorySource;
    use tempfile::tempdir;
    use tokio::time::Instant;

    fn article(uri: &str) -> Article {
        Article {
            uri: Some(uri.to_string()),
            ..Default::default()
        }
    }

    fn query(target: &str, page: u32) -> PageQuery {
        PageQuery {
            query: target.to_string(),
            lang: None,
            window: None,
            page,
            page_size: 100,
            skip_duplicates: true,
        }
    }

    fn no_jitter(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            max_jitter: Duration::ZERO,
            ..BackoffPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let source = MemorySource::new()
            .with_page("AAPL", None, 1, vec![article("a")])
            .with_transient_failures("AAPL", None, 1, 2);

        let started = Instant::now();
        let page = fetch_with_retries(&source, &query("AAPL", 1), &no_jitter(3))
            .await
            .expect("third attempt succeeds");
        let elapsed = started.elapsed();

        assert_eq!(page.len(), 1);
        assert_eq!(source.call_count(), 3);
        // 1s then 1.5s
        assert!(elapsed >= Duration::from_millis(2500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2600), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_after_max_retries_plus_one_calls() {
        let source = MemorySource::new().with_transient_failures("AAPL", None, 1, 10);
        let failure = fetch_with_retries(&source, &query("AAPL", 1), &no_jitter(2))
            .await
            .expect_err("exhausted");
        assert_eq!(failure.attempts, 3);
        assert_eq!(source.call_count(), 3);
        assert!(matches!(failure.error, SourceError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retried() {
        let source = MemorySource::new().with_fatal("AAPL", None, 1);
        let failure = fetch_with_retries(&source, &query("AAPL", 1), &no_jitter(3))
            .await
            .expect_err("fatal");
        assert_eq!(failure.attempts, 1);
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_page_ends_the_loop_early() {
        let dir = tempdir().expect("tempdir");
        let mut dedup = DedupStore::open_in(dir.path()).await.expect("dedup");
        let source = MemorySource::new().with_page("AAPL", None, 1, vec![article("a"), article("b")]);

        let fetched = PagedFetcher::new(&source, &mut dedup).run("AAPL", None, 5).await;

        assert_eq!(fetched.stop, StopReason::Exhausted);
        assert_eq!(fetched.pages_requested, 2);
        assert_eq!(fetched.articles.len(), 2);
        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test]
    async fn all_duplicate_page_does_not_stop_the_loop() {
        let dir = tempdir().expect("tempdir");
        let mut dedup = DedupStore::open_in(dir.path()).await.expect("dedup");
        dedup.persist(&["a", "b"]).await.expect("seed");
        let mut dedup = DedupStore::open_in(dir.path()).await.expect("reopen");

        let source = MemorySource::new()
            .with_page("AAPL", None, 1, vec![article("a"), article("b")])
            .with_page("AAPL", None, 2, vec![article("c")]);

        let fetched = PagedFetcher::new(&source, &mut dedup).run("AAPL", None, 2).await;
        assert!(fetched.failure.is_none());

        assert_eq!(fetched.stop, StopReason::PageBudget);
        assert_eq!(fetched.raw_records, 3);
        let uris: Vec<_> = fetched.articles.iter().filter_map(Article::identifier).collect();
        assert_eq!(uris, vec!["c"]);

        let reopened = DedupStore::open_in(dir.path()).await.expect("reopen");
        assert_eq!(reopened.len(), 3);
    }

    #[tokio::test]
    async fn page_failure_names_target_window_and_page() {
        let dir = tempdir().expect("tempdir");
        let mut dedup = DedupStore::open_in(dir.path()).await.expect("dedup");
        let window = DateWindow::calendar_year(2023);
        let source = MemorySource::new()
            .with_page("AAPL", window, 1, vec![article("a")])
            .with_fatal("AAPL", window, 2);

        let fetched = PagedFetcher::new(&source, &mut dedup).run("AAPL", window, 3).await;
        assert_eq!(fetched.stop, StopReason::Failed);
        assert_eq!(fetched.pages_requested, 2);
        let uris: Vec<_> = fetched.articles.iter().filter_map(Article::identifier).collect();
        assert_eq!(uris, vec!["a"]);
        match fetched.failure.expect("page 2 failure") {
            IngestError::FetchFailed {
                target,
                window,
                page,
                attempts,
                ..
            } => {
                assert_eq!(target, "AAPL");
                assert_eq!(window, "2023-01-01..2023-12-31");
                assert_eq!(page, 2);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(dedup.contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_follows_each_accepted_page_but_not_the_empty_one() {
        let dir = tempdir().expect("tempdir");
        let mut dedup = DedupStore::open_in(dir.path()).await.expect("dedup");
        let source = MemorySource::new()
            .with_page("AAPL", None, 1, vec![article("a")])
            .with_page("AAPL", None, 2, vec![article("b")]);

        let started = Instant::now();
        let fetched = PagedFetcher::new(&source, &mut dedup)
            .pacing(Duration::from_millis(400))
            .run("AAPL", None, 5)
            .await;
        let elapsed = started.elapsed();

        assert_eq!(fetched.stop, StopReason::Exhausted);
        assert_eq!(source.call_count(), 3);
        // two accepted pages, then the empty third page ends the loop unpaced
        assert!(elapsed >= Duration::from_millis(800), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1200), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_applies_to_the_last_budgeted_page() {
        let dir = tempdir().expect("tempdir");
        let mut dedup = DedupStore::open_in(dir.path()).await.expect("dedup");
        let source = MemorySource::new()
            .with_page("AAPL", None, 1, vec![article("a")])
            .with_page("AAPL", None, 2, vec![article("b")]);

        let started = Instant::now();
        let fetched = PagedFetcher::new(&source, &mut dedup)
            .pacing(Duration::from_millis(250))
            .run("AAPL", None, 2)
            .await;
        let elapsed = started.elapsed();

        assert_eq!(fetched.stop, StopReason::PageBudget);
        assert_eq!(source.call_count(), 2);
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(750), "{elapsed:?}");
    }
}
