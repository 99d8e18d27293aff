//! Paginated history fetches for backward scrolling.
//!
//! [`HistorySource`] performs one page request. [`HistoryPager`] is the
//! bookkeeping around it: the next page index, whether the oldest page has
//! been seen, and an epoch that `refresh()` bumps so results issued before a
//! refresh can be recognised and dropped.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;

use courtchat_proto::codec::{self, CodecError};
use courtchat_proto::history::HistoryPage;
use courtchat_proto::message::{ConversationId, Message};

/// Errors from a history request. Any of them means the fetch failed and
/// the cursor did not move.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The request could not be sent or the body could not be read.
    #[error("history request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("history endpoint returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// The body was not a history page.
    #[error("malformed history page: {0}")]
    Decode(#[from] CodecError),

    /// The configured base URL is not usable.
    #[error("invalid history url {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Injected failure from an in-memory source.
    #[error("history unavailable: {0}")]
    Unavailable(String),
}

/// Fetches one page of a conversation's history.
///
/// Page 0 is the newest window; larger indices reach further back.
pub trait HistorySource: Send + Sync + 'static {
    /// Fetch page `page` of `size` messages.
    fn fetch_page(
        &self,
        conversation: ConversationId,
        page: u32,
        size: u32,
    ) -> impl Future<Output = Result<HistoryPage, HistoryError>> + Send;
}

/// History over HTTP: `GET {base}/{conversation}?page=n&size=s`.
#[derive(Debug, Clone)]
pub struct HttpHistorySource {
    client: reqwest::Client,
    base: String,
}

impl HttpHistorySource {
    /// Create a source for the given base URL (e.g. `http://host/api/messages`).
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidUrl`] if the URL does not parse or is
    /// not `http`/`https`.
    pub fn new(base: &str) -> Result<Self, HistoryError> {
        let invalid = |reason: String| HistoryError::InvalidUrl {
            url: base.to_string(),
            reason,
        };
        let parsed = url::Url::parse(base).map_err(|e| invalid(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", parsed.scheme())));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        })
    }
}

impl HistorySource for HttpHistorySource {
    async fn fetch_page(
        &self,
        conversation: ConversationId,
        page: u32,
        size: u32,
    ) -> Result<HistoryPage, HistoryError> {
        let url = format!("{}/{conversation}", self.base);
        let response = self
            .client
            .get(&url)
            .query(&[("page", page), ("size", size)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(url = %url, page, status = status.as_u16(), "history fetch rejected");
            return Err(HistoryError::Status {
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        let page_data = codec::decode_page(&body, size)?;
        tracing::debug!(
            conversation = %conversation,
            page,
            items = page_data.items.len(),
            is_last = page_data.is_last,
            "history page fetched"
        );
        Ok(page_data)
    }
}

/// In-memory history, newest-first paging over an ascending message log.
///
/// Used by tests and offline demos. Failures and latency can be scripted.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    messages: Vec<Message>,
    fail_next: u32,
    delay: Option<Duration>,
    requests: Vec<(ConversationId, u32)>,
}

impl MemoryHistory {
    /// Create a source holding `messages` (any order).
    #[must_use]
    pub fn new(mut messages: Vec<Message>) -> Self {
        messages.sort_by_key(|m| m.timestamp);
        Self {
            inner: Mutex::new(MemoryState {
                messages,
                ..MemoryState::default()
            }),
        }
    }

    /// Append a message as if the server had stored it.
    pub fn push(&self, message: Message) {
        let mut inner = self.inner.lock();
        inner.messages.push(message);
        inner.messages.sort_by_key(|m| m.timestamp);
    }

    /// Fail the next `count` fetches.
    pub fn fail_next(&self, count: u32) {
        self.inner.lock().fail_next = count;
    }

    /// Delay every subsequent fetch.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.inner.lock().delay = delay;
    }

    /// Page indices requested so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<(ConversationId, u32)> {
        self.inner.lock().requests.clone()
    }

    fn page(
        &self,
        conversation: ConversationId,
        page: u32,
        size: u32,
    ) -> Result<HistoryPage, HistoryError> {
        let mut inner = self.inner.lock();
        inner.requests.push((conversation, page));
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(HistoryError::Unavailable("scripted failure".into()));
        }
        let matching: Vec<&Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation)
            .collect();
        let size = size as usize;
        let skip = page as usize * size;
        let end = matching.len().saturating_sub(skip);
        let start = end.saturating_sub(size);
        Ok(HistoryPage {
            items: matching[start..end].iter().map(|m| (*m).clone()).collect(),
            is_last: start == 0,
        })
    }
}

impl HistorySource for MemoryHistory {
    async fn fetch_page(
        &self,
        conversation: ConversationId,
        page: u32,
        size: u32,
    ) -> Result<HistoryPage, HistoryError> {
        let delay = self.inner.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.page(conversation, page, size)
    }
}

/// Why a page is being fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Next older page; advances the cursor on success.
    Older,
    /// Newest page re-read after a reconnection; never moves the cursor.
    CatchUp,
}

/// A page fetch issued by the pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Page index to fetch.
    pub index: u32,
    /// Pager epoch at issue time.
    pub epoch: u64,
    /// Purpose of the fetch.
    pub kind: FetchKind,
}

/// What [`HistoryPager::begin_older`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OlderStart {
    /// Issue this request.
    Issue(PageRequest),
    /// A cursor-advancing fetch is already running; wait for it.
    InFlight(PageRequest),
    /// The oldest page has already been loaded.
    Exhausted,
}

/// Cursor bookkeeping for backward pagination.
#[derive(Debug, Clone)]
pub struct HistoryPager {
    page_size: u32,
    cursor: u32,
    exhausted: bool,
    epoch: u64,
    in_flight: Option<PageRequest>,
}

impl HistoryPager {
    /// Create a pager positioned at page 0.
    #[must_use]
    pub const fn new(page_size: u32) -> Self {
        Self {
            page_size,
            cursor: 0,
            exhausted: false,
            epoch: 0,
            in_flight: None,
        }
    }

    /// Messages per page.
    #[must_use]
    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Index of the next page `begin_older` will request.
    #[must_use]
    pub const fn cursor(&self) -> u32 {
        self.cursor
    }

    /// `false` once a page flagged `is_last` has been applied.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        !self.exhausted
    }

    /// Current epoch.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Start (or join) the fetch of the next older page.
    pub fn begin_older(&mut self) -> OlderStart {
        if let Some(request) = self.in_flight {
            return OlderStart::InFlight(request);
        }
        if self.exhausted {
            return OlderStart::Exhausted;
        }
        let request = PageRequest {
            index: self.cursor,
            epoch: self.epoch,
            kind: FetchKind::Older,
        };
        self.in_flight = Some(request);
        OlderStart::Issue(request)
    }

    /// A fetch of the newest page that leaves the cursor alone.
    #[must_use]
    pub const fn begin_catch_up(&self) -> PageRequest {
        PageRequest {
            index: 0,
            epoch: self.epoch,
            kind: FetchKind::CatchUp,
        }
    }

    /// Reset to page 0 and start a new epoch.
    ///
    /// Results of requests issued before this call will be rejected by
    /// [`complete`](Self::complete).
    pub fn refresh(&mut self) {
        self.epoch += 1;
        self.cursor = 0;
        self.exhausted = false;
        self.in_flight = None;
    }

    /// Record the outcome of `request`. `page` is `None` when the fetch failed.
    ///
    /// Returns `false` if the result is stale and must be ignored. A failed
    /// fetch never moves the cursor.
    pub fn complete(&mut self, request: PageRequest, page: Option<&HistoryPage>) -> bool {
        if request.epoch != self.epoch {
            tracing::debug!(
                index = request.index,
                epoch = request.epoch,
                current = self.epoch,
                "discarding page from previous epoch"
            );
            return false;
        }
        if request.kind == FetchKind::CatchUp {
            return true;
        }
        if self.in_flight != Some(request) {
            return false;
        }
        self.in_flight = None;
        if let Some(page) = page {
            self.cursor = request.index + 1;
            self.exhausted = page.is_last;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtchat_proto::message::{MessageId, SenderId, Timestamp};

    const CONV: ConversationId = ConversationId::new(2);

    fn log(count: i64) -> Vec<Message> {
        (1..=count)
            .map(|i| Message {
                id: Some(MessageId::new(i)),
                conversation_id: CONV,
                sender_id: SenderId::new(1),
                sender_name: "lee".into(),
                content: format!("m{i}"),
                timestamp: Timestamp::from_millis(1_700_000_000_000 + i * 1000),
            })
            .collect()
    }

    fn page(is_last: bool) -> HistoryPage {
        HistoryPage {
            items: Vec::new(),
            is_last,
        }
    }

    #[test]
    fn older_advances_cursor_on_success() {
        let mut pager = HistoryPager::new(20);
        let OlderStart::Issue(req) = pager.begin_older() else {
            panic!("expected a new request");
        };
        assert_eq!(req.index, 0);
        assert!(pager.complete(req, Some(&page(false))));
        assert_eq!(pager.cursor(), 1);
        assert!(pager.has_more());
    }

    #[test]
    fn failure_leaves_cursor_unchanged() {
        let mut pager = HistoryPager::new(20);
        let OlderStart::Issue(req) = pager.begin_older() else {
            panic!("expected a new request");
        };
        assert!(pager.complete(req, None));
        assert_eq!(pager.cursor(), 0);
        assert_eq!(pager.begin_older(), OlderStart::Issue(req));
    }

    #[test]
    fn concurrent_older_calls_join_the_in_flight_request() {
        let mut pager = HistoryPager::new(20);
        let OlderStart::Issue(req) = pager.begin_older() else {
            panic!("expected a new request");
        };
        assert_eq!(pager.begin_older(), OlderStart::InFlight(req));
    }

    #[test]
    fn last_page_exhausts() {
        let mut pager = HistoryPager::new(20);
        let OlderStart::Issue(req) = pager.begin_older() else {
            panic!("expected a new request");
        };
        pager.complete(req, Some(&page(true)));
        assert!(!pager.has_more());
        assert_eq!(pager.begin_older(), OlderStart::Exhausted);
    }

    #[test]
    fn refresh_rejects_results_from_previous_epoch() {
        let mut pager = HistoryPager::new(20);
        let OlderStart::Issue(old) = pager.begin_older() else {
            panic!("expected a new request");
        };
        pager.refresh();
        assert!(!pager.complete(old, Some(&page(true))));
        assert_eq!(pager.cursor(), 0);
        assert!(pager.has_more());

        let OlderStart::Issue(fresh) = pager.begin_older() else {
            panic!("expected a new request");
        };
        assert_eq!(fresh.epoch, old.epoch + 1);
        assert!(pager.complete(fresh, Some(&page(false))));
    }

    #[test]
    fn catch_up_never_moves_cursor() {
        let mut pager = HistoryPager::new(20);
        let OlderStart::Issue(req) = pager.begin_older() else {
            panic!("expected a new request");
        };
        pager.complete(req, Some(&page(false)));
        let catch_up = pager.begin_catch_up();
        assert_eq!(catch_up.index, 0);
        assert!(pager.complete(catch_up, Some(&page(true))));
        assert_eq!(pager.cursor(), 1);
        assert!(pager.has_more());
    }

    #[tokio::test]
    async fn memory_history_pages_newest_first() {
        let history = MemoryHistory::new(log(25));
        let newest = history.fetch_page(CONV, 0, 10).await.unwrap();
        let ids: Vec<i64> = newest.items.iter().map(|m| m.id.unwrap().get()).collect();
        assert_eq!(ids, (16..=25).collect::<Vec<_>>());
        assert!(!newest.is_last);

        let oldest = history.fetch_page(CONV, 2, 10).await.unwrap();
        assert_eq!(oldest.items.len(), 5);
        assert!(oldest.is_last);

        let beyond = history.fetch_page(CONV, 3, 10).await.unwrap();
        assert!(beyond.items.is_empty());
        assert!(beyond.is_last);
    }

    #[tokio::test]
    async fn memory_history_scripted_failure() {
        let history = MemoryHistory::new(log(3));
        history.fail_next(1);
        assert!(history.fetch_page(CONV, 0, 10).await.is_err());
        assert!(history.fetch_page(CONV, 0, 10).await.is_ok());
        assert_eq!(history.requests().len(), 2);
    }

    #[test]
    fn http_source_rejects_bad_urls() {
        assert!(matches!(
            HttpHistorySource::new("not a url"),
            Err(HistoryError::InvalidUrl { .. })
        ));
        assert!(matches!(
            HttpHistorySource::new("ws://host/api/messages"),
            Err(HistoryError::InvalidUrl { .. })
        ));
        assert!(HttpHistorySource::new("http://127.0.0.1:9095/api/messages/").is_ok());
    }
}
