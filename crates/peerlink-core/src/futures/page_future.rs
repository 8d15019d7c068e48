//! Streaming correlator for paginated search

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{LinkError, LinkResult, MsgFailure};
use crate::types::{ProfileQueryInfo, SearchQuery};

struct PageState {
    message_id: u32,
    /// `None` marks a failure
    queue: VecDeque<Option<Vec<ProfileQueryInfo>>>,
    failure: Option<MsgFailure>,
}

struct PageInner {
    state: Mutex<PageState>,
    ready: Condvar,
    query: Arc<Mutex<SearchQuery>>,
}

/// Receives the pages of a search as they arrive.
///
/// Each page advances the cursor of the shared [`SearchQuery`] and lands in
/// its cache before being queued for the consumer. A failure queues a
/// sentinel so a blocked consumer wakes up.
#[derive(Clone)]
pub struct PageFuture {
    inner: Arc<PageInner>,
}

impl PageFuture {
    pub fn new(query: Arc<Mutex<SearchQuery>>) -> Self {
        Self {
            inner: Arc::new(PageInner {
                state: Mutex::new(PageState {
                    message_id: 0,
                    queue: VecDeque::new(),
                    failure: None,
                }),
                ready: Condvar::new(),
                query,
            }),
        }
    }

    /// The query this future feeds.
    pub fn query(&self) -> Arc<Mutex<SearchQuery>> {
        Arc::clone(&self.inner.query)
    }

    pub fn message_id(&self) -> u32 {
        self.inner.state.lock().message_id
    }

    /// Push one page received for `message_id`.
    pub fn on_page(
        &self,
        message_id: u32,
        page: Vec<ProfileQueryInfo>,
        record_index: u32,
        record_count: u32,
    ) {
        self.inner
            .query
            .lock()
            .record_page(record_index, record_count, &page);

        let mut state = self.inner.state.lock();
        state.message_id = message_id;
        state.queue.push_back(Some(page));
        self.inner.ready.notify_all();
        debug!(message_id, record_index, record_count, "Search page received");
    }

    /// Record a failure and wake any waiting consumer.
    pub fn fail(&self, message_id: u32, status: i32, detail: impl Into<String>) {
        let mut state = self.inner.state.lock();
        state.message_id = message_id;
        state.failure = Some(MsgFailure::new(message_id, status, detail));
        state.queue.push_back(None);
        self.inner.ready.notify_all();
    }

    pub fn failure(&self) -> Option<MsgFailure> {
        self.inner.state.lock().failure.clone()
    }

    /// Take the next page, blocking up to `timeout` while the queue is empty.
    pub fn next_page(&self, timeout: Duration) -> LinkResult<Vec<ProfileQueryInfo>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        loop {
            if let Some(entry) = state.queue.pop_front() {
                return Self::entry_to_result(entry, &state);
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.ready.wait_until(&mut state, deadline).timed_out()
                        && state.queue.is_empty()
                    {
                        return Err(LinkError::WaitTimeout(timeout.as_millis() as u64));
                    }
                }
                None => self.inner.ready.wait(&mut state),
            }
        }
    }

    /// Take the next page if one is queued.
    pub fn try_next_page(&self) -> Option<LinkResult<Vec<ProfileQueryInfo>>> {
        let mut state = self.inner.state.lock();
        let entry = state.queue.pop_front()?;
        Some(Self::entry_to_result(entry, &state))
    }

    fn entry_to_result(
        entry: Option<Vec<ProfileQueryInfo>>,
        state: &PageState,
    ) -> LinkResult<Vec<ProfileQueryInfo>> {
        match entry {
            Some(page) => Ok(page),
            None => Err(state
                .failure
                .clone()
                .map(LinkError::from)
                .unwrap_or_else(|| LinkError::InvalidState("Search failed".to_string()))),
        }
    }
}

impl std::fmt::Debug for PageFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PageFuture")
            .field("message_id", &state.message_id)
            .field("queued", &state.queue.len())
            .finish()
    }
}
