use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::query_engine::{PageRequest, QueryEngine, QueryEngineError, QueryPage, QueryRow};

pub const PAGE_SIZES: [u32; 5] = [25, 50, 100, 200, 500];
pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[must_use]
pub fn is_valid_page_size(limit: u32) -> bool {
    PAGE_SIZES.contains(&limit)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationState {
    pub limit: u32,
    pub offset: u64,
}

impl PaginationState {
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self { limit, offset: 0 }
    }

    #[must_use]
    pub fn page_index(self) -> u64 {
        self.offset / u64::from(self.limit)
    }

    /// Keeps the first visible row on screen: `floor(offset / new) * new`.
    #[must_use]
    pub fn with_page_size(self, limit: u32) -> Self {
        let step = u64::from(limit);
        Self {
            limit,
            offset: (self.offset / step) * step,
        }
    }

    #[must_use]
    pub fn first(self) -> Self {
        Self {
            offset: 0,
            ..self
        }
    }

    #[must_use]
    pub fn previous(self) -> Self {
        Self {
            offset: self.offset.saturating_sub(u64::from(self.limit)),
            ..self
        }
    }

    #[must_use]
    pub fn next(self, has_more: bool) -> Option<Self> {
        has_more.then(|| Self {
            offset: self.offset.saturating_add(u64::from(self.limit)),
            ..self
        })
    }

    #[must_use]
    pub fn last(self, total_rows: Option<u64>) -> Option<Self> {
        let total_rows = total_rows.filter(|total| *total > 0)?;
        let step = u64::from(self.limit);
        Some(Self {
            offset: step * ((total_rows - 1) / step),
            ..self
        })
    }
}

/// Last result applied to a tab. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub query: String,
    pub columns: Vec<String>,
    pub rows: Vec<QueryRow>,
    pub total_rows: Option<u64>,
    pub has_more: bool,
    pub offset: u64,
    pub paged_rows: u64,
    pub request_id: u64,
    pub elapsed: Duration,
}

impl QueryResult {
    fn from_page(query: String, page: QueryPage, request_id: u64) -> Self {
        let paged_rows = page.rows.len() as u64;
        let has_more = match page.total_rows {
            Some(total) => page.offset.saturating_add(paged_rows) < total,
            None => page.has_more,
        };
        Self {
            query,
            columns: page.columns,
            rows: page.rows,
            total_rows: page.total_rows,
            has_more,
            offset: page.offset,
            paged_rows,
            request_id,
            elapsed: page.elapsed,
        }
    }
}

/// Outcome of a request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    Applied { request_id: u64 },
    /// A newer request on the same tab won; this response was dropped.
    Superseded { request_id: u64 },
    /// Navigation resolved to the current window; nothing was issued.
    Unchanged,
}

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error("tab `{0}` is not open")]
    UnknownTab(String),
    #[error("page size {0} is not one of 25, 50, 100, 200, 500")]
    InvalidPageSize(u32),
    #[error("tab `{0}` has no result to paginate")]
    NoResult(String),
    #[error(transparent)]
    Query(#[from] QueryEngineError),
}

/// Read-only view of a tab for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabSnapshot {
    pub connection_id: String,
    pub query_text: String,
    pub pagination: Option<PaginationState>,
    pub result: Option<QueryResult>,
    pub notice: Option<String>,
    pub is_loading: bool,
}

#[derive(Debug)]
struct TabState {
    generation: u64,
    connection_id: String,
    query_text: String,
    pagination: Option<PaginationState>,
    /// Window that produced `result`; failures roll back to it.
    confirmed: Option<PaginationState>,
    result: Option<QueryResult>,
    notice: Option<String>,
    request_counter: u64,
    settled_request: u64,
}

impl TabState {
    fn new(generation: u64, connection_id: String) -> Self {
        Self {
            generation,
            connection_id,
            query_text: String::new(),
            pagination: None,
            confirmed: None,
            result: None,
            notice: None,
            request_counter: 0,
            settled_request: 0,
        }
    }

    fn current_window(&self, default_limit: u32) -> PaginationState {
        self.pagination
            .unwrap_or_else(|| PaginationState::new(default_limit))
    }

    fn snapshot(&self) -> TabSnapshot {
        TabSnapshot {
            connection_id: self.connection_id.clone(),
            query_text: self.query_text.clone(),
            pagination: self.pagination,
            result: self.result.clone(),
            notice: self.notice.clone(),
            is_loading: self.settled_request < self.request_counter,
        }
    }
}

#[derive(Debug)]
struct IssuedRequest {
    generation: u64,
    request_id: u64,
    window: PaginationState,
    request: PageRequest,
}

/// Per-tab pagination state machine. Tab state lives behind one short lock
/// that is never held across an engine call; responses are matched back to
/// the tab by request id.
pub struct PaginationCoordinator<E: QueryEngine> {
    engine: E,
    default_limit: u32,
    tabs: Mutex<HashMap<String, TabState>>,
    generations: AtomicU64,
}

impl<E: QueryEngine> std::fmt::Debug for PaginationCoordinator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaginationCoordinator")
            .field("default_limit", &self.default_limit)
            .field("tabs", &self.tabs.lock().len())
            .finish_non_exhaustive()
    }
}

impl<E: QueryEngine> PaginationCoordinator<E> {
    #[must_use]
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            default_limit: DEFAULT_PAGE_SIZE,
            tabs: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    pub fn with_default_page_size(mut self, limit: u32) -> Result<Self, PaginationError> {
        if !is_valid_page_size(limit) {
            return Err(PaginationError::InvalidPageSize(limit));
        }
        self.default_limit = limit;
        Ok(self)
    }

    #[must_use]
    pub fn default_page_size(&self) -> u32 {
        self.default_limit
    }

    #[must_use]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Returns `false` when the tab was already open.
    pub fn open_tab(&self, tab_id: &str, connection_id: &str) -> bool {
        let mut tabs = self.tabs.lock();
        if tabs.contains_key(tab_id) {
            return false;
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        tabs.insert(
            tab_id.to_string(),
            TabState::new(generation, connection_id.to_string()),
        );
        true
    }

    /// Drops all state for the tab; responses still in flight are discarded.
    pub fn close_tab(&self, tab_id: &str) -> bool {
        self.tabs.lock().remove(tab_id).is_some()
    }

    /// Points the tab at another connection. The old result and window no
    /// longer apply, so the next execution starts from the first page.
    pub fn set_tab_connection(
        &self,
        tab_id: &str,
        connection_id: &str,
    ) -> Result<(), PaginationError> {
        let mut tabs = self.tabs.lock();
        let tab = tabs
            .get_mut(tab_id)
            .ok_or_else(|| PaginationError::UnknownTab(tab_id.to_string()))?;
        if tab.connection_id != connection_id {
            tab.connection_id = connection_id.to_string();
            tab.pagination = None;
            tab.confirmed = None;
            tab.result = None;
            tab.notice = None;
            // Anything still in flight belongs to the old connection.
            tab.request_counter += 1;
            tab.settled_request = tab.request_counter;
        }
        Ok(())
    }

    pub fn set_query_text(&self, tab_id: &str, query: &str) -> Result<(), PaginationError> {
        let mut tabs = self.tabs.lock();
        let tab = tabs
            .get_mut(tab_id)
            .ok_or_else(|| PaginationError::UnknownTab(tab_id.to_string()))?;
        tab.query_text = query.to_string();
        Ok(())
    }

    #[must_use]
    pub fn snapshot(&self, tab_id: &str) -> Option<TabSnapshot> {
        self.tabs.lock().get(tab_id).map(TabState::snapshot)
    }

    #[must_use]
    pub fn pagination(&self, tab_id: &str) -> Option<PaginationState> {
        self.tabs.lock().get(tab_id).and_then(|tab| tab.pagination)
    }

    #[must_use]
    pub fn result(&self, tab_id: &str) -> Option<QueryResult> {
        self.tabs
            .lock()
            .get(tab_id)
            .and_then(|tab| tab.result.clone())
    }

    #[must_use]
    pub fn notice(&self, tab_id: &str) -> Option<String> {
        self.tabs
            .lock()
            .get(tab_id)
            .and_then(|tab| tab.notice.clone())
    }

    pub fn dismiss_notice(&self, tab_id: &str) -> bool {
        self.tabs
            .lock()
            .get_mut(tab_id)
            .and_then(|tab| tab.notice.take())
            .is_some()
    }

    /// Runs `query` on the tab. A new query text starts from the first page
    /// at the default size; re-running the current one keeps the window.
    pub async fn execute(&self, tab_id: &str, query: &str) -> Result<Execution, PaginationError> {
        let issued = {
            let mut tabs = self.tabs.lock();
            let tab = tabs
                .get_mut(tab_id)
                .ok_or_else(|| PaginationError::UnknownTab(tab_id.to_string()))?;
            let query_changed = tab
                .result
                .as_ref()
                .map_or(true, |result| result.query != query);
            let window = match (query_changed, tab.pagination) {
                (false, Some(window)) => window,
                _ => PaginationState::new(self.default_limit),
            };
            tab.query_text = query.to_string();
            Self::issue(tab, window, query.to_string())
        };
        self.complete(tab_id, issued).await
    }

    /// Moves the tab to an explicit window and re-runs its current query.
    /// On failure the window rolls back and the displayed result is kept.
    pub async fn change_page(
        &self,
        tab_id: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Execution, PaginationError> {
        if !is_valid_page_size(limit) {
            return Err(PaginationError::InvalidPageSize(limit));
        }
        let issued = {
            let mut tabs = self.tabs.lock();
            let tab = tabs
                .get_mut(tab_id)
                .ok_or_else(|| PaginationError::UnknownTab(tab_id.to_string()))?;
            let query = tab
                .result
                .as_ref()
                .map(|result| result.query.clone())
                .ok_or_else(|| PaginationError::NoResult(tab_id.to_string()))?;
            Self::issue(tab, PaginationState { limit, offset }, query)
        };
        self.complete(tab_id, issued).await
    }

    pub async fn change_page_size(
        &self,
        tab_id: &str,
        limit: u32,
    ) -> Result<Execution, PaginationError> {
        if !is_valid_page_size(limit) {
            return Err(PaginationError::InvalidPageSize(limit));
        }
        self.navigate(tab_id, |window, _| Some(window.with_page_size(limit)))
            .await
    }

    pub async fn first_page(&self, tab_id: &str) -> Result<Execution, PaginationError> {
        self.navigate(tab_id, |window, _| Some(window.first())).await
    }

    pub async fn previous_page(&self, tab_id: &str) -> Result<Execution, PaginationError> {
        self.navigate(tab_id, |window, _| Some(window.previous()))
            .await
    }

    /// No-op unless the current result reported more rows.
    pub async fn next_page(&self, tab_id: &str) -> Result<Execution, PaginationError> {
        self.navigate(tab_id, |window, result| window.next(result.has_more))
            .await
    }

    /// No-op when the total row count is unknown or zero.
    pub async fn last_page(&self, tab_id: &str) -> Result<Execution, PaginationError> {
        self.navigate(tab_id, |window, result| window.last(result.total_rows))
            .await
    }

    async fn navigate(
        &self,
        tab_id: &str,
        target: impl FnOnce(PaginationState, &QueryResult) -> Option<PaginationState>,
    ) -> Result<Execution, PaginationError> {
        let (current, next) = {
            let tabs = self.tabs.lock();
            let tab = tabs
                .get(tab_id)
                .ok_or_else(|| PaginationError::UnknownTab(tab_id.to_string()))?;
            let result = tab
                .result
                .as_ref()
                .ok_or_else(|| PaginationError::NoResult(tab_id.to_string()))?;
            let current = tab.current_window(self.default_limit);
            (current, target(current, result))
        };

        match next {
            Some(window) if window != current => {
                self.change_page(tab_id, window.limit, window.offset).await
            }
            _ => Ok(Execution::Unchanged),
        }
    }

    fn issue(tab: &mut TabState, window: PaginationState, query: String) -> IssuedRequest {
        tab.pagination = Some(window);
        tab.request_counter += 1;
        IssuedRequest {
            generation: tab.generation,
            request_id: tab.request_counter,
            window,
            request: PageRequest {
                connection_id: tab.connection_id.clone(),
                query,
                limit: window.limit,
                offset: window.offset,
            },
        }
    }

    async fn complete(
        &self,
        tab_id: &str,
        issued: IssuedRequest,
    ) -> Result<Execution, PaginationError> {
        let response = self.engine.execute(&issued.request).await;

        let mut tabs = self.tabs.lock();
        let request_id = issued.request_id;
        let tab = match tabs.get_mut(tab_id) {
            Some(tab)
                if tab.generation == issued.generation && tab.request_counter == request_id =>
            {
                tab
            }
            current => {
                debug!(
                    tab_id,
                    request_id,
                    latest = ?current.map(|tab| tab.request_counter),
                    "discarding stale response"
                );
                return Ok(Execution::Superseded { request_id });
            }
        };
        tab.settled_request = request_id;

        match response {
            Ok(page) => {
                tab.result = Some(QueryResult::from_page(
                    issued.request.query,
                    page,
                    request_id,
                ));
                tab.confirmed = Some(issued.window);
                tab.notice = None;
                Ok(Execution::Applied { request_id })
            }
            Err(error) => {
                warn!(tab_id, request_id, %error, "query execution failed");
                tab.pagination = tab.confirmed;
                tab.notice = Some(error.to_string());
                Err(PaginationError::Query(error))
            }
        }
    }
}
