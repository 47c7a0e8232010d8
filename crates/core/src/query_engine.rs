use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRow {
    pub values: Vec<String>,
}

impl QueryRow {
    #[must_use]
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }
}

/// Row window requested from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub connection_id: String,
    pub query: String,
    pub limit: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPage {
    pub columns: Vec<String>,
    pub rows: Vec<QueryRow>,
    pub total_rows: Option<u64>,
    pub has_more: bool,
    pub offset: u64,
    pub paged_rows: u64,
    pub elapsed: Duration,
}

impl QueryPage {
    /// Builds a page whose `paged_rows` and `has_more` are derived from the
    /// rows and the known total.
    #[must_use]
    pub fn from_rows(
        columns: Vec<String>,
        rows: Vec<QueryRow>,
        offset: u64,
        total_rows: Option<u64>,
    ) -> Self {
        let paged_rows = rows.len() as u64;
        let has_more = total_rows.is_some_and(|total| offset.saturating_add(paged_rows) < total);
        Self {
            columns,
            rows,
            total_rows,
            has_more,
            offset,
            paged_rows,
            elapsed: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_has_more(mut self, has_more: bool) -> Self {
        self.has_more = has_more;
        self
    }

    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryEngineError {
    #[error("no open session for connection `{0}`")]
    ConnectionNotFound(String),
    #[error("query execution failed: {0}")]
    Execution(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(&self, request: &PageRequest) -> Result<QueryPage, QueryEngineError>;
}

#[cfg(test)]
mod tests {
    use super::{QueryPage, QueryRow};

    fn rows(count: usize) -> Vec<QueryRow> {
        (0..count)
            .map(|index| QueryRow::new(vec![index.to_string()]))
            .collect()
    }

    #[test]
    fn has_more_follows_known_total() {
        let page = QueryPage::from_rows(vec!["id".to_string()], rows(100), 200, Some(350));
        assert_eq!(page.paged_rows, 100);
        assert!(page.has_more);

        let last = QueryPage::from_rows(vec!["id".to_string()], rows(50), 300, Some(350));
        assert_eq!(last.paged_rows, 50);
        assert!(!last.has_more);
    }

    #[test]
    fn unknown_total_defaults_to_no_more_rows() {
        let page = QueryPage::from_rows(Vec::new(), rows(25), 0, None);
        assert!(!page.has_more);
        assert!(page.with_has_more(true).has_more);
    }

    #[test]
    fn offset_at_the_end_of_the_range_has_no_more_rows() {
        let page = QueryPage::from_rows(Vec::new(), rows(3), u64::MAX - 1, Some(u64::MAX));
        assert_eq!(page.paged_rows, 3);
        assert!(!page.has_more);
    }
}
