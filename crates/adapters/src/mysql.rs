use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Pool, Row, SslOpts, Value};
use pagewise_core::connection_manager::{BackendError, ConnectionBackend};
use pagewise_core::credentials::Secret;
use pagewise_core::query_engine::{
    PageRequest, QueryEngine, QueryEngineError, QueryPage, QueryRow,
};
use pagewise_core::query_window::{plan_window, slice_window, WindowPlan};
use pagewise_core::registry::{Connection, TlsMode};
use parking_lot::Mutex;
use tracing::{debug, info};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// One pool per connected connection id. Cloning shares the pools, so the
/// same engine can back both the connection manager and the pagination
/// coordinator.
#[derive(Clone)]
pub struct MysqlEngine {
    pools: Arc<Mutex<HashMap<String, Pool>>>,
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl Default for MysqlEngine {
    fn default() -> Self {
        Self {
            pools: Arc::new(Mutex::new(HashMap::new())),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl fmt::Debug for MysqlEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut connected = self.pools.lock().keys().cloned().collect::<Vec<_>>();
        connected.sort();
        f.debug_struct("MysqlEngine")
            .field("connected", &connected)
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl MysqlEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeouts(mut self, connect_timeout: Duration, query_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.query_timeout = query_timeout;
        self
    }

    #[must_use]
    pub fn is_open(&self, connection_id: &str) -> bool {
        self.pools.lock().contains_key(connection_id)
    }

    fn pool(&self, connection_id: &str) -> Option<Pool> {
        self.pools.lock().get(connection_id).cloned()
    }

    async fn run_window(
        &self,
        pool: Pool,
        request: &PageRequest,
    ) -> Result<QueryPage, QueryEngineError> {
        let mut conn = pool.get_conn().await.map_err(to_query_error)?;

        match plan_window(&request.query, request.limit, request.offset) {
            WindowPlan::Paged {
                page_sql,
                count_sql,
                limit,
            } => {
                let total_rows = match conn.query_first::<u64, _>(count_sql).await {
                    Ok(total) => total,
                    Err(error) => {
                        debug!(%error, "row count unavailable; paging without a total");
                        None
                    }
                };

                let (columns, mut rows) = fetch_rows(&mut conn, page_sql).await?;
                let fetched_past_page = rows.len() as u64 > limit;
                rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

                let page = QueryPage::from_rows(columns, rows, request.offset, total_rows);
                Ok(if total_rows.is_some() {
                    page
                } else {
                    page.with_has_more(fetched_past_page)
                })
            }
            WindowPlan::Unpaged { sql } => {
                let (columns, rows) = fetch_rows(&mut conn, sql).await?;
                let total_rows = rows.len() as u64;
                let rows = slice_window(rows, request.limit, request.offset);
                Ok(QueryPage::from_rows(
                    columns,
                    rows,
                    request.offset,
                    Some(total_rows),
                ))
            }
        }
    }
}

/// Live handle the connection manager keeps per connected id.
#[derive(Debug)]
pub struct MysqlSession {
    connection_id: String,
    pool: Pool,
}

impl MysqlSession {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

#[async_trait]
impl ConnectionBackend for MysqlEngine {
    type Session = MysqlSession;

    async fn connect(
        &self,
        connection: &Connection,
        secret: &Secret,
    ) -> Result<Self::Session, BackendError> {
        let pool = Pool::new(opts_from_connection(connection, secret));

        // A checked-out connection proves the server is reachable with these
        // credentials before the pool is published.
        let conn = tokio::time::timeout(self.connect_timeout, pool.get_conn())
            .await
            .map_err(|_| {
                BackendError::new(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(to_connection_error)?;
        drop(conn);

        let previous = self
            .pools
            .lock()
            .insert(connection.id.clone(), pool.clone());
        if let Some(previous) = previous {
            close_stale_pool(&connection.id, previous).await;
        }

        Ok(MysqlSession {
            connection_id: connection.id.clone(),
            pool,
        })
    }

    async fn ping(&self, session: &mut Self::Session) -> Result<(), BackendError> {
        let mut conn = session.pool.get_conn().await.map_err(to_connection_error)?;
        conn.ping().await.map_err(to_connection_error)
    }

    async fn disconnect(&self, session: Self::Session) -> Result<(), BackendError> {
        let MysqlSession {
            connection_id,
            pool,
        } = session;
        self.pools.lock().remove(&connection_id);
        pool.disconnect().await.map_err(to_connection_error)?;
        info!(%connection_id, "mysql pool closed");
        Ok(())
    }
}

#[async_trait]
impl QueryEngine for MysqlEngine {
    async fn execute(&self, request: &PageRequest) -> Result<QueryPage, QueryEngineError> {
        let pool = self
            .pool(&request.connection_id)
            .ok_or_else(|| QueryEngineError::ConnectionNotFound(request.connection_id.clone()))?;

        let started_at = Instant::now();
        let page = tokio::time::timeout(self.query_timeout, self.run_window(pool, request))
            .await
            .map_err(|_| QueryEngineError::Timeout(self.query_timeout))??;
        Ok(page.with_elapsed(started_at.elapsed()))
    }
}

async fn fetch_rows(
    conn: &mut Conn,
    sql: String,
) -> Result<(Vec<String>, Vec<QueryRow>), QueryEngineError> {
    let rows = conn.query::<Row, _>(sql).await.map_err(to_query_error)?;
    let columns = rows
        .first()
        .map(|row| {
            row.columns_ref()
                .iter()
                .map(|column| column.name_str().into_owned())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let rows = rows.into_iter().map(row_to_query_row).collect();
    Ok((columns, rows))
}

async fn close_stale_pool(connection_id: &str, pool: Pool) {
    debug!(connection_id, "replacing stale pool");
    if let Err(error) = pool.disconnect().await {
        debug!(connection_id, %error, "failed to close stale pool");
    }
}

fn opts_from_connection(connection: &Connection, secret: &Secret) -> OptsBuilder {
    let mut builder = OptsBuilder::default()
        .ip_or_hostname(connection.host.clone())
        .tcp_port(connection.port)
        .user(Some(connection.user.clone()));

    if !secret.is_empty() {
        builder = builder.pass(Some(secret.expose().to_string()));
    }

    if let Some(database) = connection
        .database
        .as_deref()
        .filter(|database| !database.trim().is_empty())
    {
        builder = builder.db_name(Some(database.to_string()));
    }

    if let Some(ssl_opts) = ssl_opts_for(connection.tls_mode) {
        builder = builder.ssl_opts(ssl_opts);
    }

    if matches!(connection.tls_mode, TlsMode::Disabled) {
        builder = builder.prefer_socket(false);
    }

    builder
}

/// `Prefer` leaves the choice to the server, so only `Require` forces TLS.
fn ssl_opts_for(tls_mode: TlsMode) -> Option<SslOpts> {
    match tls_mode {
        TlsMode::Disabled | TlsMode::Prefer => None,
        TlsMode::Require => Some(SslOpts::default()),
    }
}

fn row_to_query_row(row: Row) -> QueryRow {
    let values = row
        .unwrap()
        .into_iter()
        .map(mysql_value_to_string)
        .collect::<Vec<_>>();
    QueryRow::new(values)
}

fn mysql_value_to_string(value: Value) -> String {
    match value {
        Value::NULL => "NULL".to_string(),
        Value::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Value::Int(value) => value.to_string(),
        Value::UInt(value) => value.to_string(),
        Value::Float(value) => value.to_string(),
        Value::Double(value) => value.to_string(),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            if hour == 0 && minute == 0 && second == 0 && micros == 0 {
                format!("{year:04}-{month:02}-{day:02}")
            } else {
                format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}")
            }
        }
        Value::Time(is_negative, days, hours, minutes, seconds, micros) => {
            let sign = if is_negative { "-" } else { "" };
            let hours = days * 24 + u32::from(hours);
            format!("{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}")
        }
    }
}

fn to_connection_error(error: mysql_async::Error) -> BackendError {
    BackendError::new(error.to_string())
}

fn to_query_error(error: mysql_async::Error) -> QueryEngineError {
    QueryEngineError::Execution(error.to_string())
}
