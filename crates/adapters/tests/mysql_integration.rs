use std::sync::Arc;

use async_trait::async_trait;
use pagewise_adapters::mysql::MysqlEngine;
use pagewise_core::connection_manager::{ConnectOutcome, ConnectionBackend, ConnectionManager};
use pagewise_core::credentials::{CredentialError, CredentialResolver, Secret};
use pagewise_core::pagination::{Execution, PaginationCoordinator};
use pagewise_core::query_engine::{PageRequest, QueryEngine};
use pagewise_core::registry::{Connection, ConnectionRegistry};
use pagewise_core::store::{MemoryStateStore, StateStore};

fn mysql_integration_enabled() -> bool {
    matches!(
        std::env::var("PAGEWISE_RUN_MYSQL_INTEGRATION").ok().as_deref(),
        Some("1")
    )
}

fn integration_connection(database: Option<&str>) -> Connection {
    let mut connection = Connection::new("integration", "adapters-integration");
    connection.host =
        std::env::var("PAGEWISE_TEST_DB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    connection.user = std::env::var("PAGEWISE_TEST_DB_USER").unwrap_or_else(|_| "root".to_string());
    connection.port = std::env::var("PAGEWISE_TEST_DB_PORT")
        .ok()
        .and_then(|raw| raw.parse::<u16>().ok())
        .unwrap_or(3306);
    connection.database = database.map(str::to_string);
    connection
}

struct EnvResolver;

#[async_trait]
impl CredentialResolver for EnvResolver {
    async fn resolve(&self, _connection_id: &str) -> Result<Secret, CredentialError> {
        Ok(Secret::new(
            std::env::var("PAGEWISE_TEST_DB_PASSWORD").unwrap_or_default(),
        ))
    }
}

async fn connected_manager(connection: Connection) -> ConnectionManager<MysqlEngine> {
    let store = Arc::new(MemoryStateStore::new()) as Arc<dyn StateStore>;
    let registry = Arc::new(ConnectionRegistry::new(store));
    registry.mark_hydrated();
    let manager = ConnectionManager::new(MysqlEngine::new(), Arc::new(EnvResolver), registry);
    manager
        .add_connection(connection.clone())
        .await
        .expect("connection should register");
    let outcome = manager
        .connect(&connection.id)
        .await
        .expect("connect should succeed");
    assert!(matches!(outcome, ConnectOutcome::Established { .. }));
    manager
}

async fn execute_sql(engine: &MysqlEngine, connection_id: &str, sql: &str) {
    engine
        .execute(&PageRequest {
            connection_id: connection_id.to_string(),
            query: sql.to_string(),
            limit: 500,
            offset: 0,
        })
        .await
        .expect("statement should run");
}

#[tokio::test(flavor = "current_thread")]
async fn mysql_engine_connects_and_pages_through_results() {
    if !mysql_integration_enabled() {
        return;
    }

    let database = "pagewise_adapters_cov";

    let admin = connected_manager(integration_connection(None)).await;
    execute_sql(
        admin.backend(),
        "integration",
        &format!("CREATE DATABASE IF NOT EXISTS `{database}`"),
    )
    .await;
    admin.disconnect_all().await;

    let manager = connected_manager(integration_connection(Some(database))).await;
    let engine = manager.backend().clone();
    assert!(engine.is_open("integration"));

    execute_sql(&engine, "integration", "DROP TABLE IF EXISTS integration_rows").await;
    execute_sql(
        &engine,
        "integration",
        "CREATE TABLE integration_rows (id BIGINT NOT NULL PRIMARY KEY, label VARCHAR(32) NULL)",
    )
    .await;
    let values = (1..=60)
        .map(|id| format!("({id}, 'row-{id}')"))
        .collect::<Vec<_>>()
        .join(", ");
    execute_sql(
        &engine,
        "integration",
        &format!("INSERT INTO integration_rows (id, label) VALUES {values}"),
    )
    .await;

    let coordinator = PaginationCoordinator::new(engine.clone());
    assert!(coordinator.open_tab("tab-1", "integration"));
    coordinator
        .execute("tab-1", "SELECT id, label FROM integration_rows ORDER BY id")
        .await
        .expect("query should run");
    coordinator
        .change_page_size("tab-1", 25)
        .await
        .expect("page size should apply");

    let first = coordinator.result("tab-1").expect("first page stored");
    assert_eq!(first.columns, vec!["id".to_string(), "label".to_string()]);
    assert_eq!(first.total_rows, Some(60));
    assert_eq!(first.paged_rows, 25);
    assert!(first.has_more);
    assert_eq!(first.rows[0].values[0], "1");

    let last = coordinator
        .last_page("tab-1")
        .await
        .expect("last page should load");
    assert!(matches!(last, Execution::Applied { .. }));
    let last = coordinator.result("tab-1").expect("last page stored");
    assert_eq!(last.offset, 50);
    assert_eq!(last.paged_rows, 10);
    assert!(!last.has_more);
    assert_eq!(last.rows[9].values[1], "row-60");

    execute_sql(&engine, "integration", "DROP TABLE IF EXISTS integration_rows").await;
    manager
        .disconnect("integration")
        .await
        .expect("disconnect should succeed");
    assert!(!engine.is_open("integration"));
}

#[tokio::test(flavor = "current_thread")]
async fn reconnecting_an_open_id_replaces_its_pool() {
    if !mysql_integration_enabled() {
        return;
    }

    let engine = MysqlEngine::new();
    let connection = integration_connection(None);
    let secret = Secret::new(std::env::var("PAGEWISE_TEST_DB_PASSWORD").unwrap_or_default());

    let first = engine
        .connect(&connection, &secret)
        .await
        .expect("first connect should succeed");
    let second = engine
        .connect(&connection, &secret)
        .await
        .expect("second connect should succeed");
    assert!(engine.is_open("integration"));
    execute_sql(&engine, "integration", "SELECT 1").await;

    drop(first);
    engine
        .disconnect(second)
        .await
        .expect("disconnect should succeed");
    assert!(!engine.is_open("integration"));
}
