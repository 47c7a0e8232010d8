use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use pagewise_adapters::keychain::KeyringCredentialResolver;
use pagewise_adapters::mysql::MysqlEngine;
use pagewise_core::config::AppConfig;
use pagewise_core::connection_manager::{ConnectionBackend, ConnectionManager};
use pagewise_core::pagination::{PaginationCoordinator, QueryResult};
use pagewise_core::query_engine::QueryEngine;
use pagewise_core::registry::ConnectionRegistry;
use pagewise_core::startup::{spawn_auto_connect, StartupTrigger};
use pagewise_core::store::{FileStateStore, StateStore};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const CLI_TAB: &str = "cli";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseOutcome {
    Options,
    HelpRequested,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CliOptions {
    config_path: Option<PathBuf>,
    connection_id: Option<String>,
    sql: Option<String>,
    page_size: Option<u32>,
    page: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let mut options = CliOptions::default();
    if parse_args_from(std::env::args().skip(1), &mut options)? == ParseOutcome::HelpRequested {
        print_help();
        return Ok(());
    }

    let config = match &options.config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load_default()?,
    };

    let output = run_app(&config, &options).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run_app(config: &AppConfig, options: &CliOptions) -> Result<Value, Box<dyn Error>> {
    let store = Arc::new(FileStateStore::new(config.state_path()?)) as Arc<dyn StateStore>;
    let registry = Arc::new(
        ConnectionRegistry::new(store)
            .with_clear_last_active_on_remove(config.clear_last_active_on_remove),
    );
    let engine = MysqlEngine::new();
    let manager = Arc::new(ConnectionManager::new(
        engine.clone(),
        Arc::new(KeyringCredentialResolver::new(config.keyring_service.clone())),
        registry,
    ));
    let coordinator =
        PaginationCoordinator::new(engine).with_default_page_size(config.default_page_size)?;

    run_session(manager, &coordinator, config.startup_trigger(), options).await
}

async fn run_session<E>(
    manager: Arc<ConnectionManager<E>>,
    coordinator: &PaginationCoordinator<E>,
    trigger: StartupTrigger,
    options: &CliOptions,
) -> Result<Value, Box<dyn Error>>
where
    E: ConnectionBackend + QueryEngine + 'static,
{
    let registry = Arc::clone(manager.registry());
    let auto_connect = spawn_auto_connect(Arc::clone(&manager), trigger);
    if let Err(error) = registry.hydrate().await {
        warn!(%error, "starting with an empty connection registry");
    }
    info!(connections = registry.list().len(), "startup complete");

    let outcome = match &options.sql {
        Some(sql) => {
            // The query may reuse the session auto-connect is opening.
            match auto_connect.await {
                Ok(auto_connect) => debug!(?auto_connect, "auto-connect settled"),
                Err(error) => warn!(%error, "auto-connect task failed"),
            }
            run_query(&manager, coordinator, options, sql).await
        }
        None => {
            // Listing is a snapshot and never waits on a pending connect.
            auto_connect.abort();
            if let Err(error) = auto_connect.await {
                debug!(%error, "auto-connect stopped before listing");
            }
            Ok(json!({
                "connections": registry.list(),
                "lastActiveConnectionId": registry.last_active_connection_id(),
                "autoConnectEnabled": registry.auto_connect_enabled(),
            }))
        }
    };

    manager.disconnect_all().await;
    outcome
}

async fn run_query<E>(
    manager: &ConnectionManager<E>,
    coordinator: &PaginationCoordinator<E>,
    options: &CliOptions,
    sql: &str,
) -> Result<Value, Box<dyn Error>>
where
    E: ConnectionBackend + QueryEngine,
{
    let connection_id = options
        .connection_id
        .clone()
        .or_else(|| manager.registry().last_active_connection_id())
        .ok_or_else(|| io_other("no connection selected and no last active connection"))?;

    if !manager.is_connected(&connection_id) {
        manager.connect(&connection_id).await?;
    }

    coordinator.open_tab(CLI_TAB, &connection_id);
    coordinator.execute(CLI_TAB, sql).await?;

    let limit = options
        .page_size
        .unwrap_or_else(|| coordinator.default_page_size());
    if limit != coordinator.default_page_size() || options.page > 0 {
        coordinator
            .change_page(CLI_TAB, limit, options.page.saturating_mul(u64::from(limit)))
            .await?;
    }

    let result = coordinator
        .result(CLI_TAB)
        .ok_or_else(|| io_other("query produced no result"))?;
    coordinator.close_tab(CLI_TAB);
    Ok(result_to_json(&connection_id, &result))
}

fn result_to_json(connection_id: &str, result: &QueryResult) -> Value {
    json!({
        "connectionId": connection_id,
        "query": result.query,
        "columns": result.columns,
        "rows": result.rows.iter().map(|row| &row.values).collect::<Vec<_>>(),
        "totalRows": result.total_rows,
        "hasMore": result.has_more,
        "offset": result.offset,
        "pagedRows": result.paged_rows,
        "elapsedMs": u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
    })
}

fn parse_args_from(
    args: impl IntoIterator<Item = String>,
    options: &mut CliOptions,
) -> io::Result<ParseOutcome> {
    let mut args = args.into_iter();

    while let Some(flag) = args.next() {
        match flag.as_str() {
            "-h" | "--help" => return Ok(ParseOutcome::HelpRequested),
            "--config" => options.config_path = Some(next_value(&mut args, "--config")?.into()),
            "--connection" => options.connection_id = Some(next_value(&mut args, "--connection")?),
            "--sql" => options.sql = Some(next_value(&mut args, "--sql")?),
            "--page-size" => {
                options.page_size = Some(
                    next_value(&mut args, "--page-size")?
                        .parse::<u32>()
                        .map_err(|error| io_other(format!("invalid --page-size value: {error}")))?,
                );
            }
            "--page" => {
                options.page = next_value(&mut args, "--page")?
                    .parse::<u64>()
                    .map_err(|error| io_other(format!("invalid --page value: {error}")))?;
            }
            _ => {
                return Err(io_other(format!("unknown argument `{flag}`")));
            }
        }
    }

    Ok(ParseOutcome::Options)
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> io::Result<String> {
    args.next()
        .ok_or_else(|| io_other(format!("missing value for `{flag}`")))
}

fn print_help() {
    println!(
        "pagewise\n\n\
Usage:\n  pagewise [OPTIONS]\n\n\
Without --sql, prints the connection registry without waiting on auto-connect.\n\n\
Options:\n  --config <path>        Config file (default: <config dir>/pagewise/config.toml)\n  --connection <id>      Connection to query (default: last active connection)\n  --sql <query>          Query to run; prints one page as JSON\n  --page-size <n>        Rows per page: 25, 50, 100, 200 or 500\n  --page <index>         Zero-based page to fetch (default: 0)\n  -h, --help             Show this help\n\n\
Environment:\n  RUST_LOG               Log filter (default: info)\n  PAGEWISE_DB_PASSWORD   Password used instead of the keychain entry\n  PAGEWISE_CONFIG_DIR    Overrides the config directory"
    );
}

fn io_other(message: impl Into<String>) -> io::Error {
    io::Error::other(message.into())
}
