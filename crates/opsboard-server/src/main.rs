mod api;
mod ws;

use api::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use opsboard_storage::Store;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    db_path: String,
    debug: bool,
}

#[derive(Parser, Debug)]
#[command(name = "opsboard-server")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %config.addr);
        return;
    }

    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                error!(event = "db_dir_error", error = %err, path = %config.db_path);
                return;
            }
        }
    }
    let store = match Store::open(&config.db_path) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "db_open_error", error = %err, path = %config.db_path);
            return;
        }
    };

    let state = Arc::new(AppState::new(store));
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/tasks", get(api::list_tasks).post(api::create_task))
        .route(
            "/api/tasks/:id",
            get(api::get_task)
                .patch(api::update_task)
                .delete(api::delete_task),
        )
        .route("/api/tasks/:id/move", post(api::move_task))
        .route("/api/costs", get(api::list_costs).post(api::create_cost))
        .route("/api/analytics/summary", get(api::analytics_summary))
        .route("/api/users", get(api::list_users).post(api::create_user))
        .route("/api/users/:id", axum::routing::delete(api::delete_user))
        .route("/ws", get(ws::ws_handler))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "server_error", error = %err);
            return;
        }
    };

    info!(event = "server_start", addr = %config.addr, db = %config.db_path);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "server_shutdown");
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "server_error", error = %err);
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        db_path: resolve_db_path(&args.db),
        debug: args.debug || env_true("OPSBOARD_DEBUG"),
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("OPSBOARD_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("OPSBOARD_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "127.0.0.1:3004".to_string()
}

fn resolve_db_path(db_flag: &str) -> String {
    if !db_flag.trim().is_empty() {
        return db_flag.to_string();
    }
    if let Ok(value) = std::env::var("OPSBOARD_DB") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    ".opsboard/opsboard.db".to_string()
}
