// VaultStream — service entry point.
//
// Startup order: logging, data paths, store open (with its own exit codes
// so operators can tell config trouble from storage trouble), worker spawn,
// then the axum server until ctrl-c.
//
// Exit codes: 0 normal, 1 fatal config error, 2 storage unreachable,
// 3 DB migration required.

use std::sync::Arc;

use log::{error, info};

use vaultstream::api;
use vaultstream::atoms::constants::{EXIT_DB_MIGRATION, EXIT_FATAL_CONFIG, EXIT_STORAGE_UNREACHABLE};
use vaultstream::atoms::error::EngineError;
use vaultstream::engine::paths;
use vaultstream::engine::state::EngineState;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let db_path = paths::engine_db_path();
    info!("[main] VaultStream starting (db: {:?})", db_path);

    let state = match EngineState::open(&db_path) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("[main] Startup failed: {}", e);
            std::process::exit(exit_code_for(&e));
        }
    };

    let worker_handles = match state.spawn_workers() {
        Ok(handles) => handles,
        Err(e) => {
            error!("[main] Worker spawn failed: {}", e);
            std::process::exit(exit_code_for(&e));
        }
    };

    let bind_address = std::env::var("VAULTSTREAM_BIND").unwrap_or_else(|_| "127.0.0.1:8080".into());
    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("[main] Bind {} failed: {}", bind_address, e);
            std::process::exit(EXIT_FATAL_CONFIG);
        }
    };
    info!("[main] Listening on http://{}", bind_address);

    let app = api::router(Arc::clone(&state));
    let shutdown_state = Arc::clone(&state);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("[main] Ctrl-C received");
        shutdown_state.shutdown();
    });

    if let Err(e) = server.await {
        error!("[main] Server error: {}", e);
    }

    // Workers observe the stop flag; give them one poll to release leases
    // or finish the in-flight item.
    state.shutdown();
    for handle in worker_handles {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
    }
    info!("[main] Bye");
}

fn exit_code_for(e: &EngineError) -> i32 {
    match e {
        EngineError::Database(_) => EXIT_DB_MIGRATION,
        EngineError::Storage(_) | EngineError::Io(_) => EXIT_STORAGE_UNREACHABLE,
        _ => EXIT_FATAL_CONFIG,
    }
}
