use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mc_core::config::Config;
use mc_core::{FileStore, Persistence, SqliteStore};
use mc_engine::CoordinationEngine;
use mc_providers::{AIProvider, HttpKanban, InMemoryKanban, KanbanProvider, StubAi};
use mc_server::Daemon;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const EXIT_OK: u8 = 0;
const EXIT_BAD_CONFIG: u8 = 2;
const EXIT_NO_PERSISTENCE: u8 = 3;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    ExitCode::from(run().await)
}

async fn run() -> u8 {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration invalid: {}", e);
            return EXIT_BAD_CONFIG;
        }
    };

    if config.general.log_format == "json" {
        mc_telemetry::init_logging_json("marcus", &config.general.log_level);
    } else {
        mc_telemetry::init_logging("marcus", &config.general.log_level);
    }

    let persistence: Arc<dyn Persistence> = match open_persistence(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "persistence unavailable at startup");
            return EXIT_NO_PERSISTENCE;
        }
    };

    let board: Arc<dyn KanbanProvider> = match config.board.provider.as_str() {
        "memory" => Arc::new(InMemoryKanban::new()),
        "planka" => {
            let token = std::env::var(&config.board.token_env).unwrap_or_default();
            match HttpKanban::new(&config.board.base_url, &token) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    error!(error = %e, "board provider misconfigured");
                    return EXIT_BAD_CONFIG;
                }
            }
        }
        other => {
            warn!(provider = other, "unknown board provider; using the in-memory board");
            Arc::new(InMemoryKanban::new())
        }
    };
    let ai: Arc<dyn AIProvider> = Arc::new(StubAi);

    let engine = match CoordinationEngine::new(config.clone(), persistence, board, ai).await {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "engine failed to start");
            return EXIT_NO_PERSISTENCE;
        }
    };

    let daemon = Daemon::new(config, engine);
    let shutdown = daemon.shutdown_handle();
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                interrupted.store(true, Ordering::SeqCst);
                shutdown.trigger();
            }
        });
    }

    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon exited with error");
        return EXIT_NO_PERSISTENCE;
    }

    if interrupted.load(Ordering::SeqCst) {
        EXIT_INTERRUPTED
    } else {
        EXIT_OK
    }
}

fn load_config() -> Result<Config, mc_core::config::ConfigError> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        if arg == "--config" {
            path = args.next();
        }
    }
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

async fn open_persistence(config: &Config) -> Result<Arc<dyn Persistence>, mc_core::PersistError> {
    match config.persistence.backend.as_str() {
        "sqlite" => {
            let path = std::path::Path::new(&config.persistence.path);
            tokio::fs::create_dir_all(path).await?;
            let store = SqliteStore::open(path.join("marcus.db")).await?;
            Ok(Arc::new(store))
        }
        _ => {
            let store = FileStore::open(&config.persistence.path).await?;
            Ok(Arc::new(store))
        }
    }
}
