use fbop_server::protocol::{SharedClock, SystemClock, sweep};
use fbop_server::server;
use fbop_server::store::{MemoryStore, SharedStore, SqliteStore};
mod cli;
mod install;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    use clap::Parser;
    let args = cli::Cli::parse();
    let mut sweep_limit = None;
    match args.command {
        Some(cli::Command::Install {
            unit_path,
            timer_dir,
            schedule,
            config_path,
            db_path,
            bin_path,
            user,
            group,
            working_dir,
            force,
        }) => {
            let bin = bin_path.unwrap_or_else(|| {
                std::env::current_exe()
                    .unwrap_or_else(|_| std::path::PathBuf::from("/usr/local/bin/fbop-server"))
            });
            let opts = install::InstallOptions {
                unit_path: &unit_path,
                timer_dir: &timer_dir,
                schedule: &schedule,
                config_path: &config_path,
                db_path: &db_path,
                binary_path: &bin,
                user: &user,
                group: &group,
                working_dir: &working_dir,
                force,
            };
            if let Err(e) = install::install_system(&opts) {
                eprintln!("Install error: {}", e);
                std::process::exit(2);
            }
            return;
        }
        Some(cli::Command::Uninstall {
            unit_path,
            timer_dir,
            remove_config,
            config_path,
        }) => {
            if let Err(e) =
                install::uninstall_system(&unit_path, &timer_dir, remove_config, &config_path)
            {
                eprintln!("Uninstall error: {}", e);
                std::process::exit(2);
            }
            return;
        }
        Some(cli::Command::Sweep { limit }) => sweep_limit = Some(limit),
        None => {}
    }

    // Console-only logging with env-driven level
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = match server::AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error=%e, "Failed to load config");
            std::process::exit(2);
        }
    };

    let store: SharedStore = match config.store {
        server::StoreKind::Sqlite => {
            let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "data/fbop.db".into());
            // Ensure data dir exists when using default
            if let Some(parent) = std::path::Path::new(&db_path).parent()
                && !parent.as_os_str().is_empty()
            {
                let _ = std::fs::create_dir_all(parent);
            }
            match SqliteStore::connect(&db_path).await {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    tracing::error!(error=%e, path=%db_path, "Failed to connect DB");
                    std::process::exit(3);
                }
            }
        }
        server::StoreKind::Memory => {
            tracing::warn!("using in-memory store; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };
    let clock: SharedClock = Arc::new(SystemClock);

    if let Some(limit) = sweep_limit {
        let limit = limit.unwrap_or(config.sweep.batch_limit);
        match sweep(store.as_ref(), clock.as_ref(), limit).await {
            Ok(report) => {
                println!(
                    "{}",
                    serde_json::to_string(&report).unwrap_or_else(|_| format!("{report:?}"))
                );
                return;
            }
            Err(e) => {
                tracing::error!(error=%e, "sweep failed");
                std::process::exit(1);
            }
        }
    }

    // Decide listen port: env PORT overrides config.listen_port, default 5151
    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .or(config.listen_port)
        .unwrap_or(5151);

    let sweep_enabled = config.sweep.enabled;
    let state = server::AppState::new(config, store, clock);
    let shutdown_token = state.shutdown_token();
    let shutdown_token_for_server = shutdown_token.clone();

    let sweeper = sweep_enabled.then(|| server::spawn_sweeper(&state));
    let app = server::router(state);

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    tracing::info!(%addr, "Starting server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error=%e, %addr, "Failed to bind listener");
            std::process::exit(4);
        }
    };

    // Graceful shutdown on SIGINT/SIGTERM with fallback timeout to force-close event streams
    let mut server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_token_for_server.cancelled_owned())
            .await
    });

    shutdown_signal().await;
    tracing::info!("shutdown: initiating graceful stop");
    // Ends open event streams and the sweeper loop
    shutdown_token.cancel();
    match tokio::time::timeout(std::time::Duration::from_secs(3), &mut server_task).await {
        Ok(join_res) => match join_res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(%err, "server error"),
            Err(e) => tracing::error!(error=%e, "server task join error"),
        },
        Err(_) => {
            tracing::warn!("shutdown: forcing server abort due to timeout");
            server_task.abort();
        }
    }
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(i), Ok(t)) => (i, t),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error=%e, "failed to install signal handlers; falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("shutdown: received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("shutdown: received SIGTERM");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown: received Ctrl+C");
    }
}
