use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use upscaler_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use upscaler_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use upscaler_core::model_registry::{ensure_model, model_path};
use upscaler_core::restore::onnx::{OnnxRestorer, OnnxRestorerConfig};
use upscaler_core::server::{app_router, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "upscaler",
    about = "Nextcloud ExApp that restores and upscales images from the Files menu"
)]
struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    upscaler_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    upscaler_core::runtime::log_runtime_lib_status();

    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    run_server(cli.port, cli.host, resolved_data_dir).await
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filter = logging::select_log_filter(&options);

    match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(appender))
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

/// File config, then environment from the deploy daemon, then validation.
fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }

    let mut config = AppConfig::load_from_path(&config_path(data_dir))?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir)?;

    let port = port_override.unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let model = model_path(&data_dir, &config.restore);
    if let Err(err) = ensure_model(&model, config.restore.model_url.as_deref()).await {
        warn!(
            error = %format!("{err:#}"),
            "Restoration model unavailable; jobs will fail until it is provided"
        );
    }

    let restorer = Arc::new(OnnxRestorer::new(OnnxRestorerConfig::from_restore_config(
        &config.restore,
        model,
    )));
    let state = AppState::new(&config, restorer)?;
    let app = app_router(state.clone());

    let addr = format!("{host}:{port}");
    info!(
        %addr,
        app_id = %config.exapp.app_id,
        app_version = %config.exapp.app_version,
        nextcloud_url = %state.host().base_url(),
        max_concurrent_jobs = state.pool().limit(),
        "Starting upscaler ExApp"
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(pending = state.pool().pending(), "Waiting for running jobs");
    state.pool().drain().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::select_log_filter(&options)
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn parses_server_flags() {
        let cli = Cli::try_parse_from([
            "upscaler",
            "-vv",
            "--port",
            "23000",
            "--host",
            "0.0.0.0",
            "--data-dir",
            "/var/lib/upscaler",
            "--log-filter",
            "upscaler_core=debug",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.port, Some(23000));
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/var/lib/upscaler")));
        assert_eq!(cli.log_filter.as_deref(), Some("upscaler_core=debug"));
    }

    #[test]
    fn defaults_leave_overrides_unset() {
        let cli = Cli::try_parse_from(["upscaler"]).unwrap();
        assert_eq!(cli.verbose, 0);
        assert!(cli.port.is_none());
        assert!(cli.host.is_none());
        assert!(cli.data_dir.is_none());
    }

    #[test]
    fn rejects_invalid_port() {
        assert!(Cli::try_parse_from(["upscaler", "--port", "99999"]).is_err());
    }
}


#[cfg(test)]
mod config_loading_tests {
    use super::*;

    #[test]
    fn load_config_creates_default_file_and_requires_secret() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("data");

        let result = load_config(&dir);
        assert!(config_path(&dir).exists());
        if std::env::var_os("APP_SECRET").is_none() {
            let err = result.unwrap_err();
            assert!(format!("{err:#}").contains("app_secret"));
        }
    }
}
