mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Command, ConfigAction, LogFormat};
use mesh_orchestrator::config::{
    default_config_path, AutoLaunchConfig, ConfigLock, ConfigStore, OfflineConfig,
};
use mesh_orchestrator::elevation::detect_elevation;
use mesh_orchestrator::netcheck::network_health;
use mesh_orchestrator::orchestrator::auto_launch;
use mesh_orchestrator::share::{ensure_share, require_reachable};
use mesh_orchestrator::{
    Cancellation, Metrics, Orchestrator, PhotoMeshPaths, QueueBuildRequest, WizardRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let elevated = detect_elevation().await;
    tracing::info!(config = %config_path.display(), elevated, "Starting mesh_orchestrator");

    let metrics = Arc::new(Metrics::new());
    if let Some(addr) = cli.metrics_listen_addr {
        let router = metrics.router();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!(addr = %addr, "Metrics server started");
            axum::serve(listener, router.into_make_service()).await?;
            Ok::<(), anyhow::Error>(())
        });
    }

    let cancel = Cancellation::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received; cancelling");
            cancel.cancel();
        });
    }

    let orchestrator = Orchestrator::new(config_path.clone(), PhotoMeshPaths::detect(), metrics);

    match cli.command {
        Command::Enforce => {
            let report = orchestrator.enforce().map_err(user_error)?;
            tracing::info!(
                install_config = ?report.install_config,
                preset_changed = report.preset_changed,
                seeded = report.users.seeded.len(),
                failed = report.users.failed.len(),
                "Install defaults enforced"
            );
        }
        Command::Wizard {
            project_name,
            project_path,
            folders,
            wait,
        } => {
            let req = WizardRequest {
                project_name,
                project_path,
                folders,
            };
            let mut launch = orchestrator
                .wizard_autostart_build(&req, &cancel)
                .await
                .map_err(user_error)?;
            if wait {
                tokio::select! {
                    status = launch.child.wait() => {
                        let status = status.context("Failed to wait for the Wizard")?;
                        tracing::info!(status = ?status.code(), "Wizard exited");
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("Stopped waiting; the Wizard keeps running")
                    }
                }
            }
        }
        Command::Queue {
            project_name,
            project_dir,
            folders,
            working_folder,
            offline,
            poll_secs,
            budget_mins,
            sse,
        } => {
            let mut req = QueueBuildRequest::new(project_name, project_dir, folders);
            req.working_folder = working_folder;
            req.offline = offline;
            req.poll_period = Duration::from_secs(poll_secs.max(1));
            req.monitor_budget = Duration::from_secs(budget_mins * 60);
            req.use_sse = sse;
            let outcome = orchestrator
                .queue_build(&req, &cancel, log_progress)
                .await
                .map_err(user_error)?;
            tracing::info!(
                project = %outcome.layout.project_dir.display(),
                distributed = outcome.distributed.len(),
                "Reality Mesh dataset ready"
            );
        }
        Command::PostProcess { build_dir, wait_secs } => {
            let deadline = wait_secs.map(Duration::from_secs);
            let outcome = orchestrator
                .post_process(&build_dir, deadline, &cancel, log_progress)
                .await
                .map_err(user_error)?;
            tracing::info!(
                project = %outcome.layout.project_dir.display(),
                "Reality Mesh dataset ready"
            );
        }
        Command::Share { create } => {
            let offline = OfflineConfig::from_store(&orchestrator.load_config());
            if create {
                let setup = ensure_share(&offline).await.map_err(user_error)?;
                tracing::info!(setup = ?setup, "Share setup");
            }
            let unc = require_reachable(&offline).await.map_err(user_error)?;
            tracing::info!(unc, "Share reachable");
        }
        Command::NetHealth { host } => {
            let report = network_health(&host).await;
            if let Some(text) = report.remediation() {
                eprintln!("{text}");
                anyhow::bail!("PhotoMesh ports on {host} are not answering");
            }
            tracing::info!(host, "PhotoMesh ports are up");
        }
        Command::AutoLaunch => {
            let cfg = AutoLaunchConfig::from_store(&orchestrator.load_config());
            match auto_launch(&cfg).map_err(user_error)? {
                Some(pid) => tracing::info!(pid, "Auto-Launch started"),
                None => tracing::info!("Auto-Launch is disabled"),
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Get { section, key } => {
                let store = ConfigStore::load(&config_path).map_err(user_error)?;
                match store.get_opt(&section, &key) {
                    Some(value) => println!("{value}"),
                    None => anyhow::bail!("[{section}] {key} is not set"),
                }
            }
            ConfigAction::Set { section, key, value } => {
                let _lock = ConfigLock::acquire(&config_path).map_err(user_error)?;
                let mut store = ConfigStore::load(&config_path).map_err(user_error)?;
                store.set(&section, &key, value);
                store.save().map_err(user_error)?;
                tracing::info!(section, key, "Config updated");
            }
        },
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => fmt().with_env_filter(filter).compact().init(),
    }
}

fn log_progress(line: &str, pct: Option<f64>) {
    if let Some(p) = pct {
        tracing::info!(progress = p, line, "Reality Mesh progress");
    }
}

/// Surfaces the operator-facing message as the process error.
fn user_error(e: mesh_orchestrator::OrchestratorError) -> anyhow::Error {
    let message = e.user_message();
    anyhow::Error::new(e).context(message)
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
