use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

/// `mesh_orchestrator` - PhotoMesh build orchestration.
///
/// Keeps the PhotoMesh Wizard configured for OBJ, center-pivot builds,
/// launches builds through the Wizard or the Project Queue, and turns the
/// results into Reality Mesh datasets.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the launcher configuration file.
    ///
    /// Defaults to `PhotoMeshLauncher/config.ini` under the per-user
    /// configuration directory.
    #[arg(long, env = "MESH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Serve Prometheus metrics on this address while the command runs.
    #[arg(long, env = "MESH_METRICS_LISTEN_ADDR", global = true)]
    pub metrics_listen_addr: Option<SocketAddr>,

    /// Log output format.
    #[arg(long, env = "MESH_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply install defaults, normalize the canonical preset and seed user configs.
    Enforce,

    /// Two-phase Wizard launch: prepare, patch the project preset, autostart.
    Wizard {
        #[arg(long)]
        project_name: String,
        #[arg(long)]
        project_path: PathBuf,
        /// Imagery folder; repeat for several.
        #[arg(long = "folder", required = true)]
        folders: Vec<PathBuf>,
        /// Wait for the autostart Wizard to exit before returning.
        #[arg(long)]
        wait: bool,
    },

    /// Submit a build to the Project Queue, monitor it and post-process.
    Queue {
        #[arg(long)]
        project_name: String,
        #[arg(long)]
        project_dir: PathBuf,
        #[arg(long = "folder", required = true)]
        folders: Vec<PathBuf>,
        /// Build output folder; defaults to `<project_dir>/Build`.
        #[arg(long)]
        working_folder: Option<PathBuf>,
        /// Use the `[Offline]` share as the working folder.
        #[arg(long)]
        offline: bool,
        /// Seconds between queue probes.
        #[arg(long, default_value_t = 10)]
        poll_secs: u64,
        /// Wall-clock budget for the build, in minutes.
        #[arg(long, default_value_t = 360)]
        budget_mins: u64,
        /// Follow the Queue's event stream before polling.
        #[arg(long)]
        sse: bool,
    },

    /// Post-process an existing build folder.
    PostProcess {
        #[arg(long)]
        build_dir: PathBuf,
        /// Give up waiting for the completion sentinel after this many seconds.
        #[arg(long)]
        wait_secs: Option<u64>,
    },

    /// Resolve and probe the offline share, creating it when possible.
    Share {
        /// Create the LAN share from `local_data_root` (elevated Windows only).
        #[arg(long)]
        create: bool,
    },

    /// Probe the PhotoMesh Web API and Node ports.
    NetHealth {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Start the configured Auto-Launch command.
    AutoLaunch,

    /// Read or write a configuration value.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    Get { section: String, key: String },
    Set { section: String, key: String, value: String },
}
