use std::path::PathBuf;
use std::time::Duration;

/// Coarse classification used by the orchestrator to pick a user message
/// and by callers that only care about the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Permission,
    MissingDependency,
    Network,
    ShareAccess,
    Timeout,
    ChildProcess,
    Preset,
    Io,
    Cancelled,
}

/// Where a timeout was hit. Preset appearance is only ever a warning and
/// never surfaces as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSite {
    QueueReady,
    BuildMonitor,
    SentinelWait,
}

impl std::fmt::Display for TimeoutSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TimeoutSite::QueueReady => "queue readiness",
            TimeoutSite::BuildMonitor => "build monitor",
            TimeoutSite::SentinelWait => "build completion sentinel",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("configuration error in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("permission denied writing {path}: {source}")]
    Permission {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} not found; searched: {}", format_searched(.searched))]
    MissingDependency { name: String, searched: Vec<PathBuf> },

    #[error("network error talking to {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("share {unc} is not reachable")]
    ShareAccess { unc: String, hint: String },

    #[error("timed out after {elapsed:?} waiting for {site}")]
    Timeout { site: TimeoutSite, elapsed: Duration },

    #[error("{program} exited with {code:?}")]
    ChildProcess { program: String, code: Option<i32> },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("preset error in {path}: {reason}")]
    Preset { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sentinel error: {0}")]
    Sentinel(#[from] reality_mesh::FormatError),

    #[error("operation cancelled")]
    Cancelled,
}

fn format_searched(searched: &[PathBuf]) -> String {
    searched
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Config { .. } | OrchestratorError::Sentinel(_) => {
                ErrorKind::Configuration
            }
            OrchestratorError::Permission { .. } => ErrorKind::Permission,
            OrchestratorError::MissingDependency { .. } => ErrorKind::MissingDependency,
            OrchestratorError::Network { .. } => ErrorKind::Network,
            OrchestratorError::ShareAccess { .. } => ErrorKind::ShareAccess,
            OrchestratorError::Timeout { .. } => ErrorKind::Timeout,
            OrchestratorError::ChildProcess { .. } | OrchestratorError::Spawn { .. } => {
                ErrorKind::ChildProcess
            }
            OrchestratorError::Preset { .. } => ErrorKind::Preset,
            OrchestratorError::Io { .. } => ErrorKind::Io,
            OrchestratorError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Wraps an I/O failure, promoting `PermissionDenied` to a permission
    /// error so callers can fall back to user-level steps.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            OrchestratorError::Permission { path, source }
        } else {
            OrchestratorError::Io { path, source }
        }
    }

    pub fn network(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        OrchestratorError::Network {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Text shown to the operator for a failed step.
    pub fn user_message(&self) -> String {
        match self {
            OrchestratorError::MissingDependency { name, searched } => format!(
                "{name} is not installed or could not be located. Looked in:\n  {}",
                searched
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join("\n  ")
            ),
            OrchestratorError::ShareAccess { unc, hint } => {
                format!("Cannot reach {unc}.\n{hint}")
            }
            OrchestratorError::Network { url, .. } => format!(
                "The PhotoMesh Project Queue at {url} did not accept the request. \
                 Check that PhotoMesh is running and try again."
            ),
            OrchestratorError::Timeout { site, elapsed } => {
                format!("Gave up waiting for {site} after {}s.", elapsed.as_secs())
            }
            OrchestratorError::ChildProcess { program, code } => format!(
                "{program} failed (exit code {}). Intermediate files were kept for inspection.",
                code.map_or_else(|| "none".to_string(), |c| c.to_string())
            ),
            OrchestratorError::Permission { path, .. } => format!(
                "No permission to write {}. Re-run as administrator to update install defaults.",
                path.display()
            ),
            OrchestratorError::Cancelled => "Build cancelled.".to_string(),
            other => other.to_string(),
        }
    }
}
