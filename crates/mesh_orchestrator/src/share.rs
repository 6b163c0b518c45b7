//! UNC resolution and reachability for offline (LAN share) workflows.

use crate::config::OfflineConfig;
use crate::elevation::detect_elevation;
use crate::error::{OrchestratorError, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const SHARE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareStatus {
    Reachable,
    Unreachable { hint: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareSetup {
    Created { name: String, root: PathBuf },
    Skipped { reason: String },
}

/// `\\<host-or-ip>\<share>[\<sub>]`. The host component is the configured
/// IP when `use_ip_unc` is set, the host name otherwise.
pub fn unc_path(offline: &OfflineConfig) -> Result<String> {
    let host = if offline.use_ip_unc {
        offline.host_ip.trim()
    } else {
        offline.host_name.trim()
    };
    let missing = if host.is_empty() {
        Some(if offline.use_ip_unc { "host_ip" } else { "host_name" })
    } else if offline.share_name.trim().is_empty() {
        Some("share_name")
    } else {
        None
    };
    if let Some(key) = missing {
        return Err(OrchestratorError::Config {
            path: PathBuf::from("[Offline]"),
            reason: format!("{key} is not set"),
        });
    }

    let mut unc = format!(r"\\{}\{}", host, offline.share_name.trim().trim_matches('\\'));
    let sub = offline.sub_path.replace('/', "\\");
    let sub = sub.trim_matches('\\');
    if !sub.is_empty() {
        unc.push('\\');
        unc.push_str(sub);
    }
    Ok(unc)
}

/// Steps an operator can take when the share cannot be listed.
pub fn remediation_hint(offline: &OfflineConfig) -> String {
    format!(
        "To reach the PhotoMesh share:\n\
         1. Give both machines static IPs in the same range (e.g. 192.168.50.10 and 192.168.50.11, mask 255.255.255.0).\n\
         2. Put both machines in the same workgroup (default WORKGROUP).\n\
         3. On the host, share the data folder as '{share}' with Everyone: Full Control (both Sharing and Security tabs).\n\
         4. If '{name}' does not resolve, add '{ip} {name}' to C:\\Windows\\System32\\drivers\\etc\\hosts, or enable use_ip_unc.",
        share = offline.share_name,
        name = if offline.host_name.is_empty() { "<host>" } else { offline.host_name.as_str() },
        ip = if offline.host_ip.is_empty() { "<ip>" } else { offline.host_ip.as_str() },
    )
}

/// Tries to list `unc` within `timeout`.
pub async fn probe(unc: &str, timeout: Duration, offline: &OfflineConfig) -> ShareStatus {
    let target = PathBuf::from(unc);
    let listing = tokio::task::spawn_blocking(move || {
        std::fs::read_dir(&target).map(|mut it| it.next().is_some())
    });
    match tokio::time::timeout(timeout, listing).await {
        Ok(Ok(Ok(_))) => ShareStatus::Reachable,
        Ok(Ok(Err(e))) => {
            tracing::warn!(unc, error = %e, "Share listing failed");
            ShareStatus::Unreachable {
                hint: remediation_hint(offline),
            }
        }
        Ok(Err(e)) => {
            tracing::warn!(unc, error = %e, "Share probe task failed");
            ShareStatus::Unreachable {
                hint: remediation_hint(offline),
            }
        }
        Err(_) => {
            tracing::warn!(unc, ?timeout, "Share probe timed out");
            ShareStatus::Unreachable {
                hint: remediation_hint(offline),
            }
        }
    }
}

/// Resolves the UNC and fails with the remediation hint when unreachable.
pub async fn require_reachable(offline: &OfflineConfig) -> Result<String> {
    let unc = unc_path(offline)?;
    match probe(&unc, SHARE_PROBE_TIMEOUT, offline).await {
        ShareStatus::Reachable => Ok(unc),
        ShareStatus::Unreachable { hint } => Err(OrchestratorError::ShareAccess { unc, hint }),
    }
}

/// Shares the configured local data root over the LAN. Only acts on an
/// elevated Windows run whose `local_data_root` exists.
pub async fn ensure_share(offline: &OfflineConfig) -> Result<ShareSetup> {
    let Some(root) = offline.local_data_root.clone() else {
        return Ok(ShareSetup::Skipped {
            reason: "local_data_root is not set".into(),
        });
    };
    if !root.is_dir() {
        return Ok(ShareSetup::Skipped {
            reason: format!("{} does not exist", root.display()),
        });
    }
    if !cfg!(windows) {
        return Ok(ShareSetup::Skipped {
            reason: "LAN sharing is only managed on Windows".into(),
        });
    }
    if !detect_elevation().await {
        return Ok(ShareSetup::Skipped {
            reason: "not running as administrator".into(),
        });
    }

    let name = offline.share_name.trim().to_string();
    let share_arg = format!("{}={}", name, root.display());
    tracing::info!(share = %name, root = %root.display(), "Creating LAN share");
    let output = tokio::process::Command::new("net")
        .args(["share", &share_arg, "/GRANT:Everyone,FULL"])
        .output()
        .await
        .map_err(|source| OrchestratorError::Spawn {
            program: "net share".into(),
            source,
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Error 2118: the share name already exists.
        if stderr.contains("2118") {
            return Ok(ShareSetup::Skipped {
                reason: format!("share '{name}' already exists"),
            });
        }
        return Err(OrchestratorError::ChildProcess {
            program: "net share".into(),
            code: output.status.code(),
        });
    }
    Ok(ShareSetup::Created { name, root })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> OfflineConfig {
        OfflineConfig {
            host_name: "PMHOST".into(),
            host_ip: "192.168.50.10".into(),
            share_name: "SharedMeshDrive".into(),
            local_data_root: None,
            sub_path: "/WorkingFuser/".into(),
            use_ip_unc: false,
        }
    }

    #[test]
    fn unc_uses_host_name_or_ip() {
        let mut o = offline();
        assert_eq!(unc_path(&o).unwrap(), r"\\PMHOST\SharedMeshDrive\WorkingFuser");
        o.use_ip_unc = true;
        assert_eq!(unc_path(&o).unwrap(), r"\\192.168.50.10\SharedMeshDrive\WorkingFuser");
        o.sub_path.clear();
        assert_eq!(unc_path(&o).unwrap(), r"\\192.168.50.10\SharedMeshDrive");
    }

    #[test]
    fn unc_requires_host() {
        let mut o = offline();
        o.use_ip_unc = true;
        o.host_ip.clear();
        let err = unc_path(&o).unwrap_err();
        assert!(err.to_string().contains("host_ip"));
    }

    #[tokio::test]
    async fn probe_reports_hint_when_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let ok = probe(&dir.path().display().to_string(), SHARE_PROBE_TIMEOUT, &offline()).await;
        assert_eq!(ok, ShareStatus::Reachable);

        let missing = dir.path().join("nope").display().to_string();
        match probe(&missing, SHARE_PROBE_TIMEOUT, &offline()).await {
            ShareStatus::Unreachable { hint } => {
                assert!(hint.contains("static IPs"));
                assert!(hint.contains("Everyone"));
                assert!(hint.contains("hosts"));
            }
            ShareStatus::Reachable => panic!("missing directory reported reachable"),
        }
    }

    #[tokio::test]
    async fn ensure_share_skips_without_root() {
        let setup = ensure_share(&offline()).await.unwrap();
        assert!(matches!(setup, ShareSetup::Skipped { .. }));
    }
}
