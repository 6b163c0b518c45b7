//! Administrator detection and elevated relaunch.
//!
//! Windows uses PowerShell (`WindowsPrincipal` check, `Start-Process -Verb
//! RunAs`). Other targets have no elevation prompt: the effective uid
//! decides `is_elevated` and elevated launches run the program directly.

use crate::error::{OrchestratorError, Result};
use std::path::Path;
use tokio::process::Command;

#[cfg(windows)]
static ELEVATED: once_cell::sync::OnceCell<bool> = once_cell::sync::OnceCell::new();

#[cfg(windows)]
const ADMIN_CHECK: &str = "([Security.Principal.WindowsPrincipal]\
    [Security.Principal.WindowsIdentity]::GetCurrent())\
    .IsInRole([Security.Principal.WindowsBuiltInRole]::Administrator)";

/// Runs the PowerShell role check. Blocks on a child process.
#[cfg(windows)]
fn probe_elevation() -> bool {
    std::process::Command::new("powershell")
        .args(["-NoProfile", "-Command", ADMIN_CHECK])
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Whether this process runs with administrator rights. On Windows the
/// answer is cached by [`detect_elevation`]; call that first from async
/// code.
#[cfg(windows)]
pub fn is_elevated() -> bool {
    *ELEVATED.get_or_init(probe_elevation)
}

#[cfg(unix)]
pub fn is_elevated() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(any(windows, unix)))]
pub fn is_elevated() -> bool {
    false
}

/// Resolves and caches the elevation check on the blocking pool.
#[cfg(windows)]
pub async fn detect_elevation() -> bool {
    if let Some(elevated) = ELEVATED.get() {
        return *elevated;
    }
    let probed = tokio::task::spawn_blocking(probe_elevation)
        .await
        .unwrap_or(false);
    *ELEVATED.get_or_init(|| probed)
}

#[cfg(not(windows))]
pub async fn detect_elevation() -> bool {
    is_elevated()
}

/// Quotes a value for a single-quoted PowerShell string.
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// PowerShell command that starts `exe` through the UAC prompt.
pub fn runas_script(exe: &Path, args: &[String]) -> String {
    let mut script = format!(
        "Start-Process -FilePath {} -Verb RunAs",
        ps_quote(&exe.display().to_string())
    );
    if !args.is_empty() {
        let list = args.iter().map(|a| ps_quote(a)).collect::<Vec<_>>().join(",");
        script.push_str(&format!(" -ArgumentList {list}"));
    }
    script
}

/// Starts `exe` with administrator rights and returns without waiting for
/// it. When already elevated the program is spawned directly.
pub async fn launch_elevated(exe: &Path, args: &[String]) -> Result<()> {
    let program = exe.display().to_string();
    if detect_elevation().await || !cfg!(windows) {
        tracing::info!(program = %program, "Launching host process");
        Command::new(exe)
            .args(args)
            .spawn()
            .map_err(|source| OrchestratorError::Spawn {
                program: program.clone(),
                source,
            })?;
        return Ok(());
    }

    tracing::info!(program = %program, "Requesting elevation for host process");
    let status = Command::new("powershell")
        .args(["-NoProfile", "-Command", &runas_script(exe, args)])
        .status()
        .await
        .map_err(|source| OrchestratorError::Spawn {
            program: "powershell".into(),
            source,
        })?;
    if !status.success() {
        return Err(OrchestratorError::ChildProcess {
            program: format!("elevated launch of {program}"),
            code: status.code(),
        });
    }
    Ok(())
}
