//! Two-phase Wizard launch: prepare a project so the Wizard materializes
//! its project preset, patch that preset, then relaunch with autostart.

use crate::cancel::Cancellation;
use crate::error::{OrchestratorError, Result};
use crate::metrics::Metrics;
use crate::preset::{PresetManager, CANONICAL_PRESET_NAME, PRESET_EXTENSION};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::process::{Child, Command};

/// Upper bound on waiting for the project preset to appear.
pub const PRESET_WAIT: Duration = Duration::from_secs(60);
const PRESET_POLL: Duration = Duration::from_millis(500);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WizardRequest {
    pub project_name: String,
    pub project_path: PathBuf,
    pub folders: Vec<PathBuf>,
}

impl WizardRequest {
    /// Command line for one Wizard launch.
    pub fn args(&self, autostart: bool) -> Vec<String> {
        let mut args = vec![
            "--projectName".to_string(),
            self.project_name.clone(),
            "--projectPath".to_string(),
            self.project_path.display().to_string(),
            "--preset".to_string(),
            CANONICAL_PRESET_NAME.to_string(),
        ];
        for folder in &self.folders {
            args.push("--folder".to_string());
            args.push(folder.display().to_string());
        }
        args.push("--overrideSettings".to_string());
        if autostart {
            args.push("--autostart".to_string());
        }
        args
    }
}

/// A running autostart build.
#[derive(Debug)]
pub struct WizardLaunch {
    pub child: Child,
    /// The project preset that was patched, if one appeared in time.
    pub patched_preset: Option<PathBuf>,
}

enum Phase {
    Preparing { child: Child, baseline: PresetSnapshot },
    Patched { child: Child, preset: Option<PathBuf> },
    Building { child: Child, preset: Option<PathBuf> },
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Preparing { .. } => "preparing",
            Phase::Patched { .. } => "patched",
            Phase::Building { .. } => "building",
        }
    }
}

pub struct WizardDriver {
    wizard: PathBuf,
    presets: Arc<PresetManager>,
    metrics: Arc<Metrics>,
    preset_wait: Duration,
    poll: Duration,
}

impl WizardDriver {
    pub fn new(wizard: PathBuf, presets: Arc<PresetManager>, metrics: Arc<Metrics>) -> Self {
        Self {
            wizard,
            presets,
            metrics,
            preset_wait: PRESET_WAIT,
            poll: PRESET_POLL,
        }
    }

    pub fn with_preset_wait(mut self, wait: Duration, poll: Duration) -> Self {
        self.preset_wait = wait;
        self.poll = poll;
        self
    }

    /// Runs prepare, patch and autostart in order. On cancellation the
    /// preparation process is terminated and written files are kept.
    pub async fn run(&self, req: &WizardRequest, cancel: &Cancellation) -> Result<WizardLaunch> {
        self.presets.enforce_install_defaults()?;

        let baseline = PresetSnapshot::capture(&self.candidate_dirs(req));
        let child = self.spawn(req, false)?;
        let mut phase = Phase::Preparing { child, baseline };
        tracing::info!(
            project_name = %req.project_name,
            phase = phase.name(),
            "Wizard launched for preparation"
        );

        loop {
            phase = match phase {
                Phase::Preparing { mut child, baseline } => {
                    match self.wait_for_preset(req, &baseline, cancel).await {
                        Ok(found) => Phase::Patched {
                            preset: found.and_then(|p| self.patch(&p)),
                            child,
                        },
                        Err(e) => {
                            terminate(&mut child).await;
                            return Err(e);
                        }
                    }
                }
                Phase::Patched { mut child, preset } => {
                    terminate(&mut child).await;
                    if cancel.is_cancelled() {
                        return Err(OrchestratorError::Cancelled);
                    }
                    Phase::Building {
                        child: self.spawn(req, true)?,
                        preset,
                    }
                }
                Phase::Building { child, preset } => {
                    tracing::info!(
                        project_name = %req.project_name,
                        pid = ?child.id(),
                        "Wizard autostart build running"
                    );
                    return Ok(WizardLaunch {
                        child,
                        patched_preset: preset,
                    });
                }
            };
            tracing::debug!(phase = phase.name(), "Wizard driver transition");
        }
    }

    fn spawn(&self, req: &WizardRequest, autostart: bool) -> Result<Child> {
        let mut cmd = Command::new(&self.wizard);
        cmd.args(req.args(autostart));
        // The preparation run must not outlive the driver; the build must.
        cmd.kill_on_drop(!autostart);
        cmd.spawn().map_err(|source| OrchestratorError::Spawn {
            program: self.wizard.display().to_string(),
            source,
        })
    }

    /// Directories the Wizard may write the project preset into.
    fn candidate_dirs(&self, req: &WizardRequest) -> Vec<PathBuf> {
        vec![
            self.presets.paths().current_user().presets_dir(),
            req.project_path.clone(),
        ]
    }

    /// Polls for a `.PMPreset` written since `baseline` was taken.
    /// `Ok(None)` means the wait expired.
    async fn wait_for_preset(
        &self,
        req: &WizardRequest,
        baseline: &PresetSnapshot,
        cancel: &Cancellation,
    ) -> Result<Option<PathBuf>> {
        let dirs = self.candidate_dirs(req);
        let started = Instant::now();
        loop {
            if let Some(found) = newest_preset(&dirs, &req.project_name, baseline) {
                tracing::info!(preset = %found.display(), "Project preset appeared");
                return Ok(Some(found));
            }
            if started.elapsed() >= self.preset_wait {
                tracing::warn!(
                    project_name = %req.project_name,
                    waited = ?self.preset_wait,
                    "No project preset appeared; the Wizard will use install defaults"
                );
                return Ok(None);
            }
            if !cancel.sleep(self.poll).await {
                return Err(OrchestratorError::Cancelled);
            }
        }
    }

    /// Applies the output flags to the project preset. A preset that
    /// cannot be parsed is logged and left alone.
    fn patch(&self, path: &Path) -> Option<PathBuf> {
        match self.presets.patch_project_preset(path) {
            Ok(()) => {
                self.metrics.presets_patched_total.inc();
                tracing::info!(preset = %path.display(), "Patched project preset");
                Some(path.to_path_buf())
            }
            Err(e) => {
                tracing::warn!(
                    preset = %path.display(),
                    error = %e,
                    "Could not patch project preset"
                );
                None
            }
        }
    }
}

/// Presets found in the candidate directories before the Wizard starts.
///
/// File mtimes come from a coarser clock than `SystemTime::now()`, so a
/// preset written just after launch can carry an earlier timestamp. A
/// preset counts as fresh when it is absent from the snapshot or its
/// mtime or length changed.
#[derive(Debug, Default)]
struct PresetSnapshot(HashMap<PathBuf, (SystemTime, u64)>);

impl PresetSnapshot {
    fn capture(dirs: &[PathBuf]) -> Self {
        let mut seen = HashMap::new();
        for (path, modified, len) in presets_in(dirs) {
            seen.insert(path, (modified, len));
        }
        Self(seen)
    }

    fn is_fresh(&self, path: &Path, modified: SystemTime, len: u64) -> bool {
        self.0.get(path) != Some(&(modified, len))
    }
}

/// Project-scoped `.PMPreset` files with their mtime and length. The
/// canonical preset is never a candidate.
fn presets_in(dirs: &[PathBuf]) -> Vec<(PathBuf, SystemTime, u64)> {
    let mut found = Vec::new();
    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_preset = path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case(PRESET_EXTENSION));
            if !is_preset || path.file_stem().is_some_and(|s| s == CANONICAL_PRESET_NAME) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            found.push((path, modified, meta.len()));
        }
    }
    found
}

/// Picks the best preset written since `baseline`, preferring names
/// containing the project name, then the newest.
fn newest_preset(
    dirs: &[PathBuf],
    project_name: &str,
    baseline: &PresetSnapshot,
) -> Option<PathBuf> {
    let wanted = project_name.to_lowercase();
    let mut best: Option<(bool, SystemTime, PathBuf)> = None;
    for (path, modified, len) in presets_in(dirs) {
        // An empty file is still being written.
        if len == 0 || !baseline.is_fresh(&path, modified, len) {
            continue;
        }
        let named = path
            .file_stem()
            .is_some_and(|s| s.to_string_lossy().to_lowercase().contains(&wanted));
        let better = match &best {
            None => true,
            Some((b_named, b_time, _)) => (named, modified) > (*b_named, *b_time),
        };
        if better {
            best = Some((named, modified, path));
        }
    }
    best.map(|(_, _, path)| path)
}

/// Stops a child gracefully where the platform allows, then forcefully.
pub async fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    #[cfg(unix)]
    {
        tracing::debug!(pid, "Sending SIGTERM to Wizard process");
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        tokio::select! {
            _ = tokio::time::sleep(TERMINATE_GRACE) => {
                tracing::warn!(pid, "Wizard did not exit after SIGTERM; killing");
            }
            _ = child.wait() => {
                tracing::debug!(pid, "Wizard preparation process exited");
                return;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = TERMINATE_GRACE;
    if let Err(e) = child.start_kill() {
        tracing::error!(pid, error = %e, "Failed to kill Wizard process");
    }
    let _ = child.wait().await;
}
