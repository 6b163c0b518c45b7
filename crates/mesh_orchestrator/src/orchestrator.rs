//! Sequences a build: enforce config, launch the Wizard or submit to the
//! Queue, await completion, post-process, distribute.
//!
//! Config is re-read from disk at the start of every entry point so edits
//! made between builds are honoured.

use crate::cancel::Cancellation;
use crate::config::{
    AutoLaunchConfig, ConfigStore, GeneralConfig, OfflineConfig, QueueSettings, RealityMeshConfig,
};
use crate::elevation::detect_elevation;
use crate::error::{ErrorKind, OrchestratorError, Result, TimeoutSite};
use crate::metrics::Metrics;
use crate::paths::PhotoMeshPaths;
use crate::postprocess::{
    retire_sentinel, wait_for_sentinel, DistributionTargets, PostProcessOutcome, PostProcessor,
    Processor, SystemSettings,
};
use crate::preset::{EnforceReport, PresetManager, PresetOptions};
use crate::queue::{build_payload, QueueClient};
use crate::share::require_reachable;
use crate::wizard::{WizardDriver, WizardLaunch, WizardRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_MONITOR_BUDGET: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone)]
pub struct QueueBuildRequest {
    pub project_name: String,
    pub project_dir: PathBuf,
    pub folders: Vec<PathBuf>,
    /// Build output folder. Defaults to the offline share when `offline`
    /// is set, `<project_dir>/Build` otherwise.
    pub working_folder: Option<PathBuf>,
    pub offline: bool,
    pub poll_period: Duration,
    pub monitor_budget: Duration,
    /// Follow the Queue's event stream before falling back to polling.
    pub use_sse: bool,
}

impl QueueBuildRequest {
    pub fn new(
        project_name: impl Into<String>,
        project_dir: impl Into<PathBuf>,
        folders: Vec<PathBuf>,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            project_dir: project_dir.into(),
            folders,
            working_folder: None,
            offline: false,
            poll_period: DEFAULT_POLL_PERIOD,
            monitor_budget: DEFAULT_MONITOR_BUDGET,
            use_sse: false,
        }
    }
}

pub struct Orchestrator {
    config_path: PathBuf,
    paths: PhotoMeshPaths,
    metrics: Arc<Metrics>,
    processor: Option<Processor>,
}

impl Orchestrator {
    pub fn new(config_path: PathBuf, paths: PhotoMeshPaths, metrics: Arc<Metrics>) -> Self {
        Self {
            config_path,
            paths,
            metrics,
            processor: None,
        }
    }

    /// Replaces the `[RealityMesh]` PowerShell invocation.
    pub fn with_processor(mut self, processor: Processor) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn load_config(&self) -> ConfigStore {
        ConfigStore::load_or_default(&self.config_path)
    }

    fn preset_manager(&self, store: &ConfigStore) -> PresetManager {
        PresetManager::new(
            self.paths.clone(),
            PresetOptions {
                auto_build: store.get_bool("Preset", "auto_build", true),
                ..PresetOptions::default()
            },
        )
    }

    pub fn enforce(&self) -> Result<EnforceReport> {
        let store = self.load_config();
        self.report("enforce", self.preset_manager(&store).enforce_install_defaults())
    }

    /// Enforces install defaults and runs the two-phase Wizard launch.
    pub async fn wizard_autostart_build(
        &self,
        req: &WizardRequest,
        cancel: &Cancellation,
    ) -> Result<WizardLaunch> {
        self.metrics.builds_started_total.inc();
        let result = async {
            detect_elevation().await;
            let store = self.load_config();
            let wizard = self.paths.locate_wizard(&GeneralConfig::from_store(&store))?;
            let presets = Arc::new(self.preset_manager(&store));
            let driver = WizardDriver::new(wizard, presets, self.metrics.clone());
            driver.run(req, cancel).await
        }
        .await;
        self.report("wizard build", result)
    }

    /// Enforces, makes sure the Queue is up, submits, waits for the
    /// sentinel within the monitor budget and post-processes. An already
    /// submitted build is not stopped on cancellation.
    pub async fn queue_build<F>(
        &self,
        req: &QueueBuildRequest,
        cancel: &Cancellation,
        sink: F,
    ) -> Result<PostProcessOutcome>
    where
        F: FnMut(&str, Option<f64>),
    {
        self.metrics.builds_started_total.inc();
        let result = self.queue_build_inner(req, cancel, sink).await;
        self.report("queue build", result)
    }

    async fn queue_build_inner<F>(
        &self,
        req: &QueueBuildRequest,
        cancel: &Cancellation,
        sink: F,
    ) -> Result<PostProcessOutcome>
    where
        F: FnMut(&str, Option<f64>),
    {
        detect_elevation().await;
        let store = self.load_config();
        self.preset_manager(&store).enforce_install_defaults()?;

        let working = self.working_folder(&store, req).await?;
        // Built before the queue is touched so a missing processor script
        // fails fast.
        let post = self.post_processor(&store)?;

        let settings = QueueSettings::from_store(&store);
        let client = QueueClient::new(&settings, self.metrics.clone())?;
        let photomesh = self.paths.locate_photomesh(&GeneralConfig::from_store(&store))?;
        client
            .ensure_queue_running(&photomesh, settings.ready_timeout, cancel)
            .await?;

        // A sentinel left by an earlier build in the same folder must not
        // complete this one.
        if let Some(stale) = retire_sentinel(&working)? {
            tracing::info!(moved_to = %stale.display(), "Moved previous build sentinel aside");
        }
        let payload = build_payload(&req.project_name, &req.project_dir, &working, &req.folders);
        client.submit(&payload).await?;
        tracing::info!(
            project_name = %req.project_name,
            working = %working.display(),
            "Build submitted; monitoring"
        );

        let started = Instant::now();
        let monitor = async {
            if req.use_sse {
                let streamed = client
                    .stream_events(&working, Some(req.monitor_budget), cancel, |event| {
                        tracing::info!(event = %event, "Queue event");
                    })
                    .await;
                match streamed {
                    Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "Queue event stream failed; polling instead")
                    }
                    Ok(()) => {}
                }
            }
            let remaining = req.monitor_budget.saturating_sub(started.elapsed());
            client.poll(req.poll_period, remaining, cancel).await
        };

        let sentinel = tokio::select! {
            sentinel = wait_for_sentinel(&working, post.sentinel_poll(), None, cancel) => sentinel?,
            monitored = monitor => {
                monitored?;
                return Err(OrchestratorError::Timeout {
                    site: TimeoutSite::BuildMonitor,
                    elapsed: started.elapsed(),
                });
            }
        };
        post.process(&working, sentinel, cancel, sink).await
    }

    async fn working_folder(
        &self,
        store: &ConfigStore,
        req: &QueueBuildRequest,
    ) -> Result<PathBuf> {
        if let Some(dir) = &req.working_folder {
            return Ok(dir.clone());
        }
        if req.offline {
            let unc = require_reachable(&OfflineConfig::from_store(store)).await?;
            return Ok(PathBuf::from(unc));
        }
        Ok(req.project_dir.join("Build"))
    }

    /// Builds the post-processor from `[RealityMesh]`. Unreadable system or
    /// distribution files fall back to defaults with a warning.
    pub fn post_processor(&self, store: &ConfigStore) -> Result<PostProcessor> {
        let rm = RealityMeshConfig::from_store(store);
        let processor = match (&self.processor, &rm.processor_script) {
            (Some(p), _) => p.clone(),
            (None, Some(script)) => Processor::powershell(&rm.powershell, script),
            (None, None) => {
                return Err(OrchestratorError::Config {
                    path: self.config_path.clone(),
                    reason: "[RealityMesh] processor_script is not set".into(),
                })
            }
        };

        let dataset_root = rm.system_settings.as_deref().and_then(|p| {
            SystemSettings::load(p)
                .map_err(|e| tracing::warn!(error = %e, "Ignoring system settings"))
                .ok()
                .and_then(|s| s.dataset_root)
        });
        let destinations = rm
            .distribution
            .as_deref()
            .map(|p| {
                DistributionTargets::load(p)
                    .map(|d| d.destinations)
                    .unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "Ignoring distribution list");
                        Vec::new()
                    })
            })
            .unwrap_or_default();

        Ok(PostProcessor::new(processor, self.metrics.clone())
            .with_dataset_root(dataset_root)
            .with_destinations(destinations))
    }

    /// Post-processes an existing build folder without touching the Queue.
    pub async fn post_process<F>(
        &self,
        build_dir: &Path,
        deadline: Option<Duration>,
        cancel: &Cancellation,
        sink: F,
    ) -> Result<PostProcessOutcome>
    where
        F: FnMut(&str, Option<f64>),
    {
        let result = async {
            let store = self.load_config();
            self.post_processor(&store)?.run(build_dir, deadline, cancel, sink).await
        }
        .await;
        self.report("post-process", result)
    }

    /// Maps a step failure to its operator message and a log record.
    fn report<T>(&self, step: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.kind() == ErrorKind::Cancelled {
                tracing::info!(step, "Cancelled");
            } else {
                self.metrics.builds_failed_total.inc();
                tracing::error!(
                    step,
                    kind = ?e.kind(),
                    error = %e,
                    message = %e.user_message(),
                    "Step failed"
                );
            }
        }
        result
    }
}

/// Starts the configured Auto-Launch command. Returns its pid, or `None`
/// when disabled.
pub fn auto_launch(cfg: &AutoLaunchConfig) -> Result<Option<u32>> {
    if !cfg.enabled {
        return Ok(None);
    }
    let command = cfg.command.trim();
    if command.is_empty() {
        return Err(OrchestratorError::Config {
            path: PathBuf::from("[Auto-Launch]"),
            reason: "enabled but command is empty".into(),
        });
    }
    let child = tokio::process::Command::new(command)
        .args(cfg.arguments.split_whitespace())
        .spawn()
        .map_err(|source| OrchestratorError::Spawn {
            program: command.to_string(),
            source,
        })?;
    tracing::info!(command, pid = ?child.id(), "Auto-launched");
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::CANONICAL_PRESET_NAME;
    use std::fs;

    fn orchestrator(root: &Path) -> Orchestrator {
        Orchestrator::new(
            root.join("config.ini"),
            PhotoMeshPaths::rooted(root),
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn enforce_on_fresh_machine() {
        let root = tempfile::tempdir().unwrap();
        let o = orchestrator(root.path());
        let report = o.enforce().unwrap();
        assert!(report.preset_changed);
        let install = PhotoMeshPaths::rooted(root.path()).install_config();
        let cfg: serde_json::Value = serde_json::from_slice(&fs::read(install).unwrap()).unwrap();
        assert_eq!(cfg["DefaultPhotoMeshWizardUI"]["OutputProducts"]["Model3D"], true);
        let user = PhotoMeshPaths::rooted(root.path()).current_user();
        let user_cfg: serde_json::Value =
            serde_json::from_slice(&fs::read(user.wizard_config()).unwrap()).unwrap();
        assert_eq!(user_cfg["SelectedPreset"], CANONICAL_PRESET_NAME);
    }

    #[test]
    fn auto_build_follows_config() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("config.ini"), "[Preset]\nauto_build = no\n").unwrap();
        let o = orchestrator(root.path());
        o.enforce().unwrap();
        let user = PhotoMeshPaths::rooted(root.path()).current_user();
        let user_cfg: serde_json::Value =
            serde_json::from_slice(&fs::read(user.wizard_config()).unwrap()).unwrap();
        assert_eq!(user_cfg["AutoBuild"], false);
    }

    #[tokio::test]
    async fn missing_wizard_is_a_typed_failure() {
        let root = tempfile::tempdir().unwrap();
        fs::write(
            root.path().join("config.ini"),
            format!(
                "[General]\nphotomesh_wizard_path = {}\n",
                root.path().join("nope.exe").display()
            ),
        )
        .unwrap();
        let o = orchestrator(root.path());
        let req = WizardRequest {
            project_name: "demo".into(),
            project_path: root.path().join("demo"),
            folders: Vec::new(),
        };
        match o.wizard_autostart_build(&req, &Cancellation::new()).await {
            Err(e) => assert_eq!(e.kind(), ErrorKind::MissingDependency),
            Ok(_) => panic!("wizard should not be found"),
        }
        assert_eq!(o.metrics().builds_failed_total.get(), 1);
    }

    #[tokio::test]
    async fn queue_build_requires_processor_script() {
        let root = tempfile::tempdir().unwrap();
        let o = orchestrator(root.path());
        let req = QueueBuildRequest::new("demo", root.path().join("demo"), Vec::new());
        let err = o.queue_build(&req, &Cancellation::new(), |_, _| {}).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn queue_build_end_to_end() {
        use axum::{http::StatusCode, routing::{get, post}, Router};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let root = tempfile::tempdir().unwrap();
        let working = root.path().join("work");
        fs::create_dir_all(&working).unwrap();
        let done = working.clone();
        // Starting the build "completes" it: tiles and sentinel appear.
        let app = Router::new()
            .route("/ProjectQueue/", get(|| async { "ok" }))
            .route("/ProjectQueue/project/add", post(|| async { StatusCode::OK }))
            .route(
                "/Build/Start",
                get(move || {
                    let done = done.clone();
                    async move {
                        fs::create_dir_all(done.join("Tiles")).unwrap();
                        fs::write(done.join("Tiles/t.obj"), "v 1 1 1\n").unwrap();
                        fs::write(
                            done.join(reality_mesh::SENTINEL_FILE_NAME),
                            r#"{"project_name":"demo","Origin":[4,5,6],"WKT":"UTM zone 14, Northern"}"#,
                        )
                        .unwrap();
                        StatusCode::OK
                    }
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });

        let script = root.path().join("process.sh");
        fs::write(&script, "echo 'Tile 2 of 2'\n").unwrap();
        let datasets = root.path().join("datasets");
        let system = root.path().join("system.json");
        fs::write(&system, format!(r#"{{"dataset_root":"{}"}}"#, datasets.display())).unwrap();
        fs::write(
            root.path().join("config.ini"),
            format!(
                "[General]\nphotomesh_path = /bin/true\n\n[Queue]\nbase_url = http://{addr}\n\n\
                 [RealityMesh]\nsystem_settings = {}\n",
                system.display()
            ),
        )
        .unwrap();

        let o = orchestrator(root.path()).with_processor(Processor {
            program: "/bin/sh".into(),
            args: vec![script.display().to_string()],
        });
        let folders = vec![root.path().join("img")];
        let mut req = QueueBuildRequest::new("demo", root.path().join("demo"), folders);
        req.working_folder = Some(working.clone());
        req.poll_period = Duration::from_millis(50);
        req.monitor_budget = Duration::from_secs(30);

        let mut pcts = Vec::new();
        let out = o
            .queue_build(&req, &Cancellation::new(), |_, p| pcts.push(p))
            .await
            .unwrap();
        assert_eq!(pcts, vec![Some(100.0)]);
        assert_eq!(out.layout.project_dir.parent().unwrap(), datasets);
        assert!(out.layout.source_dir.join("t.obj").is_file());
        let text = fs::read_to_string(&out.layout.settings_file).unwrap();
        assert!(text.contains("UTM zone:14 hemi:N"));
        assert!(text.contains("offset_z=6"));
        assert_eq!(o.metrics().builds_started_total.get(), 1);
        assert_eq!(o.metrics().builds_failed_total.get(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_sentinel_does_not_complete_a_new_build() {
        use axum::{http::StatusCode, routing::{get, post}, Router};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts the build but never finishes it.
        let app = Router::new()
            .route("/ProjectQueue/", get(|| async { "ok" }))
            .route("/ProjectQueue/project/add", post(|| async { StatusCode::OK }))
            .route("/Build/Start", get(|| async { StatusCode::OK }));
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });

        let root = tempfile::tempdir().unwrap();
        let project = root.path().join("demo");
        let working = project.join("Build");
        fs::create_dir_all(working.join("Tiles")).unwrap();
        fs::write(working.join("Tiles/old.obj"), "v 9 9 9\n").unwrap();
        fs::write(
            working.join(reality_mesh::SENTINEL_FILE_NAME),
            r#"{"project_name":"demo","Origin":[9,9,9],"WKT":"UTM zone 14, Northern"}"#,
        )
        .unwrap();
        fs::write(
            root.path().join("config.ini"),
            format!(
                "[General]\nphotomesh_path = /bin/true\n\n[Queue]\nbase_url = http://{addr}\n"
            ),
        )
        .unwrap();

        let o = orchestrator(root.path()).with_processor(Processor {
            program: "/bin/true".into(),
            args: Vec::new(),
        });
        let mut req = QueueBuildRequest::new("demo", &project, vec![root.path().join("img")]);
        req.poll_period = Duration::from_millis(50);
        req.monitor_budget = Duration::from_millis(300);

        let err = o.queue_build(&req, &Cancellation::new(), |_, _| {}).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { site: TimeoutSite::BuildMonitor, .. }));
        assert!(!working.join(reality_mesh::SENTINEL_FILE_NAME).exists());
        let retired = fs::read_dir(&working)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".consumed-"))
            .count();
        assert_eq!(retired, 1);
    }

    #[test]
    fn auto_launch_disabled_is_a_no_op() {
        let cfg = AutoLaunchConfig {
            enabled: false,
            command: "anything".into(),
            arguments: String::new(),
        };
        assert_eq!(auto_launch(&cfg).unwrap(), None);
    }

    #[tokio::test]
    async fn auto_launch_rejects_empty_command() {
        let cfg = AutoLaunchConfig {
            enabled: true,
            command: "  ".into(),
            arguments: String::new(),
        };
        assert_eq!(auto_launch(&cfg).unwrap_err().kind(), ErrorKind::Configuration);
    }
}
