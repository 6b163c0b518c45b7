//! Reality Mesh post-processing of a finished PhotoMesh build.
//!
//! Waits for the build-completion sentinel, lays out a timestamped project
//! folder, writes the Reality Mesh settings file, then runs the external
//! processor while streaming its progress.

use crate::cancel::Cancellation;
use crate::error::{OrchestratorError, Result, TimeoutSite};
use crate::fsutil::{atomic_write, copy_dir_all};
use crate::metrics::Metrics;
use reality_mesh::{
    parse_progress, read_sentinel, CenterPivotOrigin, RealityMeshSettings, SENTINEL_FILE_NAME,
};
use serde::Deserialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

pub const SENTINEL_POLL: Duration = Duration::from_secs(5);
/// Tile output folders, in order of preference.
pub const OUTPUT_DIRS: &[&str] = &["Tiles", "OBJ"];
const SENTINEL_PARSE_ATTEMPTS: u32 = 3;

#[cfg(windows)]
const FUSER_KILL: (&str, &[&str]) = ("taskkill", &["/F", "/IM", "Fuser.exe"]);
#[cfg(not(windows))]
const FUSER_KILL: (&str, &[&str]) = ("pkill", &["-f", "Fuser"]);

/// The system-settings JSON; only `dataset_root` is read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemSettings {
    #[serde(default)]
    pub dataset_root: Option<PathBuf>,
}

/// The distribution JSON listing install paths to copy projects into.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DistributionTargets {
    #[serde(default)]
    pub destinations: Vec<PathBuf>,
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).map_err(|e| OrchestratorError::io(path, e))?;
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
    serde_json::from_slice(body).map_err(|e| OrchestratorError::Config {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

impl SystemSettings {
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

impl DistributionTargets {
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

/// How to invoke the external processor. The settings file path is
/// appended as the last argument.
#[derive(Debug, Clone)]
pub struct Processor {
    pub program: String,
    pub args: Vec<String>,
}

impl Processor {
    pub fn powershell(interpreter: &str, script: &Path) -> Self {
        Self {
            program: interpreter.to_string(),
            args: vec![
                "-NoProfile".into(),
                "-ExecutionPolicy".into(),
                "Bypass".into(),
                "-File".into(),
                script.display().to_string(),
            ],
        }
    }
}

/// Folders and files created for one post-processed build.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    pub project_dir: PathBuf,
    pub data_dir: PathBuf,
    pub source_dir: PathBuf,
    pub settings_file: PathBuf,
}

#[derive(Debug)]
pub struct PostProcessOutcome {
    pub sentinel: CenterPivotOrigin,
    pub layout: ProjectLayout,
    pub distributed: Vec<PathBuf>,
}

pub struct PostProcessor {
    processor: Processor,
    metrics: Arc<Metrics>,
    dataset_root: Option<PathBuf>,
    destinations: Vec<PathBuf>,
    sentinel_poll: Duration,
    kill_fusers: bool,
}

impl PostProcessor {
    pub fn new(processor: Processor, metrics: Arc<Metrics>) -> Self {
        Self {
            processor,
            metrics,
            dataset_root: None,
            destinations: Vec::new(),
            sentinel_poll: SENTINEL_POLL,
            kill_fusers: true,
        }
    }

    pub fn with_dataset_root(mut self, root: Option<PathBuf>) -> Self {
        self.dataset_root = root;
        self
    }

    pub fn with_destinations(mut self, destinations: Vec<PathBuf>) -> Self {
        self.destinations = destinations;
        self
    }

    pub fn with_sentinel_poll(mut self, poll: Duration) -> Self {
        self.sentinel_poll = poll;
        self
    }

    pub fn with_fuser_cleanup(mut self, enabled: bool) -> Self {
        self.kill_fusers = enabled;
        self
    }

    /// Runs the whole pipeline for build directory `build_dir`. `sink`
    /// receives every processor stdout line with its parsed percentage.
    pub async fn run<F>(
        &self,
        build_dir: &Path,
        sentinel_deadline: Option<Duration>,
        cancel: &Cancellation,
        sink: F,
    ) -> Result<PostProcessOutcome>
    where
        F: FnMut(&str, Option<f64>),
    {
        let sentinel =
            wait_for_sentinel(build_dir, self.sentinel_poll, sentinel_deadline, cancel).await?;
        self.process(build_dir, sentinel, cancel, sink).await
    }

    pub fn sentinel_poll(&self) -> Duration {
        self.sentinel_poll
    }

    /// Everything after the sentinel: project layout, processor run, Fuser
    /// cleanup and distribution.
    pub async fn process<F>(
        &self,
        build_dir: &Path,
        sentinel: CenterPivotOrigin,
        cancel: &Cancellation,
        sink: F,
    ) -> Result<PostProcessOutcome>
    where
        F: FnMut(&str, Option<f64>),
    {
        tracing::info!(
            project_name = %sentinel.project_name,
            origin = ?sentinel.origin,
            "Build completed"
        );

        let layout = self.prepare_project(build_dir, &sentinel).await?;
        self.run_processor(&layout.settings_file, cancel, sink).await?;

        if self.kill_fusers {
            kill_fusers().await;
        }
        let distributed = distribute(&layout.project_dir, &self.destinations).await;
        Ok(PostProcessOutcome {
            sentinel,
            layout,
            distributed,
        })
    }

    /// Creates `<root>/<name>_<YYYYMMDD_HHMMSS>/data`, copies the tile
    /// output into it and writes `<name>-settings.txt`.
    pub async fn prepare_project(
        &self,
        build_dir: &Path,
        sentinel: &CenterPivotOrigin,
    ) -> Result<ProjectLayout> {
        let name = dataset_name(&sentinel.project_name)
            .map_err(|reason| OrchestratorError::Config {
                path: build_dir.join(SENTINEL_FILE_NAME),
                reason,
            })?;
        let root = self.dataset_root.clone().unwrap_or_else(|| build_dir.to_path_buf());
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let project_dir = root.join(format!("{name}_{stamp}"));
        let data_dir = project_dir.join("data");
        std::fs::create_dir_all(&data_dir).map_err(|e| OrchestratorError::io(&data_dir, e))?;

        let Some(output) = OUTPUT_DIRS.iter().map(|d| build_dir.join(d)).find(|p| p.is_dir()) else {
            return Err(OrchestratorError::io(
                build_dir,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "build has no Tiles or OBJ output",
                ),
            ));
        };
        let source_dir = data_dir.join(output.file_name().unwrap_or_default());
        let (from, to) = (output.clone(), source_dir.clone());
        let copied = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
            if to.exists() {
                std::fs::remove_dir_all(&to)?;
            }
            copy_dir_all(&from, &to)
        })
        .await
        .map_err(|e| OrchestratorError::io(&source_dir, std::io::Error::other(e)))?
        .map_err(|e| OrchestratorError::io(&source_dir, e))?;
        tracing::info!(
            from = %output.display(),
            to = %source_dir.display(),
            files = copied,
            "Copied build output"
        );

        let settings = RealityMeshSettings::from_sentinel(sentinel, &source_dir, &data_dir);
        if settings.utm.is_none() {
            tracing::warn!(
                wkt = %sentinel.wkt,
                "No UTM zone in WKT; writing empty zone and hemisphere"
            );
        }
        let settings_file = project_dir.join(format!("{name}-settings.txt"));
        atomic_write(&settings_file, settings.render().as_bytes())
            .map_err(|e| OrchestratorError::io(&settings_file, e))?;

        Ok(ProjectLayout {
            project_dir,
            data_dir,
            source_dir,
            settings_file,
        })
    }

    /// Runs the processor on `settings_file`, forwarding stdout lines.
    /// Output that is not UTF-8 is decoded lossily.
    pub async fn run_processor<F>(
        &self,
        settings_file: &Path,
        cancel: &Cancellation,
        mut sink: F,
    ) -> Result<()>
    where
        F: FnMut(&str, Option<f64>),
    {
        let program = self.processor.program.clone();
        let mut child = Command::new(&program)
            .args(&self.processor.args)
            .arg(settings_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| OrchestratorError::Spawn {
                program: program.clone(),
                source,
            })?;
        tracing::info!(
            program = %program,
            settings = %settings_file.display(),
            "Started Reality Mesh processor"
        );

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while matches!(reader.read_until(b'\n', &mut buf).await, Ok(n) if n > 0) {
                    tracing::warn!(line = %decode_line(&buf), "Processor stderr");
                    buf.clear();
                }
            });
        }

        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let read = tokio::select! {
                    read = reader.read_until(b'\n', &mut buf) => {
                        read.map_err(|e| OrchestratorError::io(settings_file, e))?
                    }
                    _ = cancel.cancelled() => {
                        let _ = child.start_kill();
                        return Err(OrchestratorError::Cancelled);
                    }
                };
                if read == 0 {
                    break;
                }
                let line = decode_line(&buf);
                let pct = parse_progress(&line);
                if let Some(p) = pct {
                    self.metrics.postprocess_progress.set(p);
                }
                tracing::debug!(line = %line, progress = ?pct, "Processor output");
                sink(&line, pct);
            }
        }

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| OrchestratorError::Spawn {
                program: program.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                return Err(OrchestratorError::Cancelled);
            }
        };
        if !status.success() {
            return Err(OrchestratorError::ChildProcess {
                program,
                code: status.code(),
            });
        }
        tracing::info!("Reality Mesh processor finished");
        Ok(())
    }
}

/// Checks a sentinel `project_name` before it becomes a folder and file
/// name under the dataset root.
fn dataset_name(raw: &str) -> std::result::Result<&str, String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err("project_name is empty".into());
    }
    let unsafe_char = |c: char| matches!(c, '/' | '\\' | ':') || c.is_control();
    if name.contains("..") || name.chars().any(unsafe_char) {
        return Err(format!("project_name {raw:?} is not a plain folder name"));
    }
    Ok(name)
}

/// One line of child output without its terminator.
fn decode_line(buf: &[u8]) -> Cow<'_, str> {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line)
}

/// Moves a sentinel in `build_dir` aside to
/// `Output-CenterPivotOrigin.json.consumed-<timestamp>` so it is acted on
/// once. Returns the new path, or `None` when there was no sentinel.
pub fn retire_sentinel(build_dir: &Path) -> Result<Option<PathBuf>> {
    let path = build_dir.join(SENTINEL_FILE_NAME);
    if !path.is_file() {
        return Ok(None);
    }
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S%3f");
    let retired = build_dir.join(format!("{SENTINEL_FILE_NAME}.consumed-{stamp}"));
    std::fs::rename(&path, &retired).map_err(|e| OrchestratorError::io(&path, e))?;
    Ok(Some(retired))
}

/// Polls `build_dir` for the sentinel, parses it and retires it. A
/// sentinel that does not parse is retried a few times in case the Wizard
/// is mid-write.
pub async fn wait_for_sentinel(
    build_dir: &Path,
    poll: Duration,
    deadline: Option<Duration>,
    cancel: &Cancellation,
) -> Result<CenterPivotOrigin> {
    let path = build_dir.join(SENTINEL_FILE_NAME);
    let started = Instant::now();
    let mut failures = 0;
    loop {
        if path.is_file() {
            match read_sentinel(&path) {
                Ok(sentinel) => {
                    if let Err(e) = retire_sentinel(build_dir) {
                        tracing::warn!(error = %e, "Could not move the consumed sentinel aside");
                    }
                    return Ok(sentinel);
                }
                Err(e) => {
                    failures += 1;
                    if failures >= SENTINEL_PARSE_ATTEMPTS {
                        return Err(e.into());
                    }
                    tracing::debug!(
                        path = %path.display(),
                        error = %e,
                        "Sentinel not readable yet"
                    );
                }
            }
        }
        if let Some(limit) = deadline {
            if started.elapsed() >= limit {
                return Err(OrchestratorError::Timeout {
                    site: TimeoutSite::SentinelWait,
                    elapsed: started.elapsed(),
                });
            }
        }
        if !cancel.sleep(poll).await {
            return Err(OrchestratorError::Cancelled);
        }
    }
}

/// Best-effort termination of Fuser helpers left behind by the build.
pub async fn kill_fusers() {
    let (program, args) = FUSER_KILL;
    match Command::new(program).args(args).output().await {
        Ok(out) => tracing::debug!(program, status = ?out.status.code(), "Fuser cleanup"),
        Err(e) => tracing::debug!(program, error = %e, "Fuser cleanup unavailable"),
    }
}

/// Copies `project_dir` into every destination. Failing destinations are
/// logged and skipped; returns the copies written.
pub async fn distribute(project_dir: &Path, destinations: &[PathBuf]) -> Vec<PathBuf> {
    let Some(name) = project_dir.file_name() else {
        return Vec::new();
    };
    let mut written = Vec::new();
    for dest in destinations {
        let target = dest.join(name);
        let (from, to) = (project_dir.to_path_buf(), target.clone());
        match tokio::task::spawn_blocking(move || copy_dir_all(&from, &to)).await {
            Ok(Ok(files)) => {
                tracing::info!(dest = %target.display(), files, "Distributed project");
                written.push(target);
            }
            Ok(Err(e)) => {
                tracing::warn!(dest = %target.display(), error = %e, "Distribution failed")
            }
            Err(e) => {
                tracing::warn!(dest = %target.display(), error = %e, "Distribution task failed")
            }
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::fs;

    const SENTINEL: &str =
        r#"{"project_name":"demo","Origin":[1,2,3],"WKT":"PROJCS[\"WGS 84 / UTM zone 33, Southern\"]"}"#;

    fn build_dir(root: &Path) -> PathBuf {
        let build = root.join("build");
        fs::create_dir_all(build.join("Tiles/L0")).unwrap();
        fs::write(build.join("Tiles/L0/tile_0.obj"), "v 0 0 0\n").unwrap();
        fs::write(build.join(SENTINEL_FILE_NAME), SENTINEL).unwrap();
        build
    }

    #[cfg(unix)]
    fn stub(root: &Path, body: &str) -> Processor {
        let script = root.join("processor.sh");
        fs::write(&script, body).unwrap();
        Processor {
            program: "/bin/sh".into(),
            args: vec![script.display().to_string()],
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn builds_project_folder_and_streams_progress() {
        let root = tempfile::tempdir().unwrap();
        let build = build_dir(root.path());
        let datasets = root.path().join("datasets");
        let metrics = Arc::new(Metrics::new());
        let pp = PostProcessor::new(
            stub(root.path(), "echo starting\necho 'Progress: 50%'\nexit 0\n"),
            metrics.clone(),
        )
        .with_dataset_root(Some(datasets.clone()))
        .with_fuser_cleanup(false)
        .with_sentinel_poll(Duration::from_millis(20));

        let mut seen = Vec::new();
        let out = pp
            .run(&build, Some(Duration::from_secs(5)), &Cancellation::new(), |line, pct| {
                seen.push((line.to_string(), pct))
            })
            .await
            .unwrap();

        let folder = out.layout.project_dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(folder.starts_with("demo_"));
        assert_eq!(folder.len(), "demo_".len() + "YYYYMMDD_HHMMSS".len());
        assert_eq!(out.layout.project_dir.parent().unwrap(), datasets);
        assert!(out.layout.data_dir.join("Tiles/L0/tile_0.obj").is_file());

        let text = fs::read_to_string(&out.layout.settings_file).unwrap();
        assert!(out.layout.settings_file.ends_with("demo-settings.txt"));
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines.contains(&"offset_x=1"));
        assert!(lines.contains(&"offset_y=2"));
        assert!(lines.contains(&"offset_z=3"));
        assert!(text.contains("UTM zone:33 hemi:S"));

        assert_eq!(
            seen,
            vec![
                ("starting".to_string(), None),
                ("Progress: 50%".to_string(), Some(50.0)),
            ]
        );
        assert_eq!(metrics.postprocess_progress.get(), 50.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_processor_is_fatal_and_keeps_files() {
        let root = tempfile::tempdir().unwrap();
        let build = build_dir(root.path());
        let pp = PostProcessor::new(
            stub(root.path(), "echo 'Tile 1 of 4'\nexit 3\n"),
            Arc::new(Metrics::new()),
        )
        .with_fuser_cleanup(false);
        let sentinel = read_sentinel(build.join(SENTINEL_FILE_NAME)).unwrap();
        let layout = pp.prepare_project(&build, &sentinel).await.unwrap();
        let mut pcts = Vec::new();
        let err = pp
            .run_processor(&layout.settings_file, &Cancellation::new(), |_, p| pcts.push(p))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChildProcess);
        assert!(matches!(err, OrchestratorError::ChildProcess { code: Some(3), .. }));
        assert_eq!(pcts, vec![Some(25.0)]);
        assert!(layout.settings_file.is_file());
        // Without a dataset root the project lands in the build folder.
        assert_eq!(layout.project_dir.parent().unwrap(), build);
    }

    #[tokio::test]
    async fn obj_is_used_when_tiles_are_missing() {
        let root = tempfile::tempdir().unwrap();
        let build = root.path().join("build");
        fs::create_dir_all(build.join("OBJ")).unwrap();
        fs::write(build.join("OBJ/model.obj"), "o m\n").unwrap();
        let pp = PostProcessor::new(
            Processor::powershell("powershell.exe", Path::new("rm.ps1")),
            Arc::new(Metrics::new()),
        );
        let sentinel = reality_mesh::parse_sentinel(SENTINEL.as_bytes()).unwrap();
        let layout = pp.prepare_project(&build, &sentinel).await.unwrap();
        assert!(layout.source_dir.ends_with("data/OBJ"));
        assert!(layout.source_dir.join("model.obj").is_file());
    }

    #[tokio::test]
    async fn sentinel_wait_honours_deadline_and_cancel() {
        let root = tempfile::tempdir().unwrap();
        let err = wait_for_sentinel(
            root.path(),
            Duration::from_millis(10),
            Some(Duration::from_millis(50)),
            &Cancellation::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { site: TimeoutSite::SentinelWait, .. }));

        let cancel = Cancellation::new();
        cancel.cancel();
        let err = wait_for_sentinel(root.path(), Duration::from_secs(5), None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn sentinel_appearing_later_is_picked_up() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().to_path_buf();
        let writer = dir.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fs::write(writer.join(SENTINEL_FILE_NAME), SENTINEL).unwrap();
        });
        let poll = Duration::from_millis(10);
        let s = wait_for_sentinel(&dir, poll, Some(Duration::from_secs(5)), &Cancellation::new())
            .await
            .unwrap();
        assert_eq!(s.project_name, "demo");
        assert_eq!(s.origin, [1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn distribute_skips_bad_destinations() {
        let root = tempfile::tempdir().unwrap();
        let project = root.path().join("demo_20240101_000000");
        fs::create_dir_all(project.join("data")).unwrap();
        fs::write(project.join("data/a.txt"), "a").unwrap();
        let blocker = root.path().join("not_a_dir");
        fs::write(&blocker, "x").unwrap();
        let good = root.path().join("install");

        let written = distribute(&project, &[blocker, good.clone()]).await;
        assert_eq!(written, vec![good.join("demo_20240101_000000")]);
        assert!(good.join("demo_20240101_000000/data/a.txt").is_file());
    }

    #[test]
    fn settings_json_files() {
        let root = tempfile::tempdir().unwrap();
        let sys = root.path().join("system.json");
        fs::write(&sys, r#"{"dataset_root":"/data/rm","other":1}"#).unwrap();
        assert_eq!(
            SystemSettings::load(&sys).unwrap().dataset_root,
            Some(PathBuf::from("/data/rm"))
        );

        let dist = root.path().join("dist.json");
        fs::write(&dist, r#"{"destinations":["/a","/b"]}"#).unwrap();
        assert_eq!(DistributionTargets::load(&dist).unwrap().destinations.len(), 2);

        fs::write(&dist, "nope").unwrap();
        assert_eq!(DistributionTargets::load(&dist).unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_utf8_output_is_decoded_lossily() {
        let root = tempfile::tempdir().unwrap();
        let build = build_dir(root.path());
        let pp = PostProcessor::new(
            stub(root.path(), "printf 'Gel\\351nde\\r\\n'\necho 'Progress: 100%'\nexit 0\n"),
            Arc::new(Metrics::new()),
        )
        .with_fuser_cleanup(false);
        let sentinel = read_sentinel(build.join(SENTINEL_FILE_NAME)).unwrap();
        let layout = pp.prepare_project(&build, &sentinel).await.unwrap();

        let mut seen = Vec::new();
        pp.run_processor(&layout.settings_file, &Cancellation::new(), |line, pct| {
            seen.push((line.to_string(), pct))
        })
        .await
        .unwrap();
        assert_eq!(
            seen,
            vec![
                ("Gel\u{FFFD}nde".to_string(), None),
                ("Progress: 100%".to_string(), Some(100.0)),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_between_output_lines_stops_processor() {
        let root = tempfile::tempdir().unwrap();
        let build = build_dir(root.path());
        let pp = PostProcessor::new(
            stub(
                root.path(),
                "i=0\nwhile [ $i -lt 600 ]; do echo \"Progress: 1%\"; sleep 0.05; i=$((i+1)); done\n",
            ),
            Arc::new(Metrics::new()),
        )
        .with_fuser_cleanup(false);
        let sentinel = read_sentinel(build.join(SENTINEL_FILE_NAME)).unwrap();
        let layout = pp.prepare_project(&build, &sentinel).await.unwrap();

        let cancel = Cancellation::new();
        let trigger = cancel.clone();
        let mut lines = 0;
        let started = Instant::now();
        let err = pp
            .run_processor(&layout.settings_file, &cancel, |_, _| {
                lines += 1;
                if lines == 2 {
                    trigger.cancel();
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(lines >= 2);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn project_name_must_stay_inside_dataset_root() {
        let root = tempfile::tempdir().unwrap();
        let build = build_dir(root.path());
        let datasets = root.path().join("datasets");
        let pp = PostProcessor::new(
            Processor::powershell("powershell.exe", Path::new("rm.ps1")),
            Arc::new(Metrics::new()),
        )
        .with_dataset_root(Some(datasets.clone()));

        for name in ["../../escaped", "a/b", r"a\b", "/abs", r"C:\data", "..", "  "] {
            let mut sentinel = reality_mesh::parse_sentinel(SENTINEL.as_bytes()).unwrap();
            sentinel.project_name = name.to_string();
            let err = pp.prepare_project(&build, &sentinel).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{name:?}");
        }
        assert!(!root.path().join("escaped").exists());
        assert!(!datasets.exists());

        let mut sentinel = reality_mesh::parse_sentinel(SENTINEL.as_bytes()).unwrap();
        sentinel.project_name = " Site 7 ".to_string();
        let layout = pp.prepare_project(&build, &sentinel).await.unwrap();
        assert_eq!(layout.project_dir.parent().unwrap(), datasets);
        assert!(layout.settings_file.ends_with("Site 7-settings.txt"));
    }

    #[tokio::test]
    async fn sentinel_is_consumed_once() {
        let root = tempfile::tempdir().unwrap();
        let build = build_dir(root.path());
        let poll = Duration::from_millis(10);

        let cancel = Cancellation::new();

        let first = wait_for_sentinel(&build, poll, Some(Duration::from_secs(1)), &cancel)
            .await
            .unwrap();
        assert_eq!(first.project_name, "demo");
        assert!(!build.join(SENTINEL_FILE_NAME).exists());
        let retired = fs::read_dir(&build)
            .unwrap()
            .flatten()
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with(&format!("{SENTINEL_FILE_NAME}.consumed-"))
            })
            .count();
        assert_eq!(retired, 1);

        let err = wait_for_sentinel(&build, poll, Some(Duration::from_millis(50)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { site: TimeoutSite::SentinelWait, .. }));
        assert_eq!(retire_sentinel(&build).unwrap(), None);
    }
}
