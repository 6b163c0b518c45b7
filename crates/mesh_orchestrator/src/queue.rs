//! Client for the PhotoMesh Project Queue REST service.

use crate::cancel::Cancellation;
use crate::config::QueueSettings;
use crate::elevation::launch_elevated;
use crate::error::{OrchestratorError, Result, TimeoutSite};
use crate::metrics::Metrics;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const READY_POLL: Duration = Duration::from_millis(1500);
pub const HEARTBEAT: Duration = Duration::from_secs(30);

/// One source folder of a build.
#[derive(Debug, Clone, Serialize)]
pub struct SourceEntry {
    pub name: String,
    pub path: String,
    pub properties: String,
}

/// One entry of the body posted to `/ProjectQueue/project/add`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildJob {
    pub comment: String,
    pub action: u8,
    #[serde(rename = "projectPath")]
    pub project_path: String,
    #[serde(rename = "buildFrom")]
    pub build_from: u8,
    #[serde(rename = "buildUntil")]
    pub build_until: u8,
    #[serde(rename = "workingFolder")]
    pub working_folder: String,
    #[serde(rename = "MaxLocalFusers")]
    pub max_local_fusers: u32,
    #[serde(rename = "sourceType")]
    pub source_type: u8,
    #[serde(rename = "sourcePath")]
    pub source_path: Vec<SourceEntry>,
}

/// Builds the single-job payload for a folder-sourced project.
pub fn build_payload(
    project_name: &str,
    project_dir: &Path,
    working_folder: &Path,
    folders: &[PathBuf],
) -> Vec<BuildJob> {
    let source_path = folders
        .iter()
        .map(|f| SourceEntry {
            name: f
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| f.display().to_string()),
            path: f.display().to_string(),
            properties: String::new(),
        })
        .collect();
    vec![BuildJob {
        comment: format!("{project_name} ({})", uuid::Uuid::new_v4()),
        action: 0,
        project_path: project_dir
            .join(format!("{project_name}.PhotoMeshXML"))
            .display()
            .to_string(),
        build_from: 1,
        build_until: 6,
        working_folder: working_folder.display().to_string(),
        max_local_fusers: 8,
        source_type: 0,
        source_path,
    }]
}

pub struct QueueClient {
    base: String,
    http: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl QueueClient {
    pub fn new(settings: &QueueSettings, metrics: Arc<Metrics>) -> Result<Self> {
        // No client-wide timeout: the SSE stream is long-lived. Probes and
        // submits set their own.
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| OrchestratorError::network(&settings.base_url, e))?;
        Ok(Self {
            base: settings.base_url.trim_end_matches('/').to_string(),
            http,
            metrics,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// GET on the queue root; only `200` counts as up.
    pub async fn queue_alive(&self, timeout: Duration) -> bool {
        self.metrics.queue_probes_total.inc();
        let url = self.url("/ProjectQueue/");
        match self.http.get(&url).timeout(timeout).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                tracing::debug!(url, error = %e, "Queue probe failed");
                false
            }
        }
    }

    /// Starts the PhotoMesh host elevated when the queue is down, then waits
    /// for it to answer.
    pub async fn ensure_queue_running(
        &self,
        photomesh: &Path,
        deadline: Duration,
        cancel: &Cancellation,
    ) -> Result<()> {
        if self.queue_alive(PROBE_TIMEOUT).await {
            return Ok(());
        }
        tracing::info!(base = %self.base, "Project Queue is down; starting PhotoMesh");
        launch_elevated(photomesh, &[]).await?;

        let started = Instant::now();
        loop {
            if self.queue_alive(PROBE_TIMEOUT).await {
                tracing::info!(elapsed = ?started.elapsed(), "Project Queue is up");
                return Ok(());
            }
            if started.elapsed() >= deadline {
                return Err(OrchestratorError::Timeout {
                    site: TimeoutSite::QueueReady,
                    elapsed: started.elapsed(),
                });
            }
            if !cancel.sleep(READY_POLL).await {
                return Err(OrchestratorError::Cancelled);
            }
        }
    }

    /// Adds the jobs to the queue and starts the build.
    pub async fn submit(&self, payload: &[BuildJob]) -> Result<()> {
        let add = self.url("/ProjectQueue/project/add");
        let resp = self
            .http
            .post(&add)
            .timeout(PROBE_TIMEOUT)
            .json(payload)
            .send()
            .await
            .map_err(|e| OrchestratorError::network(&add, e))?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(OrchestratorError::network(&add, format!("HTTP {}", resp.status())));
        }

        let start = self.url("/Build/Start");
        let resp = self
            .http
            .get(&start)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| OrchestratorError::network(&start, e))?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(OrchestratorError::network(&start, format!("HTTP {}", resp.status())));
        }
        tracing::info!(jobs = payload.len(), "Submitted build to Project Queue");
        Ok(())
    }

    /// Probes the queue every `period` until `budget` is spent, logging a
    /// heartbeat. Returns `Cancelled` within one period of a cancel.
    pub async fn poll(&self, period: Duration, budget: Duration, cancel: &Cancellation) -> Result<()> {
        let started = Instant::now();
        let mut last_heartbeat: Option<Instant> = None;
        loop {
            let alive = self.queue_alive(PROBE_TIMEOUT).await;
            if last_heartbeat.map_or(true, |t| t.elapsed() >= HEARTBEAT) {
                tracing::info!(alive, elapsed = ?started.elapsed(), "Project Queue heartbeat");
                last_heartbeat = Some(Instant::now());
            }
            if !alive {
                tracing::debug!("Project Queue did not answer");
            }
            if started.elapsed() >= budget {
                tracing::info!(budget = ?budget, "Queue monitor budget spent");
                return Ok(());
            }
            if !cancel.sleep(period).await {
                return Err(OrchestratorError::Cancelled);
            }
        }
    }

    /// Streams `GET /SSE?path=<working_folder>` and hands each event payload
    /// to `sink`. Returns when the stream ends or `budget` elapses.
    pub async fn stream_events<F>(
        &self,
        working_folder: &Path,
        budget: Option<Duration>,
        cancel: &Cancellation,
        mut sink: F,
    ) -> Result<()>
    where
        F: FnMut(&str),
    {
        let url = self.url("/SSE");
        let mut resp = self
            .http
            .get(&url)
            .query(&[("path", working_folder.display().to_string())])
            .send()
            .await
            .map_err(|e| OrchestratorError::network(&url, e))?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(OrchestratorError::network(&url, format!("HTTP {}", resp.status())));
        }

        let deadline = budget.map(|b| Instant::now() + b);
        let mut lines = SseLines::default();
        loop {
            let chunk = tokio::select! {
                chunk = resp.chunk() => chunk.map_err(|e| OrchestratorError::network(&url, e))?,
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                _ = until(deadline) => {
                    tracing::info!("SSE budget elapsed");
                    return Ok(());
                }
            };
            match chunk {
                Some(bytes) => {
                    for event in lines.push(&bytes) {
                        sink(&event);
                    }
                }
                None => {
                    if let Some(event) = lines.finish() {
                        sink(&event);
                    }
                    return Ok(());
                }
            }
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Splits a byte stream into SSE payloads: `data:` values and bare lines.
/// Field lines other than `data` and comments are dropped.
#[derive(Default)]
struct SseLines {
    buf: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(event) = payload(&line) {
                out.push(event);
            }
        }
        out
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        payload(&rest)
    }
}

fn payload(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    if let Some(data) = line.strip_prefix("data:") {
        return Some(data.strip_prefix(' ').unwrap_or(data).to_string());
    }
    if ["event:", "id:", "retry:"].iter().any(|f| line.starts_with(f)) {
        return None;
    }
    Some(line.to_string())
}
