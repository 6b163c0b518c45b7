//! Launcher configuration: an INI-style `key=value` file with `[Section]`
//! headers, plus typed views over the sections the orchestrator reads.

use crate::error::{OrchestratorError, Result};
use crate::fsutil::atomic_write;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_QUEUE_URL: &str = "http://127.0.0.1:8087";
pub const DEFAULT_QUEUE_READY_SECS: u64 = 45;

type Section = (String, Vec<(String, String)>);

/// Owns every read and write of the launcher config file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    sections: Vec<Section>,
}

impl ConfigStore {
    /// Loads `path`. A missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self {
            path: path.into(),
            sections: Vec::new(),
        };
        store.reload()?;
        Ok(store)
    }

    /// Like [`ConfigStore::load`], but an unreadable file is reported and
    /// treated as empty so callers fall back to defaults.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(path.clone()) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(error = %e, "Config unreadable; using defaults");
                Self {
                    path,
                    sections: Vec::new(),
                }
            }
        }
    }

    /// Re-reads the backing file. On a parse error the in-memory contents
    /// are kept and the error is returned.
    pub fn reload(&mut self) -> Result<()> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.sections.clear();
                return Ok(());
            }
            Err(e) => return Err(OrchestratorError::io(&self.path, e)),
        };
        self.sections = parse(&text).map_err(|reason| OrchestratorError::Config {
            path: self.path.clone(),
            reason,
        })?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_opt(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(name, _)| name == section)?
            .1
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get(&self, section: &str, key: &str, default: &str) -> String {
        self.get_opt(section, key).unwrap_or(default).to_string()
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        self.get_opt(section, key)
            .and_then(parse_bool)
            .unwrap_or(default)
    }

    fn get_path(&self, section: &str, key: &str) -> Option<PathBuf> {
        self.get_opt(section, key)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    /// Sets a value, creating the section on first write.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let value = value.into();
        let idx = match self.sections.iter().position(|(name, _)| name == section) {
            Some(i) => i,
            None => {
                self.sections.push((section.to_string(), Vec::new()));
                self.sections.len() - 1
            }
        };
        let entries = &mut self.sections[idx].1;
        match entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some(entry) => entry.1 = value,
            None => entries.push((key.to_string(), value)),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, (name, entries)) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&format!("[{name}]\n"));
            for (k, v) in entries {
                out.push_str(&format!("{k} = {v}\n"));
            }
        }
        out
    }

    /// Atomically replaces the backing file with the in-memory contents.
    pub fn save(&self) -> Result<()> {
        atomic_write(&self.path, self.render().as_bytes())
            .map_err(|e| OrchestratorError::io(&self.path, e))
    }
}

fn parse(text: &str) -> std::result::Result<Vec<Section>, String> {
    let mut sections: Vec<Section> = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            if !sections.iter().any(|(n, _)| *n == name) {
                sections.push((name, Vec::new()));
            }
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(format!("line {}: expected `key = value`", lineno + 1));
        };
        let Some(current) = sections.last_mut() else {
            return Err(format!("line {}: entry before any [section]", lineno + 1));
        };
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        match current.1.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            Some(entry) => entry.1 = value,
            None => current.1.push((key, value)),
        }
    }
    Ok(sections)
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `<per-user config dir>/PhotoMeshLauncher/config.ini`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("PhotoMeshLauncher")
        .join("config.ini")
}

/// Best-effort exclusive lock on `<config>.lock`, released on drop.
#[derive(Debug)]
pub struct ConfigLock {
    path: PathBuf,
}

impl ConfigLock {
    pub fn acquire(config_path: &Path) -> Result<Self> {
        let mut name = config_path.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| OrchestratorError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => OrchestratorError::Config {
                    path: config_path.to_path_buf(),
                    reason: format!("locked by another process ({})", path.display()),
                },
                _ => OrchestratorError::io(&path, e),
            })?;
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self { path })
    }
}

impl Drop for ConfigLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug, Clone, Default)]
pub struct GeneralConfig {
    pub photomesh_wizard_path: Option<PathBuf>,
    pub photomesh_path: Option<PathBuf>,
    pub default_browser: String,
}

impl GeneralConfig {
    pub fn from_store(store: &ConfigStore) -> Self {
        Self {
            photomesh_wizard_path: store.get_path("General", "photomesh_wizard_path"),
            photomesh_path: store.get_path("General", "photomesh_path"),
            default_browser: store.get("General", "default_browser", ""),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AutoLaunchConfig {
    pub enabled: bool,
    pub command: String,
    pub arguments: String,
}

impl AutoLaunchConfig {
    pub fn from_store(store: &ConfigStore) -> Self {
        Self {
            enabled: store.get_bool("Auto-Launch", "enabled", false),
            command: store.get("Auto-Launch", "command", ""),
            arguments: store.get("Auto-Launch", "arguments", ""),
        }
    }
}

/// Settings for offline (LAN share) workflows.
#[derive(Debug, Clone, Default)]
pub struct OfflineConfig {
    pub host_name: String,
    pub host_ip: String,
    pub share_name: String,
    pub local_data_root: Option<PathBuf>,
    pub sub_path: String,
    pub use_ip_unc: bool,
}

impl OfflineConfig {
    pub fn from_store(store: &ConfigStore) -> Self {
        Self {
            host_name: store.get("Offline", "host_name", ""),
            host_ip: store.get("Offline", "host_ip", ""),
            share_name: store.get("Offline", "share_name", ""),
            local_data_root: store.get_path("Offline", "local_data_root"),
            sub_path: store.get("Offline", "sub_path", ""),
            use_ip_unc: store.get_bool("Offline", "use_ip_unc", false),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub base_url: String,
    pub ready_timeout: Duration,
}

impl QueueSettings {
    pub fn from_store(store: &ConfigStore) -> Self {
        let secs = store
            .get_opt("Queue", "ready_timeout_secs")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_QUEUE_READY_SECS);
        Self {
            base_url: store
                .get("Queue", "base_url", DEFAULT_QUEUE_URL)
                .trim_end_matches('/')
                .to_string(),
            ready_timeout: Duration::from_secs(secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealityMeshConfig {
    pub system_settings: Option<PathBuf>,
    pub processor_script: Option<PathBuf>,
    pub powershell: String,
    pub distribution: Option<PathBuf>,
}

impl RealityMeshConfig {
    pub fn from_store(store: &ConfigStore) -> Self {
        Self {
            system_settings: store.get_path("RealityMesh", "system_settings"),
            processor_script: store.get_path("RealityMesh", "processor_script"),
            powershell: store.get("RealityMesh", "powershell", "powershell.exe"),
            distribution: store.get_path("RealityMesh", "distribution"),
        }
    }
}
