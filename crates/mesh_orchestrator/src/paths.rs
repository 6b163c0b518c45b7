//! Install and per-user locations of PhotoMesh and its Wizard.

use crate::config::GeneralConfig;
use crate::error::{OrchestratorError, Result};
use std::path::{Path, PathBuf};

pub const WIZARD_EXE: &str = "PhotoMeshWizard.exe";
pub const PHOTOMESH_EXE: &str = "PhotoMesh.exe";

/// Profile directories under the users root that never belong to a person.
const SYSTEM_PROFILES: &[&str] = &["All Users", "Default", "Default User", "Public", "desktop.ini"];

/// Roots everything else is derived from. Tests point these at a temp dir.
#[derive(Debug, Clone)]
pub struct PhotoMeshPaths {
    pub program_files: PathBuf,
    pub program_files_x86: Option<PathBuf>,
    pub users_root: PathBuf,
    /// Roaming AppData of the user running the orchestrator.
    pub current_appdata: PathBuf,
}

impl PhotoMeshPaths {
    pub fn detect() -> Self {
        let program_files = std::env::var_os("ProgramFiles")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Program Files"));
        let program_files_x86 = std::env::var_os("ProgramFiles(x86)").map(PathBuf::from);
        let current_appdata = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        let users_root = std::env::var_os("SystemDrive")
            .map(|d| PathBuf::from(format!("{}\\Users", d.to_string_lossy())))
            .or_else(|| dirs::home_dir().and_then(|h| h.parent().map(Path::to_path_buf)))
            .unwrap_or_else(|| PathBuf::from(r"C:\Users"));
        Self {
            program_files,
            program_files_x86,
            users_root,
            current_appdata,
        }
    }

    /// Layout rooted at `root`, used by tests and portable installs.
    pub fn rooted(root: &Path) -> Self {
        Self {
            program_files: root.join("Program Files"),
            program_files_x86: None,
            users_root: root.join("Users"),
            current_appdata: root.join("Users").join("operator").join("AppData").join("Roaming"),
        }
    }

    pub fn wizard_install_dir(&self) -> PathBuf {
        self.program_files.join("Skyline").join("PhotoMeshWizard")
    }

    pub fn photomesh_install_dir(&self) -> PathBuf {
        self.program_files.join("Skyline").join("PhotoMesh")
    }

    /// The Wizard's install-level `config.json`.
    pub fn install_config(&self) -> PathBuf {
        self.wizard_install_dir().join("config.json")
    }

    pub fn current_user(&self) -> UserDirs {
        UserDirs::from_appdata(&self.current_appdata)
    }

    /// Finds the Wizard executable, trying the configured path first.
    pub fn locate_wizard(&self, general: &GeneralConfig) -> Result<PathBuf> {
        let mut candidates = Vec::new();
        candidates.extend(general.photomesh_wizard_path.clone());
        candidates.push(self.wizard_install_dir().join(WIZARD_EXE));
        candidates.push(self.photomesh_install_dir().join(WIZARD_EXE));
        if let Some(x86) = &self.program_files_x86 {
            candidates.push(x86.join("Skyline").join("PhotoMeshWizard").join(WIZARD_EXE));
        }
        locate("PhotoMesh Wizard", WIZARD_EXE, candidates)
    }

    /// Finds the PhotoMesh host executable that serves the Project Queue.
    pub fn locate_photomesh(&self, general: &GeneralConfig) -> Result<PathBuf> {
        let mut candidates = Vec::new();
        candidates.extend(general.photomesh_path.clone());
        candidates.push(self.photomesh_install_dir().join(PHOTOMESH_EXE));
        if let Some(x86) = &self.program_files_x86 {
            candidates.push(x86.join("Skyline").join("PhotoMesh").join(PHOTOMESH_EXE));
        }
        locate("PhotoMesh", PHOTOMESH_EXE, candidates)
    }

    /// Every real user profile under the users root, plus the current
    /// user, deduplicated by AppData path.
    pub fn user_profiles(&self) -> Vec<UserDirs> {
        let mut out = vec![self.current_user()];
        let Ok(entries) = std::fs::read_dir(&self.users_root) else {
            return out;
        };
        let mut found: Vec<UserDirs> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                !SYSTEM_PROFILES.iter().any(|s| s.eq_ignore_ascii_case(&name))
            })
            .map(|e| UserDirs::from_appdata(&e.path().join("AppData").join("Roaming")))
            .collect();
        found.sort_by(|a, b| a.appdata.cmp(&b.appdata));
        for profile in found {
            if !out.iter().any(|p| p.appdata == profile.appdata) {
                out.push(profile);
            }
        }
        out
    }
}

fn locate(name: &str, exe: &str, candidates: Vec<PathBuf>) -> Result<PathBuf> {
    if let Some(hit) = candidates.iter().find(|p| p.is_file()) {
        return Ok(hit.clone());
    }
    let stem = exe.trim_end_matches(".exe");
    if let Ok(found) = which::which(stem) {
        return Ok(found);
    }
    let mut searched = candidates;
    searched.push(PathBuf::from(format!("PATH:{stem}")));
    Err(OrchestratorError::MissingDependency {
        name: name.to_string(),
        searched,
    })
}

/// PhotoMesh locations inside one user's roaming AppData.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDirs {
    pub appdata: PathBuf,
}

impl UserDirs {
    pub fn from_appdata(appdata: &Path) -> Self {
        Self {
            appdata: appdata.to_path_buf(),
        }
    }

    pub fn photomesh_dir(&self) -> PathBuf {
        self.appdata.join("Skyline").join("PhotoMesh")
    }

    pub fn presets_dir(&self) -> PathBuf {
        self.photomesh_dir().join("Presets")
    }

    pub fn preset_settings(&self) -> PathBuf {
        self.presets_dir().join("PresetSettings.xml")
    }

    pub fn wizard_config(&self) -> PathBuf {
        self.photomesh_dir().join("Wizard").join("config.json")
    }
}
