//! Preset Manager: the only writer of the canonical preset, the Wizard's
//! install-level `config.json`, and every per-user Wizard config.
//!
//! Every operation is idempotent: files are rewritten only when their
//! bytes change, and always through an atomic rename.

use crate::elevation::is_elevated;
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::fsutil::write_if_changed;
use crate::paths::{PhotoMeshPaths, UserDirs};
use crate::xml::{Document, Element};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const CANONICAL_PRESET_NAME: &str = "OECPP";
/// Names earlier launcher versions used for the same preset.
pub const LEGACY_PRESET_NAMES: &[&str] = &["STEPRESET", "CPP&OBJ"];
pub const PRESET_EXTENSION: &str = "PMPreset";

/// Install-config keys that would reapply a previously chosen preset.
pub const STICKY_KEYS: &[&str] = &[
    "SelectedPreset",
    "PresetStack",
    "LastUsedPreset",
    "PresetOverrides",
    "Preset",
    "SelectedPresets",
];

const PRESET_ROOT: &str = "BuildParametersPreset";
const BUILD_PARAMETERS: &str = "BuildParameters";
const WIZARD_UI: &str = "DefaultPhotoMeshWizardUI";
const CENTERING_FLAGS: &[&str] = &[
    "CenterModelsToProject",
    "CenterPivotToProject",
    "ReprojectToEllipsoid",
];

/// Accepts only the canonical preset name.
pub fn validate_preset_name(name: &str) -> Result<&str> {
    if name == CANONICAL_PRESET_NAME {
        return Ok(name);
    }
    let reason = if LEGACY_PRESET_NAMES.contains(&name) {
        format!("legacy preset name '{name}' is no longer accepted; use '{CANONICAL_PRESET_NAME}'")
    } else {
        format!("unknown preset '{name}'; only '{CANONICAL_PRESET_NAME}' is managed")
    };
    Err(OrchestratorError::Preset {
        path: PathBuf::from(name),
        reason,
    })
}

#[derive(Debug, Clone)]
pub struct PresetOptions {
    /// Keep 3DML next to OBJ in the output formats.
    pub include_3dml: bool,
    /// Value written to `AutoBuild` in user configs.
    pub auto_build: bool,
}

impl Default for PresetOptions {
    fn default() -> Self {
        Self {
            include_3dml: true,
            auto_build: true,
        }
    }
}

/// Outcome of a fold over user profiles.
#[derive(Debug, Default)]
pub struct SeedReport {
    pub seeded: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

#[derive(Debug)]
pub enum InstallConfigOutcome {
    Written,
    Unchanged,
    /// Install-level write was not permitted; user-level seeding still ran.
    Skipped(String),
}

#[derive(Debug)]
pub struct EnforceReport {
    pub install_config: InstallConfigOutcome,
    pub preset_changed: bool,
    pub users: SeedReport,
}

pub struct PresetManager {
    paths: PhotoMeshPaths,
    options: PresetOptions,
}

impl PresetManager {
    pub fn new(paths: PhotoMeshPaths, options: PresetOptions) -> Self {
        Self { paths, options }
    }

    pub fn paths(&self) -> &PhotoMeshPaths {
        &self.paths
    }

    pub fn options(&self) -> &PresetOptions {
        &self.options
    }

    /// The canonical preset file in the current user's preset directory.
    pub fn canonical_preset_path(&self) -> PathBuf {
        self.paths
            .current_user()
            .presets_dir()
            .join(format!("{CANONICAL_PRESET_NAME}.{PRESET_EXTENSION}"))
    }

    /// Enforces install defaults, normalizes the canonical preset and seeds
    /// user configs. Install-level permission failures downgrade to a
    /// warning so user-level seeding still happens.
    pub fn enforce_install_defaults(&self) -> Result<EnforceReport> {
        let install_config = match self.write_install_config() {
            Ok(true) => InstallConfigOutcome::Written,
            Ok(false) => InstallConfigOutcome::Unchanged,
            Err(e) if e.kind() == ErrorKind::Permission => {
                tracing::warn!(error = %e, "Cannot write install config; continuing with user-level settings");
                InstallConfigOutcome::Skipped(e.to_string())
            }
            Err(e) => return Err(e),
        };
        let preset_changed = self.normalize_preset_xml(&self.canonical_preset_path())?;
        let users = self.seed_user_configs()?;
        Ok(EnforceReport {
            install_config,
            preset_changed,
            users,
        })
    }

    /// Normalizes the preset at `path`, creating it when missing. Returns
    /// whether the file changed.
    pub fn normalize_preset_xml(&self, path: &Path) -> Result<bool> {
        let mut doc = match fs::read_to_string(path) {
            Ok(text) => Document::parse(&text).map_err(|e| OrchestratorError::Preset {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Document::new(Element::new(PRESET_ROOT))
            }
            Err(e) => return Err(OrchestratorError::io(path, e)),
        };
        if doc.root.name != PRESET_ROOT {
            return Err(OrchestratorError::Preset {
                path: path.to_path_buf(),
                reason: format!("root element is <{}>, expected <{PRESET_ROOT}>", doc.root.name),
            });
        }
        normalize_document(&mut doc, self.options.include_3dml);
        let text = doc.to_xml_string().map_err(|e| OrchestratorError::Preset {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let changed =
            write_if_changed(path, text.as_bytes()).map_err(|e| OrchestratorError::io(path, e))?;
        if changed {
            tracing::info!(path = %path.display(), "Normalized preset");
        }
        Ok(changed)
    }

    /// Applies the output invariants to the Wizard's install `config.json`.
    pub fn write_install_config(&self) -> Result<bool> {
        let path = self.paths.install_config();
        let mut root = read_json_or_empty(&path)?;
        enforce_install_json(&mut root);
        let changed = write_json(&path, &root)?;
        if changed {
            tracing::info!(path = %path.display(), "Wrote Wizard install defaults");
        }
        Ok(changed)
    }

    /// Seeds every user profile when elevated, the current user otherwise.
    pub fn seed_user_configs(&self) -> Result<SeedReport> {
        let profiles = if is_elevated() {
            self.paths.user_profiles()
        } else {
            vec![self.paths.current_user()]
        };
        self.seed_profiles(&profiles)
    }

    /// Folds [`PresetManager::seed_user_profile`] over `profiles`. The first
    /// entry is the current user and its failure is fatal; other profiles
    /// are reported and skipped.
    pub fn seed_profiles(&self, profiles: &[UserDirs]) -> Result<SeedReport> {
        let mut report = SeedReport::default();
        for (i, user) in profiles.iter().enumerate() {
            match self.seed_user_profile(user) {
                Ok(()) => report.seeded.push(user.appdata.clone()),
                Err(e) if i == 0 => return Err(e),
                Err(e) => {
                    tracing::warn!(profile = %user.appdata.display(), error = %e, "Skipping user profile");
                    report.failed.push((user.appdata.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Writes one profile's Wizard config, preset copy and preset settings.
    pub fn seed_user_profile(&self, user: &UserDirs) -> Result<()> {
        let config_path = user.wizard_config();
        let mut root = read_json_or_empty(&config_path)?;
        if let Some(prev) = root.get("SelectedPreset").and_then(Value::as_str) {
            if let Err(e) = validate_preset_name(prev) {
                tracing::warn!(profile = %user.appdata.display(), error = %e, "Replacing rejected preset selection");
            }
        }
        enforce_user_json(&mut root, self.options.auto_build);
        write_json(&config_path, &root)?;

        let source = self.canonical_preset_path();
        let dest = user
            .presets_dir()
            .join(format!("{CANONICAL_PRESET_NAME}.{PRESET_EXTENSION}"));
        if source != dest && source.is_file() {
            let bytes = fs::read(&source).map_err(|e| OrchestratorError::io(&source, e))?;
            if write_if_changed(&dest, &bytes).map_err(|e| OrchestratorError::io(&dest, e))? {
                tracing::info!(dest = %dest.display(), "Copied canonical preset");
            }
        }

        self.write_preset_settings(&user.preset_settings())
    }

    /// Makes `<DefaultPresetNames>` hold exactly the canonical name.
    pub fn write_preset_settings(&self, path: &Path) -> Result<()> {
        let mut doc = match fs::read_to_string(path) {
            Ok(text) => Document::parse(&text).map_err(|e| OrchestratorError::Preset {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Document::new(Element::new("PresetSettings"))
            }
            Err(e) => return Err(OrchestratorError::io(path, e)),
        };

        let names = doc.root.find_or_create("DefaultPresetNames", &[]);
        for existing in names.elements() {
            let value = existing.text();
            if value != CANONICAL_PRESET_NAME {
                tracing::debug!(name = %value, "Dropping non-canonical default preset");
            }
        }
        names.children.clear();
        let mut entry = Element::new("string");
        entry.set_text(CANONICAL_PRESET_NAME);
        names.push(entry);

        let text = doc.to_xml_string().map_err(|e| OrchestratorError::Preset {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        write_if_changed(path, text.as_bytes()).map_err(|e| OrchestratorError::io(path, e))?;
        Ok(())
    }

    /// Forces the build outputs of a Wizard-generated project preset.
    /// Missing intermediate elements are created.
    pub fn patch_project_preset(&self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|e| OrchestratorError::io(path, e))?;
        let mut doc = Document::parse(&text).map_err(|e| OrchestratorError::Preset {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        patch_document(&mut doc);
        let out = doc.to_xml_string().map_err(|e| OrchestratorError::Preset {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        write_if_changed(path, out.as_bytes()).map_err(|e| OrchestratorError::io(path, e))?;
        Ok(())
    }
}

/// The `<BuildParameters>` block, wherever the preset keeps it.
fn build_parameters(root: &mut Element) -> &mut Element {
    root.find_or_create(BUILD_PARAMETERS, &[])
}

/// The first descendant called `name`, created under `<BuildParameters>`
/// when absent.
fn descendant<'a>(root: &'a mut Element, name: &str) -> &'a mut Element {
    if root.find(name).is_none() {
        return build_parameters(root).ensure_child(name);
    }
    root.find_or_create(name, &[])
}

/// Applies the canonical-preset invariants to a parsed preset.
pub fn normalize_document(doc: &mut Document, include_3dml: bool) {
    let root = &mut doc.root;

    let current = root.child("PresetName").map(Element::text).unwrap_or_default();
    if current != CANONICAL_PRESET_NAME && !current.is_empty() {
        if let Err(e) = validate_preset_name(&current) {
            tracing::info!(reason = %e, "Renaming preset to canonical name");
        }
    }
    root.ensure_child("PresetName").set_text(CANONICAL_PRESET_NAME);
    root.ensure_child("IsDefault").set_bool(true);
    root.ensure_child("IsLastUsed").set_bool(true);

    for flag in CENTERING_FLAGS {
        descendant(root, flag).set_bool(true);
    }

    let formats = descendant(root, "OutputFormats");
    formats.children.clear();
    let mut wanted = vec!["OBJ"];
    if include_3dml {
        wanted.push("3DML");
    }
    for format in wanted {
        let mut item = Element::new("string");
        item.set_text(format);
        formats.push(item);
    }

    let products = descendant(root, "OutputProducts");
    products.ensure_child("Model3D").set_bool(true);
    for ortho in ["Ortho", "DSM", "DTM"] {
        products.ensure_child(ortho).set_bool(false);
    }
}

/// Forces Model3D/OBJ/3DML and the centering flags on a project preset.
pub fn patch_document(doc: &mut Document) {
    let params = build_parameters(&mut doc.root);
    params
        .ensure_path(&["OutputProducts", "Model3D"])
        .set_bool(true);
    params.ensure_path(&["Model3DFormats", "OBJ"]).set_bool(true);
    params.ensure_path(&["Model3DFormats", "3DML"]).set_bool(true);
    for flag in CENTERING_FLAGS {
        params.ensure_child(flag).set_bool(true);
    }
}

fn strip_sticky(obj: &mut Map<String, Value>) {
    for key in STICKY_KEYS {
        obj.remove(*key);
    }
}

fn object_entry<'a>(obj: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let slot = obj
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("slot was just made an object"),
    }
}

fn as_object(root: &mut Value) -> &mut Map<String, Value> {
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    match root {
        Value::Object(map) => map,
        _ => unreachable!("root was just made an object"),
    }
}

/// Applies the install-config invariants in place.
pub fn enforce_install_json(root: &mut Value) {
    let obj = as_object(root);
    strip_sticky(obj);

    let ui = object_entry(obj, WIZARD_UI);
    strip_sticky(ui);

    let products = object_entry(ui, "OutputProducts");
    products.insert("Model3D".into(), Value::Bool(true));
    products.insert("Ortho".into(), Value::Bool(false));
    products.insert("DSM".into(), Value::Bool(false));
    products.insert("DTM".into(), Value::Bool(false));
    products.insert("LAS".into(), Value::Bool(true));

    let formats = object_entry(ui, "Model3DFormats");
    formats.insert("OBJ".into(), Value::Bool(true));
    formats.insert("3DML".into(), Value::Bool(true));

    for flag in CENTERING_FLAGS {
        ui.insert((*flag).into(), Value::Bool(true));
    }
}

/// Applies the per-user Wizard config values in place.
pub fn enforce_user_json(root: &mut Value, auto_build: bool) {
    let obj = as_object(root);
    obj.insert("OverrideSettings".into(), Value::Bool(true));
    obj.insert("AutoBuild".into(), Value::Bool(auto_build));
    obj.insert("SelectedPreset".into(), Value::String(CANONICAL_PRESET_NAME.into()));
    obj.insert("DefaultPresetName".into(), Value::String(CANONICAL_PRESET_NAME.into()));
}

fn read_json_or_empty(path: &Path) -> Result<Value> {
    match fs::read(path) {
        Ok(bytes) => {
            let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
            match serde_json::from_slice(body) {
                Ok(v) => Ok(v),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Unreadable JSON config; starting from defaults");
                    Ok(Value::Object(Map::new()))
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Map::new())),
        Err(e) => Err(OrchestratorError::io(path, e)),
    }
}

fn write_json(path: &Path, value: &Value) -> Result<bool> {
    let mut text = serde_json::to_string_pretty(value).map_err(|e| OrchestratorError::Config {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    text.push('\n');
    write_if_changed(path, text.as_bytes()).map_err(|e| OrchestratorError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(root: &Path) -> PresetManager {
        PresetManager::new(PhotoMeshPaths::rooted(root), PresetOptions::default())
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn fresh_machine_gets_install_invariants() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        assert!(m.write_install_config().unwrap());

        let v = read_json(&m.paths().install_config());
        let ui = &v[WIZARD_UI];
        assert_eq!(ui["OutputProducts"]["Model3D"], json!(true));
        assert_eq!(ui["OutputProducts"]["Ortho"], json!(false));
        assert_eq!(ui["OutputProducts"]["DSM"], json!(false));
        assert_eq!(ui["OutputProducts"]["DTM"], json!(false));
        assert_eq!(ui["OutputProducts"]["LAS"], json!(true));
        assert_eq!(ui["Model3DFormats"]["OBJ"], json!(true));
        assert_eq!(ui["Model3DFormats"]["3DML"], json!(true));
        for flag in CENTERING_FLAGS {
            assert_eq!(ui[*flag], json!(true));
        }
        for key in STICKY_KEYS {
            assert!(v.get(*key).is_none());
            assert!(ui.get(*key).is_none());
        }
    }

    #[test]
    fn sticky_preset_is_removed_and_obj_forced() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let path = m.paths().install_config();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            serde_json::to_vec(&json!({
                "SelectedPreset": "X",
                "Theme": "dark",
                "DefaultPhotoMeshWizardUI": {"Model3DFormats": {"OBJ": false, "FBX": true}, "LastUsedPreset": "Y"}
            }))
            .unwrap(),
        )
        .unwrap();

        m.write_install_config().unwrap();
        let v = read_json(&path);
        assert!(v.get("SelectedPreset").is_none());
        assert!(v[WIZARD_UI].get("LastUsedPreset").is_none());
        assert_eq!(v[WIZARD_UI]["Model3DFormats"]["OBJ"], json!(true));
        assert_eq!(v[WIZARD_UI]["Model3DFormats"]["FBX"], json!(true));
        assert_eq!(v["Theme"], json!("dark"));
    }

    #[test]
    fn install_config_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.write_install_config().unwrap();
        let first = fs::read(m.paths().install_config()).unwrap();
        assert!(!m.write_install_config().unwrap());
        assert_eq!(first, fs::read(m.paths().install_config()).unwrap());
    }

    #[test]
    fn normalize_sets_name_flags_and_formats() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let path = dir.path().join("legacy.PMPreset");
        fs::write(
            &path,
            r#"<?xml version="1.0" encoding="utf-8"?>
<BuildParametersPreset>
  <PresetName>STEPRESET</PresetName>
  <IsDefault>false</IsDefault>
  <BuildParameters>
    <CenterPivotToProject>false</CenterPivotToProject>
    <OutputFormats><string>FBX</string></OutputFormats>
    <OutputProducts><Ortho>true</Ortho></OutputProducts>
    <TileSize>100</TileSize>
  </BuildParameters>
</BuildParametersPreset>
"#,
        )
        .unwrap();

        assert!(m.normalize_preset_xml(&path).unwrap());
        let doc = Document::parse(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc.root.child("PresetName").unwrap().text(), CANONICAL_PRESET_NAME);
        assert_eq!(doc.root.child("IsDefault").unwrap().text(), "true");
        assert_eq!(doc.root.child("IsLastUsed").unwrap().text(), "true");
        let params = doc.root.child(BUILD_PARAMETERS).unwrap();
        assert_eq!(params.child("CenterPivotToProject").unwrap().text(), "true");
        assert_eq!(params.child("ReprojectToEllipsoid").unwrap().text(), "true");
        let formats: Vec<String> = params
            .child("OutputFormats")
            .unwrap()
            .elements()
            .map(Element::text)
            .collect();
        assert_eq!(formats, vec!["OBJ", "3DML"]);
        assert_eq!(params.find("Ortho").unwrap().text(), "false");
        assert_eq!(params.child("TileSize").unwrap().text(), "100");
        assert!(doc.declaration.is_some());
    }

    #[test]
    fn normalize_is_a_fixpoint() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let path = m.canonical_preset_path();
        assert!(m.normalize_preset_xml(&path).unwrap());
        let first = fs::read(&path).unwrap();
        assert!(!m.normalize_preset_xml(&path).unwrap());
        assert_eq!(first, fs::read(&path).unwrap());
    }

    #[test]
    fn seeding_writes_user_config_settings_and_copies_preset() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        m.normalize_preset_xml(&m.canonical_preset_path()).unwrap();

        let other = UserDirs::from_appdata(&dir.path().join("Users/analyst/AppData/Roaming"));
        fs::create_dir_all(other.presets_dir()).unwrap();
        fs::write(
            other.preset_settings(),
            "<PresetSettings><DefaultPresetNames><string>CPP&amp;OBJ</string><string>STEPRESET</string></DefaultPresetNames><Theme>1</Theme></PresetSettings>",
        )
        .unwrap();
        fs::create_dir_all(other.wizard_config().parent().unwrap()).unwrap();
        fs::write(other.wizard_config(), r#"{"SelectedPreset":"STEPRESET","Recent":["a"]}"#).unwrap();

        let report = m
            .seed_profiles(&[m.paths().current_user(), other.clone()])
            .unwrap();
        assert_eq!(report.seeded.len(), 2);
        assert!(report.failed.is_empty());

        let cfg = read_json(&other.wizard_config());
        assert_eq!(cfg["OverrideSettings"], json!(true));
        assert_eq!(cfg["AutoBuild"], json!(true));
        assert_eq!(cfg["SelectedPreset"], json!(CANONICAL_PRESET_NAME));
        assert_eq!(cfg["DefaultPresetName"], json!(CANONICAL_PRESET_NAME));
        assert_eq!(cfg["Recent"], json!(["a"]));

        let copied = other.presets_dir().join("OECPP.PMPreset");
        assert_eq!(fs::read(&copied).unwrap(), fs::read(m.canonical_preset_path()).unwrap());

        let settings = Document::parse(&fs::read_to_string(other.preset_settings()).unwrap()).unwrap();
        let names: Vec<String> = settings
            .root
            .child("DefaultPresetNames")
            .unwrap()
            .elements()
            .map(Element::text)
            .collect();
        assert_eq!(names, vec![CANONICAL_PRESET_NAME]);
        assert_eq!(settings.root.child("Theme").unwrap().text(), "1");

        let before = fs::read(other.preset_settings()).unwrap();
        m.seed_user_profile(&other).unwrap();
        assert_eq!(before, fs::read(other.preset_settings()).unwrap());
    }

    #[test]
    fn patch_creates_missing_elements() {
        let mut doc = Document::parse(
            "<BuildParametersPreset><BuildParameters><Model3DFormats><OBJ>false</OBJ></Model3DFormats></BuildParameters></BuildParametersPreset>",
        )
        .unwrap();
        patch_document(&mut doc);
        let params = doc.root.child(BUILD_PARAMETERS).unwrap();
        assert_eq!(params.find("Model3D").unwrap().text(), "true");
        let formats = params.child("Model3DFormats").unwrap();
        assert_eq!(formats.child("OBJ").unwrap().text(), "true");
        assert_eq!(formats.child("3DML").unwrap().text(), "true");
        for flag in CENTERING_FLAGS {
            assert_eq!(params.child(flag).unwrap().text(), "true");
        }
    }

    #[test]
    fn legacy_names_are_rejected() {
        assert!(validate_preset_name(CANONICAL_PRESET_NAME).is_ok());
        for legacy in LEGACY_PRESET_NAMES {
            let err = validate_preset_name(legacy).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Preset);
        }
    }
}
