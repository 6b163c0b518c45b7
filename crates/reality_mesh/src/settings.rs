use crate::sentinel::CenterPivotOrigin;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

static UTM_NAMED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)UTM\s+zone\s+(\d{1,2})\s*,\s*(Northern|Southern)").expect("valid UTM regex")
});
static UTM_LETTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)UTM\s+zone\s+(\d{1,2})([NS])\b").expect("valid UTM regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hemisphere {
    North,
    South,
}

impl Hemisphere {
    pub fn letter(self) -> char {
        match self {
            Hemisphere::North => 'N',
            Hemisphere::South => 'S',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtmZone {
    pub zone: u8,
    pub hemisphere: Hemisphere,
}

/// Finds the UTM zone in a WKT string.
///
/// The `UTM zone <n>, Northern|Southern` form is tried first, then the
/// short `UTM zone <n>N|S` form used in PROJCS names.
pub fn parse_utm_zone(wkt: &str) -> Option<UtmZone> {
    if let Some(caps) = UTM_NAMED_RE.captures(wkt) {
        let zone = caps[1].parse().ok()?;
        let hemisphere = if caps[2].eq_ignore_ascii_case("southern") {
            Hemisphere::South
        } else {
            Hemisphere::North
        };
        return Some(UtmZone { zone, hemisphere });
    }
    let caps = UTM_LETTER_RE.captures(wkt)?;
    let zone = caps[1].parse().ok()?;
    let hemisphere = if caps[2].eq_ignore_ascii_case("s") {
        Hemisphere::South
    } else {
        Hemisphere::North
    };
    Some(UtmZone { zone, hemisphere })
}

/// Renders the `offset_coordsys` value. Zone and hemisphere are left
/// empty when the WKT carried no recognisable UTM zone.
pub fn offset_coordsys(utm: Option<UtmZone>) -> String {
    let (zone, hemi) = match utm {
        Some(z) => (z.zone.to_string(), z.hemisphere.letter().to_string()),
        None => (String::new(), String::new()),
    };
    format!("UTM zone:{zone} hemi:{hemi} horiz_units:Meters vert_units:Meters")
}

/// Processor knobs written after the offsets. Defaults match what the
/// one-click pipeline ships with.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub ortho_resolution: f64,
    pub ortho_render_lowest: u32,
    pub tin_to_dem_resolution: f64,
    pub sel_area_size: f64,
    pub tile_scheme: String,
    pub tile_size: u32,
    pub lod_count: u32,
    pub lod_min_distance: f64,
    pub lod_max_distance: f64,
    pub collision: bool,
    pub visual_lods: bool,
    pub dem_blend: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            ortho_resolution: 0.05,
            ortho_render_lowest: 1,
            tin_to_dem_resolution: 0.5,
            sel_area_size: 0.5,
            tile_scheme: "/UTM/WGS84".into(),
            tile_size: 100,
            lod_count: 4,
            lod_min_distance: 250.0,
            lod_max_distance: 2000.0,
            collision: true,
            visual_lods: true,
            dem_blend: false,
        }
    }
}

impl Tunables {
    fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("orthocam_Resolution", self.ortho_resolution.to_string()),
            ("orthocam_Render_Lowest", self.ortho_render_lowest.to_string()),
            ("tin_to_dem_Resolution", self.tin_to_dem_resolution.to_string()),
            ("sel_Area_Size", self.sel_area_size.to_string()),
            ("tile_scheme", self.tile_scheme.clone()),
            ("tile_size", self.tile_size.to_string()),
            ("lod_count", self.lod_count.to_string()),
            ("lod_min_distance", self.lod_min_distance.to_string()),
            ("lod_max_distance", self.lod_max_distance.to_string()),
            ("collision", self.collision.to_string()),
            ("visualLODs", self.visual_lods.to_string()),
            ("dem_blend", self.dem_blend.to_string()),
        ]
    }
}

/// Everything the Reality Mesh processor reads from its settings file.
#[derive(Debug, Clone, PartialEq)]
pub struct RealityMeshSettings {
    pub project_name: String,
    pub source_directory: PathBuf,
    pub utm: Option<UtmZone>,
    pub origin: [f64; 3],
    pub tunables: Tunables,
    pub data_folder: PathBuf,
}

impl RealityMeshSettings {
    /// Builds settings from a parsed sentinel. `source_directory` is the
    /// copied tile output, `data_folder` the one-click hand-off path.
    pub fn from_sentinel(
        sentinel: &CenterPivotOrigin,
        source_directory: impl Into<PathBuf>,
        data_folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            project_name: sentinel.project_name.clone(),
            source_directory: source_directory.into(),
            utm: parse_utm_zone(&sentinel.wkt),
            origin: sentinel.origin,
            tunables: Tunables::default(),
            data_folder: data_folder.into(),
        }
    }

    /// Header entries in file order, before the tunables block.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            ("project_name", self.project_name.clone()),
            ("source_Directory", self.source_directory.display().to_string()),
            ("offset_coordsys", offset_coordsys(self.utm)),
            ("offset_hdatum", "WGS84".to_string()),
            ("offset_vdatum", "WGS84_ellipsoid".to_string()),
            ("offset_x", self.origin[0].to_string()),
            ("offset_y", self.origin[1].to_string()),
            ("offset_z", self.origin[2].to_string()),
        ];
        out.extend(self.tunables.entries());
        out
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.entries() {
            let _ = writeln!(out, "{key}={value}");
        }
        out.push_str("[BiSimOneClickPath]\n");
        let _ = writeln!(out, "path={}", self.data_folder.display());
        out
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        std::fs::write(path, self.render())
    }
}
