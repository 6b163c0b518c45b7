//! Reality Mesh hand-off formats shared between the PhotoMesh build
//! orchestrator and the downstream processor.
//!
//! - `Output-CenterPivotOrigin.json`: written once by the Wizard into the
//!   build folder when a build completes. Carries the project name, the
//!   centre-pivot origin and the WKT of the output coordinate system.
//! - `<project>-settings.txt`: the key=value file consumed by the Reality
//!   Mesh processor script.
//! - Processor stdout: free-form lines, some of which carry progress.
//!
//! Sentinel layout (UTF-8 JSON, optional BOM):
//!   {
//!     "project_name": "<string>",
//!     "Origin": [x, y, z],
//!     "WKT": "PROJCS[\"WGS 84 / UTM zone 33S\", ... UTM zone 33, Southern ...]"
//!   }
//!
//! Settings layout (one `key=value` per line, order is significant):
//!   project_name, source_Directory,
//!   offset_coordsys, offset_hdatum, offset_vdatum,
//!   offset_x, offset_y, offset_z,
//!   <tunable defaults>,
//!   [BiSimOneClickPath]
//!   path=<data folder>

pub mod progress;
pub mod sentinel;
pub mod settings;

pub use progress::parse_progress;
pub use sentinel::{parse_sentinel, read_sentinel, CenterPivotOrigin, SENTINEL_FILE_NAME};
pub use settings::{
    offset_coordsys, parse_utm_zone, Hemisphere, RealityMeshSettings, Tunables, UtmZone,
};

/// Errors raised while reading Reality Mesh hand-off files.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed sentinel JSON: {0}")]
    Sentinel(#[from] serde_json::Error),
}
