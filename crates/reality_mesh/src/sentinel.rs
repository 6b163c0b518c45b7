use crate::FormatError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name the Wizard writes into the build folder on completion.
pub const SENTINEL_FILE_NAME: &str = "Output-CenterPivotOrigin.json";

/// Contents of the build-completion sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CenterPivotOrigin {
    pub project_name: String,
    /// Centre-pivot origin in the output CRS, `[x, y, z]`.
    #[serde(rename = "Origin")]
    pub origin: [f64; 3],
    /// Output coordinate system. Older Wizard builds omit it.
    #[serde(rename = "WKT", default)]
    pub wkt: String,
}

/// Parses sentinel bytes. A leading UTF-8 BOM is tolerated since the
/// Wizard writes through .NET's default encoder.
pub fn parse_sentinel(bytes: &[u8]) -> Result<CenterPivotOrigin, FormatError> {
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    Ok(serde_json::from_slice(body)?)
}

pub fn read_sentinel<P: AsRef<Path>>(path: P) -> Result<CenterPivotOrigin, FormatError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| FormatError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_sentinel(&bytes)
}
