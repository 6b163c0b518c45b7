use once_cell::sync::Lazy;
use regex::Regex;

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Progress:\s*(\d+)\s*%").expect("valid progress regex"));
static TILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Tile\s+(\d+)\s+of\s+(\d+)").expect("valid tile regex"));

/// Extracts a completion percentage from one line of processor output.
///
/// Recognises `Progress: <d>%` and `Tile <done> of <total>`. A tile line
/// with a zero total carries no progress. Results are clamped to 0..=100.
pub fn parse_progress(line: &str) -> Option<f64> {
    if let Some(caps) = PERCENT_RE.captures(line) {
        let pct: f64 = caps[1].parse().ok()?;
        return Some(pct.clamp(0.0, 100.0));
    }
    if let Some(caps) = TILE_RE.captures(line) {
        let done: f64 = caps[1].parse().ok()?;
        let total: f64 = caps[2].parse().ok()?;
        if total == 0.0 {
            return None;
        }
        return Some((done / total * 100.0).clamp(0.0, 100.0));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_lines() {
        assert_eq!(parse_progress("[12:00:01] Progress: 0%"), Some(0.0));
        assert_eq!(parse_progress("Progress: 100%"), Some(100.0));
        assert_eq!(parse_progress("Progress:42 %"), Some(42.0));
    }

    #[test]
    fn tile_lines() {
        assert_eq!(parse_progress("Tile 3 of 4"), Some(75.0));
        assert_eq!(parse_progress("Exporting Tile 1 of 0"), None);
    }

    #[test]
    fn unrelated_lines() {
        assert_eq!(parse_progress("Loading mesh..."), None);
        assert_eq!(parse_progress(""), None);
    }
}
