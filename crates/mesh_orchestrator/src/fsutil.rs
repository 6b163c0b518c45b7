//! Filesystem helpers shared by every component that owns persistent state.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use walkdir::WalkDir;

/// Replaces `path` with `bytes` via a sibling temp file: write, fsync,
/// rename. Readers see either the old or the new content, never a prefix.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Writes only when the content differs, so repeated enforcement leaves
/// mtimes untouched. Returns whether a write happened.
pub fn write_if_changed(path: &Path, bytes: &[u8]) -> io::Result<bool> {
    match fs::read(path) {
        Ok(existing) if existing == bytes => Ok(false),
        _ => {
            atomic_write(path, bytes)?;
            Ok(true)
        }
    }
}

/// Recursively copies `src` into `dst`, creating `dst` as needed.
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}
