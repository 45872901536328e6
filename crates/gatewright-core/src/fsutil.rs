use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::warn;

/// Write `contents` to `path` through a temp file in the same directory so a
/// reader never sees a half-written file. Parent directories are created.
///
/// A file being replaced keeps its permission bits and, on unix, its owner
/// and group. `mode` (default 0644) only applies to a newly created file.
pub fn write_atomic(path: &Path, contents: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let existing = match std::fs::metadata(path) {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let mode = match &existing {
            Some(meta) => {
                let current = tmp.as_file().metadata()?;
                if (current.uid(), current.gid()) != (meta.uid(), meta.gid()) {
                    if let Err(e) =
                        std::os::unix::fs::chown(tmp.path(), Some(meta.uid()), Some(meta.gid()))
                    {
                        warn!(path = %path.display(), error = %e, "could not keep owner of replaced file");
                    }
                }
                meta.permissions().mode() & 0o7777
            }
            None => mode.unwrap_or(0o644),
        };
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        if let Some(meta) = &existing {
            std::fs::set_permissions(tmp.path(), meta.permissions())?;
        }
    }

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Point `link` at `target`, replacing whatever is at `link`. A link that
/// already points at `target` is left alone. Returns whether anything changed.
pub fn ensure_symlink(target: &Path, link: &Path) -> std::io::Result<bool> {
    if let Ok(current) = std::fs::read_link(link) {
        if current == target {
            return Ok(false);
        }
    }

    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::symlink_metadata(link) {
        Ok(_) => std::fs::remove_file(link)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link)?;
    #[cfg(not(unix))]
    return Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symbolic links are only supported on unix",
    ));
    #[cfg(unix)]
    Ok(true)
}

/// Remove `path` if it exists (file or link). Returns whether it existed.
pub fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => {
            std::fs::remove_file(path)?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
