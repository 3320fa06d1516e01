//! Durable file writes
//!
//! Every persisted file goes through the same protocol: write to a hidden
//! temp sibling, flush and fsync, normalize permissions, then atomically
//! rename into place. A reader (or a crashed run) never observes a
//! partially written file under its final name.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

/// Writes `contents` to `path` atomically
///
/// Parent directories are created as needed. The temp sibling lives in the
/// destination directory so the final rename never crosses filesystems.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let basename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("outfile");
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", basename))
        .tempfile_in(dir)?;

    tmp.write_all(contents)?;
    sync_and_rename(tmp, path)
}

fn sync_and_rename(mut tmp: NamedTempFile, path: &Path) -> std::io::Result<()> {
    tmp.flush()?;
    tmp.as_file().sync_all()?;

    // Temp files are created 0600; saved files should be world-readable
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Durably creates an empty marker file in `dir`
///
/// The directory inode is synced before and after the marker write, so a
/// crash immediately afterwards cannot leave the marker's presence
/// ambiguous.
pub fn write_marker_durable(dir: &Path, name: &str) -> std::io::Result<()> {
    let dirf = File::open(dir)?;
    dirf.sync_all()?;

    write_atomic(&dir.join(name), b"")?;

    dirf.sync_all()?;
    Ok(())
}

/// Whether an IO error means the disk ran out of space
pub fn is_disk_full(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::StorageFull || e.raw_os_error() == Some(28)
}
