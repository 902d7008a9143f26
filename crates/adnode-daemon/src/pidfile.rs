//! PID file read by the external process manager.
//!
//! Written atomically (temp file in the same directory, fsync, rename) so
//! the manager never reads a half-written PID. After a handover the
//! successor rewrites the file; the predecessor then leaves it alone.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Writes our PID to `path`.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the file cannot
/// be written and renamed into place.
pub fn write_pid_file(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create PID directory {}", dir.display()))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("cannot create temp file in {}", dir.display()))?;
    temp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o644))
        .context("cannot set permissions on temp PID file")?;
    writeln!(temp.as_file_mut(), "{}", std::process::id()).context("cannot write PID")?;
    temp.as_file().sync_all().context("cannot sync PID file")?;
    temp.persist(path)
        .with_context(|| format!("cannot persist PID file {}", path.display()))?;

    info!(path = %path.display(), "PID file written");
    Ok(())
}

/// Removes the PID file if it still names this process.
pub fn remove_pid_file(path: &Path) {
    match read_pid_file(path) {
        Some(pid) if pid == std::process::id() => {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove PID file");
            }
        },
        Some(pid) => info!(
            path = %path.display(),
            owner = pid,
            "PID file belongs to another process"
        ),
        None => {},
    }
}

/// PID recorded in `path`, if any.
#[must_use]
pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
