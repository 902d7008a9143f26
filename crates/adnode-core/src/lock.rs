//! Host-wide single-instance lock.
//!
//! The lock is an exclusive `flock` on a file under the runtime directory.
//! It belongs to the open file description rather than the process, which
//! is what makes the update handover work: the new process inherits the
//! descriptor across `exec`, the old process closes its copy without
//! unlocking, and the lock never becomes free in between.
//!
//! The holder's PID is written into the file for diagnostics only; the
//! `flock` is the sole source of truth.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use tracing::{debug, info};

/// Lock failures.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another node instance holds the lock.
    #[error(
        "another adnode instance is running (lock {}, {})",
        .path.display(),
        describe_holder(.holder_pid)
    )]
    InstanceConflict {
        /// Lock file.
        path: PathBuf,
        /// PID recorded by the holder, if readable.
        holder_pid: Option<u32>,
    },

    /// Filesystem or descriptor failure.
    #[error("lock file {}: {source}", .path.display())]
    Io {
        /// Lock file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// The held single-instance lock.
///
/// Dropping closes this process's descriptor. If a handed-over child still
/// holds an inherited copy, the lock stays held by the child.
#[derive(Debug)]
pub struct NodeInstanceLock {
    file: File,
    path: PathBuf,
}

impl NodeInstanceLock {
    /// Takes the lock or fails fast.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InstanceConflict`] if another process holds it.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| io_error(path, source))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|source| io_error(path, source))?;

        match file.try_lock_exclusive() {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(LockError::InstanceConflict {
                    path: path.to_path_buf(),
                    holder_pid: read_pid(&file),
                });
            },
            Err(source) => return Err(io_error(path, source)),
        }

        let mut lock = Self {
            file,
            path: path.to_path_buf(),
        };
        lock.record_pid()?;
        info!(path = %path.display(), "instance lock acquired");
        Ok(lock)
    }

    /// Takes ownership of a lock descriptor inherited from the previous
    /// process during handover.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InstanceConflict`] if the descriptor does not
    /// carry the lock.
    pub fn adopt_inherited(fd: OwnedFd, path: &Path) -> Result<Self, LockError> {
        let file = File::from(fd);
        // Re-locking through the same open file description succeeds if and
        // only if that description already holds the lock.
        match file.try_lock_exclusive() {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(LockError::InstanceConflict {
                    path: path.to_path_buf(),
                    holder_pid: read_pid(&file),
                });
            },
            Err(source) => return Err(io_error(path, source)),
        }
        set_inheritable(file.as_raw_fd(), false).map_err(|source| io_error(path, source))?;
        debug!(path = %path.display(), "adopted inherited instance lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw descriptor, for passing to a handover child.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Rewrites the PID recorded in the lock file with ours.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn record_pid(&mut self) -> Result<(), LockError> {
        write_pid(&mut self.file, std::process::id()).map_err(|source| io_error(&self.path, source))
    }

    /// Unlocks and closes. Use on ordinary shutdown only; after a handover
    /// use [`Self::hand_over`] instead, since unlocking here would unlock
    /// the shared description the child holds.
    ///
    /// # Errors
    ///
    /// Returns an error if unlocking fails.
    pub fn release(self) -> Result<(), LockError> {
        FileExt::unlock(&self.file).map_err(|source| io_error(&self.path, source))?;
        info!(path = %self.path.display(), "instance lock released");
        Ok(())
    }

    /// Closes this process's descriptor, leaving the lock with the child.
    pub fn hand_over(self) {
        debug!(path = %self.path.display(), "instance lock handed over");
        drop(self.file);
    }
}

/// Sets or clears `FD_CLOEXEC` on a descriptor.
///
/// # Errors
///
/// Returns the OS error from `fcntl`.
pub fn set_inheritable(fd: RawFd, inheritable: bool) -> std::io::Result<()> {
    let flags = if inheritable {
        FdFlag::empty()
    } else {
        FdFlag::FD_CLOEXEC
    };
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(std::io::Error::from)?;
    Ok(())
}

fn write_pid(file: &mut File, pid: u32) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{pid}")?;
    file.sync_all()
}

#[allow(clippy::ref_option)]
fn describe_holder(pid: &Option<u32>) -> String {
    pid.map_or_else(|| "holder pid unknown".to_string(), |pid| format!("held by pid {pid}"))
}

fn read_pid(file: &File) -> Option<u32> {
    let mut contents = String::new();
    let mut reader = file.try_clone().ok()?;
    reader.seek(SeekFrom::Start(0)).ok()?;
    reader.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn io_error(path: &Path, source: std::io::Error) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn second_acquire_conflicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("adnode.lock");

        let held = NodeInstanceLock::acquire(&path).unwrap();
        match NodeInstanceLock::acquire(&path) {
            Err(LockError::InstanceConflict { holder_pid, .. }) => {
                assert_eq!(holder_pid, Some(std::process::id()));
            },
            other => panic!("expected conflict, got {other:?}"),
        }

        held.release().unwrap();
        NodeInstanceLock::acquire(&path).unwrap();
    }

    #[test]
    fn drop_frees_lock_without_inheritors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("adnode.lock");
        drop(NodeInstanceLock::acquire(&path).unwrap());
        NodeInstanceLock::acquire(&path).unwrap();
    }

    #[test]
    fn duplicated_descriptor_keeps_lock_across_hand_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("adnode.lock");

        let parent = NodeInstanceLock::acquire(&path).unwrap();
        let inherited: OwnedFd = parent.file.try_clone().unwrap().into();
        parent.hand_over();

        assert!(matches!(
            NodeInstanceLock::acquire(&path),
            Err(LockError::InstanceConflict { .. })
        ));

        let child = NodeInstanceLock::adopt_inherited(inherited, &path).unwrap();
        assert!(matches!(
            NodeInstanceLock::acquire(&path),
            Err(LockError::InstanceConflict { .. })
        ));
        child.release().unwrap();
        NodeInstanceLock::acquire(&path).unwrap();
    }

    #[test]
    fn adopting_foreign_descriptor_conflicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("adnode.lock");
        let other = NodeInstanceLock::acquire(&path).unwrap();

        let stray = File::open(&path).unwrap();
        assert!(matches!(
            NodeInstanceLock::adopt_inherited(stray.into(), &path),
            Err(LockError::InstanceConflict { .. })
        ));
        drop(other);
    }
}
