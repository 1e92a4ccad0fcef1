//! Advisory `flock(2)` locks.
//!
//! Locks are released when the guard drops (or the process dies), so a killed
//! daemon never leaves a workspace wedged.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

/// Held exclusive lock on a lock file.
pub struct FileLock {
    guard: Flock<File>,
    path: PathBuf,
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the lock file contents (used to record the daemon pid).
    pub fn write_note(&mut self, note: &str) -> io::Result<()> {
        self.guard.set_len(0)?;
        self.guard.rewind()?;
        self.guard.write_all(note.as_bytes())?;
        self.guard.flush()
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Block until an exclusive lock on `path` is held.
pub fn lock_exclusive(path: &Path) -> io::Result<FileLock> {
    let file = open_lock_file(path)?;
    let guard = Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| io::Error::from(errno))?;
    debug!(path = %path.display(), "lock acquired");
    Ok(FileLock {
        guard,
        path: path.to_path_buf(),
    })
}

/// Take an exclusive lock without waiting. `None` means another process holds it.
pub fn try_lock_exclusive(path: &Path) -> io::Result<Option<FileLock>> {
    let file = open_lock_file(path)?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(guard) => Ok(Some(FileLock {
            guard,
            path: path.to_path_buf(),
        })),
        Err((_, Errno::EWOULDBLOCK)) => Ok(None),
        Err((_, errno)) => Err(io::Error::from(errno)),
    }
}
