//! Cross-process exclusive lock over the credential file.
//!
//! The lock is a create-only file holding the holder's PID. A waiter that finds
//! the file owned by a dead process removes it and retries; otherwise it backs
//! off until the configured timeout and then fails. Removal of a stale file is
//! serialized through an advisory lock on a sibling `.reclaim` file, and the
//! holder is re-checked under it, so a waiter never deletes a live lock.

use super::persistence::ensure_private_dir;
use std::fs;
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lock acquisition errors
#[derive(Debug)]
pub enum LockError {
    /// Another live process held the lock for the whole timeout
    Timeout { path: PathBuf, waited: Duration },
    /// Filesystem failure while creating, reading or removing the lock file
    Io(io::Error),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Timeout { path, waited } => write!(
                f,
                "Timed out after {:?} waiting for lock {}",
                waited,
                path.display()
            ),
            LockError::Io(e) => write!(f, "Lock file error: {}", e),
        }
    }
}

impl std::error::Error for LockError {}

impl From<io::Error> for LockError {
    fn from(e: io::Error) -> Self {
        LockError::Io(e)
    }
}

/// Lock file settings. Cheap to clone; holds no OS resources itself.
#[derive(Clone, Debug)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    retry_interval: Duration,
}

/// Held lock. Dropping it deletes the lock file.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Lock file vanished while held");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to release lock file");
            }
        }
    }
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration, retry_interval: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            retry_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires the lock, reclaiming it from dead holders.
    ///
    /// # Errors
    /// - `Timeout` if a live process keeps the lock past the timeout
    /// - `Io` on unexpected filesystem errors
    pub async fn acquire(&self) -> Result<LockGuard, LockError> {
        let started = Instant::now();

        loop {
            match self.try_create() {
                Ok(guard) => return Ok(guard),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(LockError::Io(e)),
            }

            if self.reclaim_if_stale()? {
                continue;
            }

            let waited = started.elapsed();
            if waited >= self.timeout {
                warn!(path = %self.path.display(), ?waited, "Lock acquisition timed out");
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    waited,
                });
            }

            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn try_create(&self) -> io::Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            ensure_private_dir(parent)?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.path)?;
        // From here on the guard owns the file, so a failed write still releases it
        let guard = LockGuard {
            path: self.path.clone(),
        };
        file.write_all(std::process::id().to_string().as_bytes())?;
        Ok(guard)
    }

    /// Returns true if the lock file is gone or was removed as stale.
    fn reclaim_if_stale(&self) -> Result<bool, LockError> {
        let Some(holder) = self.read_holder()? else {
            return Ok(true);
        };
        if !self.is_stale(&holder)? {
            return Ok(false);
        }

        // Only the waiter holding the reclaim lock may delete a stale lock file
        let Some(_reclaim) = self.try_reclaim_lock()? else {
            debug!(path = %self.path.display(), "Another waiter is reclaiming the lock");
            return Ok(false);
        };

        // Another waiter may have replaced the stale file before we got here
        let Some(holder) = self.read_holder()? else {
            return Ok(true);
        };
        if !self.is_stale(&holder)? {
            return Ok(false);
        }

        warn!(
            path = %self.path.display(),
            holder = %holder,
            "Removing stale lock file"
        );
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Trimmed PID body of the lock file, `None` if there is no lock file.
    fn read_holder(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn is_stale(&self, holder: &str) -> io::Result<bool> {
        match holder.parse::<i32>() {
            Ok(pid) => Ok(!process_alive(pid)),
            // Holder died between creating the file and writing its PID
            Err(_) => Ok(self.lock_age()? > self.timeout),
        }
    }

    fn reclaim_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".reclaim");
        self.path.with_file_name(name)
    }

    /// Non-blocking `flock` on the sibling `.reclaim` file. The kernel drops it
    /// when the holder exits, so it never goes stale.
    #[cfg(unix)]
    fn try_reclaim_lock(&self) -> io::Result<Option<ReclaimGuard>> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(self.reclaim_path())?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => Ok(Some(guard)),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(io::Error::from(errno)),
        }
    }

    #[cfg(not(unix))]
    fn try_reclaim_lock(&self) -> io::Result<Option<ReclaimGuard>> {
        Ok(Some(()))
    }

    fn lock_age(&self) -> io::Result<Duration> {
        let modified = match fs::metadata(&self.path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Duration::ZERO),
            Err(e) => return Err(e),
        };
        Ok(modified.elapsed().unwrap_or_default())
    }
}

#[cfg(unix)]
type ReclaimGuard = nix::fcntl::Flock<fs::File>;

#[cfg(not(unix))]
type ReclaimGuard = ();

/// Probes a PID with signal 0 (no signal is delivered).
#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid <= 0 {
        return false;
    }

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: alive but owned by someone else
        Err(e) => {
            debug!(pid, error = %e, "PID probe inconclusive, assuming alive");
            true
        }
    }
}

#[cfg(not(unix))]
fn process_alive(pid: i32) -> bool {
    pid > 0
}
