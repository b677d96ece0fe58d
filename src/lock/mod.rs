//! Single-instance lock for the dashboard.
//!
//! The primary mechanism is an advisory exclusive lock on `lock_path`, which
//! the kernel drops when the holder dies. Where the file system cannot do
//! advisory locking, a PID file at `pid_path` stands in, with liveness checked
//! by sending signal 0 to the recorded PID.

pub mod conflict;

pub use conflict::{handle_conflict, ConflictAction, ConflictOutcome};

use fs2::FileExt;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LockError {
    /// An OS error that is not contention, e.g. permission denied
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub lock_path: PathBuf,
    pub pid_path: PathBuf,
    pub locked: bool,
    pub holder_pid: Option<u32>,
}

/// Result of a single acquisition attempt
enum Attempt {
    Acquired(File),
    Contended,
    /// The file system refused advisory locking; use the PID file
    Unsupported,
    /// Something flaky happened; try again next round
    Retry,
}

#[derive(Default)]
struct Held {
    file: Option<File>,
    active: bool,
}

/// Process-lifetime handle on the dashboard's instance lock.
///
/// Independent instances bound to the same paths exclude each other, also
/// within one process, since each holds its own open file description.
pub struct InstanceLock {
    lock_path: PathBuf,
    pid_path: PathBuf,
    held: Mutex<Held>,
}

impl InstanceLock {
    pub fn new(lock_path: impl Into<PathBuf>, pid_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
            pid_path: pid_path.into(),
            held: Mutex::new(Held::default()),
        }
    }

    /// Try to become the only dashboard, polling until `timeout` runs out.
    ///
    /// Contention is `Ok(false)`; only unexpected OS errors are `Err`. A
    /// timeout too large to represent waits indefinitely.
    pub fn acquire(&self, timeout: Duration) -> Result<bool, LockError> {
        if self.state().active {
            return Ok(true);
        }

        for path in [&self.lock_path, &self.pid_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|source| LockError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.try_acquire_once()? {
                return Ok(true);
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(lock = %self.lock_path.display(), "instance lock timed out");
                        return Ok(false);
                    }
                    POLL_INTERVAL.min(deadline - now)
                }
                None => POLL_INTERVAL,
            };
            std::thread::sleep(pause);
        }
    }

    fn try_acquire_once(&self) -> Result<bool, LockError> {
        let mut held = self.state();
        if held.active {
            return Ok(true);
        }
        match self.try_native()? {
            Attempt::Acquired(file) => {
                held.file = Some(file);
                held.active = true;
                if let Err(e) = fs::write(&self.pid_path, format!("{}\n", std::process::id())) {
                    warn!(path = %self.pid_path.display(), error = %e, "failed to write pid file");
                }
                info!(pid = std::process::id(), "instance lock acquired");
                Ok(true)
            }
            Attempt::Unsupported => {
                if self.try_pid_file()? {
                    held.active = true;
                    info!(pid = std::process::id(), "instance lock acquired via pid file");
                    return Ok(true);
                }
                Ok(false)
            }
            Attempt::Contended | Attempt::Retry => Ok(false),
        }
    }

    /// Safe to call any number of times, held or not
    pub fn release(&self) {
        let mut held = self.state();
        if let Some(mut file) = held.file.take() {
            let _ = file.set_len(0).and_then(|_| file.flush());
            let _ = FileExt::unlock(&file);
        }
        if !held.active {
            return;
        }
        held.active = false;

        if read_pid(&self.pid_path) == Some(std::process::id()) {
            if let Err(e) = fs::remove_file(&self.pid_path) {
                debug!(path = %self.pid_path.display(), error = %e, "failed to remove pid file");
            }
        }
        info!("instance lock released");
    }

    /// Whether any instance, this one included, holds the lock
    pub fn is_locked(&self) -> bool {
        if self.state().active {
            return true;
        }

        if let Ok(file) = File::open(&self.lock_path) {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    let _ = FileExt::unlock(&file);
                    return false;
                }
                Err(e) if is_contended(&e) => return true,
                Err(e) => debug!(error = %e, "lock probe inconclusive, checking pid file"),
            }
        }

        read_pid(&self.pid_path).is_some_and(pid_alive)
    }

    pub fn get_lock_info(&self) -> LockInfo {
        LockInfo {
            lock_path: self.lock_path.clone(),
            pid_path: self.pid_path.clone(),
            locked: self.is_locked(),
            holder_pid: read_pid(&self.lock_path).or_else(|| read_pid(&self.pid_path)),
        }
    }

    /// Delete both lock artifacts; only meaningful when nobody holds the lock
    pub fn remove_stale_files(&self) {
        for path in [&self.lock_path, &self.pid_path] {
            match fs::remove_file(path) {
                Ok(()) => info!(path = %path.display(), "removed stale lock file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale lock file"),
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, Held> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn io_error(&self, path: &Path, source: io::Error) -> LockError {
        LockError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn try_native(&self) -> Result<Attempt, LockError> {
        // No truncate: the current holder's PID must survive until we own the lock
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
        {
            Ok(file) => file,
            Err(e) if is_fatal(&e) => return Err(self.io_error(&self.lock_path, e)),
            Err(e) => {
                debug!(error = %e, "cannot open lock file, using pid file");
                return Ok(Attempt::Unsupported);
            }
        };

        match file.try_lock_exclusive() {
            Ok(()) => {
                let mut file = file;
                file.set_len(0)
                    .and_then(|_| writeln!(file, "{}", std::process::id()))
                    .and_then(|_| file.flush())
                    .map_err(|e| self.io_error(&self.lock_path, e))?;
                Ok(Attempt::Acquired(file))
            }
            Err(e) if is_contended(&e) => Ok(Attempt::Contended),
            Err(e) if is_unsupported(&e) => Ok(Attempt::Unsupported),
            Err(e) => {
                debug!(error = %e, "transient lock error");
                Ok(Attempt::Retry)
            }
        }
    }

    /// PID-file protocol: claim the file if it is absent or names a dead process
    fn try_pid_file(&self) -> Result<bool, LockError> {
        match fs::read_to_string(&self.pid_path) {
            Ok(content) => {
                if content.trim().parse::<u32>().is_ok_and(pid_alive) {
                    return Ok(false);
                }
                match fs::remove_file(&self.pid_path) {
                    Ok(()) => info!(path = %self.pid_path.display(), "reclaimed stale pid file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) if is_fatal(&e) => return Err(self.io_error(&self.pid_path, e)),
                    Err(_) => return Ok(false),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) if is_fatal(&e) => return Err(self.io_error(&self.pid_path, e)),
            Err(_) => return Ok(false),
        }

        // create_new so two fallback contenders cannot both win
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.pid_path)
        {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())
                    .map_err(|e| self.io_error(&self.pid_path, e))?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) if is_fatal(&e) => Err(self.io_error(&self.pid_path, e)),
            Err(_) => Ok(false),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
        .filter(|pid| *pid > 0)
}

/// Signal-0 probe; EPERM still means the process exists
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
        || matches!(e.raw_os_error(), Some(code) if code == Errno::EAGAIN as i32 || code == Errno::EACCES as i32)
}

fn is_unsupported(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Unsupported
        || matches!(
            e.raw_os_error(),
            Some(code) if code == Errno::ENOLCK as i32 || code == Errno::EOPNOTSUPP as i32
        )
}

/// Errors that retrying will not fix
fn is_fatal(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::PermissionDenied
        || matches!(
            e.raw_os_error(),
            Some(code) if code == Errno::EROFS as i32 || code == Errno::ENOSPC as i32
        )
}
