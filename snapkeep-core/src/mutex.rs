/*!
Named cross-process mutual exclusion.

A [`MutexRegistry`] hands out [`MutexHandle`]s for lock names inside one lock
directory. The handle releases the lock when dropped, so every exit path of a
guarded run gives it up. Platform calls go through [`LockPlatform`]; the
default [`FlockPlatform`] takes an exclusive `flock` on `<dir>/<name>.lock`
and records the holder's PID in it. A clean release empties the file, so a
non-empty file found on acquisition was left by an instance that died while
holding the lock.
*/

use crate::error::MutexError;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use snapkeep_retry::{poll_until, Attempt, RetryError};
use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

const MAX_LOCK_NAME_LENGTH: usize = 200;

/// State of a lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexState {
    /// Held, and the previous holder released it cleanly
    Success,
    /// Another holder has it; keep waiting
    InProgress,
    /// Held, but a previous holder died without releasing it
    AbandonedRecoverable,
    Busy,
    InvalidName,
    Fatal,
}

impl From<&MutexError> for MutexState {
    fn from(error: &MutexError) -> Self {
        match error {
            MutexError::Busy { .. } => MutexState::Busy,
            MutexError::InvalidName { .. } => MutexState::InvalidName,
            MutexError::Fatal { .. } => MutexState::Fatal,
        }
    }
}

/// Result of one non-blocking lock attempt
pub enum TryLock {
    Acquired {
        lock: Box<dyn HeldLock>,
        abandoned: bool,
    },
    Contended,
}

/// A lock held at the platform level
pub trait HeldLock: Send + fmt::Debug {
    /// Mark the lock cleanly released and give it up
    fn release(self: Box<Self>) -> io::Result<()>;
}

/// Platform operations the registry needs
pub trait LockPlatform: Send + Sync + fmt::Debug {
    /// Create the lock directory if needed and return its canonical path
    fn prepare_dir(&self, dir: &Path) -> io::Result<PathBuf>;

    /// Try once, without blocking, to take the lock at `path`
    fn try_lock(&self, path: &Path) -> io::Result<TryLock>;
}

/// `flock(2)` based locks
#[derive(Debug, Clone, Copy, Default)]
pub struct FlockPlatform;

struct FlockLock {
    path: PathBuf,
    lock: Flock<File>,
}

impl fmt::Debug for FlockLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlockLock").field("path", &self.path).finish()
    }
}

impl HeldLock for FlockLock {
    fn release(self: Box<Self>) -> io::Result<()> {
        let FlockLock { path, lock } = *self;
        lock.set_len(0)?;
        lock.sync_all()?;
        debug!("Released lock {}", path.display());
        // Dropping the Flock unlocks it
        Ok(())
    }
}

impl LockPlatform for FlockPlatform {
    fn prepare_dir(&self, dir: &Path) -> io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        dir.canonicalize()
    }

    fn try_lock(&self, path: &Path) -> io::Result<TryLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_file, errno)) if errno == Errno::EWOULDBLOCK => return Ok(TryLock::Contended),
            Err((_file, errno)) => return Err(io::Error::from(errno)),
        };

        let mut previous = String::new();
        lock.read_to_string(&mut previous)?;
        let abandoned = !previous.trim().is_empty();

        lock.set_len(0)?;
        lock.seek(SeekFrom::Start(0))?;
        writeln!(lock, "{}", std::process::id())?;
        lock.sync_all()?;

        Ok(TryLock::Acquired {
            lock: Box::new(FlockLock {
                path: path.to_path_buf(),
                lock,
            }),
            abandoned,
        })
    }
}

/// Registry of named process locks under one directory
#[derive(Debug, Clone)]
pub struct MutexRegistry {
    lock_dir: PathBuf,
    platform: Arc<dyn LockPlatform>,
    held: Arc<Mutex<HashSet<String>>>,
}

impl MutexRegistry {
    pub fn new<P: Into<PathBuf>>(lock_dir: P) -> Self {
        Self::with_platform(lock_dir, Arc::new(FlockPlatform))
    }

    pub fn with_platform<P: Into<PathBuf>>(lock_dir: P, platform: Arc<dyn LockPlatform>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            platform,
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_path(&self, name: &str) -> Result<PathBuf, MutexError> {
        validate_lock_name(name)?;
        let dir = self.platform.prepare_dir(&self.lock_dir).map_err(|e| MutexError::Fatal {
            name: name.to_string(),
            reason: format!("lock directory {}: {e}", self.lock_dir.display()),
        })?;
        Ok(dir.join(format!("{name}.lock")))
    }

    fn attempt(&self, name: &str, path: &Path) -> io::Result<Option<MutexHandle>> {
        let mut held = self.held();
        if held.contains(name) {
            return Ok(None);
        }

        match self.platform.try_lock(path)? {
            TryLock::Contended => Ok(None),
            TryLock::Acquired { lock, abandoned } => {
                held.insert(name.to_string());
                let state = if abandoned {
                    warn!("Lock '{name}' was abandoned by a previous instance, recovering it");
                    MutexState::AbandonedRecoverable
                } else {
                    MutexState::Success
                };
                Ok(Some(MutexHandle {
                    name: name.to_string(),
                    state,
                    lock: Some(lock),
                    held: Arc::clone(&self.held),
                }))
            }
        }
    }

    /// Make one non-blocking attempt.
    ///
    /// Returns [`MutexState::InProgress`] without a handle while another
    /// holder has the lock.
    pub fn try_acquire(&self, name: &str) -> (MutexState, Option<MutexHandle>) {
        let path = match self.lock_path(name) {
            Ok(path) => path,
            Err(e) => return (MutexState::from(&e), None),
        };
        match self.attempt(name, &path) {
            Ok(Some(handle)) => (handle.state(), Some(handle)),
            Ok(None) => (MutexState::InProgress, None),
            Err(e) => {
                warn!("Lock '{name}' failed: {e}");
                (MutexState::Fatal, None)
            }
        }
    }

    /// Wait up to `timeout` for the lock.
    ///
    /// Blocks the calling thread between attempts.
    pub fn acquire(&self, name: &str, timeout: Duration) -> Result<MutexHandle, MutexError> {
        let path = self.lock_path(name)?;

        let outcome = poll_until("process lock", timeout, |attempt| match self.attempt(name, &path) {
            Ok(Some(handle)) => Attempt::Ready(handle),
            Ok(None) => {
                if attempt == 1 {
                    info!("Lock '{name}' is held elsewhere, waiting up to {timeout:?}");
                }
                Attempt::Pending
            }
            Err(e) => Attempt::Failed(Box::new(e)),
        });

        match outcome {
            Ok(handle) => {
                debug!("Acquired lock '{name}' at {}", path.display());
                Ok(handle)
            }
            Err(RetryError::DeadlineExceeded { .. }) => Err(MutexError::Busy {
                name: name.to_string(),
            }),
            Err(RetryError::Permanent { source, .. }) => Err(MutexError::Fatal {
                name: name.to_string(),
                reason: source.to_string(),
            }),
        }
    }
}

/// Lock names become file names, so they are restricted to a safe alphabet
pub fn validate_lock_name(name: &str) -> Result<(), MutexError> {
    let invalid = |reason: &str| MutexError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_LOCK_NAME_LENGTH {
        return Err(invalid("name is too long"));
    }
    if name.starts_with('.') {
        return Err(invalid("name cannot start with '.'"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("only letters, digits, '-', '_' and '.' are allowed"));
    }
    Ok(())
}

/// A held named lock, released on drop
#[derive(Debug)]
pub struct MutexHandle {
    name: String,
    state: MutexState,
    lock: Option<Box<dyn HeldLock>>,
    held: Arc<Mutex<HashSet<String>>>,
}

impl MutexHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// [`MutexState::Success`] or [`MutexState::AbandonedRecoverable`]
    pub fn state(&self) -> MutexState {
        self.state
    }

    pub fn is_held(&self) -> bool {
        self.lock.is_some()
    }

    /// Give up the lock. Releasing twice is a no-op.
    pub fn release(&mut self) -> io::Result<()> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.name);
        lock.release()
    }
}

impl Drop for MutexHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release lock '{}' cleanly: {e}", self.name);
        }
    }
}
