//! Serialization around container runs.
//!
//! Some engine/runtime combinations race when several containers start at
//! once and rewrite the same kernel parameter. The container runtime asks its
//! injected [`RunGate`] for exclusive access around each attempt when the
//! engine reports the hazard is live.

use crate::RuntimeError;
use fs2::FileExt;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Exclusive advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    fn open(path: &Path) -> std::io::Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
    }

    /// Block until the lock is held.
    pub fn acquire(path: &Path) -> std::io::Result<Self> {
        let file = Self::open(path)?;
        file.lock_exclusive()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock only if nobody else holds it.
    pub fn try_acquire(path: &Path) -> std::io::Result<Option<Self>> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(_) => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Anything kept alive for the duration of a gated section.
pub trait Held {}
impl<T> Held for T {}

/// Proof of exclusive access; the gate reopens when this is dropped.
pub struct RunGateGuard<'a> {
    held: Option<Box<dyn Held + 'a>>,
}

impl<'a> RunGateGuard<'a> {
    pub fn new(held: impl Held + 'a) -> Self {
        Self {
            held: Some(Box::new(held)),
        }
    }

    /// A guard that protects nothing.
    pub fn none() -> Self {
        Self { held: None }
    }

    pub fn is_holding(&self) -> bool {
        self.held.is_some()
    }
}

impl fmt::Debug for RunGateGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunGateGuard")
            .field("holding", &self.is_holding())
            .finish()
    }
}

pub trait RunGate: Send + Sync {
    fn acquire(&self) -> Result<RunGateGuard<'_>, RuntimeError>;
}

static PROCESS_GATE: Mutex<()> = Mutex::new(());

/// Gate shared by every instance in the process, optionally extended across
/// processes with a lock file. When the lock file cannot be used the gate
/// still serializes within this process.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunGate {
    lock_path: Option<PathBuf>,
}

impl ProcessRunGate {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }
}

impl RunGate for ProcessRunGate {
    fn acquire(&self) -> Result<RunGateGuard<'_>, RuntimeError> {
        let mutex = PROCESS_GATE.lock().unwrap_or_else(PoisonError::into_inner);
        let file = match &self.lock_path {
            Some(path) => match FileLock::acquire(path) {
                Ok(lock) => Some(lock),
                Err(e) => {
                    warn!(
                        "run gate lock file {} unusable, serializing in-process only: {e}",
                        path.display()
                    );
                    None
                }
            },
            None => None,
        };
        debug!("run gate acquired");
        Ok(RunGateGuard::new((mutex, file)))
    }
}

/// Never blocks. For tests and engines known to be free of the hazard.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRunGate;

impl RunGate for NoopRunGate {
    fn acquire(&self) -> Result<RunGateGuard<'_>, RuntimeError> {
        Ok(RunGateGuard::none())
    }
}
