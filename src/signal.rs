//! Ready/shutdown signals observable across the execution-context boundary.
//!
//! A [`Signal`] is a cloneable handle over an [`Event`]. Thread-backed units
//! use [`MemoryEvent`] (mutex + condvar); process-backed units use
//! [`FileEvent`], a marker file both sides can see.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const FILE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A binary flag with set/clear semantics.
pub trait Event: Send + Sync {
    fn set(&self);
    fn clear(&self);
    fn is_set(&self) -> bool;
    /// Whether the flag was set at least once, even if cleared since.
    fn has_fired(&self) -> bool;
    /// Blocks until set or the timeout elapses; returns the final state.
    fn wait(&self, timeout: Option<Duration>) -> bool;
}

#[derive(Clone)]
pub struct Signal {
    event: Arc<dyn Event>,
}

impl Signal {
    pub fn in_memory() -> Self {
        Self::from_event(Arc::new(MemoryEvent::default()))
    }

    pub fn file_backed(path: impl Into<PathBuf>) -> Self {
        Self::from_event(Arc::new(FileEvent::new(path)))
    }

    pub fn from_event(event: Arc<dyn Event>) -> Self {
        Self { event }
    }

    pub fn set(&self) {
        self.event.set()
    }

    pub fn clear(&self) {
        self.event.clear()
    }

    pub fn is_set(&self) -> bool {
        self.event.is_set()
    }

    pub fn has_fired(&self) -> bool {
        self.event.has_fired()
    }

    pub fn wait_until_set(&self, timeout: Option<Duration>) -> bool {
        self.event.wait(timeout)
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("set", &self.is_set())
            .field("fired", &self.has_fired())
            .finish()
    }
}

#[derive(Default)]
struct Flags {
    set: bool,
    fired: bool,
}

/// In-process event for units that share memory with the parent.
#[derive(Default)]
pub struct MemoryEvent {
    flags: Mutex<Flags>,
    changed: Condvar,
}

impl MemoryEvent {
    fn flags(&self) -> std::sync::MutexGuard<'_, Flags> {
        // A poisoned flag is still a valid flag.
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Event for MemoryEvent {
    fn set(&self) {
        let mut flags = self.flags();
        flags.set = true;
        flags.fired = true;
        self.changed.notify_all();
    }

    fn clear(&self) {
        self.flags().set = false;
    }

    fn is_set(&self) -> bool {
        self.flags().set
    }

    fn has_fired(&self) -> bool {
        self.flags().fired
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let flags = self.flags();
        match timeout {
            None => {
                let flags = self
                    .changed
                    .wait_while(flags, |f| !f.set)
                    .unwrap_or_else(|e| e.into_inner());
                flags.set
            }
            Some(timeout) => {
                let (flags, _) = self
                    .changed
                    .wait_timeout_while(flags, timeout, |f| !f.set)
                    .unwrap_or_else(|e| e.into_inner());
                flags.set
            }
        }
    }
}

/// Cross-process event backed by marker files.
///
/// `<path>` exists while the event is set; `<path>.fired` records that it
/// was ever set.
pub struct FileEvent {
    path: PathBuf,
    fired_path: PathBuf,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut fired = path.clone().into_os_string();
        fired.push(".fired");
        Self {
            path,
            fired_path: PathBuf::from(fired),
        }
    }

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, b"1") {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write signal file");
        }
    }
}

impl Event for FileEvent {
    fn set(&self) {
        Self::touch(&self.fired_path);
        Self::touch(&self.path);
    }

    fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to clear signal file")
            }
        }
    }

    fn is_set(&self) -> bool {
        self.path.exists()
    }

    fn has_fired(&self) -> bool {
        self.fired_path.exists()
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.is_set() {
                return true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            std::thread::sleep(FILE_POLL_INTERVAL);
        }
    }
}
