//! Starting and stopping units from the orchestrating side.
//!
//! A [`Pea`] runs [`supervise`] in the execution context its backend asks
//! for: a dedicated thread for `thread`, a child process for `process` and
//! `remote-daemon`. The returned [`PeaHandle`] observes the unit only through
//! its ready/shutdown signals and its control channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clienv;
use crate::config::{sanitize, Backend, ControlAddress, ControlAddresses, ControlTimeout, UnitConfig};
use crate::control::{ControlClient, UnitStatus};
use crate::error::{PeaError, Result};
use crate::runtime::{BackendFactory, RuntimeFactory};
use crate::signal::Signal;
use crate::supervisor::supervise;

const START_POLL: Duration = Duration::from_millis(10);
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Everything a child process needs to supervise one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub config: UnitConfig,
    pub addresses: ControlAddresses,
}

impl UnitSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// A unit that has not been started yet.
pub struct Pea {
    config: UnitConfig,
    addresses: ControlAddresses,
    factory: Option<Arc<dyn RuntimeFactory>>,
    program: Option<PathBuf>,
}

impl Pea {
    pub fn new(config: UnitConfig) -> Self {
        let addresses = ControlAddresses::allocate(&config);
        Self {
            config,
            addresses,
            factory: None,
            program: None,
        }
    }

    /// Uses `factory` instead of [`BackendFactory`]. Thread backend only; a
    /// child process always selects by backend.
    pub fn with_factory(mut self, factory: Arc<dyn RuntimeFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Program launched for process-backed units (default: this executable).
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    pub fn addresses(&self) -> &ControlAddresses {
        &self.addresses
    }

    /// The address the unit's runtime will answer on.
    pub fn control_address(&self) -> &ControlAddress {
        self.addresses.select(self.config.selection())
    }

    pub async fn start(self) -> Result<PeaHandle> {
        info!(
            unit = %self.config.name,
            backend = %self.config.backend,
            control = %self.control_address(),
            "Starting pea"
        );
        match self.config.backend {
            Backend::Thread => self.start_thread(),
            Backend::Process | Backend::RemoteDaemon => self.start_process(),
        }
    }

    fn start_thread(self) -> Result<PeaHandle> {
        let ready = Signal::in_memory();
        let shutdown = Signal::in_memory();
        let control = ControlClient::new(self.control_address().clone(), self.config.control_timeout);
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(BackendFactory::new()));

        let config = self.config;
        let addresses = self.addresses;
        let name = config.name.clone();
        let timeout = config.control_timeout;
        let (unit_ready, unit_shutdown) = (ready.clone(), shutdown.clone());

        let thread = std::thread::Builder::new()
            .name(format!("pea-{}", sanitize(&name)))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(unit = %config.name, phase = "initialization", error = %e, "Failed to build unit runtime");
                        unit_shutdown.set();
                        return;
                    }
                };
                let span = tracing::info_span!("pea", unit = %config.name, backend = %config.backend);
                rt.block_on(supervise(
                    &config,
                    &span,
                    factory.as_ref(),
                    &addresses,
                    &unit_ready,
                    &unit_shutdown,
                ));
            })
            .map_err(|source| PeaError::Spawn {
                name: name.clone(),
                source,
            })?;

        Ok(PeaHandle {
            name,
            control,
            ready,
            shutdown,
            timeout,
            worker: Worker::Thread(Some(thread)),
            signal_dir: None,
        })
    }

    fn start_process(self) -> Result<PeaHandle> {
        if self.factory.is_some() {
            warn!(unit = %self.config.name, "Custom runtime factory ignored for a process-backed unit");
        }
        let name = self.config.name.clone();
        let dir = clienv::runtime_dir().join(format!(
            "{}-{}",
            sanitize(&name),
            clienv::unique_suffix()
        ));
        std::fs::create_dir_all(&dir)?;

        let spec_path = dir.join("unit.json");
        let ready_path = dir.join("ready");
        let shutdown_path = dir.join("shutdown");
        let control = ControlClient::new(self.control_address().clone(), self.config.control_timeout);
        let timeout = self.config.control_timeout;

        UnitSpec {
            config: self.config,
            addresses: self.addresses,
        }
        .save(&spec_path)?;

        let program = match self.program {
            Some(program) => program,
            None => std::env::current_exe()?,
        };
        debug!(program = %program.display(), spec = %spec_path.display(), "Launching unit process");

        let mut cmd = tokio::process::Command::new(&program);
        cmd.arg("unit")
            .arg("--spec")
            .arg(&spec_path)
            .arg("--ready-file")
            .arg(&ready_path)
            .arg("--shutdown-file")
            .arg(&shutdown_path)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| PeaError::Spawn {
            name: name.clone(),
            source,
        })?;
        info!(unit = %name, pid = ?child.id(), "Unit process started");

        Ok(PeaHandle {
            name,
            control,
            ready: Signal::file_backed(ready_path),
            shutdown: Signal::file_backed(shutdown_path),
            timeout,
            worker: Worker::Process(child),
            signal_dir: Some(dir),
        })
    }
}

enum Worker {
    Thread(Option<std::thread::JoinHandle<()>>),
    Process(tokio::process::Child),
}

impl Worker {
    fn has_exited(&mut self) -> bool {
        match self {
            Worker::Thread(Some(handle)) => handle.is_finished(),
            Worker::Thread(None) => true,
            Worker::Process(child) => matches!(child.try_wait(), Ok(Some(_))),
        }
    }
}

/// A started unit.
pub struct PeaHandle {
    name: String,
    control: ControlClient,
    ready: Signal,
    shutdown: Signal,
    timeout: ControlTimeout,
    worker: Worker,
    signal_dir: Option<PathBuf>,
}

impl PeaHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control_address(&self) -> &ControlAddress {
        self.control.address()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_set()
    }

    /// Waits until the unit reports ready.
    ///
    /// Shutdown (or the execution context exiting) without ready ever having
    /// fired is a start failure.
    pub async fn wait_start_success(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.ready.has_fired() {
                debug!(unit = %self.name, "Pea is ready");
                return Ok(());
            }
            if self.shutdown.is_set() || self.worker.has_exited() {
                // The unit may have set ready right before exiting.
                if self.ready.has_fired() {
                    return Ok(());
                }
                return Err(PeaError::FailedToStart {
                    name: self.name.clone(),
                });
            }
            if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
                if Instant::now() >= deadline {
                    return Err(PeaError::StartTimeout {
                        name: self.name.clone(),
                        timeout,
                    });
                }
            }
            tokio::time::sleep(START_POLL).await;
        }
    }

    pub async fn status(&self) -> Result<UnitStatus> {
        Ok(self.control.status().await?)
    }

    /// Waits until the unit sets shutdown or its execution context ends;
    /// `false` if the wait timed out.
    pub async fn wait_shutdown(&mut self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.shutdown.is_set() {
                return true;
            }
            if self.worker.has_exited() {
                if !self.shutdown.is_set() {
                    warn!(unit = %self.name, "Unit exited without signalling shutdown");
                }
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            tokio::time::sleep(START_POLL).await;
        }
    }

    /// Cancels the unit and reclaims its execution context.
    pub async fn close(mut self) -> Result<()> {
        if !self.shutdown.is_set() && !self.worker.has_exited() {
            if let Err(e) = self.control.cancel().await {
                debug!(unit = %self.name, error = %e, kind = e.as_label(), "Cancel not delivered");
            }
        }

        let released = self.wait_shutdown(self.timeout.duration()).await;
        if !released {
            warn!(unit = %self.name, "Unit did not shut down within the control timeout");
        }

        match &mut self.worker {
            Worker::Thread(handle) => {
                if let Some(handle) = handle.take() {
                    if released || handle.is_finished() {
                        let joined = tokio::task::spawn_blocking(move || handle.join()).await;
                        if !matches!(joined, Ok(Ok(()))) {
                            error!(unit = %self.name, "Unit thread panicked");
                        }
                    } else {
                        warn!(unit = %self.name, "Detaching unit thread that is still running");
                    }
                }
            }
            Worker::Process(child) => reap(&self.name, child, released).await?,
        }

        if let Some(dir) = self.signal_dir.take() {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove signal directory"),
            }
        }
        info!(unit = %self.name, "Pea closed");
        Ok(())
    }
}

/// Waits for a unit process, escalating SIGTERM then SIGKILL.
async fn reap(name: &str, child: &mut tokio::process::Child, released: bool) -> Result<()> {
    if released {
        if let Ok(status) = tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
            let status = status?;
            debug!(unit = %name, status = ?status, "Unit process exited");
            return Ok(());
        }
    }

    info!("Stopping unit process '{}' gracefully", name);
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        child.kill().await?;
    }

    match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
        Ok(status) => {
            let status = status?;
            debug!(unit = %name, status = ?status, "Unit process stopped");
        }
        Err(_) => {
            warn!("Unit process '{}' did not stop in time, force killing", name);
            child.kill().await?;
        }
    }
    Ok(())
}
