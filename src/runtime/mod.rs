//! Serving-loop abstraction hosted inside a unit.
//!
//! ```text
//!   Constructing ──bind ok──▶ Running ──cancel / error / interrupt──▶ Terminating ──teardown──▶ Stopped
//!        │                                                                                    ▲
//!        └──────────────────────────────bind failed───────────────────────────────────────────┘
//! ```
//!
//! Variants are chosen by a [`RuntimeFactory`]. [`BackendFactory`] maps the
//! configured [`Backend`] to one of [`ThreadRuntime`], [`ProcessRuntime`] or
//! [`RemoteDaemonRuntime`].

mod daemon;
mod local;

pub use daemon::RemoteDaemonRuntime;
pub use local::{ProcessRuntime, ThreadRuntime};

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::{Backend, ControlAddress, ControlAddresses, UnitConfig};
use crate::control::LifecycleState;
use crate::error::RuntimeError;
use crate::executor::HostedExecutor;

#[async_trait]
pub trait Runtime: Send {
    /// Variant name used in logs and status replies.
    fn name(&self) -> &'static str;

    fn control_address(&self) -> &ControlAddress;

    fn state(&self) -> LifecycleState;

    /// Serves until cancelled over the control channel (returns `Ok`), a peer
    /// ends the unit (`Terminated`), the host is interrupted (`Interrupted`),
    /// or something fails.
    async fn run_forever(&mut self) -> Result<(), RuntimeError>;

    /// Releases every resource. Safe to call whether or not `run_forever`
    /// ever ran.
    async fn teardown(&mut self) -> Result<(), RuntimeError>;
}

/// Builds the runtime for a unit. Binding happens here, so an address
/// collision surfaces as a construction failure.
pub trait RuntimeFactory: Send + Sync {
    fn build(
        &self,
        config: &UnitConfig,
        addresses: &ControlAddresses,
    ) -> Result<Box<dyn Runtime>, RuntimeError>;
}

/// Shared, observable lifecycle state of one runtime.
#[derive(Clone, Debug)]
pub struct StateCell {
    tx: Arc<watch::Sender<LifecycleState>>,
    started: Instant,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Constructing);
        Self {
            tx: Arc::new(tx),
            started: Instant::now(),
        }
    }

    pub fn get(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: LifecycleState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Lifecycle transition");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Selects the runtime variant from `config.backend`.
///
/// An executor handed to the factory is served by the first thread or process
/// runtime it builds.
#[derive(Default)]
pub struct BackendFactory {
    hosted: Mutex<Option<HostedExecutor>>,
}

impl BackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executor(hosted: HostedExecutor) -> Self {
        Self {
            hosted: Mutex::new(Some(hosted)),
        }
    }

    fn take_hosted(&self) -> Option<HostedExecutor> {
        self.hosted.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl RuntimeFactory for BackendFactory {
    fn build(
        &self,
        config: &UnitConfig,
        addresses: &ControlAddresses,
    ) -> Result<Box<dyn Runtime>, RuntimeError> {
        let (own, managed) = addresses.for_runtime(config.selection());
        tracing::debug!(
            backend = %config.backend,
            address = %own,
            "Building runtime"
        );
        match config.backend {
            Backend::Thread => Ok(Box::new(ThreadRuntime::bind(
                config,
                own,
                self.take_hosted(),
            )?)),
            Backend::Process => Ok(Box::new(ProcessRuntime::bind(
                config,
                own,
                self.take_hosted(),
            )?)),
            Backend::RemoteDaemon => Ok(Box::new(RemoteDaemonRuntime::bind(config, own, managed)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlSelection;

    fn addresses() -> ControlAddresses {
        ControlAddresses::new(
            ControlAddress::tcp("127.0.0.1", 0).resolved(),
            ControlAddress::tcp("127.0.0.1", 0).resolved(),
        )
    }

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        assert_eq!(cell.get(), LifecycleState::Constructing);
        cell.set(LifecycleState::Running);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn test_factory_selects_variant_by_backend() {
        let addresses = addresses();
        let factory = BackendFactory::new();

        let thread = factory
            .build(&UnitConfig::new("t", Backend::Thread), &addresses)
            .unwrap();
        assert_eq!(thread.name(), "ThreadRuntime");
        assert_eq!(thread.control_address(), &addresses.unit);
        assert_eq!(thread.state(), LifecycleState::Constructing);
        drop(thread);

        let process = factory
            .build(&UnitConfig::new("p", Backend::Process), &addresses)
            .unwrap();
        assert_eq!(process.name(), "ProcessRuntime");
        drop(process);

        let daemon = factory
            .build(&UnitConfig::new("d", Backend::RemoteDaemon), &addresses)
            .unwrap();
        assert_eq!(daemon.name(), "RemoteDaemonRuntime");
        assert_eq!(daemon.control_address(), &addresses.local);
    }

    #[tokio::test]
    async fn test_explicit_selection_overrides_default() {
        let addresses = addresses();
        let config =
            UnitConfig::new("d", Backend::RemoteDaemon).control_selection(ControlSelection::Unit);
        let daemon = BackendFactory::new().build(&config, &addresses).unwrap();
        assert_eq!(daemon.control_address(), &addresses.unit);
    }

    #[tokio::test]
    async fn test_second_unit_on_same_address_fails_construction() {
        let addresses = addresses();
        let config = UnitConfig::new("first", Backend::Process);
        let first = BackendFactory::new().build(&config, &addresses).unwrap();

        let err = BackendFactory::new()
            .build(&UnitConfig::new("second", Backend::Process), &addresses)
            .err()
            .expect("collision must fail");
        assert_eq!(err.as_label(), "construction_failure");
        assert_eq!(first.state(), LifecycleState::Constructing);
    }
}
