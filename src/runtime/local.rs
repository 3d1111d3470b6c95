use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Runtime, StateCell};
use crate::config::{ControlAddress, UnitConfig};
use crate::control::{
    ControlHandler, ControlRequest, ControlResponse, ControlServer, LifecycleState, ShutdownHandle,
};
use crate::error::RuntimeError;
use crate::executor::HostedExecutor;
use crate::os_signals;

/// Control handler of a unit that serves in the current process.
struct UnitControl {
    runtime: &'static str,
    state: StateCell,
    shutdown: ShutdownHandle,
}

#[async_trait]
impl ControlHandler for UnitControl {
    async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Status => ControlResponse::Status {
                state: self.state.get(),
                runtime: self.runtime.to_string(),
                pid: std::process::id(),
                uptime_ms: self.state.uptime_ms(),
            },
            ControlRequest::Ready => ControlResponse::Ready {
                ready: self.state.get().is_running(),
            },
            ControlRequest::Cancel => {
                info!(runtime = self.runtime, "Cancel received on control channel");
                self.state.set(LifecycleState::Terminating);
                self.shutdown.shutdown();
                ControlResponse::Ok
            }
            ControlRequest::Forward { .. } => ControlResponse::Error {
                message: format!("{} has no managed unit to forward to", self.runtime),
            },
        }
    }
}

/// Control socket plus optional executor inbox, shared by the in-process
/// variants.
struct ServingCore {
    runtime: &'static str,
    server: ControlServer,
    address: ControlAddress,
    state: StateCell,
    shutdown: ShutdownHandle,
    hosted: Option<HostedExecutor>,
}

impl ServingCore {
    fn bind(
        runtime: &'static str,
        config: &UnitConfig,
        address: &ControlAddress,
        hosted: Option<HostedExecutor>,
    ) -> Result<Self, RuntimeError> {
        let server = ControlServer::bind(address, config.control_timeout)?;
        let address = server.address().clone();
        Ok(Self {
            runtime,
            server,
            address,
            state: StateCell::new(),
            shutdown: ShutdownHandle::new(),
            hosted,
        })
    }

    async fn serve(&mut self) -> Result<(), RuntimeError> {
        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        let hosted = self.hosted.take();
        let server = &mut self.server;

        state.set(LifecycleState::Running);
        let handler = Arc::new(UnitControl {
            runtime: self.runtime,
            state: state.clone(),
            shutdown: shutdown.clone(),
        });

        let control = async {
            let served = server.serve(handler, shutdown.clone()).await;
            if served.is_err() {
                // Unblocks the executor inbox.
                shutdown.shutdown();
            }
            served
        };
        let work = async {
            match hosted {
                Some(hosted) => hosted.serve(shutdown.clone()).await,
                None => shutdown.wait().await,
            }
        };

        let (served, ()) = tokio::join!(control, work);
        state.set(LifecycleState::Terminating);
        served
    }

    fn close(&mut self) -> Result<(), RuntimeError> {
        self.shutdown.shutdown();
        self.server.close().map_err(|e| {
            RuntimeError::Other(anyhow::anyhow!(
                "failed to remove control socket {}: {}",
                self.address,
                e
            ))
        })?;
        self.state.set(LifecycleState::Stopped);
        Ok(())
    }
}

/// Runtime for a unit hosted on a dedicated thread of the parent process.
///
/// Never touches OS signal disposition; the hosting process owns it.
pub struct ThreadRuntime {
    core: ServingCore,
}

impl ThreadRuntime {
    pub const NAME: &'static str = "ThreadRuntime";

    pub fn bind(
        config: &UnitConfig,
        address: &ControlAddress,
        hosted: Option<HostedExecutor>,
    ) -> Result<Self, RuntimeError> {
        Ok(Self {
            core: ServingCore::bind(Self::NAME, config, address, hosted)?,
        })
    }
}

#[async_trait]
impl Runtime for ThreadRuntime {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn control_address(&self) -> &ControlAddress {
        &self.core.address
    }

    fn state(&self) -> LifecycleState {
        self.core.state.get()
    }

    async fn run_forever(&mut self) -> Result<(), RuntimeError> {
        self.core.serve().await
    }

    async fn teardown(&mut self) -> Result<(), RuntimeError> {
        debug!(runtime = Self::NAME, "Tearing down");
        self.core.close()
    }
}

/// Runtime for a unit that owns its whole process.
///
/// Besides the control channel, SIGINT/SIGTERM/SIGQUIT end the serving loop
/// as a host interrupt.
pub struct ProcessRuntime {
    core: ServingCore,
}

impl ProcessRuntime {
    pub const NAME: &'static str = "ProcessRuntime";

    pub fn bind(
        config: &UnitConfig,
        address: &ControlAddress,
        hosted: Option<HostedExecutor>,
    ) -> Result<Self, RuntimeError> {
        Ok(Self {
            core: ServingCore::bind(Self::NAME, config, address, hosted)?,
        })
    }
}

#[async_trait]
impl Runtime for ProcessRuntime {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn control_address(&self) -> &ControlAddress {
        &self.core.address
    }

    fn state(&self) -> LifecycleState {
        self.core.state.get()
    }

    async fn run_forever(&mut self) -> Result<(), RuntimeError> {
        let shutdown = self.core.shutdown.clone();
        let state = self.core.state.clone();

        tokio::select! {
            served = self.core.serve() => served,
            _ = host_interrupt() => {
                state.set(LifecycleState::Terminating);
                shutdown.shutdown();
                Err(RuntimeError::Interrupted)
            }
        }
    }

    async fn teardown(&mut self) -> Result<(), RuntimeError> {
        debug!(runtime = Self::NAME, "Tearing down");
        self.core.close()
    }
}

/// Resolves on a host termination signal; never resolves if the handlers
/// cannot be installed.
pub(super) async fn host_interrupt() {
    if let Err(e) = os_signals::wait_for_shutdown_signal().await {
        warn!(error = %e, "Cannot install signal handlers; only the control channel can stop this unit");
        std::future::pending::<()>().await;
    }
}
