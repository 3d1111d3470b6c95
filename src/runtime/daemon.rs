use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::local::host_interrupt;
use super::{Runtime, StateCell};
use crate::config::{ControlAddress, ControlTimeout, UnitConfig};
use crate::control::{
    ControlClient, ControlHandler, ControlRequest, ControlResponse, ControlServer, LifecycleState,
    ShutdownHandle,
};
use crate::error::RuntimeError;

const READY_POLL: Duration = Duration::from_millis(50);
const MAX_MISSED_HEARTBEATS: u32 = 3;
const TEARDOWN_CANCEL_TIMEOUT_MS: i64 = 1000;

struct DaemonControl {
    state: StateCell,
    shutdown: ShutdownHandle,
    managed: ControlClient,
}

#[async_trait]
impl ControlHandler for DaemonControl {
    async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Status => ControlResponse::Status {
                state: self.state.get(),
                runtime: RemoteDaemonRuntime::NAME.to_string(),
                pid: std::process::id(),
                uptime_ms: self.state.uptime_ms(),
            },
            ControlRequest::Ready => ControlResponse::Ready {
                ready: self.state.get().is_running(),
            },
            ControlRequest::Cancel => {
                info!("Cancel received on daemon control channel");
                self.state.set(LifecycleState::Terminating);
                self.shutdown.shutdown();
                ControlResponse::Ok
            }
            ControlRequest::Forward { command } => {
                debug!(command = ?command, managed = %self.managed.address(), "Forwarding");
                match self.managed.request(&command.into()).await {
                    Ok(response) => response,
                    Err(e) => ControlResponse::Error {
                        message: format!("forward to {} failed: {}", self.managed.address(), e),
                    },
                }
            }
        }
    }
}

/// Runtime that fronts a unit managed elsewhere.
///
/// It binds its own control endpoint, distinct from the managed unit's, and
/// lives as long as the managed unit answers.
pub struct RemoteDaemonRuntime {
    server: ControlServer,
    address: ControlAddress,
    managed: ControlClient,
    timeout: ControlTimeout,
    heartbeat: Duration,
    state: StateCell,
    shutdown: ShutdownHandle,
}

impl RemoteDaemonRuntime {
    pub const NAME: &'static str = "RemoteDaemonRuntime";

    pub fn bind(
        config: &UnitConfig,
        own: &ControlAddress,
        managed: &ControlAddress,
    ) -> Result<Self, RuntimeError> {
        if own == managed {
            return Err(RuntimeError::Bind {
                address: own.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "daemon control address collides with its managed unit",
                ),
            });
        }
        let server = ControlServer::bind(own, config.control_timeout)?;
        let address = server.address().clone();
        Ok(Self {
            server,
            address,
            managed: ControlClient::new(managed.clone(), config.control_timeout),
            timeout: config.control_timeout,
            heartbeat: config.heartbeat(),
            state: StateCell::new(),
            shutdown: ShutdownHandle::new(),
        })
    }

    /// Waits for the managed unit, then watches it until it stops answering.
    async fn watch_managed(
        managed: ControlClient,
        state: StateCell,
        timeout: ControlTimeout,
        heartbeat: Duration,
    ) -> RuntimeError {
        let deadline = timeout.duration().map(|t| Instant::now() + t);
        loop {
            if let Ok(true) = managed.is_ready().await {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return RuntimeError::fail_to_start(format!(
                    "managed unit at {} did not become ready within {}ms",
                    managed.address(),
                    timeout.as_millis()
                ));
            }
            tokio::time::sleep(READY_POLL).await;
        }

        state.set(LifecycleState::Running);
        info!(managed = %managed.address(), "Managed unit is ready");

        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut missed = 0u32;
        loop {
            ticker.tick().await;
            match managed.status().await {
                Ok(status) if matches!(status.state, LifecycleState::Running) => missed = 0,
                Ok(status) => {
                    return RuntimeError::terminated(format!(
                        "managed unit is {}",
                        status.state
                    ))
                }
                Err(e) => {
                    missed += 1;
                    debug!(missed, error = %e, "Managed unit missed a heartbeat");
                    if missed >= MAX_MISSED_HEARTBEATS {
                        return RuntimeError::terminated(format!(
                            "managed unit stopped answering: {}",
                            e
                        ));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Runtime for RemoteDaemonRuntime {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn control_address(&self) -> &ControlAddress {
        &self.address
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }

    async fn run_forever(&mut self) -> Result<(), RuntimeError> {
        let handler = Arc::new(DaemonControl {
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
            managed: self.managed.clone(),
        });
        let shutdown = self.shutdown.clone();
        let state = self.state.clone();
        let watcher = Self::watch_managed(
            self.managed.clone(),
            self.state.clone(),
            self.timeout,
            self.heartbeat,
        );

        let result = tokio::select! {
            served = self.server.serve(handler, shutdown.clone()) => served,
            err = watcher => Err(err),
            _ = host_interrupt() => Err(RuntimeError::Interrupted),
        };
        shutdown.shutdown();
        state.set(LifecycleState::Terminating);
        result
    }

    async fn teardown(&mut self) -> Result<(), RuntimeError> {
        debug!(runtime = Self::NAME, managed = %self.managed.address(), "Tearing down");
        self.shutdown.shutdown();

        let bounded = if self.timeout.is_bounded() {
            self.timeout
        } else {
            ControlTimeout::from_millis(TEARDOWN_CANCEL_TIMEOUT_MS)
        };
        let managed = ControlClient::new(self.managed.address().clone(), bounded);
        if let Err(e) = managed.cancel().await {
            warn!(managed = %managed.address(), error = %e, "Managed unit did not accept cancel");
        }

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
