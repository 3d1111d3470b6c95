use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::protocol::{ControlRequest, ControlResponse, LifecycleState, ManagedCommand, MessageFrame};
use super::{read_frame, write_frame};
use crate::config::{ControlAddress, ControlTimeout};
use crate::error::ControlError;

/// Snapshot returned by a status probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub state: LifecycleState,
    pub runtime: String,
    pub pid: u32,
    pub uptime: Duration,
}

/// Client for a unit's control socket.
///
/// One connection per request. The whole exchange (connect, write, read) is
/// bounded by the configured timeout.
#[derive(Debug, Clone)]
pub struct ControlClient {
    address: ControlAddress,
    timeout: ControlTimeout,
}

impl ControlClient {
    pub fn new(address: ControlAddress, timeout: ControlTimeout) -> Self {
        Self { address, timeout }
    }

    pub fn address(&self) -> &ControlAddress {
        &self.address
    }

    pub async fn request(&self, request: &ControlRequest) -> Result<ControlResponse, ControlError> {
        trace!(address = %self.address, request = ?request, "Sending control request");
        let frame = MessageFrame::encode_request(request)?;
        let exchange = exchange(&self.address, &frame);

        let response = match self.timeout.duration() {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| ControlError::Timeout {
                    address: self.address.to_string(),
                    after: limit,
                })??,
            None => exchange.await?,
        };

        match response {
            ControlResponse::Error { message } => Err(ControlError::Remote(message)),
            other => Ok(other),
        }
    }

    pub async fn status(&self) -> Result<UnitStatus, ControlError> {
        match self.request(&ControlRequest::Status).await? {
            ControlResponse::Status {
                state,
                runtime,
                pid,
                uptime_ms,
            } => Ok(UnitStatus {
                state,
                runtime,
                pid,
                uptime: Duration::from_millis(uptime_ms),
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn is_ready(&self) -> Result<bool, ControlError> {
        match self.request(&ControlRequest::Ready).await? {
            ControlResponse::Ready { ready } => Ok(ready),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cancel(&self) -> Result<(), ControlError> {
        match self.request(&ControlRequest::Cancel).await? {
            ControlResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Relays `command` through a remote daemon to its managed unit.
    pub async fn forward(&self, command: ManagedCommand) -> Result<ControlResponse, ControlError> {
        self.request(&ControlRequest::Forward { command }).await
    }
}

fn unexpected(response: ControlResponse) -> ControlError {
    ControlError::Decode(format!("unexpected response {:?}", response))
}

async fn exchange(address: &ControlAddress, frame: &[u8]) -> Result<ControlResponse, ControlError> {
    let connect_err = |source: std::io::Error| ControlError::Connect {
        address: address.to_string(),
        source,
    };
    match address {
        ControlAddress::Tcp { host, port } => {
            let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(connect_err)?;
            round_trip(stream, frame).await
        }
        ControlAddress::Local { path } => exchange_local(path, frame, connect_err).await,
    }
}

#[cfg(unix)]
async fn exchange_local(
    path: &std::path::Path,
    frame: &[u8],
    connect_err: impl FnOnce(std::io::Error) -> ControlError,
) -> Result<ControlResponse, ControlError> {
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .map_err(connect_err)?;
    round_trip(stream, frame).await
}

#[cfg(not(unix))]
async fn exchange_local(
    _path: &std::path::Path,
    _frame: &[u8],
    _connect_err: impl FnOnce(std::io::Error) -> ControlError,
) -> Result<ControlResponse, ControlError> {
    Err(ControlError::LocalTransportUnsupported)
}

async fn round_trip<S>(mut stream: S, frame: &[u8]) -> Result<ControlResponse, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(&mut stream, frame).await?;
    let payload = read_frame(&mut stream).await?;
    MessageFrame::decode_response(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_against_silent_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept but never answer.
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = ControlClient::new(
            ControlAddress::tcp("127.0.0.1", port),
            ControlTimeout::from_millis(100),
        );
        let started = std::time::Instant::now();
        let err = client.status().await.unwrap_err();
        assert!(err.is_timeout(), "got {err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let port = crate::clienv::os_assigned_port("127.0.0.1").unwrap();
        let client = ControlClient::new(
            ControlAddress::tcp("127.0.0.1", port),
            ControlTimeout::from_millis(500),
        );
        let err = client.cancel().await.unwrap_err();
        assert_eq!(err.as_label(), "control_connect");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_socket_path_is_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = ControlClient::new(
            ControlAddress::local(dir.path().join("absent.sock")),
            ControlTimeout::from_millis(500),
        );
        let err = client.is_ready().await.unwrap_err();
        assert_eq!(err.as_label(), "control_connect");
    }
}
