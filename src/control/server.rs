use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use super::protocol::{ControlRequest, ControlResponse, MessageFrame};
use super::shutdown::ShutdownHandle;
use super::{read_frame, write_frame};
use crate::config::{ControlAddress, ControlTimeout};
use crate::error::{ControlError, RuntimeError};

/// Upper bound for draining in-flight connections when no timeout is set.
const UNBOUNDED_DRAIN: Duration = Duration::from_secs(1);
/// Pause after a failed accept so a broken listener cannot spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Answers control requests on behalf of a runtime.
#[async_trait]
pub trait ControlHandler: Send + Sync + 'static {
    async fn handle(&self, request: ControlRequest) -> ControlResponse;
}

enum BoundListener {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

enum ControlListener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

enum ControlStream {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl ControlListener {
    fn from_std(bound: BoundListener) -> io::Result<Self> {
        match bound {
            BoundListener::Tcp(l) => Ok(Self::Tcp(tokio::net::TcpListener::from_std(l)?)),
            #[cfg(unix)]
            BoundListener::Unix(l) => Ok(Self::Unix(tokio::net::UnixListener::from_std(l)?)),
        }
    }

    async fn accept(&self) -> io::Result<ControlStream> {
        match self {
            Self::Tcp(l) => l.accept().await.map(|(s, _)| ControlStream::Tcp(s)),
            #[cfg(unix)]
            Self::Unix(l) => l.accept().await.map(|(s, _)| ControlStream::Unix(s)),
        }
    }
}

/// Control socket of one runtime.
///
/// The address is bound in [`ControlServer::bind`], before the serving loop
/// starts, so a collision is a construction failure rather than a race.
pub struct ControlServer {
    address: ControlAddress,
    timeout: ControlTimeout,
    bound: Option<BoundListener>,
    socket_path: Option<PathBuf>,
}

impl ControlServer {
    pub fn bind(address: &ControlAddress, timeout: ControlTimeout) -> Result<Self, RuntimeError> {
        let bind_err = |source: io::Error| RuntimeError::Bind {
            address: address.to_string(),
            source,
        };

        match address {
            ControlAddress::Tcp { host, port } => {
                let listener =
                    std::net::TcpListener::bind((host.as_str(), *port)).map_err(bind_err)?;
                listener.set_nonblocking(true).map_err(bind_err)?;
                let actual = listener.local_addr().map_err(bind_err)?.port();
                debug!(host = %host, port = actual, "Control socket bound");
                Ok(Self {
                    address: ControlAddress::tcp(host.clone(), actual),
                    timeout,
                    bound: Some(BoundListener::Tcp(listener)),
                    socket_path: None,
                })
            }
            ControlAddress::Local { path } => {
                let listener = bind_local(path).map_err(bind_err)?;
                debug!(path = %path.display(), "Control socket bound");
                Ok(Self {
                    address: address.clone(),
                    timeout,
                    bound: Some(listener),
                    socket_path: Some(path.clone()),
                })
            }
        }
    }

    /// The bound address, with a dynamic port replaced by the real one.
    pub fn address(&self) -> &ControlAddress {
        &self.address
    }

    /// Serves requests until `shutdown` fires.
    ///
    /// Accepting is multiplexed with the shutdown wait and every exchange is
    /// bounded by the control timeout, so a silent peer cannot stall the loop.
    pub async fn serve(
        &mut self,
        handler: Arc<dyn ControlHandler>,
        shutdown: ShutdownHandle,
    ) -> Result<(), RuntimeError> {
        let bound = self
            .bound
            .take()
            .ok_or_else(|| RuntimeError::fail_to_start("control socket is not bound"))?;
        let listener = ControlListener::from_std(bound).map_err(|e| {
            RuntimeError::fail_to_start(format!("cannot serve control socket {}: {}", self.address, e))
        })?;

        info!(address = %self.address, "Control socket serving");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok(stream) => {
                            let handler = Arc::clone(&handler);
                            let timeout = self.timeout;
                            connections.spawn(async move {
                                if let Err(e) = handle_stream(stream, handler, timeout).await {
                                    debug!(error = %e, kind = e.as_label(), "Control connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.wait() => {
                    debug!("Control socket received shutdown");
                    break;
                }
            }
        }

        let limit = self.timeout.duration().unwrap_or(UNBOUNDED_DRAIN);
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(limit, drain).await.is_err() {
            warn!(pending = connections.len(), "Aborting control connections still open");
            connections.abort_all();
        }
        Ok(())
    }

    /// Drops the listener and removes a local-transport socket file.
    pub fn close(&mut self) -> io::Result<()> {
        self.bound = None;
        if let Some(path) = self.socket_path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => trace!(path = %path.display(), "Removed control socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

async fn handle_stream(
    stream: ControlStream,
    handler: Arc<dyn ControlHandler>,
    timeout: ControlTimeout,
) -> Result<(), ControlError> {
    match stream {
        ControlStream::Tcp(s) => handle_connection(s, handler, timeout).await,
        #[cfg(unix)]
        ControlStream::Unix(s) => handle_connection(s, handler, timeout).await,
    }
}

async fn handle_connection<S>(
    mut stream: S,
    handler: Arc<dyn ControlHandler>,
    timeout: ControlTimeout,
) -> Result<(), ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    trace!("New control connection accepted");
    let exchange = async {
        let payload = read_frame(&mut stream).await?;
        let request = match MessageFrame::decode_request(&payload) {
            Ok(request) => request,
            Err(e) => {
                let reply = ControlResponse::Error {
                    message: e.to_string(),
                };
                write_frame(&mut stream, &MessageFrame::encode_response(&reply)?).await?;
                return Err(e);
            }
        };
        trace!(request = ?request, "Control request");
        let response = handler.handle(request).await;
        write_frame(&mut stream, &MessageFrame::encode_response(&response)?).await
    };

    match timeout.duration() {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| ControlError::Timeout {
                address: "control peer".to_string(),
                after: limit,
            })?,
        None => exchange.await,
    }
}

#[cfg(unix)]
fn bind_local(path: &std::path::Path) -> io::Result<BoundListener> {
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::{UnixListener, UnixStream};

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        if UnixStream::connect(path).is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("control socket {} is in use", path.display()),
            ));
        }
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    listener.set_nonblocking(true)?;
    Ok(BoundListener::Unix(listener))
}

#[cfg(not(unix))]
fn bind_local(_path: &std::path::Path) -> io::Result<BoundListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "local transport is not supported on this platform",
    ))
}
