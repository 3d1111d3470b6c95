//! Out-of-band control channel of a unit.
//!
//! A small request/reply socket (TCP port or Unix socket path) through which
//! an external caller can probe status, ask for readiness, cancel the unit,
//! or (remote-daemon only) relay a command to the managed unit.
//!
//! ```text
//!   ControlClient ──frame──▶ ControlServer ──▶ ControlHandler (runtime)
//!        ▲                        │
//!        └────────frame───────────┘
//! ```

pub mod client;
pub mod protocol;
pub mod server;
pub mod shutdown;

pub use client::{ControlClient, UnitStatus};
pub use protocol::{ControlRequest, ControlResponse, LifecycleState, ManagedCommand, MessageFrame};
pub use server::{ControlHandler, ControlServer};
pub use shutdown::ShutdownHandle;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ControlError;

/// Reads one length-prefixed frame and returns its payload.
pub(crate) async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>, ControlError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = MessageFrame::read_length(&len_buf)?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes an already-framed message and flushes.
pub(crate) async fn write_frame<S>(stream: &mut S, frame: &[u8]) -> Result<(), ControlError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}
