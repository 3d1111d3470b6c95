//! Control channel protocol types using rkyv for zero-copy serialization.
//!
//! Wire format: `[4-byte length (little-endian)][rkyv bytes]`.

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::ControlError;

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Control request from an external caller to a running unit
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum ControlRequest {
    /// Report the current lifecycle state
    Status,
    /// Ask whether the unit is serving
    Ready,
    /// Request transition to Terminating
    Cancel,
    /// Relay a command to the unit managed by a remote daemon
    Forward { command: ManagedCommand },
}

/// Commands a remote daemon may relay to its managed unit
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum ManagedCommand {
    Status,
    Ready,
    Cancel,
}

impl From<ManagedCommand> for ControlRequest {
    fn from(command: ManagedCommand) -> Self {
        match command {
            ManagedCommand::Status => ControlRequest::Status,
            ManagedCommand::Ready => ControlRequest::Ready,
            ManagedCommand::Cancel => ControlRequest::Cancel,
        }
    }
}

/// Control response from a unit
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum ControlResponse {
    Status {
        state: LifecycleState,
        /// Runtime variant name
        runtime: String,
        pid: u32,
        uptime_ms: u64,
    },
    Ready {
        ready: bool,
    },
    /// Generic success
    Ok,
    Error {
        message: String,
    },
}

/// Runtime lifecycle state
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum LifecycleState {
    Constructing,
    Running,
    Terminating,
    Stopped,
}

impl LifecycleState {
    pub fn is_running(&self) -> bool {
        matches!(self, LifecycleState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Constructing => "constructing",
            LifecycleState::Running => "running",
            LifecycleState::Terminating => "terminating",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message frame for the wire protocol
pub struct MessageFrame;

impl MessageFrame {
    pub fn encode_request(request: &ControlRequest) -> Result<Vec<u8>, ControlError> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)
            .map_err(|e| ControlError::Decode(e.to_string()))?;
        Self::with_length(&bytes)
    }

    pub fn encode_response(response: &ControlResponse) -> Result<Vec<u8>, ControlError> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)
            .map_err(|e| ControlError::Decode(e.to_string()))?;
        Self::with_length(&bytes)
    }

    fn with_length(bytes: &[u8]) -> Result<Vec<u8>, ControlError> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(ControlError::FrameTooLarge {
                len: bytes.len(),
                max: MAX_FRAME_LEN,
            });
        }
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        Ok(result)
    }

    /// Reads and bounds-checks a length prefix.
    pub fn read_length(buf: &[u8; 4]) -> Result<usize, ControlError> {
        let len = u32::from_le_bytes(*buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ControlError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        Ok(len)
    }

    pub fn decode_request(payload: &[u8]) -> Result<ControlRequest, ControlError> {
        let aligned = aligned(payload);
        rkyv::from_bytes::<ControlRequest, rkyv::rancor::Error>(&aligned)
            .map_err(|e| ControlError::Decode(e.to_string()))
    }

    pub fn decode_response(payload: &[u8]) -> Result<ControlResponse, ControlError> {
        let aligned = aligned(payload);
        rkyv::from_bytes::<ControlResponse, rkyv::rancor::Error>(&aligned)
            .map_err(|e| ControlError::Decode(e.to_string()))
    }
}

// rkyv validates alignment, and socket reads land in plain byte buffers.
fn aligned(payload: &[u8]) -> AlignedVec {
    let mut buf = AlignedVec::with_capacity(payload.len());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_request_decodes() {
        let request = ControlRequest::Forward {
            command: ManagedCommand::Cancel,
        };
        let frame = MessageFrame::encode_request(&request).unwrap();
        let len = MessageFrame::read_length(frame[..4].try_into().unwrap()).unwrap();
        assert_eq!(len, frame.len() - 4);
        assert_eq!(MessageFrame::decode_request(&frame[4..]).unwrap(), request);
    }

    #[test]
    fn test_status_response_decodes() {
        let response = ControlResponse::Status {
            state: LifecycleState::Running,
            runtime: "ThreadRuntime".to_string(),
            pid: 42,
            uptime_ms: 1500,
        };
        let frame = MessageFrame::encode_response(&response).unwrap();
        assert_eq!(MessageFrame::decode_response(&frame[4..]).unwrap(), response);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let buf = ((MAX_FRAME_LEN as u32) + 1).to_le_bytes();
        let err = MessageFrame::read_length(&buf).unwrap_err();
        assert!(matches!(err, ControlError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_garbage_payload_is_decode_error() {
        let err = MessageFrame::decode_request(&[0xff; 3]).unwrap_err();
        assert_eq!(err.as_label(), "control_decode");
    }

    #[test]
    fn test_lifecycle_state() {
        assert!(LifecycleState::Running.is_running());
        assert!(!LifecycleState::Terminating.is_running());
        assert_eq!(LifecycleState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_managed_command_maps_to_request() {
        assert_eq!(
            ControlRequest::from(ManagedCommand::Ready),
            ControlRequest::Ready
        );
    }
}
