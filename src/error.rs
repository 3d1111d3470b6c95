use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors raised on the control channel, on either side of a request.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control request to {address} timed out after {after:?}")]
    Timeout { address: String, after: Duration },

    #[error("failed to connect to control address {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("control frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed control frame: {0}")]
    Decode(String),

    #[error("local transport is not supported on this platform")]
    LocalTransportUnsupported,

    #[error("unit rejected control request: {0}")]
    Remote(String),

    #[error("control channel io: {0}")]
    Io(#[from] io::Error),
}

impl ControlError {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "control_timeout",
            Self::Connect { .. } => "control_connect",
            Self::FrameTooLarge { .. } => "control_frame_too_large",
            Self::Decode(_) => "control_decode",
            Self::LocalTransportUnsupported => "control_local_unsupported",
            Self::Remote(_) => "control_remote",
            Self::Io(_) => "control_io",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors produced while constructing or running a [`crate::runtime::Runtime`].
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The control address could not be bound (construction failure).
    #[error("cannot bind control address {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The serving loop never reached a servable state.
    #[error("runtime failed to start: {reason}")]
    FailToStart { reason: String },

    /// A peer ended the runtime on purpose.
    #[error("runtime terminated by peer: {reason}")]
    Terminated { reason: String },

    /// The hosting process received an interrupt/termination signal.
    #[error("interrupted by host signal")]
    Interrupted,

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RuntimeError {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "construction_failure",
            Self::FailToStart { .. } => "runtime_fail_to_start",
            Self::Terminated { .. } => "runtime_terminated",
            Self::Interrupted => "user_interrupt",
            Self::Control(_) => "control_failure",
            Self::Other(_) => "unexpected_failure",
        }
    }

    pub fn fail_to_start(reason: impl Into<String>) -> Self {
        Self::FailToStart {
            reason: reason.into(),
        }
    }

    pub fn terminated(reason: impl Into<String>) -> Self {
        Self::Terminated {
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum EnvScopeError {
    #[error("invalid environment variable name {name:?}")]
    InvalidName { name: String },

    #[error("invalid value for environment variable {name}")]
    InvalidValue { name: String },
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The executor returned a different number of outputs than it was given.
    #[error("executor {executor} returned {actual} outputs for {expected} records")]
    LengthMismatch {
        executor: String,
        expected: usize,
        actual: usize,
    },

    #[error("executor {executor} failed: {source}")]
    Apply {
        executor: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unit is no longer accepting work")]
    Closed,
}

impl ExecutorError {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::LengthMismatch { .. } => "executor_length_mismatch",
            Self::Apply { .. } => "executor_failed",
            Self::Closed => "executor_closed",
        }
    }
}

/// Errors surfaced to whoever orchestrates peas.
#[derive(Error, Debug)]
pub enum PeaError {
    #[error("pea {name} shut down before becoming ready")]
    FailedToStart { name: String },

    #[error("pea {name} did not become ready within {timeout:?}")]
    StartTimeout { name: String, timeout: Duration },

    #[error("failed to spawn pea {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PeaError {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::FailedToStart { .. } => "pea_failed_to_start",
            Self::StartTimeout { .. } => "pea_start_timeout",
            Self::Spawn { .. } => "pea_spawn",
            Self::Config(_) => "pea_config",
            Self::Control(_) => "pea_control",
            Self::Io(_) => "pea_io",
            Self::Serialization(_) => "pea_serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, PeaError>;
