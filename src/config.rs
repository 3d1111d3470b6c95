//! Unit configuration and control addressing.
//!
//! A [`UnitConfig`] is built once by the caller (CLI, TOML file, or code) and
//! is read-only for the lifetime of the unit. It is serialized as JSON when a
//! unit is handed to a child process.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clienv;
use crate::error::{PeaError, Result};

/// Execution backend a unit runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Thread,
    Process,
    RemoteDaemon,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Thread => "thread",
            Backend::Process => "process",
            Backend::RemoteDaemon => "remote-daemon",
        }
    }

    /// Threads share the parent's environment, so they must never mutate it.
    pub fn shares_environment(&self) -> bool {
        matches!(self, Backend::Thread)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two candidate control addresses a runtime binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlSelection {
    /// The unit's own control address.
    Unit,
    /// The secondary local address; the unit address is then the managed peer.
    Local,
}

/// Control request timeout; `None` waits forever (configured as -1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTimeout(Option<Duration>);

impl ControlTimeout {
    pub const UNBOUNDED: ControlTimeout = ControlTimeout(None);

    pub fn from_millis(ms: i64) -> Self {
        if ms < 0 {
            Self(None)
        } else {
            Self(Some(Duration::from_millis(ms as u64)))
        }
    }

    pub fn as_millis(&self) -> i64 {
        self.0.map(|d| d.as_millis() as i64).unwrap_or(-1)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.0
    }

    pub fn is_bounded(&self) -> bool {
        self.0.is_some()
    }
}

impl Default for ControlTimeout {
    fn default() -> Self {
        Self::from_millis(clienv::DEFAULT_CONTROL_TIMEOUT_MS)
    }
}

impl Serialize for ControlTimeout {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_i64(self.as_millis())
    }
}

impl<'de> Deserialize<'de> for ControlTimeout {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        i64::deserialize(d).map(Self::from_millis)
    }
}

/// Where a control socket lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum ControlAddress {
    Tcp { host: String, port: u16 },
    Local { path: PathBuf },
}

impl ControlAddress {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local { path: path.into() }
    }

    /// Fresh local-transport path under the runtime directory.
    pub fn local_for(name: &str) -> Self {
        let file = format!("{}-{}.sock", sanitize(name), clienv::unique_suffix());
        Self::local(clienv::runtime_dir().join(file))
    }

    /// Replaces a dynamic TCP port (0) with a concrete free one.
    pub fn resolved(self) -> Self {
        match self {
            Self::Tcp { host, port: 0 } => {
                let port = clienv::os_assigned_port(&host).unwrap_or(0);
                Self::Tcp { host, port }
            }
            other => other,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }
}

impl fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Self::Local { path } => write!(f, "ipc://{}", path.display()),
        }
    }
}

/// The two control endpoints known for a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlAddresses {
    /// Control endpoint of the unit itself.
    pub unit: ControlAddress,
    /// Secondary endpoint, bound by a remote-daemon runtime fronting the unit.
    pub local: ControlAddress,
}

impl ControlAddresses {
    pub fn new(unit: ControlAddress, local: ControlAddress) -> Self {
        Self { unit, local }
    }

    /// Allocates both endpoints according to the unit's transport options.
    pub fn allocate(config: &UnitConfig) -> Self {
        let unit = config.control_address();
        let local = if config.use_local_transport {
            ControlAddress::local_for(&format!("{}-local", config.name))
        } else {
            let port = match config.local_port {
                Some(port) => port,
                None => clienv::random_port(&config.host),
            };
            ControlAddress::tcp(config.host.clone(), port).resolved()
        };
        Self { unit, local }
    }

    pub fn select(&self, selection: ControlSelection) -> &ControlAddress {
        match selection {
            ControlSelection::Unit => &self.unit,
            ControlSelection::Local => &self.local,
        }
    }

    /// Returns `(own, managed)`: the address to bind and the other one.
    pub fn for_runtime(&self, selection: ControlSelection) -> (&ControlAddress, &ControlAddress) {
        match selection {
            ControlSelection::Unit => (&self.unit, &self.local),
            ControlSelection::Local => (&self.local, &self.unit),
        }
    }
}

/// Immutable configuration of one supervised unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Unit name, used in logs and socket/signal file names
    pub name: String,
    pub backend: Backend,
    /// Variables injected into the process environment (not for threads)
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_host")]
    pub host: String,
    /// Control port; `None` picks a random free port, `Some(0)` an OS-assigned one
    #[serde(default)]
    pub control_port: Option<u16>,
    #[serde(default)]
    pub use_local_transport: bool,
    /// Fixed local-socket path of the unit's control endpoint; takes
    /// precedence over `control_port`
    #[serde(default)]
    pub control_path: Option<PathBuf>,
    #[serde(default)]
    pub control_timeout: ControlTimeout,
    #[serde(default)]
    pub quiet_error: bool,
    /// Explicit control address choice; defaults by backend
    #[serde(default)]
    pub control_selection: Option<ControlSelection>,
    /// Fixed port for the secondary (daemon-side) control endpoint
    #[serde(default)]
    pub local_port: Option<u16>,
    /// Liveness probe interval of the remote-daemon runtime
    #[serde(default = "default_heartbeat_ms")]
    pub daemon_heartbeat_ms: u64,
}

fn default_host() -> String {
    clienv::DEFAULT_HOST.to_string()
}

fn default_heartbeat_ms() -> u64 {
    1000
}

pub(crate) fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl UnitConfig {
    pub fn new(name: impl Into<String>, backend: Backend) -> Self {
        Self {
            name: name.into(),
            backend,
            env: BTreeMap::new(),
            host: default_host(),
            control_port: clienv::control_port(),
            use_local_transport: false,
            control_path: None,
            control_timeout: ControlTimeout::from_millis(clienv::control_timeout_ms()),
            quiet_error: false,
            control_selection: None,
            local_port: None,
            daemon_heartbeat_ms: default_heartbeat_ms(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn control_port(mut self, port: u16) -> Self {
        self.control_port = Some(port);
        self
    }

    pub fn use_local_transport(mut self, local: bool) -> Self {
        self.use_local_transport = local;
        self
    }

    pub fn control_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_path = Some(path.into());
        self
    }

    pub fn control_timeout_ms(mut self, ms: i64) -> Self {
        self.control_timeout = ControlTimeout::from_millis(ms);
        self
    }

    pub fn quiet_error(mut self, quiet: bool) -> Self {
        self.quiet_error = quiet;
        self
    }

    pub fn control_selection(mut self, selection: ControlSelection) -> Self {
        self.control_selection = Some(selection);
        self
    }

    pub fn daemon_heartbeat_ms(mut self, ms: u64) -> Self {
        self.daemon_heartbeat_ms = ms;
        self
    }

    /// Control address choice: explicit, else `Local` for remote-daemon units.
    pub fn selection(&self) -> ControlSelection {
        self.control_selection.unwrap_or(match self.backend {
            Backend::RemoteDaemon => ControlSelection::Local,
            Backend::Thread | Backend::Process => ControlSelection::Unit,
        })
    }

    /// The unit's own control address, with the port resolved.
    pub fn control_address(&self) -> ControlAddress {
        if let Some(path) = &self.control_path {
            return ControlAddress::local(path.clone());
        }
        if self.use_local_transport {
            return ControlAddress::local_for(&self.name);
        }
        let port = self
            .control_port
            .unwrap_or_else(|| clienv::random_port(&self.host));
        ControlAddress::tcp(self.host.clone(), port).resolved()
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.daemon_heartbeat_ms.max(10))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PeaError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading unit config");
        let content = std::fs::read_to_string(path).map_err(|e| {
            PeaError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::trace!(name = %config.name, backend = %config.backend, "Unit config loaded");
        Ok(config)
    }
}
