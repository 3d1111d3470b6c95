use std::path::PathBuf;

use rand::Rng;

/// Environment variables read by pea itself (not the ones injected into units).
#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    ControlPort,
    ControlTimeout,
    RuntimeDir,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::ControlPort => "PEA_CONTROL_PORT",
            EnvVar::ControlTimeout => "PEA_CONTROL_TIMEOUT",
            EnvVar::RuntimeDir => "PEA_RUNTIME_DIR",
        }
    }
}

pub const DEFAULT_CONTROL_TIMEOUT_MS: i64 = 5000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const RANDOM_PORT_MIN: u16 = 49152;
pub const RANDOM_PORT_MAX: u16 = 65535;
const RUNTIME_SUBDIR: &str = "pea";
const RANDOM_PORT_ATTEMPTS: usize = 64;

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Default control port override ($PEA_CONTROL_PORT)
pub fn control_port() -> Option<u16> {
    let port = env_opt(EnvVar::ControlPort.as_str()).and_then(|s| s.trim().parse().ok());
    tracing::trace!(port = ?port, "PEA_CONTROL_PORT env var");
    port
}

/// Default control timeout in milliseconds ($PEA_CONTROL_TIMEOUT or 5000)
pub fn control_timeout_ms() -> i64 {
    env_opt(EnvVar::ControlTimeout.as_str())
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_CONTROL_TIMEOUT_MS)
}

/// Directory for local-transport sockets and signal files
/// ($PEA_RUNTIME_DIR, else $XDG_RUNTIME_DIR/pea, else <tmp>/pea)
pub fn runtime_dir() -> PathBuf {
    let dir = env_opt(EnvVar::RuntimeDir.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(RUNTIME_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved runtime directory");
    dir
}

/// Picks a currently bindable TCP port in [49152, 65535].
///
/// Falls back to an OS-assigned port if no random candidate is free.
pub fn random_port(host: &str) -> u16 {
    let mut rng = rand::rng();
    for _ in 0..RANDOM_PORT_ATTEMPTS {
        let port = rng.random_range(RANDOM_PORT_MIN..=RANDOM_PORT_MAX);
        if std::net::TcpListener::bind((host, port)).is_ok() {
            tracing::trace!(port, "Picked random control port");
            return port;
        }
    }
    os_assigned_port(host).unwrap_or(RANDOM_PORT_MIN)
}

/// Asks the OS for a free port by binding port 0 and releasing it.
pub fn os_assigned_port(host: &str) -> Option<u16> {
    std::net::TcpListener::bind((host, 0))
        .and_then(|l| l.local_addr())
        .map(|addr| addr.port())
        .ok()
}

/// Short random token used to keep socket and signal paths unique.
pub fn unique_suffix() -> String {
    let n: u32 = rand::rng().random();
    format!("{}-{:08x}", std::process::id(), n)
}
