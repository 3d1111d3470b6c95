use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use pea::config::Backend;

#[derive(Parser)]
#[command(name = "pea")]
#[command(version)]
#[command(about = "Run and control supervised execution units", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start one unit and keep it running until Ctrl-C or until it shuts down
    Run(RunArgs),

    /// Send a lifecycle command to a running unit's control socket
    Ctl {
        #[command(flatten)]
        target: CtlTarget,

        #[command(subcommand)]
        command: CtlCommands,
    },

    /// Child entry point for process-backed units
    #[command(hide = true)]
    Unit {
        /// Unit spec written by the parent
        #[arg(long)]
        spec: PathBuf,

        /// Marker file set when the unit is ready
        #[arg(long)]
        ready_file: PathBuf,

        /// Marker file set when the unit has shut down
        #[arg(long)]
        shutdown_file: PathBuf,
    },
}

#[derive(Args)]
pub(crate) struct RunArgs {
    /// Unit name used in logs and socket names
    #[arg(long)]
    pub name: Option<String>,

    /// TOML unit config; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Execution backend of the unit
    #[arg(long, value_enum)]
    pub runtime_backend: Option<Backend>,

    /// The port for controlling the runtime, default a random port between [49152, 65535]
    #[arg(long, env = "PEA_CONTROL_PORT")]
    pub port_ctrl: Option<u16>,

    /// If set, use a local socket instead of a TCP port for control
    #[arg(long)]
    pub ctrl_with_ipc: bool,

    /// Local socket path for control; for remote-daemon units, the managed unit's socket
    #[arg(long)]
    pub ctrl_path: Option<PathBuf>,

    /// The timeout in milliseconds of the control request, -1 for waiting forever
    #[arg(long, allow_hyphen_values = true)]
    pub timeout_ctrl: Option<i64>,

    /// Environment variable for the unit (KEY=VALUE, repeatable)
    #[arg(long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Suppress exception details in failure logs
    #[arg(long)]
    pub quiet_error: bool,

    /// Port of the secondary control endpoint used by remote-daemon units
    #[arg(long)]
    pub local_port: Option<u16>,

    /// Seconds to wait for the unit to become ready
    #[arg(long, default_value = "30")]
    pub start_timeout: u64,
}

#[derive(Args)]
pub(crate) struct CtlTarget {
    /// Host of the control socket
    #[arg(long, global = true, default_value = "127.0.0.1")]
    pub host: String,

    /// Control port of the unit
    #[arg(long, global = true, conflicts_with = "ipc")]
    pub port: Option<u16>,

    /// Local control socket path of the unit
    #[arg(long, global = true)]
    pub ipc: Option<PathBuf>,

    /// Request timeout in milliseconds, -1 for waiting forever
    #[arg(long, global = true, default_value = "5000", allow_hyphen_values = true)]
    pub timeout: i64,
}

#[derive(Subcommand)]
pub(crate) enum CtlCommands {
    /// Report the unit's lifecycle state
    Status,

    /// Ask whether the unit is serving
    Ready,

    /// Ask the unit to terminate
    Cancel,

    /// Relay a command through a remote daemon to its managed unit
    Forward {
        #[arg(value_enum)]
        command: ForwardCommand,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum ForwardCommand {
    Status,
    Ready,
    Cancel,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}
