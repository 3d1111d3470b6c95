use std::time::Duration;

use anyhow::Context;
use pea::config::{Backend, ControlTimeout, UnitConfig};
use pea::Pea;
use tracing::info;

use crate::args::RunArgs;

pub(crate) fn build_config(args: RunArgs) -> anyhow::Result<UnitConfig> {
    let mut config = match &args.config {
        Some(path) => UnitConfig::load(path)
            .with_context(|| format!("cannot load unit config {}", path.display()))?,
        None => UnitConfig::new(
            args.name.clone().unwrap_or_else(|| "pea".to_string()),
            args.runtime_backend.unwrap_or(Backend::Process),
        ),
    };

    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(backend) = args.runtime_backend {
        config.backend = backend;
    }
    if let Some(port) = args.port_ctrl {
        config.control_port = Some(port);
    }
    if args.ctrl_with_ipc {
        config.use_local_transport = true;
    }
    if let Some(path) = args.ctrl_path {
        config.control_path = Some(path);
    }
    if let Some(ms) = args.timeout_ctrl {
        config.control_timeout = ControlTimeout::from_millis(ms);
    }
    config.env.extend(args.env);
    if args.quiet_error {
        config.quiet_error = true;
    }
    if let Some(port) = args.local_port {
        config.local_port = Some(port);
    }
    Ok(config)
}

pub(crate) async fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let start_timeout = Duration::from_secs(args.start_timeout);
    let config = build_config(args)?;
    let name = config.name.clone();

    let mut handle = Pea::new(config).start().await?;
    if let Err(e) = handle.wait_start_success(Some(start_timeout)).await {
        handle.close().await?;
        return Err(e).with_context(|| format!("pea '{}' did not start", name));
    }

    println!("{} ready on {}", name, handle.control_address());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!(unit = %name, "Interrupted, closing"),
        _ = handle.wait_shutdown(None) => info!(unit = %name, "Unit shut down"),
    }

    handle.close().await?;
    Ok(())
}
