mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pea=info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => commands::run::cmd_run(args).await?,
        Commands::Ctl { target, command } => commands::ctl::cmd_ctl(target, command).await?,
        Commands::Unit {
            spec,
            ready_file,
            shutdown_file,
        } => {
            if !commands::unit::cmd_unit(&spec, &ready_file, &shutdown_file).await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
