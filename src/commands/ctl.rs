use pea::config::{ControlAddress, ControlTimeout};
use pea::control::{ControlClient, ControlResponse, ManagedCommand};

use crate::args::{CtlCommands, CtlTarget, ForwardCommand};

fn target_address(target: &CtlTarget) -> anyhow::Result<ControlAddress> {
    match (&target.ipc, target.port) {
        (Some(path), _) => Ok(ControlAddress::local(path.clone())),
        (None, Some(port)) => Ok(ControlAddress::tcp(target.host.clone(), port)),
        (None, None) => anyhow::bail!("either --port or --ipc is required"),
    }
}

fn print_response(response: &ControlResponse) {
    match response {
        ControlResponse::Status {
            state,
            runtime,
            pid,
            uptime_ms,
        } => println!("{} {} pid={} uptime={}ms", runtime, state, pid, uptime_ms),
        ControlResponse::Ready { ready } => println!("ready={}", ready),
        ControlResponse::Ok => println!("ok"),
        ControlResponse::Error { message } => println!("error: {}", message),
    }
}

pub(crate) async fn cmd_ctl(target: CtlTarget, command: CtlCommands) -> anyhow::Result<()> {
    let client = ControlClient::new(
        target_address(&target)?,
        ControlTimeout::from_millis(target.timeout),
    );

    match command {
        CtlCommands::Status => {
            let status = client.status().await?;
            println!(
                "{} {} pid={} uptime={}ms",
                status.runtime,
                status.state,
                status.pid,
                status.uptime.as_millis()
            );
        }
        CtlCommands::Ready => println!("ready={}", client.is_ready().await?),
        CtlCommands::Cancel => {
            client.cancel().await?;
            println!("ok");
        }
        CtlCommands::Forward { command } => {
            let command = match command {
                ForwardCommand::Status => ManagedCommand::Status,
                ForwardCommand::Ready => ManagedCommand::Ready,
                ForwardCommand::Cancel => ManagedCommand::Cancel,
            };
            print_response(&client.forward(command).await?);
        }
    }
    Ok(())
}
