use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, ClientSettings, ControllerClient, EngineView, HttpCommandTransport,
    SettingsOverrides,
};
use shared::{
    domain::{Procedure, ProcedureId},
    protocol::{ProcedureDraft, StepDraft},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tempctl", about = "Temperature controller procedure client")]
struct Cli {
    /// Controller REST base url, e.g. http://localhost:8000
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// Progress WebSocket url; derived from the api url when omitted.
    #[arg(long, global = true)]
    ws_url: Option<String>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports known to the controller.
    Ports,
    SelectPort {
        name: String,
    },
    /// Set the manual setpoint in °C.
    SetTemp {
        #[arg(allow_negative_numbers = true)]
        celsius: f64,
    },
    List,
    Create {
        #[arg(long)]
        name: String,
        /// `<temperature>:<seconds>`, repeated once per step.
        #[arg(long = "step", value_parser = parse_step, required = true)]
        steps: Vec<StepDraft>,
    },
    Update {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long = "step", value_parser = parse_step, required = true)]
        steps: Vec<StepDraft>,
    },
    Delete {
        id: String,
    },
    Start {
        id: String,
    },
    Stop,
    Reset {
        id: String,
    },
    /// Follow live progress until Ctrl-C.
    Watch {
        #[arg(long)]
        focus: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let overrides = SettingsOverrides {
        api_url: cli.api_url.clone(),
        ws_url: cli.ws_url.clone(),
    };
    let settings = load_settings(cli.config.as_deref(), &overrides)?;
    info!(api = %settings.api_base_url, ws = %settings.ws_url, "tempctl: settings loaded");

    match cli.command {
        Command::Watch { focus } => {
            let client = ControllerClient::connect(&settings)
                .context("failed to create controller client")?;
            watch(&client, focus).await
        }
        command => {
            let client = command_client(&settings)?;
            run_command(&client, command).await
        }
    }
}

fn command_client(settings: &ClientSettings) -> Result<ControllerClient> {
    let transport =
        HttpCommandTransport::new(settings.api_base_url.clone(), settings.request_timeout)
            .context("failed to create http transport")?;
    Ok(ControllerClient::new(Arc::new(transport)))
}

async fn run_command(client: &ControllerClient, command: Command) -> Result<()> {
    let commands = client.commands();
    match command {
        Command::Ports => {
            let ports = commands.list_ports().await?;
            if ports.is_empty() {
                println!("no serial ports reported");
            }
            for port in ports {
                println!("{port}");
            }
        }
        Command::SelectPort { name } => {
            commands.select_port(name.clone()).await?;
            println!("selected port {name}");
        }
        Command::SetTemp { celsius } => {
            commands.set_temperature(celsius).await?;
            println!("setpoint {celsius} °C sent");
        }
        Command::List => {
            let procedures = commands.fetch_procedures().await?;
            if procedures.is_empty() {
                println!("no procedures");
            }
            for procedure in &procedures {
                println!("{}", summary_line(procedure));
            }
        }
        Command::Create { name, steps } => {
            let created = commands
                .create_procedure(ProcedureDraft::new(name, steps))
                .await?;
            println!("created {}", summary_line(&created));
        }
        Command::Update { id, name, steps } => {
            let updated = commands
                .update_procedure(ProcedureId::new(id), ProcedureDraft::new(name, steps))
                .await?;
            println!("updated {}", summary_line(&updated));
        }
        Command::Delete { id } => {
            commands.delete_procedure(ProcedureId::new(id.clone())).await?;
            println!("deleted {id}");
        }
        Command::Start { id } => {
            let started = commands.start_procedure(ProcedureId::new(id)).await?;
            println!("started {}", summary_line(&started));
        }
        Command::Stop => {
            let stopped = commands.stop_procedure().await?;
            println!("stopped {}", summary_line(&stopped));
        }
        Command::Reset { id } => {
            let reset = commands.reset_procedure(ProcedureId::new(id)).await?;
            println!("reset {}", summary_line(&reset));
        }
        Command::Watch { .. } => bail!("watch needs the push channel"),
    }
    Ok(())
}

async fn watch(client: &ControllerClient, focus: Option<String>) -> Result<()> {
    client
        .commands()
        .fetch_procedures()
        .await
        .context("initial procedure fetch failed")?;
    if let Some(id) = focus {
        if !client.focus(ProcedureId::new(id.clone())).await? {
            bail!("unknown procedure '{id}'");
        }
    }

    let mut views = client.engine().watch();
    let mut last_line = String::new();
    let mut exit_armed = false;
    loop {
        let line = progress_line(&views.borrow_and_update());
        if line != last_line {
            println!("{line}");
            last_line = line;
        }

        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    bail!("engine stopped");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                let view = client.view();
                if exit_armed || !view.exit_requires_confirmation() {
                    break;
                }
                exit_armed = true;
                let name = view.current_focus().map(|p| p.name.as_str()).unwrap_or("procedure");
                eprintln!("'{name}' is still running; press Ctrl-C again to exit");
            }
        }
    }
    Ok(())
}

fn parse_step(raw: &str) -> Result<StepDraft, String> {
    let (temperature, duration) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected <temperature>:<seconds>, got '{raw}'"))?;
    let temperature = temperature
        .trim()
        .parse::<f64>()
        .map_err(|err| format!("invalid temperature '{temperature}': {err}"))?;
    let duration = duration
        .trim()
        .parse::<u64>()
        .map_err(|err| format!("invalid duration '{duration}': {err}"))?;
    Ok(StepDraft {
        temperature,
        duration,
    })
}

fn status_label<T: std::fmt::Debug>(status: T) -> String {
    format!("{status:?}").to_lowercase()
}

fn summary_line(procedure: &Procedure) -> String {
    format!(
        "{} '{}' {} steps={} total={}s",
        procedure.id,
        procedure.name,
        status_label(procedure.status),
        procedure.steps.len(),
        procedure.total_duration()
    )
}

fn progress_line(view: &EngineView) -> String {
    let reading = match (view.reading.actual(), view.reading.setpoint()) {
        (Some(actual), Some(setpoint)) => format!("{actual:.1} °C (setpoint {setpoint:.1} °C)"),
        (Some(actual), None) => format!("{actual:.1} °C"),
        (None, Some(setpoint)) => format!("-- °C (setpoint {setpoint:.1} °C)"),
        (None, None) => "-- °C".to_string(),
    };
    let Some(procedure) = view.current_focus() else {
        return format!("no procedure focused | {reading}");
    };
    let step = match (procedure.current_step, procedure.active_step()) {
        (Some(index), Some(step)) => format!(
            " step {}/{} {:.1} °C {}/{}s",
            index + 1,
            procedure.steps.len(),
            step.temperature,
            step.elapsed_time,
            step.duration
        ),
        _ => String::new(),
    };
    format!(
        "{} [{}]{step} | {reading}",
        procedure.name,
        status_label(procedure.status)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_step_pairs() {
        let step = parse_step("120.5:90").expect("step");
        assert_eq!(step.temperature, 120.5);
        assert_eq!(step.duration, 90);
        assert!(parse_step("120").is_err());
        assert!(parse_step("hot:90").is_err());
        assert!(parse_step("120:-4").is_err());
    }

    #[test]
    fn cli_accepts_repeated_steps() {
        let cli = Cli::try_parse_from([
            "tempctl",
            "--api-url",
            "http://lab:8000",
            "create",
            "--name",
            "Bake",
            "--step",
            "80:60",
            "--step",
            "20:30",
        ])
        .expect("parse");
        match cli.command {
            Command::Create { name, steps } => {
                assert_eq!(name, "Bake");
                assert_eq!(steps.len(), 2);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
