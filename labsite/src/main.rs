//! `labsite` command-line entry point.
//!
//! ```text
//! labsite [--config <path>] get <path>
//! labsite [--config <path>] projects [current|past]
//! labsite [--config <path>] categories
//! ```
//!
//! Results are printed to stdout as pretty JSON.

use labsite::{init_logging, LabClient, LogFormat};
use labsite_core::{LabConfig, LabError, LabResult, ProjectStatus};
use serde_json::Value;

#[derive(Debug, PartialEq)]
enum Command {
    Get(String),
    Projects(Option<ProjectStatus>),
    Categories,
}

const USAGE: &str =
    "usage: labsite [--config <path>] (get <path> | projects [current|past] | categories)";

/// Positional arguments with `--config <path>` removed.
fn positional(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            iter.next();
        } else {
            out.push(arg.as_str());
        }
    }
    out
}

fn parse_command(args: &[String]) -> LabResult<Command> {
    match positional(args).as_slice() {
        ["get", path] => Ok(Command::Get(path.to_string())),
        ["projects"] => Ok(Command::Projects(None)),
        ["projects", status] => ProjectStatus::parse(status)
            .map(|s| Command::Projects(Some(s)))
            .ok_or_else(|| LabError::invalid_request(format!("unknown status {}", status))),
        ["categories"] => Ok(Command::Categories),
        _ => Err(LabError::invalid_request(USAGE)),
    }
}

async fn run(client: &LabClient, command: Command) -> LabResult<Value> {
    match command {
        Command::Get(path) => Ok(client.get(&path).await?.as_ref().clone()),
        Command::Projects(status) => {
            let data = client
                .queries()
                .fetch(&labsite::queries::projects(client.transport(), status))
                .await?;
            Ok(data.as_ref().clone())
        }
        Command::Categories => Ok(Value::from(client.project_categories().await?)),
    }
}

#[tokio::main]
async fn main() -> LabResult<()> {
    init_logging(LogFormat::from_env())?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args)?;
    let config = LabConfig::load()?;
    let client = LabClient::new(config)?;

    tracing::debug!(command = ?command, "running command");
    let output = run(&client, command).await?;
    let rendered = serde_json::to_string_pretty(&output)
        .map_err(|e| LabError::internal(format!("render output: {}", e)))?;
    println!("{}", rendered);
    Ok(())
}
