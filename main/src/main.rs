mod cli;
mod commands;

use clap::Parser;
use retrieval_pipeline::Services;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Command};
use commands::AskOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let services = Services::new();

    let result = run(&services, cli.command).await;
    if let Err(err) = &result {
        error!(error = %err, "Command failed");
    }
    result
}

async fn run(services: &Services, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ask {
            question,
            sources,
            since,
            until,
            k_final,
        } => {
            let options = AskOptions {
                sources,
                since,
                until,
                k_final,
            };
            let answer = commands::ask(services, &question, options).await?;
            println!("{}", answer.text);
            eprintln!("{}", serde_json::to_string_pretty(&answer.diagnostics)?);
        }
        Command::IngestText { path } => {
            let summary = commands::ingest_text(services, &path).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Status => {
            let status = commands::status(services).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}
