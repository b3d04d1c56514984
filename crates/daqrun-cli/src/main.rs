use clap::Parser;
use commands::Commands;
use std::process::ExitCode;

mod client;
mod commands;

/// daqrun - supervise one online DAQ capture session
#[derive(Parser, Debug)]
#[command(name = "daqrun")]
#[command(version = "0.1.0")]
#[command(
    about = "Start DAQ, wait for trigger, and save online analyzer output in one flow",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so replies printed by the operator commands stay
    // machine readable on stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = match cli.command.execute().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("Error: {:#}", e);
            daqrun_common::ExitCode::Precondition.code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
