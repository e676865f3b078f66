mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use syncpilot_types::ConnectionId;

#[derive(Parser)]
#[command(
    name = "syncpilot",
    version,
    about = "Durable scheduling, retry and cancellation of connection syncs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Path to syncpilot.yaml (defaults apply when absent)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Add or update a connection from its YAML definition
    Register {
        /// Path to connection YAML file
        connection: PathBuf,
    },
    /// Run the loop of every active connection until Ctrl-C
    Run,
    /// List a connection's jobs and attempts
    Jobs {
        connection_id: ConnectionId,
        /// Also print attempt log lines
        #[arg(long)]
        logs: bool,
    },
    /// Print the latest persisted retry counters of a connection
    RetryState { connection_id: ConnectionId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    let config = commands::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Register { connection } => commands::register::execute(&config, &connection),
        Commands::Run => commands::run::execute(&config).await,
        Commands::Jobs { connection_id, logs } => commands::jobs::execute(&config, connection_id, logs),
        Commands::RetryState { connection_id } => {
            commands::retry_state::execute(&config, connection_id)
        }
    }
}
