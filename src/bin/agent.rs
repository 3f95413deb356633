use clap::{Parser, Subcommand};

use pando_agent::{
    agent::{self, Agent},
    schedule::FileScheduleProvider,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the agent and configure it using a config file.
    Config {
        /// Path to the config file.
        #[arg(short)]
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { file } => {
            let config = agent::Config::from_file(file).await?;

            let provider = Box::new(FileScheduleProvider::new(config.schedule.file.clone()));

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

            let agent = Agent::new(&config, provider, shutdown_rx.clone())?;
            let agent_handle = tokio::spawn(agent.run(shutdown_rx));

            let mut terminate = signal(SignalKind::terminate())?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }

            info!("signal received, letting the in-flight tick finish");
            shutdown_tx.send(true)?;

            agent_handle.await?;
        }
    }

    Ok(())
}
