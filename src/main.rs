use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "slipway")]
#[command(version, about = "Turns git pushes into container image releases")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the builder server: health endpoint, repository cleaner, and
    /// SSH transport
    #[command(alias = "srv")]
    Server,
    /// Handle one SSH push channel on stdio (invoked by the transport)
    Receive,
    /// Run the git-receive hook for a single push (invoked by the
    /// pre-receive hook)
    #[command(name = "git-receive", alias = "gr")]
    GitReceive,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if std::env::var("SLIPWAY_DEBUG").as_deref() == Ok("true") {
                EnvFilter::new("slipway=debug")
            } else {
                EnvFilter::new("slipway=info")
            }
        }))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server => cmd::server().await,
        Commands::Receive => cmd::receive().await,
        Commands::GitReceive => cmd::git_receive().await,
    }
}
