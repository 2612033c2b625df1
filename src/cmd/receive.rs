use anyhow::{Context, Result};
use slipway::config::ServerConfig;
use slipway::git::{self, ReceiveRequest};
use slipway::lock::RepositoryLock;

fn env_or_empty(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

/// Handle one SSH push channel on this process's stdio.
pub async fn receive() -> Result<()> {
    let cfg = ServerConfig::from_env()?;
    let raw = std::env::var("SSH_ORIGINAL_COMMAND")
        .context("SSH_ORIGINAL_COMMAND is not set; expected to be invoked by the SSH transport")?;
    let (operation, repo) = git::parse_original_command(&raw)?;

    let req = ReceiveRequest {
        repo,
        operation,
        username: env_or_empty("RECEIVE_USER"),
        fingerprint: env_or_empty("RECEIVE_FINGERPRINT"),
        conndata: env_or_empty("SSH_CONNECTION"),
    };
    let lock = RepositoryLock::new(cfg.lock_timeout);
    git::receive(
        &lock,
        &cfg.git_home,
        req,
        tokio::io::stdin(),
        tokio::io::stdout(),
        tokio::io::stderr(),
    )
    .await
}
