use anyhow::{Context, Result};
use slipway::build::{self, BuildDeps, StackTable};
use slipway::cluster::KubectlCluster;
use slipway::config::ReceiveConfig;
use slipway::controller::HttpControllerClient;
use slipway::storage::FsStore;
use std::sync::Arc;

/// Run the git-receive hook for the push feeding this process's stdin.
pub async fn git_receive() -> Result<()> {
    let cfg = ReceiveConfig::from_env()?;
    let deps = BuildDeps {
        store: Arc::new(FsStore::new(cfg.storage_root.clone())),
        cluster: Arc::new(KubectlCluster::new()),
        controller: Arc::new(HttpControllerClient::new(
            &cfg.controller_host,
            cfg.controller_port,
        )),
        stacks: StackTable::load(&cfg.stacks_file),
    };

    build::run(&cfg, &deps, tokio::io::stdin())
        .await
        .context("error running git receive hook")
}
