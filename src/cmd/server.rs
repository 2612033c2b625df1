use anyhow::{Context, Result, bail};
use slipway::cleaner;
use slipway::cluster::{ClusterClient, KubectlCluster};
use slipway::config::ServerConfig;
use slipway::controller::{ControllerClient, HttpControllerClient};
use slipway::healthsrv::{self, HealthState};
use slipway::transport::{self, Circuit};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Run the three long-lived server tasks. Each reports its failure over
/// a one-shot channel; the first failure takes the whole process down.
pub async fn server() -> Result<()> {
    let cfg = ServerConfig::from_env()?;
    let circuit = Arc::new(Circuit::new());
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubectlCluster::new());
    let controller: Arc<dyn ControllerClient> = Arc::new(HttpControllerClient::new(
        &cfg.controller_host,
        cfg.controller_port,
    ));

    tracing::info!(port = cfg.health_srv_port, "starting health check server");
    let (health_tx, health_rx) = oneshot::channel();
    {
        let state = HealthState {
            circuit: circuit.clone(),
            controller: controller.clone(),
            cluster: cluster.clone(),
        };
        let port = cfg.health_srv_port;
        tokio::spawn(async move {
            let _ = health_tx.send(healthsrv::start(port, state).await);
        });
    }

    tracing::info!("starting deleted app cleaner");
    let (cleaner_tx, cleaner_rx) = oneshot::channel();
    {
        let git_home = cfg.git_home.clone();
        let cluster = cluster.clone();
        let poll = cfg.cleaner_poll_sleep;
        tokio::spawn(async move {
            let _ = cleaner_tx.send(cleaner::run(&git_home, cluster, poll).await);
        });
    }

    tracing::info!(
        ip = %cfg.ssh_host_ip,
        port = cfg.ssh_host_port,
        "starting SSH transport"
    );
    let (transport_tx, transport_rx) = oneshot::channel();
    {
        let command = cfg.transport_command.clone();
        let circuit = circuit.clone();
        tokio::spawn(async move {
            let _ = transport_tx.send(transport::serve(&command, circuit).await);
        });
    }

    tokio::select! {
        res = health_rx => first_failure("health server", res),
        res = cleaner_rx => first_failure("deleted app cleaner", res),
        res = transport_rx => first_failure("SSH transport", res),
    }
}

fn first_failure(
    what: &str,
    res: Result<Result<()>, oneshot::error::RecvError>,
) -> Result<()> {
    match res {
        Ok(Ok(())) => bail!("{what} stopped unexpectedly"),
        Ok(Err(err)) => Err(err).with_context(|| format!("error running {what}")),
        Err(_) => bail!("{what} task went away without reporting"),
    }
}
