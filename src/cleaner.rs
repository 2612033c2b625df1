//! Periodic sweep removing local repositories whose application no
//! longer has a namespace in the cluster.

use crate::cluster::ClusterClient;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Run the cleaner loop. Transient cluster errors are logged and the
/// sweep retried on the next tick; a missing git home is fatal.
pub async fn run(
    git_home: &Path,
    cluster: Arc<dyn ClusterClient>,
    poll_sleep: Duration,
) -> Result<()> {
    tracing::info!(git_home = %git_home.display(), "starting deleted app cleaner");
    loop {
        tokio::time::sleep(poll_sleep).await;
        match cluster.list_namespaces().await {
            Ok(namespaces) => {
                sweep(git_home, &namespaces.into_iter().collect())?;
            }
            Err(err) => {
                tracing::warn!(%err, "listing namespaces for cleaner sweep");
            }
        }
    }
}

/// Remove every `<app>.git` directory whose app has no namespace.
fn sweep(git_home: &Path, namespaces: &HashSet<String>) -> Result<()> {
    let entries = std::fs::read_dir(git_home)
        .with_context(|| format!("reading git home {}", git_home.display()))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(app) = name.strip_suffix(".git") else {
            continue;
        };
        if namespaces.contains(app) {
            continue;
        }
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        tracing::info!(repo = name, "removing repository of deleted app");
        if let Err(err) = std::fs::remove_dir_all(&path) {
            tracing::warn!(path = %path.display(), %err, "removing orphaned repository");
        }
    }
    Ok(())
}
