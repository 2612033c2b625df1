//! Locally cached, eventually consistent view of the pods belonging to
//! one build job.
//!
//! A single feed task lists the namespace, then applies watch events
//! incrementally. Whenever the watch stream breaks, the task relists so
//! the cache can never silently go stale. Readers only ever see pods
//! matching the job-identity selector.

use crate::cluster::client::{ClusterClient, WatchEvent};
use crate::cluster::types::{LabelSelector, Pod};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

const RESYNC_BACKOFF: Duration = Duration::from_secs(1);

type PodCache = Arc<RwLock<HashMap<String, Pod>>>;

/// Watches the pods of one build job for the lifetime of that build.
/// Dropping the watcher tears the feed task down.
pub struct PodWatcher {
    pods: PodCache,
    feed: JoinHandle<()>,
}

impl PodWatcher {
    pub fn spawn(
        client: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        selector: LabelSelector,
    ) -> Self {
        let pods: PodCache = Arc::new(RwLock::new(HashMap::new()));
        let feed = tokio::spawn(feed(client, namespace.into(), selector, pods.clone()));
        Self { pods, feed }
    }

    /// Snapshot of the cached pods, every one matching the selector.
    pub fn pods(&self) -> Vec<Pod> {
        self.pods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

impl Drop for PodWatcher {
    fn drop(&mut self) {
        self.feed.abort();
    }
}

async fn feed(
    client: Arc<dyn ClusterClient>,
    namespace: String,
    selector: LabelSelector,
    pods: PodCache,
) {
    loop {
        match client.list_pods(&namespace, &selector).await {
            Ok(list) => {
                let fresh: HashMap<String, Pod> = list
                    .into_iter()
                    .filter(|pod| selector.matches(&pod.labels))
                    .map(|pod| (pod.name.clone(), pod))
                    .collect();
                *pods.write().unwrap_or_else(|e| e.into_inner()) = fresh;
            }
            Err(err) => {
                tracing::warn!(%namespace, %err, "listing pods for watch cache");
                tokio::time::sleep(RESYNC_BACKOFF).await;
                continue;
            }
        }

        match client.watch_pods(&namespace).await {
            Ok(mut stream) => {
                while let Some(event) = stream.next().await {
                    apply(&selector, &pods, event);
                }
                tracing::debug!(%namespace, "pod watch stream ended, relisting");
            }
            Err(err) => {
                tracing::warn!(%namespace, %err, "opening pod watch");
            }
        }
        tokio::time::sleep(RESYNC_BACKOFF).await;
    }
}

fn apply(selector: &LabelSelector, pods: &PodCache, event: WatchEvent) {
    let mut cache = pods.write().unwrap_or_else(|e| e.into_inner());
    match event {
        WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
            if selector.matches(&pod.labels) {
                cache.insert(pod.name.clone(), pod);
            }
        }
        WatchEvent::Deleted(pod) => {
            cache.remove(&pod.name);
        }
    }
}
