//! The narrow orchestrator contract the build pipeline consumes.

use crate::cluster::types::{Job, JobIdentity, LabelSelector, Pod, Secret};
use crate::errors::ClusterError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// One incremental change to the observed pod set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

pub type PodEventStream = BoxStream<'static, WatchEvent>;
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Submit a job; the returned identity is authoritative from here on.
    async fn create_job(&self, job: &Job) -> Result<JobIdentity, ClusterError>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError>;

    /// Open a watch over all pods in the namespace. The stream ends when
    /// the underlying watch terminates; callers relist and re-watch.
    async fn watch_pods(&self, namespace: &str) -> Result<PodEventStream, ClusterError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;

    /// Open a follow-mode log stream for the pod's build container.
    async fn stream_logs(&self, namespace: &str, pod: &str) -> Result<LogStream, ClusterError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError>;

    async fn update_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError>;

    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError>;
}

/// Create the secret, falling back to an update when it already exists.
pub async fn create_or_update_secret(
    client: &dyn ClusterClient,
    namespace: &str,
    secret: &Secret,
) -> Result<(), ClusterError> {
    match client.create_secret(namespace, secret).await {
        Err(err) if err.is_already_exists() => client.update_secret(namespace, secret).await,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;

    #[tokio::test]
    async fn create_or_update_falls_back_to_update() {
        let fake = FakeCluster::new();
        let secret = Secret {
            name: "demo-build-env".to_string(),
            data: Default::default(),
        };

        create_or_update_secret(&fake, "default", &secret)
            .await
            .unwrap();
        // A second create conflicts and must be routed to update.
        create_or_update_secret(&fake, "default", &secret)
            .await
            .unwrap();

        let calls = fake.recorded_calls();
        assert_eq!(
            calls,
            vec![
                "create_secret",
                "create_secret",
                "update_secret"
            ]
        );
    }
}
