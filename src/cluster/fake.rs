//! Scriptable in-memory cluster used by the builder's own tests, in the
//! same spirit as the controller and object-store fakes.

use crate::cluster::client::{ClusterClient, LogStream, PodEventStream, WatchEvent};
use crate::cluster::types::{
    ContainerStatus, Job, JobIdentity, LabelSelector, Pod, PodPhase, Secret, TerminatedState,
};
use crate::errors::ClusterError;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

const SCRIPT_EVENT_GAP: Duration = Duration::from_millis(10);

/// In-memory stand-in for the cluster orchestrator.
///
/// Pods live in a flat store; watch events pushed via [`push_event`] or
/// scripted via [`script_watch`] update the store and reach any open
/// watch streams. All calls are recorded for ordering assertions.
///
/// [`push_event`]: FakeCluster::push_event
/// [`script_watch`]: FakeCluster::script_watch
pub struct FakeCluster {
    pods: DashMap<String, Pod>,
    secrets: DashMap<String, Secret>,
    namespaces: Mutex<Vec<String>>,
    watch_script: Mutex<Vec<WatchEvent>>,
    job_pod_script: Mutex<Option<(Vec<PodPhase>, Vec<i32>)>>,
    events: broadcast::Sender<WatchEvent>,
    log_output: Mutex<Vec<u8>>,
    pub fail_submission: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
    pub created_jobs: Mutex<Vec<Job>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            pods: DashMap::new(),
            secrets: DashMap::new(),
            namespaces: Mutex::new(vec!["default".to_string()]),
            watch_script: Mutex::new(Vec::new()),
            job_pod_script: Mutex::new(None),
            events,
            log_output: Mutex::new(Vec::new()),
            fail_submission: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            created_jobs: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: &str) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call.to_string());
    }

    pub fn recorded_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Seed or replace a pod in the store.
    pub fn put_pod(&self, pod: Pod) {
        self.pods.insert(pod.name.clone(), pod);
    }

    /// Apply an event to the store and forward it to open watch streams.
    pub fn push_event(&self, event: WatchEvent) {
        match &event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => self.put_pod(pod.clone()),
            WatchEvent::Deleted(pod) => {
                self.pods.remove(&pod.name);
            }
        }
        let _ = self.events.send(event);
    }

    /// Events every subsequently opened watch stream replays, spaced a
    /// few milliseconds apart, before switching to live events.
    pub fn script_watch(&self, events: Vec<WatchEvent>) {
        *self.watch_script.lock().unwrap_or_else(|e| e.into_inner()) = events;
    }

    /// Script the lifecycle of the next submitted job's pod: one watch
    /// event per phase, with the final observation carrying the given
    /// container exit codes. Failed phases report a generic reason.
    pub fn script_job_pod(&self, phases: &[PodPhase], exit_codes: &[i32]) {
        *self.job_pod_script.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((phases.to_vec(), exit_codes.to_vec()));
    }

    fn install_job_pod(&self, job: &Job) {
        let Some((phases, exit_codes)) = self
            .job_pod_script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        else {
            return;
        };
        let Some(first) = phases.first() else {
            return;
        };

        let base = Pod::stub(&format!("{}-pod", job.name), &job.name, *first);
        self.put_pod(base.clone());
        let last = phases.len() - 1;
        let events = phases
            .iter()
            .enumerate()
            .map(|(i, phase)| {
                let mut pod = base.clone();
                pod.status.phase = *phase;
                if *phase == PodPhase::Failed {
                    pod.status.reason = "Error".to_string();
                    pod.status.message = "build pod failed".to_string();
                }
                if i == last {
                    pod.status.container_statuses = exit_codes
                        .iter()
                        .map(|code| ContainerStatus {
                            name: "builder".to_string(),
                            terminated: Some(TerminatedState { exit_code: *code }),
                        })
                        .collect();
                }
                WatchEvent::Modified(pod)
            })
            .collect();
        *self.watch_script.lock().unwrap_or_else(|e| e.into_inner()) = events;
    }

    pub fn set_namespaces(&self, namespaces: Vec<String>) {
        *self.namespaces.lock().unwrap_or_else(|e| e.into_inner()) = namespaces;
    }

    pub fn set_log_output(&self, output: &[u8]) {
        *self.log_output.lock().unwrap_or_else(|e| e.into_inner()) = output.to_vec();
    }

    pub fn put_secret(&self, secret: Secret) {
        self.secrets.insert(secret.name.clone(), secret);
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.secrets.get(name).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_job(&self, job: &Job) -> Result<JobIdentity, ClusterError> {
        self.record("create_job");
        if let Some(message) = self
            .fail_submission
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(ClusterError::Api(message));
        }
        self.created_jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job.clone());
        self.install_job_pod(job);
        Ok(JobIdentity {
            namespace: job.namespace.clone(),
            name: job.name.clone(),
        })
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError> {
        self.record("list_pods");
        Ok(self
            .pods
            .iter()
            .filter(|entry| selector.matches(&entry.value().labels))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn watch_pods(&self, _namespace: &str) -> Result<PodEventStream, ClusterError> {
        self.record("watch_pods");
        let script = self
            .watch_script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        // Scripted events also land in the store so later gets observe
        // the same history the stream replays.
        for event in &script {
            match event {
                WatchEvent::Added(pod) | WatchEvent::Modified(pod) => self.put_pod(pod.clone()),
                WatchEvent::Deleted(pod) => {
                    self.pods.remove(&pod.name);
                }
            }
        }

        let scripted = futures::stream::iter(script).then(|event| async move {
            tokio::time::sleep(SCRIPT_EVENT_GAP).await;
            event
        });
        let live = futures::stream::unfold(self.events.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(scripted.chain(live).boxed())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        self.record("get_pod");
        self.pods
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClusterError::NotFound {
                kind: "pod".to_string(),
                name: name.to_string(),
            })
    }

    async fn stream_logs(&self, _namespace: &str, _pod: &str) -> Result<LogStream, ClusterError> {
        self.record("stream_logs");
        let output = self
            .log_output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Ok(Box::pin(std::io::Cursor::new(output)))
    }

    async fn get_secret(&self, _namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        self.record("get_secret");
        self.secrets
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClusterError::NotFound {
                kind: "secret".to_string(),
                name: name.to_string(),
            })
    }

    async fn create_secret(&self, _namespace: &str, secret: &Secret) -> Result<(), ClusterError> {
        self.record("create_secret");
        if self.secrets.contains_key(&secret.name) {
            return Err(ClusterError::AlreadyExists {
                kind: "secret".to_string(),
                name: secret.name.clone(),
            });
        }
        self.secrets.insert(secret.name.clone(), secret.clone());
        Ok(())
    }

    async fn update_secret(&self, _namespace: &str, secret: &Secret) -> Result<(), ClusterError> {
        self.record("update_secret");
        if !self.secrets.contains_key(&secret.name) {
            return Err(ClusterError::NotFound {
                kind: "secret".to_string(),
                name: secret.name.clone(),
            });
        }
        self.secrets.insert(secret.name.clone(), secret.clone());
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        self.record("list_namespaces");
        Ok(self
            .namespaces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}
