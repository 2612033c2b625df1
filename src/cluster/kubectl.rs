//! Cluster client backed by the `kubectl` binary.
//!
//! The builder never speaks the orchestrator wire protocol itself; it
//! drives `kubectl` as a subprocess and exchanges JSON on stdio, the
//! same way the rest of this codebase drives `git`.

use crate::cluster::client::{ClusterClient, LogStream, PodEventStream, WatchEvent};
use crate::cluster::types::{
    ContainerStatus, Job, JobIdentity, LabelSelector, Pod, PodPhase, PodStatus, Secret,
    TerminatedState,
};
use crate::errors::ClusterError;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Template that makes kubectl decode secret data server-side, emitting
/// plain `key=value` lines.
const SECRET_TEMPLATE: &str =
    r#"{{range $k, $v := .data}}{{$k}}={{$v | base64decode}}{{"\n"}}{{end}}"#;

#[derive(Clone)]
pub struct KubectlCluster {
    bin: String,
}

impl Default for KubectlCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl KubectlCluster {
    pub fn new() -> Self {
        Self {
            bin: "kubectl".to_string(),
        }
    }

    pub fn with_binary(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn kubectl(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>, ClusterError> {
        run_kubectl(&self.bin, args, stdin).await
    }
}

async fn run_kubectl(
    bin: &str,
    args: &[&str],
    stdin: Option<&[u8]>,
) -> Result<Vec<u8>, ClusterError> {
    tracing::debug!(command = %format!("{bin} {}", args.join(" ")), "running kubectl");
    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|err| ClusterError::Api(format!("spawning {bin}: {err}")))?;

    if let Some(data) = stdin {
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| ClusterError::Api("no stdin pipe on kubectl".to_string()))?;
        pipe.write_all(data)
            .await
            .map_err(|err| ClusterError::Api(format!("writing to {bin}: {err}")))?;
        pipe.shutdown()
            .await
            .map_err(|err| ClusterError::Api(format!("closing {bin} stdin: {err}")))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| ClusterError::Api(format!("waiting for {bin}: {err}")))?;
    if !output.status.success() {
        return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
    }
    Ok(output.stdout)
}

/// Map kubectl's server error markers onto the typed error space.
fn classify_failure(stderr: &str) -> ClusterError {
    let message = stderr.trim().to_string();
    if message.contains("(AlreadyExists)") {
        ClusterError::AlreadyExists {
            kind: "resource".to_string(),
            name: first_quoted(&message).unwrap_or_else(|| "unknown".to_string()),
        }
    } else if message.contains("(NotFound)") {
        ClusterError::NotFound {
            kind: "resource".to_string(),
            name: first_quoted(&message).unwrap_or_else(|| "unknown".to_string()),
        }
    } else {
        ClusterError::Api(message)
    }
}

fn first_quoted(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let end = start + message[start..].find('"')?;
    Some(message[start..end].to_string())
}

/// Render the job descriptor as a batch/v1 manifest.
fn job_manifest(job: &Job) -> Value {
    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "volumes": job
            .volumes
            .iter()
            .map(|v| json!({"name": v.name, "configMap": {"name": v.config_map}}))
            .collect::<Vec<_>>(),
        "containers": [{
            "name": job.container.name,
            "image": job.container.image,
            "imagePullPolicy": job.container.image_pull_policy.as_str(),
            "securityContext": {"privileged": job.container.security_context.privileged},
            "env": job
                .container
                .env
                .iter()
                .map(|e| json!({"name": e.name, "value": e.value}))
                .collect::<Vec<_>>(),
            "volumeMounts": job
                .container
                .volume_mounts
                .iter()
                .map(|m| json!({"name": m.name, "mountPath": m.mount_path, "readOnly": m.read_only}))
                .collect::<Vec<_>>(),
        }],
    });
    if !job.node_selector.is_empty() {
        pod_spec["nodeSelector"] = json!(job.node_selector);
    }

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job.name,
            "namespace": job.namespace,
            "labels": job.labels,
        },
        "spec": {
            "backoffLimit": job.backoff_limit,
            "ttlSecondsAfterFinished": job.ttl_seconds_after_finished,
            "template": {
                "metadata": {"labels": job.template_labels},
                "spec": pod_spec,
            },
        },
    })
}

fn secret_manifest(namespace: &str, secret: &Secret) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": secret.name, "namespace": namespace},
        "type": "Opaque",
        "stringData": secret.data,
    })
}

fn string_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(key)?;
    }
    cursor.as_str()
}

/// Decode one pod object out of kubectl's JSON output.
fn pod_from_value(value: &Value) -> Option<Pod> {
    let name = string_at(value, &["metadata", "name"])?.to_string();
    let namespace = string_at(value, &["metadata", "namespace"])
        .unwrap_or("default")
        .to_string();
    let labels: BTreeMap<String, String> = value
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let phase = match string_at(value, &["status", "phase"]).unwrap_or("Unknown") {
        "Pending" => PodPhase::Pending,
        "Running" => PodPhase::Running,
        "Succeeded" => PodPhase::Succeeded,
        "Failed" => PodPhase::Failed,
        _ => PodPhase::Unknown,
    };
    let reason = string_at(value, &["status", "reason"])
        .unwrap_or_default()
        .to_string();
    let message = string_at(value, &["status", "message"])
        .unwrap_or_default()
        .to_string();

    let container_statuses = value
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .map(|statuses| {
            statuses
                .iter()
                .filter_map(|cs| {
                    let name = string_at(cs, &["name"])?.to_string();
                    let terminated = cs
                        .pointer("/state/terminated/exitCode")
                        .and_then(Value::as_i64)
                        .map(|code| TerminatedState {
                            exit_code: code as i32,
                        });
                    Some(ContainerStatus { name, terminated })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(Pod {
        name,
        namespace,
        labels,
        status: PodStatus {
            phase,
            reason,
            message,
            container_statuses,
        },
    })
}

fn pods_from_list(data: &[u8]) -> Result<Vec<Pod>, ClusterError> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|err| ClusterError::Api(format!("decoding pod list: {err}")))?;
    Ok(value
        .pointer("/items")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(pod_from_value).collect())
        .unwrap_or_default())
}

#[async_trait]
impl ClusterClient for KubectlCluster {
    async fn create_job(&self, job: &Job) -> Result<JobIdentity, ClusterError> {
        let manifest = serde_json::to_vec(&job_manifest(job))
            .map_err(|err| ClusterError::Api(format!("encoding job manifest: {err}")))?;
        let output = self
            .kubectl(
                &["create", "-f", "-", "-o", "json", "-n", &job.namespace],
                Some(&manifest),
            )
            .await?;
        let value: Value = serde_json::from_slice(&output)
            .map_err(|err| ClusterError::Api(format!("decoding created job: {err}")))?;
        Ok(JobIdentity {
            namespace: string_at(&value, &["metadata", "namespace"])
                .unwrap_or(&job.namespace)
                .to_string(),
            name: string_at(&value, &["metadata", "name"])
                .unwrap_or(&job.name)
                .to_string(),
        })
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError> {
        let query = selector.to_query();
        let mut args = vec!["get", "pods", "-n", namespace, "-o", "json"];
        if !query.is_empty() {
            args.extend(["-l", query.as_str()]);
        }
        let output = self.kubectl(&args, None).await?;
        pods_from_list(&output)
    }

    async fn watch_pods(&self, namespace: &str) -> Result<PodEventStream, ClusterError> {
        use futures_util::StreamExt;

        struct PollState {
            bin: String,
            namespace: String,
            queue: std::collections::VecDeque<WatchEvent>,
        }

        // kubectl has no line-oriented watch output, so the stream is
        // poll-driven: every tick relists and emits the current pods as
        // modifications. The watcher's cache applies them idempotently.
        let state = PollState {
            bin: self.bin.clone(),
            namespace: namespace.to_string(),
            queue: std::collections::VecDeque::new(),
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.queue.pop_front() {
                    return Some((event, state));
                }
                tokio::time::sleep(WATCH_POLL_INTERVAL).await;
                let args = ["get", "pods", "-n", state.namespace.as_str(), "-o", "json"];
                match run_kubectl(&state.bin, &args, None).await {
                    Ok(output) => match pods_from_list(&output) {
                        Ok(pods) => {
                            state
                                .queue
                                .extend(pods.into_iter().map(WatchEvent::Modified));
                        }
                        Err(err) => {
                            tracing::warn!(%err, "decoding watched pods");
                            return None;
                        }
                    },
                    Err(err) => {
                        tracing::warn!(%err, "polling pods for watch");
                        return None;
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        let output = self
            .kubectl(&["get", "pod", name, "-n", namespace, "-o", "json"], None)
            .await?;
        let value: Value = serde_json::from_slice(&output)
            .map_err(|err| ClusterError::Api(format!("decoding pod {name}: {err}")))?;
        pod_from_value(&value).ok_or_else(|| ClusterError::NotFound {
            kind: "pod".to_string(),
            name: name.to_string(),
        })
    }

    async fn stream_logs(&self, namespace: &str, pod: &str) -> Result<LogStream, ClusterError> {
        let mut child = Command::new(&self.bin)
            .args(["logs", "-f", pod, "-n", namespace])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| ClusterError::Api(format!("spawning {} logs: {err}", self.bin)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClusterError::Api("no stdout pipe on kubectl logs".to_string()))?;
        Ok(Box::pin(stdout))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        let template = format!("-o=go-template={SECRET_TEMPLATE}");
        let output = self
            .kubectl(&["get", "secret", name, "-n", namespace, &template], None)
            .await?;
        let data = parse_secret_lines(&String::from_utf8_lossy(&output));
        Ok(Secret {
            name: name.to_string(),
            data,
        })
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError> {
        let manifest = serde_json::to_vec(&secret_manifest(namespace, secret))
            .map_err(|err| ClusterError::Api(format!("encoding secret manifest: {err}")))?;
        self.kubectl(&["create", "-f", "-", "-n", namespace], Some(&manifest))
            .await?;
        Ok(())
    }

    async fn update_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError> {
        let manifest = serde_json::to_vec(&secret_manifest(namespace, secret))
            .map_err(|err| ClusterError::Api(format!("encoding secret manifest: {err}")))?;
        self.kubectl(&["replace", "-f", "-", "-n", namespace], Some(&manifest))
            .await?;
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        let output = self.kubectl(&["get", "namespaces", "-o", "name"], None).await?;
        Ok(String::from_utf8_lossy(&output)
            .lines()
            .filter_map(|line| line.strip_prefix("namespace/"))
            .map(str::to_string)
            .collect())
    }
}

fn parse_secret_lines(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
