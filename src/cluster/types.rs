//! Domain types for the cluster orchestrator: the job descriptor the
//! builder submits and the pod objects it observes.

use crate::errors::BuildError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Label placed on the job and its pods, carrying the job identity the
/// watcher filters by.
pub const HERITAGE_LABEL: &str = "heritage";

/// One environment entry on the build container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Container image pull policies the orchestrator recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl FromStr for PullPolicy {
    type Err = BuildError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "Always" => Ok(PullPolicy::Always),
            "IfNotPresent" => Ok(PullPolicy::IfNotPresent),
            "Never" => Ok(PullPolicy::Never),
            _ => Err(BuildError::InvalidPullPolicy {
                raw: raw.to_string(),
            }),
        }
    }
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        }
    }
}

/// Security posture of the build container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    pub privileged: bool,
}

impl SecurityContext {
    /// The build container runs privileged; it assembles images.
    pub fn privileged() -> Self {
        Self { privileged: true }
    }
}

/// A config-backed volume attached to the build pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub config_map: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
}

/// The single build container of the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    pub image_pull_policy: PullPolicy,
    pub env: Vec<EnvVar>,
    pub security_context: SecurityContext,
    pub volume_mounts: Vec<VolumeMount>,
}

/// Declarative description of one ephemeral build job. Constructed once
/// per build and never mutated after submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub backoff_limit: i32,
    pub ttl_seconds_after_finished: i64,
    pub template_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    pub volumes: Vec<Volume>,
    pub container: Container,
}

impl Job {
    /// Value of an env entry on the build container, if present.
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.container
            .env
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    /// How many env entries carry the given name.
    pub fn env_count(&self, name: &str) -> usize {
        self.container.env.iter().filter(|e| e.name == name).count()
    }
}

/// Identity the orchestrator assigned to a submitted job; authoritative
/// from submission on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdentity {
    pub namespace: String,
    pub name: String,
}

/// Observed pod lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminatedState {
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub terminated: Option<TerminatedState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    pub phase: PodPhase,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

/// Local view of a pod belonging to the build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub status: PodStatus,
}

impl Pod {
    /// A minimal pod in the given phase, labeled for `job_name`. Test
    /// scaffolding shared by the builder's own suites.
    pub fn stub(name: &str, job_name: &str, phase: PodPhase) -> Self {
        Self {
            name: name.to_string(),
            namespace: "default".to_string(),
            labels: BTreeMap::from([(HERITAGE_LABEL.to_string(), job_name.to_string())]),
            status: PodStatus {
                phase,
                reason: String::new(),
                message: String::new(),
                container_statuses: Vec::new(),
            },
        }
    }
}

/// A secret the builder upserts into the job's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn heritage(job_name: &str) -> Self {
        Self(BTreeMap::from([(
            HERITAGE_LABEL.to_string(),
            job_name.to_string(),
        )]))
    }

    /// Whether a pod's labels satisfy every clause of the selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    /// The selector in `key=value,key=value` form.
    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_policy_parses_the_three_known_policies() {
        assert_eq!("Always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!(
            "IfNotPresent".parse::<PullPolicy>().unwrap(),
            PullPolicy::IfNotPresent
        );
        assert_eq!("Never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
    }

    #[test]
    fn pull_policy_rejects_unknown_strings() {
        let err = "always".parse::<PullPolicy>().unwrap_err();
        assert_eq!(err.to_string(), "always is an invalid pull policy");
    }

    #[test]
    fn selector_matches_superset_labels() {
        let selector = LabelSelector::heritage("imagebuild-demo");
        let mut labels = BTreeMap::from([(
            HERITAGE_LABEL.to_string(),
            "imagebuild-demo".to_string(),
        )]);
        assert!(selector.matches(&labels));

        labels.insert("extra".to_string(), "yes".to_string());
        assert!(selector.matches(&labels));

        labels.insert(HERITAGE_LABEL.to_string(), "other".to_string());
        assert!(!selector.matches(&labels));
        assert!(!selector.matches(&BTreeMap::new()));
    }

    #[test]
    fn selector_query_form_is_key_equals_value() {
        let selector = LabelSelector::heritage("job-1");
        assert_eq!(selector.to_query(), "heritage=job-1");
    }
}
