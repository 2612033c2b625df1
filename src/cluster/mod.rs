//! Cluster orchestrator interface: domain types, the client contract,
//! the pod observation cache, and the kubectl-backed implementation.

mod client;
pub mod fake;
mod kubectl;
mod types;
mod watch;

pub use client::{ClusterClient, LogStream, PodEventStream, WatchEvent, create_or_update_secret};
pub use kubectl::KubectlCluster;
pub use types::{
    Container, ContainerStatus, EnvVar, HERITAGE_LABEL, Job, JobIdentity, LabelSelector, Pod,
    PodPhase, PodStatus, PullPolicy, Secret, SecurityContext, TerminatedState, Volume, VolumeMount,
};
pub use watch::PodWatcher;
