//! Construction of the ephemeral build job descriptor.

use crate::cluster::{
    Container, EnvVar, HERITAGE_LABEL, Job, PullPolicy, SecurityContext, Volume, VolumeMount,
};
use crate::errors::BuildError;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const TAR_PATH_VAR: &str = "TAR_PATH";
pub const SOURCE_VERSION_VAR: &str = "SOURCE_VERSION";
pub const IMAGE_NAME_VAR: &str = "IMAGE_NAME";
pub const DEBUG_VAR: &str = "SLIPWAY_DEBUG";

/// Presence of this app configuration value turns the whole
/// configuration map into JSON build args.
pub const BUILD_ARGS_FLAG: &str = "SLIPWAY_BUILD_ARGS_ENABLED";
pub const BUILD_ARGS_VAR: &str = "BUILD_ARGS";

/// Config volume supplying registry and storage credentials to the
/// build container.
const BUILDER_CONFIG: &str = "builder-config";
const BUILDER_CONFIG_PATH: &str = "/etc/slipway";

const JOB_NAME_PREFIX: &str = "imagebuild";
// Pod names cannot exceed 63 characters, so the application-name
// segment is truncated to leave room for prefix, hash, and suffix.
const APP_NAME_MAX: usize = 33;
const NAME_SUFFIX_LEN: usize = 8;

pub const DEFAULT_TTL_SECONDS: i64 = 21600;

/// Generate the job name: `imagebuild-<app>-<short>-<random>`, always
/// within the orchestrator's 63-character ceiling.
pub fn build_job_name(app: &str, short_sha: &str) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(NAME_SUFFIX_LEN)
        .collect();
    let app = if app.len() > APP_NAME_MAX {
        &app[..APP_NAME_MAX]
    } else {
        app
    };
    format!("{JOB_NAME_PREFIX}-{app}-{short_sha}-{suffix}")
}

/// Parse a `key:value,key:value` node-selector string. Every
/// comma-separated clause must hold exactly one `key:value` pair after
/// trimming; anything else is rejected with the raw input.
pub fn parse_node_selector(raw: &str) -> Result<BTreeMap<String, String>, BuildError> {
    let mut selector = BTreeMap::new();
    if raw.is_empty() {
        return Ok(selector);
    }
    for clause in raw.split(',') {
        let parts: Vec<&str> = clause.split(':').collect();
        if parts.len() != 2 {
            return Err(BuildError::InvalidNodeSelector {
                raw: raw.to_string(),
            });
        }
        selector.insert(parts[0].trim().to_string(), parts[1].trim().to_string());
    }
    Ok(selector)
}

/// Every input of the build job, collected before any descriptor
/// exists. [`BuildJobSpec::into_job`] constructs the complete
/// descriptor in one step so no partially built job can escape.
#[derive(Debug, Clone)]
pub struct BuildJobSpec {
    pub debug: bool,
    pub name: String,
    pub namespace: String,
    /// Application configuration values, injected as build-time env.
    pub app_env: BTreeMap<String, String>,
    pub tar_key: String,
    pub short_sha: String,
    pub image_name: String,
    pub builder_name: String,
    pub builder_image: String,
    /// Registry and stack bindings for the builder itself.
    pub builder_env: BTreeMap<String, String>,
    pub pull_policy: PullPolicy,
    pub security_context: SecurityContext,
    pub node_selector: BTreeMap<String, String>,
    pub ttl_seconds_after_finished: i64,
}

impl BuildJobSpec {
    pub fn into_job(self) -> Job {
        // All env sources merge into one map first; the descriptor's
        // ordered list is materialized exactly once, so duplicate keys
        // cannot occur.
        let mut env = self.app_env.clone();
        if env.contains_key(BUILD_ARGS_FLAG) {
            env.insert(
                BUILD_ARGS_VAR.to_string(),
                serde_json::to_string(&self.app_env).unwrap_or_default(),
            );
        }
        env.insert(TAR_PATH_VAR.to_string(), self.tar_key);
        env.insert(SOURCE_VERSION_VAR.to_string(), self.short_sha);
        env.insert(IMAGE_NAME_VAR.to_string(), self.image_name);
        env.extend(self.builder_env);
        if self.debug {
            env.insert(DEBUG_VAR.to_string(), "1".to_string());
        }

        let labels = BTreeMap::from([(HERITAGE_LABEL.to_string(), self.name.clone())]);
        Job {
            name: self.name,
            namespace: self.namespace,
            labels: labels.clone(),
            backoff_limit: 0,
            ttl_seconds_after_finished: self.ttl_seconds_after_finished,
            template_labels: labels,
            node_selector: self.node_selector,
            volumes: vec![Volume {
                name: BUILDER_CONFIG.to_string(),
                config_map: BUILDER_CONFIG.to_string(),
            }],
            container: Container {
                name: self.builder_name,
                image: self.builder_image,
                image_pull_policy: self.pull_policy,
                env: env
                    .into_iter()
                    .map(|(name, value)| EnvVar { name, value })
                    .collect(),
                security_context: self.security_context,
                volume_mounts: vec![VolumeMount {
                    name: BUILDER_CONFIG.to_string(),
                    mount_path: BUILDER_CONFIG_PATH.to_string(),
                    read_only: true,
                }],
            },
        }
    }
}
