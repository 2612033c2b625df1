//! Environment-driven configuration for the two process roles: the
//! long-lived server and the per-push git-receive hook.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_GIT_HOME: &str = "/workspace";
const DEFAULT_BUILDER_KEY_FILE: &str = "/var/run/secrets/slipway/builder-key";
const DEFAULT_STACKS_FILE: &str = "/etc/slipway/stacks.json";
const DEFAULT_STORAGE_ROOT: &str = "/var/run/slipway/objects";
const DEFAULT_CONTROLLER_HOST: &str = "slipway-controller";
const DEFAULT_TRANSPORT_COMMAND: &str = "/usr/sbin/sshd -D -e";

const DEFAULT_POD_TICK: Duration = Duration::from_secs(1);
const DEFAULT_POD_WAIT: Duration = Duration::from_secs(1200);
const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(10);

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn string_or(lookup: Lookup, name: &str, default: &str) -> String {
    lookup(name).unwrap_or_else(|| default.to_string())
}

fn parse_or<T: std::str::FromStr>(lookup: Lookup, name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("parsing environment variable {name} [{raw}]")),
        None => Ok(default),
    }
}

fn secs_or(lookup: Lookup, name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(parse_or(
        lookup,
        name,
        default.as_secs(),
    )?))
}

fn flag(lookup: Lookup, name: &str) -> bool {
    matches!(lookup(name).as_deref(), Some("true") | Some("1"))
}

/// Configuration of the long-lived server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ssh_host_ip: String,
    pub ssh_host_port: u16,
    pub health_srv_port: u16,
    pub git_home: PathBuf,
    pub transport_command: String,
    pub controller_host: String,
    pub controller_port: u16,
    pub cleaner_poll_sleep: Duration,
    pub lock_timeout: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: Lookup) -> Result<Self> {
        Ok(Self {
            ssh_host_ip: string_or(lookup, "SSH_HOST_IP", "0.0.0.0"),
            ssh_host_port: parse_or(lookup, "SSH_HOST_PORT", 2223)?,
            health_srv_port: parse_or(lookup, "HEALTH_SERVER_PORT", 8092)?,
            git_home: string_or(lookup, "GIT_HOME", DEFAULT_GIT_HOME).into(),
            transport_command: string_or(
                lookup,
                "SLIPWAY_TRANSPORT_COMMAND",
                DEFAULT_TRANSPORT_COMMAND,
            ),
            controller_host: string_or(
                lookup,
                "SLIPWAY_CONTROLLER_SERVICE_HOST",
                DEFAULT_CONTROLLER_HOST,
            ),
            controller_port: parse_or(lookup, "SLIPWAY_CONTROLLER_SERVICE_PORT", 80)?,
            cleaner_poll_sleep: secs_or(
                lookup,
                "CLEANER_POLL_SLEEP_DURATION_SEC",
                Duration::from_secs(5),
            )?,
            lock_timeout: Duration::from_secs(
                parse_or(lookup, "GIT_LOCK_TIMEOUT", 10u64)? * 60,
            ),
        })
    }
}

/// Configuration of one git-receive hook invocation. Mostly injected by
/// the pre-receive hook script and the pod environment.
#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    pub repository: String,
    pub username: String,
    pub git_home: PathBuf,
    pub ssh_original_command: String,
    pub pod_namespace: String,
    pub registry_location: String,
    pub image_pull_policy: String,
    pub builder_pod_node_selector: String,
    pub debug: bool,
    pub builder_key_path: PathBuf,
    pub stacks_file: PathBuf,
    pub storage_root: PathBuf,
    pub controller_host: String,
    pub controller_port: u16,
    pub job_ttl_seconds: i64,
    session_idle_interval: Duration,
    builder_pod_tick: Duration,
    builder_pod_wait: Duration,
}

impl ReceiveConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: Lookup) -> Result<Self> {
        let mut cfg = Self {
            repository: string_or(lookup, "RECEIVE_REPO", ""),
            username: string_or(lookup, "RECEIVE_USER", ""),
            git_home: string_or(lookup, "GIT_HOME", DEFAULT_GIT_HOME).into(),
            ssh_original_command: string_or(lookup, "SSH_ORIGINAL_COMMAND", ""),
            pod_namespace: string_or(lookup, "POD_NAMESPACE", "default"),
            registry_location: string_or(lookup, "SLIPWAY_REGISTRY_LOCATION", "on-cluster"),
            image_pull_policy: string_or(lookup, "SLIPWAY_IMAGE_PULL_POLICY", "Always"),
            builder_pod_node_selector: string_or(lookup, "SLIPWAY_BUILDER_POD_NODE_SELECTOR", ""),
            debug: flag(lookup, "SLIPWAY_DEBUG"),
            builder_key_path: string_or(lookup, "SLIPWAY_BUILDER_KEY_FILE", DEFAULT_BUILDER_KEY_FILE)
                .into(),
            stacks_file: string_or(lookup, "SLIPWAY_STACKS_FILE", DEFAULT_STACKS_FILE).into(),
            storage_root: string_or(lookup, "SLIPWAY_STORAGE_ROOT", DEFAULT_STORAGE_ROOT).into(),
            controller_host: string_or(
                lookup,
                "SLIPWAY_CONTROLLER_SERVICE_HOST",
                DEFAULT_CONTROLLER_HOST,
            ),
            controller_port: parse_or(lookup, "SLIPWAY_CONTROLLER_SERVICE_PORT", 80)?,
            job_ttl_seconds: parse_or(lookup, "SLIPWAY_JOB_TTL_SECONDS", 21600i64)?,
            session_idle_interval: secs_or(
                lookup,
                "SLIPWAY_SESSION_IDLE_INTERVAL_SEC",
                DEFAULT_IDLE_INTERVAL,
            )?,
            builder_pod_tick: secs_or(lookup, "SLIPWAY_BUILDER_POD_TICK_SEC", DEFAULT_POD_TICK)?,
            builder_pod_wait: secs_or(lookup, "SLIPWAY_BUILDER_POD_WAIT_SEC", DEFAULT_POD_WAIT)?,
        };
        cfg.check_durations();
        Ok(cfg)
    }

    /// Clamp nonsensical durations back to their defaults: the tick must
    /// be nonzero and shorter than the overall wait.
    pub fn check_durations(&mut self) {
        if self.builder_pod_tick.is_zero() {
            self.builder_pod_tick = DEFAULT_POD_TICK;
        }
        if self.builder_pod_wait <= self.builder_pod_tick {
            self.builder_pod_wait = DEFAULT_POD_WAIT;
        }
        if self.session_idle_interval.is_zero() {
            self.session_idle_interval = DEFAULT_IDLE_INTERVAL;
        }
    }

    /// Application name: the repository with its `.git` suffix stripped.
    pub fn app(&self) -> String {
        self.repository
            .strip_suffix(".git")
            .unwrap_or(&self.repository)
            .to_string()
    }

    /// Cadence of pusher-facing progress output.
    pub fn session_idle_interval(&self) -> Duration {
        self.session_idle_interval
    }

    /// Poll interval for the lifecycle waits.
    pub fn builder_pod_tick(&self) -> Duration {
        self.builder_pod_tick
    }

    /// Overall timeout for each lifecycle wait.
    pub fn builder_pod_wait(&self) -> Duration {
        self.builder_pod_wait
    }

    /// Configuration for exercising the pipeline against fakes: short
    /// waits, a receive verb, and paths that tests point somewhere real.
    pub fn for_tests() -> Self {
        Self {
            repository: "demo.git".to_string(),
            username: "admin".to_string(),
            git_home: std::env::temp_dir(),
            ssh_original_command: "git-receive-pack 'demo.git'".to_string(),
            pod_namespace: "default".to_string(),
            registry_location: "on-cluster".to_string(),
            image_pull_policy: "Always".to_string(),
            builder_pod_node_selector: String::new(),
            debug: false,
            builder_key_path: PathBuf::from("/nonexistent/builder-key"),
            stacks_file: PathBuf::from("/nonexistent/stacks.json"),
            storage_root: std::env::temp_dir(),
            controller_host: "127.0.0.1".to_string(),
            controller_port: 8000,
            job_ttl_seconds: 21600,
            session_idle_interval: Duration::from_millis(50),
            builder_pod_tick: Duration::from_millis(10),
            builder_pod_wait: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(map: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn server_config_defaults_apply() {
        let lookup = lookup_from(HashMap::new());
        let cfg = ServerConfig::from_lookup(&lookup).unwrap();
        assert_eq!(cfg.ssh_host_port, 2223);
        assert_eq!(cfg.health_srv_port, 8092);
        assert_eq!(cfg.git_home, PathBuf::from("/workspace"));
        assert_eq!(cfg.lock_timeout, Duration::from_secs(600));
        assert_eq!(cfg.cleaner_poll_sleep, Duration::from_secs(5));
    }

    #[test]
    fn server_config_reads_overrides() {
        let lookup = lookup_from(HashMap::from([
            ("SSH_HOST_PORT", "2323"),
            ("GIT_LOCK_TIMEOUT", "1"),
            ("GIT_HOME", "/srv/git"),
        ]));
        let cfg = ServerConfig::from_lookup(&lookup).unwrap();
        assert_eq!(cfg.ssh_host_port, 2323);
        assert_eq!(cfg.lock_timeout, Duration::from_secs(60));
        assert_eq!(cfg.git_home, PathBuf::from("/srv/git"));
    }

    #[test]
    fn server_config_rejects_unparsable_numbers() {
        let lookup = lookup_from(HashMap::from([("SSH_HOST_PORT", "not-a-port")]));
        assert!(ServerConfig::from_lookup(&lookup).is_err());
    }

    #[test]
    fn receive_config_derives_app_from_repository() {
        let lookup = lookup_from(HashMap::from([("RECEIVE_REPO", "demo.git")]));
        let cfg = ReceiveConfig::from_lookup(&lookup).unwrap();
        assert_eq!(cfg.app(), "demo");

        let lookup = lookup_from(HashMap::from([("RECEIVE_REPO", "demo")]));
        let cfg = ReceiveConfig::from_lookup(&lookup).unwrap();
        assert_eq!(cfg.app(), "demo");
    }

    #[test]
    fn durations_are_clamped_to_sane_values() {
        let lookup = lookup_from(HashMap::from([
            ("SLIPWAY_BUILDER_POD_TICK_SEC", "0"),
            ("SLIPWAY_BUILDER_POD_WAIT_SEC", "0"),
        ]));
        let cfg = ReceiveConfig::from_lookup(&lookup).unwrap();
        assert_eq!(cfg.builder_pod_tick(), Duration::from_secs(1));
        assert_eq!(cfg.builder_pod_wait(), Duration::from_secs(1200));
    }

    #[test]
    fn debug_flag_accepts_true_and_one() {
        for raw in ["true", "1"] {
            let lookup = lookup_from(HashMap::from([("SLIPWAY_DEBUG", raw)]));
            assert!(ReceiveConfig::from_lookup(&lookup).unwrap().debug);
        }
        let lookup = lookup_from(HashMap::from([("SLIPWAY_DEBUG", "false")]));
        assert!(!ReceiveConfig::from_lookup(&lookup).unwrap().debug);
    }
}
