//! Typed error hierarchy for the slipway builder.
//!
//! Four top-level enums cover the four subsystems:
//! - `LockError` — repository lock contention
//! - `BuildError` — build pipeline failures, from sha validation to release
//! - `ClusterError` — cluster orchestrator failures
//! - `ControllerError` / `StorageError` — control-plane and object-store failures

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from the in-memory repository lock.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("repository {repo} is already locked by another push")]
    AlreadyLocked { repo: String },

    #[error("repository {repo} is not locked")]
    NotLocked { repo: String },
}

/// Errors from a single build pipeline run.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("git sha {sha} was invalid")]
    InvalidGitSha { sha: String },

    #[error("couldn't get builder key from {path}: {source}")]
    BuilderKeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("making directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("running {command} ({message})")]
    Archive { command: String, message: String },

    #[error("reading {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed push line [{line}]")]
    PushInput { line: String },

    #[error("no Procfile can be matched in ({dir})")]
    MissingProcfile { dir: PathBuf },

    #[error("Procfile in {dir} is malformed ({message})")]
    MalformedProcfile { dir: PathBuf, message: String },

    #[error("invalid node selector value format: {raw}")]
    InvalidNodeSelector { raw: String },

    #[error("{raw} is an invalid pull policy")]
    InvalidPullPolicy { raw: String },

    #[error("creating builder job ({source})")]
    Submission {
        #[source]
        source: ClusterError,
    },

    #[error("giving up; pod went into failed status: [{reason}]: {message}")]
    StartupFailed { reason: String, message: String },

    #[error("timed out after {waited:?} waiting for the build pod")]
    Timeout { waited: Duration },

    #[error("no pod found for job {job}")]
    PodNotFound { job: String },

    #[error("build pod exited with code {exit_code}, stopping build")]
    BuildFailed { exit_code: i32 },

    #[error("the controller returned an error when publishing the release: {source}")]
    ReleaseFailed {
        #[source]
        source: ControllerError,
    },

    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("object store error: {0}")]
    Storage(#[from] StorageError),

    #[error("reading push input: {0}")]
    PushRead(#[from] std::io::Error),
}

/// Errors from the cluster orchestrator client.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("cluster API error: {0}")]
    Api(String),
}

impl ClusterError {
    /// Whether this error reports that the resource being created already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }
}

/// Errors from the control-plane API client.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller request failed: {0}")]
    Request(String),

    #[error("controller returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// Errors from the object store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("uploading {key}: {message}")]
    Put { key: String, message: String },

    #[error("fetching {key}: {message}")]
    Get { key: String, message: String },

    #[error("no object stored under {key}")]
    NotFound { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_error_carries_repo_name() {
        let err = LockError::AlreadyLocked {
            repo: "demo.git".to_string(),
        };
        assert!(err.to_string().contains("demo.git"));
        assert_ne!(
            err,
            LockError::NotLocked {
                repo: "demo.git".to_string()
            }
        );
    }

    #[test]
    fn invalid_sha_message_matches_push_output() {
        let err = BuildError::InvalidGitSha {
            sha: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "git sha abc123 was invalid");
    }

    #[test]
    fn build_failed_carries_exit_code() {
        let err = BuildError::BuildFailed { exit_code: 2 };
        match err {
            BuildError::BuildFailed { exit_code } => assert_eq!(exit_code, 2),
            _ => panic!("expected BuildFailed variant"),
        }
    }

    #[test]
    fn cluster_error_already_exists_is_detectable() {
        let err = ClusterError::AlreadyExists {
            kind: "secret".to_string(),
            name: "demo-build-env".to_string(),
        };
        assert!(err.is_already_exists());
        let err = ClusterError::Api("quota exceeded".to_string());
        assert!(!err.is_already_exists());
    }

    #[test]
    fn submission_error_chains_cluster_source() {
        let err = BuildError::Submission {
            source: ClusterError::Api("denied".to_string()),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("creating builder job"));
    }

    #[test]
    fn timeout_is_distinct_from_startup_failure() {
        let timeout = BuildError::Timeout {
            waited: Duration::from_secs(1),
        };
        assert!(matches!(timeout, BuildError::Timeout { .. }));
        assert!(!matches!(timeout, BuildError::StartupFailed { .. }));
    }
}
