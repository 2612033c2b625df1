//! The build pipeline: archive, upload, job submission, lifecycle
//! waits, log streaming, and release registration for one push.

use crate::build::job::{BuildJobSpec, build_job_name};
use crate::build::metadata;
use crate::build::registry::registry_details;
use crate::build::stacks::StackTable;
use crate::build::wait::{wait_for_pod_end, wait_for_pod_start};
use crate::build::{job, wait};
use crate::cluster::{
    ClusterClient, LabelSelector, PodWatcher, Secret, SecurityContext, create_or_update_secret,
};
use crate::config::ReceiveConfig;
use crate::controller::{ControllerClient, ReleaseRequest, check_api_compat};
use crate::errors::BuildError;
use crate::git::Sha;
use crate::storage::{ObjectStore, tar_key};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

/// The pipeline's external collaborators, injected once at startup.
pub struct BuildDeps {
    pub store: Arc<dyn ObjectStore>,
    pub cluster: Arc<dyn ClusterClient>,
    pub controller: Arc<dyn ControllerClient>,
    pub stacks: StackTable,
}

/// Run one build for the pushed revision `raw_sha`.
///
/// Stages run strictly in order; no stage starts before the previous
/// one's side effects are acknowledged. Every exit path releases the
/// temporary extraction directory and tears the pod watcher down.
pub async fn build(
    cfg: &ReceiveConfig,
    deps: &BuildDeps,
    raw_sha: &str,
) -> Result<(), BuildError> {
    let sha = Sha::new(raw_sha)?;
    let app = cfg.app();

    let repo_dir = cfg.git_home.join(&cfg.repository);
    let build_dir = repo_dir.join("build");
    std::fs::create_dir_all(&build_dir).map_err(|source| BuildError::CreateDir {
        path: build_dir.clone(),
        source,
    })?;
    let tmp = tempfile::Builder::new()
        .prefix("tmp")
        .tempdir_in(&build_dir)
        .map_err(|source| BuildError::CreateDir {
            path: build_dir.clone(),
            source,
        })?;

    // The builder key authenticates every control-plane call; read it
    // before touching the network.
    let builder_key = read_builder_key(&cfg.builder_key_path)?;

    let app_config = {
        let resp = deps
            .controller
            .get_app_config(&builder_key, &cfg.username, &app)
            .await?;
        check_api_compat(&resp);
        resp.value
    };

    // Archive the pushed tree and keep an extracted copy around for
    // strategy inspection.
    let tgz_name = format!("{app}.tar.gz");
    run_in_repo(
        &repo_dir,
        "git",
        &[
            "archive",
            "--format=tar.gz",
            &format!("--output={tgz_name}"),
            sha.short(),
        ],
    )
    .await?;
    run_in_repo(
        &repo_dir,
        "tar",
        &["-xzf", &tgz_name, "-C", &tmp.path().to_string_lossy()],
    )
    .await?;

    let tgz_path = repo_dir.join(&tgz_name);
    let archive = std::fs::read(&tgz_path).map_err(|source| BuildError::FileRead {
        path: tgz_path,
        source,
    })?;
    let archive_key = tar_key(&app, sha.short());
    tracing::debug!(key = %archive_key, "uploading tar");
    deps.store.put_content(&archive_key, archive).await?;

    let stack = deps.stacks.select(tmp.path(), &app_config).clone();
    tracing::debug!(stack = %stack.name, image = %stack.image, "selected build stack");

    let node_selector = job::parse_node_selector(&cfg.builder_pod_node_selector)?;
    let pull_policy = cfg.image_pull_policy.parse()?;

    let mut image_name = format!("{app}:git-{}", sha.short());
    let mut builder_env = if cfg.registry_location != "on-cluster" {
        registry_details(
            deps.cluster.as_ref(),
            &mut image_name,
            &cfg.registry_location,
            &cfg.pod_namespace,
        )
        .await?
    } else {
        Default::default()
    };
    builder_env.insert("SLIPWAY_STACK".to_string(), stack.name.clone());
    builder_env.insert(
        "SLIPWAY_REGISTRY_LOCATION".to_string(),
        cfg.registry_location.clone(),
    );

    // The app's build environment rides along as a namespace secret so
    // the builder container can mount it.
    let app_env = app_config.global_map();
    create_or_update_secret(
        deps.cluster.as_ref(),
        &cfg.pod_namespace,
        &Secret {
            name: format!("{app}-build-env"),
            data: app_env.clone(),
        },
    )
    .await?;

    let spec = BuildJobSpec {
        debug: cfg.debug,
        name: build_job_name(&app, sha.short()),
        namespace: cfg.pod_namespace.clone(),
        app_env,
        tar_key: archive_key,
        short_sha: sha.short().to_string(),
        image_name: image_name.clone(),
        builder_name: "builder".to_string(),
        builder_image: stack.image.clone(),
        builder_env,
        pull_policy,
        security_context: SecurityContext::privileged(),
        node_selector,
        ttl_seconds_after_finished: cfg.job_ttl_seconds,
    };
    let build_job = spec.into_job();

    println!("Starting build...");
    tracing::debug!(job = %build_job.name, "submitting build job");
    let identity = deps
        .cluster
        .create_job(&build_job)
        .await
        .map_err(|source| BuildError::Submission { source })?;

    let selector = LabelSelector::heritage(&identity.name);
    let watcher = PodWatcher::spawn(
        deps.cluster.clone(),
        identity.namespace.clone(),
        selector.clone(),
    );

    wait_for_pod_start(
        &watcher,
        cfg.session_idle_interval(),
        cfg.builder_pod_tick(),
        cfg.builder_pod_wait(),
    )
    .await?;

    let pods = deps.cluster.list_pods(&identity.namespace, &selector).await?;
    let pod_name = pods
        .first()
        .map(|pod| pod.name.clone())
        .ok_or_else(|| BuildError::PodNotFound {
            job: identity.name.clone(),
        })?;

    // Stream the build log to the pusher while waiting for the pod to
    // end; both sides join before exit codes are inspected. A broken
    // log stream never fails the build on its own.
    let log_copy = stream_build_log(deps.cluster.as_ref(), &identity.namespace, &pod_name);
    let end_wait = wait_for_pod_end(&watcher, cfg.builder_pod_tick(), cfg.builder_pod_wait());
    let (_, ended) = tokio::join!(log_copy, end_wait);
    ended?;

    tracing::debug!(pod = %pod_name, "checking for builder pod exit code");
    let pod = deps.cluster.get_pod(&identity.namespace, &pod_name).await?;
    for status in &pod.status.container_statuses {
        if let Some(terminated) = &status.terminated
            && terminated.exit_code != 0
        {
            return Err(BuildError::BuildFailed {
                exit_code: terminated.exit_code,
            });
        }
    }

    let proc_types = metadata::process_types(tmp.path())?;
    let dockerfile = metadata::dockerfile_contents(tmp.path(), &stack)?;
    println!("Build complete.");

    let ticker = wait::progress("...", cfg.session_idle_interval());
    println!("Launching App...");
    let release = deps
        .controller
        .create_release(
            &builder_key,
            &cfg.username,
            &app,
            &ReleaseRequest {
                image: image_name,
                stack: stack.name.clone(),
                sha: sha.short().to_string(),
                proc_types,
                dockerfile,
            },
        )
        .await;
    ticker.stop().await;

    let release = match release {
        Ok(resp) => {
            check_api_compat(&resp);
            resp.value
        }
        Err(source) => return Err(BuildError::ReleaseFailed { source }),
    };

    println!("Done, {app}:v{release} deployed to the platform.");
    println!("Use 'git push' to deploy again.");

    // Repack the repository now that the push landed; failure here is
    // not the pusher's problem.
    if let Err(err) = run_in_repo(&repo_dir, "git", &["gc"]).await {
        tracing::debug!(%err, "git gc after build");
    }

    Ok(())
}

/// Read the builder key mounted into the pod, once per invocation.
pub fn read_builder_key(path: &Path) -> Result<String, BuildError> {
    let raw = std::fs::read_to_string(path).map_err(|source| BuildError::BuilderKeyRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(raw.trim_end_matches('\n').to_string())
}

async fn stream_build_log(cluster: &dyn ClusterClient, namespace: &str, pod_name: &str) {
    match cluster.stream_logs(namespace, pod_name).await {
        Ok(mut stream) => {
            let mut out = tokio::io::stdout();
            match tokio::io::copy(&mut stream, &mut out).await {
                Ok(size) => tracing::debug!(size, "streamed build logs"),
                Err(err) => tracing::warn!(%err, "build log stream closed early"),
            }
        }
        Err(err) => tracing::warn!(%err, "could not open build log stream"),
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    format!("{program} {}", args.join(" "))
}

/// Run a command inside the repository directory, surfacing stderr in
/// the error on failure.
async fn run_in_repo(repo_dir: &PathBuf, program: &str, args: &[&str]) -> Result<(), BuildError> {
    let rendered = command_line(program, args);
    tracing::debug!(command = %rendered, dir = %repo_dir.display(), "running");
    let output = Command::new(program)
        .args(args)
        .current_dir(repo_dir)
        .output()
        .await
        .map_err(|err| BuildError::Archive {
            command: rendered.clone(),
            message: err.to_string(),
        })?;
    if !output.status.success() {
        return Err(BuildError::Archive {
            command: rendered,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builder_key_is_trimmed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("builder-key");
        std::fs::write(&path, "testbuilderkey\n").unwrap();
        assert_eq!(read_builder_key(&path).unwrap(), "testbuilderkey");
    }

    #[test]
    fn missing_builder_key_is_a_credential_error() {
        let dir = tempdir().unwrap();
        let err = read_builder_key(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, BuildError::BuilderKeyRead { .. }));
    }

    #[tokio::test]
    async fn run_in_repo_reports_the_failing_command() {
        let dir = tempdir().unwrap();
        let err = run_in_repo(&dir.path().to_path_buf(), "git", &["archive", "nothing"])
            .await
            .unwrap_err();
        match err {
            BuildError::Archive { command, .. } => {
                assert!(command.starts_with("git archive"));
            }
            other => panic!("expected Archive error, got {other:?}"),
        }
    }
}
