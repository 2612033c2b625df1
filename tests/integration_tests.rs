//! End-to-end pipeline tests: a real repository and archive, fakes for
//! the cluster, controller, and object store.

use slipway::build::{self, BuildDeps, StackTable};
use slipway::cluster::fake::FakeCluster;
use slipway::cluster::PodPhase;
use slipway::config::ReceiveConfig;
use slipway::controller::{AppConfig, ConfigValue, FakeController, GLOBAL_SCOPE};
use slipway::errors::BuildError;
use slipway::storage::InMemoryStore;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    cfg: ReceiveConfig,
    deps: BuildDeps,
    cluster: Arc<FakeCluster>,
    controller: Arc<FakeController>,
    store: Arc<InMemoryStore>,
    sha: String,
    _git_home: TempDir,
}

/// Create a git home holding `demo.git` with one commit (a Procfile),
/// a builder key on disk, and fakes behind every collaborator seam.
fn harness() -> Harness {
    harness_with(FakeController::default())
}

fn harness_with(controller: FakeController) -> Harness {
    let git_home = TempDir::new().unwrap();
    let repo_dir = git_home.path().join("demo.git");
    std::fs::create_dir_all(&repo_dir).unwrap();
    let sha = commit_tree(&repo_dir, &[("Procfile", "web: ./run\n")]);

    let key_path = git_home.path().join("builder-key");
    std::fs::write(&key_path, "testbuilderkey\n").unwrap();

    let mut cfg = ReceiveConfig::for_tests();
    cfg.git_home = git_home.path().to_path_buf();
    cfg.builder_key_path = key_path;

    let cluster = Arc::new(FakeCluster::new());
    let controller = Arc::new(controller);
    let store = Arc::new(InMemoryStore::new());
    let deps = BuildDeps {
        store: store.clone(),
        cluster: cluster.clone(),
        controller: controller.clone(),
        stacks: StackTable::default(),
    };

    Harness {
        cfg,
        deps,
        cluster,
        controller,
        store,
        sha,
        _git_home: git_home,
    }
}

fn commit_tree(repo_dir: &Path, files: &[(&str, &str)]) -> String {
    let repo = git2::Repository::init(repo_dir).unwrap();
    for (name, contents) in files {
        std::fs::write(repo_dir.join(name), contents).unwrap();
    }
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("test", "test@test.com").unwrap();
    let commit = repo
        .commit(Some("HEAD"), &sig, &sig, "push", &tree, &[])
        .unwrap();
    commit.to_string()
}

#[tokio::test]
async fn successful_push_builds_and_releases() {
    let h = harness();
    h.cluster.script_job_pod(
        &[PodPhase::Pending, PodPhase::Running, PodPhase::Succeeded],
        &[0],
    );
    h.cluster.set_log_output(b"fetching buildpack...\n");

    build::build(&h.cfg, &h.deps, &h.sha).await.unwrap();

    let short = &h.sha[..8];

    // The archive landed in the object store under the scoped key.
    let expected_key = format!("home/demo:git-{short}/tar");
    assert!(h.store.keys().contains(&expected_key));

    // One job was submitted, carrying the archive key and source
    // version exactly once each.
    let jobs = h.cluster.created_jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert!(job.name.starts_with(&format!("imagebuild-demo-{short}-")));
    assert!(job.name.len() <= 63);
    assert_eq!(job.env_count("TAR_PATH"), 1);
    assert_eq!(job.env_count("SOURCE_VERSION"), 1);
    assert_eq!(job.env_value("TAR_PATH"), Some(expected_key.as_str()));
    assert_eq!(job.env_value("SOURCE_VERSION"), Some(short));
    assert_eq!(job.env_value("SLIPWAY_STACK"), Some("buildpack"));

    // The app env secret was upserted before submission.
    assert!(h.cluster.secret("demo-build-env").is_some());

    // The release references the built image and parsed process types.
    let releases = h.controller.releases.lock().unwrap();
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].image, format!("demo:git-{short}"));
    assert_eq!(releases[0].stack, "buildpack");
    assert_eq!(releases[0].sha, *short);
    assert_eq!(
        releases[0].proc_types.get("web").map(String::as_str),
        Some("./run")
    );
}

#[tokio::test]
async fn stack_override_changes_builder_image() {
    let mut controller = FakeController::default();
    controller.app_config = AppConfig {
        values: vec![ConfigValue {
            group: GLOBAL_SCOPE.to_string(),
            name: "SLIPWAY_STACK".to_string(),
            value: "container".to_string(),
        }],
    };
    let h = harness_with(controller);
    h.cluster.script_job_pod(
        &[PodPhase::Pending, PodPhase::Running, PodPhase::Succeeded],
        &[0],
    );

    build::build(&h.cfg, &h.deps, &h.sha).await.unwrap();

    let jobs = h.cluster.created_jobs.lock().unwrap();
    assert_eq!(jobs[0].env_value("SLIPWAY_STACK"), Some("container"));
    assert_eq!(jobs[0].container.image, "slipway/imagebuilder:latest");
}

#[tokio::test]
async fn invalid_sha_fails_before_any_network_call() {
    let h = harness();
    let err = build::build(&h.cfg, &h.deps, "abc123").await.unwrap_err();
    assert_eq!(err.to_string(), "git sha abc123 was invalid");
    assert!(h.cluster.recorded_calls().is_empty());
    assert!(h.controller.recorded_calls().is_empty());
    assert!(h.store.keys().is_empty());
}

#[tokio::test]
async fn missing_builder_key_fails_before_job_submission() {
    let mut h = harness();
    h.cfg.builder_key_path = h._git_home.path().join("no-such-key");

    let err = build::build(&h.cfg, &h.deps, &h.sha).await.unwrap_err();
    assert!(matches!(err, BuildError::BuilderKeyRead { .. }));
    assert!(h.cluster.recorded_calls().is_empty());
    assert!(h.controller.recorded_calls().is_empty());
}

#[tokio::test]
async fn pod_failing_before_start_surfaces_its_reason() {
    let h = harness();
    h.cluster
        .script_job_pod(&[PodPhase::Pending, PodPhase::Failed], &[1]);

    let err = build::build(&h.cfg, &h.deps, &h.sha).await.unwrap_err();
    match err {
        BuildError::StartupFailed { reason, .. } => assert_eq!(reason, "Error"),
        other => panic!("expected StartupFailed, got {other:?}"),
    }
    assert!(h.controller.releases.lock().unwrap().is_empty());
}

#[tokio::test]
async fn nonzero_exit_code_fails_the_build_without_a_release() {
    let h = harness();
    h.cluster.script_job_pod(
        &[PodPhase::Pending, PodPhase::Running, PodPhase::Failed],
        &[2],
    );

    let err = build::build(&h.cfg, &h.deps, &h.sha).await.unwrap_err();
    match err {
        BuildError::BuildFailed { exit_code } => assert_eq!(exit_code, 2),
        other => panic!("expected BuildFailed, got {other:?}"),
    }
    assert!(h.controller.releases.lock().unwrap().is_empty());
}

#[tokio::test]
async fn release_failure_is_reported_distinctly() {
    let mut controller = FakeController::default();
    controller.fail_release = Some("controller is down".to_string());
    let h = harness_with(controller);
    h.cluster.script_job_pod(
        &[PodPhase::Pending, PodPhase::Running, PodPhase::Succeeded],
        &[0],
    );

    let err = build::build(&h.cfg, &h.deps, &h.sha).await.unwrap_err();
    assert!(matches!(err, BuildError::ReleaseFailed { .. }));
    // The image was built and uploaded even though no release exists.
    assert!(!h.store.keys().is_empty());
}

#[tokio::test]
async fn api_version_mismatch_does_not_abort_the_release() {
    let mut controller = FakeController::default();
    controller.api_version = "9.9".to_string();
    let h = harness_with(controller);
    h.cluster.script_job_pod(
        &[PodPhase::Pending, PodPhase::Running, PodPhase::Succeeded],
        &[0],
    );

    build::build(&h.cfg, &h.deps, &h.sha).await.unwrap();
    assert_eq!(h.controller.releases.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn submission_rejection_has_no_retry() {
    let h = harness();
    *h.cluster.fail_submission.lock().unwrap() = Some("quota exceeded".to_string());

    let err = build::build(&h.cfg, &h.deps, &h.sha).await.unwrap_err();
    assert!(matches!(err, BuildError::Submission { .. }));
    let submissions = h
        .cluster
        .recorded_calls()
        .iter()
        .filter(|c| *c == "create_job")
        .count();
    assert_eq!(submissions, 1);
}
