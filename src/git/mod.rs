//! Git-side entry point for a single SSH push channel.
//!
//! Creates the bare repository on first contact, installs the
//! pre-receive hook, and execs the git transport subprocess with the
//! channel's streams wired through. The hook re-enters this binary as
//! `slipway git-receive`, which is where the build pipeline runs.

mod sha;

pub use sha::Sha;

use crate::lock::RepositoryLock;
use anyhow::{Context, Result, bail};
use git2::Repository;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;

/// Pre-receive hook script. Regenerated on every receive; the git home
/// path is the only parameter.
const PRE_RECEIVE_HOOK_TPL: &str = r#"#!/bin/bash
set -eo pipefail
strip_remote_prefix() {
    stdbuf -i0 -o0 -e0 sed "s/^/"$'\e[1G'"/"
}

GIT_HOME={{git_home}} \
SSH_CONNECTION="$SSH_CONNECTION" \
SSH_ORIGINAL_COMMAND="$SSH_ORIGINAL_COMMAND" \
RECEIVE_REPO="$RECEIVE_REPO" \
RECEIVE_USER="$RECEIVE_USER" \
RECEIVE_FINGERPRINT="$RECEIVE_FINGERPRINT" \
POD_NAMESPACE="$POD_NAMESPACE" \
slipway git-receive | strip_remote_prefix
"#;

const RECEIVE_VERBS: [&str; 3] = ["git-receive-pack", "git-upload-pack", "git-upload-archive"];

/// One push channel, as handed over by the SSH transport.
#[derive(Debug, Clone, Default)]
pub struct ReceiveRequest {
    pub repo: String,
    pub operation: String,
    pub username: String,
    pub fingerprint: String,
    pub conndata: String,
}

/// Split an SSH original command like `git-receive-pack 'demo.git'` into
/// its verb and repository name.
pub fn parse_original_command(raw: &str) -> Result<(String, String)> {
    let mut parts = raw.trim().splitn(2, char::is_whitespace);
    let operation = parts.next().unwrap_or_default().to_string();
    let repo = parts
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches('\'')
        .trim_matches('"')
        .to_string();

    if !RECEIVE_VERBS.contains(&operation.as_str()) {
        bail!("unsupported git operation [{raw}]");
    }
    if repo.is_empty()
        || !repo
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
    {
        bail!("invalid repository name [{raw}]");
    }
    Ok((operation, repo))
}

/// Create a new bare repository if it is not present already.
///
/// Returns whether a repository was created (`true`) or already existed
/// (`false`). A process-wide creation lock prevents two channels racing
/// the same `git init`.
pub fn create_repo(repo_path: &Path) -> Result<bool> {
    static CREATE_LOCK: Mutex<()> = Mutex::new(());
    let _guard = CREATE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    match std::fs::metadata(repo_path) {
        Ok(meta) if meta.is_dir() => {
            tracing::debug!(path = %repo_path.display(), "repository directory already exists");
            Ok(false)
        }
        Ok(_) => bail!(
            "expected directory at {}, found file",
            repo_path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %repo_path.display(), "creating new bare repository");
            std::fs::create_dir_all(repo_path)
                .with_context(|| format!("creating repository directory {}", repo_path.display()))?;
            Repository::init_bare(repo_path)
                .with_context(|| format!("initializing bare repository {}", repo_path.display()))?;
            Ok(true)
        }
        Err(err) => {
            Err(err).with_context(|| format!("inspecting repository path {}", repo_path.display()))
        }
    }
}

/// Render the pre-receive hook under `repo_path/hooks/pre-receive`,
/// overwriting whatever was there.
pub fn write_pre_receive_hook(git_home: &Path, repo_path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let hooks_dir = repo_path.join("hooks");
    std::fs::create_dir_all(&hooks_dir)
        .with_context(|| format!("creating hooks directory {}", hooks_dir.display()))?;
    let hook_path = hooks_dir.join("pre-receive");
    let script = PRE_RECEIVE_HOOK_TPL.replace("{{git_home}}", &git_home.to_string_lossy());
    std::fs::write(&hook_path, script)
        .with_context(|| format!("writing pre-receive hook to {}", hook_path.display()))?;
    std::fs::set_permissions(&hook_path, std::fs::Permissions::from_mode(0o755))
        .context("changing pre-receive hook permissions")?;
    Ok(())
}

/// Receive one git channel: under the repository lock, ensure the bare
/// repository and its hook exist, then exec the git transport with the
/// channel streams piped through. Only a `git-receive-pack` invocation
/// leads to a build; the hook takes care of that inside the subprocess.
pub async fn receive<I, O, E>(
    lock: &RepositoryLock,
    git_home: &Path,
    req: ReceiveRequest,
    stdin: I,
    stdout: O,
    stderr: E,
) -> Result<()>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    tracing::info!(
        repo = %req.repo,
        operation = %req.operation,
        user = %req.username,
        "receiving git repo"
    );
    let repo = req.repo.clone();
    lock.wrap(&repo, || run_transport(git_home, req, stdin, stdout, stderr))
        .await??;
    Ok(())
}

async fn run_transport<I, O, E>(
    git_home: &Path,
    req: ReceiveRequest,
    mut stdin: I,
    mut stdout: O,
    mut stderr: E,
) -> Result<()>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let repo_path = git_home.join(&req.repo);
    create_repo(&repo_path).context("did not create new repo")?;
    write_pre_receive_hook(git_home, &repo_path).context("did not write pre-receive hook")?;

    let shell_command = format!("{} '{}'", req.operation, req.repo);
    tracing::debug!(command = %shell_command, dir = %git_home.display(), "running git-shell");

    let mut child = Command::new("git-shell")
        .arg("-c")
        .arg(&shell_command)
        .current_dir(git_home)
        .env("RECEIVE_USER", &req.username)
        .env("RECEIVE_REPO", &req.repo)
        .env("RECEIVE_FINGERPRINT", &req.fingerprint)
        .env("SSH_ORIGINAL_COMMAND", &shell_command)
        .env("SSH_CONNECTION", &req.conndata)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to start git transport")?;

    let mut child_stdin = child.stdin.take().context("no stdin pipe on git transport")?;
    let mut child_stdout = child
        .stdout
        .take()
        .context("no stdout pipe on git transport")?;
    let child_stderr = child
        .stderr
        .take()
        .context("no stderr pipe on git transport")?;

    let mut errbuf = Vec::new();
    let in_copy = async {
        let res = tokio::io::copy(&mut stdin, &mut child_stdin).await;
        child_stdin.shutdown().await.ok();
        res
    };
    let out_copy = tokio::io::copy(&mut child_stdout, &mut stdout);
    let err_copy = tee(child_stderr, &mut stderr, &mut errbuf);

    let (in_res, out_res, err_res) = tokio::join!(in_copy, out_copy, err_copy);
    in_res.context("failed to write git objects into the transport")?;
    out_res.context("failed to read git transport output")?;
    err_res.context("failed to read git transport errors")?;

    let status = child.wait().await.context("waiting for git transport")?;
    if !status.success() {
        bail!(
            "git transport failed: {} ({})",
            String::from_utf8_lossy(&errbuf).trim(),
            status
        );
    }
    if !errbuf.is_empty() {
        tracing::error!(
            "unreported transport error: {}",
            String::from_utf8_lossy(&errbuf).trim()
        );
        bail!("{}", String::from_utf8_lossy(&errbuf).trim());
    }
    tracing::info!(repo = %req.repo, "deploy complete");
    Ok(())
}

async fn tee<R, W>(mut reader: R, writer: &mut W, sink: &mut Vec<u8>) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.extend_from_slice(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_original_command_accepts_receive_pack() {
        let (op, repo) = parse_original_command("git-receive-pack 'demo.git'").unwrap();
        assert_eq!(op, "git-receive-pack");
        assert_eq!(repo, "demo.git");
    }

    #[test]
    fn parse_original_command_accepts_unquoted_fetch() {
        let (op, repo) = parse_original_command("git-upload-pack demo.git").unwrap();
        assert_eq!(op, "git-upload-pack");
        assert_eq!(repo, "demo.git");
    }

    #[test]
    fn parse_original_command_rejects_unknown_verbs() {
        assert!(parse_original_command("rm -rf /").is_err());
        assert!(parse_original_command("git-receive-pack").is_err());
        assert!(parse_original_command("git-receive-pack '../escape'").is_err());
    }

    #[test]
    fn create_repo_is_idempotent() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("demo.git");
        assert!(create_repo(&repo_path).unwrap());
        assert!(repo_path.join("HEAD").exists());
        assert!(!create_repo(&repo_path).unwrap());
    }

    #[test]
    fn create_repo_rejects_plain_files() {
        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("demo.git");
        std::fs::write(&repo_path, "not a directory").unwrap();
        assert!(create_repo(&repo_path).is_err());
    }

    #[test]
    fn pre_receive_hook_is_rendered_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let repo_path = dir.path().join("demo.git");
        create_repo(&repo_path).unwrap();
        write_pre_receive_hook(dir.path(), &repo_path).unwrap();

        let hook_path = repo_path.join("hooks/pre-receive");
        let script = std::fs::read_to_string(&hook_path).unwrap();
        assert!(script.contains(&format!("GIT_HOME={}", dir.path().display())));
        assert!(script.contains("slipway git-receive"));
        assert!(!script.contains("{{git_home}}"));

        let mode = std::fs::metadata(&hook_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o755, 0o755);
    }
}
